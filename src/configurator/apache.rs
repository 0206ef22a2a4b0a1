use super::{php_fastcgi_address, slash_path, ConfigText, RenderPaths};
use crate::module::InstallRef;
use crate::topology::Topology;

const BASE_MODULES: &[(&str, &str)] = &[
    ("authz_core_module", "mod_authz_core.so"),
    ("authz_host_module", "mod_authz_host.so"),
    ("mime_module", "mod_mime.so"),
    ("dir_module", "mod_dir.so"),
    ("log_config_module", "mod_log_config.so"),
    ("rewrite_module", "mod_rewrite.so"),
    ("proxy_module", "mod_proxy.so"),
    ("proxy_fcgi_module", "mod_proxy_fcgi.so"),
];

/// Statically linked on Windows builds, shared objects elsewhere.
const UNIX_MODULES: &[(&str, &str)] = &[
    ("mpm_event_module", "mod_mpm_event.so"),
    ("unixd_module", "mod_unixd.so"),
];

pub(super) fn render(topology: Topology, install: &InstallRef, paths: &RenderPaths) -> String {
    let server_root = slash_path(&install.root);
    let logs = slash_path(&paths.module_logs_dir);
    let sites = slash_path(&paths.sites_dir);

    let (listen, vhost_port) = if topology == Topology::Hybrid {
        (
            format!("127.0.0.1:{}", paths.ports.internal),
            paths.ports.internal,
        )
    } else {
        (paths.ports.public.to_string(), paths.ports.public)
    };

    let mut conf = ConfigText::new();
    conf.line(0, format!("# apache {} ({})", install.version, topology))
        .line(0, format!("ServerRoot \"{}\"", server_root))
        .line(0, format!("Listen {}", listen))
        .line(0, "ServerName localhost")
        .line(0, format!("PidFile \"{}/httpd.pid\"", logs))
        .blank();

    let platform: &[(&str, &str)] = if cfg!(unix) { UNIX_MODULES } else { &[] };
    for (name, file) in BASE_MODULES.iter().chain(platform) {
        conf.line(
            0,
            format!("LoadModule {} \"{}/modules/{}\"", name, server_root, file),
        );
    }

    conf.blank()
        .line(0, format!("TypesConfig \"{}/conf/mime.types\"", server_root))
        .line(0, "DirectoryIndex index.php index.html")
        .line(0, format!("ErrorLog \"{}/apache_error.log\"", logs))
        .line(0, "LogLevel warn")
        .line(0, "LogFormat \"%h %l %u %t \\\"%r\\\" %>s %b\" common")
        .line(0, format!("CustomLog \"{}/apache_access.log\" common", logs))
        .blank()
        .line(0, "<FilesMatch \"\\.php$\">")
        .line(1, format!("SetHandler \"proxy:fcgi://{}\"", php_fastcgi_address()))
        .line(0, "</FilesMatch>")
        .blank()
        .line(0, format!("<Directory \"{}\">", sites))
        .line(1, "Options Indexes FollowSymLinks")
        .line(1, "AllowOverride All")
        .line(1, "Require all granted")
        .line(0, "</Directory>");

    for site in paths.site_list() {
        conf.blank()
            .line(0, format!("<VirtualHost *:{}>", vhost_port))
            .line(1, format!("ServerName {}", site))
            .line(1, format!("DocumentRoot \"{}\"", paths.site_root(&site)))
            .line(0, "</VirtualHost>");
    }

    conf.finish()
}
