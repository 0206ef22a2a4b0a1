use super::{php_fastcgi_address, slash_path, ConfigText, RenderPaths};
use crate::module::InstallRef;
use crate::topology::Topology;

pub(super) fn render(topology: Topology, install: &InstallRef, paths: &RenderPaths) -> String {
    let nginx_root = slash_path(&install.root);
    let logs = slash_path(&paths.module_logs_dir);

    let mut conf = ConfigText::new();
    conf.line(0, format!("# nginx {} ({})", install.version, topology))
        .line(0, "worker_processes  1;")
        .line(0, format!("pid \"{}/nginx.pid\";", logs))
        .line(0, format!("error_log \"{}/nginx_error.log\";", logs))
        .blank()
        .line(0, "events {")
        .line(1, "worker_connections  1024;")
        .line(0, "}")
        .blank()
        .line(0, "http {")
        .line(1, format!("include \"{}/conf/mime.types\";", nginx_root))
        .line(1, "default_type  application/octet-stream;")
        .line(1, "sendfile  on;")
        .line(1, "keepalive_timeout  65;")
        .line(1, format!("access_log \"{}/nginx_access.log\";", logs));

    for (index, site) in paths.site_list().iter().enumerate() {
        let listen = if index == 0 {
            format!("listen {} default_server;", paths.ports.public)
        } else {
            format!("listen {};", paths.ports.public)
        };

        conf.blank()
            .line(1, "server {")
            .line(2, listen)
            .line(2, format!("server_name {};", site));

        if topology == Topology::Hybrid {
            proxy_locations(&mut conf, paths.ports.internal);
        } else {
            fastcgi_locations(&mut conf, &nginx_root, &paths.site_root(site));
        }

        conf.line(1, "}");
    }

    conf.line(0, "}");
    conf.finish()
}

/// Static files served directly, `.php` handed to the FastCGI runtime.
fn fastcgi_locations(conf: &mut ConfigText, nginx_root: &str, site_root: &str) {
    conf.line(2, format!("root \"{}\";", site_root))
        .line(2, "index index.php index.html;")
        .blank()
        .line(2, "location / {")
        .line(3, "try_files $uri $uri/ =404;")
        .line(2, "}")
        .blank()
        .line(2, "location ~ \\.php$ {")
        .line(3, format!("include \"{}/conf/fastcgi_params\";", nginx_root))
        .line(3, format!("fastcgi_pass {};", php_fastcgi_address()))
        .line(3, "fastcgi_index index.php;")
        .line(
            3,
            "fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;",
        )
        .line(2, "}");
}

/// Everything forwarded to Apache on the internal loopback port.
fn proxy_locations(conf: &mut ConfigText, internal_port: u16) {
    conf.blank()
        .line(2, "location / {")
        .line(3, format!("proxy_pass http://127.0.0.1:{};", internal_port))
        .line(3, "proxy_set_header Host $host;")
        .line(3, "proxy_set_header X-Real-IP $remote_addr;")
        .line(
            3,
            "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;",
        )
        .line(2, "}");
}

#[cfg(test)]
mod tests {
    use crate::clienv::Ports;
    use crate::configurator::tests::paths;
    use crate::configurator::{php_fastcgi_address, render};
    use crate::module::ModuleKind;
    use crate::topology::Topology;

    #[test]
    fn nginx_only_talks_fastcgi_on_public_port() {
        let text = render(ModuleKind::Nginx, Topology::NginxOnly, &paths("8.2.12"))
            .unwrap()
            .text;

        assert!(text.contains("listen 80 default_server;"));
        assert!(text.contains(&format!("fastcgi_pass {};", php_fastcgi_address())));
        assert!(text.contains(
            "include \"/srv/peresvet/bin/nginx/1.24.0/nginx-1.24.0/conf/fastcgi_params\";"
        ));
        assert!(text.contains("root \"/srv/peresvet/sites/blog.test\";"));
        assert!(!text.contains("proxy_pass"));
    }

    #[test]
    fn hybrid_nginx_proxies_every_site_to_internal_port() {
        let text = render(ModuleKind::Nginx, Topology::Hybrid, &paths("8.2.12"))
            .unwrap()
            .text;

        assert_eq!(text.matches("server {").count(), 3);
        assert_eq!(
            text.matches("proxy_pass http://127.0.0.1:8080;").count(),
            3
        );
        assert!(!text.contains("fastcgi_pass"));
        assert_eq!(text.matches("default_server").count(), 1);
    }

    #[test]
    fn ports_come_from_the_path_bundle() {
        let mut p = paths("8.2.12");
        p.ports = Ports {
            public: 8000,
            internal: 8081,
        };
        let text = render(ModuleKind::Nginx, Topology::Hybrid, &p).unwrap().text;
        assert!(text.contains("listen 8000 default_server;"));
        assert!(text.contains("proxy_pass http://127.0.0.1:8081;"));
    }

    #[test]
    fn braces_are_balanced() {
        for topology in [Topology::NginxOnly, Topology::Hybrid] {
            let text = render(ModuleKind::Nginx, topology, &paths("8.2.12"))
                .unwrap()
                .text;
            assert_eq!(text.matches('{').count(), text.matches('}').count());
        }
    }
}
