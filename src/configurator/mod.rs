//! Web-server configuration rendering.
//!
//! [`render`] is pure: the same inputs always produce the same text. Writing
//! the result to disk is the separate [`RenderedConfig::write_atomic`] step.

mod apache;
mod nginx;

use std::path::{Path, PathBuf};

use crate::clienv::{Layout, Ports};
use crate::error::{PanelError, Result};
use crate::fsutil;
use crate::module::{InstallRef, ModuleKind, PhpBinding};
use crate::topology::{StackPlan, Topology};

/// Loopback FastCGI address PHP binds to and every web config points at.
pub const PHP_FASTCGI_HOST: &str = "127.0.0.1";
pub const PHP_FASTCGI_PORT: u16 = 9000;

pub const DEFAULT_SITE: &str = "localhost";

pub fn php_fastcgi_address() -> String {
    format!("{}:{}", PHP_FASTCGI_HOST, PHP_FASTCGI_PORT)
}

/// Everything a renderer may embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPaths {
    pub userdata_dir: PathBuf,
    pub sites_dir: PathBuf,
    pub module_logs_dir: PathBuf,
    pub sites: Vec<String>,
    pub php: Option<PhpBinding>,
    pub apache: Option<InstallRef>,
    pub nginx: Option<InstallRef>,
    pub ports: Ports,
}

impl RenderPaths {
    /// Layout paths and the current site list, with no installs selected.
    pub fn new(layout: &Layout) -> Result<Self> {
        Ok(Self {
            userdata_dir: layout.userdata_dir(),
            sites_dir: layout.sites_dir(),
            module_logs_dir: layout.module_logs_dir(),
            sites: layout.site_names()?,
            php: None,
            apache: None,
            nginx: None,
            ports: layout.ports,
        })
    }

    pub fn from_plan(layout: &Layout, plan: &StackPlan) -> Result<Self> {
        Ok(Self {
            php: plan.php.clone(),
            apache: plan.apache.clone(),
            nginx: plan.nginx.clone(),
            ..Self::new(layout)?
        })
    }

    /// Sorted, de-duplicated site names with the default site first.
    pub fn site_list(&self) -> Vec<String> {
        let mut sites: Vec<String> = self
            .sites
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s != DEFAULT_SITE)
            .collect();
        sites.sort();
        sites.dedup();
        sites.insert(0, DEFAULT_SITE.to_string());
        sites
    }

    pub(crate) fn site_root(&self, site: &str) -> String {
        slash_path(&self.sites_dir.join(site))
    }
}

/// Output of one render: the text and where it belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub server: ModuleKind,
    pub topology: Topology,
    pub target: PathBuf,
    pub text: String,
}

impl RenderedConfig {
    pub fn write_atomic(&self) -> Result<()> {
        fsutil::write_atomic(&self.target, self.text.as_bytes()).map_err(|source| {
            PanelError::ConfigWriteFailure {
                path: self.target.clone(),
                source,
            }
        })?;
        tracing::debug!(server = %self.server, path = %self.target.display(), "Wrote config");
        Ok(())
    }
}

/// Config file of `server` under `topology` (`userdata/apache_hybrid.conf`, ...).
pub fn target_path(server: ModuleKind, topology: Topology, userdata_dir: &Path) -> PathBuf {
    let suffix = if topology == Topology::Hybrid {
        "_hybrid"
    } else {
        ""
    };
    userdata_dir.join(format!("{}{}.conf", server.as_str(), suffix))
}

pub fn render(server: ModuleKind, topology: Topology, paths: &RenderPaths) -> Result<RenderedConfig> {
    let is_web = matches!(server, ModuleKind::Apache | ModuleKind::Nginx);
    if !is_web || !topology.runs(server) {
        return Err(PanelError::NotInTopology { server, topology });
    }

    // both servers hand .php requests to the FastCGI runtime
    if paths.php.is_none() {
        return Err(PanelError::MissingDependency {
            module: ModuleKind::Php,
            detail: format!("{} needs a PHP runtime", server),
        });
    }
    let missing_self = || PanelError::MissingDependency {
        module: server,
        detail: "no installed version selected".to_string(),
    };

    let text = match server {
        ModuleKind::Apache => {
            let install = paths.apache.as_ref().ok_or_else(missing_self)?;
            apache::render(topology, install, paths)
        }
        _ => {
            let install = paths.nginx.as_ref().ok_or_else(missing_self)?;
            nginx::render(topology, install, paths)
        }
    };

    Ok(RenderedConfig {
        server,
        topology,
        target: target_path(server, topology, &paths.userdata_dir),
        text,
    })
}

/// Path with forward slashes, the form both servers accept on every platform.
pub(crate) fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Line-oriented text builder with fixed 4-space indentation.
pub(crate) struct ConfigText {
    out: String,
}

impl ConfigText {
    pub(crate) fn new() -> Self {
        Self { out: String::new() }
    }

    pub(crate) fn line(&mut self, indent: usize, text: impl AsRef<str>) -> &mut Self {
        for _ in 0..indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
        self
    }

    pub(crate) fn blank(&mut self) -> &mut Self {
        self.out.push('\n');
        self
    }

    pub(crate) fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn paths(php_version: &str) -> RenderPaths {
        RenderPaths {
            userdata_dir: PathBuf::from("/srv/peresvet/userdata"),
            sites_dir: PathBuf::from("/srv/peresvet/sites"),
            module_logs_dir: PathBuf::from("/srv/peresvet/userdata/modules_logs"),
            sites: vec!["shop.test".into(), "blog.test".into(), "shop.test".into()],
            php: Some(
                PhpBinding::new(InstallRef::new(
                    php_version,
                    format!("/srv/peresvet/bin/php/{}", php_version),
                ))
                .unwrap(),
            ),
            apache: Some(InstallRef::new(
                "2.4.58",
                "/srv/peresvet/bin/apache/2.4.58/Apache24",
            )),
            nginx: Some(InstallRef::new(
                "1.24.0",
                "/srv/peresvet/bin/nginx/1.24.0/nginx-1.24.0",
            )),
            ports: Ports::default(),
        }
    }

    #[test]
    fn target_paths_per_topology() {
        let dir = Path::new("/u");
        assert_eq!(
            target_path(ModuleKind::Apache, Topology::ApacheOnly, dir),
            PathBuf::from("/u/apache.conf")
        );
        assert_eq!(
            target_path(ModuleKind::Apache, Topology::Hybrid, dir),
            PathBuf::from("/u/apache_hybrid.conf")
        );
        assert_eq!(
            target_path(ModuleKind::Nginx, Topology::NginxOnly, dir),
            PathBuf::from("/u/nginx.conf")
        );
        assert_eq!(
            target_path(ModuleKind::Nginx, Topology::Hybrid, dir),
            PathBuf::from("/u/nginx_hybrid.conf")
        );
    }

    #[test]
    fn site_list_puts_localhost_first() {
        let mut p = paths("8.2.12");
        p.sites.push("localhost".into());
        assert_eq!(p.site_list(), vec!["localhost", "blog.test", "shop.test"]);
    }

    #[test]
    fn render_is_deterministic() {
        for (server, topology) in [
            (ModuleKind::Apache, Topology::ApacheOnly),
            (ModuleKind::Apache, Topology::Hybrid),
            (ModuleKind::Nginx, Topology::NginxOnly),
            (ModuleKind::Nginx, Topology::Hybrid),
        ] {
            let a = render(server, topology, &paths("8.2.12")).unwrap();
            let b = render(server, topology, &paths("8.2.12")).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn php_version_swap_changes_only_version_segments() {
        for (server, topology) in [
            (ModuleKind::Apache, Topology::ApacheOnly),
            (ModuleKind::Apache, Topology::Hybrid),
            (ModuleKind::Nginx, Topology::NginxOnly),
        ] {
            let old = render(server, topology, &paths("8.2.12")).unwrap().text;
            let new = render(server, topology, &paths("8.3.4")).unwrap().text;
            assert_eq!(old.replace("8.2.12", "8.3.4"), new);

            // a major-version swap changes nothing but the version either
            let legacy = render(server, topology, &paths("7.4.33")).unwrap().text;
            assert_eq!(legacy.replace("7.4.33", "8.2.12"), old);
        }
    }

    #[test]
    fn render_requires_php() {
        let mut p = paths("8.2.12");
        p.php = None;
        assert!(matches!(
            render(ModuleKind::Nginx, Topology::NginxOnly, &p),
            Err(PanelError::MissingDependency {
                module: ModuleKind::Php,
                ..
            })
        ));
    }

    #[test]
    fn render_requires_own_install() {
        let mut p = paths("8.2.12");
        p.apache = None;
        assert!(matches!(
            render(ModuleKind::Apache, Topology::ApacheOnly, &p),
            Err(PanelError::MissingDependency {
                module: ModuleKind::Apache,
                ..
            })
        ));
    }

    #[test]
    fn render_outside_topology_is_rejected() {
        let p = paths("8.2.12");
        assert!(matches!(
            render(ModuleKind::Nginx, Topology::ApacheOnly, &p),
            Err(PanelError::NotInTopology { .. })
        ));
        assert!(matches!(
            render(ModuleKind::Php, Topology::Hybrid, &p),
            Err(PanelError::NotInTopology { .. })
        ));
    }

    #[test]
    fn every_config_points_at_the_same_fastcgi_upstream() {
        let p = paths("8.2.12");
        let apache = render(ModuleKind::Apache, Topology::ApacheOnly, &p).unwrap();
        let nginx = render(ModuleKind::Nginx, Topology::NginxOnly, &p).unwrap();
        assert!(apache.text.contains(&format!("proxy:fcgi://{}", php_fastcgi_address())));
        assert!(nginx.text.contains(&format!("fastcgi_pass {};", php_fastcgi_address())));
    }

    #[test]
    fn write_atomic_reports_config_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("userdata");
        std::fs::write(&blocker, "a file, not a directory").unwrap();

        let mut p = paths("8.2.12");
        p.userdata_dir = blocker;
        let rendered = render(ModuleKind::Nginx, Topology::NginxOnly, &p).unwrap();

        assert!(matches!(
            rendered.write_atomic(),
            Err(PanelError::ConfigWriteFailure { .. })
        ));
    }
}
