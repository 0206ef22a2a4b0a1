use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{AdapterContext, ServiceAdapter, StartStatus, StopStatus, TrackedProcess};
use crate::configurator::{self, RenderPaths, RenderedConfig};
use crate::error::{PanelError, Result};
use crate::module::{InstallRef, ModuleKind, PhpBinding};
use crate::runner::{LaunchSpec, ProcessHandle};
use crate::topology::Topology;

/// Apache httpd, serving directly or as the proxied origin in hybrid mode.
pub struct ApacheServer {
    install: InstallRef,
    php: PhpBinding,
    topology: Topology,
    process: TrackedProcess,
}

impl ApacheServer {
    pub fn new(
        ctx: AdapterContext,
        topology: Topology,
        install: InstallRef,
        php: PhpBinding,
    ) -> Result<Self> {
        if !topology.runs(ModuleKind::Apache) {
            return Err(PanelError::NotInTopology {
                server: ModuleKind::Apache,
                topology,
            });
        }
        Ok(Self {
            install,
            php,
            topology,
            process: TrackedProcess::new(ModuleKind::Apache, ctx),
        })
    }

    pub fn config_path(&self) -> PathBuf {
        configurator::target_path(
            ModuleKind::Apache,
            self.topology,
            &self.process.ctx().layout.userdata_dir(),
        )
    }

    pub fn render(&self) -> Result<RenderedConfig> {
        let paths = RenderPaths {
            php: Some(self.php.clone()),
            apache: Some(self.install.clone()),
            ..RenderPaths::new(&self.process.ctx().layout)?
        };
        configurator::render(ModuleKind::Apache, self.topology, &paths)
    }

    fn launch_spec(&self, config: &Path) -> LaunchSpec {
        let root = &self.install.root;
        let spec = LaunchSpec::new(
            ModuleKind::Apache,
            ModuleKind::Apache.locate_executable(root),
            self.process.log_sink(),
        )
        .arg("-f")
        .arg(config.display().to_string())
        .arg("-d")
        .arg(root.display().to_string())
        .working_dir(root);

        if cfg!(unix) {
            spec.arg("-DFOREGROUND")
        } else {
            spec
        }
    }
}

#[async_trait]
impl ServiceAdapter for ApacheServer {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Apache
    }

    fn version(&self) -> &str {
        &self.install.version
    }

    fn configure(&self) -> Result<Option<PathBuf>> {
        let rendered = self.render()?;
        rendered.write_atomic()?;
        Ok(Some(rendered.target))
    }

    async fn start(&self) -> Result<StartStatus> {
        let config = match self.configure() {
            Ok(path) => path.unwrap_or_else(|| self.config_path()),
            Err(e) => {
                self.process.ctx().events.error(ModuleKind::Apache, e.to_string());
                return Err(e);
            }
        };
        self.process.launch(self.launch_spec(&config)).await
    }

    async fn stop(&self) -> Result<StopStatus> {
        self.process.stop().await
    }

    async fn reap_orphans(&self) -> Result<usize> {
        self.process
            .reap(&[ModuleKind::Apache.executable_name()])
            .await
    }

    fn is_running(&self) -> bool {
        self.process.is_running()
    }

    fn handle(&self) -> Option<ProcessHandle> {
        self.process.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixtures::Fixture;

    fn apache(fx: &Fixture, topology: Topology) -> ApacheServer {
        let php = PhpBinding::new(fx.install(ModuleKind::Php, "8.2.12")).unwrap();
        let install = fx.install(ModuleKind::Apache, "2.4.58");
        ApacheServer::new(fx.ctx(), topology, install, php).unwrap()
    }

    #[tokio::test]
    async fn start_writes_config_then_launches_httpd() {
        let fx = Fixture::new();
        let apache = apache(&fx, Topology::ApacheOnly);

        apache.start().await.unwrap();

        let config = fx.layout.userdata_dir().join("apache.conf");
        let text = std::fs::read_to_string(&config).unwrap();
        assert!(text.contains("/php/8.2.12"));

        let spec = &fx.runner.specs()[0];
        assert_eq!(spec.executable(), "httpd");
        assert_eq!(spec.args[0], "-f");
        assert_eq!(spec.args[1], config.display().to_string());
        assert_eq!(spec.args[2], "-d");
    }

    #[tokio::test]
    async fn hybrid_writes_hybrid_config() {
        let fx = Fixture::new();
        let apache = apache(&fx, Topology::Hybrid);

        assert_eq!(
            apache.configure().unwrap(),
            Some(fx.layout.userdata_dir().join("apache_hybrid.conf"))
        );
    }

    #[test]
    fn nginx_only_topology_is_rejected() {
        let fx = Fixture::new();
        let php = PhpBinding::new(fx.install(ModuleKind::Php, "8.2.12")).unwrap();
        let install = fx.install(ModuleKind::Apache, "2.4.58");
        assert!(matches!(
            ApacheServer::new(fx.ctx(), Topology::NginxOnly, install, php),
            Err(PanelError::NotInTopology { .. })
        ));
    }
}
