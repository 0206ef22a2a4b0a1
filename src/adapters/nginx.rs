use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{AdapterContext, ServiceAdapter, StartStatus, StopStatus, TrackedProcess};
use crate::configurator::{self, slash_path, RenderPaths, RenderedConfig};
use crate::error::{PanelError, Result};
use crate::module::{InstallRef, ModuleKind, PhpBinding};
use crate::runner::{LaunchSpec, ProcessHandle};
use crate::topology::Topology;

const SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Nginx, serving directly or as the public reverse proxy in hybrid mode.
pub struct NginxServer {
    install: InstallRef,
    php: PhpBinding,
    topology: Topology,
    process: TrackedProcess,
}

impl NginxServer {
    pub fn new(
        ctx: AdapterContext,
        topology: Topology,
        install: InstallRef,
        php: PhpBinding,
    ) -> Result<Self> {
        if !topology.runs(ModuleKind::Nginx) {
            return Err(PanelError::NotInTopology {
                server: ModuleKind::Nginx,
                topology,
            });
        }
        Ok(Self {
            install,
            php,
            topology,
            process: TrackedProcess::new(ModuleKind::Nginx, ctx),
        })
    }

    pub fn config_path(&self) -> PathBuf {
        configurator::target_path(
            ModuleKind::Nginx,
            self.topology,
            &self.process.ctx().layout.userdata_dir(),
        )
    }

    pub fn render(&self) -> Result<RenderedConfig> {
        let paths = RenderPaths {
            php: Some(self.php.clone()),
            nginx: Some(self.install.clone()),
            ..RenderPaths::new(&self.process.ctx().layout)?
        };
        configurator::render(ModuleKind::Nginx, self.topology, &paths)
    }

    /// `-c <conf> -p <root>/`; the prefix must end with a slash.
    fn base_spec(&self, config: &Path) -> LaunchSpec {
        let root = &self.install.root;
        LaunchSpec::new(
            ModuleKind::Nginx,
            ModuleKind::Nginx.locate_executable(root),
            self.process.log_sink(),
        )
        .arg("-c")
        .arg(config.display().to_string())
        .arg("-p")
        .arg(format!("{}/", slash_path(root)))
        .working_dir(root)
    }

    fn launch_spec(&self, config: &Path) -> LaunchSpec {
        let spec = self.base_spec(config);
        if cfg!(unix) {
            spec.arg("-g").arg("daemon off;")
        } else {
            spec
        }
    }
}

#[async_trait]
impl ServiceAdapter for NginxServer {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Nginx
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
                self.process.ctx().events.error(ModuleKind::Nginx, e.to_string());
                return Err(e);
            }
        };
        self.process.launch(self.launch_spec(&config)).await
    }

    async fn stop(&self) -> Result<StopStatus> {
        // Windows has no TERM; ask the master to stop its workers first.
        if cfg!(windows) && self.process.handle().is_some() {
            let spec = self.base_spec(&self.config_path()).arg("-s").arg("stop");
            let runner = &self.process.ctx().runner;
            if let Err(e) = runner.run_to_completion(&spec, SIGNAL_TIMEOUT).await {
                tracing::warn!(component = %ModuleKind::Nginx, error = %e, "nginx -s stop failed");
            }
        }
        self.process.stop().await
    }

    async fn reap_orphans(&self) -> Result<usize> {
        self.process
            .reap(&[ModuleKind::Nginx.executable_name()])
            .await
    }

    fn is_running(&self) -> bool {
        self.process.is_running()
    }

    fn handle(&self) -> Option<ProcessHandle> {
        self.process.handle()
    }
}
