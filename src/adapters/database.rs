use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{AdapterContext, ServiceAdapter, StartStatus, StopStatus, TrackedProcess};
use crate::error::{PanelError, Result};
use crate::module::{locate_tool, InstallRef, ModuleKind};
use crate::runner::{LaunchSpec, ProcessHandle};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const INITDB_TIMEOUT: Duration = Duration::from_secs(180);

/// MySQL, PostgreSQL or Redis: independent of the web topology, started on demand.
pub struct BackgroundServer {
    kind: ModuleKind,
    install: InstallRef,
    process: TrackedProcess,
}

impl BackgroundServer {
    pub fn new(ctx: AdapterContext, kind: ModuleKind, install: InstallRef) -> Result<Self> {
        if !kind.is_background() {
            return Err(PanelError::UnknownModule(format!(
                "{} is not a background service",
                kind
            )));
        }
        Ok(Self {
            kind,
            install,
            process: TrackedProcess::new(kind, ctx),
        })
    }

    fn root(&self) -> &Path {
        &self.install.root
    }

    fn data_dir(&self) -> PathBuf {
        self.root().join("data")
    }

    fn tool(&self, name: &str) -> PathBuf {
        locate_tool(self.root(), &["bin", ""], name)
    }

    fn spec(&self, program: PathBuf) -> LaunchSpec {
        LaunchSpec::new(self.kind, program, self.process.log_sink()).working_dir(self.root())
    }

    fn launch_spec(&self) -> LaunchSpec {
        let spec = self.spec(self.kind.locate_executable(self.root()));
        match self.kind {
            ModuleKind::Mysql => {
                let defaults = self.root().join("my.ini");
                let spec = if defaults.is_file() {
                    spec.arg(format!("--defaults-file={}", defaults.display()))
                } else {
                    spec
                };
                spec.arg("--console")
            }
            ModuleKind::Postgresql => spec.arg("-D").arg(self.data_dir().display().to_string()),
            _ => match self.redis_config() {
                Some(conf) => spec.arg(conf.display().to_string()),
                None => spec,
            },
        }
    }

    fn redis_config(&self) -> Option<PathBuf> {
        ["redis.conf", "redis.windows.conf"]
            .iter()
            .map(|name| self.root().join(name))
            .find(|path| path.is_file())
    }

    /// Graceful shutdown command of each server.
    fn shutdown_spec(&self) -> LaunchSpec {
        match self.kind {
            ModuleKind::Mysql => self
                .spec(self.tool("mysqladmin"))
                .args(["-u", "root", "shutdown"]),
            ModuleKind::Postgresql => self
                .spec(self.tool("pg_ctl"))
                .arg("stop")
                .arg("-D")
                .arg(self.data_dir().display().to_string())
                .args(["-m", "fast"]),
            _ => self.spec(self.tool("redis-cli")).arg("shutdown"),
        }
    }

    /// `initdb` on the first PostgreSQL start.
    async fn prepare(&self) -> Result<()> {
        if self.kind != ModuleKind::Postgresql || self.data_dir().join("PG_VERSION").is_file() {
            return Ok(());
        }

        let events = &self.process.ctx().events;
        events.info(self.kind, "initializing data directory");
        let spec = self
            .spec(self.tool("initdb"))
            .arg("-D")
            .arg(self.data_dir().display().to_string())
            .args(["-U", "postgres", "-A", "trust", "-E", "UTF8"]);

        let runner = &self.process.ctx().runner;
        if runner.run_to_completion(&spec, INITDB_TIMEOUT).await? {
            Ok(())
        } else {
            let err = PanelError::ProcessLaunchFailure {
                component: self.kind,
                reason: format!("initdb failed, see {}", spec.log_sink.display()),
            };
            events.error(self.kind, err.to_string());
            Err(err)
        }
    }
}

/// Adapter for one of the background services.
pub fn background_adapter(
    ctx: AdapterContext,
    kind: ModuleKind,
    install: InstallRef,
) -> Result<Box<dyn ServiceAdapter>> {
    Ok(Box::new(BackgroundServer::new(ctx, kind, install)?))
}

#[async_trait]
impl ServiceAdapter for BackgroundServer {
    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn version(&self) -> &str {
        &self.install.version
    }

    async fn start(&self) -> Result<StartStatus> {
        if self.process.is_running() {
            return Ok(StartStatus::AlreadyRunning);
        }
        self.prepare().await?;
        self.process.launch(self.launch_spec()).await
    }

    async fn stop(&self) -> Result<StopStatus> {
        if self.process.handle().is_none() {
            return Ok(StopStatus::NotRunning);
        }

        let spec = self.shutdown_spec();
        let runner = &self.process.ctx().runner;
        match runner.run_to_completion(&spec, SHUTDOWN_TIMEOUT).await {
            Ok(true) => tracing::debug!(component = %self.kind, "Graceful shutdown requested"),
            Ok(false) => {
                tracing::warn!(component = %self.kind, "Graceful shutdown failed, terminating")
            }
            Err(e) => {
                tracing::warn!(component = %self.kind, error = %e, "Shutdown tool unavailable, terminating")
            }
        }
        self.process.stop().await
    }

    async fn reap_orphans(&self) -> Result<usize> {
        self.process.reap(&[self.kind.executable_name()]).await
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
    use crate::runner::testing::RunnerCall;

    #[tokio::test]
    async fn postgres_runs_initdb_on_first_start_only() {
        let fx = Fixture::new();
        let install = fx.install(ModuleKind::Postgresql, "16.2");
        let pg = BackgroundServer::new(fx.ctx(), ModuleKind::Postgresql, install.clone()).unwrap();

        pg.start().await.unwrap();
        assert_eq!(
            fx.runner.calls(),
            vec![
                RunnerCall::Run(ModuleKind::Postgresql, "initdb".to_string()),
                RunnerCall::Spawn(ModuleKind::Postgresql),
            ]
        );

        pg.stop().await.unwrap();
        std::fs::create_dir_all(install.root.join("data")).unwrap();
        std::fs::write(install.root.join("data/PG_VERSION"), "16\n").unwrap();
        pg.start().await.unwrap();

        let initdb_runs = fx
            .runner
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RunnerCall::Run(_, name) if name == "initdb"))
            .count();
        assert_eq!(initdb_runs, 1);
    }

    #[tokio::test]
    async fn stop_runs_graceful_command_before_terminate() {
        let fx = Fixture::new();
        let install = fx.install(ModuleKind::Mysql, "8.0.36");
        let mysql = BackgroundServer::new(fx.ctx(), ModuleKind::Mysql, install).unwrap();

        mysql.start().await.unwrap();
        assert_eq!(mysql.stop().await.unwrap(), StopStatus::Stopped);
        assert_eq!(mysql.stop().await.unwrap(), StopStatus::NotRunning);

        assert_eq!(
            fx.runner.calls(),
            vec![
                RunnerCall::Spawn(ModuleKind::Mysql),
                RunnerCall::Run(ModuleKind::Mysql, "mysqladmin".to_string()),
                RunnerCall::Terminate(ModuleKind::Mysql),
            ]
        );
        assert_eq!(
            fx.runner.specs()[1].args,
            vec!["-u".to_string(), "root".to_string(), "shutdown".to_string()]
        );
    }

    #[tokio::test]
    async fn redis_uses_bundled_config_when_present() {
        let fx = Fixture::new();
        let install = fx.install(ModuleKind::Redis, "7.2.4");
        std::fs::write(install.root.join("redis.conf"), "port 6379\n").unwrap();
        let redis = background_adapter(fx.ctx(), ModuleKind::Redis, install.clone()).unwrap();

        redis.start().await.unwrap();
        let spec = &fx.runner.specs()[0];
        assert_eq!(spec.executable(), "redis-server");
        assert_eq!(
            spec.args,
            vec![install.root.join("redis.conf").display().to_string()]
        );
    }

    #[test]
    fn web_modules_are_not_background_services() {
        let fx = Fixture::new();
        let install = fx.install(ModuleKind::Nginx, "1.24.0");
        assert!(BackgroundServer::new(fx.ctx(), ModuleKind::Nginx, install).is_err());
    }
}
