//! One adapter per managed server. Each owns at most one tracked process.

mod apache;
mod database;
mod nginx;
mod php;

pub use apache::ApacheServer;
pub use database::{background_adapter, BackgroundServer};
pub use nginx::NginxServer;
pub use php::PhpRuntime;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::clienv::Layout;
use crate::error::Result;
use crate::logging::EventLog;
use crate::module::ModuleKind;
use crate::pidfile::PidRecordStore;
use crate::runner::{LaunchSpec, ProcessHandle, ProcessRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Launched(u32),
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Stopped,
    NotRunning,
}

#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn kind(&self) -> ModuleKind;

    fn version(&self) -> &str;

    /// Regenerate runtime configuration. Returns the written file, if any.
    fn configure(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Launch unless already confirmed running.
    async fn start(&self) -> Result<StartStatus>;

    /// Terminate the tracked process only.
    async fn stop(&self) -> Result<StopStatus>;

    async fn restart(&self) -> Result<StartStatus> {
        if let Err(e) = self.stop().await {
            tracing::warn!(component = %self.kind(), error = %e, "Stop before restart failed");
        }
        self.start().await
    }

    /// Kill every process carrying this adapter's executable name, tracked or not.
    async fn reap_orphans(&self) -> Result<usize>;

    fn is_running(&self) -> bool;

    fn handle(&self) -> Option<ProcessHandle>;
}

/// Shared collaborators handed to every adapter.
#[derive(Clone)]
pub struct AdapterContext {
    pub layout: Arc<Layout>,
    pub runner: Arc<dyn ProcessRunner>,
    pub events: Arc<EventLog>,
    pub records: PidRecordStore,
}

impl AdapterContext {
    pub fn new(layout: Arc<Layout>, runner: Arc<dyn ProcessRunner>, events: Arc<EventLog>) -> Self {
        let records = PidRecordStore::new(layout.pids_dir());
        Self {
            layout,
            runner,
            events,
            records,
        }
    }
}

/// The single process an adapter owns, mirrored to its PID record.
pub(crate) struct TrackedProcess {
    kind: ModuleKind,
    ctx: AdapterContext,
    handle: Mutex<Option<ProcessHandle>>,
}

impl TrackedProcess {
    /// Adopt a live process from a previous session, discarding stale records.
    pub(crate) fn new(kind: ModuleKind, ctx: AdapterContext) -> Self {
        let adopted = match ctx.records.load(kind) {
            Some(handle) if ctx.runner.is_alive(&handle) => {
                tracing::debug!(component = %kind, pid = handle.pid, "Adopted running process");
                Some(handle)
            }
            Some(stale) => {
                tracing::debug!(component = %kind, pid = stale.pid, "Dropping stale PID record");
                if let Err(e) = ctx.records.remove(kind) {
                    tracing::warn!(component = %kind, error = %e, "Failed to remove stale PID record");
                }
                None
            }
            None => None,
        };

        Self {
            kind,
            ctx,
            handle: Mutex::new(adopted),
        }
    }

    pub(crate) fn ctx(&self) -> &AdapterContext {
        &self.ctx
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<ProcessHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn handle(&self) -> Option<ProcessHandle> {
        self.slot().clone()
    }

    /// Whether the tracked process is confirmed alive. A dead one is forgotten.
    pub(crate) fn is_running(&self) -> bool {
        let Some(handle) = self.handle() else {
            return false;
        };
        if self.ctx.runner.is_alive(&handle) {
            return true;
        }
        self.ctx.events.warn(
            self.kind,
            format!("process {} is no longer running", handle.pid),
        );
        self.forget();
        false
    }

    fn forget(&self) {
        *self.slot() = None;
        if let Err(e) = self.ctx.records.remove(self.kind) {
            tracing::warn!(component = %self.kind, error = %e, "Failed to remove PID record");
        }
    }

    pub(crate) async fn launch(&self, spec: LaunchSpec) -> Result<StartStatus> {
        if self.is_running() {
            tracing::info!(component = %self.kind, "Already running");
            return Ok(StartStatus::AlreadyRunning);
        }

        let handle = match self.ctx.runner.spawn(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.ctx.events.error(self.kind, e.to_string());
                return Err(e);
            }
        };

        if let Err(e) = self.ctx.records.save(&handle) {
            tracing::warn!(component = %self.kind, error = %e, "Failed to persist PID record");
        }
        self.ctx
            .events
            .info(self.kind, format!("started (pid {})", handle.pid));

        let pid = handle.pid;
        *self.slot() = Some(handle);
        Ok(StartStatus::Launched(pid))
    }

    pub(crate) async fn stop(&self) -> Result<StopStatus> {
        let Some(handle) = self.handle() else {
            return Ok(StopStatus::NotRunning);
        };

        if let Err(e) = self.ctx.runner.terminate(&handle).await {
            self.ctx.events.error(self.kind, e.to_string());
            return Err(e);
        }

        self.forget();
        self.ctx
            .events
            .info(self.kind, format!("stopped (pid {})", handle.pid));
        Ok(StopStatus::Stopped)
    }

    pub(crate) async fn reap(&self, executables: &[&str]) -> Result<usize> {
        let mut killed = 0;
        for executable in executables {
            killed += self.ctx.runner.kill_by_name(self.kind, executable).await?;
        }
        if self.handle().is_some() {
            self.forget();
        }
        if killed > 0 {
            self.ctx
                .events
                .warn(self.kind, format!("reaped {} orphan process(es)", killed));
        }
        Ok(killed)
    }

    pub(crate) fn log_sink(&self) -> PathBuf {
        self.ctx.layout.component_log_path(self.kind)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::Fixture;
    use super::*;

    async fn record_live_process(fx: &Fixture, kind: ModuleKind) -> ProcessHandle {
        let spec = LaunchSpec::new(kind, kind.executable_name(), fx.layout.component_log_path(kind));
        let handle = fx.runner.spawn(&spec).await.unwrap();
        fx.ctx().records.save(&handle).unwrap();
        handle
    }

    #[tokio::test]
    async fn live_record_is_adopted() {
        let fx = Fixture::new();
        let handle = record_live_process(&fx, ModuleKind::Nginx).await;

        let process = TrackedProcess::new(ModuleKind::Nginx, fx.ctx());
        assert_eq!(process.handle().map(|h| h.pid), Some(handle.pid));
        assert!(process.is_running());
    }

    #[tokio::test]
    async fn stale_record_is_dropped_on_adoption() {
        let fx = Fixture::new();
        let handle = record_live_process(&fx, ModuleKind::Nginx).await;
        fx.runner.crash(handle.pid);

        let process = TrackedProcess::new(ModuleKind::Nginx, fx.ctx());
        assert!(process.handle().is_none());
        assert!(fx.ctx().records.load(ModuleKind::Nginx).is_none());
        assert!(!fx.layout.pids_dir().join("nginx.json").exists());
    }
}
