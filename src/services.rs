//! MySQL, PostgreSQL and Redis: started and stopped one at a time, outside the web topology.

use std::sync::Arc;

use crate::adapters::{background_adapter, AdapterContext, ServiceAdapter, StartStatus, StopStatus};
use crate::error::{PanelError, Result};
use crate::module::{locate_tool, InstallRef, ModuleKind};
use crate::preferences::PreferenceStore;
use crate::registry::ModuleRegistry;
use crate::runner::LaunchSpec;

/// Where PostgreSQL distributions bundle the pgAdmin 4 desktop app, newest layout first.
const PGADMIN_DIRS: &[&str] = &["pgAdmin 4/runtime", "pgAdmin 4/bin"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub kind: ModuleKind,
    pub version: Option<String>,
    pub enabled: bool,
    pub pid: Option<u32>,
}

pub struct ServiceManager {
    ctx: AdapterContext,
    preferences: Arc<PreferenceStore>,
}

impl ServiceManager {
    pub fn new(ctx: AdapterContext, preferences: Arc<PreferenceStore>) -> Self {
        Self { ctx, preferences }
    }

    fn ensure_background(kind: ModuleKind) -> Result<()> {
        if kind.is_background() {
            Ok(())
        } else {
            Err(PanelError::UnknownModule(format!(
                "{} is managed by the web stack, not as a service",
                kind
            )))
        }
    }

    /// Selected version, else the newest installed one.
    fn install_for(&self, kind: ModuleKind, registry: &ModuleRegistry) -> Result<InstallRef> {
        let state = self.preferences.load()?.module_state(kind);
        let descriptor = registry.descriptor(kind);

        let install = match &state.selected_version {
            Some(version) => descriptor.and_then(|d| d.find(version)).ok_or_else(|| {
                PanelError::VersionNotInstalled {
                    module: kind,
                    version: version.clone(),
                }
            })?,
            None => descriptor
                .and_then(|d| d.latest())
                .ok_or_else(|| PanelError::MissingDependency {
                    module: kind,
                    detail: "no version installed".to_string(),
                })?,
        };
        Ok(install.clone())
    }

    pub fn adapter(&self, kind: ModuleKind) -> Result<Box<dyn ServiceAdapter>> {
        Self::ensure_background(kind)?;
        let registry = ModuleRegistry::scan(&self.ctx.layout)?;
        let install = self.install_for(kind, &registry)?;
        background_adapter(self.ctx.clone(), kind, install)
    }

    pub async fn start(&self, kind: ModuleKind) -> Result<StartStatus> {
        self.adapter(kind)?.start().await
    }

    pub async fn stop(&self, kind: ModuleKind) -> Result<StopStatus> {
        self.adapter(kind)?.stop().await
    }

    pub async fn restart(&self, kind: ModuleKind) -> Result<StartStatus> {
        self.adapter(kind)?.restart().await
    }

    pub async fn reap(&self, kind: ModuleKind) -> Result<usize> {
        self.adapter(kind)?.reap_orphans().await
    }

    /// Start every service flagged active in preferences. Failures are logged, not fatal.
    pub async fn start_enabled(&self) -> Result<Vec<(ModuleKind, Result<StartStatus>)>> {
        let enabled = self.preferences.load()?.enabled_background();

        let mut results = Vec::new();
        for kind in enabled {
            let result = self.start(kind).await;
            if let Err(e) = &result {
                self.ctx.events.error(kind, e.to_string());
            }
            results.push((kind, result));
        }
        Ok(results)
    }

    /// Stop whichever services have a live PID record.
    pub async fn stop_running(&self) -> Vec<(ModuleKind, Result<StopStatus>)> {
        let mut results = Vec::new();
        for kind in ModuleKind::BACKGROUND {
            if self.ctx.records.load(kind).is_none() {
                continue;
            }
            results.push((kind, self.stop(kind).await));
        }
        results
    }

    /// Open pgAdmin 4 from the selected PostgreSQL install. The app is not
    /// tracked; the user closes it.
    pub async fn launch_pgadmin(&self) -> Result<u32> {
        let registry = ModuleRegistry::scan(&self.ctx.layout)?;
        let install = self.install_for(ModuleKind::Postgresql, &registry)?;
        let spec = LaunchSpec::new(
            ModuleKind::Postgresql,
            locate_tool(&install.root, PGADMIN_DIRS, "pgAdmin4"),
            self.ctx.layout.logs_dir().join("pgadmin.log"),
        )
        .working_dir(&install.root);

        let handle = self.ctx.runner.spawn(&spec).await?;
        self.ctx.events.info(
            ModuleKind::Postgresql,
            format!("pgAdmin 4 opened (pid {})", handle.pid),
        );
        Ok(handle.pid)
    }

    pub fn list(&self) -> Result<Vec<ServiceInfo>> {
        let prefs = self.preferences.load()?;
        Ok(ModuleKind::BACKGROUND
            .into_iter()
            .map(|kind| {
                let state = prefs.module_state(kind);
                let pid = self
                    .ctx
                    .records
                    .load(kind)
                    .filter(|h| self.ctx.runner.is_alive(h))
                    .map(|h| h.pid);
                ServiceInfo {
                    kind,
                    version: state.selected_version,
                    enabled: state.enabled,
                    pid,
                }
            })
            .collect())
    }
}
