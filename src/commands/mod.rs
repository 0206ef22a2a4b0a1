pub(crate) mod install;
pub(crate) mod modules;
pub(crate) mod service;
pub(crate) mod stack;

use std::sync::Arc;

use anyhow::Context;
use peresvet::adapters::AdapterContext;
use peresvet::clienv::Layout;
use peresvet::controller::TopologyController;
use peresvet::logging::EventLog;
use peresvet::preferences::PreferenceStore;
use peresvet::registry::ModuleRegistry;
use peresvet::runner::OsProcessRunner;
use peresvet::services::ServiceManager;
use peresvet::PanelError;

/// Collaborators shared by every command of one invocation.
pub(crate) struct App {
    pub layout: Arc<Layout>,
    pub events: Arc<EventLog>,
    pub preferences: Arc<PreferenceStore>,
    pub controller: TopologyController,
    pub services: ServiceManager,
}

impl App {
    /// Wire up the stores and adopt whatever a previous invocation left running.
    pub async fn open(layout: Layout) -> anyhow::Result<Self> {
        layout.ensure_dirs().with_context(|| {
            format!("Failed to prepare directories under {}", layout.root.display())
        })?;

        let layout = Arc::new(layout);
        let events = Arc::new(EventLog::new(layout.event_log_path()));
        let preferences = Arc::new(PreferenceStore::new(layout.preferences_path()));
        let ctx = AdapterContext::new(
            layout.clone(),
            Arc::new(OsProcessRunner::new()),
            events.clone(),
        );

        let controller = TopologyController::new(ctx.clone(), preferences.clone());
        // another invocation mid-transition; each transition re-adopts the session anyway
        match controller.recover().await {
            Ok(state) => {
                tracing::debug!(root = %layout.root.display(), %state, "Opened installation")
            }
            Err(PanelError::TransitionInProgress) => {
                tracing::warn!("Another invocation is changing the stack")
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            services: ServiceManager::new(ctx, preferences.clone()),
            layout,
            events,
            preferences,
            controller,
        })
    }

    pub fn registry(&self) -> anyhow::Result<ModuleRegistry> {
        ModuleRegistry::scan(&self.layout).context("Failed to scan installed modules")
    }
}
