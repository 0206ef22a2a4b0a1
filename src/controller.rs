//! Web stack supervision: resolves the topology from preferences, starts the
//! adapters in dependency order and tears them down in reverse.

use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::adapters::{
    AdapterContext, ApacheServer, NginxServer, PhpRuntime, ServiceAdapter, StopStatus,
};
use crate::error::{PanelError, Result};
use crate::fsutil::FileLock;
use crate::module::ModuleKind;
use crate::preferences::PreferenceStore;
use crate::registry::ModuleRegistry;
use crate::session::SessionStore;
use crate::topology::{StackPlan, Topology};

const STACK: &str = "stack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Stopped => "stopped",
            ControllerState::Starting => "starting",
            ControllerState::Running => "running",
            ControllerState::Stopping => "stopping",
            ControllerState::Failed => "failed",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ControllerState::Stopped | ControllerState::Failed)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Topology),
    AlreadyRunning,
    /// Neither web server is enabled.
    Idle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: Vec<ModuleKind>,
    pub failures: Vec<(ModuleKind, String)>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub kind: ModuleKind,
    pub version: String,
    pub pid: Option<u32>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub topology: Topology,
    pub components: Vec<ComponentStatus>,
    pub last_error: Option<String>,
}

struct StateCell {
    state: ControllerState,
    last_error: Option<String>,
}

/// What the current or last transition brought up.
struct Stack {
    plan: StackPlan,
    adapters: Vec<Box<dyn ServiceAdapter>>,
}

/// Exclusive access to the stack for one transition: the in-process mutex
/// plus `userdata/stack.lock` for other invocations on the same installation.
struct StackGuard<'a> {
    stack: tokio::sync::MutexGuard<'a, Stack>,
    _file: FileLock,
}

impl Deref for StackGuard<'_> {
    type Target = Stack;

    fn deref(&self) -> &Stack {
        &self.stack
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }
}

pub struct TopologyController {
    ctx: AdapterContext,
    preferences: Arc<PreferenceStore>,
    session: SessionStore,
    cell: Mutex<StateCell>,
    stack: tokio::sync::Mutex<Stack>,
}

impl TopologyController {
    pub fn new(ctx: AdapterContext, preferences: Arc<PreferenceStore>) -> Self {
        let session = SessionStore::new(ctx.layout.session_path());
        Self {
            ctx,
            preferences,
            session,
            cell: Mutex::new(StateCell {
                state: ControllerState::Stopped,
                last_error: None,
            }),
            stack: tokio::sync::Mutex::new(Stack {
                plan: StackPlan::idle(),
                adapters: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.cell().state
    }

    fn cell(&self) -> std::sync::MutexGuard<'_, StateCell> {
        self.cell.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ControllerState) {
        tracing::debug!(%state, "Stack state");
        self.cell().state = state;
    }

    fn fail(&self, err: &PanelError) {
        self.ctx
            .events
            .error(err.component().map_or(STACK.to_string(), |k| k.to_string()), err.to_string());
        let mut cell = self.cell();
        cell.state = ControllerState::Failed;
        cell.last_error = Some(err.to_string());
    }

    /// Take the stack for a transition and adopt whatever another invocation
    /// left running since this controller last looked.
    fn lock_stack(&self) -> Result<StackGuard<'_>> {
        let stack = self
            .stack
            .try_lock()
            .map_err(|_| PanelError::TransitionInProgress)?;
        let Some(file) = FileLock::try_acquire(&self.ctx.layout.stack_lock_path())? else {
            tracing::debug!("Stack lock held by another invocation");
            return Err(PanelError::TransitionInProgress);
        };
        let mut guard = StackGuard { stack, _file: file };
        self.adopt_session(&mut guard)?;
        Ok(guard)
    }

    /// Adapter set of a plan in launch order: PHP, Apache, Nginx.
    fn build_adapters(&self, plan: &StackPlan) -> Result<Vec<Box<dyn ServiceAdapter>>> {
        let Some(php) = plan.php.clone() else {
            return Ok(Vec::new());
        };

        let mut adapters: Vec<Box<dyn ServiceAdapter>> = Vec::new();
        for kind in plan.topology.launch_order() {
            let adapter: Box<dyn ServiceAdapter> = match kind {
                ModuleKind::Php => Box::new(PhpRuntime::new(self.ctx.clone(), php.clone())?),
                ModuleKind::Apache => {
                    let install = plan.apache.clone().ok_or(PanelError::MissingDependency {
                        module: kind,
                        detail: "no installed version selected".to_string(),
                    })?;
                    Box::new(ApacheServer::new(
                        self.ctx.clone(),
                        plan.topology,
                        install,
                        php.clone(),
                    )?)
                }
                _ => {
                    let install = plan.nginx.clone().ok_or(PanelError::MissingDependency {
                        module: kind,
                        detail: "no installed version selected".to_string(),
                    })?;
                    Box::new(NginxServer::new(
                        self.ctx.clone(),
                        plan.topology,
                        install,
                        php.clone(),
                    )?)
                }
            };
            adapters.push(adapter);
        }
        Ok(adapters)
    }

    fn resolve_plan(&self) -> Result<StackPlan> {
        let preferences = self.preferences.load()?;
        let registry = ModuleRegistry::scan(&self.ctx.layout)?;
        StackPlan::resolve(&preferences, &registry)
    }

    pub async fn start(&self) -> Result<StartOutcome> {
        let mut stack = self.lock_stack()?;
        self.start_locked(&mut stack).await
    }

    pub async fn stop(&self) -> Result<StopReport> {
        let mut stack = self.lock_stack()?;
        Ok(self.stop_locked(&mut stack).await)
    }

    /// Stop and start again without letting another transition in between.
    pub async fn restart(&self) -> Result<StartOutcome> {
        let mut stack = self.lock_stack()?;
        let report = self.stop_locked(&mut stack).await;
        for (kind, reason) in &report.failures {
            tracing::warn!(component = %kind, %reason, "Stop failure during restart");
        }
        self.start_locked(&mut stack).await
    }

    async fn start_locked(&self, stack: &mut Stack) -> Result<StartOutcome> {
        let previous = self.state();
        if previous == ControllerState::Running {
            tracing::info!("Stack already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        self.set_state(ControllerState::Starting);

        let prepared = self
            .resolve_plan()
            .and_then(|plan| self.build_adapters(&plan).map(|adapters| (plan, adapters)));
        let (plan, adapters) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.ctx.events.error(
                    e.component().map_or(STACK.to_string(), |k| k.to_string()),
                    e.to_string(),
                );
                let mut cell = self.cell();
                cell.state = previous;
                cell.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        if plan.topology == Topology::None {
            self.set_state(previous);
            self.ctx.events.info(STACK, "no web server enabled, nothing to start");
            return Ok(StartOutcome::Idle);
        }

        self.ctx
            .events
            .info(STACK, format!("starting {} topology", plan.topology));

        let mut started: Vec<&dyn ServiceAdapter> = Vec::new();
        for adapter in &adapters {
            match adapter.start().await {
                Ok(_) => started.push(adapter.as_ref()),
                Err(e) => {
                    for done in started.iter().rev() {
                        if let Err(stop_err) = done.stop().await {
                            tracing::warn!(component = %done.kind(), error = %stop_err, "Rollback stop failed");
                        }
                    }
                    let err = PanelError::StartupFailed {
                        started: started.iter().map(|a| a.kind()).collect(),
                        failed: adapter.kind(),
                        reason: e.to_string(),
                    };
                    self.fail(&err);
                    stack.plan = StackPlan::idle();
                    stack.adapters.clear();
                    if let Err(e) = self.session.clear() {
                        tracing::warn!(error = %e, "Failed to clear session record");
                    }
                    return Err(err);
                }
            }
        }

        if let Err(e) = self.session.save(&plan) {
            tracing::warn!(error = %e, "Failed to save session record");
        }
        self.ctx
            .events
            .info(STACK, format!("running ({})", plan.topology.describe()));

        let topology = plan.topology;
        stack.plan = plan;
        stack.adapters = adapters;
        {
            let mut cell = self.cell();
            cell.state = ControllerState::Running;
            cell.last_error = None;
        }
        Ok(StartOutcome::Started(topology))
    }

    async fn stop_locked(&self, stack: &mut Stack) -> StopReport {
        let mut report = StopReport::default();
        if self.state().is_idle() {
            return report;
        }

        self.set_state(ControllerState::Stopping);
        self.ctx.events.info(STACK, "stopping");

        for adapter in stack.adapters.iter().rev() {
            match adapter.stop().await {
                Ok(StopStatus::Stopped) => report.stopped.push(adapter.kind()),
                Ok(StopStatus::NotRunning) => {}
                Err(e) => report.failures.push((adapter.kind(), e.to_string())),
            }
        }

        stack.adapters.clear();
        stack.plan = StackPlan::idle();
        if let Err(e) = self.session.clear() {
            tracing::warn!(error = %e, "Failed to clear session record");
        }

        self.set_state(ControllerState::Stopped);
        self.ctx.events.info(STACK, "stopped");
        report
    }

    /// Rebuild the running stack of a previous invocation from its session record.
    pub async fn recover(&self) -> Result<ControllerState> {
        let _stack = self.lock_stack()?;
        Ok(self.state())
    }

    fn adopt_session(&self, stack: &mut Stack) -> Result<()> {
        if !self.state().is_idle() {
            return Ok(());
        }

        let Some(session) = self.session.load() else {
            return Ok(());
        };

        let adapters = match self.build_adapters(&session.plan) {
            Ok(adapters) => adapters,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot rebuild previous session");
                self.session.clear()?;
                return Ok(());
            }
        };

        if adapters.iter().any(|a| a.is_running()) {
            tracing::info!(topology = %session.plan.topology, "Recovered running stack");
            stack.plan = session.plan;
            stack.adapters = adapters;
            self.set_state(ControllerState::Running);
        } else {
            tracing::debug!("Previous session is no longer running");
            self.session.clear()?;
        }
        Ok(())
    }

    /// Kill leftover php-cgi, httpd and nginx processes by name.
    pub async fn reap_orphans(&self) -> Result<Vec<(ModuleKind, usize)>> {
        let _stack = self.lock_stack()?;
        let state = self.state();
        if !state.is_idle() {
            return Err(PanelError::InvalidState {
                action: "reap orphans",
                state,
            });
        }

        let mut reaped = Vec::new();
        for kind in [ModuleKind::Php, ModuleKind::Apache, ModuleKind::Nginx] {
            let killed = self
                .ctx
                .runner
                .kill_by_name(kind, kind.executable_name())
                .await?;
            self.ctx.records.remove(kind)?;
            if killed > 0 {
                self.ctx
                    .events
                    .warn(kind, format!("reaped {} orphan process(es)", killed));
            }
            reaped.push((kind, killed));
        }
        self.session.clear()?;
        Ok(reaped)
    }

    pub async fn status(&self) -> ControllerStatus {
        let (state, last_error) = {
            let cell = self.cell();
            (cell.state, cell.last_error.clone())
        };

        let Ok(stack) = self.stack.try_lock() else {
            return ControllerStatus {
                state,
                topology: Topology::None,
                components: Vec::new(),
                last_error,
            };
        };

        let components = stack
            .adapters
            .iter()
            .map(|adapter| {
                let handle = adapter.handle();
                ComponentStatus {
                    kind: adapter.kind(),
                    version: adapter.version().to_string(),
                    pid: handle.map(|h| h.pid),
                    running: adapter.is_running(),
                }
            })
            .collect();

        ControllerStatus {
            state,
            topology: stack.plan.topology,
            components,
            last_error,
        }
    }
}
