use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{PanelError, Result};
use crate::module::ModuleKind;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const GRACE_POLLS: u32 = 20;
const DEFAULT_SETTLE: Duration = Duration::from_millis(300);

/// Everything needed to launch one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub owner: ModuleKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    /// Append-only file receiving stdout and stderr
    pub log_sink: PathBuf,
}

impl LaunchSpec {
    pub fn new(owner: ModuleKind, program: impl Into<PathBuf>, log_sink: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            log_sink: log_sink.into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// File stem of the program, the name the OS reports for the process.
    pub fn executable(&self) -> String {
        executable_stem(&self.program)
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A launched process, owned by the adapter that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub owner: ModuleKind,
    pub pid: u32,
    pub executable: String,
    pub log_sink: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// OS process creation and termination.
///
/// `terminate` only ever touches the given PID; `kill_by_name` is the separate,
/// coarse recovery path for processes nobody tracks any more.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Launch without waiting for exit.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;

    /// Run a helper command to completion; `Ok(true)` when it exits successfully.
    async fn run_to_completion(&self, spec: &LaunchSpec, timeout: Duration) -> Result<bool>;

    /// TERM, grace period, then KILL.
    async fn terminate(&self, handle: &ProcessHandle) -> Result<()>;

    /// Whether the PID is alive and still belongs to the same executable.
    fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// Kill every process named `executable` except ourselves. Returns the number killed.
    async fn kill_by_name(&self, owner: ModuleKind, executable: &str) -> Result<usize>;
}

/// [`ProcessRunner`] backed by real OS processes.
pub struct OsProcessRunner {
    children: Mutex<HashMap<u32, Child>>,
    settle: Duration,
}

impl OsProcessRunner {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            settle: DEFAULT_SETTLE,
        }
    }

    /// How long a fresh process must stay up before the launch counts as successful.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn command(spec: &LaunchSpec) -> Result<Command> {
        if !spec.program.is_file() {
            return Err(PanelError::ProcessLaunchFailure {
                component: spec.owner,
                reason: format!("executable not found: {}", spec.program.display()),
            });
        }

        let log = open_log_sink(&spec.log_sink, &spec.command_line()).map_err(|e| {
            PanelError::ProcessLaunchFailure {
                component: spec.owner,
                reason: format!("cannot open log {}: {}", spec.log_sink.display(), e),
            }
        })?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));

        // Keep servers out of our process group so a Ctrl+C aimed at the
        // supervisor does not reach them before the ordered shutdown.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        Ok(cmd)
    }

    fn system_with(pid: u32) -> System {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
        system
    }

    fn pid_matches(pid: u32, executable: &str) -> bool {
        let system = Self::system_with(pid);
        match system.process(Pid::from_u32(pid)) {
            Some(process) => {
                process.status() != ProcessStatus::Zombie
                    && name_matches(&process.name().to_string_lossy(), executable)
            }
            None => false,
        }
    }

    /// Reap a tracked child if it already exited. Returns true when it is gone.
    fn reap_child(&self, pid: u32) -> Option<bool> {
        let mut children = self.children();
        let child = children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => {
                children.remove(&pid);
                Some(true)
            }
            Ok(None) => Some(false),
        }
    }

    fn is_gone(&self, handle: &ProcessHandle) -> bool {
        match self.reap_child(handle.pid) {
            Some(gone) => gone,
            None => !Self::pid_matches(handle.pid, &handle.executable),
        }
    }

    async fn wait_gone(&self, handle: &ProcessHandle) -> bool {
        for _ in 0..GRACE_POLLS {
            if self.is_gone(handle) {
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        self.is_gone(handle)
    }

    fn signal(pid: u32, signal: Signal) -> bool {
        let system = Self::system_with(pid);
        match system.process(Pid::from_u32(pid)) {
            Some(process) => process
                .kill_with(signal)
                .unwrap_or_else(|| process.kill()),
            None => true,
        }
    }
}

impl Default for OsProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for OsProcessRunner {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let mut cmd = Self::command(spec)?;
        let mut child = cmd.spawn().map_err(|e| PanelError::ProcessLaunchFailure {
            component: spec.owner,
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| PanelError::ProcessLaunchFailure {
            component: spec.owner,
            reason: "process exited before a PID was assigned".to_string(),
        })?;

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
            if let Ok(Some(status)) = child.try_wait() {
                return Err(PanelError::ProcessLaunchFailure {
                    component: spec.owner,
                    reason: format!(
                        "exited immediately ({}), see {}",
                        status,
                        spec.log_sink.display()
                    ),
                });
            }
        }

        info!(component = %spec.owner, pid, "Launched {}", spec.command_line());
        self.children().insert(pid, child);

        Ok(ProcessHandle {
            owner: spec.owner,
            pid,
            executable: spec.executable(),
            log_sink: spec.log_sink.clone(),
            started_at: Utc::now(),
        })
    }

    async fn run_to_completion(&self, spec: &LaunchSpec, timeout: Duration) -> Result<bool> {
        let mut cmd = Self::command(spec)?;
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| PanelError::ProcessLaunchFailure {
            component: spec.owner,
            reason: e.to_string(),
        })?;

        debug!(component = %spec.owner, "Running {}", spec.command_line());
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Ok(status?.success()),
            Err(_) => {
                warn!(component = %spec.owner, "{} timed out", spec.executable());
                let _ = child.kill().await;
                Ok(false)
            }
        }
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
        if self.is_gone(handle) {
            debug!(component = %handle.owner, pid = handle.pid, "Process already gone");
            return Ok(());
        }

        info!(component = %handle.owner, pid = handle.pid, "Stopping process");
        Self::signal(handle.pid, Signal::Term);
        if self.wait_gone(handle).await {
            return Ok(());
        }

        warn!(component = %handle.owner, pid = handle.pid, "Did not stop in time, force killing");
        let tracked = self.children().remove(&handle.pid);
        match tracked {
            Some(mut child) => {
                let _ = child.kill().await;
            }
            None => {
                Self::signal(handle.pid, Signal::Kill);
            }
        }

        if self.wait_gone(handle).await {
            Ok(())
        } else {
            Err(PanelError::ProcessTerminationFailure {
                component: handle.owner,
                reason: format!("process {} did not exit after KILL", handle.pid),
            })
        }
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        !self.is_gone(handle)
    }

    async fn kill_by_name(&self, owner: ModuleKind, executable: &str) -> Result<usize> {
        let own_pid = sysinfo::get_current_pid().ok();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut killed = 0;
        for (pid, process) in system.processes() {
            if Some(*pid) == own_pid || process.status() == ProcessStatus::Zombie {
                continue;
            }
            if !name_matches(&process.name().to_string_lossy(), executable) {
                continue;
            }
            if process.kill() {
                debug!(component = %owner, pid = pid.as_u32(), "Killed orphan");
                killed += 1;
            } else {
                warn!(component = %owner, pid = pid.as_u32(), "Could not kill orphan");
            }
            self.children().remove(&pid.as_u32());
        }

        Ok(killed)
    }
}

fn open_log_sink(path: &Path, command_line: &str) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "--- {} {}",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        command_line
    )?;
    Ok(file)
}

fn executable_stem(program: &Path) -> String {
    program
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Compare an OS-reported process name to an executable stem. Linux truncates
/// `comm` to 15 bytes and Windows reports the `.exe` suffix.
pub fn name_matches(process_name: &str, executable: &str) -> bool {
    let name = process_name
        .strip_suffix(".exe")
        .or_else(|| process_name.strip_suffix(".EXE"))
        .unwrap_or(process_name);
    if name.eq_ignore_ascii_case(executable) {
        return true;
    }
    name.len() == 15 && executable.starts_with(name)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RunnerCall {
        Spawn(ModuleKind),
        Run(ModuleKind, String),
        Terminate(ModuleKind),
        KillByName(String),
    }

    /// In-memory runner recording every call; launches and terminations can be
    /// made to fail per component.
    #[derive(Default)]
    pub struct RecordingRunner {
        calls: Mutex<Vec<RunnerCall>>,
        alive: Mutex<HashSet<u32>>,
        failing: Mutex<HashSet<ModuleKind>>,
        failing_terminate: Mutex<HashSet<ModuleKind>>,
        specs: Mutex<Vec<LaunchSpec>>,
        next_pid: AtomicU32,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self {
                next_pid: AtomicU32::new(4000),
                ..Default::default()
            }
        }

        pub fn fail_on(&self, kind: ModuleKind) {
            self.failing.lock().unwrap().insert(kind);
        }

        /// The process refuses to die; it stays alive.
        pub fn fail_terminate_on(&self, kind: ModuleKind) {
            self.failing_terminate.lock().unwrap().insert(kind);
        }

        pub fn clear_failures(&self) {
            self.failing.lock().unwrap().clear();
            self.failing_terminate.lock().unwrap().clear();
        }

        pub fn calls(&self) -> Vec<RunnerCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn spawned(&self) -> Vec<ModuleKind> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    RunnerCall::Spawn(kind) => Some(kind),
                    _ => None,
                })
                .collect()
        }

        pub fn terminated(&self) -> Vec<ModuleKind> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    RunnerCall::Terminate(kind) => Some(kind),
                    _ => None,
                })
                .collect()
        }

        pub fn specs(&self) -> Vec<LaunchSpec> {
            self.specs.lock().unwrap().clone()
        }

        pub fn alive_count(&self) -> usize {
            self.alive.lock().unwrap().len()
        }

        /// Simulate a process that died behind our back.
        pub fn crash(&self, pid: u32) {
            self.alive.lock().unwrap().remove(&pid);
        }
    }

    #[async_trait]
    impl ProcessRunner for RecordingRunner {
        async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
            self.calls.lock().unwrap().push(RunnerCall::Spawn(spec.owner));
            self.specs.lock().unwrap().push(spec.clone());
            if self.failing.lock().unwrap().contains(&spec.owner) {
                return Err(PanelError::ProcessLaunchFailure {
                    component: spec.owner,
                    reason: "simulated launch failure".to_string(),
                });
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.alive.lock().unwrap().insert(pid);
            Ok(ProcessHandle {
                owner: spec.owner,
                pid,
                executable: spec.executable(),
                log_sink: spec.log_sink.clone(),
                started_at: Utc::now(),
            })
        }

        async fn run_to_completion(&self, spec: &LaunchSpec, _timeout: Duration) -> Result<bool> {
            self.calls
                .lock()
                .unwrap()
                .push(RunnerCall::Run(spec.owner, spec.executable()));
            self.specs.lock().unwrap().push(spec.clone());
            Ok(true)
        }

        async fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(RunnerCall::Terminate(handle.owner));
            if self.failing_terminate.lock().unwrap().contains(&handle.owner) {
                return Err(PanelError::ProcessTerminationFailure {
                    component: handle.owner,
                    reason: format!("process {} did not exit after KILL", handle.pid),
                });
            }
            self.alive.lock().unwrap().remove(&handle.pid);
            Ok(())
        }

        fn is_alive(&self, handle: &ProcessHandle) -> bool {
            self.alive.lock().unwrap().contains(&handle.pid)
        }

        async fn kill_by_name(&self, _owner: ModuleKind, executable: &str) -> Result<usize> {
            self.calls
                .lock()
                .unwrap()
                .push(RunnerCall::KillByName(executable.to_string()));
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matching_handles_platform_quirks() {
        assert!(name_matches("nginx", "nginx"));
        assert!(name_matches("php-cgi.exe", "php-cgi"));
        assert!(name_matches("HTTPD.EXE", "httpd"));
        assert!(!name_matches("nginx-proxy", "nginx"));
        assert!(name_matches("redis-check-aof", "redis-check-aof-long"));
    }

    #[test]
    fn launch_spec_builder() {
        let spec = LaunchSpec::new(ModuleKind::Php, "/opt/php/8.2.12/php-cgi", "/tmp/php.log")
            .args(["-b", "127.0.0.1:9000"])
            .arg("-c")
            .arg("/opt/php/8.2.12/php.ini");
        assert_eq!(spec.executable(), "php-cgi");
        assert_eq!(
            spec.command_line(),
            "/opt/php/8.2.12/php-cgi -b 127.0.0.1:9000 -c /opt/php/8.2.12/php.ini"
        );
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = OsProcessRunner::new();
        let spec = LaunchSpec::new(
            ModuleKind::Nginx,
            dir.path().join("nginx"),
            dir.path().join("nginx.log"),
        );

        let err = runner.spawn(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            PanelError::ProcessLaunchFailure {
                component: ModuleKind::Nginx,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_then_terminate_tracked_process() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/php.log");
        let runner = OsProcessRunner::new().with_settle(Duration::from_millis(100));
        let spec = LaunchSpec::new(ModuleKind::Php, "/bin/sh", &log).args(["-c", "sleep 30"]);

        let handle = runner.spawn(&spec).await.unwrap();
        assert!(runner.is_alive(&handle));
        assert!(log.exists());

        runner.terminate(&handle).await.unwrap();
        assert!(!runner.is_alive(&handle));

        // second terminate is a no-op
        runner.terminate(&handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn immediate_exit_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = OsProcessRunner::new().with_settle(Duration::from_millis(300));
        let spec = LaunchSpec::new(ModuleKind::Apache, "/bin/sh", dir.path().join("apache.log"))
            .args(["-c", "exit 3"]);

        let err = runner.spawn(&spec).await.unwrap_err();
        assert!(err.to_string().contains("exited immediately"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_to_completion_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner = OsProcessRunner::new();
        let log = dir.path().join("redis.log");

        let ok = LaunchSpec::new(ModuleKind::Redis, "/bin/sh", &log).args(["-c", "true"]);
        let bad = LaunchSpec::new(ModuleKind::Redis, "/bin/sh", &log).args(["-c", "exit 1"]);

        assert!(runner.run_to_completion(&ok, Duration::from_secs(5)).await.unwrap());
        assert!(!runner.run_to_completion(&bad, Duration::from_secs(5)).await.unwrap());
    }
}
