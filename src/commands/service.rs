use peresvet::adapters::{StartStatus, StopStatus};
use peresvet::module::ModuleKind;
use peresvet::Result;

use super::App;
use crate::args::ServiceAction;
use crate::output::{out_error, out_info, out_success};

pub(crate) async fn cmd_service(
    app: &App,
    action: ServiceAction,
    kind: ModuleKind,
) -> anyhow::Result<()> {
    match action {
        ServiceAction::Start => report_start(kind, app.services.start(kind).await?),
        ServiceAction::Restart => report_start(kind, app.services.restart(kind).await?),
        ServiceAction::Stop => match app.services.stop(kind).await? {
            StopStatus::Stopped => out_success!("{} stopped", kind),
            StopStatus::NotRunning => out_info!("{} is not running", kind),
        },
        ServiceAction::Reap => match app.services.reap(kind).await? {
            0 => out_info!("No orphaned {} processes", kind),
            count => out_success!("Killed {} orphaned {} process(es)", count, kind),
        },
    }
    Ok(())
}

fn report_start(kind: ModuleKind, status: StartStatus) {
    match status {
        StartStatus::Launched(pid) => out_success!("{} started (pid {})", kind, pid),
        StartStatus::AlreadyRunning => out_info!("{} is already running", kind),
    }
}

/// Print what `start_enabled` did, one line per service.
pub(crate) fn print_started(results: &[(ModuleKind, Result<StartStatus>)]) {
    for (kind, result) in results {
        match result {
            Ok(status) => report_start(*kind, *status),
            Err(e) => out_error!("{}: {}", kind, e),
        }
    }
}

/// Print what `stop_running` did, one line per service.
pub(crate) fn print_stopped(results: &[(ModuleKind, Result<StopStatus>)]) {
    for (kind, result) in results {
        match result {
            Ok(StopStatus::Stopped) => out_success!("{} stopped", kind),
            Ok(StopStatus::NotRunning) => {}
            Err(e) => out_error!("{}: {}", kind, e),
        }
    }
}

pub(crate) async fn cmd_pgadmin(app: &App) -> anyhow::Result<()> {
    let pid = app.services.launch_pgadmin().await?;
    out_success!("pgAdmin 4 opened (pid {})", pid);
    Ok(())
}
