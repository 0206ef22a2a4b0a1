use std::collections::BTreeSet;
use std::time::Duration;

use peresvet::controller::{ControllerState, StartOutcome, StopReport};
use peresvet::module::ModuleKind;

use super::service::{print_started, print_stopped};
use super::App;
use crate::output::{self, out_error, out_info, out_success, out_warn, Columns};

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) async fn cmd_start(app: &App) -> anyhow::Result<()> {
    match app.controller.start().await? {
        StartOutcome::Started(topology) => {
            out_success!("Stack running: {}", output::brand_bold(topology.describe()));
            print_endpoints(app);
        }
        StartOutcome::AlreadyRunning => out_info!("Stack is already running"),
        StartOutcome::Idle => {
            out_warn!("Neither Apache nor Nginx is enabled, nothing to start");
            out_info!("Enable one with {}", output::muted("peresvet enable apache"));
        }
    }
    Ok(())
}

pub(crate) async fn cmd_stop(app: &App, reap: bool, keep_services: bool) -> anyhow::Result<()> {
    let report = app.controller.stop().await?;
    print_stop_report(&report);
    if !keep_services {
        print_stopped(&app.services.stop_running().await);
    }

    if reap {
        cmd_reap(app).await?;
    }
    Ok(())
}

pub(crate) async fn cmd_restart(app: &App) -> anyhow::Result<()> {
    out_info!("Restarting stack...");
    match app.controller.restart().await? {
        StartOutcome::Started(topology) => {
            out_success!("Stack running: {}", output::brand_bold(topology.describe()));
            print_endpoints(app);
        }
        StartOutcome::AlreadyRunning => out_info!("Stack is already running"),
        StartOutcome::Idle => out_warn!("Neither Apache nor Nginx is enabled, stack stays stopped"),
    }
    Ok(())
}

pub(crate) async fn cmd_status(app: &App) -> anyhow::Result<()> {
    let status = app.controller.status().await;

    let state = match status.state {
        ControllerState::Running => output::success(status.state.as_str()).to_string(),
        ControllerState::Failed => output::error(status.state.as_str()).to_string(),
        other => output::muted(other.as_str()).to_string(),
    };
    println!("{} {}", output::brand_bold("Stack:"), state);
    if status.state == ControllerState::Running {
        println!("{} {}", output::brand_bold("Topology:"), status.topology.describe());
    }
    if let Some(error) = &status.last_error {
        println!("{} {}", output::brand_bold("Last error:"), output::error(error));
    }

    if !status.components.is_empty() {
        println!();
        let mut table = Columns::new().header(["Component", "Version", "PID", "State"]);
        for component in &status.components {
            table = table.row([
                component.kind.to_string(),
                component.version.clone(),
                component.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                running_label(component.running),
            ]);
        }
        table.print();
    }

    println!();
    let mut table = Columns::new().header(["Service", "Version", "Enabled", "State"]);
    for service in app.services.list()? {
        table = table.row([
            service.kind.to_string(),
            service.version.unwrap_or_else(|| "latest".to_string()),
            if service.enabled { "yes" } else { "no" }.to_string(),
            match service.pid {
                Some(pid) => format!("{} (pid {})", running_label(true), pid),
                None => running_label(false),
            },
        ]);
    }
    table.print();
    Ok(())
}

/// Start the stack and enabled services, then watch the components until
/// Ctrl+C and stop everything on the way out.
pub(crate) async fn cmd_run(app: &App) -> anyhow::Result<()> {
    let started = app.controller.start().await?;
    let services = app.services.start_enabled().await?;
    print_started(&services);

    match started {
        StartOutcome::Idle if services.is_empty() => {
            out_warn!("Neither Apache nor Nginx is enabled, nothing to supervise");
            return Ok(());
        }
        StartOutcome::Idle => out_info!("No web server enabled, supervising services only"),
        StartOutcome::AlreadyRunning => out_info!("Supervising the running stack"),
        StartOutcome::Started(topology) => {
            out_success!("Stack running: {}", output::brand_bold(topology.describe()));
            print_endpoints(app);
        }
    }
    out_info!("{}", output::muted("Press Ctrl+C to stop"));

    let mut interval = tokio::time::interval(SUPERVISE_INTERVAL);
    let mut reported: BTreeSet<ModuleKind> = BTreeSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
                }
                break;
            }
            _ = interval.tick() => {
                let status = app.controller.status().await;
                for component in status.components.iter().filter(|c| !c.running) {
                    if reported.insert(component.kind) {
                        out_error!("{} exited, see {}", component.kind,
                            app.layout.component_log_path(component.kind).display());
                    }
                }
            }
        }
    }

    println!();
    out_info!("Stopping stack...");
    let report = app.controller.stop().await?;
    print_stop_report(&report);
    print_stopped(&app.services.stop_running().await);
    Ok(())
}

/// Start the stack and enabled services, only when autostart is on.
pub(crate) async fn cmd_boot(app: &App) -> anyhow::Result<()> {
    let preferences = app.preferences.load()?;
    if !preferences.run_startup {
        out_info!(
            "Autostart is off, turn it on with {}",
            output::muted("peresvet autostart on")
        );
        return Ok(());
    }

    let web = app.controller.start().await;
    print_started(&app.services.start_enabled().await?);

    match web? {
        StartOutcome::Started(topology) => {
            out_success!("Stack running: {}", output::brand_bold(topology.describe()));
            print_endpoints(app);
        }
        StartOutcome::AlreadyRunning => out_info!("Stack is already running"),
        StartOutcome::Idle => out_info!("No web server enabled"),
    }
    Ok(())
}

pub(crate) async fn cmd_reap(app: &App) -> anyhow::Result<()> {
    let reaped = app.controller.reap_orphans().await?;
    let total: usize = reaped.iter().map(|(_, n)| n).sum();
    if total == 0 {
        out_info!("No orphaned server processes");
    }
    for (kind, count) in reaped.into_iter().filter(|(_, n)| *n > 0) {
        out_success!("Killed {} orphaned {} process(es)", count, kind);
    }
    Ok(())
}

pub(crate) fn cmd_logs(app: &App, lines: usize) -> anyhow::Result<()> {
    let entries = app.events.tail(lines);
    if entries.is_empty() {
        out_info!("No events recorded in {}", app.events.path().display());
    }
    for line in entries {
        println!("{}", line);
    }
    Ok(())
}

fn print_stop_report(report: &StopReport) {
    if report.stopped.is_empty() && report.is_clean() {
        out_info!("Stack is not running");
        return;
    }
    for kind in &report.stopped {
        out_success!("{} stopped", kind);
    }
    for (kind, reason) in &report.failures {
        out_error!("{}: {}", kind, reason);
    }
    if !report.is_clean() {
        out_warn!(
            "Some processes may still be running, {} kills them by name",
            output::muted("peresvet reap")
        );
    }
}

fn print_endpoints(app: &App) {
    let port = app.layout.ports.public;
    let url = if port == 80 {
        "http://localhost".to_string()
    } else {
        format!("http://localhost:{}", port)
    };
    out_info!("Serving {} from {}", output::brand_bold(url), app.layout.sites_dir().display());
}

fn running_label(running: bool) -> String {
    if running {
        output::success("running").to_string()
    } else {
        output::muted("stopped").to_string()
    }
}
