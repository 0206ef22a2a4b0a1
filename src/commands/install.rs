use anyhow::anyhow;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use peresvet::catalog::{format_size, Catalog};
use peresvet::installer::{InstallEvent, InstallRequest, InstallWorker};
use peresvet::module::{InstallRef, ModuleKind};
use peresvet::PanelError;

use super::App;
use crate::output::{self, out_info, out_success, out_warn, Columns};

pub(crate) async fn cmd_install(
    app: &App,
    kind: ModuleKind,
    version: &str,
    url: Option<String>,
) -> anyhow::Result<()> {
    let request = match url {
        Some(url) => InstallRequest::new(kind, version, url),
        None => {
            let catalog = Catalog::load(&app.layout)?;
            InstallRequest::from_catalog(&catalog, kind, version)?
        }
    };
    if request.size > 0 {
        out_info!("Downloading {} {} ({})", kind, version, format_size(request.size));
    }

    let installed = match run_worker(app, vec![request]).await {
        Err(e) if matches!(e.downcast_ref::<PanelError>(), Some(PanelError::Cancelled)) => {
            out_warn!("Installation cancelled");
            return Ok(());
        }
        other => other?,
    };

    for install in &installed {
        out_success!("{} {} installed in {}", kind, install.version, install.root.display());
    }

    // first install of a module becomes its selection
    let selected = app.preferences.load()?.module_state(kind).selected_version;
    if selected.is_none() {
        let registry = app.registry()?;
        app.preferences.select_version(kind, version, &registry)?;
        out_info!("Selected {} {}", kind, version);
    }
    Ok(())
}

/// Drive the worker, render its events and cancel it on Ctrl+C.
async fn run_worker(app: &App, requests: Vec<InstallRequest>) -> anyhow::Result<Vec<InstallRef>> {
    let cancel = CancellationToken::new();
    let mut task = InstallWorker::new(app.layout.bin_dir(), cancel.clone()).spawn(requests);
    let pb = create_progress_bar();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            event = task.events.recv() => match event {
                Some(InstallEvent::Status(status)) => pb.set_message(status),
                Some(InstallEvent::Progress(percent)) => pb.set_position(u64::from(percent)),
                Some(InstallEvent::Finished(result)) => break result.map_err(anyhow::Error::from),
                None => break Err(anyhow!("Installer stopped without reporting a result")),
            },
            _ = &mut ctrl_c, if !cancel.is_cancelled() => {
                pb.set_message("Cancelling...");
                cancel.cancel();
            }
        }
    };

    match &result {
        Ok(_) => pb.finish_with_message("Done"),
        Err(e) => pb.abandon_with_message(format!("Failed: {}", e)),
    }
    if let Err(e) = task.handle.await {
        tracing::warn!(error = %e, "Install task did not shut down cleanly");
    }
    result
}

fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .map(|style| style.progress_chars("█▓░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

pub(crate) fn cmd_catalog(app: &App) -> anyhow::Result<()> {
    let catalog = Catalog::load(&app.layout)?;
    let registry = app.registry()?;

    let mut table = Columns::new().header(["Module", "Version", "Size", ""]);
    for kind in catalog.modules() {
        for version in catalog.versions(kind) {
            let size = catalog
                .entry(kind, version)
                .map(|entry| format_size(entry.size))
                .unwrap_or_default();
            let marker = if registry.is_installed(kind, version) {
                output::success("installed").to_string()
            } else {
                String::new()
            };
            table = table.row([kind.to_string(), version.to_string(), size, marker]);
        }
    }
    table.print();
    println!();
    out_info!("Install with {}", output::muted("peresvet install <module> <version>"));
    Ok(())
}
