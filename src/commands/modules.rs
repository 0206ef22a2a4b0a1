use anyhow::Context;
use peresvet::configurator::{self, RenderPaths};
use peresvet::controller::ControllerState;
use peresvet::module::ModuleKind;
use peresvet::topology::StackPlan;

use super::App;
use crate::output::{self, out_info, out_success, out_warn, Columns};

pub(crate) fn cmd_modules(app: &App) -> anyhow::Result<()> {
    let registry = app.registry()?;
    let preferences = app.preferences.load()?;

    let mut table = Columns::new().header(["Module", "Selected", "Enabled", "Installed"]);
    for kind in ModuleKind::ALL {
        let state = preferences.module_state(kind);
        let installed = registry.versions(kind);
        table = table.row([
            kind.to_string(),
            state
                .selected_version
                .unwrap_or_else(|| output::muted("-").to_string()),
            if state.enabled {
                output::success("yes").to_string()
            } else {
                "no".to_string()
            },
            if installed.is_empty() {
                output::muted("none").to_string()
            } else {
                installed.join(", ")
            },
        ]);
    }
    table.print();

    let autostart = if preferences.run_startup { "on" } else { "off" };
    println!();
    out_info!("Autostart: {}", autostart);
    Ok(())
}

pub(crate) fn cmd_enable(app: &App, kind: ModuleKind, enabled: bool) -> anyhow::Result<()> {
    app.preferences.set_enabled(kind, enabled)?;
    if enabled {
        out_success!("{} enabled", kind);
    } else {
        out_success!("{} disabled", kind);
    }
    if kind.requires_runtime() {
        hint_restart(app);
    }
    Ok(())
}

pub(crate) fn cmd_use(app: &App, kind: ModuleKind, version: &str) -> anyhow::Result<()> {
    let registry = app.registry()?;
    app.preferences.select_version(kind, version, &registry)?;
    out_success!("{} now uses {}", kind, output::brand_bold(version));
    if kind.requires_runtime() {
        hint_restart(app);
    }
    Ok(())
}

pub(crate) fn cmd_autostart(app: &App, on: bool) -> anyhow::Result<()> {
    app.preferences.set_run_startup(on)?;
    out_success!("Autostart {}", if on { "on" } else { "off" });
    Ok(())
}

/// Write the server's config for the current selection and echo it.
pub(crate) fn cmd_render(app: &App, server: ModuleKind) -> anyhow::Result<()> {
    let registry = app.registry()?;
    let preferences = app.preferences.load()?;
    let plan = StackPlan::resolve(&preferences, &registry)?;

    let paths = RenderPaths::from_plan(&app.layout, &plan)?;
    let rendered = configurator::render(server, plan.topology, &paths)?;
    rendered
        .write_atomic()
        .with_context(|| format!("Failed to write {}", rendered.target.display()))?;

    println!("{}", rendered.text);
    out_success!(
        "{} config for {} written to {}",
        server,
        plan.topology.describe(),
        rendered.target.display()
    );
    Ok(())
}

fn hint_restart(app: &App) {
    if app.controller.state() == ControllerState::Running {
        out_warn!(
            "The stack is running, apply with {}",
            output::muted("peresvet restart")
        );
    }
}
