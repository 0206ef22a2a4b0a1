mod args;
mod commands;
mod output;

use args::{Cli, Commands, Toggle};
use clap::Parser;
use commands::App;
use peresvet::clienv::Layout;
use peresvet::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let layout = Layout::from_env();
    let _log_guard = logging::init_tracing(&layout.logs_dir(), cli.verbose);

    let app = App::open(layout).await?;

    match cli.command {
        Commands::Start => commands::stack::cmd_start(&app).await?,
        Commands::Stop {
            reap,
            keep_services,
        } => commands::stack::cmd_stop(&app, reap, keep_services).await?,
        Commands::Restart => commands::stack::cmd_restart(&app).await?,
        Commands::Status => commands::stack::cmd_status(&app).await?,
        Commands::Run => commands::stack::cmd_run(&app).await?,
        Commands::Boot => commands::stack::cmd_boot(&app).await?,
        Commands::Reap => commands::stack::cmd_reap(&app).await?,
        Commands::Logs { lines } => commands::stack::cmd_logs(&app, lines)?,
        Commands::Modules => commands::modules::cmd_modules(&app)?,
        Commands::Enable { module } => commands::modules::cmd_enable(&app, module, true)?,
        Commands::Disable { module } => commands::modules::cmd_enable(&app, module, false)?,
        Commands::Use { module, version } => commands::modules::cmd_use(&app, module, &version)?,
        Commands::Autostart { state } => {
            commands::modules::cmd_autostart(&app, matches!(state, Toggle::On))?
        }
        Commands::Render { server } => commands::modules::cmd_render(&app, server.into())?,
        Commands::Service { action, service } => {
            commands::service::cmd_service(&app, action, service.into()).await?
        }
        Commands::Pgadmin => commands::service::cmd_pgadmin(&app).await?,
        Commands::Install {
            module,
            version,
            url,
        } => commands::install::cmd_install(&app, module, &version, url).await?,
        Commands::Catalog => commands::install::cmd_catalog(&app)?,
    }

    Ok(())
}
