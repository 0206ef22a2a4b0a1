use clap::{Parser, Subcommand, ValueEnum};

use peresvet::module::ModuleKind;

#[derive(Parser)]
#[command(name = "peresvet")]
#[command(version)]
#[command(about = "Local web development stack: PHP, Apache, Nginx and database servers", long_about = None)]
pub(crate) struct Cli {
    /// Print debug output to the terminal
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start the web stack for the enabled servers
    Start,

    /// Stop the web stack and running database services
    Stop {
        /// Also kill untracked server processes left behind by crashes
        #[arg(long)]
        reap: bool,

        /// Leave MySQL, PostgreSQL and Redis running
        #[arg(long)]
        keep_services: bool,
    },

    /// Stop, then start the web stack
    Restart,

    /// Show the stack state and every component
    Status,

    /// Start the stack and enabled services, supervise them until Ctrl+C
    Run,

    /// Start everything enabled, if autostart is on
    Boot,

    /// Kill orphaned server processes while the stack is stopped
    Reap,

    /// List modules with installed versions and selections
    Modules,

    /// Enable a module
    Enable {
        #[arg(value_parser = parse_module)]
        module: ModuleKind,
    },

    /// Disable a module
    Disable {
        #[arg(value_parser = parse_module)]
        module: ModuleKind,
    },

    /// Select the installed version a module runs
    Use {
        #[arg(value_parser = parse_module)]
        module: ModuleKind,
        version: String,
    },

    /// Turn autostart for `boot` on or off
    Autostart {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Write a web server's config for the current selection and print it
    Render {
        #[arg(value_enum)]
        server: WebServer,
    },

    /// Manage MySQL, PostgreSQL and Redis
    Service {
        #[arg(value_enum)]
        action: ServiceAction,
        #[arg(value_enum)]
        service: BackgroundService,
    },

    /// Open pgAdmin 4 from the PostgreSQL install
    Pgadmin,

    /// Download and unpack a module version
    Install {
        #[arg(value_parser = parse_module)]
        module: ModuleKind,
        version: String,

        /// Archive URL or local path instead of the catalog entry
        #[arg(long)]
        url: Option<String>,
    },

    /// List downloadable versions
    Catalog,

    /// Show recent entries of the event log
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "30")]
        lines: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum Toggle {
    On,
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum WebServer {
    Apache,
    Nginx,
}

impl From<WebServer> for ModuleKind {
    fn from(server: WebServer) -> Self {
        match server {
            WebServer::Apache => ModuleKind::Apache,
            WebServer::Nginx => ModuleKind::Nginx,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reap,
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum BackgroundService {
    Mysql,
    Postgresql,
    Redis,
}

impl From<BackgroundService> for ModuleKind {
    fn from(service: BackgroundService) -> Self {
        match service {
            BackgroundService::Mysql => ModuleKind::Mysql,
            BackgroundService::Postgresql => ModuleKind::Postgresql,
            BackgroundService::Redis => ModuleKind::Redis,
        }
    }
}

fn parse_module(s: &str) -> Result<ModuleKind, String> {
    s.parse::<ModuleKind>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_module_arguments() {
        let cli = Cli::try_parse_from(["peresvet", "use", "php", "8.2.12"]).unwrap();
        match cli.command {
            Commands::Use { module, version } => {
                assert_eq!(module, ModuleKind::Php);
                assert_eq!(version, "8.2.12");
            }
            _ => panic!("expected use"),
        }

        assert!(Cli::try_parse_from(["peresvet", "enable", "tomcat"]).is_err());
        assert!(Cli::try_parse_from(["peresvet", "service", "start", "nginx"]).is_err());
    }

    #[test]
    fn stop_accepts_reap_flag() {
        let cli = Cli::try_parse_from(["peresvet", "-v", "stop", "--reap"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Stop {
                reap: true,
                keep_services: false
            }
        ));

        let cli = Cli::try_parse_from(["peresvet", "stop", "--keep-services"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stop {
                reap: false,
                keep_services: true
            }
        ));
    }

    #[test]
    fn pgadmin_takes_no_arguments() {
        let cli = Cli::try_parse_from(["peresvet", "pgadmin"]).unwrap();
        assert!(matches!(cli.command, Commands::Pgadmin));
        assert!(Cli::try_parse_from(["peresvet", "pgadmin", "postgresql"]).is_err());
    }
}
