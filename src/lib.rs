pub mod adapters;
pub mod catalog;
pub mod clienv;
pub mod configurator;
pub mod controller;
pub mod error;
pub mod installer;
pub mod logging;
pub mod module;
pub mod pidfile;
pub mod preferences;
pub mod registry;
pub mod runner;
pub mod services;
pub mod session;
pub mod topology;

mod fsutil;

pub use controller::{ControllerState, TopologyController};
pub use error::{PanelError, Result};
pub use topology::{StackPlan, Topology};
