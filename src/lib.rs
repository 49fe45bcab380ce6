pub mod assertion;
pub mod cancellation;
pub mod config;
pub mod constants;
pub mod error;
pub mod languages;
pub mod report;
pub mod runner;
pub mod script;
pub mod session;
pub mod types;

pub use config::{ConfigManager, ProberConfig};
pub use error::ProbeError;
pub use report::{Outcome, RunReport};
pub use runner::{Launcher, ProcessLauncher, Runner};
pub use script::ProbeScript;
