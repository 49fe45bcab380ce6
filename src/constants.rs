//! Constants used throughout the codebase.
//!
//! Centralizing defaults keeps the config layer and the runtime in agreement.

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "prober.toml";

/// Environment variable holding the tracing filter for the binary.
pub const LOG_ENV_VAR: &str = "IDE_PROBER_LOG";

/// Default bound for `waitForReady` (seconds).
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;

/// Default bound for every other backend request (seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default bound for launching a backend and executing a fixture (seconds).
/// Releasing the backend afterwards is bounded separately.
pub const DEFAULT_FIXTURE_TIMEOUT_SECS: u64 = 300;

/// Time granted to a backend between `shutdown` and a forced kill (seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Observed items kept in a failure report before truncation.
pub const DEFAULT_MAX_REPORTED_ITEMS: usize = 20;

/// Default language server.
pub const DEFAULT_BACKEND_COMMAND: &str = "clangd";

/// Files whose presence marks the project root of a fixture.
pub const DEFAULT_ROOT_MARKERS: &[&str] = &["compile_commands.json", ".git"];
