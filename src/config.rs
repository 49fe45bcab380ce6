use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_BACKEND_COMMAND, DEFAULT_FIXTURE_TIMEOUT_SECS,
    DEFAULT_MAX_REPORTED_ITEMS, DEFAULT_READY_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_ROOT_MARKERS, DEFAULT_SHUTDOWN_TIMEOUT_SECS,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProberConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_root_markers")]
    pub root_markers: Vec<String>,
    /// Overrides the language id derived from the fixture extension.
    #[serde(default)]
    pub language_id: Option<String>,
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_ready_secs")]
    pub ready_secs: u64,
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    /// Zero disables the per-fixture bound.
    #[serde(default = "default_fixture_secs")]
    pub fixture_secs: u64,
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Zero means one job per CPU.
    #[serde(default)]
    pub jobs: usize,
    #[serde(default = "default_max_items")]
    pub max_reported_items: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadinessConfig {
    #[serde(default = "true_bool")]
    pub require_diagnostics: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            root_markers: default_root_markers(),
            language_id: None,
            initialization_options: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ready_secs: DEFAULT_READY_TIMEOUT_SECS,
            request_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            fixture_secs: DEFAULT_FIXTURE_TIMEOUT_SECS,
            shutdown_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs: 0,
            max_reported_items: DEFAULT_MAX_REPORTED_ITEMS,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            require_diagnostics: true,
        }
    }
}

impl TimeoutConfig {
    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn fixture(&self) -> Option<Duration> {
        (self.fixture_secs > 0).then(|| Duration::from_secs(self.fixture_secs))
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

impl RunConfig {
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.jobs
        }
    }
}

/// Builds a [`ProberConfig`] from defaults, an optional TOML file and
/// command-line overrides, in that order of precedence.
pub struct ConfigManager {
    overrides: Option<serde_json::Value>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self { overrides: None }
    }

    /// Overrides applied after the TOML file, shaped like the config itself.
    pub fn set_overrides(&mut self, overrides: serde_json::Value) {
        self.overrides = Some(overrides);
    }

    /// Loads `prober.toml` from `dir` when present.
    pub fn load_from_dir(&self, dir: &Path) -> Result<ProberConfig, String> {
        let path = dir.join(CONFIG_FILE_NAME);
        self.load(path.exists().then_some(path.as_path()))
    }

    /// Loads an explicit config file, which must exist.
    pub fn load_from_file(&self, path: &Path) -> Result<ProberConfig, String> {
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        self.load(Some(path))
    }

    fn load(&self, path: Option<&Path>) -> Result<ProberConfig, String> {
        let mut config_json = serde_json::to_value(ProberConfig::default())
            .map_err(|e| format!("Failed to serialize defaults: {}", e))?;

        if let Some(path) = path {
            let toml_content = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config: {}", e))?;
            let toml_value: toml::Value = toml::from_str(&toml_content)
                .map_err(|e| format!("Failed to parse config: {}", e))?;
            merge_json(&mut config_json, &toml_to_json(&toml_value));
            tracing::debug!(path = %path.display(), "Loaded config file");
        }

        if let Some(overrides) = &self.overrides {
            merge_json(&mut config_json, overrides);
        }

        serde_json::from_value(config_json)
            .map_err(|e| format!("Failed to deserialize merged config: {}", e))
    }
}

/// Nearest ancestor of `fixture` containing one of `markers`, else the
/// fixture's own directory.
pub fn find_project_root(fixture: &Path, markers: &[String]) -> PathBuf {
    let start = fixture.parent().unwrap_or(fixture);
    start
        .ancestors()
        .find(|dir| markers.iter().any(|m| dir.join(m).exists()))
        .unwrap_or(start)
        .to_path_buf()
}

fn toml_to_json(toml: &toml::Value) -> serde_json::Value {
    match toml {
        toml::Value::String(s) => serde_json::Value::String(s.clone()),
        toml::Value::Integer(i) => serde_json::Value::Number((*i).into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        toml::Value::Boolean(b) => serde_json::Value::Bool(*b),
        toml::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            let map: serde_json::Map<String, serde_json::Value> = table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
    }
}

fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                if overlay_val.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_val) => merge_json(base_val, overlay_val),
                    None => {
                        base_map.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay.clone();
            }
        }
    }
}

fn default_command() -> String {
    DEFAULT_BACKEND_COMMAND.to_string()
}

fn default_root_markers() -> Vec<String> {
    DEFAULT_ROOT_MARKERS.iter().map(|m| m.to_string()).collect()
}

fn default_ready_secs() -> u64 {
    DEFAULT_READY_TIMEOUT_SECS
}

fn default_request_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_fixture_secs() -> u64 {
    DEFAULT_FIXTURE_TIMEOUT_SECS
}

fn default_shutdown_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

fn default_max_items() -> usize {
    DEFAULT_MAX_REPORTED_ITEMS
}

fn true_bool() -> bool {
    true
}
