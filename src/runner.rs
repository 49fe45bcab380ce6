//! Batch execution: one backend per fixture, fixtures in parallel up to the
//! configured job count, results in input order.

use crate::cancellation::CancellationToken;
use crate::config::{find_project_root, ProberConfig};
use crate::error::{BestEffort, ProbeError};
use crate::languages::LanguageRegistry;
use crate::report::{aggregate, FixtureReport, Outcome, RunReport};
use crate::script::ProbeScript;
use crate::session::{Backend, Document, DriverOptions, LspBackend, SessionDriver};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tower_lsp::lsp_types::Url;
use tracing::{debug, info, warn};

/// Starts a fresh backend for a project root.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, root: &Path) -> Result<Box<dyn Backend>, ProbeError>;
}

/// Spawns the configured language server process.
pub struct ProcessLauncher {
    config: Arc<ProberConfig>,
}

impl ProcessLauncher {
    pub fn new(config: Arc<ProberConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, root: &Path) -> Result<Box<dyn Backend>, ProbeError> {
        let backend = LspBackend::launch(&self.config, root).await?;
        Ok(Box::new(backend))
    }
}

#[derive(Clone)]
pub struct Runner {
    config: Arc<ProberConfig>,
    launcher: Arc<dyn Launcher>,
    languages: Arc<LanguageRegistry>,
    token: CancellationToken,
}

impl Runner {
    pub fn new(config: Arc<ProberConfig>, launcher: Arc<dyn Launcher>, token: CancellationToken) -> Self {
        Self {
            config,
            launcher,
            languages: Arc::new(LanguageRegistry::new()),
            token,
        }
    }

    pub async fn run(&self, fixtures: Vec<PathBuf>) -> RunReport {
        let jobs = self.config.run.effective_jobs();
        info!(fixtures = fixtures.len(), jobs, "Starting run");

        let reports = stream::iter(fixtures)
            .map(|path| {
                let runner = self.clone();
                let task_path = path.clone();
                async move {
                    match tokio::spawn(async move { runner.run_fixture(task_path).await }).await {
                        Ok(report) => report,
                        Err(e) => FixtureReport {
                            outcome: Outcome::from_error(&ProbeError::cancelled(format!(
                                "fixture task aborted: {}",
                                e
                            ))),
                            path,
                        },
                    }
                }
            })
            .buffered(jobs)
            .collect::<Vec<_>>()
            .await;

        RunReport::new(reports)
    }

    pub async fn run_fixture(&self, path: PathBuf) -> FixtureReport {
        let outcome = self.fixture_outcome(&path).await;
        info!(fixture = %path.display(), outcome = outcome.label(), "Fixture finished");
        FixtureReport { path, outcome }
    }

    async fn fixture_outcome(&self, path: &Path) -> Outcome {
        if self.token.is_cancelled() {
            return Outcome::from_error(&ProbeError::cancelled("run cancelled before the fixture started"));
        }

        let (script, document) = match self.load(path).await {
            Ok(loaded) => loaded,
            Err(e) => return Outcome::from_error(&e),
        };
        if let Some((line, keyword)) = script.first_unsupported() {
            return Outcome::from_error(&ProbeError::UnsupportedDirective {
                line,
                keyword: keyword.to_string(),
            });
        }

        // One deadline covers launch and execution. Release runs after it.
        let fixture_timeout = self.config.timeouts.fixture();
        let expires = fixture_timeout.map(|timeout| Instant::now() + timeout);
        let expired = || {
            ProbeError::cancelled(format!(
                "fixture exceeded {:?}",
                fixture_timeout.unwrap_or_default()
            ))
        };

        // A launch interrupted here drops the half-initialized backend,
        // which kills its process.
        let root = find_project_root(&script.path, &self.config.backend.root_markers);
        let launched = tokio::select! {
            launched = self.launcher.launch(&root) => launched,
            _ = self.token.cancelled() => Err(ProbeError::cancelled("run cancelled while launching the backend")),
            _ = deadline(expires) => Err(expired()),
        };
        let mut backend = match launched {
            Ok(backend) => backend,
            Err(e) => return Outcome::from_error(&e),
        };

        let options = DriverOptions {
            ready_timeout: self.config.timeouts.ready(),
            max_reported_items: self.config.run.max_reported_items,
        };
        let mut driver = SessionDriver::new(backend.as_mut(), document, options);
        let results = tokio::select! {
            results = driver.execute(&script) => results,
            _ = self.token.cancelled() => vec![Err(ProbeError::cancelled("run cancelled"))],
            _ = deadline(expires) => vec![Err(expired())],
        };

        driver.close().await;
        backend.shutdown().await.best_effort("shutdown backend");
        aggregate(results)
    }

    async fn load(&self, path: &Path) -> Result<(ProbeScript, Document), ProbeError> {
        let io_error = |source| ProbeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let path = tokio::fs::canonicalize(path).await.map_err(io_error)?;
        let text = tokio::fs::read_to_string(&path).await.map_err(io_error)?;

        let language = self
            .languages
            .resolve(&path, self.config.backend.language_id.as_deref())
            .ok_or_else(|| ProbeError::parse(1, format!("unknown language for {}", path.display())))?;
        let uri = Url::from_file_path(&path)
            .map_err(|_| ProbeError::parse(1, format!("{} is not a valid file URI", path.display())))?;

        debug!(fixture = %path.display(), language = language.id, "Loading fixture");
        let document = Document::new(uri, language.id, &text);
        let script = ProbeScript::parse(&path, text, language.comment)?;
        Ok((script, document))
    }
}

async fn deadline(expires: Option<Instant>) {
    match expires {
        Some(expires) => tokio::time::sleep_until(expires).await,
        None => std::future::pending().await,
    }
}

/// Expands CLI inputs into fixture paths: directories recursively (files with
/// a known extension only), glob patterns and plain files. Duplicates are
/// dropped, first occurrence wins.
pub fn discover_fixtures(inputs: &[String], languages: &LanguageRegistry) -> Result<Vec<PathBuf>, String> {
    let mut fixtures = Vec::new();
    let mut push = |path: PathBuf| {
        if !fixtures.contains(&path) {
            fixtures.push(path);
        }
    };

    for input in inputs {
        let path = Path::new(input);
        if path.is_dir() {
            let pattern = format!("{}/**/*", glob::Pattern::escape(input.trim_end_matches('/')));
            let mut found: Vec<PathBuf> = glob::glob(&pattern)
                .map_err(|e| format!("Invalid directory pattern for {}: {}", input, e))?
                .filter_map(|entry| entry.best_effort("read directory entry"))
                .filter(|p| p.is_file() && languages.get_for_path(p).is_some())
                .collect();
            found.sort();
            found.into_iter().for_each(&mut push);
        } else if path.exists() {
            push(path.to_path_buf());
        } else if input.contains(['*', '?', '[']) {
            let matches: Vec<PathBuf> = glob::glob(input)
                .map_err(|e| format!("Invalid glob pattern '{}': {}", input, e))?
                .filter_map(|entry| entry.best_effort("read glob match"))
                .filter(|p| p.is_file())
                .collect();
            if matches.is_empty() {
                warn!(pattern = %input, "Glob matched no fixtures");
            }
            matches.into_iter().for_each(&mut push);
        } else {
            return Err(format!("Fixture not found: {}", input));
        }
    }
    Ok(fixtures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[test]
    fn test_discover_dirs_globs_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("a.cc"), "").unwrap();
        fs::write(root.join("nested/b.py"), "").unwrap();
        fs::write(root.join("notes.txt"), "").unwrap();

        let registry = LanguageRegistry::new();
        let inputs = vec![
            root.display().to_string(),
            root.join("a.cc").display().to_string(),
            root.join("*.txt").display().to_string(),
        ];
        let found = discover_fixtures(&inputs, &registry).unwrap();
        assert_eq!(
            found,
            vec![root.join("a.cc"), root.join("nested/b.py"), root.join("notes.txt")]
        );
    }

    #[test]
    fn test_missing_fixture_is_error() {
        let registry = LanguageRegistry::new();
        let err = discover_fixtures(&["/does/not/exist.cc".to_string()], &registry).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn test_deadline_without_timeout_never_fires() {
        let fired = tokio::time::timeout(Duration::from_millis(20), deadline(None)).await;
        assert!(fired.is_err());
        let soon = Instant::now() + Duration::from_millis(1);
        tokio::time::timeout(Duration::from_secs(1), deadline(Some(soon)))
            .await
            .unwrap();
    }
}
