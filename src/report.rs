//! Fixture outcomes and the run report.

use crate::assertion::AssertionFailure;
use crate::error::{ErrorKind, ProbeError};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Result of one executed directive.
#[derive(Debug, Clone)]
pub enum StepResult {
    Success,
    Failure(AssertionFailure),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed {
        directives: usize,
    },
    Failed {
        failure: AssertionFailure,
    },
    Errored {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<usize>,
    },
    Skipped {
        keyword: String,
        line: usize,
    },
}

impl Outcome {
    /// Unsupported directives skip the fixture; everything else errors it.
    pub fn from_error(error: &ProbeError) -> Self {
        match error {
            ProbeError::UnsupportedDirective { line, keyword } => Outcome::Skipped {
                keyword: keyword.clone(),
                line: *line,
            },
            other => Outcome::Errored {
                kind: other.kind(),
                message: other.to_string(),
                line: other.line(),
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Passed { .. } => "PASS",
            Outcome::Failed { .. } => "FAIL",
            Outcome::Errored { .. } => "ERROR",
            Outcome::Skipped { .. } => "SKIP",
        }
    }

    pub fn is_problem(&self) -> bool {
        matches!(self, Outcome::Failed { .. } | Outcome::Errored { .. })
    }
}

/// Folds directive results into one outcome. The first non-success decides.
pub fn aggregate(results: Vec<Result<StepResult, ProbeError>>) -> Outcome {
    let mut directives = 0;
    for result in results {
        match result {
            Ok(StepResult::Success) => directives += 1,
            Ok(StepResult::Failure(failure)) => return Outcome::Failed { failure },
            Err(error) => return Outcome::from_error(&error),
        }
    }
    Outcome::Passed { directives }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixtureReport {
    pub path: PathBuf,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub fixtures: Vec<FixtureReport>,
    pub summary: Summary,
}

impl RunReport {
    pub fn new(fixtures: Vec<FixtureReport>) -> Self {
        let mut summary = Summary::default();
        for fixture in &fixtures {
            match fixture.outcome {
                Outcome::Passed { .. } => summary.passed += 1,
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::Errored { .. } => summary.errored += 1,
                Outcome::Skipped { .. } => summary.skipped += 1,
            }
        }
        Self { fixtures, summary }
    }

    pub fn success(&self) -> bool {
        !self.fixtures.iter().any(|f| f.outcome.is_problem())
    }

    pub fn exit_code(&self) -> u8 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for fixture in &self.fixtures {
            let _ = writeln!(out, "{:<5} {}", fixture.outcome.label(), fixture.path.display());
            match &fixture.outcome {
                Outcome::Passed { .. } => {}
                Outcome::Failed { failure } => render_failure(&mut out, failure),
                Outcome::Errored { message, .. } => {
                    let _ = writeln!(out, "      {}", message);
                }
                Outcome::Skipped { keyword, line } => {
                    let _ = writeln!(out, "      unsupported directive `{}` at line {}", keyword, line);
                }
            }
        }
        let s = &self.summary;
        let _ = writeln!(
            out,
            "\n{} passed, {} failed, {} errored, {} skipped",
            s.passed, s.failed, s.errored, s.skipped
        );
        out
    }
}

fn render_failure(out: &mut String, failure: &AssertionFailure) {
    let _ = writeln!(out, "      at {}", failure.location);
    let _ = writeln!(out, "      assert {}", failure.predicate);
    for note in &failure.notes {
        let _ = writeln!(out, "      ; {}", note);
    }
    if !failure.unmatched_clauses.is_empty() {
        let _ = writeln!(
            out,
            "      no item matches: {}",
            failure.unmatched_clauses.join(", ")
        );
    }
    let _ = writeln!(out, "      observed {} item(s):", failure.observed_total);
    for item in &failure.observed {
        let rendered = serde_json::to_string(item).unwrap_or_default();
        let _ = writeln!(out, "        {}", rendered);
    }
    if failure.observed_total > failure.observed.len() {
        let _ = writeln!(
            out,
            "        ... {} more",
            failure.observed_total - failure.observed.len()
        );
    }
}
