//! Line scanner for fixture annotations.
//!
//! The host file is never parsed as code. Each line is classified as code,
//! blank or comment; comment bodies are then checked for a caret marker, a
//! named range, a `step` opener or step content. Statements inside a step may
//! span several comment lines while their parentheses are open.

use crate::error::ProbeError;

/// Output of [`scan`]. Line indices are zero-based.
#[derive(Debug, Clone, Default)]
pub struct ScannedScript {
    pub markers: Vec<ScannedMarker>,
    pub ranges: Vec<ScannedRange>,
}

#[derive(Debug, Clone)]
pub struct ScannedMarker {
    /// Line holding the caret.
    pub line: usize,
    /// Character column of the caret.
    pub column: usize,
    /// Nearest preceding code line.
    pub anchor: Option<usize>,
    pub steps: Vec<ScannedStep>,
}

#[derive(Debug, Clone)]
pub struct ScannedRange {
    pub line: usize,
    pub anchor: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ScannedStep {
    /// Line of the `step` opener.
    pub line: usize,
    pub statements: Vec<Statement>,
    pub notes: Vec<String>,
}

/// One directive's source text, joined when it spans several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// First line of the statement.
    pub line: usize,
    pub text: String,
}

/// Body of a comment line (text after the prefix), or `None` for code and
/// blank lines.
pub fn comment_body<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.trim_start().strip_prefix(prefix)
}

pub fn scan(text: &str, comment_prefix: &str) -> Result<ScannedScript, ProbeError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut script = ScannedScript::default();
    let mut last_code: Option<usize> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let Some(body) = comment_body(line, comment_prefix) else {
            if !line.trim().is_empty() {
                last_code = Some(i);
            }
            i += 1;
            continue;
        };

        let body = body.trim();
        if body == "^" {
            let column = line.chars().position(|c| c == '^').unwrap_or(0);
            script.markers.push(ScannedMarker {
                line: i,
                column,
                anchor: last_code,
                steps: Vec::new(),
            });
        } else if body.starts_with('|') {
            script.ranges.push(ScannedRange {
                line: i,
                anchor: last_code,
            });
        } else if body == "step" {
            let Some(marker) = script.markers.last_mut() else {
                return Err(ProbeError::parse(i + 1, "step block without a preceding ^ marker"));
            };
            let (step, next) = scan_step(&lines, i, comment_prefix)?;
            marker.steps.push(step);
            i = next;
            continue;
        }
        i += 1;
    }

    Ok(script)
}

/// Collects the block opened by the `step` line at `start`. Returns the step
/// and the index of the first line after the block.
fn scan_step(
    lines: &[&str],
    start: usize,
    comment_prefix: &str,
) -> Result<(ScannedStep, usize), ProbeError> {
    let mut step = ScannedStep {
        line: start,
        statements: Vec::new(),
        notes: Vec::new(),
    };
    let mut pending: Option<Statement> = None;
    let mut i = start + 1;

    while i < lines.len() {
        let Some(body) = comment_body(lines[i], comment_prefix) else {
            break;
        };
        let body = body.trim();

        if let Some(statement) = pending.as_mut() {
            statement.text.push(' ');
            statement.text.push_str(body);
            if is_complete(&statement.text, statement.line)? {
                step.statements.extend(pending.take());
            }
            i += 1;
            continue;
        }

        if body == "step" || body == "^" {
            break;
        }
        if let Some(note) = body.strip_prefix(';') {
            step.notes.push(note.trim().to_string());
        } else if !body.is_empty() {
            let statement = Statement {
                line: i,
                text: body.to_string(),
            };
            if is_complete(&statement.text, i)? {
                step.statements.push(statement);
            } else {
                pending = Some(statement);
            }
        }
        i += 1;
    }

    if let Some(statement) = pending {
        return Err(ProbeError::parse(
            statement.line + 1,
            "unterminated filter expression",
        ));
    }
    Ok((step, i))
}

/// Whether every parenthesis and string literal in `text` is closed.
fn is_complete(text: &str, line: usize) -> Result<bool, ProbeError> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ProbeError::parse(line + 1, "unbalanced `)`"));
                }
            }
            _ => {}
        }
    }
    Ok(depth == 0 && !in_string)
}
