//! Probe scripts: a source file plus the markers and steps annotated in it.

pub mod directive;
pub mod parser;
pub mod resolver;

pub use directive::{Directive, DirectiveLine};
pub use resolver::NamedRange;

use crate::error::ProbeError;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use tower_lsp::lsp_types::Position;

#[derive(Debug, Clone)]
pub struct Step {
    /// One-based line of the `step` opener.
    pub line: usize,
    pub directives: Vec<DirectiveLine>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Marker {
    /// One-based line of the caret.
    pub line: usize,
    /// Zero-based line the caret points into.
    pub anchor_line: u32,
    pub position: Position,
    /// Named range annotated on the same code line, if any.
    pub range: Option<NamedRange>,
    pub steps: Vec<Step>,
}

/// A fully resolved fixture. The text is kept verbatim, annotations included,
/// since the annotations are comments in the host language.
#[derive(Debug, Clone)]
pub struct ProbeScript {
    pub path: PathBuf,
    pub text: String,
    pub markers: Vec<Marker>,
    pub ranges: FxHashMap<String, NamedRange>,
}

impl ProbeScript {
    pub fn parse(path: &Path, text: String, comment_prefix: &str) -> Result<Self, ProbeError> {
        let scanned = parser::scan(&text, comment_prefix)?;
        let lines: Vec<&str> = text.lines().collect();
        let ranges = resolver::resolve_ranges(&lines, &scanned.ranges, comment_prefix)?;

        let mut markers = Vec::with_capacity(scanned.markers.len());
        for scanned_marker in &scanned.markers {
            let position = resolver::resolve_marker(&lines, scanned_marker)?;

            let mut steps = Vec::with_capacity(scanned_marker.steps.len());
            for scanned_step in &scanned_marker.steps {
                let directives = scanned_step
                    .statements
                    .iter()
                    .map(|statement| {
                        let line = statement.line + 1;
                        directive::interpret(&statement.text, line, &ranges)
                            .map(|directive| DirectiveLine { line, directive })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                directive::validate_step(&directives, scanned_step.line + 1)?;
                steps.push(Step {
                    line: scanned_step.line + 1,
                    directives,
                    notes: scanned_step.notes.clone(),
                });
            }

            let range = ranges
                .values()
                .filter(|named| named.range.start.line == position.line)
                .min_by_key(|named| named.range.start.character)
                .cloned();
            markers.push(Marker {
                line: scanned_marker.line + 1,
                anchor_line: position.line,
                position,
                range,
                steps,
            });
        }

        tracing::debug!(
            "Parsed {}: {} marker(s), {} named range(s)",
            path.display(),
            markers.len(),
            ranges.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            text,
            markers,
            ranges,
        })
    }

    /// First directive the runtime cannot execute, as `(line, keyword)`.
    pub fn first_unsupported(&self) -> Option<(usize, &str)> {
        self.markers
            .iter()
            .flat_map(|m| &m.steps)
            .flat_map(|s| &s.directives)
            .find_map(|d| match &d.directive {
                Directive::Unsupported { keyword } => Some((d.line, keyword.as_str())),
                _ => None,
            })
    }

    pub fn directive_count(&self) -> usize {
        self.markers
            .iter()
            .flat_map(|m| &m.steps)
            .map(|s| s.directives.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Feature;

    const SIGNATURE: &str = r#"void Foo(int x, double y);
float Foo(float x, float y);

void TestSignature() {
  Foo(1, 2.0);
  //     ^
  // step
  // ; Test signature help for the second argument.
  // paraminfo.trigger()
  // assert paraminfo.items.filter(
  //  label="Foo\\(float x, float y\\) -> float",
  //  active=false,
  // )
}
"#;

    #[test]
    fn test_parse_builds_markers_and_steps() {
        let script = ProbeScript::parse(Path::new("sig.cc"), SIGNATURE.to_string(), "//").unwrap();
        assert_eq!(script.markers.len(), 1);

        let marker = &script.markers[0];
        assert_eq!(marker.line, 6);
        assert_eq!(marker.position, Position::new(4, 9));
        assert_eq!(marker.steps.len(), 1);

        let step = &marker.steps[0];
        assert_eq!(step.line, 7);
        assert_eq!(step.notes, vec!["Test signature help for the second argument."]);
        assert!(matches!(step.directives[0].directive, Directive::Trigger(Feature::ParamInfo)));
        assert_eq!(step.directives[1].line, 10);
        assert_eq!(script.directive_count(), 2);
        assert!(script.first_unsupported().is_none());
    }

    #[test]
    fn test_first_unsupported() {
        let text = "int x;\n// ^\n// step\n// hover.trigger()\n";
        let script = ProbeScript::parse(Path::new("x.cc"), text.to_string(), "//").unwrap();
        assert_eq!(script.first_unsupported(), Some((4, "hover.trigger")));
    }

    #[test]
    fn test_invalid_step_order_fails_parse() {
        let text = "int x;\n// ^\n// step\n// assert completion.items\n";
        let err = ProbeScript::parse(Path::new("x.cc"), text.to_string(), "//").unwrap_err();
        assert!(matches!(err, ProbeError::Parse { line: 4, .. }));
    }

    #[test]
    fn test_marker_picks_up_range_on_its_line() {
        let text = "  std::vector<int> ints;\n  //               |   | ints\n  //      ^\n";
        let script = ProbeScript::parse(Path::new("x.cc"), text.to_string(), "//").unwrap();
        let range = script.markers[0].range.as_ref().map(|r| r.name.as_str());
        assert_eq!(range, Some("ints"));
    }

    #[test]
    fn test_fixture_without_markers_is_empty() {
        let script = ProbeScript::parse(Path::new("x.cc"), "int x;\n".to_string(), "//").unwrap();
        assert!(script.markers.is_empty());
    }
}
