//! Maps scanned carets and range annotations to LSP positions.
//!
//! Columns in a fixture are counted in characters on the annotation line and
//! apply to the anchored code line as-is, so carets must be written with the
//! same indentation as the code they point into. Positions handed to the
//! backend are in UTF-16 code units.

use crate::error::ProbeError;
use crate::script::parser::{comment_body, ScannedMarker, ScannedRange};
use rustc_hash::FxHashMap;
use tower_lsp::lsp_types::{Position, Range};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRange {
    pub name: String,
    pub range: Range,
}

/// UTF-16 offset of character column `char_col` in `text`.
pub fn utf16_column(text: &str, char_col: usize) -> u32 {
    text.chars()
        .take(char_col)
        .map(|c| c.len_utf16() as u32)
        .sum()
}

pub fn resolve_marker(lines: &[&str], marker: &ScannedMarker) -> Result<Position, ProbeError> {
    let Some(anchor) = marker.anchor else {
        return Err(ProbeError::resolution(
            marker.line + 1,
            "caret has no code line above it",
        ));
    };
    let code = lines[anchor];
    let len = code.chars().count();
    if marker.column >= len {
        return Err(ProbeError::resolution(
            marker.line + 1,
            format!(
                "caret at column {} points past the end of line {} ({} characters)",
                marker.column + 1,
                anchor + 1,
                len
            ),
        ));
    }
    Ok(Position::new(anchor as u32, utf16_column(code, marker.column)))
}

/// Parses a `|start  end| name` annotation against its anchored code line.
pub fn resolve_range(
    lines: &[&str],
    range: &ScannedRange,
    comment_prefix: &str,
) -> Result<NamedRange, ProbeError> {
    let line_no = range.line + 1;
    let text = lines[range.line];
    let unbalanced = || ProbeError::resolution(line_no, "unbalanced range markers, expected `|start  end| name`");

    // Skip the comment prefix so a `|` inside it is never taken as a marker.
    let body = comment_body(text, comment_prefix).ok_or_else(unbalanced)?;
    let body_start = text.chars().count() - body.chars().count();

    let pipes: Vec<usize> = body
        .chars()
        .enumerate()
        .filter(|(_, c)| *c == '|')
        .map(|(i, _)| body_start + i)
        .collect();
    let &[start, end] = pipes.as_slice() else {
        return Err(unbalanced());
    };

    let name = body.rsplit('|').next().unwrap_or("").trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(unbalanced());
    }

    let Some(anchor) = range.anchor else {
        return Err(ProbeError::resolution(
            line_no,
            format!("range `{}` has no code line above it", name),
        ));
    };
    let code = lines[anchor];
    let len = code.chars().count();
    if start >= end || end > len {
        return Err(ProbeError::resolution(
            line_no,
            format!(
                "range `{}` spans columns {}..{} outside line {} ({} characters)",
                name,
                start + 1,
                end + 1,
                anchor + 1,
                len
            ),
        ));
    }

    let line = anchor as u32;
    Ok(NamedRange {
        name: name.to_string(),
        range: Range::new(
            Position::new(line, utf16_column(code, start)),
            Position::new(line, utf16_column(code, end)),
        ),
    })
}

/// Resolves every range annotation, keyed by name. Names are fixture-global.
pub fn resolve_ranges(
    lines: &[&str],
    ranges: &[ScannedRange],
    comment_prefix: &str,
) -> Result<FxHashMap<String, NamedRange>, ProbeError> {
    let mut resolved = FxHashMap::default();
    for scanned in ranges {
        let named = resolve_range(lines, scanned, comment_prefix)?;
        if resolved.contains_key(&named.name) {
            return Err(ProbeError::parse(
                scanned.line + 1,
                format!("range `{}` is defined twice", named.name),
            ));
        }
        resolved.insert(named.name.clone(), named);
    }
    Ok(resolved)
}
