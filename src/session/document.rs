//! In-memory copy of the document under test.
//!
//! Edits are restricted to one typed line at a time, inserted below an
//! anchor line and later removed again, so the buffer always returns to the
//! on-disk text byte for byte.

use ropey::Rope;
use thiserror::Error;
use tower_lsp::lsp_types::{Position, Range, Url};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("a typed line is already open")]
    AlreadyOpen,

    #[error("no typed line to delete")]
    NothingToDelete,

    #[error("line {0} is outside the document")]
    LineOutOfRange(u32),
}

/// A change as sent in `textDocument/didChange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub range: Range,
    pub text: String,
}

#[derive(Debug, Clone, Copy)]
struct OpenEdit {
    start: usize,
    len: usize,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub uri: Url,
    pub language_id: String,
    rope: Rope,
    version: i32,
    open_edit: Option<OpenEdit>,
}

impl Document {
    pub fn new(uri: Url, language_id: impl Into<String>, text: &str) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
            rope: Rope::from_str(text),
            version: 1,
            open_edit: None,
        }
    }

    pub fn text(&self) -> String {
        self.rope.to_string()
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn has_open_edit(&self) -> bool {
        self.open_edit.is_some()
    }

    /// Inserts `text` as a new line directly below `anchor_line`. Returns the
    /// change and the cursor at the end of the typed text.
    pub fn type_line(&mut self, anchor_line: u32, text: &str) -> Result<(TextChange, Position), EditError> {
        if self.open_edit.is_some() {
            return Err(EditError::AlreadyOpen);
        }
        let anchor = anchor_line as usize;
        if anchor >= self.rope.len_lines() {
            return Err(EditError::LineOutOfRange(anchor_line));
        }

        let (start, inserted) = if anchor + 1 < self.rope.len_lines() {
            (self.rope.line_to_char(anchor + 1), format!("{}\n", text))
        } else {
            // Last line without a trailing newline.
            (self.rope.len_chars(), format!("\n{}", text))
        };

        let at = self.position_of(start);
        self.rope.insert(start, &inserted);
        self.version += 1;
        self.open_edit = Some(OpenEdit {
            start,
            len: inserted.chars().count(),
        });

        let cursor = Position::new(
            anchor_line + 1,
            text.chars().map(|c| c.len_utf16() as u32).sum(),
        );
        Ok((
            TextChange {
                range: Range::new(at, at),
                text: inserted,
            },
            cursor,
        ))
    }

    /// Removes the line added by [`Document::type_line`].
    pub fn delete_typed_line(&mut self) -> Result<TextChange, EditError> {
        let edit = self.open_edit.take().ok_or(EditError::NothingToDelete)?;
        let end = edit.start + edit.len;
        let range = Range::new(self.position_of(edit.start), self.position_of(end));
        self.rope.remove(edit.start..end);
        self.version += 1;
        Ok(TextChange {
            range,
            text: String::new(),
        })
    }

    /// LSP position (UTF-16 columns) of a char index.
    fn position_of(&self, char_idx: usize) -> Position {
        let line = self.rope.char_to_line(char_idx);
        let line_start = self.rope.line_to_char(line);
        let column = self.rope.char_to_utf16_cu(char_idx) - self.rope.char_to_utf16_cu(line_start);
        Position::new(line as u32, column as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Document {
        Document::new(Url::parse("file:///w/general.cc").unwrap(), "cpp", text)
    }

    #[test]
    fn test_type_and_delete_restore_text() {
        let original = "void f() {\n  ProtoMsg foo;\n\n}\n";
        let mut document = doc(original);

        let (change, cursor) = document.type_line(1, "foo.sf").unwrap();
        assert_eq!(document.text(), "void f() {\n  ProtoMsg foo;\nfoo.sf\n\n}\n");
        assert_eq!(change.range, Range::new(Position::new(2, 0), Position::new(2, 0)));
        assert_eq!(change.text, "foo.sf\n");
        assert_eq!(cursor, Position::new(2, 6));
        assert_eq!(document.version(), 2);

        let change = document.delete_typed_line().unwrap();
        assert_eq!(change.range, Range::new(Position::new(2, 0), Position::new(3, 0)));
        assert_eq!(document.text(), original);
        assert_eq!(document.version(), 3);
        assert!(!document.has_open_edit());
    }

    #[test]
    fn test_type_below_last_line_without_newline() {
        let original = "int x;";
        let mut document = doc(original);
        let (change, cursor) = document.type_line(0, "x.").unwrap();
        assert_eq!(document.text(), "int x;\nx.");
        assert_eq!(change.range.start, Position::new(0, 6));
        assert_eq!(cursor, Position::new(1, 2));

        let change = document.delete_typed_line().unwrap();
        assert_eq!(change.range, Range::new(Position::new(0, 6), Position::new(1, 2)));
        assert_eq!(document.text(), original);
    }

    #[test]
    fn test_cursor_counts_utf16_units() {
        let mut document = doc("a\n");
        let (_, cursor) = document.type_line(0, "é😀").unwrap();
        assert_eq!(cursor, Position::new(1, 3));
    }

    #[test]
    fn test_edit_pairing_is_enforced() {
        let mut document = doc("a\nb\n");
        assert_eq!(document.delete_typed_line(), Err(EditError::NothingToDelete));
        document.type_line(0, "x").unwrap();
        assert_eq!(document.type_line(0, "y").unwrap_err(), EditError::AlreadyOpen);
        assert_eq!(document.type_line(9, "y").unwrap_err(), EditError::AlreadyOpen);
        document.delete_typed_line().unwrap();
        assert_eq!(document.type_line(9, "y").unwrap_err(), EditError::LineOutOfRange(9));
    }
}
