//! Statement grammar and the typed directives it produces.
//!
//! ```text
//! statement := "assert" target | call
//! target    := path [ ".filter" "(" clauses ")" ]
//! call      := path "(" values ")"
//! value     := string | true | false | ident
//! ```
//!
//! A well-formed call whose path is not recognised becomes
//! [`Directive::Unsupported`] rather than an error, so fixtures written for a
//! newer harness are skipped instead of failed.

use crate::assertion::items::render_range;
use crate::assertion::{Clause, MatchRule, Predicate};
use crate::error::ProbeError;
use crate::script::resolver::NamedRange;
use crate::types::Feature;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

#[derive(Debug, Clone)]
pub enum Directive {
    WaitForReady,
    TypeText(String),
    DeleteLine,
    Trigger(Feature),
    Assert(Predicate),
    Unsupported { keyword: String },
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::WaitForReady => f.write_str("workspace.waitForReady()"),
            Directive::TypeText(text) => write!(f, "type({:?})", text),
            Directive::DeleteLine => f.write_str("delline()"),
            Directive::Trigger(feature) => write!(f, "{}.trigger()", feature),
            Directive::Assert(predicate) => write!(f, "assert {}", predicate),
            Directive::Unsupported { keyword } => write!(f, "{} (unsupported)", keyword),
        }
    }
}

/// A directive and the one-based line its statement starts on.
#[derive(Debug, Clone)]
pub struct DirectiveLine {
    pub line: usize,
    pub directive: Directive,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Dot,
    Comma,
    Eq,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "`{}`", name),
            Token::Str(_) => f.write_str("string literal"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::Dot => f.write_str("`.`"),
            Token::Comma => f.write_str("`,`"),
            Token::Eq => f.write_str("`=`"),
        }
    }
}

fn tokenize(text: &str, line: usize) -> Result<Vec<Token>, ProbeError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '.' | ',' | '=' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '.' => Token::Dot,
                    ',' => Token::Comma,
                    _ => Token::Eq,
                });
            }
            '"' => {
                chars.next();
                tokens.push(Token::Str(string_literal(&mut chars, line)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if !(c.is_alphanumeric() || c == '_') {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ProbeError::parse(line, format!("unexpected character `{}`", other)));
            }
        }
    }
    Ok(tokens)
}

/// Reads the rest of a string literal after its opening quote. `\\`, `\"`,
/// `\n` and `\t` are unescaped; any other escape is kept verbatim.
fn string_literal(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    line: usize,
) -> Result<String, ProbeError> {
    let mut value = String::new();
    loop {
        match chars.next() {
            None => return Err(ProbeError::parse(line, "unterminated string literal")),
            Some('"') => return Ok(value),
            Some('\\') => match chars.next() {
                Some('\\') => value.push('\\'),
                Some('"') => value.push('"'),
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(other) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return Err(ProbeError::parse(line, "unterminated string literal")),
            },
            Some(c) => value.push(c),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
    Ident(String),
}

struct StatementParser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
}

impl StatementParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> ProbeError {
        ProbeError::parse(self.line, reason)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ProbeError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.error(format!("expected {}, found {}", expected, token))),
            None => Err(self.error(format!("expected {}, found end of statement", expected))),
        }
    }

    fn ident(&mut self) -> Result<String, ProbeError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(token) => Err(self.error(format!("expected identifier, found {}", token))),
            None => Err(self.error("expected identifier, found end of statement")),
        }
    }

    fn path(&mut self) -> Result<Vec<String>, ProbeError> {
        let mut path = vec![self.ident()?];
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            path.push(self.ident()?);
        }
        Ok(path)
    }

    fn value(&mut self) -> Result<Value, ProbeError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::Ident(name),
            }),
            Some(token) => Err(self.error(format!("expected a value, found {}", token))),
            None => Err(self.error("expected a value, found end of statement")),
        }
    }

    /// Comma-separated items up to the closing paren, trailing comma allowed.
    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ProbeError>,
    ) -> Result<Vec<T>, ProbeError> {
        self.expect(Token::LParen)?;
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&Token::RParen) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(item(self)?);
            match self.next() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => return Ok(items),
                Some(token) => return Err(self.error(format!("expected `,` or `)`, found {}", token))),
                None => return Err(self.error("unterminated argument list")),
            }
        }
    }

    fn finish(&self) -> Result<(), ProbeError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected {} after statement", token))),
        }
    }
}

/// Turns one statement into a directive.
///
/// `line` is one-based. `ranges` are the fixture's named ranges, used for
/// bare identifiers in filter clauses.
pub fn interpret(
    text: &str,
    line: usize,
    ranges: &FxHashMap<String, NamedRange>,
) -> Result<Directive, ProbeError> {
    let mut parser = StatementParser {
        tokens: tokenize(text, line)?,
        pos: 0,
        line,
    };

    if parser.peek() == Some(&Token::Ident("assert".to_string())) {
        parser.pos += 1;
        return interpret_assert(&mut parser, ranges);
    }

    let path = parser.path()?;
    let args = parser.list(|p| p.value())?;
    parser.finish()?;

    let segments: Vec<&str> = path.iter().map(String::as_str).collect();
    let directive = match segments.as_slice() {
        ["workspace" | "repo", "waitForReady"] => {
            expect_arity(&segments, &args, 0, line)?;
            Directive::WaitForReady
        }
        ["type"] => {
            expect_arity(&segments, &args, 1, line)?;
            let Value::Str(text) = &args[0] else {
                return Err(ProbeError::parse(line, "type() takes a string literal"));
            };
            if text.contains('\n') {
                return Err(ProbeError::parse(line, "type() text must be a single line"));
            }
            Directive::TypeText(text.clone())
        }
        ["delline"] => {
            expect_arity(&segments, &args, 0, line)?;
            Directive::DeleteLine
        }
        [name, "trigger"] => match Feature::from_name(name) {
            Some(feature) => {
                expect_arity(&segments, &args, 0, line)?;
                Directive::Trigger(feature)
            }
            None => Directive::Unsupported {
                keyword: path.join("."),
            },
        },
        _ => Directive::Unsupported {
            keyword: path.join("."),
        },
    };
    Ok(directive)
}

fn interpret_assert(
    parser: &mut StatementParser,
    ranges: &FxHashMap<String, NamedRange>,
) -> Result<Directive, ProbeError> {
    let line = parser.line;
    let mut path = parser.path()?;
    let clauses = if path.last().map(String::as_str) == Some("filter") {
        path.pop();
        parser.list(|p| {
            let field = p.ident()?;
            p.expect(Token::Eq)?;
            Ok((field, p.value()?))
        })?
    } else {
        Vec::new()
    };
    parser.finish()?;

    let feature = match path.as_slice() {
        [feature, items] if items == "items" => match Feature::from_name(feature) {
            Some(feature) => feature,
            None => {
                return Ok(Directive::Unsupported {
                    keyword: format!("assert {}", path.join(".")),
                })
            }
        },
        _ => {
            return Err(ProbeError::parse(
                line,
                format!("expected `<feature>.items` after assert, found `{}`", path.join(".")),
            ))
        }
    };

    let mut seen = FxHashSet::default();
    let mut resolved = Vec::with_capacity(clauses.len());
    for (field, value) in clauses {
        if !seen.insert(field.clone()) {
            return Err(ProbeError::parse(line, format!("duplicate filter key `{}`", field)));
        }
        let rule = match value {
            Value::Str(source) => MatchRule::pattern(&source).map_err(|e| {
                ProbeError::parse(line, format!("invalid pattern for `{}`: {}", field, e))
            })?,
            Value::Bool(b) => MatchRule::Bool(b),
            Value::Ident(name) => {
                let Some(named) = ranges.get(&name) else {
                    return Err(ProbeError::resolution(
                        line,
                        format!("unknown range `{}`", name),
                    ));
                };
                MatchRule::Range {
                    rendered: render_range(&named.range),
                    name,
                }
            }
        };
        resolved.push(Clause { field, rule });
    }

    Ok(Directive::Assert(Predicate {
        feature,
        clauses: resolved,
    }))
}

fn expect_arity(
    path: &[&str],
    args: &[Value],
    expected: usize,
    line: usize,
) -> Result<(), ProbeError> {
    if args.len() == expected {
        return Ok(());
    }
    Err(ProbeError::parse(
        line,
        format!(
            "{}() takes {} argument(s), got {}",
            path.join("."),
            expected,
            args.len()
        ),
    ))
}

/// Checks ordering rules within one step.
///
/// At most one `type()` edit may be open; it must be closed by `delline()`
/// before the step ends, and every `assert` needs a trigger of the same
/// feature earlier in the step. Steps containing unsupported directives are
/// not checked, since their intent is unknown.
pub fn validate_step(directives: &[DirectiveLine], step_line: usize) -> Result<(), ProbeError> {
    if directives
        .iter()
        .any(|d| matches!(d.directive, Directive::Unsupported { .. }))
    {
        return Ok(());
    }

    let mut open_edit: Option<usize> = None;
    let mut triggered = FxHashSet::default();

    for entry in directives {
        match &entry.directive {
            Directive::TypeText(_) => {
                if let Some(open) = open_edit {
                    return Err(ProbeError::parse(
                        entry.line,
                        format!("type() while the edit from line {} is still open, close it with delline() first", open),
                    ));
                }
                open_edit = Some(entry.line);
            }
            Directive::DeleteLine => {
                if open_edit.take().is_none() {
                    return Err(ProbeError::parse(entry.line, "delline() without a preceding type()"));
                }
            }
            Directive::Trigger(feature) => {
                triggered.insert(*feature);
            }
            Directive::Assert(predicate) => {
                if !triggered.contains(&predicate.feature) {
                    return Err(ProbeError::parse(
                        entry.line,
                        format!(
                            "assert on {} without a preceding {}.trigger() in this step",
                            predicate.feature, predicate.feature
                        ),
                    ));
                }
            }
            Directive::WaitForReady | Directive::Unsupported { .. } => {}
        }
    }

    match open_edit {
        Some(open) => Err(ProbeError::parse(
            open,
            format!("type() is not undone by delline() before the step at line {} ends", step_line),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::{Position, Range};

    fn no_ranges() -> FxHashMap<String, NamedRange> {
        FxHashMap::default()
    }

    fn parse(text: &str) -> Result<Directive, ProbeError> {
        interpret(text, 7, &no_ranges())
    }

    fn located(directives: Vec<Directive>) -> Vec<DirectiveLine> {
        directives
            .into_iter()
            .enumerate()
            .map(|(i, directive)| DirectiveLine { line: 10 + i, directive })
            .collect()
    }

    #[test]
    fn test_known_calls() {
        assert!(matches!(parse("workspace.waitForReady()"), Ok(Directive::WaitForReady)));
        assert!(matches!(parse("repo.waitForReady()"), Ok(Directive::WaitForReady)));
        assert!(matches!(parse("delline()"), Ok(Directive::DeleteLine)));
        assert!(matches!(
            parse("paraminfo.trigger()"),
            Ok(Directive::Trigger(Feature::ParamInfo))
        ));
        match parse(r#"type("foo.sf")"#) {
            Ok(Directive::TypeText(text)) => assert_eq!(text, "foo.sf"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arity_is_checked() {
        assert!(matches!(parse("type()"), Err(ProbeError::Parse { line: 7, .. })));
        assert!(matches!(parse(r#"type("a", "b")"#), Err(ProbeError::Parse { .. })));
        assert!(matches!(parse(r#"completion.trigger("x")"#), Err(ProbeError::Parse { .. })));
        assert!(matches!(parse("type(true)"), Err(ProbeError::Parse { .. })));
    }

    #[test]
    fn test_unknown_keyword_is_unsupported() {
        match parse("hover.trigger()") {
            Ok(Directive::Unsupported { keyword }) => assert_eq!(keyword, "hover.trigger"),
            other => panic!("unexpected {:?}", other),
        }
        match parse("assert hover.items") {
            Ok(Directive::Unsupported { keyword }) => assert_eq!(keyword, "assert hover.items"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_statement_is_parse_error() {
        assert!(matches!(parse("completion.trigger"), Err(ProbeError::Parse { .. })));
        assert!(matches!(parse("completion..trigger()"), Err(ProbeError::Parse { .. })));
        assert!(matches!(parse("delline() extra"), Err(ProbeError::Parse { .. })));
        assert!(matches!(parse("delline(;"), Err(ProbeError::Parse { .. })));
        assert!(matches!(parse("assert completion.results"), Err(ProbeError::Parse { .. })));
    }

    #[test]
    fn test_assert_with_and_without_filter() {
        let Ok(Directive::Assert(bare)) = parse("assert navigation.items") else {
            panic!("expected assert");
        };
        let Ok(Directive::Assert(empty)) = parse("assert navigation.items.filter()") else {
            panic!("expected assert");
        };
        assert!(bare.clauses.is_empty());
        assert!(empty.clauses.is_empty());
        assert_eq!(bare.feature, Feature::Navigation);
    }

    #[test]
    fn test_multiline_filter_with_trailing_comma() {
        let text = r#"assert paraminfo.items.filter( active=true, label="Foo\\(int x, double y\\) -> void", selection="double y", )"#;
        let Ok(Directive::Assert(predicate)) = parse(text) else {
            panic!("expected assert");
        };
        assert_eq!(predicate.clauses.len(), 3);
        assert!(matches!(predicate.clauses[0].rule, MatchRule::Bool(true)));
        match &predicate.clauses[1].rule {
            MatchRule::Pattern { source, regex } => {
                assert_eq!(source, r"Foo\(int x, double y\) -> void");
                assert!(regex.is_match("Foo(int x, double y) -> void"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_range_reference() {
        let mut ranges = no_ranges();
        ranges.insert(
            "ints".to_string(),
            NamedRange {
                name: "ints".to_string(),
                range: Range::new(Position::new(44, 19), Position::new(44, 23)),
            },
        );
        let text = r#"assert navigation.items.filter(path=".*/general.cc", range=ints)"#;
        let Ok(Directive::Assert(predicate)) = interpret(text, 3, &ranges) else {
            panic!("expected assert");
        };
        match &predicate.clauses[1].rule {
            MatchRule::Range { name, rendered } => {
                assert_eq!(name, "ints");
                assert_eq!(rendered, "44:19-44:23");
            }
            other => panic!("unexpected {:?}", other),
        }

        let missing = interpret("assert navigation.items.filter(range=other)", 3, &ranges);
        assert!(matches!(missing, Err(ProbeError::Resolution { line: 3, .. })));
    }

    #[test]
    fn test_bad_filters() {
        assert!(matches!(
            parse(r#"assert completion.items.filter(label="a", label="b")"#),
            Err(ProbeError::Parse { .. })
        ));
        assert!(matches!(
            parse(r#"assert completion.items.filter(label="(")"#),
            Err(ProbeError::Parse { .. })
        ));
        assert!(matches!(
            parse(r#"assert completion.items.filter(label)"#),
            Err(ProbeError::Parse { .. })
        ));
    }

    #[test]
    fn test_string_escapes() {
        match parse(r#"type("a\"b\\c\d")"#) {
            Ok(Directive::TypeText(text)) => assert_eq!(text, r#"a"b\c\d"#),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse(r#"type("a\nb")"#), Err(ProbeError::Parse { .. })));
    }

    #[test]
    fn test_validate_paired_edits() {
        let ok = located(vec![
            Directive::WaitForReady,
            Directive::TypeText("f".into()),
            Directive::Trigger(Feature::Completion),
            Directive::DeleteLine,
            Directive::TypeText("g".into()),
            Directive::DeleteLine,
        ]);
        assert!(validate_step(&ok, 9).is_ok());

        let stacked = located(vec![
            Directive::TypeText("f".into()),
            Directive::TypeText("g".into()),
            Directive::DeleteLine,
        ]);
        assert!(matches!(validate_step(&stacked, 9), Err(ProbeError::Parse { line: 11, .. })));

        let dangling = located(vec![Directive::TypeText("f".into())]);
        assert!(matches!(validate_step(&dangling, 9), Err(ProbeError::Parse { line: 10, .. })));

        let orphan = located(vec![Directive::DeleteLine]);
        assert!(validate_step(&orphan, 9).is_err());
    }

    #[test]
    fn test_validate_assert_needs_trigger() {
        let predicate = |feature| {
            Directive::Assert(Predicate {
                feature,
                clauses: Vec::new(),
            })
        };
        let missing = located(vec![
            Directive::Trigger(Feature::Completion),
            predicate(Feature::Navigation),
        ]);
        assert!(matches!(validate_step(&missing, 9), Err(ProbeError::Parse { line: 11, .. })));

        let fine = located(vec![
            Directive::Trigger(Feature::Navigation),
            predicate(Feature::Navigation),
            predicate(Feature::Navigation),
        ]);
        assert!(validate_step(&fine, 9).is_ok());
    }

    #[test]
    fn test_validate_skips_steps_with_unsupported() {
        let steps = located(vec![
            Directive::Unsupported {
                keyword: "hover.trigger".into(),
            },
            Directive::DeleteLine,
        ]);
        assert!(validate_step(&steps, 9).is_ok());
    }
}
