//! Predicate evaluation over normalized backend responses.
//!
//! A predicate holds iff at least one item satisfies every clause. String
//! clauses are full-match regexes, boolean clauses compare exactly and range
//! clauses compare against a named range resolved from the fixture.

pub mod items;

pub use items::{FieldValue, ResponseItem};

use crate::types::{Feature, StepLocation};
use regex::Regex;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone)]
pub enum MatchRule {
    /// Regex anchored at both ends.
    Pattern { source: String, regex: Regex },
    Bool(bool),
    /// Named range from the fixture, rendered as `L:C-L:C`.
    Range { name: String, rendered: String },
}

impl MatchRule {
    pub fn pattern(source: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{})$", source))?;
        Ok(Self::Pattern {
            source: source.to_string(),
            regex,
        })
    }

    pub fn matches(&self, value: Option<&FieldValue>) -> bool {
        match (self, value) {
            (Self::Pattern { regex, .. }, Some(FieldValue::Text(text))) => regex.is_match(text),
            (Self::Bool(expected), Some(FieldValue::Bool(actual))) => expected == actual,
            (Self::Range { rendered, .. }, Some(FieldValue::Text(text))) => rendered == text,
            _ => false,
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern { source, .. } => write!(f, "{:?}", source),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Range { name, .. } => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Clause {
    pub field: String,
    pub rule: MatchRule,
}

impl Clause {
    pub fn matches(&self, item: &ResponseItem) -> bool {
        self.rule.matches(item.get(&self.field))
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, self.rule)
    }
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub feature: Feature,
    pub clauses: Vec<Clause>,
}

impl Predicate {
    pub fn matches_item(&self, item: &ResponseItem) -> bool {
        self.clauses.iter().all(|clause| clause.matches(item))
    }

    /// With no clauses this reduces to non-emptiness.
    pub fn holds(&self, items: &[ResponseItem]) -> bool {
        items.iter().any(|item| self.matches_item(item))
    }

    /// Clauses that no item satisfies even on their own.
    pub fn unmatched_clauses(&self, items: &[ResponseItem]) -> Vec<String> {
        self.clauses
            .iter()
            .filter(|clause| !items.iter().any(|item| clause.matches(item)))
            .map(|clause| clause.to_string())
            .collect()
    }

    pub fn evaluate(
        &self,
        items: &[ResponseItem],
        location: StepLocation,
        max_reported_items: usize,
    ) -> Result<(), AssertionFailure> {
        if self.holds(items) {
            return Ok(());
        }
        Err(AssertionFailure {
            location,
            predicate: self.to_string(),
            unmatched_clauses: self.unmatched_clauses(items),
            observed: items.iter().take(max_reported_items).cloned().collect(),
            observed_total: items.len(),
            notes: Vec::new(),
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.items", self.feature)?;
        if self.clauses.is_empty() {
            return Ok(());
        }
        f.write_str(".filter(")?;
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", clause)?;
        }
        f.write_str(")")
    }
}

/// An assertion that did not hold, with everything needed to diagnose it
/// without re-running the fixture.
#[derive(Debug, Clone, Serialize)]
pub struct AssertionFailure {
    pub location: StepLocation,
    pub predicate: String,
    pub unmatched_clauses: Vec<String>,
    /// Observed items, truncated.
    pub observed: Vec<ResponseItem>,
    pub observed_total: usize,
    /// `;` notes of the step the assertion belongs to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}
