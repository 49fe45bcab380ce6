//! Normalization of backend responses into [`ResponseItem`]s.
//!
//! Completion items, definition targets and signatures all become flat
//! field maps, so predicates are evaluated the same way for every feature.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tower_lsp::lsp_types::{
    CompletionResponse, CompletionTextEdit, Documentation, GotoDefinitionResponse,
    ParameterLabel, Range, SignatureHelp, SignatureInformation, Url,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Bool(bool),
}

/// One structured item returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseItem {
    fields: BTreeMap<String, FieldValue>,
}

impl ResponseItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, field: &str, value: impl Into<String>) -> Self {
        self.set_text(field, value);
        self
    }

    pub fn with_bool(mut self, field: &str, value: bool) -> Self {
        self.fields.insert(field.to_string(), FieldValue::Bool(value));
        self
    }

    pub fn set_text(&mut self, field: &str, value: impl Into<String>) {
        self.fields
            .insert(field.to_string(), FieldValue::Text(value.into()));
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field)? {
            FieldValue::Text(s) => Some(s),
            FieldValue::Bool(_) => None,
        }
    }
}

/// Renders a range as `L:C-L:C` (zero-based), the form named ranges are
/// compared in.
pub fn render_range(range: &Range) -> String {
    format!(
        "{}:{}-{}:{}",
        range.start.line, range.start.character, range.end.line, range.end.character
    )
}

pub fn from_completion(value: Value) -> Result<Vec<ResponseItem>, serde_json::Error> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let items = match serde_json::from_value::<CompletionResponse>(value)? {
        CompletionResponse::Array(items) => items,
        CompletionResponse::List(list) => list.items,
    };

    Ok(items
        .into_iter()
        .map(|item| {
            let insert_text = item
                .insert_text
                .clone()
                .or_else(|| {
                    item.text_edit.as_ref().map(|edit| match edit {
                        CompletionTextEdit::Edit(edit) => edit.new_text.clone(),
                        CompletionTextEdit::InsertAndReplace(edit) => edit.new_text.clone(),
                    })
                })
                .unwrap_or_else(|| item.label.clone());

            let mut out = ResponseItem::new()
                .with_text("label", item.label)
                .with_text("insertText", insert_text);
            if let Some(filter_text) = item.filter_text {
                out.set_text("filterText", filter_text);
            }
            if let Some(detail) = item.detail {
                out.set_text("detail", detail);
            }
            if let Some(documentation) = item.documentation {
                out.set_text("documentation", documentation_text(documentation));
            }
            if let Some(kind) = item.kind.and_then(|k| serde_json::to_value(k).ok()) {
                out.set_text("kind", kind.to_string());
            }
            out
        })
        .collect())
}

pub fn from_definition(value: Value) -> Result<Vec<ResponseItem>, serde_json::Error> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let targets: Vec<(Url, Range)> = match serde_json::from_value::<GotoDefinitionResponse>(value)? {
        GotoDefinitionResponse::Scalar(location) => vec![(location.uri, location.range)],
        GotoDefinitionResponse::Array(locations) => locations
            .into_iter()
            .map(|location| (location.uri, location.range))
            .collect(),
        GotoDefinitionResponse::Link(links) => links
            .into_iter()
            .map(|link| (link.target_uri, link.target_selection_range))
            .collect(),
    };

    Ok(targets
        .into_iter()
        .map(|(uri, range)| {
            let path = uri
                .to_file_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| uri.path().to_string());
            ResponseItem::new()
                .with_text("uri", uri.to_string())
                .with_text("path", path)
                .with_text("range", render_range(&range))
        })
        .collect())
}

pub fn from_signature_help(value: Value) -> Result<Vec<ResponseItem>, serde_json::Error> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let help: SignatureHelp = serde_json::from_value(value)?;
    let active_signature = help.active_signature.unwrap_or(0) as usize;

    Ok(help
        .signatures
        .into_iter()
        .enumerate()
        .map(|(index, signature)| {
            let active_parameter = signature.active_parameter.or(help.active_parameter);
            let selection = active_parameter.and_then(|p| parameter_text(&signature, p as usize));

            let mut out = ResponseItem::new()
                .with_bool("active", index == active_signature)
                .with_text("label", signature.label.clone());
            if let Some(selection) = selection {
                out.set_text("selection", selection);
            }
            if let Some(documentation) = signature.documentation {
                out.set_text("documentation", documentation_text(documentation));
            }
            out
        })
        .collect())
}

fn documentation_text(documentation: Documentation) -> String {
    match documentation {
        Documentation::String(s) => s,
        Documentation::MarkupContent(markup) => markup.value,
    }
}

/// Label of parameter `index`; offset labels index the signature label in
/// UTF-16 code units.
fn parameter_text(signature: &SignatureInformation, index: usize) -> Option<String> {
    let parameter = signature.parameters.as_ref()?.get(index)?;
    match &parameter.label {
        ParameterLabel::Simple(label) => Some(label.clone()),
        ParameterLabel::LabelOffsets([start, end]) => {
            let units: Vec<u16> = signature.label.encode_utf16().collect();
            let slice = units.get(*start as usize..*end as usize)?;
            Some(String::from_utf16_lossy(slice))
        }
    }
}
