//! Executes a parsed script against one backend session.
//!
//! Markers run in file order and the cursor is re-seeked to each marker
//! before its first step. Execution stops at the first directive that does
//! not succeed, since the backend state after it is unverified.

use crate::assertion::ResponseItem;
use crate::error::{BestEffort, ProbeError};
use crate::report::StepResult;
use crate::script::{Directive, DirectiveLine, Marker, ProbeScript};
use crate::session::backend::Backend;
use crate::session::document::Document;
use crate::types::{Feature, StepLocation};
use std::time::Duration;
use tower_lsp::lsp_types::Position;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct DriverOptions {
    pub ready_timeout: Duration,
    pub max_reported_items: usize,
}

pub struct SessionDriver<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
    document: Document,
    opened: bool,
    cursor: Position,
    /// Items from the last trigger in the current step.
    results: Option<(Feature, Vec<ResponseItem>)>,
    options: DriverOptions,
}

impl<'a, B: Backend + ?Sized> SessionDriver<'a, B> {
    pub fn new(backend: &'a mut B, document: Document, options: DriverOptions) -> Self {
        Self {
            backend,
            document,
            opened: false,
            cursor: Position::default(),
            results: None,
            options,
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Runs every directive in order. The last entry is the first
    /// non-success, if any.
    pub async fn execute(&mut self, script: &ProbeScript) -> Vec<Result<StepResult, ProbeError>> {
        let mut results = Vec::with_capacity(script.directive_count());

        if !self.opened {
            if let Err(e) = self.backend.open(&self.document).await {
                results.push(Err(e));
                return results;
            }
            self.opened = true;
        }

        for (marker_index, marker) in script.markers.iter().enumerate() {
            self.cursor = marker.position;
            debug!(
                marker = marker_index + 1,
                line = marker.line,
                position = ?marker.position,
                "Seeking marker"
            );

            for (step_index, step) in marker.steps.iter().enumerate() {
                self.results = None;
                for entry in &step.directives {
                    let location = StepLocation {
                        marker: marker_index + 1,
                        marker_line: marker.line,
                        step: step_index + 1,
                        directive_line: entry.line,
                    };
                    let mut result = self.run_directive(marker, entry, location).await;
                    if let Ok(StepResult::Failure(failure)) = &mut result {
                        failure.notes = step.notes.clone();
                    }
                    let succeeded = matches!(result, Ok(StepResult::Success));
                    results.push(result);
                    if !succeeded {
                        info!(at = %location, "Stopping fixture");
                        return results;
                    }
                }
            }
        }
        results
    }

    async fn run_directive(
        &mut self,
        marker: &Marker,
        entry: &DirectiveLine,
        location: StepLocation,
    ) -> Result<StepResult, ProbeError> {
        debug!(line = entry.line, "{}", entry.directive);
        let uri = self.document.uri.clone();

        match &entry.directive {
            Directive::WaitForReady => {
                self.backend
                    .wait_for_ready(&uri, self.document.version(), self.options.ready_timeout)
                    .await?;
            }
            Directive::TypeText(text) => {
                let (change, cursor) = self
                    .document
                    .type_line(marker.anchor_line, text)
                    .map_err(|e| ProbeError::parse(entry.line, e.to_string()))?;
                self.backend.change(&self.document, &change).await?;
                self.cursor = cursor;
            }
            Directive::DeleteLine => {
                let change = self
                    .document
                    .delete_typed_line()
                    .map_err(|e| ProbeError::parse(entry.line, e.to_string()))?;
                self.backend.change(&self.document, &change).await?;
                self.cursor = marker.position;
            }
            Directive::Trigger(feature) => {
                let items = self.backend.request(*feature, &uri, self.cursor).await?;
                self.results = Some((*feature, items));
            }
            Directive::Assert(predicate) => {
                let items = match &self.results {
                    Some((feature, items)) if *feature == predicate.feature => items,
                    _ => {
                        return Err(ProbeError::parse(
                            entry.line,
                            format!("assert on {} without a preceding trigger", predicate.feature),
                        ))
                    }
                };
                if let Err(failure) = predicate.evaluate(items, location, self.options.max_reported_items) {
                    return Ok(StepResult::Failure(failure));
                }
            }
            Directive::Unsupported { keyword } => {
                return Err(ProbeError::UnsupportedDirective {
                    line: entry.line,
                    keyword: keyword.clone(),
                });
            }
        }
        Ok(StepResult::Success)
    }

    /// Closes the document if it was opened. Errors are logged, not returned.
    pub async fn close(&mut self) {
        if !self.opened {
            return;
        }
        self.opened = false;
        let uri = self.document.uri.clone();
        self.backend.close(&uri).await.best_effort("close document");
    }
}
