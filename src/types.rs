use serde::Serialize;
use std::fmt;

/// IDE feature a directive can trigger and assert on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Completion,
    Navigation,
    ParamInfo,
}

impl Feature {
    pub const ALL: [Feature; 3] = [Feature::Completion, Feature::Navigation, Feature::ParamInfo];

    /// Name used by fixtures (`completion.trigger()`, `assert paraminfo.items`).
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Completion => "completion",
            Feature::Navigation => "navigation",
            Feature::ParamInfo => "paraminfo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }

    /// LSP request issued when the feature is triggered.
    pub fn method(self) -> &'static str {
        match self {
            Feature::Completion => "textDocument/completion",
            Feature::Navigation => "textDocument/definition",
            Feature::ParamInfo => "textDocument/signatureHelp",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in a fixture a directive lives. All fields are one-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepLocation {
    /// Index of the marker within the fixture.
    pub marker: usize,
    /// Line of the `^` caret.
    pub marker_line: usize,
    /// Index of the step within its marker.
    pub step: usize,
    pub directive_line: usize,
}

impl fmt::Display for StepLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "marker {} (line {}), step {}, directive at line {}",
            self.marker, self.marker_line, self.step, self.directive_line
        )
    }
}
