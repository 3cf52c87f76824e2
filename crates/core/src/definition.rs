//! Job and pipeline definitions as seen by the tracker.
//!
//! The tracker only cares that a definition exists under a path and what to
//! hand to the runner; the script itself is opaque here.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::JobPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    /// Freestyle job: the script is a plain shell build step list.
    Job,
    /// Pipeline: the script is a pipeline DSL document.
    Pipeline,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionKind::Job => f.write_str("job"),
            DefinitionKind::Pipeline => f.write_str("pipeline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    pub path: JobPath,
    pub kind: DefinitionKind,
    pub description: Option<String>,
    /// Opaque to the tracker; the runner interprets it.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub disabled: bool,
}

impl Definition {
    pub fn new(path: JobPath, kind: DefinitionKind, script: impl Into<String>) -> Self {
        Self {
            path,
            kind,
            description: None,
            script: script.into(),
            disabled: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}
