//! Sub-environments (containers) discovered inside a workspace

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label carrying the host folder a dev container was created from
pub const WORKSPACE_DIRECTORY_LABEL: &str = "devcontainer.local_folder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEnvironment {
    pub id: String,
    pub friendly_name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl SubEnvironment {
    pub fn new(id: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            friendly_name: friendly_name.into(),
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Value of `label`, if present and non-empty
    ///
    /// Only sub-environments with a non-empty workspace directory label are
    /// eligible for agent injection.
    pub fn label_value(&self, label: &str) -> Option<&str> {
        self.labels
            .get(label)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn workspace_directory(&self) -> Option<&str> {
        self.label_value(WORKSPACE_DIRECTORY_LABEL)
    }
}
