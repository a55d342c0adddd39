//! Edit requests and their preprocessing

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// One fact to write into the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub prompt: String,
    pub target_new: String,
}

impl EditRequest {
    pub fn new(prompt: impl Into<String>, target_new: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            target_new: target_new.into(),
        }
    }

    /// Copy with the target prefixed by one space, unless the target is
    /// empty or whitespace-only
    pub fn with_leading_space(&self) -> Self {
        let target_new = if self.target_new.trim().is_empty() {
            self.target_new.clone()
        } else {
            format!(" {}", self.target_new)
        };
        Self {
            prompt: self.prompt.clone(),
            target_new,
        }
    }

    /// Prompt and target as the model sees them during training
    pub fn full_text(&self) -> String {
        format!("{}{}", self.prompt, self.target_new)
    }
}

/// Deep-copy `requests` and apply the leading-space rule to each target
///
/// The caller's slice is left untouched.
pub fn prepare_requests(requests: &[EditRequest]) -> Vec<EditRequest> {
    requests.iter().map(EditRequest::with_leading_space).collect()
}

/// Read a JSON array of `{"prompt", "target_new"}` objects
pub fn load_requests(path: &Path) -> Result<Vec<EditRequest>> {
    let text = std::fs::read_to_string(path)?;
    let requests: Vec<EditRequest> = serde_json::from_str(&text)?;
    tracing::debug!("Loaded {} edit requests from {}", requests.len(), path.display());
    Ok(requests)
}
