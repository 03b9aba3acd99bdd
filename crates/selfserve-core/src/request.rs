//! Request and response shapes at the process boundary.

use crate::stage::StageTag;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A caller request: `{ token, stageTag, input }`.
///
/// A request without a token starts a fresh flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    /// Snapshot token from the previous response.
    #[serde(default)]
    pub token: Option<String>,
    /// Tag from the previous response.
    #[serde(default)]
    pub stage_tag: Option<StageTag>,
    /// Caller-submitted input.
    #[serde(default)]
    pub input: Value,
}

impl ProcessRequest {
    /// Creates a request that starts a new flow.
    pub fn start() -> Self {
        Self::default()
    }

    /// Creates a request that continues a flow.
    pub fn submit(token: impl Into<String>, stage_tag: impl Into<StageTag>, input: Value) -> Self {
        Self {
            token: Some(token.into()),
            stage_tag: Some(stage_tag.into()),
            input,
        }
    }

    /// Creates a continuation request from a previous response.
    ///
    /// Returns `None` when the response completed the flow.
    pub fn follow(response: &ProcessResponse, input: Value) -> Option<Self> {
        let token = response.token.clone()?;
        Some(Self {
            token: Some(token),
            stage_tag: response.stage_tag.clone(),
            input,
        })
    }
}

/// The engine's answer: `{ token, stageTag, requirements }`.
///
/// A `None` token means the flow is complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    /// Token to send with the next request.
    pub token: Option<String>,
    /// Tag to echo with the next request.
    pub stage_tag: Option<StageTag>,
    /// What the caller must submit next.
    pub requirements: Option<Value>,
}

impl ProcessResponse {
    /// The response that ends a flow.
    pub fn complete() -> Self {
        Self::default()
    }

    /// Returns `true` once the flow has finished.
    pub fn is_complete(&self) -> bool {
        self.token.is_none()
    }
}
