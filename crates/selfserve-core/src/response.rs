//! Stage responses and caller requirements.

use crate::context::StateKey;
use crate::stage::StageTag;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Description of the input a stage still needs from the caller.
///
/// `null`, `{}` and `[]` all count as "nothing required".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Requirements(Value);

impl Requirements {
    /// Creates empty requirements.
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    /// Wraps an arbitrary JSON description.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Starts a JSON-schema style description of an object input.
    pub fn builder(description: impl Into<String>) -> RequirementsBuilder {
        RequirementsBuilder::new(description)
    }

    /// Returns `true` when nothing is required.
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Returns the JSON description.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the requirements, returning the JSON description.
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Builder for schema-shaped [`Requirements`].
///
/// # Examples
///
/// ```
/// use selfserve_core::Requirements;
///
/// let requirements = Requirements::builder("Verify your email address")
///     .required("code", "string", "Code sent by email")
///     .optional("resend", "boolean", "Send a new code")
///     .build();
///
/// let schema = requirements.as_value();
/// assert_eq!(schema["required"], serde_json::json!(["code"]));
/// assert_eq!(schema["properties"]["resend"]["type"], "boolean");
/// ```
#[derive(Debug, Clone)]
pub struct RequirementsBuilder {
    description: String,
    required: Vec<String>,
    properties: Map<String, Value>,
}

impl RequirementsBuilder {
    fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            required: Vec::new(),
            properties: Map::new(),
        }
    }

    /// Adds a field the caller must submit.
    pub fn required(mut self, name: &str, kind: &str, description: &str) -> Self {
        self.required.push(name.to_string());
        self.optional(name, kind, description)
    }

    /// Adds a field the caller may submit.
    pub fn optional(mut self, name: &str, kind: &str, description: &str) -> Self {
        self.properties.insert(
            name.to_string(),
            json!({ "type": kind, "description": description }),
        );
        self
    }

    /// Builds the requirements.
    pub fn build(self) -> Requirements {
        Requirements(json!({
            "$schema": "http://json-schema.org/draft-04/schema#",
            "description": self.description,
            "type": "object",
            "required": self.required,
            "properties": self.properties,
        }))
    }
}

/// What a stage returns after evaluating caller input.
///
/// A response without requirements tells the engine the stage is complete.
/// Build one with [`StageResponse::builder`]; every field has a default, so a
/// bare `StageResponse::builder().build()` is a valid "done, nothing to
/// record" response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageResponse {
    stage_tag: Option<StageTag>,
    requirements: Requirements,
    state: BTreeMap<StateKey, String>,
}

impl StageResponse {
    /// Starts a new response.
    pub fn builder() -> StageResponseBuilder {
        StageResponseBuilder::default()
    }

    /// Returns the tag set by the stage, if any.
    pub fn stage_tag(&self) -> Option<&StageTag> {
        self.stage_tag.as_ref()
    }

    /// Returns `true` iff the requirements are non-empty.
    pub fn has_requirements(&self) -> bool {
        !self.requirements.is_empty()
    }

    /// Returns the requirements.
    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    /// Returns the state entries to merge into the process.
    pub fn state(&self) -> &BTreeMap<StateKey, String> {
        &self.state
    }

    /// Splits the response into tag, requirements and state.
    pub fn into_parts(self) -> (Option<StageTag>, Requirements, BTreeMap<StateKey, String>) {
        (self.stage_tag, self.requirements, self.state)
    }
}

/// Builder for [`StageResponse`].
#[derive(Debug, Clone, Default)]
pub struct StageResponseBuilder {
    stage_tag: Option<StageTag>,
    requirements: Requirements,
    state: BTreeMap<StateKey, String>,
}

impl StageResponseBuilder {
    /// Sets the tag the caller must echo on the next submission.
    pub fn stage_tag(mut self, tag: impl Into<StageTag>) -> Self {
        self.stage_tag = Some(tag.into());
        self
    }

    /// Sets the requirements.
    pub fn requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Records a value private to this stage.
    pub fn add_state(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.insert(StateKey::Scoped(key.into()), value.into());
        self
    }

    /// Records a value other stages read, replacing any previous value.
    pub fn add_shared_state(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.insert(StateKey::Shared(key.into()), value.into());
        self
    }

    /// Builds the response.
    pub fn build(self) -> StageResponse {
        StageResponse {
            stage_tag: self.stage_tag,
            requirements: self.requirements,
            state: self.state,
        }
    }
}
