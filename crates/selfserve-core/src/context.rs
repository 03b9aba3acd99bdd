//! In-flight state of one process instance.

use crate::stage::StageTag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Where a state entry lives.
///
/// Scoped keys belong to the stage that wrote them and are stored as
/// `"<scope>.<key>"`, where the scope comes from [`stage_scope`]. Shared keys are stored verbatim and may be
/// overwritten by any stage that writes them explicitly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateKey {
    /// Key private to the writing stage.
    Scoped(String),
    /// Key visible to and writable by every stage.
    Shared(String),
}

impl StateKey {
    /// Returns the key as stored in the process state.
    pub fn qualify(&self, scope: &str) -> String {
        match self {
            StateKey::Scoped(key) => scoped_key(scope, key),
            StateKey::Shared(key) => key.clone(),
        }
    }
}

/// Builds the stored form of a stage-scoped key.
pub fn scoped_key(scope: &str, key: &str) -> String {
    format!("{scope}.{key}")
}

/// Returns the state scope of a stage instance.
///
/// `occurrence` counts earlier stages of the same type in the flow. The
/// first instance is scoped by its type name alone; later ones get a `#n`
/// suffix so that two instances of one type never share private keys.
///
/// ```
/// use selfserve_core::stage_scope;
///
/// assert_eq!(stage_scope("mail", 0), "mail");
/// assert_eq!(stage_scope("mail", 1), "mail#2");
/// ```
pub fn stage_scope(stage_type: &str, occurrence: usize) -> String {
    match occurrence {
        0 => stage_type.to_string(),
        n => format!("{stage_type}#{}", n + 1),
    }
}

/// The state of one in-progress flow.
///
/// It exists in memory only while a request is processed; between requests
/// it travels inside a snapshot token or sits in a process store.
///
/// # Examples
///
/// ```
/// use selfserve_core::{ProcessContext, StateKey};
///
/// let mut ctx = ProcessContext::new();
/// assert_eq!(ctx.stage_index(), 0);
///
/// ctx.merge_state("emailValidation", [(StateKey::Scoped("sent".into()), "true".into())]);
/// ctx.merge_state("emailValidation", [(StateKey::Shared("mail".into()), "a@b.c".into())]);
///
/// assert_eq!(ctx.get("emailValidation.sent"), Some("true"));
/// assert_eq!(ctx.get("mail"), Some("a@b.c"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessContext {
    correlation_id: CorrelationId,
    stage_index: usize,
    #[serde(default)]
    stage_tag: StageTag,
    #[serde(default)]
    state: BTreeMap<String, String>,
    #[serde(default)]
    revision: u64,
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessContext {
    /// Creates the context of a fresh flow: first stage, no state.
    pub fn new() -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            stage_index: 0,
            stage_tag: StageTag::default(),
            state: BTreeMap::new(),
            revision: 0,
        }
    }

    /// Returns the flow identifier.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Returns the position of the current stage.
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Returns the tag the flow is waiting on.
    pub fn stage_tag(&self) -> &StageTag {
        &self.stage_tag
    }

    /// Returns the accumulated state.
    pub fn state(&self) -> &BTreeMap<String, String> {
        &self.state
    }

    /// Returns a state value by its stored key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.state.get(key).map(String::as_str)
    }

    /// Returns how many times this flow has been persisted.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Records the tag the flow now waits on.
    pub fn set_stage_tag(&mut self, tag: StageTag) {
        self.stage_tag = tag;
    }

    /// Moves to the next stage. Positions never decrease.
    pub fn advance(&mut self, next_tag: StageTag) {
        self.stage_index += 1;
        self.stage_tag = next_tag;
    }

    /// Merges entries produced by the stage owning `scope` into the state.
    pub fn merge_state<I>(&mut self, scope: &str, entries: I)
    where
        I: IntoIterator<Item = (StateKey, String)>,
    {
        for (key, value) in entries {
            self.state.insert(key.qualify(scope), value);
        }
    }

    /// Increments the revision ahead of a write.
    pub fn bump_revision(&mut self) {
        self.revision += 1;
    }
}
