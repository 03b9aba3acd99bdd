//! Typed stage identifiers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{self, Debug};
use std::marker::PhantomData;

/// Binds a stage name to its configuration type `C`.
///
/// A `StageType` is a process-wide constant declared next to the stage
/// configuration. The registry uses `C` to turn raw parameters into the
/// right configuration value without inspecting types at runtime.
///
/// # Examples
///
/// ```
/// use selfserve_core::{StageConfig, StageType};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct EmailStageConfig {
///     template_id: String,
/// }
///
/// impl StageConfig for EmailStageConfig {
///     const TYPE: StageType<Self> = StageType::new("emailValidation");
/// }
///
/// assert_eq!(EmailStageConfig::TYPE.name(), "emailValidation");
/// ```
pub struct StageType<C> {
    name: &'static str,
    _config: PhantomData<fn() -> C>,
}

impl<C> StageType<C> {
    /// Creates a stage type with the given unique name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _config: PhantomData,
        }
    }

    /// Returns the stage type name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<C> Clone for StageType<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for StageType<C> {}

impl<C> PartialEq for StageType<C> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<C> Eq for StageType<C> {}

impl<C> Debug for StageType<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StageType").field(&self.name).finish()
    }
}

impl<C> fmt::Display for StageType<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Configuration of one stage kind.
///
/// Configurations are immutable values owned by the process definition.
/// They round-trip through JSON so a process can be authored in code or
/// loaded from a file.
pub trait StageConfig: Serialize + DeserializeOwned + Send + Sync + Debug + 'static {
    /// The stage type this configuration belongs to.
    const TYPE: StageType<Self>;
}
