//! Process definitions.

use crate::error::ConfigurationError;
use crate::stage_type::StageConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Default snapshot token lifetime, in seconds.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 300;

/// Where the process state lives between requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// The token carries the whole, signed process context.
    #[default]
    Stateless,
    /// The token is an opaque id into a process store.
    #[serde(alias = "local")]
    Stateful,
}

/// Snapshot token settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTokenConfig {
    #[serde(rename = "tokenLifeTimeInSeconds", default = "default_lifetime")]
    token_lifetime_secs: u64,
}

fn default_lifetime() -> u64 {
    DEFAULT_TOKEN_LIFETIME_SECS
}

impl Default for SnapshotTokenConfig {
    fn default() -> Self {
        Self {
            token_lifetime_secs: DEFAULT_TOKEN_LIFETIME_SECS,
        }
    }
}

impl SnapshotTokenConfig {
    /// Creates a config with the given token lifetime.
    ///
    /// Lifetimes are kept in whole seconds; a fractional second rounds up,
    /// so only [`Duration::ZERO`] yields tokens that are born expired.
    pub fn with_token_lifetime(lifetime: Duration) -> Self {
        let partial = u64::from(lifetime.subsec_nanos() > 0);
        Self {
            token_lifetime_secs: lifetime.as_secs().saturating_add(partial),
        }
    }

    /// Returns how long an issued token stays valid.
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Descriptor fields that share the JSON object with stage parameters.
const RESERVED_PARAMS: [&str; 2] = ["name", "interactive"];

/// One configured stage: its type name, the interactive flag and its
/// parameters.
///
/// In JSON the parameters sit next to the name:
/// `{"name": "emailValidation", "templateId": "reset"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    interactive: bool,
    #[serde(flatten)]
    params: Map<String, Value>,
}

impl StageDescriptor {
    /// Creates a descriptor from raw parameters.
    pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            interactive: false,
            params,
        }
    }

    /// Creates a descriptor from a typed configuration.
    ///
    /// # Errors
    ///
    /// The configuration must serialize to an object (or unit) and must not
    /// use the reserved `name` or `interactive` fields.
    pub fn from_config<C: StageConfig>(config: &C) -> Result<Self, ConfigurationError> {
        let name = C::TYPE.name();
        let params = match serde_json::to_value(config) {
            Ok(Value::Object(params)) => params,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                return Err(ConfigurationError::InvalidStageConfig {
                    stage_type: name.to_string(),
                    details: format!("expected an object, got {other}"),
                })
            }
            Err(e) => {
                return Err(ConfigurationError::InvalidStageConfig {
                    stage_type: name.to_string(),
                    details: e.to_string(),
                })
            }
        };
        let descriptor = Self::new(name, params);
        descriptor.check_params()?;
        Ok(descriptor)
    }

    fn check_params(&self) -> Result<(), ConfigurationError> {
        match RESERVED_PARAMS.iter().find(|key| self.params.contains_key(**key)) {
            Some(key) => Err(ConfigurationError::InvalidStageConfig {
                stage_type: self.name.clone(),
                details: format!("parameter '{key}' is reserved"),
            }),
            None => Ok(()),
        }
    }

    /// Marks the stage as always needing a caller round-trip, even when it
    /// has nothing to ask for up front.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Returns the stage type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if the engine must never auto-advance this stage.
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Returns the stage parameters.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }
}

/// The static definition of one self-service flow.
///
/// The stage order is the execution order. A config is never mutated once
/// built; changing the stage list means building a new config, which makes
/// tokens issued under the old one stale.
///
/// # Examples
///
/// ```
/// use selfserve_core::{ProcessInstanceConfig, StageConfig, StageType, StorageType};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct AuditConfig {}
///
/// impl StageConfig for AuditConfig {
///     const TYPE: StageType<Self> = StageType::new("audit");
/// }
///
/// let config = ProcessInstanceConfig::builder()
///     .stage(AuditConfig {})
///     .storage(StorageType::Stateless)
///     .build()?;
///
/// assert_eq!(config.stage_configs().len(), 1);
/// # Ok::<(), selfserve_core::ConfigurationError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstanceConfig {
    stage_configs: Vec<StageDescriptor>,
    #[serde(default, rename = "snapshotToken")]
    snapshot_token_config: SnapshotTokenConfig,
    #[serde(default, rename = "storage")]
    storage_type: StorageType,
}

impl ProcessInstanceConfig {
    /// Creates a new config builder.
    pub fn builder() -> ProcessInstanceConfigBuilder {
        ProcessInstanceConfigBuilder::default()
    }

    /// Returns the stages in execution order.
    pub fn stage_configs(&self) -> &[StageDescriptor] {
        &self.stage_configs
    }

    /// Returns the snapshot token settings.
    pub fn snapshot_token_config(&self) -> &SnapshotTokenConfig {
        &self.snapshot_token_config
    }

    /// Returns the storage policy.
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    /// Returns the ordered stage type names.
    pub fn stage_type_names(&self) -> impl Iterator<Item = &str> {
        self.stage_configs.iter().map(StageDescriptor::name)
    }

    /// Checks the structural invariants of a deserialized config.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.stage_configs.is_empty() {
            return Err(ConfigurationError::EmptyStages);
        }
        self.stage_configs
            .iter()
            .try_for_each(StageDescriptor::check_params)
    }
}

/// Builder for [`ProcessInstanceConfig`].
#[derive(Debug, Default)]
pub struct ProcessInstanceConfigBuilder {
    stages: Vec<StageDescriptor>,
    snapshot_token_config: SnapshotTokenConfig,
    storage_type: StorageType,
    error: Option<ConfigurationError>,
}

impl ProcessInstanceConfigBuilder {
    /// Appends a stage.
    pub fn stage<C: StageConfig>(self, config: C) -> Self {
        self.push(StageDescriptor::from_config(&config))
    }

    /// Appends a stage that always waits for the caller.
    pub fn interactive_stage<C: StageConfig>(self, config: C) -> Self {
        self.push(StageDescriptor::from_config(&config).map(|d| d.interactive(true)))
    }

    /// Appends a prepared descriptor.
    pub fn descriptor(self, descriptor: StageDescriptor) -> Self {
        self.push(Ok(descriptor))
    }

    fn push(mut self, descriptor: Result<StageDescriptor, ConfigurationError>) -> Self {
        match descriptor {
            Ok(descriptor) => self.stages.push(descriptor),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Sets the snapshot token settings.
    pub fn snapshot_token(mut self, config: SnapshotTokenConfig) -> Self {
        self.snapshot_token_config = config;
        self
    }

    /// Sets the storage policy.
    pub fn storage(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    /// Builds the config.
    ///
    /// # Errors
    ///
    /// Returns the first stage that failed to serialize, or
    /// [`ConfigurationError::EmptyStages`].
    pub fn build(self) -> Result<ProcessInstanceConfig, ConfigurationError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let config = ProcessInstanceConfig {
            stage_configs: self.stages,
            snapshot_token_config: self.snapshot_token_config,
            storage_type: self.storage_type,
        };
        config.validate()?;
        Ok(config)
    }
}
