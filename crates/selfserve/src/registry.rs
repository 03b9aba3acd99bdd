//! Stage type registry.

use selfserve_core::{
    stage_scope, ConfigurationError, ProcessContext, ProcessInstanceConfig, Stage, StageConfig,
    StageDescriptor, StageInput, StageType,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

type StageBuilder =
    Box<dyn Fn(&StageDescriptor) -> Result<Box<dyn Stage>, ConfigurationError> + Send + Sync>;

/// Maps stage type names to the stage implementations of a deployment.
///
/// Each registration captures the configuration type of its [`StageType`],
/// so resolving a descriptor deserializes its parameters straight into the
/// right type and hands them to the factory.
///
/// # Examples
///
/// ```
/// use selfserve::prelude::*;
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct AuditConfig {}
///
/// impl StageConfig for AuditConfig {
///     const TYPE: StageType<Self> = StageType::new("audit");
/// }
///
/// #[derive(Debug)]
/// struct AuditStage;
///
/// #[async_trait]
/// impl Stage for AuditStage {
///     async fn advance(&self, _input: StageInput<'_>) -> Result<StageResponse, StageError> {
///         Ok(StageResponse::builder().build())
///     }
/// }
///
/// let mut registry = StageRegistry::new();
/// registry.register(AuditConfig::TYPE, |_config: AuditConfig| AuditStage)?;
/// assert!(registry.contains("audit"));
/// # Ok::<(), ConfigurationError>(())
/// ```
#[derive(Default)]
pub struct StageRegistry {
    builders: HashMap<String, StageBuilder>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stage_types", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registers the factory building stages of `stage_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::DuplicateStageType`] if the name is
    /// already taken.
    pub fn register<C, S, F>(
        &mut self,
        stage_type: StageType<C>,
        factory: F,
    ) -> Result<&mut Self, ConfigurationError>
    where
        C: StageConfig,
        S: Stage + 'static,
        F: Fn(C) -> S + Send + Sync + 'static,
    {
        let name = stage_type.name();
        if self.builders.contains_key(name) {
            return Err(ConfigurationError::DuplicateStageType(name.to_string()));
        }

        let builder: StageBuilder = Box::new(move |descriptor: &StageDescriptor| {
            let config = decode_config::<C>(descriptor)?;
            Ok(Box::new(factory(config)) as Box<dyn Stage>)
        });
        self.builders.insert(name.to_string(), builder);
        Ok(self)
    }

    /// Returns `true` if a stage type with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Returns the number of registered stage types.
    pub fn len(&self) -> usize {
        self.builders.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Builds every stage of `config`, failing on the first descriptor that
    /// has no implementation or bad parameters.
    pub(crate) fn resolve(
        &self,
        config: &ProcessInstanceConfig,
    ) -> Result<Vec<ResolvedStage>, ConfigurationError> {
        config.validate()?;
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        config
            .stage_configs()
            .iter()
            .map(|descriptor| {
                let builder = self.builders.get(descriptor.name()).ok_or_else(|| {
                    ConfigurationError::UnknownStageType(descriptor.name().to_string())
                })?;
                let seen = occurrences.entry(descriptor.name()).or_insert(0);
                let scope = stage_scope(descriptor.name(), *seen);
                *seen += 1;
                Ok(ResolvedStage {
                    name: descriptor.name().to_string(),
                    scope,
                    interactive: descriptor.is_interactive(),
                    stage: builder(descriptor)?,
                })
            })
            .collect()
    }
}

fn decode_config<C: StageConfig>(descriptor: &StageDescriptor) -> Result<C, ConfigurationError> {
    let params = Value::Object(descriptor.params().clone());
    serde_json::from_value::<C>(params).or_else(|e| {
        // Unit-like configs serialize as null rather than an object.
        if descriptor.params().is_empty() {
            serde_json::from_value::<C>(Value::Null).map_err(|_| invalid(descriptor, e))
        } else {
            Err(invalid(descriptor, e))
        }
    })
}

fn invalid(descriptor: &StageDescriptor, e: serde_json::Error) -> ConfigurationError {
    ConfigurationError::InvalidStageConfig {
        stage_type: descriptor.name().to_string(),
        details: e.to_string(),
    }
}

/// A configured stage, ready to run.
#[derive(Debug)]
pub(crate) struct ResolvedStage {
    name: String,
    scope: String,
    interactive: bool,
    stage: Box<dyn Stage>,
}

impl ResolvedStage {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of this instance's private state.
    pub(crate) fn scope(&self) -> &str {
        &self.scope
    }

    pub(crate) fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub(crate) fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }

    /// Builds this instance's view over `context`.
    pub(crate) fn input<'a>(
        &'a self,
        context: &'a ProcessContext,
        input: &'a Value,
    ) -> StageInput<'a> {
        StageInput::new(&self.name, context, input).with_scope(&self.scope)
    }
}
