//! Process engine: runs a flow one request at a time.

use crate::registry::{ResolvedStage, StageRegistry};
use crate::snapshot::{
    ProcessFingerprint, Snapshot, SnapshotKeyRing, SnapshotTokenHandler, StatefulTokenHandler,
    StatelessTokenHandler,
};
use crate::storage::ProcessStore;
use selfserve_core::{
    ConfigurationError, ProcessContext, ProcessError, ProcessInstanceConfig, ProcessRequest,
    ProcessResponse, Requirements, StageError, StageResponse, StageTag, StorageType,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Executes a [`ProcessInstanceConfig`].
///
/// The engine holds no per-flow state: each call to
/// [`handle`](ProcessEngine::handle) restores the flow from the request
/// token, moves it forward and hands back a new token. Share one engine
/// across tasks behind an `Arc`.
///
/// The engine imposes no timeout of its own. Dropping the future returned by
/// `handle` cancels whatever stage is running.
pub struct ProcessEngine {
    stages: Vec<ResolvedStage>,
    fingerprint: ProcessFingerprint,
    tokens: Arc<dyn SnapshotTokenHandler>,
}

impl fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEngine")
            .field(
                "stages",
                &self.stages.iter().map(ResolvedStage::name).collect::<Vec<_>>(),
            )
            .field("fingerprint", &self.fingerprint)
            .field("tokens", &self.tokens)
            .finish()
    }
}

/// Where the current pass picks the flow up.
#[derive(Clone, Copy)]
enum Entry<'a> {
    /// The flow just reached this stage.
    Enter,
    /// The caller submitted input for this stage.
    Submit { token: &'a str, input: &'a Value },
}

/// What to do after a stage produced its response.
enum Step {
    Stay(Requirements),
    Next,
}

impl ProcessEngine {
    /// Creates a new engine builder for `config`.
    pub fn builder(config: ProcessInstanceConfig) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(config)
    }

    /// Returns the number of stages.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the stage type names in execution order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(ResolvedStage::name)
    }

    /// Returns the fingerprint stamped on issued tokens.
    pub fn fingerprint(&self) -> &ProcessFingerprint {
        &self.fingerprint
    }

    /// Handles one caller request.
    ///
    /// Without a token a new flow starts at the first stage. With a token the
    /// flow resumes where the token left it, provided the request carries the
    /// tag the token is waiting on.
    pub async fn handle(&self, request: ProcessRequest) -> Result<ProcessResponse, ProcessError> {
        let ProcessRequest {
            token,
            stage_tag,
            input,
        } = request;

        let Some(token) = token else {
            if stage_tag.is_some() {
                warn!("Rejected fresh request carrying stage tag {:?}", stage_tag);
                return Err(ProcessError::StageMismatch {
                    expected: None,
                    actual: stage_tag,
                });
            }
            let context = ProcessContext::new();
            info!("Starting process {}", context.correlation_id());
            return self.run(context, None, Entry::Enter).await;
        };

        let context = self.restore(&token).await?;
        if stage_tag.as_ref() != Some(context.stage_tag()) {
            warn!(
                "Process {} expected tag '{}', got {:?}",
                context.correlation_id(),
                context.stage_tag(),
                stage_tag
            );
            return Err(ProcessError::StageMismatch {
                expected: Some(context.stage_tag().clone()),
                actual: stage_tag,
            });
        }

        let loaded = Some(context.revision());
        self.run(
            context,
            loaded,
            Entry::Submit {
                token: &token,
                input: &input,
            },
        )
        .await
    }

    async fn restore(&self, token: &str) -> Result<ProcessContext, ProcessError> {
        let snapshot = self.tokens.restore(token).await.map_err(|e| {
            warn!("Rejected snapshot token: {}", e);
            e
        })?;

        if snapshot.fingerprint != self.fingerprint {
            warn!(
                "Process {} was started under a different configuration",
                snapshot.context.correlation_id()
            );
            return Err(ProcessError::TokenStale(
                "process configuration has changed".to_string(),
            ));
        }
        if snapshot.context.stage_index() >= self.stages.len() {
            return Err(ProcessError::TokenStale(format!(
                "stage {} does not exist",
                snapshot.context.stage_index()
            )));
        }
        Ok(snapshot.context)
    }

    /// Drives the flow forward until a stage needs the caller or the flow
    /// completes.
    async fn run(
        &self,
        mut context: ProcessContext,
        loaded: Option<u64>,
        mut entry: Entry<'_>,
    ) -> Result<ProcessResponse, ProcessError> {
        loop {
            let Some(stage) = self.stages.get(context.stage_index()) else {
                return self.complete(context, loaded).await;
            };

            let submitted = match entry {
                Entry::Submit { token, .. } => Some(token),
                Entry::Enter => None,
            };

            let outcome = match entry {
                Entry::Submit { input, .. } => {
                    stage
                        .stage()
                        .advance(stage.input(&context, input))
                        .await
                }
                Entry::Enter => match self.enter(stage, &mut context).await {
                    Ok(Some(requirements)) => {
                        return self.suspend(context, loaded, requirements).await;
                    }
                    Ok(None) => {
                        stage
                            .stage()
                            .advance(stage.input(&context, &Value::Null))
                            .await
                    }
                    Err(e) => Err(e),
                },
            };

            let response = match outcome {
                Ok(response) => response,
                Err(e) => return Err(self.stage_failure(stage, e, context, loaded, submitted).await),
            };

            match self.apply(stage, &mut context, response) {
                Step::Stay(requirements) => {
                    return self.suspend(context, loaded, requirements).await;
                }
                Step::Next => {
                    info!(
                        "Process {} completed stage '{}'",
                        context.correlation_id(),
                        stage.name()
                    );
                    let next_tag = self
                        .stages
                        .get(context.stage_index() + 1)
                        .map(|next| StageTag::new(next.name()))
                        .unwrap_or_default();
                    context.advance(next_tag);
                    entry = Entry::Enter;
                }
            }
        }
    }

    /// Prepares a stage the flow just reached.
    ///
    /// Returns the requirements to send back, or `None` if the stage should
    /// be evaluated right away with empty input.
    async fn enter(
        &self,
        stage: &ResolvedStage,
        context: &mut ProcessContext,
    ) -> Result<Option<Requirements>, StageError> {
        context.set_stage_tag(StageTag::new(stage.name()));
        debug!(
            "Process {} entering stage '{}'",
            context.correlation_id(),
            stage.name()
        );

        let requirements = stage
            .stage()
            .gather_initial_requirements(stage.input(context, &Value::Null))
            .await?;

        if !requirements.is_empty() || stage.is_interactive() {
            return Ok(Some(requirements));
        }
        debug!(
            "Auto-advancing stage '{}' of process {}",
            stage.name(),
            context.correlation_id()
        );
        Ok(None)
    }

    /// Merges the response into the context and decides whether to move on.
    fn apply(
        &self,
        stage: &ResolvedStage,
        context: &mut ProcessContext,
        response: StageResponse,
    ) -> Step {
        let (tag, requirements, state) = response.into_parts();
        context.merge_state(stage.scope(), state);

        if requirements.is_empty() {
            return Step::Next;
        }
        if let Some(tag) = tag.filter(|tag| !tag.is_empty()) {
            context.set_stage_tag(tag);
        }
        Step::Stay(requirements)
    }

    async fn suspend(
        &self,
        mut context: ProcessContext,
        loaded: Option<u64>,
        requirements: Requirements,
    ) -> Result<ProcessResponse, ProcessError> {
        let token = self.issue(&mut context, loaded).await?;
        debug!(
            "Process {} waiting on '{}'",
            context.correlation_id(),
            context.stage_tag()
        );
        Ok(ProcessResponse {
            token: Some(token),
            stage_tag: Some(context.stage_tag().clone()),
            requirements: (!requirements.is_empty()).then(|| requirements.into_value()),
        })
    }

    async fn complete(
        &self,
        context: ProcessContext,
        loaded: Option<u64>,
    ) -> Result<ProcessResponse, ProcessError> {
        let id = *context.correlation_id();
        let snapshot = Snapshot {
            context,
            fingerprint: self.fingerprint.clone(),
        };
        self.tokens.discard(&snapshot, loaded).await?;
        info!("Process {} completed", id);
        Ok(ProcessResponse::complete())
    }

    async fn issue(
        &self,
        context: &mut ProcessContext,
        loaded: Option<u64>,
    ) -> Result<String, ProcessError> {
        context.bump_revision();
        let snapshot = Snapshot {
            context: context.clone(),
            fingerprint: self.fingerprint.clone(),
        };
        self.tokens.issue(&snapshot, loaded).await
    }

    /// Converts a stage error, re-issuing a token at the failing position
    /// for validation errors.
    async fn stage_failure(
        &self,
        stage: &ResolvedStage,
        error: StageError,
        mut context: ProcessContext,
        loaded: Option<u64>,
        submitted: Option<&str>,
    ) -> ProcessError {
        match error {
            StageError::Validation(message) => {
                warn!(
                    "Stage '{}' of process {} rejected input: {}",
                    stage.name(),
                    context.correlation_id(),
                    message
                );
                let token = match submitted {
                    Some(token) => token.to_string(),
                    None => match self.issue(&mut context, loaded).await {
                        Ok(token) => token,
                        Err(e) => return e,
                    },
                };
                ProcessError::StageValidation {
                    stage: stage.name().to_string(),
                    message,
                    token,
                }
            }
            StageError::Failed(details) => {
                warn!(
                    "Stage '{}' of process {} failed: {}",
                    stage.name(),
                    context.correlation_id(),
                    details
                );
                ProcessError::StageFailed {
                    stage: stage.name().to_string(),
                    details,
                }
            }
        }
    }
}

/// Builder for [`ProcessEngine`].
#[derive(Debug)]
pub struct ProcessEngineBuilder {
    config: ProcessInstanceConfig,
    key_ring: Option<SnapshotKeyRing>,
    store: Option<Arc<dyn ProcessStore>>,
    token_handler: Option<Arc<dyn SnapshotTokenHandler>>,
}

impl ProcessEngineBuilder {
    /// Creates a builder for `config`.
    pub fn new(config: ProcessInstanceConfig) -> Self {
        Self {
            config,
            key_ring: None,
            store: None,
            token_handler: None,
        }
    }

    /// Sets the signing keys used under [`StorageType::Stateless`].
    pub fn key_ring(mut self, key_ring: SnapshotKeyRing) -> Self {
        self.key_ring = Some(key_ring);
        self
    }

    /// Sets the store used under [`StorageType::Stateful`].
    pub fn store(mut self, store: Arc<dyn ProcessStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the token handler chosen from the storage policy.
    pub fn token_handler(mut self, handler: Arc<dyn SnapshotTokenHandler>) -> Self {
        self.token_handler = Some(handler);
        self
    }

    /// Builds the engine, resolving every stage up front.
    ///
    /// # Errors
    ///
    /// Fails on an empty or unresolvable stage list, or when the storage
    /// policy lacks its key ring or store.
    pub fn build(self, registry: &StageRegistry) -> Result<ProcessEngine, ConfigurationError> {
        let stages = registry.resolve(&self.config)?;
        let fingerprint = ProcessFingerprint::of(&self.config);
        let lifetime = self.config.snapshot_token_config().token_lifetime();

        let tokens: Arc<dyn SnapshotTokenHandler> = match self.token_handler {
            Some(handler) => handler,
            None => match self.config.storage_type() {
                StorageType::Stateless => {
                    let keys = self.key_ring.ok_or(ConfigurationError::MissingKeyRing)?;
                    Arc::new(StatelessTokenHandler::new(keys, lifetime))
                }
                StorageType::Stateful => {
                    let store = self.store.ok_or(ConfigurationError::MissingStore)?;
                    Arc::new(StatefulTokenHandler::new(store, lifetime))
                }
            },
        };

        info!(
            "Built process engine with {} stages ({:?} storage)",
            stages.len(),
            self.config.storage_type()
        );
        Ok(ProcessEngine {
            stages,
            fingerprint,
            tokens,
        })
    }
}
