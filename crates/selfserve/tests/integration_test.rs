use async_trait::async_trait;
use selfserve::prelude::*;
use selfserve::{SnapshotTokenConfig, StageTag};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio_test::assert_ok;

#[derive(Debug, Serialize, Deserialize)]
struct StageXConfig {}

impl StageConfig for StageXConfig {
    const TYPE: StageType<Self> = StageType::new("stageX");
}

/// Needs nothing from the caller.
#[derive(Debug)]
struct StageX {
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl Stage for StageX {
    async fn advance(&self, _input: StageInput<'_>) -> Result<StageResponse, StageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(StageResponse::builder()
            .add_state("visited", "true")
            .add_shared_state("user", "alice")
            .build())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageYConfig {
    expected_code: String,
}

impl StageConfig for StageYConfig {
    const TYPE: StageType<Self> = StageType::new("stageY");
}

/// Asks for a code and checks it.
#[derive(Debug)]
struct StageY {
    expected_code: String,
}

fn code_requirements() -> Requirements {
    Requirements::builder("Verification code")
        .required("code", "string", "The code we sent you")
        .build()
}

#[async_trait]
impl Stage for StageY {
    async fn gather_initial_requirements(
        &self,
        input: StageInput<'_>,
    ) -> Result<Requirements, StageError> {
        if input.shared("user").is_none() {
            return Err(StageError::failed("no user selected"));
        }
        Ok(code_requirements())
    }

    async fn advance(&self, input: StageInput<'_>) -> Result<StageResponse, StageError> {
        let Some(code) = input.input_str("code") else {
            return Ok(StageResponse::builder()
                .requirements(code_requirements())
                .build());
        };
        if code != self.expected_code {
            return Err(StageError::validation("wrong code"));
        }
        let visited = input.scoped_of("stageX", "visited").unwrap_or("false");
        Ok(StageResponse::builder()
            .add_state("verified", visited)
            .build())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EmailConfig {}

impl StageConfig for EmailConfig {
    const TYPE: StageType<Self> = StageType::new("emailValidation");
}

/// Collects a mail address, then switches to a `validateCode` sub-step.
#[derive(Debug)]
struct EmailStage;

#[async_trait]
impl Stage for EmailStage {
    async fn gather_initial_requirements(
        &self,
        _input: StageInput<'_>,
    ) -> Result<Requirements, StageError> {
        Ok(Requirements::builder("Mail address")
            .required("mail", "string", "Where to send the code")
            .build())
    }

    async fn advance(&self, input: StageInput<'_>) -> Result<StageResponse, StageError> {
        if input.stage_tag().as_str() == "validateCode" {
            return match input.input_str("code") {
                Some(code) if Some(code) == input.scoped("code") => {
                    Ok(StageResponse::builder().build())
                }
                _ => Err(StageError::validation("code does not match")),
            };
        }

        let mail = input
            .input_str("mail")
            .ok_or_else(|| StageError::validation("mail is required"))?;
        Ok(StageResponse::builder()
            .stage_tag("validateCode")
            .requirements(code_requirements())
            .add_state("code", "0000")
            .add_shared_state("mail", mail)
            .build())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MailConfig {
    label: String,
}

impl StageConfig for MailConfig {
    const TYPE: StageType<Self> = StageType::new("mail");
}

/// Asks for confirmation until it has recorded its own `sent` flag.
#[derive(Debug)]
struct MailStage {
    label: String,
}

#[async_trait]
impl Stage for MailStage {
    async fn gather_initial_requirements(
        &self,
        input: StageInput<'_>,
    ) -> Result<Requirements, StageError> {
        if input.scoped("sent").is_some() {
            return Ok(Requirements::empty());
        }
        Ok(Requirements::builder("Confirm mail")
            .required("ok", "boolean", "Mail received")
            .build())
    }

    async fn advance(&self, input: StageInput<'_>) -> Result<StageResponse, StageError> {
        let previous = input.scoped_of("mail", "sent").unwrap_or("none");
        Ok(StageResponse::builder()
            .add_state("sent", self.label.as_str())
            .add_shared_state(format!("seen.{}", self.label), previous)
            .build())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GateConfig {}

impl StageConfig for GateConfig {
    const TYPE: StageType<Self> = StageType::new("gate");
}

/// Holds every submission until `barrier` releases them together.
#[derive(Debug)]
struct GateStage {
    barrier: Arc<Barrier>,
}

#[async_trait]
impl Stage for GateStage {
    async fn gather_initial_requirements(
        &self,
        _input: StageInput<'_>,
    ) -> Result<Requirements, StageError> {
        Ok(Requirements::builder("Confirm")
            .required("go", "boolean", "Continue")
            .build())
    }

    async fn advance(&self, _input: StageInput<'_>) -> Result<StageResponse, StageError> {
        self.barrier.wait().await;
        Ok(StageResponse::builder().add_state("passed", "true").build())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HangConfig {}

impl StageConfig for HangConfig {
    const TYPE: StageType<Self> = StageType::new("hang");
}

#[derive(Debug)]
struct HangStage;

#[async_trait]
impl Stage for HangStage {
    async fn advance(&self, _input: StageInput<'_>) -> Result<StageResponse, StageError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(StageResponse::builder().build())
    }
}

fn registry(runs: Arc<AtomicU32>, barrier: Arc<Barrier>) -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry
        .register(StageXConfig::TYPE, move |_: StageXConfig| StageX {
            runs: runs.clone(),
        })
        .expect("unique")
        .register(StageYConfig::TYPE, |config: StageYConfig| StageY {
            expected_code: config.expected_code,
        })
        .expect("unique")
        .register(EmailConfig::TYPE, |_: EmailConfig| EmailStage)
        .expect("unique")
        .register(GateConfig::TYPE, move |_: GateConfig| GateStage {
            barrier: barrier.clone(),
        })
        .expect("unique")
        .register(HangConfig::TYPE, |_: HangConfig| HangStage)
        .expect("unique")
        .register(MailConfig::TYPE, |config: MailConfig| MailStage {
            label: config.label,
        })
        .expect("unique");
    registry
}

fn default_registry() -> StageRegistry {
    registry(Arc::new(AtomicU32::new(0)), Arc::new(Barrier::new(2)))
}

fn key_ring() -> SnapshotKeyRing {
    SnapshotKeyRing::new(SigningKey::new("primary", vec![42; 32]).expect("valid key"))
}

fn x_then_y() -> ProcessInstanceConfig {
    ProcessInstanceConfig::builder()
        .stage(StageXConfig {})
        .stage(StageYConfig {
            expected_code: "1234".into(),
        })
        .build()
        .expect("valid config")
}

fn stateless_engine(config: ProcessInstanceConfig, registry: &StageRegistry) -> ProcessEngine {
    ProcessEngine::builder(config)
        .key_ring(key_ring())
        .build(registry)
        .expect("valid engine")
}

#[tokio::test]
async fn test_auto_advance_then_code_entry() {
    let runs = Arc::new(AtomicU32::new(0));
    let registry = registry(runs.clone(), Arc::new(Barrier::new(2)));
    let engine = stateless_engine(x_then_y(), &registry);

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    assert_eq!(first.stage_tag, Some(StageTag::new("stageY")));
    assert!(first.token.is_some());
    let requirements = first.requirements.clone().expect("requirements");
    assert_eq!(requirements["required"], json!(["code"]));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let next = ProcessRequest::follow(&first, json!({ "code": "1234" })).expect("in flight");
    let done = assert_ok!(engine.handle(next).await);
    assert!(done.is_complete());
    assert_eq!(done, ProcessResponse::complete());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stage_keeps_requirements_until_satisfied() {
    let engine = stateless_engine(x_then_y(), &default_registry());

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    let again = ProcessRequest::follow(&first, json!({})).expect("in flight");
    let second = assert_ok!(engine.handle(again).await);

    assert_eq!(second.stage_tag, first.stage_tag);
    assert_eq!(second.requirements, first.requirements);
    assert_ne!(second.token, first.token);
}

#[tokio::test]
async fn test_resubmitting_a_token_is_repeatable() {
    let engine = stateless_engine(x_then_y(), &default_registry());
    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);

    let request = ProcessRequest::follow(&first, json!({})).expect("in flight");
    let a = assert_ok!(engine.handle(request.clone()).await);
    let b = assert_ok!(engine.handle(request).await);
    assert_eq!(a.stage_tag, b.stage_tag);
    assert_eq!(a.requirements, b.requirements);

    let finish = ProcessRequest::follow(&first, json!({ "code": "1234" })).expect("in flight");
    assert!(assert_ok!(engine.handle(finish.clone()).await).is_complete());
    assert!(assert_ok!(engine.handle(finish).await).is_complete());
}

#[tokio::test]
async fn test_stage_tag_must_match_token() {
    let engine = stateless_engine(x_then_y(), &default_registry());
    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    let token = first.token.clone().expect("token");

    let wrong = ProcessRequest::submit(token.clone(), "stageX", json!({ "code": "1234" }));
    let error = engine.handle(wrong).await.expect_err("mismatch");
    assert!(matches!(
        error,
        ProcessError::StageMismatch { expected: Some(ref tag), actual: Some(_) } if tag.as_str() == "stageY"
    ));
    assert_eq!(error.recovery(), selfserve::Recovery::RetrySameStage);

    let missing = ProcessRequest {
        token: Some(token),
        stage_tag: None,
        input: json!({ "code": "1234" }),
    };
    let error = engine.handle(missing).await.expect_err("mismatch");
    assert!(matches!(
        error,
        ProcessError::StageMismatch { actual: None, .. }
    ));
}

#[tokio::test]
async fn test_validation_error_returns_retry_token() {
    let engine = stateless_engine(x_then_y(), &default_registry());
    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);

    let wrong = ProcessRequest::follow(&first, json!({ "code": "9999" })).expect("in flight");
    let error = engine.handle(wrong).await.expect_err("wrong code");
    let token = match error {
        ProcessError::StageValidation {
            ref stage,
            ref message,
            ref token,
        } => {
            assert_eq!(stage, "stageY");
            assert_eq!(message, "wrong code");
            token.clone()
        }
        other => panic!("expected validation error, got {other:?}"),
    };
    assert_eq!(Some(&token), first.token.as_ref());

    let retry = ProcessRequest::submit(token, "stageY", json!({ "code": "1234" }));
    assert!(assert_ok!(engine.handle(retry).await).is_complete());
}

#[tokio::test]
async fn test_repeated_stage_type_keeps_private_state_apart() {
    let config = ProcessInstanceConfig::builder()
        .stage(MailConfig {
            label: "first".into(),
        })
        .stage(MailConfig {
            label: "second".into(),
        })
        .build()
        .expect("valid config");
    let engine = stateless_engine(config, &default_registry());

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    assert_eq!(first.stage_tag, Some(StageTag::new("mail")));
    assert!(first.requirements.is_some());

    let confirm = ProcessRequest::follow(&first, json!({ "ok": true })).expect("in flight");
    let second = assert_ok!(engine.handle(confirm).await);
    assert!(!second.is_complete());
    assert_eq!(second.stage_tag, Some(StageTag::new("mail")));
    assert!(second.requirements.is_some());
    assert_ne!(second.token, first.token);

    let confirm = ProcessRequest::follow(&second, json!({ "ok": true })).expect("in flight");
    assert!(assert_ok!(engine.handle(confirm).await).is_complete());
}

#[tokio::test]
async fn test_custom_tag_sub_step() {
    let config = ProcessInstanceConfig::builder()
        .stage(EmailConfig {})
        .build()
        .expect("valid config");
    let engine = stateless_engine(config, &default_registry());

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    assert_eq!(first.stage_tag, Some(StageTag::new("emailValidation")));

    let mail = ProcessRequest::follow(&first, json!({ "mail": "alice@example.com" }))
        .expect("in flight");
    let second = assert_ok!(engine.handle(mail).await);
    assert_eq!(second.stage_tag, Some(StageTag::new("validateCode")));

    let bad = ProcessRequest::follow(&second, json!({ "code": "1111" })).expect("in flight");
    assert!(matches!(
        engine.handle(bad).await,
        Err(ProcessError::StageValidation { .. })
    ));

    let good = ProcessRequest::follow(&second, json!({ "code": "0000" })).expect("in flight");
    assert!(assert_ok!(engine.handle(good).await).is_complete());
}

#[tokio::test]
async fn test_interactive_stage_waits_for_caller() {
    let runs = Arc::new(AtomicU32::new(0));
    let registry = registry(runs.clone(), Arc::new(Barrier::new(2)));
    let config = ProcessInstanceConfig::builder()
        .interactive_stage(StageXConfig {})
        .stage(StageYConfig {
            expected_code: "1234".into(),
        })
        .build()
        .expect("valid config");
    let engine = stateless_engine(config, &registry);

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    assert_eq!(first.stage_tag, Some(StageTag::new("stageX")));
    assert_eq!(first.requirements, None);
    assert!(!first.is_complete());
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let confirm = ProcessRequest::follow(&first, json!({})).expect("in flight");
    let second = assert_ok!(engine.handle(confirm).await);
    assert_eq!(second.stage_tag, Some(StageTag::new("stageY")));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_config_change_makes_tokens_stale() {
    let registry = default_registry();
    let before = stateless_engine(x_then_y(), &registry);
    let first = assert_ok!(before.handle(ProcessRequest::start()).await);

    let extended = ProcessInstanceConfig::builder()
        .stage(StageXConfig {})
        .stage(StageYConfig {
            expected_code: "1234".into(),
        })
        .stage(EmailConfig {})
        .build()
        .expect("valid config");
    let after = stateless_engine(extended, &registry);
    assert_ne!(before.fingerprint(), after.fingerprint());

    let request = ProcessRequest::follow(&first, json!({ "code": "1234" })).expect("in flight");
    let error = after.handle(request).await.expect_err("stale");
    assert!(matches!(error, ProcessError::TokenStale(_)));
    assert_eq!(error.recovery(), selfserve::Recovery::RestartFlow);
}

#[tokio::test]
async fn test_expired_token() {
    let config = ProcessInstanceConfig::builder()
        .stage(StageXConfig {})
        .stage(StageYConfig {
            expected_code: "1234".into(),
        })
        .snapshot_token(SnapshotTokenConfig::with_token_lifetime(Duration::ZERO))
        .build()
        .expect("valid config");
    let engine = stateless_engine(config, &default_registry());

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    let request = ProcessRequest::follow(&first, json!({ "code": "1234" })).expect("in flight");
    assert!(matches!(
        engine.handle(request).await,
        Err(ProcessError::TokenExpired)
    ));
}

#[tokio::test]
async fn test_tampered_token() {
    let engine = stateless_engine(x_then_y(), &default_registry());
    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    let mut token = first.token.clone().expect("token");
    token.push('A');

    let request = ProcessRequest::submit(token, "stageY", json!({ "code": "1234" }));
    assert!(matches!(
        engine.handle(request).await,
        Err(ProcessError::TokenInvalid(_))
    ));
}

#[tokio::test]
async fn test_key_rotation_keeps_flows_alive() {
    let registry = default_registry();
    let before = stateless_engine(x_then_y(), &registry);
    let first = assert_ok!(before.handle(ProcessRequest::start()).await);

    let rotated = key_ring()
        .rotate(SigningKey::generate("secondary").expect("valid key"))
        .expect("unique ids");
    let after = ProcessEngine::builder(x_then_y())
        .key_ring(rotated)
        .build(&registry)
        .expect("valid engine");

    let request = ProcessRequest::follow(&first, json!({ "code": "1234" })).expect("in flight");
    assert!(assert_ok!(after.handle(request).await).is_complete());
}

#[tokio::test]
async fn test_config_from_json() {
    let config: ProcessInstanceConfig = serde_json::from_value(json!({
        "stageConfigs": [
            { "name": "stageX" },
            { "name": "stageY", "expectedCode": "4321" }
        ],
        "snapshotToken": { "tokenLifeTimeInSeconds": 60 },
        "storage": "stateless"
    }))
    .expect("valid json");
    let engine = stateless_engine(config, &default_registry());
    assert_eq!(
        engine.stage_names().collect::<Vec<_>>(),
        vec!["stageX", "stageY"]
    );

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    let request = ProcessRequest::follow(&first, json!({ "code": "4321" })).expect("in flight");
    assert!(assert_ok!(engine.handle(request).await).is_complete());
}

#[test]
fn test_unknown_stage_type_fails_build() {
    let config = ProcessInstanceConfig::builder()
        .descriptor(selfserve::StageDescriptor::new("missing", serde_json::Map::new()))
        .build()
        .expect("valid config");
    let result = ProcessEngine::builder(config)
        .key_ring(key_ring())
        .build(&default_registry());
    assert!(matches!(
        result,
        Err(ConfigurationError::UnknownStageType(ref name)) if name == "missing"
    ));
}

#[tokio::test]
async fn test_stateful_flow_completes_and_clears_store() {
    let store = Arc::new(InMemoryProcessStore::new());
    let config = ProcessInstanceConfig::builder()
        .stage(StageXConfig {})
        .stage(StageYConfig {
            expected_code: "1234".into(),
        })
        .storage(StorageType::Stateful)
        .build()
        .expect("valid config");
    let engine = ProcessEngine::builder(config)
        .store(store.clone())
        .build(&default_registry())
        .expect("valid engine");

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    assert_eq!(store.len().await, 1);

    let request = ProcessRequest::follow(&first, json!({ "code": "1234" })).expect("in flight");
    assert!(assert_ok!(engine.handle(request.clone()).await).is_complete());
    assert!(store.is_empty().await);

    assert!(matches!(
        engine.handle(request).await,
        Err(ProcessError::TokenInvalid(_))
    ));
}

#[tokio::test]
async fn test_stateful_concurrent_submissions_conflict() {
    let barrier = Arc::new(Barrier::new(2));
    let registry = registry(Arc::new(AtomicU32::new(0)), barrier);
    let store = Arc::new(InMemoryProcessStore::new());
    let config = ProcessInstanceConfig::builder()
        .stage(GateConfig {})
        .stage(StageXConfig {})
        .stage(StageYConfig {
            expected_code: "1234".into(),
        })
        .storage(StorageType::Stateful)
        .build()
        .expect("valid config");
    let engine = ProcessEngine::builder(config)
        .store(store.clone())
        .build(&registry)
        .expect("valid engine");

    let first = assert_ok!(engine.handle(ProcessRequest::start()).await);
    assert_eq!(first.stage_tag, Some(StageTag::new("gate")));
    let request = ProcessRequest::follow(&first, json!({ "go": true })).expect("in flight");

    let (a, b) = tokio::join!(engine.handle(request.clone()), engine.handle(request));
    let results = [a, b];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let conflicted = results
        .iter()
        .filter(|r| matches!(r, Err(ProcessError::StorageConflict(_))))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(conflicted, 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_dropping_the_request_cancels_the_stage() {
    let store = Arc::new(InMemoryProcessStore::new());
    let config = ProcessInstanceConfig::builder()
        .stage(HangConfig {})
        .storage(StorageType::Stateful)
        .build()
        .expect("valid config");
    let engine = ProcessEngine::builder(config)
        .store(store.clone())
        .build(&default_registry())
        .expect("valid engine");

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        engine.handle(ProcessRequest::start()),
    )
    .await;
    assert!(result.is_err());
    assert!(store.is_empty().await);
}
