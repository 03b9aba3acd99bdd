//! Password reset flow: confirm a mail address with a code, then set a new
//! password.

use async_trait::async_trait;
use selfserve::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailConfig {
    code_length: usize,
}

impl StageConfig for EmailConfig {
    const TYPE: StageType<Self> = StageType::new("emailValidation");
}

#[derive(Debug)]
struct EmailStage {
    config: EmailConfig,
}

#[async_trait]
impl Stage for EmailStage {
    async fn gather_initial_requirements(
        &self,
        _input: StageInput<'_>,
    ) -> Result<Requirements, StageError> {
        Ok(Requirements::builder("Account mail")
            .required("mail", "string", "Mail address of the account")
            .build())
    }

    async fn advance(&self, input: StageInput<'_>) -> Result<StageResponse, StageError> {
        if input.stage_tag().as_str() == "validateCode" {
            let expected = input.scoped("code");
            return match input.input_str("code") {
                Some(code) if Some(code) == expected => Ok(StageResponse::builder().build()),
                _ => Err(StageError::validation("code does not match")),
            };
        }

        let mail = input
            .input_str("mail")
            .ok_or_else(|| StageError::validation("mail is required"))?;
        let code = "7".repeat(self.config.code_length.max(4));
        println!("Sending code {} to {}", code, mail);

        Ok(StageResponse::builder()
            .stage_tag("validateCode")
            .requirements(
                Requirements::builder("Verification code")
                    .required("code", "string", "The code from the mail")
                    .build(),
            )
            .add_state("code", code)
            .add_shared_state("mail", mail)
            .build())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResetConfig {}

impl StageConfig for ResetConfig {
    const TYPE: StageType<Self> = StageType::new("resetStage");
}

#[derive(Debug)]
struct ResetStage;

#[async_trait]
impl Stage for ResetStage {
    async fn gather_initial_requirements(
        &self,
        _input: StageInput<'_>,
    ) -> Result<Requirements, StageError> {
        Ok(Requirements::builder("New password")
            .required("password", "string", "The new password")
            .build())
    }

    async fn advance(&self, input: StageInput<'_>) -> Result<StageResponse, StageError> {
        let password = input
            .input_str("password")
            .ok_or_else(|| StageError::validation("password is required"))?;
        if password.len() < 8 {
            return Err(StageError::validation("password is too short"));
        }
        let mail = input.shared("mail").unwrap_or("<unknown>");
        println!("Password updated for {}", mail);
        Ok(StageResponse::builder().build())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut registry = StageRegistry::new();
    registry
        .register(EmailConfig::TYPE, |config| EmailStage { config })?
        .register(ResetConfig::TYPE, |_: ResetConfig| ResetStage)?;

    let config = ProcessInstanceConfig::builder()
        .stage(EmailConfig { code_length: 6 })
        .stage(ResetConfig::default())
        .build()?;

    let engine = ProcessEngine::builder(config)
        .key_ring(SnapshotKeyRing::new(SigningKey::generate("primary")?))
        .build(&registry)?;

    let inputs = [
        json!({ "mail": "alice@example.com" }),
        json!({ "code": "777777" }),
        json!({ "password": "correct horse battery" }),
    ];

    let mut response = engine.handle(ProcessRequest::start()).await?;
    for input in inputs {
        println!(
            "Stage '{}' requires {}",
            response.stage_tag.as_ref().map(|t| t.as_str()).unwrap_or_default(),
            response.requirements.clone().unwrap_or_default()
        );
        let Some(request) = ProcessRequest::follow(&response, input) else {
            break;
        };
        match engine.handle(request).await {
            Ok(next) => response = next,
            Err(ProcessError::StageValidation { message, .. }) => {
                eprintln!("Rejected: {}", message);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    if response.is_complete() {
        println!("Password reset completed");
    }
    Ok(())
}
