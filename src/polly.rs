//! Amazon Polly as the signed-locator source.
//!
//! Each leg is a `SynthesizeSpeech` request that is presigned instead of sent;
//! the resulting URL is handed to the downloader.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_polly::Client as PollyClient;
use aws_sdk_polly::config::Builder as PollyConfigBuilder;
use aws_sdk_polly::error::{DisplayErrorContext, SdkError};
use aws_sdk_polly::operation::synthesize_speech::SynthesizeSpeechError;
use aws_sdk_polly::presigning::PresigningConfig;
use aws_sdk_polly::types::{Engine, OutputFormat, SpeechMarkType, TextType, VoiceId};
use hangu_core::SynthesisError;
use hangu_core::config::{AppConfig, PollyEngine};
use hangu_core::synthesis::{LegRequest, LocatorSource};
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub struct PollyLocatorSource {
    client: PollyClient,
    engine: PollyEngine,
    expiry: Duration,
}

impl PollyLocatorSource {
    pub async fn from_config(config: &AppConfig) -> Self {
        let region = Region::new(config.region.as_str());
        let client = match (&config.aws_access_key_id, &config.aws_secret_access_key) {
            (Some(key), Some(secret)) if config.has_explicit_credentials() => {
                info!(region = %config.region, "Using Polly credentials from config");
                let credentials = Credentials::new(key, secret, None, None, "hangu-reader");
                let polly_config = PollyConfigBuilder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(credentials)
                    .build();
                PollyClient::from_conf(polly_config)
            }
            _ => {
                info!(region = %config.region, "Using default AWS credential chain");
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                PollyClient::new(&shared)
            }
        };
        Self {
            client,
            engine: config.engine,
            expiry: config.presign_expiry(),
        }
    }
}

#[async_trait]
impl LocatorSource for PollyLocatorSource {
    async fn locate(&self, request: &LegRequest) -> Result<Url, SynthesisError> {
        let leg = request.kind.label();
        let presigning = PresigningConfig::expires_in(self.expiry)
            .map_err(|err| SynthesisError::service(leg, None, err.to_string()))?;

        let mut builder = self
            .client
            .synthesize_speech()
            .text(request.text.as_str())
            .text_type(TextType::Text)
            .voice_id(VoiceId::from(request.voice.as_str()))
            .engine(engine_to_sdk(self.engine))
            .output_format(OutputFormat::from(request.kind.output_format()));
        for mark_type in request.kind.speech_mark_types() {
            builder = builder.speech_mark_types(SpeechMarkType::from(*mark_type));
        }

        let presigned = builder
            .presigned(presigning)
            .await
            .map_err(|err| map_sdk_error(leg, err))?;
        debug!(leg, method = presigned.method(), "Presigned Polly request");

        Url::parse(presigned.uri())
            .map_err(|err| SynthesisError::service(leg, None, format!("invalid locator: {err}")))
    }
}

fn engine_to_sdk(engine: PollyEngine) -> Engine {
    match engine {
        PollyEngine::Standard => Engine::Standard,
        PollyEngine::Neural => Engine::Neural,
    }
}

fn map_sdk_error<R: Debug>(
    leg: &'static str,
    err: SdkError<SynthesizeSpeechError, R>,
) -> SynthesisError {
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ServiceError(_) => SynthesisError::service(leg, None, message),
        _ => SynthesisError::network(leg, message),
    }
}
