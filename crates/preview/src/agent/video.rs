//! Video transcoding delegated to an external encoding service.
//!
//! The renderer only creates the encoder job. The service later calls the
//! notification URL and the dispatcher resolves the job from that callback.

use serde::{Deserialize, Serialize};

use crate::agent::{ConvertOutcome, RenderContext, Renderer};
use crate::config::{AgentKind, RendererParams};
use crate::error::{ConfigError, RenderError, TransferError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EncoderJobRequest<'a> {
    input: &'a str,
    output_base_url: String,
    playlist: String,
    notification_url: String,
    pass_through: &'a str,
}

#[derive(Debug, Deserialize)]
struct EncoderJobResponse {
    id: serde_json::Value,
}

pub struct VideoRenderer {
    client: reqwest::blocking::Client,
    encoder_url: String,
    notification_url: String,
    output_base_url: String,
    api_key: Option<String>,
}

impl VideoRenderer {
    /// Requires `encoderUrl` and `notificationUrl`; `outputBaseUrl` and
    /// `apiKey` are optional.
    pub fn from_params(params: &RendererParams) -> Result<Self, ConfigError> {
        let required = |key: &str| {
            params
                .get_str(key)
                .map(|v| v.trim_end_matches('/').to_string())
                .ok_or_else(|| ConfigError::Validation {
                    message: format!("video render agent requires rendererParams.{}", key),
                })
        };

        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| ConfigError::Validation {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            encoder_url: required("encoderUrl")?,
            notification_url: required("notificationUrl")?,
            output_base_url: params
                .get_str("outputBaseUrl")
                .unwrap_or("local:///videos")
                .trim_end_matches('/')
                .to_string(),
            api_key: params.get_str("apiKey").map(str::to_string),
        })
    }

    fn post(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let request = self.client.post(url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Where the encoder writes the playlist for `job_id`.
    pub fn playlist_location(&self, asset_id: &str, job_id: &str) -> String {
        format!("{}/{}/{}.m3u8", self.output_base_url, asset_id, job_id)
    }
}

fn classify(error: reqwest::Error, timeout_secs: u64) -> RenderError {
    if error.is_timeout() {
        RenderError::Timeout {
            after_secs: timeout_secs,
        }
    } else {
        RenderError::Transfer(TransferError::Http(error))
    }
}

fn check_status(url: &str, status: reqwest::StatusCode) -> Result<(), RenderError> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(RenderError::Transient(format!(
            "encoder at {} returned {}",
            url, status
        )));
    }
    Err(RenderError::Conversion(format!(
        "encoder at {} rejected the job: {}",
        url, status
    )))
}

impl Renderer for VideoRenderer {
    fn kind(&self) -> AgentKind {
        AgentKind::Video
    }

    fn convert(&self, ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError> {
        let input = ctx
            .asset
            .origin
            .source_url()
            .ok_or_else(|| RenderError::Conversion("asset bytes were not retained".to_string()))?;

        let url = format!("{}/jobs", self.encoder_url);
        let request = EncoderJobRequest {
            input: &input,
            output_base_url: format!("{}/{}", self.output_base_url, ctx.asset.id),
            playlist: format!("{}.m3u8", ctx.job.id),
            notification_url: format!("{}/{}", self.notification_url, ctx.job.id),
            pass_through: &ctx.job.id,
        };

        let response = self
            .post(&url)
            .timeout(ctx.timeout)
            .json(&request)
            .send()
            .map_err(|e| classify(e, ctx.timeout.as_secs()))?;
        check_status(&url, response.status())?;

        let body: EncoderJobResponse = response
            .json()
            .map_err(|e| RenderError::Conversion(format!("unexpected encoder response: {}", e)))?;
        let external_id = match body.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };

        log::info!("Delegated {} to encoder job {}", ctx.job.id, external_id);

        Ok(ConvertOutcome::Delegated {
            external_id,
            output_location: self.playlist_location(&ctx.asset.id, &ctx.job.id),
        })
    }

    fn cancel(&self, external_id: &str) -> Result<(), RenderError> {
        let url = format!("{}/jobs/{}/cancel", self.encoder_url, external_id);
        let response = self.post(&url).send().map_err(|e| classify(e, 0))?;
        check_status(&url, response.status())
    }
}
