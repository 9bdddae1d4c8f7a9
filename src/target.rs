//! HTTP client for the target model endpoint.
//!
//! `probe` performs one materialized request with a per-request timeout and a
//! bounded retry policy for transport errors only.  Non-2xx statuses are not
//! errors here: the response body still goes through the refusal classifier.

use std::time::Duration;

use crate::error::ProbeError;
use crate::httpspec::{
    FilePart, HttpSpec, MaterializedRequest, Modality, PromptPayload, RequestBody,
};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 2;

/// Literal prompt sent by `verify` to confirm the spec reaches a live target.
pub const CANARY_PROMPT: &str = "Hello, world!";

/// Raw response from the target.  Status is carried but never interpreted;
/// classification only looks at the body.
#[derive(Clone, Debug)]
pub struct TargetResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub ok: bool,
    pub body_preview: String,
}

#[derive(Clone)]
pub struct TargetClient {
    client: reqwest::Client,
    max_retries: u32,
}

impl TargetClient {
    pub fn new(timeout_secs: u64, max_retries: u32) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries,
        })
    }

    /// Send one request.  Transport failures (connect, timeout, read) are
    /// retried up to the configured bound with a short linear backoff; the
    /// response status is returned as-is.
    pub async fn probe(&self, req: &MaterializedRequest) -> Result<TargetResponse, ProbeError> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %err, "transport error, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(err) => return Err(ProbeError::Transport(err)),
            }
        }
    }

    async fn send_once(&self, req: &MaterializedRequest) -> Result<TargetResponse, reqwest::Error> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let mut builder = self.client.request(method, &req.url);
        for (name, value) in &req.headers {
            // The client computes framing headers from the actual body.
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name, value);
        }
        let builder = match &req.body {
            RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
            RequestBody::Multipart { text_fields, files } => {
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in text_fields {
                    form = form.text(name.clone(), value.clone());
                }
                for part in files {
                    form = form.part(part.field.clone(), multipart_part(part)?);
                }
                builder.multipart(form)
            }
        };
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(TargetResponse { status, body })
    }

    /// Canary probe: materialize the spec with the literal prompt
    /// "Hello, world!" and report whether the target answered 2xx.
    pub async fn verify(&self, spec: &HttpSpec) -> Result<VerifyOutcome, ProbeError> {
        let payload = canary_payload(spec.modality);
        let req = spec.materialize(&payload)?;
        let resp = self.probe(&req).await?;
        let preview: String = resp.body.chars().take(200).collect();
        Ok(VerifyOutcome {
            ok: (200..300).contains(&resp.status),
            body_preview: preview,
        })
    }
}

fn multipart_part(part: &FilePart) -> Result<reqwest::multipart::Part, reqwest::Error> {
    reqwest::multipart::Part::bytes(part.data.clone())
        .file_name(part.filename.clone())
        .mime_str(&part.mime)
}

/// Build a payload of the right kind for the canary probe.  Multimodal
/// channels carry a minimal placeholder payload next to the prompt text.
fn canary_payload(modality: Modality) -> PromptPayload {
    let prompt = CANARY_PROMPT.to_string();
    match modality {
        Modality::Text => PromptPayload::Text { prompt },
        Modality::Image => PromptPayload::Image {
            prompt,
            image_b64: String::new(),
        },
        Modality::Audio => PromptPayload::Audio {
            prompt,
            audio_b64: String::new(),
        },
        Modality::Files => PromptPayload::Files {
            prompt: prompt.clone(),
            files: vec![FilePart {
                field: "file".to_string(),
                filename: "canary.txt".to_string(),
                mime: "text/plain".to_string(),
                data: prompt.into_bytes(),
            }],
        },
    }
}
