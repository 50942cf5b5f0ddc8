//! reqwest-backed collaborators: a seeded random-image service for targets and
//! a JSON judging backend for scores, coaching reports and coach chat.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header::CONTENT_TYPE, Client};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ChatMessage, CoachReport, Score, SessionRecord, TargetArtifact},
    error::ApiError,
    protocol::{ChatRequest, ChatResponse, CoachRequest, ScoreRequest, ScoreResponse},
};
use tracing::debug;
use uuid::Uuid;

use crate::{CoachingClient, ScoringClient, TargetAcquisition};

pub const DEFAULT_TARGET_SOURCE_URL: &str = "https://picsum.photos";
const DEFAULT_TARGET_MIME: &str = "image/jpeg";

pub struct HttpTargetAcquisition {
    http: Client,
    base_url: String,
    width: u32,
    height: u32,
}

impl HttpTargetAcquisition {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            width: 800,
            height: 600,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    fn target_url(&self, seed: &str) -> String {
        format!(
            "{}/seed/{seed}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.width,
            self.height
        )
    }
}

#[async_trait]
impl TargetAcquisition for HttpTargetAcquisition {
    async fn acquire_target(&self) -> Result<TargetArtifact> {
        let seed = Uuid::new_v4().simple().to_string();
        let url = self.target_url(&seed);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch target image from {url}"))?
            .error_for_status()?;

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_TARGET_MIME)
            .to_string();
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            bail!("target image from {url} was empty");
        }
        debug!(bytes = bytes.len(), %mime_type, "target image fetched");

        Ok(TargetArtifact {
            mime_type,
            image_b64: STANDARD.encode(&bytes),
            display_handle: url,
        })
    }
}

pub struct HttpJudgeClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpJudgeClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_client(Client::new(), base_url, api_key)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        let mut request = self.http.post(&url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to reach judge at {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ApiError>(&body) {
                Ok(api_error) => anyhow!("judge rejected /{path} ({status}): {api_error}"),
                Err(_) => anyhow!("judge returned {status} for /{path}: {body}"),
            });
        }

        response
            .json::<Resp>()
            .await
            .with_context(|| format!("malformed /{path} response from judge"))
    }
}

#[async_trait]
impl ScoringClient for HttpJudgeClient {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreResponse> {
        let verdict: ScoreResponse = self.post_json("score", &request).await?;
        Score::new(verdict.score).context("judge returned an out-of-range score")?;
        Ok(verdict)
    }
}

#[async_trait]
impl CoachingClient for HttpJudgeClient {
    async fn coach(&self, history: &[SessionRecord]) -> Result<CoachReport> {
        self.post_json("coach", &CoachRequest::from_records(history))
            .await
    }

    async fn chat(&self, seed: &[SessionRecord], conversation: &[ChatMessage]) -> Result<String> {
        let response: ChatResponse = self
            .post_json("chat", &ChatRequest::new(seed, conversation))
            .await?;
        let reply = response.reply.trim();
        if reply.is_empty() {
            bail!("judge returned an empty chat reply");
        }
        Ok(reply.to_string())
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
