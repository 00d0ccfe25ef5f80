//! Worker probe: bounded-timeout calls against a VM's worker agent.

use crate::error::WorkerError;
use crate::models::{MatchPrivacy, MatchType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    #[serde(default)]
    active_matches: serde_json::Value,
}

/// Coerces `active_matches` to a non-negative integer; non-numeric
/// responses normalize to 0.
fn coerce_active_matches(value: &serde_json::Value) -> u32 {
    value.as_u64().unwrap_or(0) as u32
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartMatchRequest<'a> {
    match_id: &'a str,
    game_mode: &'a str,
    match_privacy: MatchPrivacy,
    tick_rate: u32,
    match_type: MatchType,
    playfab_secret_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMatchResponse {
    success: bool,
    #[serde(default)]
    server_port: u16,
    #[serde(default)]
    container_id: String,
    #[serde(default)]
    message: Option<String>,
}

pub struct StartedMatch {
    pub server_port: u16,
    pub container_id: String,
}

pub struct WorkerProbe {
    http: reqwest::Client,
    port: u16,
}

impl WorkerProbe {
    pub fn new(port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            port,
        }
    }

    fn classify_send_error(err: &reqwest::Error) -> WorkerError {
        if err.is_timeout() {
            WorkerError::Timeout
        } else if err.is_connect() {
            WorkerError::ConnectionRefused
        } else {
            WorkerError::Malformed(err.to_string())
        }
    }

    /// `GET /status` with a `timeout_ms` bound.
    pub async fn status(&self, ip: &str, timeout_ms: u64) -> Result<u32, WorkerError> {
        let url = format!("http://{}:{}/status", ip, self.port);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Self::classify_send_error(&e))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(WorkerError::HttpStatus(status.as_u16()));
        }
        if !status.is_success() {
            return Err(WorkerError::HttpStatus(status.as_u16()));
        }

        let body: StatusResponse = resp
            .json()
            .await
            .map_err(|e| WorkerError::Malformed(e.to_string()))?;

        Ok(coerce_active_matches(&body.active_matches))
    }

    /// `POST /start-match` with a fixed 15s timeout.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_match(
        &self,
        ip: &str,
        match_id: &str,
        game_mode: &str,
        match_privacy: MatchPrivacy,
        tick_rate: u32,
        match_type: MatchType,
        playfab_secret_key: &str,
    ) -> Result<StartedMatch, WorkerError> {
        let url = format!("http://{}:{}/start-match", ip, self.port);
        let body = StartMatchRequest {
            match_id,
            game_mode,
            match_privacy,
            tick_rate,
            match_type,
            playfab_secret_key,
        };

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| Self::classify_send_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(WorkerError::HttpStatus(status.as_u16()));
        }

        let parsed: StartMatchResponse = resp
            .json()
            .await
            .map_err(|e| WorkerError::Malformed(e.to_string()))?;

        if !parsed.success {
            return Err(WorkerError::StartRejected(
                parsed.message.unwrap_or_else(|| "worker declined".to_string()),
            ));
        }

        Ok(StartedMatch {
            server_port: parsed.server_port,
            container_id: parsed.container_id,
        })
    }
}
