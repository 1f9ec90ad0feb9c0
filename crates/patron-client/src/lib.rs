//! Signed HTTP client for the upstream sponsorship API.

use std::time::Duration;

use chrono::Utc;
use md5::{Digest, Md5};
use patron_core::SponsorPage;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "patron-client";

pub const DEFAULT_BASE_URL: &str = "https://afdian.com/api/open";

/// Compute the request signature: lowercase-hex MD5 over
/// `token + "params" + params_json + "ts" + ts + "user_id" + user_id`.
///
/// MD5 here is a wire-compatibility requirement of the upstream signing
/// contract, not an integrity mechanism.
pub fn sign(token: &str, params_json: &str, ts: i64, user_id: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{token}params{params_json}ts{ts}user_id{user_id}"));
    hex::encode(hasher.finalize())
}

/// The complete outbound body for every upstream call.
#[derive(Debug, Clone, Serialize)]
pub struct SignedRequest {
    pub user_id: String,
    pub params: String,
    pub ts: i64,
    pub sign: String,
}

/// Serialize `params`, stamp the current Unix time and sign the envelope.
///
/// The same serialized string feeds both the signature and the request body,
/// so the two can never disagree on key order.
pub fn build_signed_request<P: Serialize>(
    params: &P,
    user_id: &str,
    token: &str,
) -> Result<SignedRequest, serde_json::Error> {
    let params_json = serde_json::to_string(params)?;
    let ts = Utc::now().timestamp();
    let sign = sign(token, &params_json, ts, user_id);
    Ok(SignedRequest {
        user_id: user_id.to_string(),
        params: params_json,
        ts,
        sign,
    })
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Transport { status: u16, body: String },
    #[error("upstream error {code}: {message}")]
    Business { code: i64, message: String },
    #[error("encoding request params: {0}")]
    Params(serde_json::Error),
    #[error("malformed response envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    ec: i64,
    #[serde(default)]
    em: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

fn decode_envelope<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, ApiError> {
    if !status.is_success() {
        return Err(ApiError::Transport {
            status: status.as_u16(),
            body: body.to_string(),
        });
    }
    let envelope: ResponseEnvelope = serde_json::from_str(body)?;
    if envelope.ec != 200 {
        return Err(ApiError::Business {
            code: envelope.ec,
            message: envelope.em,
        });
    }
    let data = envelope.data.unwrap_or(serde_json::Value::Null);
    Ok(serde_json::from_value(data)?)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_id: String,
    pub token: String,
    pub timeout: Duration,
}

/// Upstream API client. Does not retry; retry policy belongs to the caller.
#[derive(Debug, Clone)]
pub struct AfdianClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    token: String,
}

#[derive(Debug, Clone, Serialize)]
struct SponsorQueryParams {
    page: u32,
    per_page: u32,
}

impl AfdianClient {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: config.user_id,
            token: config.token,
        })
    }

    /// POST a signed call to one endpoint and decode the `{ec, em, data}`
    /// envelope into `T`.
    pub async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &P,
    ) -> Result<T, ApiError> {
        let body =
            build_signed_request(params, &self.user_id, &self.token).map_err(ApiError::Params)?;
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(endpoint, %status, "upstream call finished");
        decode_envelope(status, &text)
    }

    /// Fetch one page of the sponsor listing.
    pub async fn query_sponsor(&self, page: u32, per_page: u32) -> Result<SponsorPage, ApiError> {
        self.call("/query-sponsor", &SponsorQueryParams { page, per_page })
            .await
    }

    /// Credential and signing-scheme check against the upstream echo endpoint.
    pub async fn ping(&self) -> Result<serde_json::Value, ApiError> {
        self.call("/ping", &serde_json::json!({})).await
    }
}
