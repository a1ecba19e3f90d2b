use crate::errors::{BridgeError, Result};
use crate::models::{BotProfile, FileLocator};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;

/// Channel to one of the platform's media data-centers. The core only ever
/// talks to this trait; the concrete wire protocol stays behind it.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Read one platform-aligned chunk: `limit` bytes starting at `offset`.
    /// The last chunk of a file may come back short.
    async fn fetch_chunk(&self, locator: &FileLocator, offset: u64, limit: u32) -> Result<Bytes>;

    /// Resolve a message id to its file locator. Only meaningful on a
    /// session in the identity's home data-center.
    async fn fetch_metadata(&self, message_id: i64) -> Result<FileLocator>;
}

/// Dials media data-centers with an identity's credentials.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, token: &str, dc_id: i32) -> Result<Arc<dyn MediaTransport>>;

    /// Fetch the identity's own profile, shown on the info endpoint.
    async fn fetch_self(&self, token: &str) -> Result<BotProfile>;

    /// Data-center newly started identities call home to.
    fn home_dc_id(&self) -> i32;
}

/// JSON-over-HTTP implementation against the platform's media gateway.
pub struct HttpConnector {
    http: Client,
    api_base: String,
    home_dc: i32,
}

impl HttpConnector {
    pub fn new(api_base: String) -> Self {
        Self {
            http: Client::new(),
            api_base,
            home_dc: 1,
        }
    }
}

#[async_trait]
impl TransportConnector for HttpConnector {
    async fn connect(&self, token: &str, dc_id: i32) -> Result<Arc<dyn MediaTransport>> {
        let url = format!("{}/bot{}/exportAuth", self.api_base, token);
        let res = self
            .http
            .post(&url)
            .query(&[("dc", dc_id.to_string())])
            .send()
            .await?;
        let json = check_api_response(res).await?;
        let session_auth = json["result"]["auth"]
            .as_str()
            .ok_or_else(|| BridgeError::UpstreamUnavailable("no auth in exportAuth response".to_string()))?
            .to_string();

        Ok(Arc::new(HttpTransport {
            http: self.http.clone(),
            api_base: self.api_base.clone(),
            token: token.to_string(),
            session_auth,
            dc_id,
        }))
    }

    async fn fetch_self(&self, token: &str) -> Result<BotProfile> {
        let url = format!("{}/bot{}/getMe", self.api_base, token);
        let json = check_api_response(self.http.get(&url).send().await?).await?;
        let result = &json["result"];
        Ok(BotProfile {
            id: result["id"].as_i64().unwrap_or_default(),
            username: result["username"].as_str().unwrap_or_default().to_string(),
            first_name: result["first_name"].as_str().unwrap_or_default().to_string(),
        })
    }

    fn home_dc_id(&self) -> i32 {
        self.home_dc
    }
}

struct HttpTransport {
    http: Client,
    api_base: String,
    token: String,
    session_auth: String,
    dc_id: i32,
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn fetch_chunk(&self, locator: &FileLocator, offset: u64, limit: u32) -> Result<Bytes> {
        let url = format!("{}/dc{}/media/chunk", self.api_base, self.dc_id);
        let res = self
            .http
            .get(&url)
            .bearer_auth(&self.session_auth)
            .query(&[
                ("volume", locator.volume_id.to_string()),
                ("local", locator.local_id.to_string()),
                ("hash", locator.access_hash.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        if res.status().is_success() {
            return Ok(res.bytes().await?);
        }
        Err(map_api_error(res).await)
    }

    async fn fetch_metadata(&self, message_id: i64) -> Result<FileLocator> {
        let url = format!("{}/bot{}/messages/{}", self.api_base, self.token, message_id);
        let json = check_api_response(self.http.get(&url).send().await?).await?;
        let result = &json["result"];
        let media = &result["media"];

        let size = media["size"]
            .as_u64()
            .ok_or_else(|| BridgeError::ReferenceNotFound)?;
        Ok(FileLocator {
            message_id,
            dc_id: media["dc_id"].as_i64().unwrap_or(self.dc_id as i64) as i32,
            volume_id: media["volume_id"].as_i64().unwrap_or_default(),
            local_id: media["local_id"].as_i64().unwrap_or_default() as i32,
            access_hash: media["access_hash"].as_i64().unwrap_or_default(),
            size,
            mime_type: media["mime_type"].as_str().map(str::to_string),
            file_name: media["file_name"].as_str().map(str::to_string),
            message_date: parse_message_date(result["date"].as_i64()),
        })
    }
}

fn parse_message_date(unix: Option<i64>) -> DateTime<Utc> {
    unix.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Parse a JSON API response, mapping platform error payloads to the
/// semantic error kinds.
async fn check_api_response(res: reqwest::Response) -> Result<Value> {
    if res.status().is_success() {
        let json: Value = res.json().await?;
        if json["ok"].as_bool().unwrap_or(false) {
            return Ok(json);
        }
        return Err(classify_error_body(StatusCode::OK, &json));
    }
    Err(map_api_error(res).await)
}

async fn map_api_error(res: reqwest::Response) -> BridgeError {
    let status = res.status();
    let json: Value = res.json().await.unwrap_or(Value::Null);
    classify_error_body(status, &json)
}

fn classify_error_body(status: StatusCode, json: &Value) -> BridgeError {
    if let Some(dc_id) = json["migrate_to"].as_i64() {
        return BridgeError::UpstreamAuthMigration { dc_id: dc_id as i32 };
    }
    let description = json["description"]
        .as_str()
        .unwrap_or("upstream request failed")
        .to_string();
    match status {
        StatusCode::NOT_FOUND => BridgeError::ReferenceNotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BridgeError::UpstreamUnavailable(description)
        }
        StatusCode::TOO_MANY_REQUESTS => BridgeError::UpstreamTransient(format!(
            "rate limited by upstream: {}",
            description
        )),
        s if s.is_server_error() => BridgeError::UpstreamTransient(description),
        _ => BridgeError::UpstreamUnavailable(description),
    }
}
