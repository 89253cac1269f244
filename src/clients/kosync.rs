//! KOReader sync server client and the KOReader document hash

use serde::Deserialize;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{ClientError, EbookSyncService};
use crate::config::KoSyncConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const KOREADER_ACCEPT: &str = "application/vnd.koreader.v1+json";
const DEVICE_NAME: &str = "abs-sync-bot";

pub struct KoSyncClient {
    base_url: String,
    user: String,
    auth_key: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ProgressResponse {
    #[serde(default)]
    percentage: Option<f64>,
}

impl KoSyncClient {
    pub fn new(config: &KoSyncConfig) -> Self {
        let password = config.key.as_deref().unwrap_or_default();
        Self {
            base_url: config.server.trim_end_matches('/').to_string(),
            user: config.user.clone().unwrap_or_default(),
            auth_key: format!("{:x}", md5::compute(password.as_bytes())),
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-auth-user", &self.user)
            .header("x-auth-key", &self.auth_key)
            .header("accept", KOREADER_ACCEPT)
            .timeout(REQUEST_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl EbookSyncService for KoSyncClient {
    async fn check_connection(&self) -> Result<(), ClientError> {
        let health = self
            .http
            .get(format!("{}/healthcheck", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        if let Ok(response) = health {
            if response.status().is_success() {
                info!(server = %self.base_url, "Connected to KOSync");
                return Ok(());
            }
        }

        // Not every server implements /healthcheck; any answer proves it is up
        let response = self
            .request(reqwest::Method::GET, "/syncs/progress/test-connection")
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        info!(server = %self.base_url, status = %response.status(), "Connected to KOSync");
        Ok(())
    }

    async fn get_progress(&self, doc_id: &str) -> Result<f64, ClientError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/syncs/progress/{}", doc_id))
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0.0);
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Auth(format!("KOSync rejected user {}", self.user)));
        }
        if !response.status().is_success() {
            return Err(ClientError::http(&response));
        }

        let progress: ProgressResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(progress.percentage.unwrap_or(0.0))
    }

    async fn update_progress(
        &self,
        doc_id: &str,
        percentage: f64,
        xpointer: Option<&str>,
    ) -> Result<(), ClientError> {
        let progress = match xpointer {
            Some(xp) => xp.to_string(),
            None => format!("{:.2}%", percentage * 100.0),
        };
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let payload = serde_json::json!({
            "document": doc_id,
            "percentage": percentage,
            "progress": progress,
            "device": DEVICE_NAME,
            "device_id": DEVICE_NAME,
            "timestamp": timestamp,
        });

        let response = self
            .request(reqwest::Method::PUT, "/syncs/progress")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::http(&response));
        }

        info!(doc_id, percentage, progress = %progress, "Updated KOSync progress");
        Ok(())
    }
}

/// KOReader's partial MD5 document id: 1 KiB samples at offset 0 and at
/// `1024 * 4^i` for i in 0..=10, stopping at end of file
pub fn partial_md5(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();

    let mut context = md5::Context::new();
    let mut buf = [0u8; 1024];

    let offsets = std::iter::once(0u64).chain((0..=10).map(|i| 1024u64 << (2 * i)));
    for offset in offsets {
        if offset >= size {
            break;
        }
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        context.consume(&buf[..filled]);
    }

    let digest = format!("{:x}", context.compute());
    debug!(path = %path.display(), digest = %digest, "Computed KOReader document hash");
    Ok(digest)
}
