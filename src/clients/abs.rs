//! Audiobookshelf REST client

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use super::{AudiobookItem, AudiobookService, ClientError};
use crate::config::AbsConfig;
use crate::transcript::AudioFile;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AbsClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct LibrariesResponse {
    #[serde(default)]
    libraries: Vec<Library>,
}

#[derive(Deserialize)]
struct Library {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Deserialize)]
struct InProgressResponse {
    #[serde(default, rename = "libraryItems")]
    library_items: Vec<Value>,
}

#[derive(Deserialize)]
struct ProgressResponse {
    #[serde(default, rename = "currentTime")]
    current_time: Option<f64>,
}

impl AbsClient {
    pub fn new(config: &AbsConfig) -> Self {
        Self {
            base_url: config.server.trim_end_matches('/').to_string(),
            token: config.api_key.clone().unwrap_or_default(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::http(&response));
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.get(path)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl AudiobookService for AbsClient {
    async fn check_connection(&self) -> Result<(), ClientError> {
        let me: Value = self.get_json("/api/me").await?;
        let user = me.get("username").and_then(Value::as_str).unwrap_or("unknown");
        info!(server = %self.base_url, user, "Connected to Audiobookshelf");
        Ok(())
    }

    async fn get_all_audiobooks(&self) -> Result<Vec<AudiobookItem>, ClientError> {
        let libraries: LibrariesResponse = self.get_json("/api/libraries").await?;

        let mut audiobooks = Vec::new();
        for library in &libraries.libraries {
            let path = format!("/api/libraries/{}/items?mediaType=audiobook", library.id);
            match self.get_json::<ResultsResponse>(&path).await {
                Ok(items) => audiobooks.extend(
                    items
                        .results
                        .iter()
                        .filter_map(AudiobookItem::from_library_item),
                ),
                Err(e) => warn!(library = %library.name, error = %e, "Could not list library items"),
            }
        }

        info!(
            audiobooks = audiobooks.len(),
            libraries = libraries.libraries.len(),
            "Scanned Audiobookshelf libraries"
        );
        Ok(audiobooks)
    }

    async fn get_in_progress(&self) -> Result<Vec<AudiobookItem>, ClientError> {
        let response: InProgressResponse = self.get_json("/api/me/items-in-progress").await?;
        Ok(response
            .library_items
            .iter()
            .filter(|item| {
                item.get("mediaType")
                    .and_then(Value::as_str)
                    .map_or(true, |t| t == "book")
            })
            .filter_map(AudiobookItem::from_library_item)
            .collect())
    }

    async fn get_item_details(&self, item_id: &str) -> Result<AudiobookItem, ClientError> {
        let item: Value = self.get_json(&format!("/api/items/{}", item_id)).await?;
        AudiobookItem::from_library_item(&item)
            .ok_or_else(|| ClientError::InvalidResponse(format!("item {} has no id", item_id)))
    }

    async fn get_audio_files(&self, item_id: &str) -> Result<Vec<AudioFile>, ClientError> {
        let item: Value = self.get_json(&format!("/api/items/{}", item_id)).await?;

        let files = item
            .pointer("/media/audioFiles")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|af| {
                        let ino = match af.get("ino")? {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        let ext = af
                            .pointer("/metadata/ext")
                            .and_then(Value::as_str)
                            .filter(|e| !e.is_empty())
                            .unwrap_or("mp3");
                        Some(AudioFile {
                            stream_url: format!(
                                "{}/api/items/{}/file/{}?token={}",
                                self.base_url, item_id, ino, self.token
                            ),
                            ext: if ext.starts_with('.') {
                                ext.to_string()
                            } else {
                                format!(".{}", ext)
                            },
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(files)
    }

    async fn get_progress(&self, item_id: &str) -> Result<f64, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/me/progress/{}", item_id)))
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        // No progress recorded yet
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0.0);
        }
        if !response.status().is_success() {
            return Err(ClientError::http(&response));
        }

        let progress: ProgressResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(progress.current_time.unwrap_or(0.0))
    }

    async fn update_progress(&self, item_id: &str, seconds: f64) -> Result<(), ClientError> {
        let payload = serde_json::json!({
            "currentTime": seconds,
            "duration": 0,
            "isFinished": false,
        });

        let response = self
            .http
            .patch(self.url(&format!("/api/me/progress/{}", item_id)))
            .bearer_auth(&self.token)
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::http(&response));
        }

        info!(item_id, seconds, "Updated Audiobookshelf progress");
        Ok(())
    }
}
