//! Storyteller REST API backend
//!
//! Tokens come from `POST /api/token` (form-encoded) and expire quickly, so
//! one is reused for at most 30 seconds and a 401 forces a single refresh and
//! retry. Positions are addressed by book UUID, never the numeric id.

use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clients::{ClientError, StorytellerActivity, StorytellerPosition, StorytellerService};

const TOKEN_MAX_AGE: Duration = Duration::from_secs(30);
const BOOK_CACHE_MAX_AGE: Duration = Duration::from_secs(3600);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
struct StorytellerBook {
    uuid: String,
    #[serde(default)]
    title: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Default)]
struct BookCache {
    books: Vec<StorytellerBook>,
    fetched_at: Option<Instant>,
}

pub struct StorytellerApiClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    token: Mutex<Option<(String, Instant)>>,
    books: Mutex<BookCache>,
}

impl StorytellerApiClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http: reqwest::Client::new(),
            token: Mutex::new(None),
            books: Mutex::new(BookCache::default()),
        }
    }

    async fn token(&self, force_refresh: bool) -> Result<String, ClientError> {
        let mut cached = self.token.lock().await;
        if !force_refresh {
            if let Some((token, issued)) = cached.as_ref() {
                if issued.elapsed() < TOKEN_MAX_AGE {
                    return Ok(token.clone());
                }
            }
        }

        let response = self
            .http
            .post(format!("{}/api/token", self.base_url))
            .form(&[("username", &self.username), ("password", &self.password)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::Auth(format!(
                "Storyteller login failed: HTTP {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        debug!("Issued Storyteller token");
        *cached = Some((body.access_token.clone(), Instant::now()));
        Ok(body.access_token)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let build = |token: &str| {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(token)
                .timeout(REQUEST_TIMEOUT);
            if let Some(body) = body {
                request = request.json(body);
            }
            request
        };

        let token = self.token(false).await?;
        let response = build(&token)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let token = self.token(true).await?;
        build(&token)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))
    }

    async fn find_book(&self, ebook_filename: &str) -> Result<Option<StorytellerBook>, ClientError> {
        let mut cache = self.books.lock().await;

        let stale = cache
            .fetched_at
            .map_or(true, |t| t.elapsed() > BOOK_CACHE_MAX_AGE);
        if stale || cache.books.is_empty() {
            let response = self.send(reqwest::Method::GET, "/api/v2/books", None).await?;
            if !response.status().is_success() {
                return Err(ClientError::http(&response));
            }
            cache.books = response
                .json()
                .await
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
            cache.fetched_at = Some(Instant::now());
            debug!(books = cache.books.len(), "Refreshed Storyteller book cache");
        }

        let found = super::match_title(ebook_filename, cache.books.iter().map(|b| b.title.as_str()))
            .map(|i| cache.books[i].clone());
        if found.is_none() {
            debug!(ebook_filename, "Book not found in Storyteller");
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl StorytellerService for StorytellerApiClient {
    fn backend(&self) -> &'static str {
        "api"
    }

    async fn check_connection(&self) -> Result<(), ClientError> {
        self.token(false).await?;
        info!(url = %self.base_url, "Connected to Storyteller API");
        Ok(())
    }

    async fn get_progress(
        &self,
        ebook_filename: &str,
    ) -> Result<Option<StorytellerPosition>, ClientError> {
        let Some(book) = self.find_book(ebook_filename).await? else {
            return Ok(None);
        };

        let path = format!("/api/books/{}/positions", book.uuid);
        let response = self.send(reqwest::Method::GET, &path, None).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ClientError::http(&response));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        Ok(Some(StorytellerPosition {
            percentage: data
                .pointer("/locator/locations/totalProgression")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            timestamp: data.get("timestamp").and_then(Value::as_i64),
            href: None,
            fragment: None,
        }))
    }

    async fn update_progress(
        &self,
        ebook_filename: &str,
        percentage: f64,
    ) -> Result<bool, ClientError> {
        let Some(book) = self.find_book(ebook_filename).await? else {
            return Ok(false);
        };

        let payload = serde_json::json!({
            "locator": { "locations": { "totalProgression": percentage } }
        });
        let path = format!("/api/books/{}/positions", book.uuid);
        let response = self
            .send(reqwest::Method::POST, &path, Some(&payload))
            .await?;

        if response.status() != reqwest::StatusCode::NO_CONTENT
            && !response.status().is_success()
        {
            warn!(uuid = %book.uuid, status = %response.status(), "Storyteller update rejected");
            return Err(ClientError::http(&response));
        }

        info!(uuid = %book.uuid, percentage, "Updated Storyteller progress");
        Ok(true)
    }

    async fn get_recent_activity(
        &self,
        _hours: u64,
        _min_progress: f64,
    ) -> Result<Vec<StorytellerActivity>, ClientError> {
        // The REST API has no cross-book activity feed
        Ok(Vec::new())
    }
}
