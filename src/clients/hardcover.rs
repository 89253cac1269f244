//! Hardcover GraphQL client

use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{ClientError, HardcoverMatch, HardcoverService, ReadingStatus};
use crate::config::HardcoverConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const EDITION_BY_ISBN_13: &str = r#"
query ($isbn: String!) {
    editions(where: { isbn_13: { _eq: $isbn } }) { id pages book { id title } }
}"#;

const EDITION_BY_ISBN_10: &str = r#"
query ($isbn: String!) {
    editions(where: { isbn_10: { _eq: $isbn } }) { id pages book { id title } }
}"#;

const SEARCH_BOOKS: &str = r#"
query ($query: String!) {
    search(query: $query, per_page: 5, page: 1, query_type: "Book") { ids }
}"#;

const BOOK_BY_ID: &str = r#"
query ($id: Int!) {
    books(where: { id: { _eq: $id } }) { id title }
}"#;

const DEFAULT_EDITIONS: &str = r#"
query ($bookId: Int!) {
    books_by_pk(id: $bookId) {
        default_ebook_edition { id pages }
        default_physical_edition { id pages }
    }
}"#;

const USER_BOOK: &str = r#"
query ($bookId: Int!, $userId: Int!) {
    user_books(where: { book_id: { _eq: $bookId }, user_id: { _eq: $userId } }) {
        id status_id edition_id
    }
}"#;

const LATEST_READ: &str = r#"
query ($userBookId: Int!) {
    user_book_reads(where: { user_book_id: { _eq: $userBookId } }, order_by: { id: desc }, limit: 1) { id }
}"#;

const INSERT_USER_BOOK: &str = r#"
mutation ($object: UserBookCreateInput!) {
    insert_user_book(object: $object) { error user_book { id status_id edition_id } }
}"#;

const UPDATE_READ: &str = r#"
mutation ($id: Int!, $pages: Int, $editionId: Int) {
    update_user_book_read(id: $id, object: { progress_pages: $pages, edition_id: $editionId }) {
        error user_book_read { id }
    }
}"#;

const INSERT_READ: &str = r#"
mutation ($userBookId: Int!, $pages: Int, $editionId: Int) {
    insert_user_book_read(user_book_id: $userBookId, user_book_read: { progress_pages: $pages, edition_id: $editionId }) {
        error user_book_read { id }
    }
}"#;

pub struct HardcoverClient {
    api_url: String,
    token: String,
    http: reqwest::Client,
    user_id: OnceCell<i64>,
}

impl HardcoverClient {
    /// `None` without a token
    pub fn new(config: &HardcoverConfig) -> Option<Self> {
        let token = config.token.as_deref().filter(|t| !t.is_empty())?;
        Some(Self {
            api_url: config.api_url.clone(),
            token: token.trim_start_matches("Bearer ").to_string(),
            http: reqwest::Client::new(),
            user_id: OnceCell::new(),
        })
    }

    /// Run a GraphQL operation and return its `data`
    async fn query(&self, query: &str, variables: Value) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Auth("Hardcover rejected the token".to_string()));
        }
        if !response.status().is_success() {
            return Err(ClientError::http(&response));
        }

        let mut body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(ClientError::InvalidResponse(format!("GraphQL errors: {}", errors)));
        }
        match body.get_mut("data").map(Value::take) {
            Some(data) if !data.is_null() => Ok(data),
            _ => Err(ClientError::InvalidResponse("GraphQL response without data".to_string())),
        }
    }

    async fn user_id(&self) -> Result<i64, ClientError> {
        self.user_id
            .get_or_try_init(|| async {
                let data = self.query("{ me { id } }", json!({})).await?;
                data.pointer("/me/0/id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| ClientError::InvalidResponse("no user id".to_string()))
            })
            .await
            .copied()
    }

    async fn search_by_isbn(&self, isbn: &str) -> Result<Option<HardcoverMatch>, ClientError> {
        let query = if isbn.len() == 13 {
            EDITION_BY_ISBN_13
        } else {
            EDITION_BY_ISBN_10
        };
        let data = self.query(query, json!({ "isbn": isbn })).await?;
        let Some(edition) = data.pointer("/editions/0") else {
            return Ok(None);
        };

        Ok(edition
            .pointer("/book/id")
            .and_then(Value::as_i64)
            .map(|book_id| HardcoverMatch {
                book_id,
                edition_id: edition.get("id").and_then(Value::as_i64),
                pages: edition.get("pages").and_then(Value::as_i64),
                title: edition
                    .pointer("/book/title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }))
    }

    async fn search_by_title_author(
        &self,
        title: &str,
        author: Option<&str>,
    ) -> Result<Option<HardcoverMatch>, ClientError> {
        let search = format!("{} {}", title, author.unwrap_or_default());
        let data = self.query(SEARCH_BOOKS, json!({ "query": search.trim() })).await?;
        let Some(book_id) = data.pointer("/search/ids/0").and_then(id_value) else {
            return Ok(None);
        };

        let data = self.query(BOOK_BY_ID, json!({ "id": book_id })).await?;
        let Some(book) = data.pointer("/books/0") else {
            return Ok(None);
        };

        let editions = self.query(DEFAULT_EDITIONS, json!({ "bookId": book_id })).await?;
        let edition = editions
            .pointer("/books_by_pk/default_ebook_edition")
            .filter(|e| !e.is_null())
            .or_else(|| {
                editions
                    .pointer("/books_by_pk/default_physical_edition")
                    .filter(|e| !e.is_null())
            });

        Ok(Some(HardcoverMatch {
            book_id,
            edition_id: edition.and_then(|e| e.get("id")).and_then(Value::as_i64),
            pages: edition.and_then(|e| e.get("pages")).and_then(Value::as_i64),
            title: book
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }))
    }

    async fn find_user_book(&self, book_id: i64) -> Result<Option<i64>, ClientError> {
        let user_id = self.user_id().await?;
        let data = self
            .query(USER_BOOK, json!({ "bookId": book_id, "userId": user_id }))
            .await?;
        Ok(data.pointer("/user_books/0/id").and_then(Value::as_i64))
    }
}

/// Search ids come back as numbers or numeric strings
fn id_value(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

#[async_trait::async_trait]
impl HardcoverService for HardcoverClient {
    async fn check_connection(&self) -> Result<i64, ClientError> {
        let user_id = self.user_id().await?;
        info!(user_id, "Connected to Hardcover");
        Ok(user_id)
    }

    async fn find_book(
        &self,
        isbn: Option<&str>,
        title: &str,
        author: Option<&str>,
    ) -> Result<Option<HardcoverMatch>, ClientError> {
        if let Some(isbn) = isbn.map(str::trim).filter(|i| !i.is_empty()) {
            if let Some(found) = self.search_by_isbn(isbn).await? {
                debug!(isbn, book_id = found.book_id, "Hardcover ISBN match");
                return Ok(Some(found));
            }
        }
        if title.trim().is_empty() {
            return Ok(None);
        }
        self.search_by_title_author(title, author).await
    }

    async fn update_status(
        &self,
        book_id: i64,
        status: ReadingStatus,
        edition_id: Option<i64>,
    ) -> Result<(), ClientError> {
        let mut object = json!({
            "book_id": book_id,
            "status_id": status as i64,
            "privacy_setting_id": 1,
        });
        if let Some(edition_id) = edition_id {
            object["edition_id"] = json!(edition_id);
        }

        self.query(INSERT_USER_BOOK, json!({ "object": object })).await?;
        info!(book_id, status = ?status, "Updated Hardcover status");
        Ok(())
    }

    async fn update_progress(
        &self,
        book_id: i64,
        page: i64,
        edition_id: Option<i64>,
    ) -> Result<bool, ClientError> {
        let Some(user_book_id) = self.find_user_book(book_id).await? else {
            return Ok(false);
        };

        let reads = self
            .query(LATEST_READ, json!({ "userBookId": user_book_id }))
            .await?;

        match reads.pointer("/user_book_reads/0/id").and_then(Value::as_i64) {
            Some(read_id) => {
                self.query(
                    UPDATE_READ,
                    json!({ "id": read_id, "pages": page, "editionId": edition_id }),
                )
                .await?;
            }
            None => {
                self.query(
                    INSERT_READ,
                    json!({ "userBookId": user_book_id, "pages": page, "editionId": edition_id }),
                )
                .await?;
            }
        }

        info!(book_id, page, "Updated Hardcover progress");
        Ok(true)
    }
}
