// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! [`DocumentStore`] over the CouchDB REST API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | `database_exists` | `HEAD /{db}` |
//! | `create_database` / `delete_database` | `PUT` / `DELETE /{db}` |
//! | `list_databases` | `GET /_all_dbs` |
//! | `server_identity` | `GET /` |
//! | `get_document` / `put_document` | `GET` / `PUT /{db}/{id}` |
//! | `bulk_write` | `POST /{db}/_bulk_docs` |
//! | `all_docs` | `GET /{db}/_all_docs` (JSON-encoded keys) |
//! | `put_attachment` | `PUT /{db}/{id}/{name}?rev=` |
//!
//! Credentials embedded in the base URL are stripped and sent as basic
//! auth. Database names and document ids are percent-encoded as single
//! path segments, except the `_design/` namespace.

use super::{AllDocsPage, BoxFuture, BulkFailure, BulkWriteResult, DocRow, Document, DocumentStore};
use crate::error::{CouchError, CouchResult};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// HTTP client for one CouchDB server.
#[derive(Clone)]
pub struct CouchClient {
    client: reqwest::Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchClient")
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct RevResponse {
    rev: String,
}

#[derive(Debug, Deserialize)]
struct BulkRow {
    #[serde(default)]
    id: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
    value: AllDocsValue,
    #[serde(default)]
    doc: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct AllDocsValue {
    rev: String,
}

impl CouchClient {
    /// Client for `url`. `timeout` bounds each request; `None` disables it.
    pub fn new(url: &str, timeout: Option<Duration>) -> CouchResult<Self> {
        let mut base = Url::parse(url).map_err(|e| CouchError::InvalidUrl(format!("{}: {}", url, e)))?;
        if base.cannot_be_a_base() {
            return Err(CouchError::InvalidUrl(url.to_string()));
        }
        let username = (!base.username().is_empty()).then(|| base.username().to_string());
        let password = base.password().map(str::to_string);
        // set_username/set_password only fail for cannot-be-a-base URLs
        let _ = base.set_username("");
        let _ = base.set_password(None);

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| CouchError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base,
            username,
            password,
        })
    }

    /// Base URL without credentials.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, db: Option<&str>, rest: &[&str]) -> CouchResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CouchError::InvalidUrl(self.base.to_string()))?;
            segments.pop_if_empty();
            if let Some(db) = db {
                segments.push(db);
            }
            for part in rest {
                match part.strip_prefix("_design/") {
                    Some(name) => {
                        segments.push("_design").push(name);
                    }
                    None => {
                        segments.push(part);
                    }
                }
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        trace!(method = %method, url = %url, "CouchDB request");
        let request = self.client.request(method, url);
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, resource: &str) -> CouchResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| CouchError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: Option<ErrorBody> = response.json().await.ok();
        Err(status_error(status, resource, body))
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> CouchResult<T> {
        response
            .json()
            .await
            .map_err(|e| CouchError::Decode(e.to_string()))
    }
}

fn status_error(status: StatusCode, resource: &str, body: Option<ErrorBody>) -> CouchError {
    match status {
        StatusCode::NOT_FOUND => CouchError::not_found(resource),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => CouchError::conflict(resource),
        other => {
            let (error, reason) = body
                .map(|b| (b.error, b.reason))
                .unwrap_or_else(|| (String::new(), String::new()));
            CouchError::Http {
                status: other.as_u16(),
                error,
                reason,
            }
        }
    }
}

fn bulk_result(rows: Vec<BulkRow>) -> BulkWriteResult {
    let mut result = BulkWriteResult::default();
    for row in rows {
        match row.error {
            None => result.ok_count += 1,
            Some(error) => result.failures.push(BulkFailure {
                id: row.id,
                reason: match row.reason {
                    Some(reason) if !reason.is_empty() => format!("{}: {}", error, reason),
                    _ => error,
                },
            }),
        }
    }
    result
}

fn json_key(key: &str) -> String {
    Value::String(key.to_string()).to_string()
}

impl DocumentStore for CouchClient {
    fn database_exists<'a>(&'a self, db: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let url = self.url(Some(db), &[])?;
            match self.send(self.request(Method::HEAD, url), db).await {
                Ok(_) => Ok(true),
                Err(CouchError::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn create_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let url = self.url(Some(db), &[])?;
            self.send(self.request(Method::PUT, url), db).await?;
            debug!(db = %db, "Created database");
            Ok(())
        })
    }

    fn delete_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let url = self.url(Some(db), &[])?;
            self.send(self.request(Method::DELETE, url), db).await?;
            debug!(db = %db, "Deleted database");
            Ok(())
        })
    }

    fn list_databases(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let url = self.url(None, &["_all_dbs"])?;
            let response = self.send(self.request(Method::GET, url), "_all_dbs").await?;
            Self::json(response).await
        })
    }

    fn server_identity(&self) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            let url = self.url(None, &[])?;
            let response = self.send(self.request(Method::GET, url), "/").await?;
            Self::json(response).await
        })
    }

    fn get_document<'a>(&'a self, db: &'a str, id: &'a str) -> BoxFuture<'a, Document> {
        Box::pin(async move {
            let url = self.url(Some(db), &[id])?;
            let response = self.send(self.request(Method::GET, url), id).await?;
            Self::json(response).await
        })
    }

    fn put_document<'a>(&'a self, db: &'a str, doc: Document) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let response = match super::doc_id(&doc) {
                Some(id) => {
                    let url = self.url(Some(db), &[id])?;
                    let id = id.to_string();
                    self.send(self.request(Method::PUT, url).json(&doc), &id).await?
                }
                None => {
                    let url = self.url(Some(db), &[])?;
                    self.send(self.request(Method::POST, url).json(&doc), db).await?
                }
            };
            let body: RevResponse = Self::json(response).await?;
            Ok(body.rev)
        })
    }

    fn bulk_write<'a>(
        &'a self,
        db: &'a str,
        docs: Vec<Document>,
        new_edits: bool,
    ) -> BoxFuture<'a, BulkWriteResult> {
        Box::pin(async move {
            let url = self.url(Some(db), &["_bulk_docs"])?;
            let body = serde_json::json!({ "docs": docs, "new_edits": new_edits });
            let response = self.send(self.request(Method::POST, url).json(&body), db).await?;
            // new_edits=false answers with an empty list on full success
            let rows: Vec<BulkRow> = Self::json(response).await?;
            let mut result = bulk_result(rows);
            if !new_edits {
                result.ok_count = docs.len().saturating_sub(result.failures.len());
            }
            Ok(result)
        })
    }

    fn all_docs<'a>(&'a self, db: &'a str, page: &'a AllDocsPage) -> BoxFuture<'a, Vec<DocRow>> {
        Box::pin(async move {
            let mut url = self.url(Some(db), &["_all_docs"])?;
            {
                let mut query = url.query_pairs_mut();
                if let Some(start) = &page.start_key {
                    query.append_pair("startkey", &json_key(start));
                }
                if let Some(end) = &page.end_key {
                    query.append_pair("endkey", &json_key(end));
                }
                if page.limit > 0 {
                    query.append_pair("limit", &page.limit.to_string());
                }
                if page.skip > 0 {
                    query.append_pair("skip", &page.skip.to_string());
                }
                if page.include_docs {
                    query.append_pair("include_docs", "true");
                }
            }
            let response = self.send(self.request(Method::GET, url), db).await?;
            let body: AllDocsResponse = Self::json(response).await?;
            Ok(body
                .rows
                .into_iter()
                .map(|row| DocRow {
                    id: row.id,
                    rev: row.value.rev,
                    doc: row.doc,
                })
                .collect())
        })
    }

    fn put_attachment<'a>(
        &'a self,
        db: &'a str,
        id: &'a str,
        rev: &'a str,
        name: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut url = self.url(Some(db), &[id, name])?;
            url.query_pairs_mut().append_pair("rev", rev);
            let request = self
                .request(Method::PUT, url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(data);
            let response = self.send(request, id).await?;
            let body: RevResponse = Self::json(response).await?;
            Ok(body.rev)
        })
    }
}
