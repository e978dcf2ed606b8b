use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::escape::escape_literal;

/// One row of a SELECT result; a column is `None` when the variable was
/// unbound in that solution.
pub type ResultRow = Vec<Option<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Connection,
    Query,
    Update,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorDomain::Connection => "connection",
            ErrorDomain::Query => "query",
            ErrorDomain::Update => "update",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
#[error("store {domain} error {code}: {message}")]
pub struct StoreError {
    pub domain: ErrorDomain,
    pub code: u16,
    pub message: String,
}

impl StoreError {
    pub fn connection(code: u16, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Connection,
            code,
            message: message.into(),
        }
    }

    pub fn query(code: u16, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Query,
            code,
            message: message.into(),
        }
    }

    pub fn update(code: u16, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Update,
            code,
            message: message.into(),
        }
    }
}

/// The store-side surface the sync engine consumes. The engine never talks
/// to a store any other way, so tests substitute fakes for this trait.
///
/// A returned error is terminal for that call; the engine does not retry.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Establishes the connection. Must be awaited once before any
    /// query/update; a failure here is fatal to engine startup.
    async fn open(&self) -> Result<(), StoreError>;

    /// Runs a SELECT and returns rows ordered per the statement's
    /// projection.
    async fn query(&self, statement: &str) -> Result<Vec<ResultRow>, StoreError>;

    /// Submits an update statement. `batch_hint` tells the store how many
    /// item blocks the statement carries.
    async fn update(&self, statement: &str, batch_hint: usize) -> Result<(), StoreError>;

    /// Escapes a string for embedding in a quoted literal of this store's
    /// statement syntax.
    fn escape(&self, input: &str) -> String;
}

#[derive(Deserialize)]
struct SelectResults {
    head: SelectHead,
    results: SelectBindings,
}

#[derive(Deserialize)]
struct SelectHead {
    vars: Vec<String>,
}

#[derive(Deserialize)]
struct SelectBindings {
    bindings: Vec<HashMap<String, BoundTerm>>,
}

#[derive(Deserialize)]
struct BoundTerm {
    value: String,
}

/// Store client for an HTTP endpoint speaking the standard SPARQL
/// protocol: queries against `/sparql`, updates against `/update`.
#[derive(Clone)]
pub struct HttpStoreClient {
    http: Client,
    base_url: Url,
}

impl HttpStoreClient {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)
                .map_err(|err| StoreError::connection(0, err.to_string()))?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.base_url
            .join(path)
            .map_err(|err| StoreError::connection(0, err.to_string()))
    }
}

#[async_trait]
impl StoreClient for HttpStoreClient {
    async fn open(&self) -> Result<(), StoreError> {
        let url = self.endpoint("sparql")?;
        let response = self
            .http
            .post(url)
            .form(&[("query", "ASK { }")])
            .send()
            .await
            .map_err(|err| StoreError::connection(0, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::connection(status.as_u16(), body));
        }
        Ok(())
    }

    async fn query(&self, statement: &str) -> Result<Vec<ResultRow>, StoreError> {
        let url = self.endpoint("sparql")?;
        let response = self
            .http
            .post(url)
            .header("Accept", "application/sparql-results+json")
            .form(&[("query", statement)])
            .send()
            .await
            .map_err(|err| StoreError::query(0, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::query(status.as_u16(), body));
        }
        let results: SelectResults = response
            .json()
            .await
            .map_err(|err| StoreError::query(0, err.to_string()))?;
        let rows = results
            .results
            .bindings
            .into_iter()
            .map(|solution| {
                results
                    .head
                    .vars
                    .iter()
                    .map(|var| solution.get(var).map(|term| term.value.clone()))
                    .collect()
            })
            .collect();
        Ok(rows)
    }

    async fn update(&self, statement: &str, batch_hint: usize) -> Result<(), StoreError> {
        let mut url = self.endpoint("update")?;
        if batch_hint > 1 {
            url.query_pairs_mut()
                .append_pair("batch-size", &batch_hint.to_string());
        }
        let response = self
            .http
            .post(url)
            .form(&[("update", statement)])
            .send()
            .await
            .map_err(|err| StoreError::update(0, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::update(status.as_u16(), body));
        }
        Ok(())
    }

    fn escape(&self, input: &str) -> String {
        escape_literal(input)
    }
}
