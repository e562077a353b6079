// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST implementations of the document store and enrollment feed.
//!
//! The backend exposes documents at their path (`GET`/`PUT`), a `:batchSet`
//! endpoint, and per-collection `:query` endpoints. Create-only semantics
//! ride on `If-None-Match: *`; a 409/412 means the document already exists.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::{DocumentStore, EnrollmentFeed, EnrollmentIntent, StoreError, StoreResult};

fn client() -> Client {
    Client::builder().timeout(std::time::Duration::from_secs(10)).build().unwrap_or_default()
}

fn transport_err(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

pub struct RestStore {
    base_url: String,
    auth_token: Option<String>,
    client: Client,
}

impl RestStore {
    pub fn new(base_url: String, auth_token: Option<String>) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_owned(), auth_token, client: client() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl DocumentStore for RestStore {
    async fn create(&self, path: &str, record: &Value) -> StoreResult<()> {
        let req = self
            .client
            .put(self.url(path))
            .header("If-None-Match", "*")
            .json(record);
        let resp = self.apply_auth(req).send().await.map_err(transport_err)?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Err(StoreError::AlreadyExists)
            }
            s => Err(StoreError::Other(format!("create {path}: {s}"))),
        }
    }

    async fn batch_set(&self, entries: &BTreeMap<String, Value>) -> StoreResult<()> {
        let body = serde_json::json!({ "entries": entries, "merge": false });
        let req = self.client.post(format!("{}:batchSet", self.base_url)).json(&body);
        let resp = self.apply_auth(req).send().await.map_err(transport_err)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Other(format!("batchSet: {}", resp.status())))
        }
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
        limit: usize,
    ) -> StoreResult<Vec<Value>> {
        let body = serde_json::json!({
            "field": field,
            "op": "==",
            "value": value,
            "limit": limit,
        });
        let req = self.client.post(format!("{}:query", self.url(collection))).json(&body);
        let resp = self.apply_auth(req).send().await.map_err(transport_err)?;
        if !resp.status().is_success() {
            return Err(StoreError::Other(format!("query {collection}: {}", resp.status())));
        }
        let parsed: Value = resp.json().await.map_err(transport_err)?;
        let docs = parsed
            .get("documents")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(docs)
    }

    async fn read(&self, path: &str) -> StoreResult<Option<Value>> {
        let req = self.client.get(self.url(path));
        let resp = self.apply_auth(req).send().await.map_err(transport_err)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let value: Value = resp.json().await.map_err(transport_err)?;
                Ok(Some(value))
            }
            s => Err(StoreError::Other(format!("read {path}: {s}"))),
        }
    }

    async fn probe(&self) -> StoreResult<()> {
        self.query("_connection_test", "id", &Value::Null, 1).await.map(|_| ())
    }
}

// -- Enrollment feed ----------------------------------------------------------

pub struct RestFeed {
    base_url: String,
    auth_token: Option<String>,
    client: Client,
}

impl RestFeed {
    pub fn new(base_url: String, auth_token: Option<String>) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_owned(), auth_token, client: client() }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl EnrollmentFeed for RestFeed {
    async fn fetch_all(&self) -> anyhow::Result<Vec<(String, EnrollmentIntent)>> {
        let req = self.client.get(format!("{}/member_registrations.json", self.base_url));
        let resp = self.apply_auth(req).send().await?.error_for_status()?;
        let value: Value = resp.json().await?;
        // The feed returns `null` when the node is empty.
        let Some(children) = value.as_object() else { return Ok(Vec::new()) };

        let mut out = Vec::with_capacity(children.len());
        for (key, child) in children {
            match serde_json::from_value::<EnrollmentIntent>(child.clone()) {
                Ok(intent) => out.push((key.clone(), intent)),
                Err(e) => {
                    tracing::warn!(key = %key, err = %e, "malformed enrollment intent skipped");
                }
            }
        }
        Ok(out)
    }

    async fn update(&self, key: &str, patch: &Value) -> anyhow::Result<()> {
        let req = self
            .client
            .patch(format!("{}/member_registrations/{key}.json", self.base_url))
            .json(patch);
        self.apply_auth(req).send().await?.error_for_status()?;
        Ok(())
    }
}
