//! HTTP collaborators: the vector index's snapshot API, the DNS record API,
//! and health endpoints.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::core::platform::{DnsApi, DnsRecord, HttpProbe, VectorIndexApi};

fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Snapshot endpoints of a Qdrant-compatible vector index.
pub struct VectorIndexClient {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SnapshotResponse {
    result: SnapshotDescription,
}

#[derive(Deserialize)]
struct SnapshotDescription {
    name: String,
}

impl VectorIndexClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
        })
    }
}

fn collection_url(base_url: &str, collection: &str) -> String {
    format!("{}/collections/{}", base_url.trim_end_matches('/'), collection)
}

#[async_trait]
impl VectorIndexApi for VectorIndexClient {
    async fn create_snapshot(&self, base_url: &str, collection: &str) -> Result<String> {
        let url = format!("{}/snapshots?wait=true", collection_url(base_url, collection));
        let response: SnapshotResponse = self
            .client
            .post(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Unexpected snapshot response")?;
        debug!(collection, snapshot = %response.result.name, "Vector snapshot created");
        Ok(response.result.name)
    }

    async fn fetch_snapshot(&self, base_url: &str, collection: &str, name: &str) -> Result<Vec<u8>> {
        let url = format!("{}/snapshots/{}", collection_url(base_url, collection), name);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    async fn upload_snapshot(&self, base_url: &str, collection: &str, snapshot: Vec<u8>) -> Result<()> {
        let url = format!(
            "{}/snapshots/upload?priority=snapshot&wait=true",
            collection_url(base_url, collection)
        );
        let part = Part::bytes(snapshot).file_name(format!("{collection}.snapshot"));
        let form = Form::new().part("snapshot", part);
        self.client
            .post(&url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Record API of the DNS / service-discovery provider.
///
/// `GET {api}/records/{name}` returns `{name, value, ttl}` or 404;
/// `PUT {api}/records/{name}` takes `{value, ttl}`.
pub struct DnsClient {
    api_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RecordUpdate<'a> {
    value: &'a str,
    ttl: u32,
}

#[derive(Deserialize)]
struct RecordBody {
    name: String,
    value: String,
    ttl: u32,
}

impl DnsClient {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client: client(timeout)?,
        })
    }

    fn record_url(&self, name: &str) -> String {
        format!("{}/records/{}", self.api_url, name)
    }
}

#[async_trait]
impl DnsApi for DnsClient {
    async fn current_record(&self, name: &str) -> Result<Option<DnsRecord>> {
        let response = self.client.get(self.record_url(name)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: RecordBody = response
            .error_for_status()?
            .json()
            .await
            .map_err(|e| anyhow!("Unexpected record body for {name}: {e}"))?;
        Ok(Some(DnsRecord {
            name: body.name,
            value: body.value,
            ttl: body.ttl,
        }))
    }

    async fn upsert_record(&self, name: &str, value: &str, ttl: u32) -> Result<()> {
        self.client
            .put(self.record_url(name))
            .json(&RecordUpdate { value, ttl })
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("record update for {name} rejected"))?;
        Ok(())
    }
}

pub struct HttpHealth {
    client: reqwest::Client,
}

impl HttpHealth {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
        })
    }
}

#[async_trait]
impl HttpProbe for HttpHealth {
    async fn probe(&self, url: &str) -> Result<bool> {
        match self.client.get(url).send().await {
            Ok(response) => {
                debug!(url, status = %response.status(), "Health probe answered");
                Ok(response.status().is_success())
            }
            Err(e) => {
                debug!(url, error = %e, "Health probe failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_tolerate_trailing_slashes() {
        assert_eq!(
            collection_url("http://qdrant:6333/", "documents"),
            "http://qdrant:6333/collections/documents"
        );
        let dns = DnsClient::new("http://dns.internal/", Duration::from_secs(1)).unwrap();
        assert_eq!(dns.record_url("rag.example"), "http://dns.internal/records/rag.example");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unhealthy() {
        let probe = HttpHealth::new(Duration::from_millis(500)).unwrap();
        assert!(!probe.probe("http://127.0.0.1:1/healthz").await.unwrap());
    }
}
