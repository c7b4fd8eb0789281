//! Narrow interfaces to the external systems the orchestrators drive.
//!
//! Live implementations live in `crate::adapters`; the simulated platform
//! implements every trait in memory.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub type Metadata = BTreeMap<String, String>;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fails when the cluster is unreachable or the namespace does not exist.
    async fn ping(&self, namespace: &str) -> Result<()>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<String>>;

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn wait_ready(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()>;

    /// Run a command inside a pod, returning its stdout.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>>;

    /// Export a config resource (`kind/name`) as a namespace-independent document.
    async fn read_config(&self, namespace: &str, resource: &str) -> Result<Vec<u8>>;

    async fn apply_config(&self, namespace: &str, document: Vec<u8>) -> Result<()>;
}

/// Where a relational database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConnection {
    pub namespace: String,
    pub pod: String,
    pub database: String,
    pub user: String,
}

#[async_trait]
pub trait DatabaseTool: Send + Sync {
    async fn dump(&self, conn: &DbConnection) -> Result<Vec<u8>>;

    async fn restore(&self, conn: &DbConnection, dump: Vec<u8>, clean: bool) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInstance {
    pub namespace: String,
    pub pod: String,
    pub snapshot_path: String,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn trigger_snapshot(&self, cache: &CacheInstance) -> Result<()>;

    async fn fetch_snapshot_file(&self, cache: &CacheInstance) -> Result<Vec<u8>>;

    /// Replace the store's contents with a snapshot file and reload it.
    async fn load_snapshot_file(&self, cache: &CacheInstance, snapshot: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait VectorIndexApi: Send + Sync {
    /// Create a snapshot and return its name.
    async fn create_snapshot(&self, base_url: &str, collection: &str) -> Result<String>;

    async fn fetch_snapshot(&self, base_url: &str, collection: &str, name: &str)
    -> Result<Vec<u8>>;

    async fn upload_snapshot(&self, base_url: &str, collection: &str, snapshot: Vec<u8>)
    -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub metadata: Metadata,
}

/// Durable off-site object storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `key`, overwriting any previous object. Returns its URI.
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: Metadata) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Fails when the storage is unreachable.
    async fn ping(&self) -> Result<()>;

    async fn put_file(&self, key: &str, path: &Path, metadata: Metadata) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        self.put(key, bytes, metadata).await
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let bytes = self.get(key).await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub value: String,
    pub ttl: u32,
}

/// DNS or service-discovery record management.
#[async_trait]
pub trait DnsApi: Send + Sync {
    async fn current_record(&self, name: &str) -> Result<Option<DnsRecord>>;

    async fn upsert_record(&self, name: &str, value: &str, ttl: u32) -> Result<()>;
}

/// HTTP health endpoint probing.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// `Ok(true)` on a 2xx response.
    async fn probe(&self, url: &str) -> Result<bool>;
}

/// Every external collaborator, bundled for wiring.
#[derive(Clone)]
pub struct Platform {
    pub cluster: Arc<dyn ClusterApi>,
    pub database: Arc<dyn DatabaseTool>,
    pub cache: Arc<dyn KeyValueStore>,
    pub vectors: Arc<dyn VectorIndexApi>,
    pub storage: Arc<dyn ObjectStorage>,
    pub dns: Arc<dyn DnsApi>,
    pub http: Arc<dyn HttpProbe>,
}
