//! In-memory platform for `--simulation` runs and tests.
//!
//! Holds per-namespace state for every component kind, records each call it
//! receives, and fails on demand through injected [`Fault`]s.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::config::EnvironmentConfig;
use crate::core::platform::{
    CacheInstance, ClusterApi, DatabaseTool, DbConnection, DnsApi, DnsRecord, HttpProbe,
    KeyValueStore, Metadata, ObjectInfo, ObjectStorage, Platform, VectorIndexApi,
};
use crate::core::registry::{CaptureSpec, ComponentDescriptor, ComponentKind, HealthCheckSpec};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fault {
    /// Capture-side calls for this component kind fail.
    Capture(ComponentKind),
    /// Restore-side calls for this component kind fail.
    Restore(ComponentKind),
    /// HTTP probes of this URL report unhealthy.
    Unhealthy(String),
    /// Exec in this pod fails.
    ExecFails(String),
    DeploymentNotReady(String),
    ClusterDown,
    StorageDown,
    DnsDown,
    /// Storage writes of keys containing this text fail.
    PutFails(String),
    /// Storage writes of keys containing this text never return.
    PutStalls(String),
}

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    deployments: BTreeMap<String, BTreeSet<String>>,
    databases: BTreeMap<(String, String), Vec<u8>>,
    caches: BTreeMap<(String, String), Vec<u8>>,
    vectors: BTreeMap<(String, String), Vec<u8>>,
    vector_snapshots: BTreeMap<String, Vec<u8>>,
    objects: BTreeMap<(String, String, String), Vec<u8>>,
    configs: BTreeMap<(String, String), Vec<u8>>,
    exec_responses: BTreeMap<(String, String, String), Vec<u8>>,
    blobs: BTreeMap<String, (Vec<u8>, Metadata)>,
    dns: BTreeMap<String, DnsRecord>,
    faults: BTreeSet<Fault>,
    calls: Vec<String>,
    puts: usize,
}

impl State {
    fn fault(&self, fault: &Fault) -> bool {
        self.faults.contains(fault)
    }

    fn check(&mut self, fault: Fault, call: String) -> Result<()> {
        self.calls.push(call.clone());
        if self.faults.contains(&fault) {
            bail!("simulated failure: {call}");
        }
        Ok(())
    }

    fn require_namespace(&self, namespace: &str) -> Result<()> {
        if self.fault(&Fault::ClusterDown) {
            bail!("simulated cluster unreachable");
        }
        if !self.namespaces.contains(namespace) {
            bail!("namespace '{namespace}' not found");
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SimulatedPlatform {
    state: Arc<Mutex<State>>,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Collaborators backed entirely by this simulation.
    pub fn platform(&self) -> Platform {
        self.platform_with_storage(Arc::new(self.clone()))
    }

    /// Simulated cluster and services, with a real storage backend.
    pub fn platform_with_storage(&self, storage: Arc<dyn ObjectStorage>) -> Platform {
        Platform {
            cluster: Arc::new(self.clone()),
            database: Arc::new(self.clone()),
            cache: Arc::new(self.clone()),
            vectors: Arc::new(self.clone()),
            storage,
            dns: Arc::new(self.clone()),
            http: Arc::new(self.clone()),
        }
    }

    /// Create the environment's namespace with synthetic content for every
    /// component, and make every health check pass.
    pub fn seed(&self, env: &EnvironmentConfig, components: &[ComponentDescriptor]) {
        let mut state = self.state();
        let ns = env.namespace.clone();
        state.namespaces.insert(ns.clone());

        for component in components {
            let c = component.resolve(env);
            let content = |what: &str| format!("{}:{}:{}", env.name, c.name, what).into_bytes();

            for deployment in &c.restore.restart_deployments {
                state
                    .deployments
                    .entry(ns.clone())
                    .or_default()
                    .insert(deployment.clone());
            }

            match &c.capture {
                CaptureSpec::Database { database, .. } => {
                    state
                        .databases
                        .insert((ns.clone(), database.clone()), content(database));
                }
                CaptureSpec::Cache { pod, .. } => {
                    state.caches.insert((ns.clone(), pod.clone()), content("keys"));
                }
                CaptureSpec::VectorIndex {
                    base_url,
                    collections,
                } => {
                    for collection in collections {
                        state
                            .vectors
                            .insert((base_url.clone(), collection.clone()), content(collection));
                    }
                }
                CaptureSpec::ObjectStore { pod, path } => {
                    state
                        .objects
                        .insert((ns.clone(), pod.clone(), path.clone()), content(path));
                }
                CaptureSpec::Configuration { resources } => {
                    for resource in resources {
                        let document = config_document(resource, &env.name);
                        state.configs.insert((ns.clone(), resource.clone()), document);
                    }
                }
            }

            match &c.health {
                HealthCheckSpec::Exec {
                    pod,
                    command,
                    expect,
                } => {
                    let out = expect.clone().unwrap_or_else(|| "ok".into()).into_bytes();
                    state
                        .exec_responses
                        .insert((ns.clone(), pod.clone(), command.join(" ")), out);
                }
                HealthCheckSpec::DeploymentReady { deployment } => {
                    state
                        .deployments
                        .entry(ns.clone())
                        .or_default()
                        .insert(deployment.clone());
                }
                HealthCheckSpec::Http { .. } | HealthCheckSpec::None => {}
            }
        }
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.insert(fault);
    }

    pub fn clear(&self, fault: &Fault) {
        self.state().faults.remove(fault);
    }

    pub fn set_record(&self, name: &str, value: &str, ttl: u32) {
        self.state().dns.insert(
            name.to_string(),
            DnsRecord {
                name: name.to_string(),
                value: value.to_string(),
                ttl,
            },
        );
    }

    pub fn record(&self, name: &str) -> Option<DnsRecord> {
        self.state().dns.get(name).cloned()
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn dns_calls(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with("dns."))
            .count()
    }

    /// Successful object-storage writes.
    pub fn puts(&self) -> usize {
        self.state().puts
    }

    pub fn database(&self, namespace: &str, database: &str) -> Option<Vec<u8>> {
        self.state()
            .databases
            .get(&(namespace.to_string(), database.to_string()))
            .cloned()
    }

    pub fn cache(&self, namespace: &str, pod: &str) -> Option<Vec<u8>> {
        self.state()
            .caches
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned()
    }

    pub fn collection(&self, base_url: &str, collection: &str) -> Option<Vec<u8>> {
        self.state()
            .vectors
            .get(&(base_url.to_string(), collection.to_string()))
            .cloned()
    }

    pub fn objects(&self, namespace: &str, pod: &str, path: &str) -> Option<Vec<u8>> {
        self.state()
            .objects
            .get(&(namespace.to_string(), pod.to_string(), path.to_string()))
            .cloned()
    }

    pub fn config(&self, namespace: &str, resource: &str) -> Option<Vec<u8>> {
        self.state()
            .configs
            .get(&(namespace.to_string(), resource.to_string()))
            .cloned()
    }

    pub fn blob_keys(&self) -> Vec<String> {
        self.state().blobs.keys().cloned().collect()
    }
}

/// Namespace-independent export shaped like `kubectl get -o json` output.
fn config_document(resource: &str, environment: &str) -> Vec<u8> {
    let (kind, name) = resource.split_once('/').unwrap_or(("configmap", resource));
    let doc = serde_json::json!({
        "kind": kind,
        "metadata": { "name": name },
        "data": { "environment": environment },
    });
    doc.to_string().into_bytes()
}

fn resource_of(document: &[u8]) -> Result<String> {
    let doc: serde_json::Value = serde_json::from_slice(document)?;
    let kind = doc["kind"]
        .as_str()
        .ok_or_else(|| anyhow!("document has no kind"))?;
    let name = doc["metadata"]["name"]
        .as_str()
        .ok_or_else(|| anyhow!("document has no metadata.name"))?;
    Ok(format!("{}/{}", kind.to_lowercase(), name))
}

/// Value following `flag` in an argument list.
fn arg_after<'a>(command: &'a [String], flag: &str) -> Option<&'a str> {
    command
        .iter()
        .position(|a| a == flag)
        .and_then(|i| command.get(i + 1))
        .map(String::as_str)
}

#[async_trait]
impl ClusterApi for SimulatedPlatform {
    async fn ping(&self, namespace: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("cluster.ping {namespace}"));
        state.require_namespace(namespace)
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<String>> {
        let state = self.state();
        state.require_namespace(namespace)?;
        Ok(state
            .deployments
            .get(namespace)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.require_namespace(namespace)?;
        state.calls.push(format!("cluster.restart {namespace}/{name}"));
        state
            .deployments
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    async fn wait_ready(&self, namespace: &str, name: &str, _timeout: Duration) -> Result<()> {
        let state = self.state();
        state.require_namespace(namespace)?;
        if state.fault(&Fault::DeploymentNotReady(name.to_string())) {
            bail!("deployment {namespace}/{name} not ready");
        }
        let known = state
            .deployments
            .get(namespace)
            .is_some_and(|d| d.contains(name));
        if !known {
            bail!("deployment {namespace}/{name} not found");
        }
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let mut state = self.state();
        state.require_namespace(namespace)?;
        let line = command.join(" ");
        if state.fault(&Fault::ExecFails(pod.to_string())) {
            state.calls.push(format!("cluster.exec {namespace}/{pod} {line}"));
            bail!("simulated exec failure in {pod}");
        }

        match command.first().map(String::as_str) {
            Some("tar") if command.iter().any(|a| a == "-cf") => {
                let path = arg_after(command, "-C").unwrap_or("/");
                state.check(
                    Fault::Capture(ComponentKind::ObjectStore),
                    format!("capture object-store {namespace}"),
                )?;
                Ok(state
                    .objects
                    .get(&(namespace.to_string(), pod.to_string(), path.to_string()))
                    .cloned()
                    .unwrap_or_default())
            }
            Some("tar") if command.iter().any(|a| a == "-xf") => {
                let path = arg_after(command, "-C").unwrap_or("/").to_string();
                state.check(
                    Fault::Restore(ComponentKind::ObjectStore),
                    format!("restore object-store {namespace}"),
                )?;
                state
                    .objects
                    .insert((namespace.to_string(), pod.to_string(), path), stdin.unwrap_or_default());
                Ok(Vec::new())
            }
            Some("find") if command.iter().any(|a| a == "-delete") => {
                let path = command.get(1).cloned().unwrap_or_default();
                state.calls.push(format!("cluster.exec {namespace}/{pod} {line}"));
                state
                    .objects
                    .remove(&(namespace.to_string(), pod.to_string(), path));
                Ok(Vec::new())
            }
            _ => {
                state.calls.push(format!("cluster.exec {namespace}/{pod} {line}"));
                state
                    .exec_responses
                    .get(&(namespace.to_string(), pod.to_string(), line.clone()))
                    .cloned()
                    .ok_or_else(|| anyhow!("command not found: {line}"))
            }
        }
    }

    async fn read_config(&self, namespace: &str, resource: &str) -> Result<Vec<u8>> {
        let mut state = self.state();
        state.require_namespace(namespace)?;
        state.check(
            Fault::Capture(ComponentKind::Configuration),
            format!("capture configuration {namespace}"),
        )?;
        state
            .configs
            .get(&(namespace.to_string(), resource.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("{resource} not found in {namespace}"))
    }

    async fn apply_config(&self, namespace: &str, document: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        state.require_namespace(namespace)?;
        state.check(
            Fault::Restore(ComponentKind::Configuration),
            format!("restore configuration {namespace}"),
        )?;
        let resource = resource_of(&document)?;
        state.configs.insert((namespace.to_string(), resource), document);
        Ok(())
    }
}

#[async_trait]
impl DatabaseTool for SimulatedPlatform {
    async fn dump(&self, conn: &DbConnection) -> Result<Vec<u8>> {
        let mut state = self.state();
        state.require_namespace(&conn.namespace)?;
        state.check(
            Fault::Capture(ComponentKind::Database),
            format!("capture database {}", conn.namespace),
        )?;
        state
            .databases
            .get(&(conn.namespace.clone(), conn.database.clone()))
            .cloned()
            .ok_or_else(|| anyhow!("database '{}' does not exist", conn.database))
    }

    async fn restore(&self, conn: &DbConnection, dump: Vec<u8>, clean: bool) -> Result<()> {
        let mut state = self.state();
        state.require_namespace(&conn.namespace)?;
        state.check(
            Fault::Restore(ComponentKind::Database),
            format!("restore database {}", conn.namespace),
        )?;
        let key = (conn.namespace.clone(), conn.database.clone());
        if !clean && state.databases.contains_key(&key) {
            debug!(database = %conn.database, "Restoring over existing database");
        }
        state.databases.insert(key, dump);
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SimulatedPlatform {
    async fn trigger_snapshot(&self, cache: &CacheInstance) -> Result<()> {
        let mut state = self.state();
        state.require_namespace(&cache.namespace)?;
        state.check(
            Fault::Capture(ComponentKind::Cache),
            format!("capture cache {}", cache.namespace),
        )
    }

    async fn fetch_snapshot_file(&self, cache: &CacheInstance) -> Result<Vec<u8>> {
        let state = self.state();
        state.require_namespace(&cache.namespace)?;
        Ok(state
            .caches
            .get(&(cache.namespace.clone(), cache.pod.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn load_snapshot_file(&self, cache: &CacheInstance, snapshot: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        state.require_namespace(&cache.namespace)?;
        state.check(
            Fault::Restore(ComponentKind::Cache),
            format!("restore cache {}", cache.namespace),
        )?;
        state
            .caches
            .insert((cache.namespace.clone(), cache.pod.clone()), snapshot);
        Ok(())
    }
}

#[async_trait]
impl VectorIndexApi for SimulatedPlatform {
    async fn create_snapshot(&self, base_url: &str, collection: &str) -> Result<String> {
        let mut state = self.state();
        state.check(
            Fault::Capture(ComponentKind::VectorIndex),
            format!("capture vector-index {base_url}"),
        )?;
        let data = state
            .vectors
            .get(&(base_url.to_string(), collection.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("collection '{collection}' not found"))?;
        let name = format!("{collection}-{}.snapshot", state.vector_snapshots.len() + 1);
        state.vector_snapshots.insert(name.clone(), data);
        Ok(name)
    }

    async fn fetch_snapshot(&self, _base_url: &str, _collection: &str, name: &str) -> Result<Vec<u8>> {
        self.state()
            .vector_snapshots
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("snapshot '{name}' not found"))
    }

    async fn upload_snapshot(&self, base_url: &str, collection: &str, snapshot: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        state.check(
            Fault::Restore(ComponentKind::VectorIndex),
            format!("restore vector-index {base_url}"),
        )?;
        state
            .vectors
            .insert((base_url.to_string(), collection.to_string()), snapshot);
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for SimulatedPlatform {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: Metadata) -> Result<String> {
        let stalled = {
            let mut state = self.state();
            state.check(Fault::StorageDown, format!("storage.put {key}"))?;
            let fails = state
                .faults
                .iter()
                .any(|f| matches!(f, Fault::PutFails(part) if key.contains(part.as_str())));
            if fails {
                bail!("simulated failure: storage.put {key}");
            }
            let stalls = state
                .faults
                .iter()
                .any(|f| matches!(f, Fault::PutStalls(part) if key.contains(part.as_str())));
            if !stalls {
                state.blobs.insert(key.to_string(), (bytes, metadata));
                state.puts += 1;
            }
            stalls
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(format!("sim://{key}"))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let state = self.state();
        if state.fault(&Fault::StorageDown) {
            bail!("simulated storage unreachable");
        }
        state
            .blobs
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| anyhow!("object {key} not found"))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let state = self.state();
        if state.fault(&Fault::StorageDown) {
            bail!("simulated storage unreachable");
        }
        Ok(state
            .blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(key, (bytes, metadata))| ObjectInfo {
                key: key.clone(),
                size_bytes: bytes.len() as u64,
                metadata: metadata.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state();
        state.check(Fault::StorageDown, format!("storage.delete {key}"))?;
        state.blobs.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.state().fault(&Fault::StorageDown) {
            bail!("simulated storage unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl DnsApi for SimulatedPlatform {
    async fn current_record(&self, name: &str) -> Result<Option<DnsRecord>> {
        let mut state = self.state();
        state.check(Fault::DnsDown, format!("dns.get {name}"))?;
        Ok(state.dns.get(name).cloned())
    }

    async fn upsert_record(&self, name: &str, value: &str, ttl: u32) -> Result<()> {
        let mut state = self.state();
        state.check(Fault::DnsDown, format!("dns.upsert {name} {value}"))?;
        state.dns.insert(
            name.to_string(),
            DnsRecord {
                name: name.to_string(),
                value: value.to_string(),
                ttl,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl HttpProbe for SimulatedPlatform {
    async fn probe(&self, url: &str) -> Result<bool> {
        let mut state = self.state();
        state.calls.push(format!("http.probe {url}"));
        Ok(!state.fault(&Fault::Unhealthy(url.to_string())))
    }
}
