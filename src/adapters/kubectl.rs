//! Cluster, database, and cache access through `kubectl`.
//!
//! Database and cache tooling runs inside the component's own pod, so the
//! host only needs `kubectl` and a working kubeconfig.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::core::platform::{CacheInstance, ClusterApi, DatabaseTool, DbConnection, KeyValueStore};

/// Metadata fields that tie an export to one namespace or one object revision.
const VOLATILE_METADATA: &[&str] = &[
    "namespace",
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
    "ownerReferences",
];

const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
    context: Option<String>,
    timeout: Duration,
}

impl Kubectl {
    pub fn new(config: &ClusterConfig, timeout: Duration) -> Self {
        Self {
            binary: config.kubectl.clone(),
            context: config.context.clone(),
            timeout,
        }
    }

    async fn run(&self, args: &[String], stdin: Option<Vec<u8>>) -> Result<Vec<u8>> {
        self.run_for(args, stdin, self.timeout).await
    }

    async fn run_for(
        &self,
        args: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.binary);
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %args.join(" "), "Running kubectl");
        let mut child = command
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}", self.binary, e))?;

        // Feed stdin from its own task so a full stdout pipe cannot stall the write
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
                pipe.write_all(&input).await?;
                pipe.shutdown().await
            })),
            _ => None,
        };

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("kubectl {} timed out after {}s", verb(args), timeout.as_secs()))?
            .context("Failed to wait for kubectl")?;

        if let Some(writer) = writer {
            if let Err(e) = writer.await? {
                warn!(error = %e, "kubectl closed stdin early");
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "kubectl {} failed ({}): {}",
                verb(args),
                output.status,
                stderr.trim()
            );
        }
        Ok(output.stdout)
    }

    async fn exec_in(
        &self,
        namespace: &str,
        pod: &str,
        command: &[&str],
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        self.exec(namespace, pod, &command, stdin).await
    }
}

fn verb(args: &[String]) -> &str {
    args.first().map(String::as_str).unwrap_or("")
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Drop namespace and revision bookkeeping so the document applies anywhere.
fn strip_volatile(document: &[u8]) -> Result<Vec<u8>> {
    let mut doc: serde_json::Value =
        serde_json::from_slice(document).context("kubectl returned invalid JSON")?;
    if let Some(object) = doc.as_object_mut() {
        object.remove("status");
    }
    if let Some(metadata) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in VOLATILE_METADATA {
            metadata.remove(*field);
        }
        if let Some(annotations) = metadata
            .get_mut("annotations")
            .and_then(|a| a.as_object_mut())
        {
            annotations.remove(LAST_APPLIED);
        }
    }
    Ok(serde_json::to_vec_pretty(&doc)?)
}

#[async_trait]
impl ClusterApi for Kubectl {
    async fn ping(&self, namespace: &str) -> Result<()> {
        self.run(&args(&["get", "namespace", namespace, "-o", "name"]), None)
            .await
            .with_context(|| format!("namespace '{namespace}' is not reachable"))?;
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<String>> {
        let out = self
            .run(
                &args(&[
                    "get",
                    "deployments",
                    "-n",
                    namespace,
                    "-o",
                    "jsonpath={.items[*].metadata.name}",
                ]),
                None,
            )
            .await?;
        Ok(String::from_utf8_lossy(&out)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let target = format!("deployment/{name}");
        self.run(&args(&["rollout", "restart", &target, "-n", namespace]), None)
            .await?;
        Ok(())
    }

    async fn wait_ready(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let target = format!("deployment/{name}");
        let limit = format!("--timeout={}s", timeout.as_secs());
        // kubectl enforces `limit`; the outer bound only catches a hung client
        self.run_for(
            &args(&["rollout", "status", &target, "-n", namespace, &limit]),
            None,
            timeout + Duration::from_secs(30),
        )
        .await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let mut full = vec!["exec".to_string(), "-n".to_string(), namespace.to_string()];
        if stdin.is_some() {
            full.push("-i".to_string());
        }
        full.push(pod.to_string());
        full.push("--".to_string());
        full.extend(command.iter().cloned());
        self.run(&full, stdin).await
    }

    async fn read_config(&self, namespace: &str, resource: &str) -> Result<Vec<u8>> {
        let out = self
            .run(&args(&["get", resource, "-n", namespace, "-o", "json"]), None)
            .await?;
        strip_volatile(&out)
    }

    async fn apply_config(&self, namespace: &str, document: Vec<u8>) -> Result<()> {
        self.run(&args(&["apply", "-n", namespace, "-f", "-"]), Some(document))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseTool for Kubectl {
    async fn dump(&self, conn: &DbConnection) -> Result<Vec<u8>> {
        let dump = self
            .exec_in(
                &conn.namespace,
                &conn.pod,
                &["pg_dump", "-U", conn.user.as_str(), "-Fc", conn.database.as_str()],
                None,
            )
            .await
            .with_context(|| format!("pg_dump of '{}'", conn.database))?;
        if dump.is_empty() {
            bail!("pg_dump of '{}' produced no output", conn.database);
        }
        Ok(dump)
    }

    async fn restore(&self, conn: &DbConnection, dump: Vec<u8>, clean: bool) -> Result<()> {
        let mut command = vec![
            "pg_restore",
            "-U",
            conn.user.as_str(),
            "-d",
            conn.database.as_str(),
            "--no-owner",
        ];
        if clean {
            command.extend(["--clean", "--if-exists"]);
        }
        self.exec_in(&conn.namespace, &conn.pod, &command, Some(dump))
            .await
            .with_context(|| format!("pg_restore of '{}'", conn.database))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for Kubectl {
    async fn trigger_snapshot(&self, cache: &CacheInstance) -> Result<()> {
        let out = self
            .exec_in(&cache.namespace, &cache.pod, &["redis-cli", "SAVE"], None)
            .await?;
        let reply = String::from_utf8_lossy(&out);
        if reply.trim() != "OK" {
            bail!("redis SAVE answered '{}'", reply.trim());
        }
        Ok(())
    }

    async fn fetch_snapshot_file(&self, cache: &CacheInstance) -> Result<Vec<u8>> {
        self.exec_in(
            &cache.namespace,
            &cache.pod,
            &["cat", cache.snapshot_path.as_str()],
            None,
        )
        .await
    }

    async fn load_snapshot_file(&self, cache: &CacheInstance, snapshot: Vec<u8>) -> Result<()> {
        let write = format!("cat > '{}'", cache.snapshot_path.replace('\'', r"'\''"));
        self.exec_in(
            &cache.namespace,
            &cache.pod,
            &["sh", "-c", write.as_str()],
            Some(snapshot),
        )
        .await?;

        // The server reloads the file when its container restarts
        match self
            .exec_in(
                &cache.namespace,
                &cache.pod,
                &["redis-cli", "SHUTDOWN", "NOSAVE"],
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                // redis-cli exits non-zero when the server drops the connection on shutdown
                debug!(pod = %cache.pod, error = %e, "Cache shutdown reported an error");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exported_documents_lose_namespace_bookkeeping() {
        let raw = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "rag-config",
                "namespace": "rag-production",
                "uid": "1234",
                "resourceVersion": "99",
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "team": "search"
                }
            },
            "data": { "MODEL": "small" },
            "status": {}
        });
        let cleaned = strip_volatile(raw.to_string().as_bytes()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&cleaned).unwrap();

        assert_eq!(doc["metadata"]["name"], "rag-config");
        assert!(doc["metadata"].get("namespace").is_none());
        assert!(doc["metadata"].get("uid").is_none());
        assert!(doc.get("status").is_none());
        assert_eq!(doc["metadata"]["annotations"]["team"], "search");
        assert!(doc["metadata"]["annotations"].get(LAST_APPLIED).is_none());
        assert_eq!(doc["data"]["MODEL"], "small");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let kubectl = Kubectl::new(
            &ClusterConfig {
                kubectl: "/nonexistent/kubectl".into(),
                context: None,
            },
            Duration::from_secs(5),
        );
        let err = kubectl.ping("rag-production").await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to spawn"));
    }
}
