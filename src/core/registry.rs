//! Static catalog of capturable platform components.
//!
//! Each descriptor says how a component is captured, how it is put back, where
//! it sits in the dependency order, and how to tell it is healthy again.
//! Components sharing a rank may run concurrently; ranks never overlap.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::config::{self, EnvironmentConfig};
use crate::error::{DrError, DrResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    Database,
    Cache,
    VectorIndex,
    ObjectStore,
    Configuration,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Cache => "cache",
            Self::VectorIndex => "vector-index",
            Self::ObjectStore => "object-store",
            Self::Configuration => "configuration",
        }
    }
}

/// How a component's state is captured. The same fields locate the component
/// again on restore, resolved against the target environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CaptureSpec {
    Database {
        pod: String,
        database: String,
        user: String,
    },
    Cache {
        pod: String,
        snapshot_path: String,
    },
    VectorIndex {
        base_url: String,
        collections: Vec<String>,
    },
    ObjectStore {
        pod: String,
        path: String,
    },
    Configuration {
        resources: Vec<String>,
    },
}

impl CaptureSpec {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Self::Database { .. } => ComponentKind::Database,
            Self::Cache { .. } => ComponentKind::Cache,
            Self::VectorIndex { .. } => ComponentKind::VectorIndex,
            Self::ObjectStore { .. } => ComponentKind::ObjectStore,
            Self::Configuration { .. } => ComponentKind::Configuration,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSpec {
    /// Deployments restarted once every component has been restored.
    #[serde(default)]
    pub restart_deployments: Vec<String>,
    /// Drop existing state before loading (pg_restore --clean, emptying the
    /// object-store path).
    #[serde(default)]
    pub clean: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HealthCheckSpec {
    #[default]
    None,
    Http {
        url: String,
    },
    DeploymentReady {
        deployment: String,
    },
    Exec {
        pod: String,
        command: Vec<String>,
        #[serde(default)]
        expect: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: String,
    pub capture: CaptureSpec,
    #[serde(default)]
    pub restore: RestoreSpec,
    /// Lower ranks are captured and restored first.
    pub rank: u32,
    #[serde(default)]
    pub health: HealthCheckSpec,
}

impl ComponentDescriptor {
    pub fn kind(&self) -> ComponentKind {
        self.capture.kind()
    }

    /// Expand `{environment}` and `{namespace}` placeholders for a target.
    pub fn resolve(&self, target: &EnvironmentConfig) -> ComponentDescriptor {
        let sub = |s: &String| {
            s.replace("{environment}", &target.name)
                .replace("{namespace}", &target.namespace)
        };
        let sub_all = |v: &Vec<String>| v.iter().map(sub).collect::<Vec<_>>();

        let capture = match &self.capture {
            CaptureSpec::Database {
                pod,
                database,
                user,
            } => CaptureSpec::Database {
                pod: sub(pod),
                database: sub(database),
                user: sub(user),
            },
            CaptureSpec::Cache { pod, snapshot_path } => CaptureSpec::Cache {
                pod: sub(pod),
                snapshot_path: sub(snapshot_path),
            },
            CaptureSpec::VectorIndex {
                base_url,
                collections,
            } => CaptureSpec::VectorIndex {
                base_url: sub(base_url),
                collections: sub_all(collections),
            },
            CaptureSpec::ObjectStore { pod, path } => CaptureSpec::ObjectStore {
                pod: sub(pod),
                path: sub(path),
            },
            CaptureSpec::Configuration { resources } => CaptureSpec::Configuration {
                resources: sub_all(resources),
            },
        };

        let health = match &self.health {
            HealthCheckSpec::None => HealthCheckSpec::None,
            HealthCheckSpec::Http { url } => HealthCheckSpec::Http { url: sub(url) },
            HealthCheckSpec::DeploymentReady { deployment } => HealthCheckSpec::DeploymentReady {
                deployment: sub(deployment),
            },
            HealthCheckSpec::Exec {
                pod,
                command,
                expect,
            } => HealthCheckSpec::Exec {
                pod: sub(pod),
                command: sub_all(command),
                expect: expect.as_ref().map(sub),
            },
        };

        ComponentDescriptor {
            name: self.name.clone(),
            capture,
            restore: RestoreSpec {
                restart_deployments: sub_all(&self.restore.restart_deployments),
                clean: self.restore.clean,
            },
            rank: self.rank,
            health,
        }
    }
}

/// Immutable, rank-ordered component catalog.
#[derive(Debug, Clone)]
pub struct Registry {
    components: Vec<ComponentDescriptor>,
}

impl Registry {
    pub fn new(mut components: Vec<ComponentDescriptor>) -> DrResult<Self> {
        let mut seen = HashSet::new();
        for c in &components {
            config::validate_name("component", &c.name)?;
            if !seen.insert(c.name.clone()) {
                return Err(DrError::Config(format!(
                    "component '{}' is registered twice",
                    c.name
                )));
            }
        }
        components.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)));
        Ok(Self { components })
    }

    pub fn all(&self) -> &[ComponentDescriptor] {
        &self.components
    }

    pub fn get(&self, name: &str) -> Option<&ComponentDescriptor> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// The catalog of the RAG platform: database, cache, vector index,
    /// object store, and cluster configuration.
    pub fn default_catalog() -> Vec<ComponentDescriptor> {
        vec![
            ComponentDescriptor {
                name: "database".into(),
                capture: CaptureSpec::Database {
                    pod: "postgres-0".into(),
                    database: "rag".into(),
                    user: "rag".into(),
                },
                restore: RestoreSpec {
                    restart_deployments: vec!["rag-api".into(), "rag-worker".into()],
                    clean: true,
                },
                rank: 0,
                health: HealthCheckSpec::Exec {
                    pod: "postgres-0".into(),
                    command: vec!["pg_isready".into(), "-U".into(), "rag".into()],
                    expect: None,
                },
            },
            ComponentDescriptor {
                name: "cache".into(),
                capture: CaptureSpec::Cache {
                    pod: "redis-0".into(),
                    snapshot_path: "/data/dump.rdb".into(),
                },
                restore: RestoreSpec {
                    restart_deployments: vec!["rag-api".into()],
                    clean: false,
                },
                rank: 1,
                health: HealthCheckSpec::Exec {
                    pod: "redis-0".into(),
                    command: vec!["redis-cli".into(), "ping".into()],
                    expect: Some("PONG".into()),
                },
            },
            ComponentDescriptor {
                name: "vector-index".into(),
                capture: CaptureSpec::VectorIndex {
                    base_url: "http://qdrant.{namespace}.svc.cluster.local:6333".into(),
                    collections: vec!["documents".into()],
                },
                restore: RestoreSpec {
                    restart_deployments: vec!["rag-api".into()],
                    clean: false,
                },
                rank: 1,
                health: HealthCheckSpec::Http {
                    url: "http://qdrant.{namespace}.svc.cluster.local:6333/readyz".into(),
                },
            },
            ComponentDescriptor {
                name: "object-store".into(),
                capture: CaptureSpec::ObjectStore {
                    pod: "minio-0".into(),
                    path: "/data".into(),
                },
                restore: RestoreSpec::default(),
                rank: 2,
                health: HealthCheckSpec::Http {
                    url: "http://minio.{namespace}.svc.cluster.local:9000/minio/health/live"
                        .into(),
                },
            },
            ComponentDescriptor {
                name: "configuration".into(),
                capture: CaptureSpec::Configuration {
                    resources: vec!["configmap/rag-config".into(), "secret/rag-secrets".into()],
                },
                restore: RestoreSpec {
                    restart_deployments: vec!["rag-api".into(), "rag-worker".into()],
                    clean: false,
                },
                rank: 3,
                health: HealthCheckSpec::DeploymentReady {
                    deployment: "rag-api".into(),
                },
            },
        ]
    }
}

/// Group descriptors by rank, ascending. Order within a rank follows input order.
pub fn group_by_rank<'a, I>(components: I) -> Vec<(u32, Vec<&'a ComponentDescriptor>)>
where
    I: IntoIterator<Item = &'a ComponentDescriptor>,
{
    let mut ranks: BTreeMap<u32, Vec<&'a ComponentDescriptor>> = BTreeMap::new();
    for c in components {
        ranks.entry(c.rank).or_default().push(c);
    }
    ranks.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> EnvironmentConfig {
        EnvironmentConfig {
            name: "staging".into(),
            namespace: "rag-staging".into(),
        }
    }

    #[test]
    fn default_catalog_is_rank_ordered() {
        let registry = Registry::new(Registry::default_catalog()).unwrap();
        let names: Vec<_> = registry.all().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "database",
                "cache",
                "vector-index",
                "object-store",
                "configuration"
            ]
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut catalog = Registry::default_catalog();
        catalog.push(catalog[0].clone());
        assert!(matches!(Registry::new(catalog), Err(DrError::Config(_))));
    }

    #[test]
    fn groups_share_rank() {
        let registry = Registry::new(Registry::default_catalog()).unwrap();
        let groups = group_by_rank(registry.all());
        let shape: Vec<(u32, usize)> = groups.iter().map(|(r, g)| (*r, g.len())).collect();
        assert_eq!(shape, vec![(0, 1), (1, 2), (2, 1), (3, 1)]);
    }

    #[test]
    fn resolve_expands_placeholders() {
        let registry = Registry::new(Registry::default_catalog()).unwrap();
        let vector = registry.get("vector-index").unwrap().resolve(&target());
        match vector.capture {
            CaptureSpec::VectorIndex { base_url, .. } => {
                assert_eq!(base_url, "http://qdrant.rag-staging.svc.cluster.local:6333")
            }
            other => panic!("unexpected spec {other:?}"),
        }
        match vector.health {
            HealthCheckSpec::Http { url } => assert!(url.contains("rag-staging")),
            other => panic!("unexpected health {other:?}"),
        }
    }

    #[test]
    fn descriptors_parse_from_toml() {
        let doc = r#"
            name = "database"
            rank = 0

            [capture]
            kind = "database"
            pod = "postgres-0"
            database = "rag"
            user = "rag"

            [health]
            type = "deployment-ready"
            deployment = "postgres"
        "#;
        let descriptor: ComponentDescriptor = toml::from_str(doc).unwrap();
        assert_eq!(descriptor.kind(), ComponentKind::Database);
        assert!(descriptor.restore.restart_deployments.is_empty());
    }
}
