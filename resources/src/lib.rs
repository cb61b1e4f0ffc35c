//! Typed, read-only snapshots of the Kubernetes resources a baseline can
//! assert against.

mod objects;

use std::{borrow::Cow, collections::BTreeMap, fmt, str::FromStr};

use miette::Diagnostic;
pub use objects::*;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown resource kind `{0}`")]
    #[diagnostic(
        code(resources::unknown_kind),
        help("supported kinds: Deployment, StatefulSet, Service, Secret, ConfigMap")
    )]
    UnknownKind(String),

    #[error("{kind} reference has an empty {field}")]
    #[diagnostic(code(resources::empty_reference_field))]
    EmptyReferenceField {
        kind: ResourceKind,
        field: &'static str,
    },

    #[error("expected a {expected} payload, got `{found}`")]
    #[diagnostic(code(resources::kind_mismatch))]
    KindMismatch {
        expected: ResourceKind,
        found: String,
    },

    #[error("failed to decode {kind}: {source}")]
    #[diagnostic(code(resources::decode_error))]
    Decode {
        kind: ResourceKind,
        #[source]
        source: serde_json::Error,
    },
}

/// The resource kinds a baseline may assert against.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub enum ResourceKind {
    Deployment,
    StatefulSet,
    Service,
    Secret,
    ConfigMap,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Service => "Service",
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
        }
    }

    pub fn api_version(self) -> &'static str {
        match self {
            ResourceKind::Deployment | ResourceKind::StatefulSet => "apps/v1",
            ResourceKind::Service | ResourceKind::Secret | ResourceKind::ConfigMap => "v1",
        }
    }

    fn plural(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployments",
            ResourceKind::StatefulSet => "statefulsets",
            ResourceKind::Service => "services",
            ResourceKind::Secret => "secrets",
            ResourceKind::ConfigMap => "configmaps",
        }
    }

    /// Deployments and StatefulSets: kinds that own a pod template and
    /// report replica status.
    pub fn is_workload(self) -> bool {
        matches!(self, ResourceKind::Deployment | ResourceKind::StatefulSet)
    }

    /// Secrets and ConfigMaps: kinds that carry a key-value `data` map.
    pub fn is_key_value(self) -> bool {
        matches!(self, ResourceKind::Secret | ResourceKind::ConfigMap)
    }

    /// REST path of a namespaced object of this kind.
    pub fn api_path(self, namespace: &str, name: &str) -> String {
        let prefix = match self.api_version() {
            "v1" => "/api/v1".to_string(),
            group => format!("/apis/{group}"),
        };
        format!("{prefix}/namespaces/{namespace}/{}/{name}", self.plural())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let kind = match input.to_ascii_lowercase().as_str() {
            "deployment" | "deploy" => ResourceKind::Deployment,
            "statefulset" | "sts" => ResourceKind::StatefulSet,
            "service" | "svc" => ResourceKind::Service,
            "secret" => ResourceKind::Secret,
            "configmap" | "cm" => ResourceKind::ConfigMap,
            _ => return Err(Error::UnknownKind(input.to_string())),
        };
        Ok(kind)
    }
}

/// Coordinates of one namespaced resource. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawResourceRef")]
pub struct ResourceRef {
    kind: ResourceKind,
    name: String,
    namespace: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResourceRef {
    kind: ResourceKind,
    name: String,
    namespace: String,
}

impl TryFrom<RawResourceRef> for ResourceRef {
    type Error = Error;

    fn try_from(raw: RawResourceRef) -> Result<Self, Self::Error> {
        ResourceRef::new(raw.kind, raw.name, raw.namespace)
    }
}

impl ResourceRef {
    pub fn new(
        kind: ResourceKind,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, Error> {
        let name = name.into();
        let namespace = namespace.into();
        if name.trim().is_empty() {
            return Err(Error::EmptyReferenceField {
                kind,
                field: "name",
            });
        }
        if namespace.trim().is_empty() {
            return Err(Error::EmptyReferenceField {
                kind,
                field: "namespace",
            });
        }
        Ok(Self {
            kind,
            name,
            namespace,
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn api_path(&self) -> String {
        self.kind.api_path(&self.namespace, &self.name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A resource as it was observed at fetch time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Snapshot {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    Service(Service),
    Secret(Secret),
    ConfigMap(ConfigMap),
}

impl Snapshot {
    /// Decode an API server payload, rejecting payloads of another kind.
    pub fn from_value(kind: ResourceKind, value: serde_json::Value) -> Result<Self, Error> {
        if let Some(found) = value.get("kind").and_then(|k| k.as_str())
            && found != kind.as_str()
        {
            return Err(Error::KindMismatch {
                expected: kind,
                found: found.to_string(),
            });
        }
        let decode = |source| Error::Decode { kind, source };
        let snapshot = match kind {
            ResourceKind::Deployment => {
                Snapshot::Deployment(serde_json::from_value(value).map_err(decode)?)
            }
            ResourceKind::StatefulSet => {
                Snapshot::StatefulSet(serde_json::from_value(value).map_err(decode)?)
            }
            ResourceKind::Service => {
                Snapshot::Service(serde_json::from_value(value).map_err(decode)?)
            }
            ResourceKind::Secret => Snapshot::Secret(serde_json::from_value(value).map_err(decode)?),
            ResourceKind::ConfigMap => {
                Snapshot::ConfigMap(serde_json::from_value(value).map_err(decode)?)
            }
        };
        Ok(snapshot)
    }

    pub fn from_slice(kind: ResourceKind, bytes: &[u8]) -> Result<Self, Error> {
        let value = serde_json::from_slice(bytes).map_err(|source| Error::Decode { kind, source })?;
        Self::from_value(kind, value)
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Snapshot::Deployment(_) => ResourceKind::Deployment,
            Snapshot::StatefulSet(_) => ResourceKind::StatefulSet,
            Snapshot::Service(_) => ResourceKind::Service,
            Snapshot::Secret(_) => ResourceKind::Secret,
            Snapshot::ConfigMap(_) => ResourceKind::ConfigMap,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Snapshot::Deployment(d) => &d.metadata,
            Snapshot::StatefulSet(s) => &s.metadata,
            Snapshot::Service(s) => &s.metadata,
            Snapshot::Secret(s) => &s.metadata,
            Snapshot::ConfigMap(c) => &c.metadata,
        }
    }

    pub fn status(&self) -> Option<&WorkloadStatus> {
        match self {
            Snapshot::Deployment(d) => Some(&d.status),
            Snapshot::StatefulSet(s) => Some(&s.status),
            _ => None,
        }
    }

    pub fn desired_replicas(&self) -> Option<i32> {
        match self {
            // The API server defaults an unset replica count to 1.
            Snapshot::Deployment(d) => Some(d.spec.replicas.unwrap_or(1)),
            Snapshot::StatefulSet(s) => Some(s.spec.replicas.unwrap_or(1)),
            _ => None,
        }
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Snapshot::Deployment(d) => Some(&d.spec.template),
            Snapshot::StatefulSet(s) => Some(&s.spec.template),
            _ => None,
        }
    }

    /// The label selector: `spec.selector` for Services, `matchLabels` for
    /// workloads.
    pub fn selector(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Snapshot::Deployment(d) => Some(&d.spec.selector.match_labels),
            Snapshot::StatefulSet(s) => Some(&s.spec.selector.match_labels),
            Snapshot::Service(s) => Some(&s.spec.selector),
            _ => None,
        }
    }

    pub fn service_ports(&self) -> Option<&[ServicePort]> {
        match self {
            Snapshot::Service(s) => Some(&s.spec.ports),
            _ => None,
        }
    }

    /// Text value stored under `key` in a Secret or ConfigMap.
    ///
    /// Secret values are decoded bytes rendered as UTF-8 (lossily).
    pub fn data_value(&self, key: &str) -> Option<Cow<'_, str>> {
        match self {
            Snapshot::Secret(s) => s.data.get(key).map(|v| String::from_utf8_lossy(v)),
            Snapshot::ConfigMap(c) => c
                .data
                .get(key)
                .map(|v| Cow::Borrowed(v.as_str()))
                .or_else(|| c.binary_data.get(key).map(|v| String::from_utf8_lossy(v))),
            _ => None,
        }
    }
}
