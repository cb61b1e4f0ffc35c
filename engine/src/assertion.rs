//! Field-level predicates over a fetched snapshot.
//!
//! Every assertion in a list runs exactly once and in order; a failing
//! assertion never prevents its siblings from running.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use kverify_resources::{IntOrString, ResourceKind, Snapshot};
use miette::Diagnostic;
use serde::{Serialize, Serializer, ser::SerializeMap as _};
use thiserror::Error;

use crate::registry::RegistryKey;

/// A value read out of a snapshot. Integers and strings never compare equal
/// to each other, so a numeric target port `80` differs from a named `"80"`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Str(String),
    /// The path does not resolve on this snapshot (index out of range,
    /// missing key, unset optional field).
    Absent,
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value.into())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        FieldValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Absent, Into::into)
    }
}

impl From<&IntOrString> for FieldValue {
    fn from(value: &IntOrString) -> Self {
        match value {
            IntOrString::Int(port) => FieldValue::from(*port),
            IntOrString::String(name) => FieldValue::Str(name.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(value) => write!(f, "{value}"),
            FieldValue::Str(value) => write!(f, "{value:?}"),
            FieldValue::Absent => f.write_str("<absent>"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("invalid field path `{path}`: {reason}")]
#[diagnostic(
    code(engine::invalid_field_path),
    help(
        "supported paths: spec.replicas, status.{{replicas,availableReplicas,readyReplicas,updatedReplicas}}, \
         containers[i].{{image,imagePullPolicy,ports}}, ports[i].{{port,targetPort,name}}, \
         selector[\"k\"], podLabels[\"k\"], labels[\"k\"], data[\"k\"]"
    )
)]
pub struct FieldPathError {
    pub path: String,
    pub reason: &'static str,
}

/// A path into a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    DesiredReplicas,
    Replicas,
    AvailableReplicas,
    ReadyReplicas,
    UpdatedReplicas,
    ContainerImage(usize),
    ContainerPullPolicy(usize),
    /// Number of ports the container declares.
    ContainerPortCount(usize),
    Selector(String),
    PodLabel(String),
    Label(String),
    Data(String),
    ServicePort(usize),
    ServiceTargetPort(usize),
    ServicePortName(usize),
}

impl Field {
    pub fn applies_to(&self, kind: ResourceKind) -> bool {
        match self {
            Field::DesiredReplicas
            | Field::Replicas
            | Field::AvailableReplicas
            | Field::ReadyReplicas
            | Field::UpdatedReplicas
            | Field::ContainerImage(_)
            | Field::ContainerPullPolicy(_)
            | Field::ContainerPortCount(_)
            | Field::PodLabel(_) => kind.is_workload(),
            Field::Selector(_) => kind.is_workload() || kind == ResourceKind::Service,
            Field::Label(_) => true,
            Field::Data(_) => kind.is_key_value(),
            Field::ServicePort(_) | Field::ServiceTargetPort(_) | Field::ServicePortName(_) => {
                kind == ResourceKind::Service
            }
        }
    }

    pub fn extract(&self, snapshot: &Snapshot) -> FieldValue {
        let status = snapshot.status();
        let container = |index: usize| {
            snapshot
                .pod_template()
                .and_then(|t| t.spec.containers.get(index))
        };
        let service_port = |index: usize| snapshot.service_ports().and_then(|p| p.get(index));
        match self {
            Field::DesiredReplicas => snapshot.desired_replicas().into(),
            Field::Replicas => status.map(|s| s.replicas).into(),
            Field::AvailableReplicas => status.map(|s| s.available_replicas).into(),
            Field::ReadyReplicas => status.map(|s| s.ready_replicas).into(),
            Field::UpdatedReplicas => status.map(|s| s.updated_replicas).into(),
            Field::ContainerImage(i) => container(*i).map(|c| c.image.as_str()).into(),
            Field::ContainerPullPolicy(i) => container(*i)
                .and_then(|c| c.image_pull_policy.as_deref())
                .into(),
            Field::ContainerPortCount(i) => container(*i).map(|c| c.ports.len()).into(),
            Field::Selector(key) => snapshot
                .selector()
                .and_then(|s| s.get(key))
                .map(String::as_str)
                .into(),
            Field::PodLabel(key) => snapshot
                .pod_template()
                .and_then(|t| t.metadata.labels.get(key))
                .map(String::as_str)
                .into(),
            Field::Label(key) => snapshot
                .metadata()
                .labels
                .get(key)
                .map(String::as_str)
                .into(),
            Field::Data(key) => snapshot.data_value(key).map(|v| v.into_owned()).into(),
            Field::ServicePort(i) => service_port(*i).map(|p| p.port).into(),
            Field::ServiceTargetPort(i) => service_port(*i)
                .and_then(|p| p.target_port.as_ref())
                .map_or(FieldValue::Absent, FieldValue::from),
            Field::ServicePortName(i) => service_port(*i)
                .and_then(|p| p.name.as_deref())
                .into(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::DesiredReplicas => f.write_str("spec.replicas"),
            Field::Replicas => f.write_str("status.replicas"),
            Field::AvailableReplicas => f.write_str("status.availableReplicas"),
            Field::ReadyReplicas => f.write_str("status.readyReplicas"),
            Field::UpdatedReplicas => f.write_str("status.updatedReplicas"),
            Field::ContainerImage(i) => write!(f, "containers[{i}].image"),
            Field::ContainerPullPolicy(i) => write!(f, "containers[{i}].imagePullPolicy"),
            Field::ContainerPortCount(i) => write!(f, "containers[{i}].ports"),
            Field::Selector(key) => write!(f, "selector[{key:?}]"),
            Field::PodLabel(key) => write!(f, "podLabels[{key:?}]"),
            Field::Label(key) => write!(f, "labels[{key:?}]"),
            Field::Data(key) => write!(f, "data[{key:?}]"),
            Field::ServicePort(i) => write!(f, "ports[{i}].port"),
            Field::ServiceTargetPort(i) => write!(f, "ports[{i}].targetPort"),
            Field::ServicePortName(i) => write!(f, "ports[{i}].name"),
        }
    }
}

impl FromStr for Field {
    type Err = FieldPathError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let err = |reason| FieldPathError {
            path: path.to_string(),
            reason,
        };
        let path = path.trim();

        match path {
            "spec.replicas" => return Ok(Field::DesiredReplicas),
            "status.replicas" => return Ok(Field::Replicas),
            "status.availableReplicas" => return Ok(Field::AvailableReplicas),
            "status.readyReplicas" => return Ok(Field::ReadyReplicas),
            "status.updatedReplicas" => return Ok(Field::UpdatedReplicas),
            _ => {}
        }

        let Some((head, rest)) = path.split_once('[') else {
            return Err(err("unknown field"));
        };
        let Some((subscript, tail)) = rest.split_once(']') else {
            return Err(err("unterminated `[`"));
        };

        match head {
            "selector" | "podLabels" | "labels" | "data" => {
                if !tail.is_empty() {
                    return Err(err("map lookups take no trailing segment"));
                }
                let key = subscript
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| subscript.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                    .ok_or_else(|| err("map keys must be quoted"))?;
                if key.is_empty() {
                    return Err(err("empty map key"));
                }
                let key = key.to_string();
                Ok(match head {
                    "selector" => Field::Selector(key),
                    "podLabels" => Field::PodLabel(key),
                    "labels" => Field::Label(key),
                    _ => Field::Data(key),
                })
            }
            "containers" | "ports" => {
                let index: usize = subscript
                    .trim()
                    .parse()
                    .map_err(|_| err("index must be a non-negative integer"))?;
                let field = match (head, tail) {
                    ("containers", ".image") => Field::ContainerImage(index),
                    ("containers", ".imagePullPolicy") => Field::ContainerPullPolicy(index),
                    ("containers", ".ports") => Field::ContainerPortCount(index),
                    ("ports", ".port") => Field::ServicePort(index),
                    ("ports", ".targetPort") => Field::ServiceTargetPort(index),
                    ("ports", ".name") => Field::ServicePortName(index),
                    _ => return Err(err("unknown field")),
                };
                Ok(field)
            }
            _ => Err(err("unknown field")),
        }
    }
}

/// What the extracted value must satisfy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expectation {
    Equals(FieldValue),
    /// Minimum count; only integers satisfy it.
    AtLeast(i64),
    OneOf(Vec<FieldValue>),
}

impl Expectation {
    pub fn is_satisfied_by(&self, actual: &FieldValue) -> bool {
        match self {
            Expectation::Equals(expected) => expected == actual,
            Expectation::AtLeast(min) => actual.as_int().is_some_and(|v| v >= *min),
            Expectation::OneOf(options) => options.contains(actual),
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Equals(value) => write!(f, "{value}"),
            Expectation::AtLeast(min) => write!(f, "at least {min}"),
            Expectation::OneOf(options) => {
                f.write_str("one of [")?;
                for (i, option) in options.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{option}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// `Equals` serializes as the bare value; the others as a one-key object
/// named like the baseline keyword.
impl Serialize for Expectation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Expectation::Equals(value) => value.serialize(serializer),
            Expectation::AtLeast(min) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("atLeast", min)?;
                map.end()
            }
            Expectation::OneOf(options) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("oneOf", options)?;
                map.end()
            }
        }
    }
}

/// The resource an assertion runs against, plus the snapshots its check
/// depends on.
#[derive(Clone, Copy, Debug)]
pub struct Subject<'a> {
    pub snapshot: &'a Snapshot,
    pub dependencies: &'a BTreeMap<RegistryKey, Arc<Snapshot>>,
}

/// Result of a custom predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub expected: String,
    pub actual: String,
}

pub type CustomPredicate = Arc<dyn Fn(&Subject<'_>) -> Verdict + Send + Sync>;

#[derive(Clone)]
pub enum Predicate {
    Field {
        field: Field,
        expect: Expectation,
    },
    /// Every entry of this resource's selector appears in the pod-template
    /// labels of the workload published under `source`.
    SelectorMatches {
        source: RegistryKey,
    },
    Custom(CustomPredicate),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Field { field, expect } => f
                .debug_struct("Field")
                .field("field", field)
                .field("expect", expect)
                .finish(),
            Predicate::SelectorMatches { source } => f
                .debug_struct("SelectorMatches")
                .field("source", source)
                .finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Assertion {
    description: String,
    predicate: Predicate,
}

impl Assertion {
    pub fn field(field: Field, expect: Expectation) -> Self {
        Self {
            description: field.to_string(),
            predicate: Predicate::Field { field, expect },
        }
    }

    pub fn selector_matches(source: RegistryKey) -> Self {
        Self {
            description: format!("selector matches pod labels of `{source}`"),
            predicate: Predicate::SelectorMatches { source },
        }
    }

    pub fn custom<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Subject<'_>) -> Verdict + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Predicate::Custom(Arc::new(check)),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Registry key this assertion reads, if any.
    pub fn dependency(&self) -> Option<&RegistryKey> {
        match &self.predicate {
            Predicate::SelectorMatches { source } => Some(source),
            _ => None,
        }
    }

    pub fn evaluate(&self, subject: &Subject<'_>) -> AssertionOutcome {
        let (passed, expected, actual) = match &self.predicate {
            Predicate::Field { field, expect } => {
                let actual = field.extract(subject.snapshot);
                (
                    expect.is_satisfied_by(&actual),
                    Expected::Field(expect.clone()),
                    Actual::Field(actual),
                )
            }
            Predicate::SelectorMatches { source } => selector_matches(subject, source),
            Predicate::Custom(check) => {
                let verdict = check(subject);
                (
                    verdict.passed,
                    Expected::Described(verdict.expected),
                    Actual::Described(verdict.actual),
                )
            }
        };
        AssertionOutcome {
            description: self.description.clone(),
            expected,
            actual,
            passed,
        }
    }
}

fn selector_matches(subject: &Subject<'_>, source: &RegistryKey) -> (bool, Expected, Actual) {
    let selector = subject.snapshot.selector().cloned().unwrap_or_default();
    let expected = Expected::Described(render_labels(&selector));
    let Some(labels) = subject
        .dependencies
        .get(source)
        .and_then(|dep| dep.pod_template())
        .map(|t| &t.metadata.labels)
    else {
        return (
            false,
            expected,
            Actual::Described("<no pod template>".to_string()),
        );
    };
    // An empty selector matches every pod, which is never what a baseline means.
    let passed = !selector.is_empty()
        && selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value));
    (passed, expected, Actual::Described(render_labels(labels)))
}

fn render_labels(labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        return "{}".to_string();
    }
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// What an assertion looked for. Field expectations keep their type so
/// machine-readable reports can tell `80` from `"80"`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Expected {
    Field(Expectation),
    Described(String),
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Field(expect) => write!(f, "{expect}"),
            Expected::Described(text) => f.write_str(text),
        }
    }
}

/// What an assertion found.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Actual {
    Field(FieldValue),
    Described(String),
}

impl fmt::Display for Actual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actual::Field(value) => write!(f, "{value}"),
            Actual::Described(text) => f.write_str(text),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssertionOutcome {
    pub description: String,
    pub expected: Expected,
    pub actual: Actual,
    pub passed: bool,
}

impl fmt::Display for AssertionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} expected {}, got {}",
            self.description, self.expected, self.actual
        )
    }
}

/// Run every assertion against `subject`, in order.
pub fn evaluate(subject: &Subject<'_>, assertions: &[Assertion]) -> Vec<AssertionOutcome> {
    assertions.iter().map(|a| a.evaluate(subject)).collect()
}
