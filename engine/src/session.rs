use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::StreamExt as _;
use kverify_fetcher::Fetcher;
use kverify_resources::ResourceKind;
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    assertion::Predicate,
    check::{CheckResult, CheckStatus, CheckUnit},
    registry::{RegistryKey, ResultRegistry},
};

/// Problems with the set of checks, detected before anything is fetched.
#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    #[error("check #{index} has an empty name")]
    #[diagnostic(code(session::empty_check_name))]
    EmptyCheckName { index: usize },

    #[error("check name `{0}` is used more than once")]
    #[diagnostic(code(session::duplicate_check_name))]
    DuplicateCheckName(String),

    #[error("`{key}` is published by both `{first}` and `{second}`")]
    #[diagnostic(
        code(session::duplicate_publish_key),
        help("each registry key may be written by a single check")
    )]
    DuplicatePublishKey {
        key: RegistryKey,
        first: String,
        second: String,
    },

    #[error("check `{check}` depends on `{key}`, which no check publishes")]
    #[diagnostic(code(session::unknown_dependency))]
    UnknownDependency { check: String, key: RegistryKey },

    #[error("check `{check}` depends on `{key}`, which `{publisher}` only publishes later")]
    #[diagnostic(
        code(session::dependency_order),
        help("checks run in declaration order; move `{publisher}` before `{check}`")
    )]
    DependencyOrder {
        check: String,
        key: RegistryKey,
        publisher: String,
    },

    #[error("check `{check}` matches selectors against `{key}`, but `{publisher}` fetches a {kind}")]
    #[diagnostic(
        code(session::dependency_not_workload),
        help("selectors can only be matched against a Deployment or StatefulSet")
    )]
    DependencyNotWorkload {
        check: String,
        key: RegistryKey,
        publisher: String,
        kind: ResourceKind,
    },

    #[error("field `{field}` in check `{check}` does not apply to a {kind}")]
    #[diagnostic(code(session::field_not_applicable))]
    FieldNotApplicable {
        check: String,
        field: String,
        kind: ResourceKind,
    },

    #[error("check `{check}` matches selectors, but a {kind} has no selector")]
    #[diagnostic(code(session::selector_not_applicable))]
    SelectorNotApplicable { check: String, kind: ResourceKind },

    #[error("max_concurrency must be at least 1")]
    #[diagnostic(code(session::zero_concurrency))]
    ZeroConcurrency,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Upper bound on checks fetched at the same time. `1` runs strictly
    /// sequentially.
    pub max_concurrency: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { max_concurrency: 1 }
    }
}

/// Check `units` for configuration errors without running anything.
pub fn validate(units: &[CheckUnit]) -> Result<(), ConfigurationError> {
    let mut names = HashSet::new();
    // key -> (index, check name, kind)
    let mut publishers: HashMap<&RegistryKey, (usize, &str, ResourceKind)> = HashMap::new();

    for (index, unit) in units.iter().enumerate() {
        if unit.name().trim().is_empty() {
            return Err(ConfigurationError::EmptyCheckName { index });
        }
        if !names.insert(unit.name()) {
            return Err(ConfigurationError::DuplicateCheckName(unit.name().to_string()));
        }
        if let Some(key) = unit.publish_key() {
            if let Some((_, first, _)) = publishers.get(key) {
                return Err(ConfigurationError::DuplicatePublishKey {
                    key: key.clone(),
                    first: first.to_string(),
                    second: unit.name().to_string(),
                });
            }
            publishers.insert(key, (index, unit.name(), unit.resource().kind()));
        }
    }

    for (index, unit) in units.iter().enumerate() {
        let kind = unit.resource().kind();
        for assertion in unit.assertions() {
            match assertion.predicate() {
                Predicate::Field { field, .. } if !field.applies_to(kind) => {
                    return Err(ConfigurationError::FieldNotApplicable {
                        check: unit.name().to_string(),
                        field: field.to_string(),
                        kind,
                    });
                }
                Predicate::SelectorMatches { .. }
                    if !(kind.is_workload() || kind == ResourceKind::Service) =>
                {
                    return Err(ConfigurationError::SelectorNotApplicable {
                        check: unit.name().to_string(),
                        kind,
                    });
                }
                _ => {}
            }
        }

        for key in unit.dependencies() {
            let Some(&(publisher_index, publisher, publisher_kind)) = publishers.get(key) else {
                return Err(ConfigurationError::UnknownDependency {
                    check: unit.name().to_string(),
                    key: key.clone(),
                });
            };
            if publisher_index >= index {
                return Err(ConfigurationError::DependencyOrder {
                    check: unit.name().to_string(),
                    key: key.clone(),
                    publisher: publisher.to_string(),
                });
            }
            if !publisher_kind.is_workload() {
                return Err(ConfigurationError::DependencyNotWorkload {
                    check: unit.name().to_string(),
                    key: key.clone(),
                    publisher: publisher.to_string(),
                    kind: publisher_kind,
                });
            }
        }
    }
    Ok(())
}

/// A validated, ready-to-run set of checks against one backend.
///
/// `execute` consumes the session: it runs once, and the fetcher (with its
/// connection pool) is released when the report is returned.
pub struct Session {
    fetcher: Arc<dyn Fetcher>,
    units: Vec<CheckUnit>,
    registry: ResultRegistry,
    options: SessionOptions,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("units", &self.units.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        units: Vec<CheckUnit>,
        options: SessionOptions,
    ) -> Result<Self, ConfigurationError> {
        if options.max_concurrency == 0 {
            return Err(ConfigurationError::ZeroConcurrency);
        }
        validate(&units)?;
        Ok(Self {
            fetcher,
            units,
            registry: ResultRegistry::new(),
            options,
        })
    }

    pub async fn execute(self) -> SessionReport {
        let Session {
            fetcher,
            units,
            registry,
            options,
        } = self;
        info!(checks = units.len(), concurrency = options.max_concurrency, "session started");

        let mut results = Vec::with_capacity(units.len());
        for batch in batches(&units) {
            debug!(size = batch.len(), "running batch");
            let batch_results: Vec<CheckResult> = futures::stream::iter(
                batch.iter().map(|unit| unit.run(fetcher.as_ref(), &registry)),
            )
            .buffered(options.max_concurrency)
            .collect()
            .await;
            results.extend(batch_results);
        }

        drop(fetcher);
        let report = SessionReport { results };
        info!(
            passed = report.count(CheckStatus::Passed),
            failed = report.count(CheckStatus::Failed),
            errors = report.count(CheckStatus::Error),
            "session completed"
        );
        report
    }
}

/// Split units into runs of consecutive checks that may execute together:
/// a batch ends before any check that reads a key published inside it.
fn batches(units: &[CheckUnit]) -> Vec<&[CheckUnit]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut published: HashSet<&RegistryKey> = HashSet::new();
    for (i, unit) in units.iter().enumerate() {
        if unit.dependencies().iter().any(|k| published.contains(k)) {
            out.push(&units[start..i]);
            start = i;
            published.clear();
        }
        if let Some(key) = unit.publish_key() {
            published.insert(key);
        }
    }
    if start < units.len() {
        out.push(&units[start..]);
    }
    out
}

/// Every check result, in declaration order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionReport {
    pub results: Vec<CheckResult>,
}

impl SessionReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(CheckResult::passed)
    }

    pub fn has_transport_errors(&self) -> bool {
        self.count(CheckStatus::Error) > 0
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.results.iter().filter(|r| r.status() == status).count()
    }
}
