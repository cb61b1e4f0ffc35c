use std::{collections::BTreeMap, sync::Arc};

use kverify_fetcher::{FailureKind, Fetcher};
use kverify_resources::ResourceRef;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    assertion::{self, Assertion, AssertionOutcome, Subject},
    registry::{RegistryKey, ResultRegistry},
};

/// One fetch plus the assertions evaluated against it.
#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
pub struct CheckUnit {
    name: String,
    resource: ResourceRef,
    #[builder(default)]
    assertions: Vec<Assertion>,
    /// Key the fetched snapshot is published under for later checks.
    publish: Option<RegistryKey>,
}

impl CheckUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn assertions(&self) -> &[Assertion] {
        &self.assertions
    }

    pub fn publish_key(&self) -> Option<&RegistryKey> {
        self.publish.as_ref()
    }

    /// Registry keys this check reads, in first-use order.
    pub fn dependencies(&self) -> Vec<&RegistryKey> {
        let mut deps: Vec<&RegistryKey> = Vec::new();
        for key in self.assertions.iter().filter_map(Assertion::dependency) {
            if !deps.contains(&key) {
                deps.push(key);
            }
        }
        deps
    }

    /// Runs inside a [`Session`](crate::Session), which validates publish keys
    /// up front; a duplicate key here is logged and the snapshot stays unpublished.
    pub(crate) async fn run(&self, fetcher: &dyn Fetcher, registry: &ResultRegistry) -> CheckResult {
        let mut dependencies = BTreeMap::new();
        for key in self.dependencies() {
            match registry.get(key) {
                Ok(snapshot) => {
                    dependencies.insert(key.clone(), snapshot);
                }
                Err(_) => {
                    warn!(check = %self.name, %key, "dependency was never published");
                    return self.finish(CheckOutcome::DependencyUnmet { key: key.clone() }, None);
                }
            }
        }

        let snapshot = match fetcher.fetch(&self.resource).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(err) => {
                warn!(check = %self.name, resource = %self.resource, error = %err, "fetch failed");
                let outcome = CheckOutcome::FetchFailed {
                    failure: err.failure_kind(),
                    message: err.to_string(),
                };
                return self.finish(outcome, None);
            }
        };

        let assertions = assertion::evaluate(
            &Subject {
                snapshot: &snapshot,
                dependencies: &dependencies,
            },
            &self.assertions,
        );

        let mut published = None;
        if let Some(key) = &self.publish {
            match registry.publish(key.clone(), Arc::clone(&snapshot)) {
                Ok(()) => published = Some(key.clone()),
                Err(err) => warn!(check = %self.name, error = %err, "failed to publish snapshot"),
            }
        }

        self.finish(CheckOutcome::Evaluated { assertions }, published)
    }

    fn finish(&self, outcome: CheckOutcome, published: Option<RegistryKey>) -> CheckResult {
        let result = CheckResult {
            name: self.name.clone(),
            resource: self.resource.clone(),
            outcome,
            published,
        };
        info!(
            check = %result.name,
            resource = %result.resource,
            status = ?result.status(),
            "check finished"
        );
        result
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CheckOutcome {
    /// The resource was fetched and every assertion ran.
    Evaluated { assertions: Vec<AssertionOutcome> },
    /// The fetch failed; no assertion ran.
    FetchFailed {
        failure: FailureKind,
        message: String,
    },
    /// A registry key this check reads was never published.
    DependencyUnmet { key: RegistryKey },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckStatus {
    Passed,
    /// The cluster does not match the baseline.
    Failed,
    /// The cluster could not be inspected.
    Error,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub resource: ResourceRef,
    pub outcome: CheckOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<RegistryKey>,
}

impl CheckResult {
    pub fn status(&self) -> CheckStatus {
        match &self.outcome {
            CheckOutcome::Evaluated { assertions } if assertions.iter().all(|a| a.passed) => {
                CheckStatus::Passed
            }
            CheckOutcome::Evaluated { .. } | CheckOutcome::DependencyUnmet { .. } => {
                CheckStatus::Failed
            }
            CheckOutcome::FetchFailed {
                failure: FailureKind::NotFound,
                ..
            } => CheckStatus::Failed,
            CheckOutcome::FetchFailed {
                failure: FailureKind::Transport,
                ..
            } => CheckStatus::Error,
        }
    }

    pub fn passed(&self) -> bool {
        self.status() == CheckStatus::Passed
    }

    pub fn failed_assertions(&self) -> impl Iterator<Item = &AssertionOutcome> {
        let assertions = match &self.outcome {
            CheckOutcome::Evaluated { assertions } => assertions.as_slice(),
            _ => &[],
        };
        assertions.iter().filter(|a| !a.passed)
    }
}
