//! Read-only access to cluster resources.
//!
//! The verification engine only sees the [`Fetcher`] trait. Two backends are
//! provided: [`KubeClient`] talks to a Kubernetes API server, and
//! [`FixtureFetcher`] serves snapshots captured ahead of time (for example
//! with `kubectl get -o json`).

pub mod fixture;
pub mod kube;
pub mod kubeconfig;

use std::{future::Future, pin::Pin};

pub use fixture::{FixtureError, FixtureFetcher};
pub use kube::{KubeClient, KubeClientOptions};
pub use kubeconfig::{ConfigError, ConfigSource, Connection};
use kverify_resources::{ResourceRef, Snapshot};
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Snapshot, FetchError>> + Send + 'a>>;

/// Source of resource snapshots. Implementations must not mutate the cluster.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, resource: &'a ResourceRef) -> FetchFuture<'a>;
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum FetchError {
    #[error("{0} not found")]
    #[diagnostic(code(fetcher::not_found))]
    NotFound(ResourceRef),

    #[error("failed to fetch {resource}: {message}")]
    #[diagnostic(code(fetcher::transport))]
    Transport {
        resource: ResourceRef,
        message: String,
    },

    #[error("failed to decode {resource}")]
    #[diagnostic(code(fetcher::decode))]
    Decode {
        resource: ResourceRef,
        #[source]
        source: kverify_resources::Error,
    },
}

/// How a fetch failure should be classified by reporters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The resource does not exist: the cluster drifted from the baseline.
    NotFound,
    /// The backend could not be reached or answered with garbage.
    Transport,
}

impl FetchError {
    pub fn transport(resource: &ResourceRef, message: impl Into<String>) -> Self {
        Self::Transport {
            resource: resource.clone(),
            message: message.into(),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FetchError::NotFound(_) => FailureKind::NotFound,
            FetchError::Transport { .. } | FetchError::Decode { .. } => FailureKind::Transport,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.failure_kind() == FailureKind::NotFound
    }
}
