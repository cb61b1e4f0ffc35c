use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use kverify_resources::{ResourceKind, ResourceRef, Snapshot};
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{FetchError, FetchFuture, Fetcher};

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum FixtureError {
    #[error("failed to read fixtures from `{}`", path.display())]
    #[diagnostic(code(fixture::io_error))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in `{}`", path.display())]
    #[diagnostic(code(fixture::invalid_json))]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {kind} object in `{}`", path.display())]
    #[diagnostic(code(fixture::invalid_object))]
    Object {
        path: PathBuf,
        kind: ResourceKind,
        #[source]
        source: kverify_resources::Error,
    },

    #[error("object in `{}` has no metadata.name", path.display())]
    #[diagnostic(code(fixture::missing_name))]
    MissingName { path: PathBuf },

    #[error("{resource} is defined twice (second copy in `{}`)", path.display())]
    #[diagnostic(code(fixture::duplicate_object))]
    Duplicate { path: PathBuf, resource: ResourceRef },
}

/// Serves snapshots recorded ahead of time instead of querying a cluster.
///
/// Fixture directories hold `*.json` files, each either a single object or a
/// `List` (the shape `kubectl get -o json` prints). Objects of kinds that
/// cannot be asserted against are skipped; objects without a namespace land
/// in `default`.
#[derive(Clone, Debug)]
pub struct FixtureFetcher {
    objects: Arc<BTreeMap<ResourceRef, Snapshot>>,
}

impl FixtureFetcher {
    pub fn load_dir(dir: &Path) -> Result<Self, FixtureError> {
        let mut files = Vec::new();
        collect_json_files(dir, &mut files)?;
        files.sort();

        let mut objects = BTreeMap::new();
        for file in files {
            let raw = fs::read(&file).map_err(|source| FixtureError::Io {
                path: file.clone(),
                source,
            })?;
            let value: Value = serde_json::from_slice(&raw).map_err(|source| FixtureError::Json {
                path: file.clone(),
                source,
            })?;
            let items = match value {
                Value::Object(ref obj) if obj.get("kind").and_then(Value::as_str) == Some("List") => {
                    obj.get("items")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default()
                }
                other => vec![other],
            };
            for item in items {
                let Some((resource, snapshot)) = decode_object(&file, item)? else {
                    continue;
                };
                if objects.contains_key(&resource) {
                    return Err(FixtureError::Duplicate {
                        path: file.clone(),
                        resource,
                    });
                }
                trace!(%resource, file = %file.display(), "loaded fixture object");
                objects.insert(resource, snapshot);
            }
        }
        debug!(count = objects.len(), dir = %dir.display(), "loaded fixtures");
        Ok(Self {
            objects: Arc::new(objects),
        })
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Fetcher for FixtureFetcher {
    fn fetch<'a>(&'a self, resource: &'a ResourceRef) -> FetchFuture<'a> {
        let result = self
            .objects
            .get(resource)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(resource.clone()));
        Box::pin(std::future::ready(result))
    }
}

fn collect_json_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), FixtureError> {
    let io_err = |source| FixtureError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            collect_json_files(&path, files)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            files.push(path);
        }
    }
    Ok(())
}

fn decode_object(
    path: &Path,
    value: Value,
) -> Result<Option<(ResourceRef, Snapshot)>, FixtureError> {
    let Some(kind) = value
        .get("kind")
        .and_then(Value::as_str)
        .and_then(|k| k.parse::<ResourceKind>().ok())
    else {
        debug!(file = %path.display(), "skipping fixture object of unsupported kind");
        return Ok(None);
    };
    let metadata = value.get("metadata");
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_string();
    let resource = ResourceRef::new(kind, name, namespace).map_err(|_| FixtureError::MissingName {
        path: path.to_path_buf(),
    })?;
    let snapshot = Snapshot::from_value(kind, value).map_err(|source| FixtureError::Object {
        path: path.to_path_buf(),
        kind,
        source,
    })?;
    Ok(Some((resource, snapshot)))
}
