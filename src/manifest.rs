//! Compose manifest resolution
//!
//! The fleet is described by a root manifest whose `include:` list names one
//! compose fragment per demo directory. Activation needs to know which
//! directory declares a service so an optional `.env` file next to the
//! fragment can be passed to the compose CLI.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// File name of the root manifest and of every included fragment.
pub const ROOT_MANIFEST: &str = "docker-compose.yml";

#[derive(Debug, Deserialize)]
struct RootManifest {
    #[serde(default)]
    include: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Fragment {
    #[serde(default)]
    services: HashMap<String, serde_yaml::Value>,
}

/// Why a service name could not be mapped to a fragment directory
#[derive(Debug)]
pub enum ResolveError {
    RootUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    RootInvalid {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    ServiceNotFound {
        service: String,
    },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::RootUnreadable { path, source } => {
                write!(f, "failed to read root manifest {}: {}", path.display(), source)
            }
            ResolveError::RootInvalid { path, source } => {
                write!(f, "failed to parse root manifest {}: {}", path.display(), source)
            }
            ResolveError::ServiceNotFound { service } => {
                write!(
                    f,
                    "service {} is not declared by any included compose file",
                    service
                )
            }
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::RootUnreadable { source, .. } => Some(source),
            ResolveError::RootInvalid { source, .. } => Some(source),
            ResolveError::ServiceNotFound { .. } => None,
        }
    }
}

/// Maps service names to the directory of the compose fragment declaring them.
///
/// Every call re-reads the manifest tree; the fleet is small and the tree may
/// change between activations.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    demos_dir: PathBuf,
}

impl ManifestResolver {
    pub fn new(demos_dir: PathBuf) -> Self {
        Self { demos_dir }
    }

    /// Find the directory of the first included fragment whose `services`
    /// mapping declares `service`.
    ///
    /// Unreadable or malformed includes are logged and skipped; they never
    /// abort the search.
    pub async fn resolve(&self, service: &str) -> Result<PathBuf, ResolveError> {
        let root_path = self.demos_dir.join(ROOT_MANIFEST);
        let data = tokio::fs::read_to_string(&root_path).await.map_err(|source| {
            ResolveError::RootUnreadable {
                path: root_path.clone(),
                source,
            }
        })?;
        let root: RootManifest =
            serde_yaml::from_str(&data).map_err(|source| ResolveError::RootInvalid {
                path: root_path.clone(),
                source,
            })?;

        for include in &root.include {
            let fragment_path = self.demos_dir.join(include);
            if let Some(dir) = self.fragment_declares(&fragment_path, service).await {
                return Ok(dir);
            }
        }

        Err(ResolveError::ServiceNotFound {
            service: service.to_string(),
        })
    }

    async fn fragment_declares(&self, fragment_path: &Path, service: &str) -> Option<PathBuf> {
        let text = match tokio::fs::read_to_string(fragment_path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %fragment_path.display(), error = %e, "could not read included compose file, skipping");
                return None;
            }
        };
        let fragment: Fragment = match serde_yaml::from_str(&text) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!(path = %fragment_path.display(), error = %e, "could not parse included compose file, skipping");
                return None;
            }
        };
        if fragment.services.contains_key(service) {
            let dir = fragment_path.parent().unwrap_or(&self.demos_dir);
            return Some(dir.to_path_buf());
        }
        None
    }
}
