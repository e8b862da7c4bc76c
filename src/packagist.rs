//! Packagist metadata client
//!
//! Fetches per-package version lists from the Composer v2 metadata
//! endpoint (`/p2/<vendor>/<name>.json`). Works against packagist.org or
//! any composer-type repository that serves the same shape.

use serde::Deserialize;

use crate::composer::{DistRef, LockPackage, SourceRef, PACKAGIST_URL};
use crate::error::{CorediffError, Result};
use crate::transport::Transport;

/// Metadata for a single package version.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Version {
    pub version: String,
    pub source: SourceRef,
    pub dist: DistRef,
}

impl Version {
    /// Convert a composer.lock entry into the same shape, so lock-pinned
    /// packages flow through the same indexing path.
    pub fn from_lock(pkg: &LockPackage) -> Version {
        Version {
            version: pkg.version.clone(),
            source: pkg.source.clone(),
            dist: pkg.dist.clone(),
        }
    }
}

/// Client for one composer metadata repository.
pub struct Client {
    base_url: String,
    transport: Transport,
}

impl Client {
    pub fn new(transport: Transport) -> Self {
        Self::with_base_url(PACKAGIST_URL, transport)
    }

    pub fn with_base_url(base_url: &str, transport: Transport) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
        }
    }

    /// All published versions for `pkg` ("vendor/package").
    pub fn versions(&self, pkg: &str) -> Result<Vec<Version>> {
        let (vendor, name) = pkg
            .split_once('/')
            .filter(|(v, n)| !v.is_empty() && !n.is_empty())
            .ok_or_else(|| CorediffError::BadPackageName {
                name: pkg.to_string(),
            })?;

        let url = format!("{}/p2/{vendor}/{name}.json", self.base_url);
        let resp = self.transport.get(&url, &[])?;
        if !resp.is_success() {
            return Err(CorediffError::HttpStatus {
                status: resp.status,
                url,
            });
        }

        #[derive(Deserialize)]
        struct Doc {
            packages: std::collections::HashMap<String, Vec<Version>>,
        }

        let doc: Doc = serde_json::from_slice(&resp.body)?;
        doc.packages
            .get(pkg)
            .cloned()
            .ok_or_else(|| CorediffError::Http {
                url,
                message: format!("package {pkg:?} not found in response"),
            })
    }
}
