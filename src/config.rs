//! Repository configuration, stored as `config.toml` in the repository
//! directory.
//!
//! ```toml
//! [storage]
//! backend = "pile"            # "pile" | "memory" | "object-store"
//! location = "s3://bucket/x"  # object-store only
//!
//! [graph]
//! backend = "edge-file"       # "edge-file" | "memory"
//!
//! [remotes.origin]
//! url = "file:///srv/parcels"
//! push_url = "s3://bucket/parcels"
//! fetch = "+refs/heads/*:refs/remotes/origin/*"
//! timeout_secs = 30
//!
//! [sync]
//! interval_secs = 10
//! workers = 2
//! queue_capacity = 64
//! ref_retries = 3
//! ```
//!
//! Every section is optional; missing values take their defaults.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::graph::GraphBackendKind;
use crate::refs::validate_remote_name;
use crate::refs::RefSpec;
use crate::store::StorageKind;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageConfig,
    pub graph: GraphConfig,
    pub remotes: BTreeMap<String, RemoteConfig>,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageKind,
    /// Backend specific; an object store URL for `object-store`.
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    pub backend: GraphBackendKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_url: Option<String>,
    /// Fetch refspec; defaults to `+refs/heads/*:refs/remotes/<name>/*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RemoteConfig {
            url: url.into(),
            push_url: None,
            fetch: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Attempts per tracking ref when a concurrent writer wins the CAS.
    pub ref_retries: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            interval_secs: 10,
            workers: 2,
            queue_capacity: 64,
            ref_retries: 3,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reads `<dir>/config.toml`; a missing file yields the defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml_str(&contents)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `<dir>/config.toml` through a temporary file and a rename.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE);
        let temp_path = path.with_extension("toml.tmp");
        let contents = self.to_toml_string()?;
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, remote) in &self.remotes {
            validate_remote_name(name)
                .map_err(|_| Error::Config(format!("invalid remote name {name:?}")))?;
            for url in std::iter::once(&remote.url).chain(remote.push_url.iter()) {
                if url.is_empty() {
                    return Err(Error::Config(format!("remote {name} has an empty url")));
                }
            }
            if let Some(spec) = &remote.fetch {
                spec.parse::<RefSpec>()?;
            }
        }
        if self.sync.workers == 0 || self.sync.queue_capacity == 0 {
            return Err(Error::Config(
                "sync.workers and sync.queue_capacity must be positive".to_owned(),
            ));
        }
        if self.storage.backend == StorageKind::ObjectStore && self.storage.location.is_none() {
            return Err(Error::Config(
                "the object-store storage backend needs a location".to_owned(),
            ));
        }
        Ok(())
    }
}
