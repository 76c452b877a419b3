use std::path::PathBuf;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::errors::{Result, StoreError};

pub const DEFAULT_FILE_PATH: &str = "dbfile.bin";
pub const DEFAULT_LOCK_NAME: &str = "syncstore";
pub const DEFAULT_READER_BOUND: u32 = 10;
pub const DEFAULT_TIMEOUT_MS: u64 = 100_000;

/// Names and limits of the coordinator's primitives. Every cooperating
/// process must use the same `name` and `reader_bound`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub name: String,
    pub reader_bound: u32,
    pub timeout_ms: u64,
    /// Keep the named segment alive after the instance that created it drops.
    pub persist_primitives: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            name: DEFAULT_LOCK_NAME.to_string(),
            reader_bound: DEFAULT_READER_BOUND,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            persist_primitives: true,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(crate) fn os_id(&self) -> String {
        format!("/{}", self.name.trim_start_matches('/'))
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim_start_matches('/');
        if name.is_empty() || name.contains('/') {
            return Err(StoreError::Config(format!(
                "lock name {:?} must be non-empty and contain no '/'",
                self.name
            )));
        }
        if self.reader_bound == 0 {
            return Err(StoreError::Config("reader_bound must be at least 1".into()));
        }
        if self.timeout_ms == 0 {
            return Err(StoreError::Config("timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub file_path: PathBuf,
    pub codec: Codec,
    /// Write snapshots to a temporary sibling and rename it over the file.
    pub atomic_writes: bool,
    pub lock: LockConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            file_path: PathBuf::from(DEFAULT_FILE_PATH),
            codec: Codec::default(),
            atomic_writes: true,
            lock: LockConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder {
            config: StoreConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_path.as_os_str().is_empty() {
            return Err(StoreError::Config("file_path must not be empty".into()));
        }
        self.lock.validate()
    }
}

#[derive(Debug)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.file_path = path.into();
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn atomic_writes(mut self, enabled: bool) -> Self {
        self.config.atomic_writes = enabled;
        self
    }

    pub fn lock_name(mut self, name: impl Into<String>) -> Self {
        self.config.lock.name = name.into();
        self
    }

    pub fn reader_bound(mut self, bound: u32) -> Self {
        self.config.lock.reader_bound = bound;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.lock.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn persist_primitives(mut self, persist: bool) -> Self {
        self.config.lock.persist_primitives = persist;
        self
    }

    pub fn build(self) -> Result<StoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
