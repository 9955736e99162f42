//! Engine configuration.
//!
//! A [`Configuration`] can be built programmatically or parsed from a flat
//! property map (the `key=value` style used by deployment scripts):
//!
//! ```text
//! buffer.size.16384 = 256
//! volume.data = path=/var/lib/folio/data.v01,pageSize=16384,maxPages=1000000
//! journal.path = /var/lib/folio/journal
//! journal.size = 67108864
//! sync.policy = GROUP_COMMIT
//! checkpoint.interval.ms = 120000
//! cleanup.poll.ms = 1000
//! splitPolicy = PACK
//! joinPolicy = EVEN
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{Error, Result};

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 32768;

/// Default page size (16 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 16384;

/// Default number of buffer frames per page-size class.
pub const DEFAULT_BUFFER_FRAMES: usize = 512;

/// Default maximum journal segment size (64 MiB).
pub const DEFAULT_JOURNAL_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default checkpoint interval.
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 120_000;

/// Default cleanup poll interval.
pub const DEFAULT_CLEANUP_POLL_MS: i64 = 1_000;

/// Default page-writer pass interval.
pub const DEFAULT_PAGE_WRITER_INTERVAL_MS: u64 = 1_000;

/// Default group-commit coalescing window.
pub const DEFAULT_GROUP_COMMIT_WINDOW_MS: u64 = 5;

/// Default timeout for pin acquisition and other blocking operations.
pub const DEFAULT_PIN_TIMEOUT_MS: u64 = 10_000;

/// Default time to wait for worker quiescence at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// When the journal is synced relative to transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync the journal on every commit.
    EveryCommit,
    /// Coalesce syncs within a small window.
    GroupCommit,
    /// Sync only on the flusher's periodic pass.
    Periodic,
}

impl SyncPolicy {
    /// Parse a policy name, case-insensitively.
    pub fn by_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "EVERY_COMMIT" => Ok(SyncPolicy::EveryCommit),
            "GROUP_COMMIT" => Ok(SyncPolicy::GroupCommit),
            "PERIODIC" => Ok(SyncPolicy::Periodic),
            _ => Err(Error::UnknownPolicy(name.to_string())),
        }
    }
}

/// Specification for one volume.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// Logical name used to look the volume up.
    pub name: String,
    /// Path of the volume file.
    pub path: PathBuf,
    /// Page size; must be a power of two in `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`.
    pub page_size: usize,
    /// Pages preallocated at creation.
    pub initial_pages: u64,
    /// Hard cap on the number of pages; allocation past this fails with
    /// `VolumeFull`.
    pub max_pages: u64,
    /// Whether to create the volume if the file does not exist.
    pub create: bool,
}

impl VolumeSpec {
    /// A spec with defaults for everything but name and path.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            initial_pages: 4,
            max_pages: u64::MAX / MAX_PAGE_SIZE as u64,
            create: true,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn max_pages(mut self, max_pages: u64) -> Self {
        self.max_pages = max_pages;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(Error::InvalidConfiguration(
                format!("volume.{}", self.name),
                format!("page size {} is not a power of two in range", self.page_size),
            ));
        }
        if self.max_pages < 2 {
            return Err(Error::InvalidConfiguration(
                format!("volume.{}", self.name),
                "maxPages must allow at least the header and directory pages".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Directory holding `jrn.<generation>` files.
    pub journal_path: PathBuf,
    /// Maximum size of a journal segment before rollover.
    pub journal_segment_size: u64,
    /// Journal sync policy.
    pub sync_policy: SyncPolicy,
    /// Interval between automatic checkpoints.
    pub checkpoint_interval_ms: u64,
    /// Interval between cleanup wake-ups; `-1` suspends the worker.
    pub cleanup_poll_ms: i64,
    /// Interval between page-writer write-back passes.
    pub page_writer_interval_ms: u64,
    /// Group-commit coalescing window.
    pub group_commit_window_ms: u64,
    /// Default split policy name.
    pub split_policy: String,
    /// Default join policy name.
    pub join_policy: String,
    /// Buffer frame counts keyed by page size (`buffer.size.<N>`).
    pub buffer_frames: HashMap<usize, usize>,
    /// Volumes to open or create at initialization.
    pub volumes: Vec<VolumeSpec>,
    /// Timeout for pin acquisition and other blocking operations.
    pub pin_timeout_ms: u64,
    /// Time to wait for worker quiescence at shutdown before forcing exit.
    pub shutdown_timeout_ms: u64,
}

impl Configuration {
    /// A configuration with defaults, journaling under `journal_path`.
    pub fn new(journal_path: impl Into<PathBuf>) -> Self {
        Self {
            journal_path: journal_path.into(),
            journal_segment_size: DEFAULT_JOURNAL_SEGMENT_SIZE,
            sync_policy: SyncPolicy::GroupCommit,
            checkpoint_interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
            cleanup_poll_ms: DEFAULT_CLEANUP_POLL_MS,
            page_writer_interval_ms: DEFAULT_PAGE_WRITER_INTERVAL_MS,
            group_commit_window_ms: DEFAULT_GROUP_COMMIT_WINDOW_MS,
            split_policy: "PACK".to_string(),
            join_policy: "EVEN".to_string(),
            buffer_frames: HashMap::new(),
            volumes: Vec::new(),
            pin_timeout_ms: DEFAULT_PIN_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }

    /// Add a volume spec.
    pub fn volume(mut self, spec: VolumeSpec) -> Self {
        self.volumes.push(spec);
        self
    }

    /// Set the frame count for a page-size class.
    pub fn buffer_frames(mut self, page_size: usize, frames: usize) -> Self {
        self.buffer_frames.insert(page_size, frames);
        self
    }

    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    pub fn split_policy(mut self, name: impl Into<String>) -> Self {
        self.split_policy = name.into();
        self
    }

    pub fn join_policy(mut self, name: impl Into<String>) -> Self {
        self.join_policy = name.into();
        self
    }

    pub fn cleanup_poll_ms(mut self, interval: i64) -> Self {
        self.cleanup_poll_ms = interval;
        self
    }

    pub fn checkpoint_interval_ms(mut self, interval: u64) -> Self {
        self.checkpoint_interval_ms = interval;
        self
    }

    /// The pin timeout as a `Duration`.
    pub fn pin_timeout(&self) -> Duration {
        Duration::from_millis(self.pin_timeout_ms)
    }

    /// The shutdown timeout as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Frame count for a page-size class, falling back to the default.
    pub fn frames_for(&self, page_size: usize) -> usize {
        self.buffer_frames
            .get(&page_size)
            .copied()
            .unwrap_or(DEFAULT_BUFFER_FRAMES)
    }

    /// Parse a configuration from a flat property map.
    ///
    /// Recognized keys: `journal.path`, `journal.size`, `sync.policy`,
    /// `checkpoint.interval.ms`, `cleanup.poll.ms`, `splitPolicy`,
    /// `joinPolicy`, `buffer.size.<N>`, and `volume.<name>` whose value is
    /// a comma-separated list of `path=`, `pageSize=`, `initialPages=`,
    /// `maxPages=`, `create=` attributes.
    ///
    /// # Errors
    /// `MissingConfiguration` if `journal.path` is absent;
    /// `InvalidConfiguration` for unparseable values.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let journal_path = props
            .get("journal.path")
            .ok_or_else(|| Error::MissingConfiguration("journal.path".to_string()))?;

        let mut config = Configuration::new(journal_path);

        for (key, value) in props {
            if key == "journal.path" {
                continue;
            } else if key == "journal.size" {
                config.journal_segment_size = parse_num(key, value)?;
            } else if key == "sync.policy" {
                config.sync_policy = SyncPolicy::by_name(value)?;
            } else if key == "checkpoint.interval.ms" {
                config.checkpoint_interval_ms = parse_num(key, value)?;
            } else if key == "cleanup.poll.ms" {
                config.cleanup_poll_ms = parse_num(key, value)?;
            } else if key == "splitPolicy" {
                config.split_policy = value.clone();
            } else if key == "joinPolicy" {
                config.join_policy = value.clone();
            } else if let Some(size) = key.strip_prefix("buffer.size.") {
                let page_size: usize = parse_num("buffer.size", size)?;
                let frames: usize = parse_num(key, value)?;
                config.buffer_frames.insert(page_size, frames);
            } else if let Some(name) = key.strip_prefix("volume.") {
                config.volumes.push(parse_volume(name, value)?);
            } else {
                return Err(Error::InvalidConfiguration(
                    key.clone(),
                    "unrecognized configuration key".to_string(),
                ));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        for spec in &self.volumes {
            spec.validate()?;
        }
        if self.journal_segment_size < 1024 * 1024 {
            return Err(Error::InvalidConfiguration(
                "journal.size".to_string(),
                "journal segments must be at least 1 MiB".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        Error::InvalidConfiguration(key.to_string(), format!("cannot parse {:?}", value))
    })
}

fn parse_volume(name: &str, value: &str) -> Result<VolumeSpec> {
    let mut path: Option<PathBuf> = None;
    let mut spec = VolumeSpec::new(name, "");

    for attr in value.split(',') {
        let attr = attr.trim();
        if attr.is_empty() {
            continue;
        }
        let (k, v) = attr.split_once('=').ok_or_else(|| {
            Error::InvalidConfiguration(
                format!("volume.{}", name),
                format!("attribute {:?} is not key=value", attr),
            )
        })?;
        match k.trim() {
            "path" => path = Some(PathBuf::from(v.trim())),
            "pageSize" => spec.page_size = parse_num("pageSize", v)?,
            "initialPages" => spec.initial_pages = parse_num("initialPages", v)?,
            "maxPages" => spec.max_pages = parse_num("maxPages", v)?,
            "create" => spec.create = parse_num("create", v)?,
            other => {
                return Err(Error::InvalidConfiguration(
                    format!("volume.{}", name),
                    format!("unknown attribute {:?}", other),
                ))
            }
        }
    }

    spec.path = path.ok_or_else(|| {
        Error::InvalidConfiguration(format!("volume.{}", name), "missing path".to_string())
    })?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::new("/tmp/jrn");
        assert_eq!(config.sync_policy, SyncPolicy::GroupCommit);
        assert_eq!(config.split_policy, "PACK");
        assert_eq!(config.join_policy, "EVEN");
        assert_eq!(config.frames_for(DEFAULT_PAGE_SIZE), DEFAULT_BUFFER_FRAMES);
    }

    #[test]
    fn test_sync_policy_by_name() {
        assert_eq!(
            SyncPolicy::by_name("every_commit").unwrap(),
            SyncPolicy::EveryCommit
        );
        assert_eq!(
            SyncPolicy::by_name("GROUP_COMMIT").unwrap(),
            SyncPolicy::GroupCommit
        );
        assert!(SyncPolicy::by_name("bogus").is_err());
    }

    #[test]
    fn test_from_properties() {
        let mut props = HashMap::new();
        props.insert("journal.path".to_string(), "/tmp/jrn".to_string());
        props.insert("journal.size".to_string(), "16777216".to_string());
        props.insert("sync.policy".to_string(), "PERIODIC".to_string());
        props.insert("buffer.size.8192".to_string(), "128".to_string());
        props.insert(
            "volume.data".to_string(),
            "path=/tmp/data.v01,pageSize=8192,maxPages=4096".to_string(),
        );
        props.insert("splitPolicy".to_string(), "NICE".to_string());

        let config = Configuration::from_properties(&props).unwrap();
        assert_eq!(config.journal_segment_size, 16777216);
        assert_eq!(config.sync_policy, SyncPolicy::Periodic);
        assert_eq!(config.frames_for(8192), 128);
        assert_eq!(config.split_policy, "NICE");
        assert_eq!(config.volumes.len(), 1);
        assert_eq!(config.volumes[0].page_size, 8192);
        assert_eq!(config.volumes[0].max_pages, 4096);
    }

    #[test]
    fn test_missing_journal_path() {
        let props = HashMap::new();
        assert!(matches!(
            Configuration::from_properties(&props),
            Err(Error::MissingConfiguration(_))
        ));
    }

    #[test]
    fn test_bad_page_size_rejected() {
        let mut props = HashMap::new();
        props.insert("journal.path".to_string(), "/tmp/jrn".to_string());
        props.insert(
            "volume.data".to_string(),
            "path=/tmp/data.v01,pageSize=5000".to_string(),
        );
        assert!(Configuration::from_properties(&props).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut props = HashMap::new();
        props.insert("journal.path".to_string(), "/tmp/jrn".to_string());
        props.insert("bogus.key".to_string(), "1".to_string());
        assert!(Configuration::from_properties(&props).is_err());
    }
}
