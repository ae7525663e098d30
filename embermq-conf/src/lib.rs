#![deny(unsafe_code)]

//! Broker settings, loaded with the `config` crate.
//!
//! Sources, later ones overriding earlier ones:
//! 1. `/etc/embermq/embermq.{toml,...}` and `./embermq.{toml,...}` (all optional)
//! 2. the file named by [`Options::cfg_name`]
//! 3. `EMBERMQ_<SECTION>__<KEY>` environment variables, e.g. `EMBERMQ_FLOW__BUFFER_CAPACITY=512`
//! 4. the remaining [`Options`] fields

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use embermq_utils::{deserialize_duration, Bytesize};

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub flow: Flow,
    #[serde(default)]
    pub consumer: Consumer,
    #[serde(default)]
    pub replication: Replication,
    #[serde(default)]
    pub offsets: Offsets,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Inner {
    pub fn validate(&self) -> Result<()> {
        if self.storage.segment_bytes.as_u64() == 0 {
            return Err(anyhow!("storage.segment_bytes must be greater than 0"));
        }
        if self.storage.index_interval_bytes.as_u64() == 0 {
            return Err(anyhow!("storage.index_interval_bytes must be greater than 0"));
        }
        if self.flow.buffer_capacity == 0 {
            return Err(anyhow!("flow.buffer_capacity must be greater than 0"));
        }
        if self.flow.batch_max == 0 {
            return Err(anyhow!("flow.batch_max must be greater than 0"));
        }
        if self.consumer.max_inflight == 0 {
            return Err(anyhow!("consumer.max_inflight must be greater than 0"));
        }
        if !matches!(self.consumer.assignor.as_str(), "round_robin" | "key_hash" | "random") {
            return Err(anyhow!("consumer.assignor must be one of round_robin, key_hash or random"));
        }
        if self.offsets.compact_threshold < 2 {
            return Err(anyhow!("offsets.compact_threshold must be at least 2"));
        }
        Ok(())
    }
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Settings(Arc::new(inner))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from(Inner::default())
    }
}

impl Settings {
    pub fn load(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/embermq/embermq").required(false))
            .add_source(File::with_name("embermq").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("embermq").prefix_separator("_").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(data_dir) = opts.data_dir.as_ref() {
            inner.storage.data_dir.clone_from(data_dir);
        }

        inner.validate()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::load(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("data_dir is {:?}", self.storage.data_dir);
        log::info!("storage config is: {:?}", self.storage);
        log::info!("flow config is: {:?}", self.flow);
        log::info!("consumer config is: {:?}", self.consumer);
        log::info!("replication config is: {:?}", self.replication);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    #[serde(default = "Storage::data_dir_default")]
    pub data_dir: PathBuf,
    //Roll to a new segment once the active one holds this many bytes.
    #[serde(default = "Storage::segment_bytes_default")]
    pub segment_bytes: Bytesize,
    //Roll to a new segment once the active one is older than this.
    #[serde(default = "Storage::segment_ms_default", deserialize_with = "deserialize_duration")]
    pub segment_ms: Duration,
    //Bytes of records between two sparse index entries.
    #[serde(default = "Storage::index_interval_bytes_default")]
    pub index_interval_bytes: Bytesize,
    //Total bytes kept per topic, 0 keeps everything.
    #[serde(default)]
    pub retention_bytes: Bytesize,
    //Age after which a closed segment is deleted, 0 keeps everything.
    #[serde(default = "Storage::retention_ms_default", deserialize_with = "deserialize_duration")]
    pub retention_ms: Duration,
    #[serde(default = "Storage::retention_check_interval_default", deserialize_with = "deserialize_duration")]
    pub retention_check_interval: Duration,
}

impl Default for Storage {
    #[inline]
    fn default() -> Self {
        Self {
            data_dir: Self::data_dir_default(),
            segment_bytes: Self::segment_bytes_default(),
            segment_ms: Self::segment_ms_default(),
            index_interval_bytes: Self::index_interval_bytes_default(),
            retention_bytes: Bytesize::default(),
            retention_ms: Self::retention_ms_default(),
            retention_check_interval: Self::retention_check_interval_default(),
        }
    }
}

impl Storage {
    fn data_dir_default() -> PathBuf {
        PathBuf::from("./embermq-data")
    }
    fn segment_bytes_default() -> Bytesize {
        Bytesize::from("64M")
    }
    fn segment_ms_default() -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }
    fn index_interval_bytes_default() -> Bytesize {
        Bytesize::from("4K")
    }
    fn retention_ms_default() -> Duration {
        Duration::ZERO
    }
    fn retention_check_interval_default() -> Duration {
        Duration::from_secs(300)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flow {
    //Messages accepted but not yet durably appended, per topic.
    #[serde(default = "Flow::buffer_capacity_default")]
    pub buffer_capacity: usize,
    //Most messages the writer appends in one batch.
    #[serde(default = "Flow::batch_max_default")]
    pub batch_max: usize,
    //How long the writer waits for a batch to fill.
    #[serde(default = "Flow::linger_default", deserialize_with = "deserialize_duration")]
    pub linger: Duration,
    //Messages allowed per rate_period on one topic, 0 disables rate limiting.
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default = "Flow::rate_period_default", deserialize_with = "deserialize_duration")]
    pub rate_period: Duration,
}

impl Default for Flow {
    #[inline]
    fn default() -> Self {
        Self {
            buffer_capacity: Self::buffer_capacity_default(),
            batch_max: Self::batch_max_default(),
            linger: Self::linger_default(),
            rate_limit: 0,
            rate_period: Self::rate_period_default(),
        }
    }
}

impl Flow {
    fn buffer_capacity_default() -> usize {
        10_000
    }
    fn batch_max_default() -> usize {
        512
    }
    fn linger_default() -> Duration {
        Duration::from_millis(1)
    }
    fn rate_period_default() -> Duration {
        Duration::from_secs(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Consumer {
    //A member that has not fetched or heartbeated for this long is removed.
    #[serde(default = "Consumer::session_timeout_default", deserialize_with = "deserialize_duration")]
    pub session_timeout: Duration,
    //Delivered messages not committed within this time are redelivered.
    #[serde(default = "Consumer::ack_timeout_default", deserialize_with = "deserialize_duration")]
    pub ack_timeout: Duration,
    //Unacknowledged messages held by one member before it stops receiving more.
    #[serde(default = "Consumer::max_inflight_default")]
    pub max_inflight: usize,
    #[serde(default = "Consumer::fetch_max_default")]
    pub fetch_max: usize,
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,
    #[serde(default)]
    pub out_of_range: OutOfRange,
    #[serde(default = "Consumer::reap_interval_default", deserialize_with = "deserialize_duration")]
    pub reap_interval: Duration,
    //How messages are spread over group members: round_robin, key_hash or random.
    #[serde(default = "Consumer::assignor_default")]
    pub assignor: String,
}

impl Default for Consumer {
    #[inline]
    fn default() -> Self {
        Self {
            session_timeout: Self::session_timeout_default(),
            ack_timeout: Self::ack_timeout_default(),
            max_inflight: Self::max_inflight_default(),
            fetch_max: Self::fetch_max_default(),
            auto_offset_reset: OffsetReset::default(),
            out_of_range: OutOfRange::default(),
            reap_interval: Self::reap_interval_default(),
            assignor: Self::assignor_default(),
        }
    }
}

impl Consumer {
    fn session_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn ack_timeout_default() -> Duration {
        Duration::from_secs(60)
    }
    fn max_inflight_default() -> usize {
        1000
    }
    fn fetch_max_default() -> usize {
        500
    }
    fn reap_interval_default() -> Duration {
        Duration::from_secs(1)
    }
    fn assignor_default() -> String {
        "round_robin".into()
    }
}

/// Where a group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl<'de> Deserialize<'de> for OffsetReset {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match (String::deserialize(deserializer)?).to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(de::Error::unknown_variant(other, &["earliest", "latest"])),
        }
    }
}

/// What a group does when its position was evicted by retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutOfRange {
    #[default]
    ResetEarliest,
    Fail,
}

impl<'de> Deserialize<'de> for OutOfRange {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match (String::deserialize(deserializer)?).to_ascii_lowercase().as_str() {
            "reset_earliest" => Ok(OutOfRange::ResetEarliest),
            "fail" => Ok(OutOfRange::Fail),
            other => Err(de::Error::unknown_variant(other, &["reset_earliest", "fail"])),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Replication {
    //Replicas that must acknowledge an ack-level-2 publish.
    #[serde(default)]
    pub replicas: usize,
    #[serde(default = "Replication::ack_timeout_default", deserialize_with = "deserialize_duration")]
    pub ack_timeout: Duration,
}

impl Default for Replication {
    #[inline]
    fn default() -> Self {
        Self { replicas: 0, ack_timeout: Self::ack_timeout_default() }
    }
}

impl Replication {
    fn ack_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Offsets {
    #[serde(default = "Offsets::sync_on_commit_default")]
    pub sync_on_commit: bool,
    //Compact the commit log when it holds this many records per live key.
    #[serde(default = "Offsets::compact_threshold_default")]
    pub compact_threshold: usize,
}

impl Default for Offsets {
    #[inline]
    fn default() -> Self {
        Self { sync_on_commit: Self::sync_on_commit_default(), compact_threshold: Self::compact_threshold_default() }
    }
}

impl Offsets {
    fn sync_on_commit_default() -> bool {
        true
    }
    fn compact_threshold_default() -> usize {
        8
    }
}
