//! The `[log]` section: where the broker writes its log and from which level on.
//!
//! ```toml
//! [log]
//! to = "both"            # off | console | file | both
//! level = "info"         # trace | debug | info | warning | error | critical
//! dir = "/var/log/embermq"
//! file = "embermq.log"
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    #[serde(deserialize_with = "deserialize_level")]
    pub level: slog::Level,
    pub dir: PathBuf,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: To::Console,
            level: slog::Level::Info,
            dir: PathBuf::from("/var/log/embermq"),
            file: "embermq.log".into(),
        }
    }
}

impl Log {
    /// Log file to write to, `None` unless file output is on and a file name is set.
    #[inline]
    pub fn path(&self) -> Option<PathBuf> {
        if !self.to.file() || self.file.is_empty() {
            return None;
        }
        Some(self.dir.join(&self.file))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }

    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            _ => Err(format!("unknown log target {s:?}, expected off, console, file or both")),
        }
    }
}

impl fmt::Display for To {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            To::Off => "off",
            To::File => "file",
            To::Console => "console",
            To::Both => "both",
        };
        f.write_str(s)
    }
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<slog::Level, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    let parsed = match level.to_ascii_lowercase().as_str() {
        "trace" => slog::Level::Trace,
        "debug" => slog::Level::Debug,
        "info" => slog::Level::Info,
        "warn" | "warning" => slog::Level::Warning,
        "error" => slog::Level::Error,
        "crit" | "critical" => slog::Level::Critical,
        _ => return Err(de::Error::custom(format!("bad log level {level:?}"))),
    };
    Ok(parsed)
}
