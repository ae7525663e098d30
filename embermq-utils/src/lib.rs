//! Small helpers shared by the embermq crates.
//!
//! - [`Bytesize`]: "1G512M"-style sizes used by segment and retention settings
//! - [`to_duration`]: "1h30m"-style durations for timeouts and intervals
//! - wall-clock timestamps in milliseconds, used as message produce times
//! - [`Counter`]: an atomic current/max pair backing the broker stats
//!
//! ```
//! use embermq_utils::{to_duration, Bytesize};
//!
//! assert_eq!(Bytesize::from("1G512M").as_u64(), 1_610_612_736);
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use serde::{
    de::{self, Deserializer},
    ser::Serializer,
    Deserialize, Serialize,
};

mod counter;

pub use counter::Counter;

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

const BYTESIZE_K: u64 = 1024;
const BYTESIZE_M: u64 = 1024 * 1024;
const BYTESIZE_G: u64 = 1024 * 1024 * 1024;

/// A byte count that reads and writes as a human-readable string ("64M", "2G512M").
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytesize(pub u64);

impl Bytesize {
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Formats the size with the largest units first, `3145728` becomes `"3M"`.
    pub fn string(&self) -> String {
        let mut v = self.0;
        let mut res = String::new();
        for (unit, name) in [(BYTESIZE_G, 'G'), (BYTESIZE_M, 'M'), (BYTESIZE_K, 'K')] {
            let n = v / unit;
            if n > 0 {
                res.push_str(&format!("{n}{name}"));
                v %= unit;
            }
        }
        if v > 0 || res.is_empty() {
            res.push_str(&format!("{v}B"));
        }
        res
    }
}

impl Deref for Bytesize {
    type Target = u64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for Bytesize {
    fn from(v: u64) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesizeVisitor;

        impl de::Visitor<'_> for BytesizeVisitor {
            type Value = Bytesize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte size such as 4096, \"64K\" or \"1G512M\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Bytesize, E> {
                Ok(Bytesize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Bytesize, E> {
                u64::try_from(v).map(Bytesize).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Bytesize, E> {
                Ok(Bytesize(to_bytesize(v)))
            }
        }

        deserializer.deserialize_any(BytesizeVisitor)
    }
}

/// Parses "2G512K", "64MB" or a plain number of bytes. Unknown parts count as zero.
#[inline]
pub fn to_bytesize(text: &str) -> u64 {
    let text = text.trim().to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    if let Ok(v) = text.parse::<u64>() {
        return v;
    }
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'B' => v,
                'K' => v * BYTESIZE_K,
                'M' => v * BYTESIZE_M,
                'G' => v * BYTESIZE_G,
                _ => 0,
            }
        })
        .sum()
}

/// Parses "100ms", "30s", "5m", "1h30m", "7d" or "2w" into a [`Duration`].
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60_000,
                'h' => v * 3_600_000,
                'd' => v * 86_400_000,
                'w' => v * 604_800_000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytesize_parse_and_format() {
        assert_eq!(to_bytesize("64M"), 64 * 1024 * 1024);
        assert_eq!(to_bytesize("2g512k"), 2 * BYTESIZE_G + 512 * BYTESIZE_K);
        assert_eq!(to_bytesize("1GB"), BYTESIZE_G);
        assert_eq!(to_bytesize("4096"), 4096);
        assert_eq!(Bytesize(3 * BYTESIZE_M + 1).string(), "3M1B");
        assert_eq!(Bytesize(0).string(), "0B");
    }

    #[test]
    fn bytesize_deserialize_number_or_string() {
        let v: Bytesize = serde_json::from_str("\"1M\"").unwrap();
        assert_eq!(v.as_u64(), BYTESIZE_M);
        let v: Bytesize = serde_json::from_str("2048").unwrap();
        assert_eq!(v.as_u64(), 2048);
    }

    #[test]
    fn durations() {
        assert_eq!(to_duration("250ms"), Duration::from_millis(250));
        assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
        assert_eq!(to_duration("2d").as_secs(), 172_800);
        assert_eq!(to_duration("bogus"), Duration::ZERO);
    }

    #[test]
    fn timestamps() {
        let now = timestamp_millis();
        assert!(now > 0);
        assert!(!format_timestamp_millis(now).is_empty());
        assert!(format_timestamp_millis(0).is_empty());
    }
}
