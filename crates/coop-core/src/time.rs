//! Time primitives for coop nodes
//!
//! Coop uses a two-part logical clock per source:
//! - HttpTime: wall-clock seconds, carried on the wire as an HTTP-date
//! - clock: a counter disambiguating assertions made within the same second
//!
//! `(time, clock)` pairs are totally ordered per source; the merged index
//! relies on that order to resolve conflicting assertions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CoopError, CoopResult};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Wall-clock time at HTTP-date (one second) resolution
/// Represented as seconds since the Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HttpTime(i64);

impl HttpTime {
    pub const UNIX_EPOCH: HttpTime = HttpTime(0);

    pub fn now() -> Self {
        HttpTime(Utc::now().timestamp())
    }

    #[inline]
    pub fn from_unix_secs(secs: i64) -> Self {
        HttpTime(secs)
    }

    #[inline]
    pub fn as_unix_secs(self) -> i64 {
        self.0
    }

    /// Parse an HTTP-date (`Sun, 06 Nov 1994 08:49:37 GMT`).
    pub fn parse(value: &str) -> CoopResult<Self> {
        DateTime::parse_from_rfc2822(value.trim())
            .map(|t| HttpTime(t.timestamp()))
            .map_err(|e| CoopError::InvalidArgument(format!("invalid HTTP-date {value:?}: {e}")))
    }

    pub fn to_http_date(self) -> String {
        match DateTime::<Utc>::from_timestamp(self.0, 0) {
            Some(t) => t.format(HTTP_DATE_FORMAT).to_string(),
            None => DateTime::<Utc>::default().format(HTTP_DATE_FORMAT).to_string(),
        }
    }
}

impl fmt::Debug for HttpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HttpTime({})", self.0)
    }
}

impl fmt::Display for HttpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_http_date())
    }
}

impl Serialize for HttpTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_http_date())
    }
}

impl<'de> Deserialize<'de> for HttpTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        HttpTime::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Logical stamp - total order of assertions from one source
///
/// Ordered by `time` first, then `clock`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogicalStamp {
    pub time: HttpTime,
    pub clock: u64,
}

impl LogicalStamp {
    #[inline]
    pub fn new(time: HttpTime, clock: u64) -> Self {
        LogicalStamp { time, clock }
    }

    /// True if an assertion stamped `self` replaces one stamped `other`.
    #[inline]
    pub fn supersedes(&self, other: &LogicalStamp) -> bool {
        self > other
    }
}

/// Per-source logical clock
///
/// INVARIANT: successive ticks are strictly increasing, even if the wall
/// clock stalls or steps backwards.
#[derive(Clone, Debug, Default)]
pub struct LogicalClock {
    last: LogicalStamp,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last issued stamp
    pub fn current(&self) -> LogicalStamp {
        self.last
    }

    /// Issue the next stamp using the wall clock
    pub fn tick(&mut self) -> LogicalStamp {
        self.tick_at(HttpTime::now())
    }

    /// Issue the next stamp as of `now`
    pub fn tick_at(&mut self, now: HttpTime) -> LogicalStamp {
        if now > self.last.time {
            self.last = LogicalStamp::new(now, 0);
        } else {
            self.last.clock += 1;
        }
        self.last
    }
}
