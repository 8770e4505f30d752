//! Submission-ordered job identifiers.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::InvalidJobId;

/// Bits reserved for the per-millisecond sequence in the packed form.
const SEQUENCE_BITS: u32 = 16;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Rendered widths. 13 digits of milliseconds lasts until the year 2286.
const TIMESTAMP_WIDTH: usize = 13;
const SEQUENCE_WIDTH: usize = 5;

/// Allocator state before the first id is handed out.
const UNSET: u64 = u64::MAX;

/// Identifier of a job record.
///
/// Ordered by `(timestamp_ms, sequence)`. The string form zero-pads both
/// parts to a fixed width, so comparing rendered ids as strings gives the
/// same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    timestamp_ms: u64,
    sequence: u16,
}

impl JobId {
    pub const fn new(timestamp_ms: u64, sequence: u16) -> Self {
        Self {
            timestamp_ms,
            sequence,
        }
    }

    /// Milliseconds since the Unix epoch at allocation time.
    pub const fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Position among ids allocated within the same millisecond.
    pub const fn sequence(&self) -> u16 {
        self.sequence
    }

    fn pack(self) -> u64 {
        (self.timestamp_ms << SEQUENCE_BITS) | u64::from(self.sequence)
    }

    fn unpack(packed: u64) -> Self {
        Self {
            timestamp_ms: packed >> SEQUENCE_BITS,
            sequence: (packed & SEQUENCE_MASK) as u16,
        }
    }

    /// The id that must follow `self` when the clock reads `now_ms`.
    fn successor(self, now_ms: u64) -> Self {
        if now_ms > self.timestamp_ms {
            Self::new(now_ms, 0)
        } else if self.sequence < u16::MAX {
            // Same millisecond, or the clock stepped backwards.
            Self::new(self.timestamp_ms, self.sequence + 1)
        } else {
            Self::new(self.timestamp_ms + 1, 0)
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:0tw$}{:0sw$}",
            self.timestamp_ms,
            self.sequence,
            tw = TIMESTAMP_WIDTH,
            sw = SEQUENCE_WIDTH
        )
    }
}

impl FromStr for JobId {
    type Err = InvalidJobId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidJobId(s.to_string());

        if s.len() != TIMESTAMP_WIDTH + SEQUENCE_WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let (timestamp, sequence) = s.split_at(TIMESTAMP_WIDTH);
        let timestamp_ms = timestamp.parse::<u64>().map_err(|_| invalid())?;
        let sequence = sequence.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(timestamp_ms, sequence))
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hands out strictly increasing [`JobId`]s.
///
/// The last issued id lives in a single atomic word, so concurrent callers
/// never observe the same `(timestamp, sequence)` pair.
#[derive(Debug)]
pub struct JobIdAllocator {
    last: AtomicU64,
}

impl Default for JobIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(UNSET),
        }
    }

    /// Allocate an id stamped with the current wall-clock time.
    pub fn next(&self) -> JobId {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        self.next_at(now_ms)
    }

    /// Allocate an id as if the clock read `now_ms`.
    pub fn next_at(&self, now_ms: u64) -> JobId {
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let candidate = if current == UNSET {
                JobId::new(now_ms, 0)
            } else {
                JobId::unpack(current).successor(now_ms)
            };

            match self.last.compare_exchange_weak(
                current,
                candidate.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}
