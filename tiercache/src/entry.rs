//! Cache entries and the value envelope they carry

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::compression::{CompressionAlgorithm, Compressor};
use crate::error::CodecError;

/// Entry priority. Informational; the memory strategies do not enforce it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Ordinal stored by persistent tiers (1..=4)
    pub fn level(self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Longest TTL kept as a deadline. Anything longer is stored without expiry.
pub const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Label for the stored type. `type_name` output varies between compiler
/// versions, so it names the type for diagnostics and never gates a decode.
/// Borrowed and owned strings share one label.
fn type_tag<V: ?Sized>() -> String {
    match std::any::type_name::<V>().trim_start_matches('&') {
        "str" => std::any::type_name::<String>().to_string(),
        other => other.to_string(),
    }
}

/// Encoded value: type tag, compression marker and MessagePack payload.
///
/// Tiers only ever see bytes; typing happens at the orchestrator boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheValue {
    pub type_tag: String,
    pub compression: CompressionAlgorithm,
    pub payload: Vec<u8>,
}

impl CacheValue {
    /// Encode `value`, returning the envelope and the uncompressed payload size
    pub fn encode<V: Serialize + ?Sized>(
        value: &V,
        compressor: &Compressor,
    ) -> Result<(Self, usize), CodecError> {
        let raw = rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        let size = raw.len();
        let (payload, compression) = compressor
            .compress(raw)
            .map_err(|e| CodecError::Compression(e.to_string()))?;

        Ok((
            Self {
                type_tag: type_tag::<V>(),
                compression,
                payload,
            },
            size,
        ))
    }

    /// Decode into `V`; fails when the payload does not fit `V`
    pub fn decode<V: DeserializeOwned>(&self) -> Result<V, CodecError> {
        let raw = Compressor::decompress(&self.payload, self.compression)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        rmp_serde::from_slice(&raw).map_err(|e| {
            let expected = type_tag::<V>();
            if self.type_tag == expected {
                CodecError::Decode(e.to_string())
            } else {
                CodecError::TypeMismatch {
                    expected,
                    found: self.type_tag.clone(),
                }
            }
        })
    }

    /// Serialize the whole envelope for blob storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Atomic unit of cached state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: CacheValue,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    /// Seconds after `created_at`; `None` never expires
    pub ttl: Option<u64>,
    pub priority: Priority,
    /// Serialized value size in bytes, fixed at creation
    pub size: usize,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CacheEntry {
    /// Create a fresh entry (`access_count = 1`)
    pub fn new(key: impl Into<String>, value: CacheValue, size: usize, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            ttl: None,
            priority: Priority::default(),
            size,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<u64>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// `created_at + ttl`; `None` without TTL or when the deadline is not representable
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl?).ok()?;
        self.created_at.checked_add_signed(TimeDelta::try_seconds(ttl)?)
    }

    /// True iff a TTL is set and more than `ttl` seconds passed since creation
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| now > deadline)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn update_access_at(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.access_count += 1;
    }

    pub fn update_access(&mut self) {
        self.update_access_at(Utc::now());
    }

    /// Whole seconds of lifetime left, rounded up; `None` when the entry never expires
    pub fn remaining_ttl_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        self.expires_at().map(|deadline| {
            let left = (deadline - now).num_milliseconds();
            if left <= 0 { 0 } else { (left as u64).div_ceil(1000) }
        })
    }

    pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
        !self.tags.is_disjoint(tags)
    }
}
