use crate::{error::Error, time::Timestamp, Result, SessionId};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default lease duration (30 seconds).
pub const DEFAULT_LEASE_DURATION: std::time::Duration = std::time::Duration::from_secs(30);

/// Normalized path naming one lockable resource.
///
/// Maps 1:1 to a file or object. Construction normalizes the raw path so that
/// spellings like `"/data//x/"` and `"/data/x"` name the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Invalid("empty resource path".to_string()));
        }
        if raw.contains('\0') {
            return Err(Error::Invalid(format!(
                "resource path contains NUL: {raw:?}"
            )));
        }

        // Collapse duplicate separators and strip any trailing one.
        let mut normalized = String::with_capacity(raw.len());
        let mut prev_slash = false;
        for c in raw.chars() {
            if c == '/' {
                if !prev_slash {
                    normalized.push(c);
                }
                prev_slash = true;
            } else {
                normalized.push(c);
                prev_slash = false;
            }
        }
        if normalized.len() > 1 && normalized.ends_with('/') {
            normalized.pop();
        }
        if normalized.is_empty() {
            return Err(Error::Invalid(format!("unusable resource path: {raw:?}")));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl LockMode {
    /// Two holders may be active at once only if both are shared.
    pub fn is_compatible(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// Monotonically increasing grant counter, unique per resource across its
/// entire history. A storage backend rejects writes carrying a token lower
/// than the highest it has accepted for that resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FencingToken(pub u64);

impl FencingToken {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_valid_after(self, other: FencingToken) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A time-bounded grant of a lock on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource: ResourceId,
    pub holder: SessionId,
    pub mode: LockMode,
    pub token: FencingToken,
    pub expires_at: Timestamp,
}

impl Lease {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn time_remaining(&self, now: Timestamp) -> Duration {
        if now < self.expires_at {
            self.expires_at.signed_duration_since(now)
        } else {
            Duration::zero()
        }
    }
}
