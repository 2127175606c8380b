// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Correlation identifiers for request/reply matching.
//!
//! Each in-flight call is keyed by a [`CorrelationId`] that travels in the
//! message's `correlation-id` property and is echoed back by the responder.
//! Identifiers combine a per-client session salt with a monotonic sequence
//! number, so two clients sharing one reply queue never collide.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one in-flight request.
///
/// Rendered on the wire as `"{salt:016x}.{seq}"`. The salt is fixed for the
/// lifetime of a client, the sequence number increments per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId {
    /// Session salt shared by all ids from one generator.
    pub salt: u64,
    /// Sequence number assigned at call time, starting at 1.
    pub seq: u64,
}

impl CorrelationId {
    /// Create an identifier from its parts.
    pub fn new(salt: u64, seq: u64) -> Self {
        Self { salt, seq }
    }

    /// Parse the wire form produced by [`Display`](fmt::Display).
    ///
    /// Returns `None` for anything that is not `<16 hex digits>.<decimal>`;
    /// such ids were not issued by this crate and can never match a pending
    /// call.
    pub fn parse(s: &str) -> Option<Self> {
        let (salt_part, seq_part) = s.split_once('.')?;
        if salt_part.len() != 16 {
            return None;
        }
        let salt = u64::from_str_radix(salt_part, 16).ok()?;
        let seq = seq_part.parse::<u64>().ok()?;
        Some(Self { salt, seq })
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{}", self.salt, self.seq)
    }
}

/// Issues correlation ids for one client session.
///
/// The salt is derived once from the wall clock and the creating thread, the
/// same way transport endpoints derive their session GUIDs. No RNG involved,
/// so the crate stays free of a `rand` dependency.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    salt: u64,
    next_seq: AtomicU64,
}

impl CorrelationIdGenerator {
    /// Create a generator with a fresh session salt.
    pub fn new() -> Self {
        Self {
            salt: generate_session_salt(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Issue the next identifier.
    pub fn next_id(&self) -> CorrelationId {
        CorrelationId {
            salt: self.salt,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Session salt of this generator.
    pub fn salt(&self) -> u64 {
        self.salt
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a session salt from timestamp + thread id hash.
fn generate_session_salt() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    // Hash the thread id for additional uniqueness
    let tid_hash = {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    };

    (now.as_nanos() as u64) ^ tid_hash.rotate_left(32)
}
