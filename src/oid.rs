//! Object identifiers.
//!
//! An [`Oid`] is opaque to callers and unique within the lifetime of one
//! endpoint.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque object identifier, unique within the endpoint that minted it.
///
/// Construction follows `<host>-<pid>:<socket_seq>:<counter>`, where
/// `counter` is a per-endpoint monotonically increasing integer. Oids are
/// never reused within an endpoint, even after the stub or proxy they named
/// has been freed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(String);

impl Oid {
    /// Wrap an already-formed identifier, e.g. one just read off the wire.
    pub fn from_wire(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Oid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn host_pid_prefix() -> &'static str {
    static PREFIX: OnceCell<String> = OnceCell::new();
    PREFIX.get_or_init(|| {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!("{host}-{}", std::process::id())
    })
}

/// Allocates oids for a single endpoint's sockets. Each [`crate::Socket`]
/// owns one allocator, stamped with a `socket_seq` so that oids minted by
/// distinct sockets within the same process never collide.
#[derive(Debug)]
pub(crate) struct OidAllocator {
    socket_seq: u64,
    counter: AtomicU64,
}

static NEXT_SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

impl OidAllocator {
    pub(crate) fn new() -> Self {
        Self {
            socket_seq: NEXT_SOCKET_SEQ.fetch_add(1, Ordering::Relaxed),
            counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn next(&self) -> Oid {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        Oid(format!(
            "{}:{}:{}",
            host_pid_prefix(),
            self.socket_seq,
            counter
        ))
    }
}
