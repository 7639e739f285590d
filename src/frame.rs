//! Wire messages. A `Frame` is what crosses the transport; the
//! transport is responsible for whatever bytes-on-the-wire encoding it
//! wants (the engine never touches raw bytes, only `Frame` values).

use crate::error::RemoteErrorClass;
use crate::oid::Oid;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// One RPC protocol message. The `control` field is modeled as the enum
/// tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "kebab-case")]
pub enum Frame {
    /// Announces a newly reachable stub to the peer.
    NewObject { obj: Oid, methods: Vec<String> },
    /// A method/getter/setter invocation.
    Call {
        id: u64,
        obj: Oid,
        method: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    /// The response to a `Call` with the same `id`.
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Releases a stub or proxy naming `id`.
    Free { id: Oid },
}

impl Frame {
    pub(crate) fn reply_ok(id: u64, value: Value) -> Self {
        Frame::Reply {
            id,
            reply: Some(value),
            error: None,
            message: None,
            stack: None,
            code: None,
        }
    }

    pub(crate) fn reply_err(id: u64, err: &crate::error::RemoteError) -> Self {
        Frame::Reply {
            id,
            reply: None,
            error: Some(
                err.class
                    .unwrap_or(RemoteErrorClass::Generic)
                    .wire_name()
                    .to_string(),
            ),
            message: err.message.clone(),
            stack: err.stack.clone(),
            code: err.code.clone(),
        }
    }
}
