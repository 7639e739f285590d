//! Application-facing values and their wire form.
//!
//! [`RpcValue`] is what callers build arguments from and what stubbed
//! methods return: it can carry capabilities (owned targets or proxies)
//! alongside plain data. [`Value`] is the wire form produced by the
//! marshaller — plain JSON-shaped data plus `{"oid": "..."}`
//! markers, never a raw capability.

use crate::oid::Oid;
use crate::target::RpcTarget;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Wire-shaped value: primitives, arrays, records, and oid markers. The
/// transport is expected to preserve this structural shape (spec invariant
/// 4); we use `serde_json::Value` as a convenient, already-structural
/// carrier for it.
pub type Value = serde_json::Value;

/// The key used for an oid marker object on the wire, e.g. `{"oid": "..."}`.
pub const OID_KEY: &str = "oid";

/// Returns the oid if `value` is an object of exactly the shape `{"oid": ..}`.
pub(crate) fn as_oid_marker(value: &Value) -> Option<Oid> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let raw = obj.get(OID_KEY)?.as_str()?;
    Some(Oid::from_wire(raw))
}

pub(crate) fn oid_marker(oid: &Oid) -> Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(OID_KEY.to_string(), Value::String(oid.as_str().to_string()));
    Value::Object(map)
}

/// A capability-carrying value, used on both sides of the marshaller.
///
/// This is the type application code actually builds and receives: a
/// stubbed method takes `Vec<RpcValue>` arguments and returns an
/// `RpcValue`, which may itself embed freshly-created targets (to be
/// auto-stubbed) or proxies handed back by the caller.
#[derive(Clone)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<RpcValue>),
    Object(BTreeMap<String, RpcValue>),
    /// An application object to be exported as a stub (auto-registered on
    /// first marshal if not already a stub).
    Stub(Rc<dyn RpcTarget>),
    /// A handle to an object the *peer* owns, being handed back to it (or
    /// passed through unchanged if the peer is a third endpoint's proxy —
    /// rejected by the marshaller).
    Proxy(crate::proxy::ProxyRef),
}

impl RpcValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl std::fmt::Debug for RpcValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Array(a) => f.debug_list().entries(a).finish(),
            Self::Object(o) => f.debug_map().entries(o.iter()).finish(),
            Self::Stub(_) => write!(f, "Stub(..)"),
            Self::Proxy(p) => write!(f, "Proxy({})", p.oid()),
        }
    }
}

impl From<()> for RpcValue {
    fn from(_: ()) -> Self {
        RpcValue::Null
    }
}

impl From<bool> for RpcValue {
    fn from(b: bool) -> Self {
        RpcValue::Bool(b)
    }
}

impl From<String> for RpcValue {
    fn from(s: String) -> Self {
        RpcValue::String(s)
    }
}

impl From<&str> for RpcValue {
    fn from(s: &str) -> Self {
        RpcValue::String(s.to_string())
    }
}

impl From<f64> for RpcValue {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(RpcValue::Number)
            .unwrap_or(RpcValue::Null)
    }
}

impl From<i64> for RpcValue {
    fn from(n: i64) -> Self {
        RpcValue::Number(n.into())
    }
}

impl<T: Into<RpcValue>> From<Vec<T>> for RpcValue {
    fn from(v: Vec<T>) -> Self {
        RpcValue::Array(v.into_iter().map(Into::into).collect())
    }
}
