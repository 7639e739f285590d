//! The Marshaller: a pure structural rewrite between the application-facing
//! [`RpcValue`] tree and the wire-shaped [`Value`].
//!
//! Both directions are free functions over [`crate::socket::State`] rather
//! than methods on it, so the call sites in `socket.rs` stay in full
//! control of *when* newly-discovered stubs get announced (the re-entrancy
//! buffering is the dispatcher's concern, not the marshaller's — marshalling
//! only ever appends to the `announcements` out-parameter).

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::oid::OidAllocator;
use crate::proxy::ProxyRef;
use crate::socket::State;
use crate::target::render_methods;
use crate::value::{as_oid_marker, oid_marker, RpcValue, Value};
use std::collections::BTreeMap;

/// Rewrites an [`RpcValue`] into its wire [`Value`] form (outbound
/// direction). Any target discovered without an oid is
/// auto-registered via the stub registry; its `new-object` announcement is
/// appended to `announcements` in discovery order, *not* written to the
/// transport here — the caller decides when those precede the frame this
/// value is part of.
pub(crate) fn marshal(
    state: &mut State,
    alloc: &OidAllocator,
    value: &RpcValue,
    announcements: &mut Vec<Frame>,
) -> Result<Value> {
    match value {
        RpcValue::Null => Ok(Value::Null),
        RpcValue::Bool(b) => Ok(Value::Bool(*b)),
        RpcValue::Number(n) => Ok(Value::Number(n.clone())),
        RpcValue::String(s) => Ok(Value::String(s.clone())),
        RpcValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(marshal(state, alloc, item, announcements)?);
            }
            Ok(Value::Array(out))
        }
        RpcValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key.clone(), marshal(state, alloc, val, announcements)?);
            }
            Ok(Value::Object(out))
        }
        RpcValue::Stub(target) => {
            let outcome = state.stubs.add(target.clone(), alloc);
            if outcome.needs_announcement() {
                let methods = state
                    .stubs
                    .lookup(outcome.oid())
                    .expect("just inserted")
                    .methods
                    .clone();
                announcements.push(Frame::NewObject {
                    obj: outcome.oid().clone(),
                    methods: render_methods(&methods),
                });
            }
            Ok(oid_marker(outcome.oid()))
        }
        RpcValue::Proxy(proxy_ref) => {
            if !proxy_ref.belongs_to(&state.endpoint_id) || !state.proxies.contains(&proxy_ref.oid) {
                return Err(Error::ForeignProxy(proxy_ref.oid.clone()));
            }
            Ok(oid_marker(&proxy_ref.oid))
        }
    }
}

/// Rewrites a wire [`Value`] back into an [`RpcValue`] (inbound direction).
/// An `{oid}` marker is resolved first against the stub map
/// (recovering the owning object on its own side), then against the proxy
/// map; an oid matching neither is a type error.
pub(crate) fn unmarshal(state: &State, value: &Value) -> Result<RpcValue> {
    match value {
        Value::Null => Ok(RpcValue::Null),
        Value::Bool(b) => Ok(RpcValue::Bool(*b)),
        Value::Number(n) => Ok(RpcValue::Number(n.clone())),
        Value::String(s) => Ok(RpcValue::String(s.clone())),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(unmarshal(state, item)?);
            }
            Ok(RpcValue::Array(out))
        }
        Value::Object(map) => {
            if let Some(oid) = as_oid_marker(value) {
                if let Some(entry) = state.stubs.lookup(&oid) {
                    return Ok(RpcValue::Stub(entry.target.clone()));
                }
                if state.proxies.contains(&oid) {
                    return Ok(RpcValue::Proxy(ProxyRef {
                        oid,
                        endpoint: state.endpoint_id.clone(),
                    }));
                }
                return Err(Error::InvalidObject(oid));
            }
            let mut out = BTreeMap::new();
            for (key, val) in map {
                out.insert(key.clone(), unmarshal(state, val)?);
            }
            Ok(RpcValue::Object(out))
        }
    }
}
