//! Proxy Registry.
//!
//! A [`Proxy`] is the caller-visible handle for an object the *peer* owns.
//! It carries just enough to dispatch calls back through its owning
//! [`crate::Socket`]: the oid, a method-list snapshot taken from the
//! `new-object` announcement that created it, and a cheap `Rc` back-reference
//! to the endpoint. [`ProxyRef`] is the type-erased sibling stored inside
//! [`crate::value::RpcValue`] so the marshaller doesn't need to know the
//! transport type `T`.

use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::socket::Socket;
use crate::target::MethodSpec;
use crate::transport::Transport;
use crate::value::RpcValue;
use std::collections::HashMap;
use std::rc::Rc;

/// A type-erased handle to a proxy, identifying which endpoint minted it.
///
/// `endpoint` is an opaque identity token (every [`crate::socket::State`]
/// owns exactly one, cloned into every proxy and value it hands out) used
/// by the marshaller to tell "a proxy of this endpoint's own peer" apart
/// from "a proxy belonging to some unrelated endpoint" (an invalid-object
/// error), without requiring `RpcValue` itself to be generic over a
/// transport type.
#[derive(Clone)]
pub struct ProxyRef {
    pub(crate) oid: Oid,
    pub(crate) endpoint: Rc<()>,
}

impl ProxyRef {
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    pub(crate) fn belongs_to(&self, endpoint: &Rc<()>) -> bool {
        Rc::ptr_eq(&self.endpoint, endpoint)
    }
}

/// A live entry in the proxy registry: everything needed to reconstruct a
/// [`Proxy`] for an oid without re-parsing its method list each time.
#[derive(Clone)]
pub(crate) struct ProxyEntry {
    pub(crate) methods: Rc<[MethodSpec]>,
}

/// Proxies-by-oid.
#[derive(Default)]
pub(crate) struct ProxyRegistry {
    by_oid: HashMap<Oid, ProxyEntry>,
}

impl ProxyRegistry {
    /// Registers a proxy for `oid` if one doesn't already exist, per spec
    /// §8 testable property 5 ("a proxy's identity is stable across
    /// repeated arrivals of the same oid"). Returns whether this call
    /// actually inserted a new entry.
    pub(crate) fn ensure(&mut self, oid: &Oid, methods: Vec<MethodSpec>) -> bool {
        if self.by_oid.contains_key(oid) {
            return false;
        }
        self.by_oid.insert(
            oid.clone(),
            ProxyEntry {
                methods: methods.into(),
            },
        );
        true
    }

    pub(crate) fn contains(&self, oid: &Oid) -> bool {
        self.by_oid.contains_key(oid)
    }

    pub(crate) fn get(&self, oid: &Oid) -> Option<ProxyEntry> {
        self.by_oid.get(oid).cloned()
    }

    pub(crate) fn remove(&mut self, oid: &Oid) -> bool {
        self.by_oid.remove(oid).is_some()
    }
}

/// A remote reference: the caller-visible handle for an object the peer
/// owns.
///
/// Cheap to clone (an `Rc` to the shared endpoint state plus an owned
/// `Oid`). Every declared method becomes a call site returning a future;
/// every declared `get NAME` becomes [`Proxy::get`]. No implicit setter is
/// generated from `get NAME` — callers that want the (optional, asymmetric)
/// write path call [`Proxy::set`] directly.
#[derive(Clone)]
pub struct Proxy<T: Transport> {
    oid: Oid,
    socket: Socket<T>,
    methods: Rc<[MethodSpec]>,
}

impl<T: Transport> Proxy<T> {
    pub(crate) fn new(oid: Oid, socket: Socket<T>, methods: Rc<[MethodSpec]>) -> Self {
        Self {
            oid,
            socket,
            methods,
        }
    }

    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// The method-list snapshot from the `new-object` announcement that
    /// created this proxy.
    pub fn methods(&self) -> &[MethodSpec] {
        &self.methods
    }

    fn ensure_declared(&self, name: &str, getter: bool) -> Result<()> {
        let found = self.methods.iter().any(|m| match m {
            MethodSpec::Get(n) => getter && n == name,
            MethodSpec::Method(n) => !getter && n == name,
        });
        if found {
            Ok(())
        } else {
            let wire = if getter {
                format!("get {name}")
            } else {
                name.to_string()
            };
            Err(Error::InvalidMethod(wire))
        }
    }

    /// Invokes a plain declared method, returning the reply promise.
    pub async fn call(&self, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        self.ensure_declared(method, false)?;
        self.socket.dispatch_call(&self.oid, method, args).await
    }

    /// Reads a declared `get NAME` property.
    pub async fn get(&self, name: &str) -> Result<RpcValue> {
        self.ensure_declared(name, true)?;
        self.socket
            .dispatch_call(&self.oid, &format!("get {name}"), Vec::new())
            .await
    }

    /// Writes a declared `get NAME` property. Optional; exposed explicitly
    /// rather than synthesized as a property setter.
    pub async fn set(&self, name: &str, value: RpcValue) -> Result<()> {
        self.ensure_declared(name, true)?;
        self.socket
            .dispatch_call(&self.oid, &format!("set {name}"), vec![value])
            .await?;
        Ok(())
    }

    /// Releases this proxy: removes it from the local registry and, unless
    /// the endpoint is already closed, sends a `free` frame to the peer.
    pub fn free(&self) -> Result<()> {
        self.socket.free_proxy(&self.oid)
    }

    /// A type-erased reference suitable for embedding in an [`RpcValue`]
    /// sent back over the wire (e.g. handing a proxy back to its owner).
    pub fn as_ref_value(&self) -> ProxyRef {
        ProxyRef {
            oid: self.oid.clone(),
            endpoint: self.socket.endpoint_id(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Proxy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").field("oid", &self.oid).finish()
    }
}

impl<T: Transport> From<Proxy<T>> for RpcValue {
    fn from(proxy: Proxy<T>) -> Self {
        RpcValue::Proxy(proxy.as_ref_value())
    }
}
