//! Stub Registry.
//!
//! Owns locally exported objects by oid, and mediates lookup both by oid
//! (for dispatching an inbound call) and by object identity (for
//! [`StubRegistry::add`]'s idempotence rule). The identity map is
//! deliberately weak: a stub's bookkeeping must never keep the application
//! object alive by itself, and an already-freed stub's back-pointer must
//! not either.

use crate::error::{Error, Result};
use crate::oid::{Oid, OidAllocator};
use crate::target::{parse_methods, MethodSpec, RpcTarget};
use crate::value::RpcValue;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A live stub: the target object plus the method-list snapshot taken at
/// `add_stub` time.
#[derive(Clone)]
pub(crate) struct StubEntry {
    pub(crate) target: Rc<dyn RpcTarget>,
    pub(crate) methods: Vec<MethodSpec>,
}

impl StubEntry {
    fn has_getter(&self, name: &str) -> bool {
        self.methods
            .iter()
            .any(|m| matches!(m, MethodSpec::Get(n) if n == name))
    }

    fn has_method(&self, name: &str) -> bool {
        self.methods
            .iter()
            .any(|m| matches!(m, MethodSpec::Method(n) if n == name))
    }

    /// Dispatches one wire-form method name: `get NAME` / `set NAME`
    /// prefixes address a declared getter, everything else is a plain
    /// method.
    pub(crate) async fn invoke(&self, wire_method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        if let Some(name) = wire_method.strip_prefix("get ") {
            if !args.is_empty() {
                return Err(Error::WrongArity {
                    expected: 0,
                    got: args.len(),
                });
            }
            if !self.has_getter(name) {
                return Err(Error::InvalidMethod(wire_method.to_string()));
            }
            return self.target.get(name).await;
        }
        if let Some(name) = wire_method.strip_prefix("set ") {
            if args.len() != 1 {
                return Err(Error::WrongArity {
                    expected: 1,
                    got: args.len(),
                });
            }
            if !self.has_getter(name) {
                return Err(Error::InvalidMethod(wire_method.to_string()));
            }
            let value = args.into_iter().next().expect("checked len == 1 above");
            self.target.set(name, value).await?;
            return Ok(RpcValue::Null);
        }
        if !self.has_method(wire_method) {
            return Err(Error::InvalidMethod(wire_method.to_string()));
        }
        self.target.call(wire_method, args).await
    }
}

/// Raw identity of an `Rc<dyn RpcTarget>` allocation, used as a key for the
/// weak object→stub map. Two `Rc`s pointing at the same allocation compare
/// equal here even though `dyn RpcTarget` has no `PartialEq` of its own.
fn identity_key(target: &Rc<dyn RpcTarget>) -> usize {
    Rc::as_ptr(target) as *const () as usize
}

/// Outcome of [`StubRegistry::add`], distinguishing the three cases spec
/// §4.1 calls out: already live (no announcement needed), freed-then-
/// re-registered (re-announce), or genuinely new (announce).
pub(crate) enum AddOutcome {
    AlreadyLive(Oid),
    Reannounced(Oid),
    Fresh(Oid),
}

impl AddOutcome {
    pub(crate) fn oid(&self) -> &Oid {
        match self {
            Self::AlreadyLive(oid) | Self::Reannounced(oid) | Self::Fresh(oid) => oid,
        }
    }

    pub(crate) fn needs_announcement(&self) -> bool {
        !matches!(self, Self::AlreadyLive(_))
    }
}

/// Stubs-by-oid, plus the weak object→stub identity map.
#[derive(Default)]
pub(crate) struct StubRegistry {
    by_oid: HashMap<Oid, StubEntry>,
    by_identity: HashMap<usize, (Weak<dyn RpcTarget>, Oid)>,
}

impl StubRegistry {
    /// `addStub`. Idempotent while the target's oid is live;
    /// re-announces if the target was previously freed; otherwise allocates
    /// a fresh oid and snapshots the method list.
    pub(crate) fn add(&mut self, target: Rc<dyn RpcTarget>, alloc: &OidAllocator) -> AddOutcome {
        let key = identity_key(&target);
        if let Some((weak, oid)) = self.by_identity.get(&key) {
            if weak.strong_count() > 0 {
                let oid = oid.clone();
                if self.by_oid.contains_key(&oid) {
                    return AddOutcome::AlreadyLive(oid);
                }
                // Known object, but its oid was freed: re-install and
                // re-announce.
                let methods = parse_methods(&target.methods());
                self.by_oid.insert(oid.clone(), StubEntry { target, methods });
                return AddOutcome::Reannounced(oid);
            }
        }
        let methods = parse_methods(&target.methods());
        let oid = alloc.next();
        self.by_identity
            .insert(key, (Rc::downgrade(&target), oid.clone()));
        self.by_oid.insert(oid.clone(), StubEntry { target, methods });
        AddOutcome::Fresh(oid)
    }

    pub(crate) fn lookup(&self, oid: &Oid) -> Option<&StubEntry> {
        self.by_oid.get(oid)
    }

    pub(crate) fn contains(&self, oid: &Oid) -> bool {
        self.by_oid.contains_key(oid)
    }

    /// `handleFree` for the stub half: silently removes the oid if present.
    /// The identity map entry is left in place (it's how a later re-`add`
    /// of the same object finds its stale oid and re-announces); dead weak
    /// entries are pruned lazily the next time that same key is touched.
    pub(crate) fn remove(&mut self, oid: &Oid) -> bool {
        self.by_oid.remove(oid).is_some()
    }
}
