//! The host-language mechanism for defining callable objects is left to the
//! application — but the engine still needs a trait to invoke against.
//! [`RpcTarget`] is that seam.

use crate::error::Result;
use crate::value::RpcValue;
use async_trait::async_trait;
use std::fmt;

/// One entry of a stub's method snapshot: either a plain callable method,
/// or a `get NAME` entry that authorises both read and write of a named
/// property as a pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodSpec {
    Method(String),
    Get(String),
}

impl MethodSpec {
    /// Parse a raw wire method-list entry (`"frobnicate"` or `"get value"`).
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("get ") {
            Some(name) => Self::Get(name.to_string()),
            None => Self::Method(raw.to_string()),
        }
    }

    /// The bare property/method name, without the `get ` prefix.
    pub fn name(&self) -> &str {
        match self {
            Self::Method(name) | Self::Get(name) => name,
        }
    }

    pub fn is_getter(&self) -> bool {
        matches!(self, Self::Get(_))
    }
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method(name) => f.write_str(name),
            Self::Get(name) => write!(f, "get {name}"),
        }
    }
}

impl std::str::FromStr for MethodSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

pub(crate) fn parse_methods(raw: &[String]) -> Vec<MethodSpec> {
    raw.iter().map(|s| MethodSpec::parse(s)).collect()
}

pub(crate) fn render_methods(methods: &[MethodSpec]) -> Vec<String> {
    methods.iter().map(ToString::to_string).collect()
}

/// An application object that can be exported as a stub.
///
/// The engine doesn't design a callable-object system of its own — it only
/// needs to invoke *something* — so this trait is the seam. Implementations
/// snapshot their own method list; the registry captures it once, at
/// `add_stub` time.
///
/// Dyn-safe by construction (`async_trait`) so that `Rc<dyn RpcTarget>` can
/// be stored in the stub registry and its identity map.
#[async_trait(?Send)]
pub trait RpcTarget {
    /// The method list snapshot, in the `"name"` / `"get name"` wire form.
    fn methods(&self) -> Vec<String>;

    /// Invoke a plain method by name, passing arguments through verbatim.
    async fn call(&self, method: &str, args: Vec<RpcValue>) -> Result<RpcValue>;

    /// Read the named property. Called only for entries snapshot as
    /// `get NAME`; the registry has already validated zero arguments.
    async fn get(&self, name: &str) -> Result<RpcValue>;

    /// Write the named property. Called only for entries snapshot as
    /// `get NAME`; the registry has already validated exactly one argument.
    async fn set(&self, name: &str, value: RpcValue) -> Result<()>;
}

static_assertions::assert_obj_safe!(RpcTarget);
