//! A bidirectional, promise-oriented RPC engine: two peers expose in-process
//! objects to each other as [`Proxy`] handles that translate method calls
//! and property access into request/reply exchanges over any
//! [`Transport`].
//!
//! The crate is the *engine* only: object-identity bookkeeping, the
//! marshal/unmarshal rules that rewrite object graphs crossing the wire, the
//! request/reply state machine and its re-entrancy discipline, and the
//! distributed reference-release protocol. It does not supply a transport
//! (bring your own ordered, message-boundary-preserving duplex) or a way to
//! author callable objects beyond implementing [`RpcTarget`].
//!
//! ```ignore
//! let socket = Socket::new(my_transport);
//! let oid = socket.add_stub(Rc::new(MyObject) as Rc<dyn RpcTarget>)?;
//! // oid is handed to the peer out of band.
//! socket.serve().await?;
//! ```

mod error;
mod frame;
mod marshal;
mod oid;
mod proxy;
mod router;
mod socket;
mod stub;
mod target;
mod transport;
mod value;

pub use error::{Error, RemoteError, RemoteErrorClass, Result};
pub use frame::Frame;
pub use oid::Oid;
pub use proxy::{Proxy, ProxyRef};
pub use socket::Socket;
pub use target::{MethodSpec, RpcTarget};
pub use transport::Transport;
pub use value::{RpcValue, Value};
