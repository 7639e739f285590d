//! Lifecycle and the Call Dispatcher, folded together: `State` is the
//! endpoint's bookkeeping, and [`Socket`] is the public handle applications
//! hold.
//!
//! `State` lives behind a `RefCell`, not a `Mutex`: this is a
//! single-threaded cooperative model with no suspension point that lets
//! another task touch the same endpoint's bookkeeping, so a runtime borrow
//! check is the right tool, not a lock. The transport lives behind its own
//! `RefCell` for the same reason, and separately from `State` so that
//! [`Socket::add_stub`] can queue a `new-object` frame and opportunistically
//! flush it without needing mutable access to the registries at the same
//! time a reply is being marshalled elsewhere on the call stack.

use crate::error::{Error, RemoteError, Result};
use crate::frame::Frame;
use crate::marshal;
use crate::oid::{Oid, OidAllocator};
use crate::proxy::{Proxy, ProxyRegistry};
use crate::stub::StubRegistry;
use crate::target::{parse_methods, render_methods, RpcTarget};
use crate::transport::Transport;
use crate::value::{RpcValue, Value};
use futures_channel::oneshot;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Endpoint state: the two registries, the pending-call table, the
/// announcement buffer that doubles as the `inCall` re-entrancy flag, and
/// the outbound frame queue awaiting a transport flush.
pub(crate) struct State {
    pub(crate) stubs: StubRegistry,
    pub(crate) proxies: ProxyRegistry,
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
    /// `Some(buf)` while marshalling an outbound call's arguments. Its
    /// presence *is* the `inCall` flag; its contents are the announcements
    /// discovered so far, flushed to `outbound` only once marshalling
    /// finishes successfully.
    announce_buffer: Option<Vec<Frame>>,
    outbound: VecDeque<Frame>,
    closed: bool,
    next_call_id: u64,
    pub(crate) endpoint_id: Rc<()>,
}

impl State {
    fn new() -> Self {
        Self {
            stubs: StubRegistry::default(),
            proxies: ProxyRegistry::default(),
            pending: HashMap::new(),
            announce_buffer: None,
            outbound: VecDeque::new(),
            closed: false,
            next_call_id: 0,
            endpoint_id: Rc::new(()),
        }
    }

    /// A bare `State` for unit tests that exercise the marshaller in
    /// isolation, without a real transport.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        Self::new()
    }
}

#[derive(derivative::Derivative)]
#[derivative(Debug)]
struct Inner<T: Transport> {
    #[derivative(Debug = "ignore")]
    state: RefCell<State>,
    #[derivative(Debug = "ignore")]
    transport: RefCell<T>,
    #[derivative(Debug = "ignore")]
    alloc: OidAllocator,
    serving: Cell<bool>,
    #[derivative(Debug = "ignore")]
    close_event: event_listener::Event,
    #[derivative(Debug = "ignore")]
    close_handlers: RefCell<Vec<Box<dyn FnOnce(bool)>>>,
    had_error: Cell<bool>,
}

/// One side of the bidirectional RPC channel.
///
/// Cheap to clone: every clone shares the same registries and transport
/// through an `Rc`. Not `Send`/`Sync` by construction — see the module docs.
pub struct Socket<T: Transport> {
    inner: Rc<Inner<T>>,
}

impl<T: Transport> Clone for Socket<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Socket<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(State::new()),
                transport: RefCell::new(transport),
                alloc: OidAllocator::new(),
                serving: Cell::new(false),
                close_event: event_listener::Event::new(),
                close_handlers: RefCell::new(Vec::new()),
                had_error: Cell::new(false),
            }),
        }
    }

    pub(crate) fn endpoint_id(&self) -> Rc<()> {
        self.inner.state.borrow().endpoint_id.clone()
    }

    /// `addStub`. Synchronous: the announcement is queued and an
    /// opportunistic, non-blocking flush is attempted immediately,
    /// mirroring a fire-and-forget `transport.write(msg)`. If the transport
    /// isn't ready to accept it right away, the frame waits in the outbound
    /// queue and is flushed by the next [`Socket::serve`] iteration or the
    /// next queued write.
    pub fn add_stub(&self, target: Rc<dyn RpcTarget>) -> Result<Oid> {
        let mut state = self.inner.state.borrow_mut();
        if state.closed {
            return Err(Error::ClosedEndpoint);
        }
        let outcome = state.stubs.add(target, &self.inner.alloc);
        if outcome.needs_announcement() {
            let methods = state
                .stubs
                .lookup(outcome.oid())
                .expect("just inserted")
                .methods
                .clone();
            state.outbound.push_back(Frame::NewObject {
                obj: outcome.oid().clone(),
                methods: render_methods(&methods),
            });
        }
        let oid = outcome.oid().clone();
        drop(state);
        self.flush_outbound();
        Ok(oid)
    }

    /// Looks up a live proxy by oid, e.g. for an oid obtained out of band.
    /// Returns `None` if no `new-object` for this oid has arrived (or it
    /// was already freed).
    pub fn get_proxy(&self, oid: &Oid) -> Option<Proxy<T>> {
        let entry = self.inner.state.borrow().proxies.get(oid)?;
        Some(Proxy::new(oid.clone(), self.clone(), entry.methods))
    }

    /// `call`. Dispatches a method/getter/setter call against `oid`, which
    /// need not have a local proxy entry — the dispatcher addresses the
    /// peer's object space directly, the same way [`Proxy::call`] does via
    /// [`Socket::dispatch_call`].
    pub async fn call(&self, oid: &Oid, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        self.dispatch_call(oid, method, args).await
    }

    /// Core of the Call Dispatcher. Marshals arguments under the
    /// re-entrancy flag, flushes any announcements the marshalling
    /// discovered, writes the `call` frame, and awaits the matching reply.
    pub(crate) async fn dispatch_call(
        &self,
        oid: &Oid,
        method: &str,
        args: Vec<RpcValue>,
    ) -> Result<RpcValue> {
        self.begin_call()?;
        let params = match self.marshal_call_args(&args) {
            Ok(params) => params,
            Err(e) => {
                // Errors during marshalling propagate synchronously and do
                // not consume a call id. A failed pass may still have
                // registered and buffered `new-object` announcements for
                // earlier arguments before the one that tripped the error
                // (those stubs are now genuinely live in the registry) —
                // flush them rather than discard them, or the peer would
                // never learn an oid exists and every later reference to
                // that same object would be skipped as "already live".
                let buffered = self
                    .inner
                    .state
                    .borrow_mut()
                    .announce_buffer
                    .take()
                    .unwrap_or_default();
                if !buffered.is_empty() {
                    let mut state = self.inner.state.borrow_mut();
                    for frame in buffered {
                        state.outbound.push_back(frame);
                    }
                    drop(state);
                    self.flush_outbound();
                }
                return Err(e);
            }
        };
        let rx = self.finish_call(oid, method, params);
        self.flush_outbound();
        match rx.await {
            Ok(Ok(value)) => {
                let state = self.inner.state.borrow();
                marshal::unmarshal(&state, &value)
            }
            Ok(Err(e)) => Err(e),
            // The sender was dropped without sending: only happens when the
            // endpoint closes with this call still pending.
            Err(_canceled) => Err(Error::ClosedEndpoint),
        }
    }

    fn begin_call(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.closed {
            return Err(Error::ClosedEndpoint);
        }
        if state.announce_buffer.is_some() {
            return Err(Error::ReentrantCall);
        }
        state.announce_buffer = Some(Vec::new());
        Ok(())
    }

    fn marshal_call_args(&self, args: &[RpcValue]) -> Result<Vec<Value>> {
        let mut state = self.inner.state.borrow_mut();
        let mut buf = state
            .announce_buffer
            .take()
            .expect("begin_call always sets the buffer first");
        let mut params = Vec::with_capacity(args.len());
        for arg in args {
            match marshal::marshal(&mut state, &self.inner.alloc, arg, &mut buf) {
                Ok(v) => params.push(v),
                Err(e) => {
                    state.announce_buffer = Some(buf);
                    return Err(e);
                }
            }
        }
        state.announce_buffer = Some(buf);
        Ok(params)
    }

    fn finish_call(&self, oid: &Oid, method: &str, params: Vec<Value>) -> oneshot::Receiver<Result<Value>> {
        let mut state = self.inner.state.borrow_mut();
        let buffered = state.announce_buffer.take().unwrap_or_default();
        for frame in buffered {
            state.outbound.push_back(frame);
        }
        let call_id = state.next_call_id;
        state.next_call_id += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(call_id, tx);
        state.outbound.push_back(Frame::Call {
            id: call_id,
            obj: oid.clone(),
            method: method.to_string(),
            params,
        });
        rx
    }

    /// `$free` on a proxy: synchronous, matching [`Proxy::free`]'s
    /// non-async call site. Removes the local entry unconditionally; sends
    /// a `free` frame only if the endpoint is still open.
    pub(crate) fn free_proxy(&self, oid: &Oid) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let removed = state.proxies.remove(oid);
        let closed = state.closed;
        if removed && !closed {
            state.outbound.push_back(Frame::Free { id: oid.clone() });
        }
        drop(state);
        if !closed {
            self.flush_outbound();
        }
        Ok(())
    }

    /// Drives the inbound read loop, routing every frame to the right
    /// handler, and opportunistically flushes the outbound queue on every
    /// iteration so that calls/frees/stubs queued from outside a `serve`
    /// loop (e.g. before it starts) still go out.
    ///
    /// Resolves once the transport ends or errors; at that point every
    /// still-pending call is rejected with a closed-endpoint error (the
    /// closure cascade).
    pub async fn serve(&self) -> Result<()> {
        if self.inner.serving.replace(true) {
            return Err(Error::AlreadyServing);
        }
        let result = self.serve_inner().await;
        self.inner.serving.set(false);
        result
    }

    async fn serve_inner(&self) -> Result<()> {
        loop {
            self.flush_outbound();
            if self.inner.state.borrow().closed {
                return Ok(());
            }
            let next = {
                let mut transport = self.inner.transport.borrow_mut();
                transport.next().await
            };
            match next {
                Some(Ok(frame)) => crate::router::route(self, frame).await,
                Some(Err(Error::MalformedFrame(msg))) => {
                    tracing::warn!(reason = %msg, "dropping malformed frame");
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "transport error, closing endpoint");
                    self.close_with_error(true);
                    return Err(err);
                }
                None => {
                    tracing::debug!("transport ended, closing endpoint");
                    self.close_with_error(false);
                    return Ok(());
                }
            }
        }
    }

    /// Graceful shutdown: rejects pending calls, then closes the transport.
    pub async fn end(&self) -> Result<()> {
        self.close_with_error(false);
        let mut transport = self.inner.transport.borrow_mut();
        transport.close().await
    }

    /// Forces immediate closure: unlike [`Socket::end`] this doesn't wait
    /// for the transport to confirm the close.
    pub fn destroy(&self) {
        self.close_with_error(false);
        let mut transport = self.inner.transport.borrow_mut();
        let _ = transport.close().now_or_never();
    }

    /// Registers a one-shot close handler, receiving whether the endpoint
    /// closed with an error. Invoked immediately if the endpoint is already
    /// closed.
    pub fn on_close(&self, handler: impl FnOnce(bool) + 'static) {
        let already_closed = self.inner.state.borrow().closed;
        if already_closed {
            handler(self.inner.had_error.get());
        } else {
            self.inner.close_handlers.borrow_mut().push(Box::new(handler));
        }
    }

    /// Resolves once the endpoint closes, yielding whether it closed with an
    /// error.
    pub async fn closed(&self) -> bool {
        loop {
            if self.inner.state.borrow().closed {
                return self.inner.had_error.get();
            }
            let listener = self.inner.close_event.listen();
            if self.inner.state.borrow().closed {
                return self.inner.had_error.get();
            }
            listener.await;
        }
    }

    pub(crate) fn handle_new_object(&self, oid: Oid, methods: Vec<String>) {
        let mut state = self.inner.state.borrow_mut();
        if state.proxies.contains(&oid) || state.stubs.contains(&oid) {
            tracing::debug!(%oid, "new-object for already-known oid, ignoring");
            return;
        }
        let parsed = parse_methods(&methods);
        state.proxies.ensure(&oid, parsed);
    }

    pub(crate) fn handle_free(&self, oid: Oid) {
        let mut state = self.inner.state.borrow_mut();
        if state.stubs.remove(&oid) {
            return;
        }
        if state.proxies.remove(&oid) {
            return;
        }
        tracing::debug!(%oid, "free for an object neither registry holds");
    }

    pub(crate) fn handle_reply(
        &self,
        id: u64,
        reply: Option<Value>,
        error: Option<String>,
        message: Option<String>,
        stack: Option<String>,
        code: Option<String>,
    ) {
        let sender = self.inner.state.borrow_mut().pending.remove(&id);
        let Some(sender) = sender else {
            tracing::debug!(call_id = id, "reply for unknown or already-settled call id");
            return;
        };
        let result = match error {
            Some(class_name) => Err(Error::Remote(RemoteError {
                class: Some(crate::error::RemoteErrorClass::classify(&class_name)),
                message,
                stack,
                code,
            })),
            // Neither `reply` nor `error` present: treated as a successful
            // reply of undefined value.
            None => Ok(reply.unwrap_or(Value::Null)),
        };
        let _ = sender.send(result);
    }

    pub(crate) async fn handle_call(&self, id: u64, obj: Oid, method: String, params: Vec<Value>) {
        let stub_entry = {
            let state = self.inner.state.borrow();
            state.stubs.lookup(&obj).cloned()
        };
        let stub_entry = match stub_entry {
            Some(s) => s,
            None => {
                tracing::warn!(%obj, %method, "call targets unknown object");
                self.write_error_reply(id, &Error::InvalidObject(obj));
                return;
            }
        };
        let unmarshalled = {
            let state = self.inner.state.borrow();
            let mut out = Vec::with_capacity(params.len());
            let mut failure = None;
            for p in &params {
                match marshal::unmarshal(&state, p) {
                    Ok(v) => out.push(v),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => Err(e),
                None => Ok(out),
            }
        };
        let args = match unmarshalled {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(%obj, error = %e, "malformed call params");
                self.write_error_reply(id, &e);
                return;
            }
        };
        match stub_entry.invoke(&method, args).await {
            Ok(value) => self.queue_reply(id, &value),
            Err(e) => self.write_error_reply(id, &e),
        }
    }

    fn queue_reply(&self, id: u64, value: &RpcValue) {
        let mut buf = Vec::new();
        let wire = {
            let mut state = self.inner.state.borrow_mut();
            marshal::marshal(&mut state, &self.inner.alloc, value, &mut buf)
        };
        match wire {
            Ok(wire_value) => {
                let mut state = self.inner.state.borrow_mut();
                for frame in buf {
                    state.outbound.push_back(frame);
                }
                state.outbound.push_back(Frame::reply_ok(id, wire_value));
                drop(state);
                self.flush_outbound();
            }
            Err(e) => self.write_error_reply(id, &e),
        }
    }

    fn write_error_reply(&self, id: u64, err: &Error) {
        let remote = error_to_remote(err);
        let mut state = self.inner.state.borrow_mut();
        state.outbound.push_back(Frame::reply_err(id, &remote));
        drop(state);
        self.flush_outbound();
    }

    /// Closure cascade: marks the endpoint closed, rejects every pending
    /// call with a uniform closed-endpoint error, and fires registered
    /// close handlers exactly once.
    fn close_with_error(&self, had_error: bool) {
        let mut state = self.inner.state.borrow_mut();
        if state.closed {
            return;
        }
        state.closed = true;
        let pending = std::mem::take(&mut state.pending);
        drop(state);
        for (_, sender) in pending {
            let _ = sender.send(Err(Error::ClosedEndpoint));
        }
        self.inner.had_error.set(had_error);
        self.inner.close_event.notify(usize::MAX);
        let handlers = std::mem::take(&mut *self.inner.close_handlers.borrow_mut());
        for handler in handlers {
            handler(had_error);
        }
    }

    /// Attempts to drain the outbound queue onto the transport without
    /// blocking. Frames that can't be sent synchronously (the sink isn't
    /// ready yet) stay queued for the next flush attempt, which happens
    /// either from the next call into the socket or the next `serve`
    /// iteration.
    fn flush_outbound(&self) {
        loop {
            let frame = {
                let mut state = self.inner.state.borrow_mut();
                match state.outbound.pop_front() {
                    Some(frame) => frame,
                    None => return,
                }
            };
            let mut transport = self.inner.transport.borrow_mut();
            match transport.send(frame.clone()).now_or_never() {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    drop(transport);
                    tracing::warn!(error = %err, "transport rejected a queued frame, closing endpoint");
                    self.close_with_error(true);
                    return;
                }
                None => {
                    drop(transport);
                    self.inner.state.borrow_mut().outbound.push_front(frame);
                    return;
                }
            }
        }
    }
}

fn error_to_remote(err: &Error) -> RemoteError {
    match err {
        Error::Remote(remote) => remote.clone(),
        other => RemoteError {
            class: Some(crate::error::RemoteErrorClass::Generic),
            message: Some(other.to_string()),
            stack: None,
            code: None,
        },
    }
}
