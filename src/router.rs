//! Message Router: classifies an inbound [`Frame`] by its `control`
//! discriminant and routes it to the matching handler on [`Socket`]. Kept
//! as a free function, separate from `socket`'s dispatcher and lifecycle
//! methods — the handlers themselves live on `Socket` because routing
//! `reply`/`free`/`new-object` needs the same `State` the dispatcher and
//! registries already share, and duplicating that access behind a second
//! type would just be indirection.
//!
//! Frames that fail to decode at all (missing `id`, non-array `params`, an
//! unrecognised `control` tag) never reach this function — they surface as
//! a transport-level [`crate::error::Error::MalformedFrame`] from the
//! `Stream` itself, which [`Socket::serve`](crate::socket::Socket::serve)
//! logs and drops without tearing down the endpoint. What's left for this
//! router to handle is frame-shaped-but-semantically-stale traffic: a call
//! or free naming an oid neither registry recognises, or a reply for a call
//! id that already settled — both logged or answered with a diagnostic
//! reply rather than treated as fatal.

use crate::frame::Frame;
use crate::socket::Socket;
use crate::transport::Transport;

pub(crate) async fn route<T: Transport>(socket: &Socket<T>, frame: Frame) {
    match frame {
        Frame::NewObject { obj, methods } => socket.handle_new_object(obj, methods),
        Frame::Call {
            id,
            obj,
            method,
            params,
        } => socket.handle_call(id, obj, method, params).await,
        Frame::Reply {
            id,
            reply,
            error,
            message,
            stack,
            code,
        } => socket.handle_reply(id, reply, error, message, stack, code),
        Frame::Free { id } => socket.handle_free(id),
    }
}
