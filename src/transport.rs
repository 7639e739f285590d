//! The transport seam: "any bidirectional stream that frames arbitrary
//! structured messages". The engine consumes only a
//! message sink/source that preserves ordering and message boundaries; how
//! that's achieved (TCP, a Unix socket, an in-process channel, ...) is
//! explicitly out of scope.

use crate::error::Error;
use crate::frame::Frame;
use futures_core::Stream;
use futures_sink::Sink;

/// A bidirectional, ordered, message-boundary-preserving duplex carrying
/// [`Frame`] values.
///
/// Implement this over whatever byte-stream or message-queue the two peers
/// actually share; the engine only ever calls through this trait, never
/// assumes a particular encoding.
pub trait Transport:
    Stream<Item = Result<Frame, Error>> + Sink<Frame, Error = Error> + Unpin
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Frame, Error>> + Sink<Frame, Error = Error> + Unpin
{
}
