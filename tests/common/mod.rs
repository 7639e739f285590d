//! An in-process duplex [`Frame`] channel used as the test transport.
//!
//! The real transport is the application's concern, not the engine's, so
//! this lives only under `tests/`, built from `futures_channel::mpsc`.

use futures_channel::mpsc;
use futures_core::Stream;
use futures_sink::Sink;
use futures_util::{pin_mut, select, FutureExt};
use rpcstub::{Error, Frame, Socket};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub struct Chan {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

pub fn duplex_pair() -> (Chan, Chan) {
    let (tx_a, rx_a) = mpsc::unbounded();
    let (tx_b, rx_b) = mpsc::unbounded();
    (
        Chan { tx: tx_a, rx: rx_b },
        Chan { tx: tx_b, rx: rx_a },
    )
}

impl Stream for Chan {
    type Item = Result<Frame, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx).map(|item| item.map(Ok))
    }
}

impl Sink<Frame> for Chan {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Error> {
        self.tx
            .unbounded_send(item)
            .map_err(|err| Error::Transport(Box::new(err.into_send_error())))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.tx.close_channel();
        Poll::Ready(Ok(()))
    }
}

/// Drives both peers' `serve` loops concurrently with `body` until `body`
/// resolves. Neither `serve` call is expected to return on its own here —
/// nothing in these tests calls `end`/`destroy` while this is running — so a
/// peer's loop settling is treated as a bug in the test itself, not as a
/// normal outcome to race against.
pub async fn drive<Fut: Future>(a: &Socket<Chan>, b: &Socket<Chan>, body: Fut) -> Fut::Output {
    let a_serve = a.serve().fuse();
    let b_serve = b.serve().fuse();
    let body = body.fuse();
    pin_mut!(a_serve, b_serve, body);
    loop {
        select! {
            r = a_serve => r.expect("peer a's serve loop ended unexpectedly"),
            r = b_serve => r.expect("peer b's serve loop ended unexpectedly"),
            out = body => return out,
        }
    }
}
