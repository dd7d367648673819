//! The transport contract between the dispatcher and its peers.
//!
//! Both incoming callers and workers are reached through a [`Connection`]: a
//! suspending `recv` that yields messages one at a time in arrival order, and a
//! `send` that delivers exactly one message while preserving order relative to
//! other sends on the same connection. Framing, serialization and connection
//! setup belong to the implementor.
//!
//! [`ChannelConnection`] is an in-memory implementation backed by a pair of
//! bounded [`mpsc`] channels, useful for embedding the dispatcher in-process
//! and for tests.

use crate::{Error, Result};
use tokio::sync::mpsc;

/// A bidirectional, message-oriented endpoint.
pub trait Connection: Send {
    /// The unit exchanged over the connection.
    type Message: Send + 'static;

    /// Waits for the next message from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the peer has gone away, or
    /// [`Error::InvalidRequest`] if a message arrived but could not be
    /// decoded.
    fn recv(&mut self) -> impl Future<Output = Result<Self::Message>> + Send;

    /// Delivers one message to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the peer has gone away.
    fn send(&mut self, message: Self::Message) -> impl Future<Output = Result<()>> + Send;
}

/// One end of an in-memory connection. See [`channel_pair`].
#[derive(Debug)]
pub struct ChannelConnection<M> {
    tx: mpsc::Sender<M>,
    rx: mpsc::Receiver<M>,
}

/// Creates two connected endpoints; whatever one sends, the other receives.
///
/// Each direction buffers up to `capacity` messages before `send` waits.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel_pair<M: Send + 'static>(
    capacity: usize,
) -> (ChannelConnection<M>, ChannelConnection<M>) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        ChannelConnection { tx: a_tx, rx: a_rx },
        ChannelConnection { tx: b_tx, rx: b_rx },
    )
}

impl<M: Send + 'static> Connection for ChannelConnection<M> {
    type Message = M;

    async fn recv(&mut self) -> Result<M> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::channel("peer closed the connection"))
    }

    async fn send(&mut self, message: M) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::channel("peer closed the connection"))
    }
}
