//! Interface to the owning session collaborator.
//!
//! The session owns the physical connection and the outer RPC envelope; this
//! layer only hands it typed messages to put on the wire. [`SessionLink`] is
//! the complete downward surface: everything a pipe sends leaves through
//! [`send_message`](SessionLink::send_message).

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::pipe::PipeId;

/// Kind of a multiplexed wire message.
///
/// The payload of a [`Data`](Self::Data) message is raw pipe bytes; a
/// [`StateUpdate`](Self::StateUpdate) carries the sender's complete flag byte.
/// Both are prefixed with the two-byte combined pipe id by the session when
/// it builds the outer envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Data,
    StateUpdate,
}

/// Classified failure of [`SessionLink::send_message`].
///
/// Only [`Transport`](Self::Transport) is fatal to the session: the flush
/// path reacts by requesting termination. A closed connection degrades to
/// local pipe completion and a canceled send stops silently.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection already finished; nothing can be sent any more.
    #[error("connection already closed")]
    ConnectionClosed,
    /// The caller's cancellation token fired while sending.
    #[error("send canceled")]
    Canceled,
    /// The transport failed mid-send.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

/// The owning session, as seen from the multiplexing layer.
#[async_trait]
pub trait SessionLink: Send + Sync + 'static {
    /// Whether this peer is the server side of the connection.
    ///
    /// Decides which state flag maps to which local direction; see
    /// [`Role`](crate::state::Role).
    fn is_server_side(&self) -> bool;

    /// Put one multiplexed message on the connection's ordered stream.
    ///
    /// Calls for one pipe are awaited sequentially by this layer, which is
    /// what guarantees per-pipe byte order on the peer.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] classified by the transport; see the enum for
    /// how each class is handled.
    async fn send_message(
        &self,
        kind: MessageKind,
        id: PipeId,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), SendError>;

    /// Ask the session to tear down the whole connection.
    ///
    /// Invoked when a flush hits a fault that is fatal to the session rather
    /// than to the single pipe.
    fn request_termination(&self, reason: &str);
}
