//! Outbound byte-stream endpoint of a pipe.
//!
//! The writer accumulates bytes in a growable buffer and re-frames them on
//! flush into wire messages of at most the configured chunk size, honoring a
//! remotely imposed pause before the first chunk leaves. Sent memory is
//! never retained.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    error::PipeError,
    metrics,
    pipe::{PipeBinding, PipeId, PipeShared},
    session::{MessageKind, SendError},
};

/// Outcome of one [`flush`](PipeWriter::flush).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// The flush stopped at a cancellation point; unsent bytes were
    /// released, not kept.
    pub is_canceled: bool,
    /// The writer is completed; no further bytes will be accepted or sent.
    pub is_completed: bool,
}

/// Outbound buffered region: a single growable block, drained FIFO.
#[derive(Default)]
pub(crate) struct WriteBuffer {
    buffer: BytesMut,
    flush_pending: bool,
    pub(crate) completed: bool,
}

impl WriteBuffer {
    pub(crate) fn reset(&mut self) {
        self.buffer = BytesMut::new();
        self.flush_pending = false;
        self.completed = false;
    }
}

/// Write access to the outbound buffer with capacity pre-reserved.
///
/// Dereferences to the underlying [`BytesMut`]; bytes written through it are
/// committed as they land. The buffer lock is held for the guard's lifetime,
/// so reservations must not be kept across suspension points.
pub struct Reservation<'a> {
    guard: MutexGuard<'a, WriteBuffer>,
}

impl Deref for Reservation<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut { &self.guard.buffer }
}

impl DerefMut for Reservation<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut { &mut self.guard.buffer }
}

/// Public asynchronous outbound endpoint of one pipe.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    pub(crate) fn new(shared: Arc<PipeShared>) -> Self { Self { shared } }

    /// Reserve capacity and expose the buffer for in-place writing.
    ///
    /// # Errors
    ///
    /// [`PipeError::WriterCompleted`] once the writer has completed.
    pub fn reserve(&self, additional: usize) -> Result<Reservation<'_>, PipeError> {
        let mut guard = self
            .shared
            .write_buf
            .lock()
            .expect("pipe write buffer lock poisoned");
        if guard.completed {
            return Err(PipeError::WriterCompleted);
        }
        guard.buffer.reserve(additional);
        Ok(Reservation { guard })
    }

    /// Append bytes to the outbound buffer.
    ///
    /// # Errors
    ///
    /// [`PipeError::WriterCompleted`] once the writer has completed.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PipeError> {
        let mut guard = self
            .shared
            .write_buf
            .lock()
            .expect("pipe write buffer lock poisoned");
        if guard.completed {
            return Err(PipeError::WriterCompleted);
        }
        guard.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Send every buffered byte as ordered wire messages of at most the
    /// configured chunk size.
    ///
    /// An empty buffer is a no-op. A non-empty flush first waits out any
    /// remote pause, then drains; buffered memory is released after the
    /// loop regardless of outcome. A closed connection degrades to local
    /// completion, cancellation stops silently, and any other send fault is
    /// fatal to the whole session. A flush that leaves the writer completed
    /// notifies the peer so it can release its reader.
    ///
    /// # Errors
    ///
    /// [`PipeError::NotAttached`]/[`PipeError::NotReady`] on a pipe without
    /// a session or combined id, [`PipeError::FlushPending`] when a flush is
    /// already in flight.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<FlushOutcome, PipeError> {
        let binding = self.shared.binding()?;
        let Some(id) = binding.full_id else {
            return Err(PipeError::NotReady);
        };
        let payload = {
            let mut guard = self
                .shared
                .write_buf
                .lock()
                .expect("pipe write buffer lock poisoned");
            if guard.flush_pending {
                return Err(PipeError::FlushPending);
            }
            if guard.buffer.is_empty() {
                return Ok(FlushOutcome {
                    is_canceled: false,
                    is_completed: guard.completed,
                });
            }
            guard.flush_pending = true;
            guard.buffer.split().freeze()
        };
        let outcome = {
            // Cleared on drop so an abandoned flush future releases its slot.
            let _guard = FlushPendingGuard {
                shared: &self.shared,
            };
            self.drain(&binding, id, payload, cancel).await
        };
        if outcome.is_completed
            && self
                .shared
                .update_state(binding.role.writer_closed_flag(), false)
        {
            self.shared.send_state_update().await;
        }
        Ok(outcome)
    }

    async fn drain(
        &self,
        binding: &PipeBinding,
        id: PipeId,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> FlushOutcome {
        let pause = binding.role.pause_observed_flag();
        let halt = binding.role.writer_closed_flag();

        let mut rx = self.shared.flags.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return FlushOutcome {
                    is_canceled: true,
                    is_completed: self.is_completed(),
                };
            }
            result = rx.wait_for(|flags| !flags.contains(pause) || flags.contains(halt)) => {
                result.expect("flag channel lives as long as the pipe");
            }
        }

        let chunk_size = binding.config.flush_chunk_size().get();
        let total = payload.len();
        let mut offset = 0;
        let mut is_canceled = false;
        while offset < total {
            if cancel.is_cancelled() {
                is_canceled = true;
                break;
            }
            if self.is_completed() {
                break;
            }
            let end = usize::min(offset + chunk_size, total);
            match binding
                .link
                .send_message(MessageKind::Data, id, payload.slice(offset..end), cancel)
                .await
            {
                Ok(()) => {
                    offset = end;
                    metrics::inc_chunks_sent();
                }
                Err(SendError::ConnectionClosed) => {
                    debug!(pipe = %id, "connection closed during flush; completing writer");
                    self.mark_completed();
                    break;
                }
                Err(SendError::Canceled) => {
                    is_canceled = true;
                    break;
                }
                Err(err) => {
                    error!(pipe = %id, error = %err, "flush send fault; terminating session");
                    self.mark_completed();
                    binding.link.request_termination("pipe flush send fault");
                    break;
                }
            }
        }
        // `payload` drops here: sent or not, flushed memory is released.
        FlushOutcome {
            is_canceled,
            is_completed: self.is_completed(),
        }
    }

    /// Complete the writer and tell the peer this side will write no more.
    ///
    /// Completion always round-trips through a peer notification so the
    /// peer can release its reader; there is deliberately no synchronous
    /// non-notifying variant.
    pub async fn complete(&self) {
        self.mark_completed();
        let Ok(binding) = self.shared.binding() else { return };
        if self
            .shared
            .update_state(binding.role.writer_closed_flag(), false)
        {
            self.shared.send_state_update().await;
        }
    }

    /// Bytes currently buffered and not yet flushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared
            .write_buf
            .lock()
            .expect("pipe write buffer lock poisoned")
            .buffer
            .len()
    }

    /// Whether the writer has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.shared
            .write_buf
            .lock()
            .expect("pipe write buffer lock poisoned")
            .completed
    }

    pub(crate) fn mark_completed(&self) {
        self.shared
            .write_buf
            .lock()
            .expect("pipe write buffer lock poisoned")
            .completed = true;
    }
}

struct FlushPendingGuard<'a> {
    shared: &'a PipeShared,
}

impl Drop for FlushPendingGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .write_buf
            .lock()
            .expect("pipe write buffer lock poisoned")
            .flush_pending = false;
    }
}
