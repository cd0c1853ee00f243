//! Inbound byte-stream endpoint of a pipe.
//!
//! The reader buffers demultiplexed data zero-copy, meters the buffered
//! length against the session watermarks, and implements the
//! suspend/resume read contract: at most one logical read is pending and it
//! wakes on new data, cancellation or completion.

use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::PipeError,
    pipe::PipeShared,
    state::Role,
};

/// Result of handing inbound bytes to [`PipeReader::buffer_data`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    /// The bytes were appended.
    Buffered,
    /// The bytes were appended and the buffered length reached the high
    /// water mark; pause was requested from the peer.
    HighWatermarkReached,
    /// The append would reach the hard cutoff; the bytes were dropped
    /// without mutating the buffer. Callers should treat the pipe as broken.
    HighCutoffReached,
}

/// Outcome of one logical [`read`](PipeReader::read).
#[derive(Clone, Debug)]
pub struct ReadOutcome {
    /// Every buffered byte from the consumed position to the tail.
    pub bytes: Bytes,
    /// The read was canceled before data or completion arrived; the buffer
    /// is untouched.
    pub is_canceled: bool,
    /// The peer will write no more; drain `bytes` and stop reading.
    pub is_completed: bool,
}

/// Inbound buffered region: an append-only run of zero-copy chunks with
/// absolute positions. `consumed ≤ examined ≤ tail` always holds; the
/// watermarks meter `tail − examined`.
#[derive(Default)]
pub(crate) struct ReadBuffer {
    chunks: VecDeque<Bytes>,
    /// Consumed prefix of the front chunk.
    front_offset: usize,
    tail_position: u64,
    consumed_position: u64,
    examined_position: u64,
    backpressure: bool,
    read_pending: bool,
    pub(crate) completed: bool,
}

impl ReadBuffer {
    fn buffered_len(&self) -> u64 { self.tail_position - self.examined_position }

    fn has_unexamined(&self) -> bool { self.tail_position > self.examined_position }

    fn push(&mut self, bytes: Bytes) {
        self.tail_position += bytes.len() as u64;
        self.chunks.push_back(bytes);
    }

    /// All unconsumed bytes as one contiguous block.
    ///
    /// Multiple chunks are coalesced once and the merged block replaces
    /// them, so peek-without-consume loops do not copy repeatedly.
    fn coalesced(&mut self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].slice(self.front_offset..),
            _ => {
                let unconsumed = usize::try_from(self.tail_position - self.consumed_position)
                    .expect("unconsumed region fits in memory");
                let mut merged = BytesMut::with_capacity(unconsumed);
                for (index, chunk) in self.chunks.iter().enumerate() {
                    let start = if index == 0 { self.front_offset } else { 0 };
                    merged.extend_from_slice(&chunk[start..]);
                }
                let merged = merged.freeze();
                self.chunks.clear();
                self.chunks.push_back(merged.clone());
                self.front_offset = 0;
                merged
            }
        }
    }

    /// Release chunk memory up to the absolute `consumed_to` position.
    fn release_to(&mut self, consumed_to: u64) {
        let mut remaining = usize::try_from(consumed_to - self.consumed_position)
            .expect("release region fits in memory");
        while remaining > 0 {
            let front_len = self.chunks[0].len() - self.front_offset;
            if remaining >= front_len {
                remaining -= front_len;
                self.chunks.pop_front();
                self.front_offset = 0;
            } else {
                self.front_offset += remaining;
                remaining = 0;
            }
        }
        self.consumed_position = consumed_to;
    }

    pub(crate) fn reset(&mut self) { *self = Self::default(); }
}

/// Public asynchronous inbound endpoint of one pipe.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    pub(crate) fn new(shared: Arc<PipeShared>) -> Self { Self { shared } }

    /// Append demultiplexed inbound bytes.
    ///
    /// Reaching the high water mark raises this side's pause flag and
    /// notifies the peer (advisory; nothing is lost). Reaching the cutoff
    /// rejects the append outright: the hard safety valve against unbounded
    /// growth from a stalled consumer. Data arriving after local reader
    /// completion is discarded.
    pub fn buffer_data(&self, bytes: Bytes) -> BufferStatus {
        let Ok(binding) = self.shared.binding() else {
            debug!("inbound data for unattached pipe discarded");
            return BufferStatus::Buffered;
        };
        let config = binding.config;
        let status = {
            let mut buf = self
                .shared
                .read_buf
                .lock()
                .expect("pipe read buffer lock poisoned");
            if buf.completed {
                debug!("inbound data after reader completion discarded");
                return BufferStatus::Buffered;
            }
            if bytes.is_empty() {
                return BufferStatus::Buffered;
            }
            let projected = buf.buffered_len() + bytes.len() as u64;
            if projected >= config.high_water_cutoff() as u64 {
                return BufferStatus::HighCutoffReached;
            }
            buf.push(bytes);
            self.shared.read_signal.notify_one();
            if !buf.backpressure && projected >= config.high_water_mark() as u64 {
                buf.backpressure = true;
                BufferStatus::HighWatermarkReached
            } else {
                BufferStatus::Buffered
            }
        };
        if status == BufferStatus::HighWatermarkReached
            && self
                .shared
                .update_state(binding.role.pause_raised_flag(), false)
        {
            Arc::clone(&self.shared).spawn_state_update();
        }
        status
    }

    /// Wait for unexamined data, cancellation or completion.
    ///
    /// Returns every unconsumed byte so peek loops see the full region;
    /// call [`advance`](Self::advance) to release what was processed. At
    /// most one logical read may be pending.
    ///
    /// # Errors
    ///
    /// [`PipeError::NotAttached`] on a reset pipe and
    /// [`PipeError::ReadPending`] when a read is already waiting.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<ReadOutcome, PipeError> {
        let binding = self.shared.binding()?;
        {
            let mut buf = self
                .shared
                .read_buf
                .lock()
                .expect("pipe read buffer lock poisoned");
            if buf.read_pending {
                return Err(PipeError::ReadPending);
            }
            buf.read_pending = true;
        }
        // Cleared on drop so an abandoned read future releases its slot.
        let _guard = ReadPendingGuard {
            shared: &self.shared,
        };
        Ok(self.read_pending_guarded(binding.role, cancel).await)
    }

    async fn read_pending_guarded(&self, role: Role, cancel: &CancellationToken) -> ReadOutcome {
        loop {
            {
                let mut buf = self
                    .shared
                    .read_buf
                    .lock()
                    .expect("pipe read buffer lock poisoned");
                if cancel.is_cancelled() {
                    return ReadOutcome {
                        bytes: Bytes::new(),
                        is_canceled: true,
                        is_completed: false,
                    };
                }
                if buf.has_unexamined() || buf.completed {
                    let bytes = buf.coalesced();
                    let is_completed = buf.completed;
                    let resume = self.low_water_check(&mut buf);
                    drop(buf);
                    if resume {
                        self.relieve_pause(role);
                    }
                    return ReadOutcome {
                        bytes,
                        is_canceled: false,
                        is_completed,
                    };
                }
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return ReadOutcome {
                        bytes: Bytes::new(),
                        is_canceled: true,
                        is_completed: false,
                    };
                }
                () = self.shared.read_signal.notified() => {}
            }
        }
    }

    /// Release memory up to `consumed_to` and record `examined_to`.
    ///
    /// Positions are absolute. `examined_to` may trail the tail to keep the
    /// next read from suspending, which is what peek-without-consume loops
    /// rely on. Falling to the low water mark while pause is raised relieves
    /// it and notifies the peer.
    ///
    /// # Errors
    ///
    /// [`PipeError::InvalidAdvance`] when the positions are non-monotone or
    /// past the tail; [`PipeError::NotAttached`] on a reset pipe.
    pub fn advance(&self, consumed_to: u64, examined_to: u64) -> Result<(), PipeError> {
        let binding = self.shared.binding()?;
        let resume = {
            let mut buf = self
                .shared
                .read_buf
                .lock()
                .expect("pipe read buffer lock poisoned");
            if consumed_to < buf.consumed_position
                || consumed_to > examined_to
                || examined_to < buf.examined_position
                || examined_to > buf.tail_position
            {
                return Err(PipeError::InvalidAdvance {
                    consumed_to,
                    examined_to,
                    tail: buf.tail_position,
                });
            }
            buf.release_to(consumed_to);
            buf.examined_position = examined_to;
            self.low_water_check(&mut buf)
        };
        if resume {
            self.relieve_pause(binding.role);
        }
        Ok(())
    }

    /// Stop accepting inbound data; idempotent and local only.
    pub fn complete(&self) {
        let mut buf = self
            .shared
            .read_buf
            .lock()
            .expect("pipe read buffer lock poisoned");
        if !buf.completed {
            buf.completed = true;
            self.shared.read_signal.notify_one();
        }
    }

    /// Complete and tell the peer this side will not read any more.
    ///
    /// The notification is sent only if the half-close was a real
    /// transition.
    pub async fn complete_notify(&self) {
        self.complete();
        let Ok(binding) = self.shared.binding() else { return };
        if self
            .shared
            .update_state(binding.role.reader_closed_flag(), false)
        {
            self.shared.send_state_update().await;
        }
    }

    /// Buffered length currently metered against the watermarks.
    #[must_use]
    pub fn buffered(&self) -> u64 {
        self.shared
            .read_buf
            .lock()
            .expect("pipe read buffer lock poisoned")
            .buffered_len()
    }

    /// Whether the peer will write no more.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.shared
            .read_buf
            .lock()
            .expect("pipe read buffer lock poisoned")
            .completed
    }

    fn low_water_check(&self, buf: &mut ReadBuffer) -> bool {
        let Ok(binding) = self.shared.binding() else {
            return false;
        };
        if buf.backpressure && buf.buffered_len() <= binding.config.low_water_mark() as u64 {
            buf.backpressure = false;
            true
        } else {
            false
        }
    }

    fn relieve_pause(&self, role: Role) {
        if self.shared.update_state(role.pause_raised_flag(), true) {
            Arc::clone(&self.shared).spawn_state_update();
        }
    }
}

struct ReadPendingGuard<'a> {
    shared: &'a PipeShared,
}

impl Drop for ReadPendingGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .read_buf
            .lock()
            .expect("pipe read buffer lock poisoned")
            .read_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_frees_whole_and_partial_chunks() {
        let mut buf = ReadBuffer::default();
        buf.push(Bytes::from_static(b"abcd"));
        buf.push(Bytes::from_static(b"efgh"));
        buf.release_to(6);
        assert_eq!(buf.consumed_position, 6);
        assert_eq!(buf.chunks.len(), 1);
        assert_eq!(buf.front_offset, 2);
        buf.release_to(8);
        assert!(buf.chunks.is_empty());
    }

    #[test]
    fn coalesce_merges_once_and_caches() {
        let mut buf = ReadBuffer::default();
        buf.push(Bytes::from_static(b"ab"));
        buf.push(Bytes::from_static(b"cd"));
        assert_eq!(buf.coalesced(), Bytes::from_static(b"abcd"));
        assert_eq!(buf.chunks.len(), 1);
        assert_eq!(buf.coalesced(), Bytes::from_static(b"abcd"));
    }

    #[test]
    fn coalesce_respects_consumed_prefix() {
        let mut buf = ReadBuffer::default();
        buf.push(Bytes::from_static(b"abcd"));
        buf.push(Bytes::from_static(b"ef"));
        buf.release_to(3);
        assert_eq!(buf.coalesced(), Bytes::from_static(b"def"));
    }
}
