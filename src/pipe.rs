//! Pooled pipe instances and the state shared by their endpoints.
//!
//! A [`Pipe`] is one full-duplex logical stream multiplexed onto the
//! connection. It owns its [`PipeReader`] and [`PipeWriter`] for its whole
//! pooled lifetime; a reset clears every field and bumps the generation
//! instead of reallocating. All state the two endpoints and the manager need
//! to agree on lives in one shared block behind the pipe.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::WatermarkConfig,
    error::PipeError,
    reader::{PipeReader, ReadBuffer},
    session::{MessageKind, SessionLink},
    state::{self, PipeFlags, Role, Transitions},
    writer::{PipeWriter, WriteBuffer},
};

/// Combined 16-bit pipe identifier.
///
/// The high byte is always the client side's local id and the low byte the
/// server side's, regardless of which peer packs it, so both sides derive
/// the same value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipeId(u16);

impl PipeId {
    /// Pack both halves in the fixed client/server byte order.
    #[must_use]
    pub const fn pack(client_half: u8, server_half: u8) -> Self {
        Self((client_half as u16) << 8 | server_half as u16)
    }

    /// Reinterpret a raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self { Self(raw) }

    /// Raw value as carried in the wire message prefix.
    #[must_use]
    pub const fn raw(self) -> u16 { self.0 }

    /// The client side's local id.
    #[must_use]
    pub const fn client_half(self) -> u8 { (self.0 >> 8) as u8 }

    /// The server side's local id.
    #[must_use]
    pub const fn server_half(self) -> u8 { self.0 as u8 }

    /// The half owned by a peer of the given role.
    #[must_use]
    pub const fn local_half(self, role: Role) -> u8 {
        match role {
            Role::Client => self.client_half(),
            Role::Server => self.server_half(),
        }
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipeId({}/{})", self.client_half(), self.server_half())
    }
}

/// Session attachment of one pipe incarnation, set by `setup` and cleared by
/// `reset`.
pub(crate) struct PipeBinding {
    pub(crate) link: Arc<dyn SessionLink>,
    pub(crate) config: WatermarkConfig,
    pub(crate) role: Role,
    pub(crate) local_id: u8,
    pub(crate) full_id: Option<PipeId>,
    pub(crate) locally_initiated: bool,
}

impl Clone for PipeBinding {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            config: self.config,
            role: self.role,
            local_id: self.local_id,
            full_id: self.full_id,
            locally_initiated: self.locally_initiated,
        }
    }
}

/// State shared between a pipe, its endpoints and the manager.
pub(crate) struct PipeShared {
    /// The state machine's flag word, broadcast so pause waits and the
    /// ready/complete futures are level-triggered.
    pub(crate) flags: watch::Sender<PipeFlags>,
    pub(crate) read_buf: Mutex<ReadBuffer>,
    /// Wakes the single pending logical read; `notify_one` permit semantics
    /// keep the signal level-triggered across the unlock/await gap.
    pub(crate) read_signal: Notify,
    pub(crate) write_buf: Mutex<WriteBuffer>,
    generation: AtomicU64,
    binding: Mutex<Option<PipeBinding>>,
}

impl PipeShared {
    fn new() -> Self {
        Self {
            flags: watch::Sender::new(PipeFlags::UNSET),
            read_buf: Mutex::new(ReadBuffer::default()),
            read_signal: Notify::new(),
            write_buf: Mutex::new(WriteBuffer::default()),
            generation: AtomicU64::new(0),
            binding: Mutex::new(None),
        }
    }

    /// Snapshot of the current flag word.
    pub(crate) fn flags_now(&self) -> PipeFlags { *self.flags.borrow() }

    /// Clone of the current binding, or [`PipeError::NotAttached`].
    pub(crate) fn binding(&self) -> Result<PipeBinding, PipeError> {
        self.binding
            .lock()
            .expect("pipe binding lock poisoned")
            .clone()
            .ok_or(PipeError::NotAttached)
    }

    pub(crate) fn generation(&self) -> u64 { self.generation.load(Ordering::Relaxed) }

    /// Record the combined id once the open handshake resolves it.
    pub(crate) fn set_full_id(&self, id: PipeId) {
        if let Some(binding) = self
            .binding
            .lock()
            .expect("pipe binding lock poisoned")
            .as_mut()
        {
            binding.full_id = Some(id);
        }
    }

    /// Apply a flag change and run its edge effects exactly once.
    ///
    /// Returns whether anything changed; a `true` result is the caller's cue
    /// to send a state notification to the peer. Must not be called with a
    /// buffer lock held.
    pub(crate) fn update_state(&self, change: PipeFlags, remove: bool) -> bool {
        let Ok(binding) = self.binding() else {
            debug!("state change on unattached pipe ignored");
            return false;
        };
        let mut transitions = Transitions::default();
        self.flags.send_if_modified(|flags| {
            transitions = state::apply(flags, change, remove, binding.role);
            transitions.changed
        });
        if transitions.writer_closed {
            self.write_buf
                .lock()
                .expect("pipe write buffer lock poisoned")
                .completed = true;
        }
        if transitions.reader_closed {
            self.read_buf
                .lock()
                .expect("pipe read buffer lock poisoned")
                .completed = true;
            self.read_signal.notify_one();
        }
        transitions.changed
    }

    /// Merge a state update received from the peer; never echoes back.
    ///
    /// The wire byte is the sender's complete flag set. Additions run their
    /// edge effects; removals are honored for the pause flags only, since
    /// readiness and the half-close flags are monotone.
    pub(crate) fn apply_remote(&self, flags: PipeFlags) {
        let current = self.flags_now();
        let added = flags.difference(current);
        if !added.is_empty() {
            self.update_state(added, false);
        }
        let removed = current.difference(flags).intersection(PipeFlags::PAUSE_MASK);
        if !removed.is_empty() {
            self.update_state(removed, true);
        }
    }

    /// Send the current flag word to the peer as a state-update message.
    ///
    /// A pipe still waiting for its combined id has nowhere to address the
    /// message; the update is skipped and the promotion path carries the
    /// state instead. Send failure is logged and the pipe is forced to
    /// complete locally so it cannot wedge half-notified.
    pub(crate) async fn send_state_update(&self) {
        let Ok(binding) = self.binding() else { return };
        let Some(id) = binding.full_id else {
            debug!("state change before id assignment; notification skipped");
            return;
        };
        let payload = Bytes::copy_from_slice(&[self.flags_now().bits()]);
        let cancel = CancellationToken::new();
        if let Err(error) = binding
            .link
            .send_message(MessageKind::StateUpdate, id, payload, &cancel)
            .await
        {
            warn!(pipe = %id, %error, "state notification failed; forcing pipe completion");
            self.force_complete_local();
        }
    }

    /// Dispatch [`send_state_update`](Self::send_state_update) from a
    /// synchronous entry point.
    pub(crate) fn spawn_state_update(self: Arc<Self>) {
        tokio::spawn(async move { self.send_state_update().await });
    }

    /// Force the pipe to `COMPLETE` without notifying the peer.
    ///
    /// Pending reads resolve completed and pending flushes stop at their
    /// next suspension point.
    pub(crate) fn force_complete_local(&self) {
        self.update_state(PipeFlags::COMPLETE, false);
    }

    fn reset(&self) {
        *self.binding.lock().expect("pipe binding lock poisoned") = None;
        self.flags.send_if_modified(|flags| {
            let was = *flags;
            *flags = PipeFlags::UNSET;
            was != PipeFlags::UNSET
        });
        self.read_buf
            .lock()
            .expect("pipe read buffer lock poisoned")
            .reset();
        self.write_buf
            .lock()
            .expect("pipe write buffer lock poisoned")
            .reset();
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.read_signal.notify_one();
    }
}

/// One full-duplex logical stream multiplexed on the connection.
///
/// Handed out by [`PipeManager`](crate::manager::PipeManager); application
/// code consumes bytes through [`input`](Self::input) and produces them
/// through [`output`](Self::output).
pub struct Pipe {
    shared: Arc<PipeShared>,
    input: PipeReader,
    output: PipeWriter,
}

impl Pipe {
    pub(crate) fn new() -> Self {
        let shared = Arc::new(PipeShared::new());
        Self {
            input: PipeReader::new(Arc::clone(&shared)),
            output: PipeWriter::new(Arc::clone(&shared)),
            shared,
        }
    }

    /// The inbound byte-stream endpoint.
    #[must_use]
    pub fn input(&self) -> &PipeReader { &self.input }

    /// The outbound byte-stream endpoint.
    #[must_use]
    pub fn output(&self) -> &PipeWriter { &self.output }

    /// The combined id, once the open handshake has resolved it.
    #[must_use]
    pub fn id(&self) -> Option<PipeId> {
        self.shared.binding().ok().and_then(|binding| binding.full_id)
    }

    /// This side's half of the identifier.
    #[must_use]
    pub fn local_id(&self) -> Option<u8> {
        self.shared.binding().ok().map(|binding| binding.local_id)
    }

    /// Whether this side opened the pipe (as opposed to the peer).
    #[must_use]
    pub fn is_locally_initiated(&self) -> bool {
        self.shared
            .binding()
            .is_ok_and(|binding| binding.locally_initiated)
    }

    /// Incarnation counter, bumped on every reset.
    #[must_use]
    pub fn generation(&self) -> u64 { self.shared.generation() }

    /// Snapshot of the lifecycle flags.
    #[must_use]
    pub fn flags(&self) -> PipeFlags { self.shared.flags_now() }

    /// Whether both directions have closed.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.flags().is_complete() }

    /// Resolves once the pipe becomes ready for use.
    ///
    /// The side that rented the pipe awaits this while the peer processes
    /// the open handshake; the peer's first state update resolves it.
    pub async fn ready(&self) {
        let mut rx = self.shared.flags.subscribe();
        rx.wait_for(|flags| flags.contains(PipeFlags::READY))
            .await
            .expect("flag channel lives as long as the pipe");
    }

    /// Resolves once both directions have closed.
    pub async fn completed(&self) {
        let mut rx = self.shared.flags.subscribe();
        rx.wait_for(|flags| flags.is_complete())
            .await
            .expect("flag channel lives as long as the pipe");
    }

    /// Close both directions and notify the peer if that was a transition.
    pub async fn complete(&self) {
        if self.shared.update_state(PipeFlags::COMPLETE, false) {
            self.shared.send_state_update().await;
        }
    }

    /// Attach the pipe to a session for one incarnation.
    ///
    /// # Panics
    ///
    /// Panics if the pipe is already attached; re-initializing an
    /// initialized pipe is a programming error, not a runtime condition.
    pub(crate) fn setup(&self, binding: PipeBinding) {
        let mut slot = self
            .shared
            .binding
            .lock()
            .expect("pipe binding lock poisoned");
        assert!(slot.is_none(), "pipe is already attached to a session");
        *slot = Some(binding);
    }

    /// Clear every field and bump the generation for the next incarnation.
    pub(crate) fn reset(&self) { self.shared.reset(); }

    pub(crate) fn shared(&self) -> &Arc<PipeShared> { &self.shared }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id())
            .field("generation", &self.generation())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}
