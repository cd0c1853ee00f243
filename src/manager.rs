//! Pipe multiplexing manager.
//!
//! One manager serves one connection: it allocates and recycles local ids,
//! demultiplexes inbound data and state messages to the right pipe, and
//! drives pool return. Every entry point re-validates the stored generation
//! so a stale queued operation can never mutate a recycled instance.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{
    config::WatermarkConfig,
    error::PipeError,
    metrics,
    pipe::{Pipe, PipeBinding, PipeId},
    pool::PipePool,
    reader::BufferStatus,
    session::SessionLink,
    state::{PipeFlags, Role},
};

/// Round-robin allocator over the 256 one-byte id slots of one connection.
///
/// A rotating cursor spreads reuse across the whole space instead of
/// handing a just-freed id straight back out.
struct IdAllocator {
    words: [u64; 4],
    cursor: u8,
}

impl IdAllocator {
    const fn new() -> Self {
        Self {
            words: [0; 4],
            cursor: 0,
        }
    }

    fn allocate(&mut self) -> Option<u8> {
        for offset in 0..=u8::MAX {
            let id = self.cursor.wrapping_add(offset);
            let (word, bit) = (usize::from(id >> 6), id & 0x3f);
            if self.words[word] & (1 << bit) == 0 {
                self.words[word] |= 1 << bit;
                self.cursor = id.wrapping_add(1);
                return Some(id);
            }
        }
        None
    }

    fn release(&mut self, id: u8) {
        let (word, bit) = (usize::from(id >> 6), id & 0x3f);
        self.words[word] &= !(1 << bit);
    }

    fn in_use(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

/// A tracked pipe plus the generation it was indexed under.
struct PipeEntry {
    pipe: Arc<Pipe>,
    generation: u64,
}

impl PipeEntry {
    fn current(&self) -> bool { self.generation == self.pipe.generation() }
}

/// Multiplexes pipe instances over one connection.
pub struct PipeManager {
    link: Arc<dyn SessionLink>,
    config: WatermarkConfig,
    role: Role,
    ids: Mutex<IdAllocator>,
    /// Locally initiated pipes awaiting the peer's first state message,
    /// keyed by this side's local id.
    initializing: DashMap<u8, PipeEntry>,
    /// Pipes with a resolved combined id, keyed by it.
    active: DashMap<PipeId, PipeEntry>,
    pool: PipePool,
}

impl PipeManager {
    /// Create a manager for one connection owned by `link`.
    #[must_use]
    pub fn new(link: Arc<dyn SessionLink>, config: WatermarkConfig) -> Self {
        let role = Role::from_server_side(link.is_server_side());
        Self {
            link,
            config,
            role,
            ids: Mutex::new(IdAllocator::new()),
            initializing: DashMap::new(),
            active: DashMap::new(),
            pool: PipePool::default(),
        }
    }

    /// Which end of the connection this manager serves.
    #[must_use]
    pub fn role(&self) -> Role { self.role }

    /// Open a pipe from this side.
    ///
    /// The caller drives the open handshake through the outer protocol and
    /// awaits [`Pipe::ready`]; the peer's first state message back promotes
    /// the pipe to active.
    ///
    /// # Errors
    ///
    /// [`PipeError::PipesExhausted`] when all 256 local ids are in use.
    pub fn rent(&self) -> Result<Arc<Pipe>, PipeError> {
        let local_id = self.allocate_id()?;
        let pipe = self.pool.rent();
        pipe.setup(PipeBinding {
            link: Arc::clone(&self.link),
            config: self.config,
            role: self.role,
            local_id,
            full_id: None,
            locally_initiated: true,
        });
        self.initializing.insert(
            local_id,
            PipeEntry {
                pipe: Arc::clone(&pipe),
                generation: pipe.generation(),
            },
        );
        metrics::inc_pipes();
        debug!(local_id, "pipe rented");
        Ok(pipe)
    }

    /// Accept a pipe the peer opened, identified by the peer's local id.
    ///
    /// Packs the combined id, indexes the pipe as active and sends the
    /// ready notification back; the returned pipe is immediately usable.
    ///
    /// # Errors
    ///
    /// [`PipeError::PipesExhausted`] when all 256 local ids are in use.
    pub async fn register(&self, peer_local_id: u8) -> Result<Arc<Pipe>, PipeError> {
        let local_id = self.allocate_id()?;
        let full_id = match self.role {
            Role::Server => PipeId::pack(peer_local_id, local_id),
            Role::Client => PipeId::pack(local_id, peer_local_id),
        };
        let pipe = self.pool.rent();
        pipe.setup(PipeBinding {
            link: Arc::clone(&self.link),
            config: self.config,
            role: self.role,
            local_id,
            full_id: Some(full_id),
            locally_initiated: false,
        });
        self.active.insert(
            full_id,
            PipeEntry {
                pipe: Arc::clone(&pipe),
                generation: pipe.generation(),
            },
        );
        metrics::inc_pipes();
        debug!(pipe = %full_id, "pipe registered");
        if pipe.shared().update_state(PipeFlags::READY, false) {
            pipe.shared().send_state_update().await;
        }
        Ok(pipe)
    }

    /// Demultiplex inbound data bytes to the addressed pipe's reader.
    ///
    /// Unknown or generation-mismatched ids are expected under recycling
    /// races: logged and dropped, never escalated.
    pub fn route_data(&self, id: PipeId, bytes: Bytes) -> BufferStatus {
        let Some(entry) = self.active.get(&id) else {
            debug!(pipe = %id, "data for unknown pipe dropped");
            metrics::inc_stale_drops();
            return BufferStatus::Buffered;
        };
        if !entry.current() {
            debug!(pipe = %id, "data for recycled pipe dropped");
            metrics::inc_stale_drops();
            return BufferStatus::Buffered;
        }
        let status = entry.pipe.input().buffer_data(bytes);
        if status == BufferStatus::HighCutoffReached {
            warn!(pipe = %id, "inbound cutoff reached; data dropped and pipe should be torn down");
        }
        status
    }

    /// Apply a peer state update to the addressed pipe.
    ///
    /// A miss in the active map is retried against the initializing map by
    /// this side's half of the id: the first state message back for a
    /// self-initiated pipe carries its combined id and promotes it.
    pub fn route_state_update(&self, id: PipeId, flags: PipeFlags) {
        if let Some(entry) = self.active.get(&id) {
            if entry.current() {
                let pipe = Arc::clone(&entry.pipe);
                drop(entry);
                pipe.shared().apply_remote(flags);
            } else {
                debug!(pipe = %id, "state update for recycled pipe dropped");
                metrics::inc_stale_drops();
            }
            return;
        }

        let local_half = id.local_half(self.role);
        let Some((_, entry)) = self.initializing.remove(&local_half) else {
            debug!(pipe = %id, "state update for unknown pipe dropped");
            metrics::inc_stale_drops();
            return;
        };
        if !entry.current() {
            debug!(pipe = %id, "state update for recycled pipe dropped");
            metrics::inc_stale_drops();
            return;
        }
        entry.pipe.shared().set_full_id(id);
        entry.pipe.shared().apply_remote(flags);
        debug!(pipe = %id, "pipe promoted to active");
        self.active.insert(id, entry);
    }

    /// Caller-initiated teardown: complete the pipe, notify the peer, and
    /// recycle it.
    pub async fn return_pipe(&self, pipe: &Arc<Pipe>) {
        if pipe.shared().update_state(PipeFlags::COMPLETE, false) {
            pipe.shared().send_state_update().await;
        }
        self.recycle(pipe);
    }

    /// Peer-driven teardown: the peer already knows, so complete locally
    /// without a notification and recycle.
    pub fn deregister(&self, pipe: &Arc<Pipe>) {
        pipe.shared().force_complete_local();
        self.recycle(pipe);
    }

    /// Session teardown: force every tracked, generation-current pipe to
    /// complete and clear both maps.
    ///
    /// Ids and pooled objects are deliberately not freed here; the
    /// in-flight completion paths own that, which avoids racing a still
    /// draining reader or writer.
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            if entry.current() {
                entry.pipe.shared().force_complete_local();
            }
        }
        for entry in self.initializing.iter() {
            if entry.current() {
                entry.pipe.shared().force_complete_local();
            }
        }
        self.active.clear();
        self.initializing.clear();
        debug!("all pipes canceled");
    }

    /// Number of local ids currently handed out.
    #[must_use]
    pub fn ids_in_use(&self) -> usize {
        self.ids.lock().expect("id allocator lock poisoned").in_use()
    }

    fn allocate_id(&self) -> Result<u8, PipeError> {
        self.ids
            .lock()
            .expect("id allocator lock poisoned")
            .allocate()
            .ok_or(PipeError::PipesExhausted)
    }

    fn recycle(&self, pipe: &Arc<Pipe>) {
        let generation = pipe.generation();
        let Some(local_id) = pipe.local_id() else {
            debug!("return of an unattached pipe ignored");
            return;
        };
        let mut owned = false;
        if let Some(full_id) = pipe.id() {
            owned |= self
                .active
                .remove_if(&full_id, |_, entry| entry.generation == generation)
                .is_some();
        }
        owned |= self
            .initializing
            .remove_if(&local_id, |_, entry| entry.generation == generation)
            .is_some();
        if !owned {
            // Already dropped from the maps by cancel_all; the recycle still
            // owns freeing the id and returning the object.
            debug!(local_id, "recycling untracked pipe");
        }
        self.ids
            .lock()
            .expect("id allocator lock poisoned")
            .release(local_id);
        pipe.reset();
        self.pool.give_back(Arc::clone(pipe));
        metrics::dec_pipes();
    }
}
