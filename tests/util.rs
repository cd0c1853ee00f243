//! Shared test doubles for the integration suite.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wirepipe::{
    MessageKind, PipeFlags, PipeId, PipeManager, SendError, SessionLink, WatermarkConfig,
};

/// One message captured by [`RecordingLink`].
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub kind: MessageKind,
    pub id: PipeId,
    pub payload: Bytes,
}

impl SentMessage {
    /// Decode a state-update payload back into flags.
    pub fn flags(&self) -> PipeFlags {
        assert_eq!(self.kind, MessageKind::StateUpdate);
        PipeFlags::from_bits_truncate(self.payload[0])
    }
}

/// Fault injected into upcoming `send_message` calls, oldest first.
#[derive(Clone, Copy, Debug)]
pub enum InjectedFault {
    ConnectionClosed,
    Canceled,
    Transport,
}

/// Session double that records every outbound message on a channel.
pub struct RecordingLink {
    server_side: bool,
    sent: mpsc::UnboundedSender<SentMessage>,
    faults: Mutex<VecDeque<InjectedFault>>,
    terminations: AtomicUsize,
}

impl RecordingLink {
    pub fn new(server_side: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<SentMessage>) {
        let (sent, received) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                server_side,
                sent,
                faults: Mutex::new(VecDeque::new()),
                terminations: AtomicUsize::new(0),
            }),
            received,
        )
    }

    /// Queue a fault for an upcoming send.
    pub fn inject_fault(&self, fault: InjectedFault) {
        self.faults
            .lock()
            .expect("fault queue lock poisoned")
            .push_back(fault);
    }

    /// How many times the layer asked for session termination.
    pub fn terminations(&self) -> usize { self.terminations.load(Ordering::SeqCst) }
}

#[async_trait]
impl SessionLink for RecordingLink {
    fn is_server_side(&self) -> bool { self.server_side }

    async fn send_message(
        &self,
        kind: MessageKind,
        id: PipeId,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        if cancel.is_cancelled() {
            return Err(SendError::Canceled);
        }
        if let Some(fault) = self
            .faults
            .lock()
            .expect("fault queue lock poisoned")
            .pop_front()
        {
            return Err(match fault {
                InjectedFault::ConnectionClosed => SendError::ConnectionClosed,
                InjectedFault::Canceled => SendError::Canceled,
                InjectedFault::Transport => {
                    SendError::Transport(std::io::Error::other("wire torn"))
                }
            });
        }
        let _ = self.sent.send(SentMessage { kind, id, payload });
        Ok(())
    }

    fn request_termination(&self, _reason: &str) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Watermarks sized for tests: low 20, high 80, cutoff 200, 64-byte chunks.
pub fn test_config() -> WatermarkConfig {
    WatermarkConfig::new(20, 80, 200, NonZeroUsize::new(64).expect("non-zero"))
        .expect("ordered marks")
}

/// A manager over a [`RecordingLink`] plus the captured-message receiver.
pub fn recording_manager(
    server_side: bool,
    config: WatermarkConfig,
) -> (
    Arc<PipeManager>,
    Arc<RecordingLink>,
    mpsc::UnboundedReceiver<SentMessage>,
) {
    let (link, received) = RecordingLink::new(server_side);
    let manager = Arc::new(PipeManager::new(
        Arc::clone(&link) as Arc<dyn SessionLink>,
        config,
    ));
    (manager, link, received)
}

/// Session double that feeds messages straight into the peer's manager.
pub struct PairLink {
    server_side: bool,
    peer: OnceLock<Arc<PipeManager>>,
}

impl PairLink {
    fn new(server_side: bool) -> Arc<Self> {
        Arc::new(Self {
            server_side,
            peer: OnceLock::new(),
        })
    }
}

#[async_trait]
impl SessionLink for PairLink {
    fn is_server_side(&self) -> bool { self.server_side }

    async fn send_message(
        &self,
        kind: MessageKind,
        id: PipeId,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        if cancel.is_cancelled() {
            return Err(SendError::Canceled);
        }
        let peer = self.peer.get().expect("peer manager wired");
        match kind {
            MessageKind::Data => {
                peer.route_data(id, payload);
            }
            MessageKind::StateUpdate => {
                peer.route_state_update(id, PipeFlags::from_bits_truncate(payload[0]));
            }
        }
        Ok(())
    }

    fn request_termination(&self, _reason: &str) {}
}

/// Client and server managers wired back to back in memory.
pub fn duplex_pair(config: WatermarkConfig) -> (Arc<PipeManager>, Arc<PipeManager>) {
    let client_link = PairLink::new(false);
    let server_link = PairLink::new(true);
    let client = Arc::new(PipeManager::new(
        Arc::clone(&client_link) as Arc<dyn SessionLink>,
        config,
    ));
    let server = Arc::new(PipeManager::new(
        Arc::clone(&server_link) as Arc<dyn SessionLink>,
        config,
    ));
    client_link
        .peer
        .set(Arc::clone(&server))
        .unwrap_or_else(|_| panic!("peer already wired"));
    server_link
        .peer
        .set(Arc::clone(&client))
        .unwrap_or_else(|_| panic!("peer already wired"));
    (client, server)
}
