//! End-to-end transfer driver.
//!
//! Every share or receive becomes one spawned session task that owns all of
//! its state (tracker, link manager, phase) and reacts to relay frames, link
//! events and timers from a single `select!` loop. The orchestrator only
//! keeps handles to those tasks, keyed by session id.

mod events;
mod host;
mod receiver;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use limeshare_crypto::{collect_keystream, generate_local, session_id_for, SplitKeyCipher};
use limeshare_types::{PeerId, Role, SessionId, SessionInfo, ShareLink};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SwarmConfig;
use crate::error::TransferError;
use crate::links::{LinkError, PeerLinkManager};
use crate::transport::SwarmTransport;

pub use events::{
    swarm_counts, CompletedTransfer, SourceAccounting, TransferEvent, TransferProgress, TransferStage,
};

use events::EventSink;
use host::HostSession;
use receiver::ReceiverSession;

/// Keystream B as carried over a peer link, inside JSON control frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
enum KeyEnvelope {
    #[serde(rename = "vernam_keyB_start")]
    Start { count: u32 },
    #[serde(rename = "vernam_keyB_chunk")]
    Chunk { index: u32, data: String },
}

fn key_start_envelope(count: u32) -> serde_json::Value {
    serde_json::json!({ "type": "vernam_keyB_start", "count": count })
}

fn key_chunk_envelope(index: u32, key: &[u8]) -> serde_json::Value {
    use base64::Engine;
    let data = base64::engine::general_purpose::STANDARD.encode(key);
    serde_json::json!({ "type": "vernam_keyB_chunk", "index": index, "data": data })
}

/// Send a have-list to one peer without exceeding `batch` indices per frame.
fn announce_in_batches(
    links: &mut PeerLinkManager,
    peer: &PeerId,
    have: &[u32],
    batch: usize,
) -> Result<(), LinkError> {
    for part in have.chunks(batch.max(1)) {
        links.announce_to(peer, part)?;
    }
    Ok(())
}

/// Handle returned by `share` and `receive`.
#[derive(Debug)]
pub struct TransferSession {
    pub id: SessionId,
    pub link: ShareLink,
    pub role: Role,
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
}

struct SessionHandle {
    role: Role,
    /// Set once a receiver has the whole file (hosts start out complete).
    completed: Arc<AtomicBool>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn is_busy(&self) -> bool {
        !self.task.is_finished() && !self.completed.load(Ordering::Acquire)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

pub struct TransferOrchestrator {
    transport: Arc<dyn SwarmTransport>,
    config: SwarmConfig,
    cipher: SplitKeyCipher,
    sessions: HashMap<SessionId, SessionHandle>,
}

impl TransferOrchestrator {
    pub fn new(transport: impl SwarmTransport, config: SwarmConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            cipher: SplitKeyCipher::default(),
            sessions: HashMap::new(),
        }
    }

    /// Use a specific combine kernel instead of the default.
    pub fn with_cipher(mut self, cipher: SplitKeyCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Ids of sessions whose task is still running.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Start hosting `data`.
    ///
    /// Both keystreams are in hand before the relay room is joined, so a
    /// key-acquisition failure returns here without any frame having been
    /// sent.
    pub async fn share(&mut self, name: impl Into<String>, data: Bytes) -> Result<TransferSession, TransferError> {
        let name = name.into();
        if data.is_empty() {
            return Err(TransferError::EmptyFile);
        }

        let (tx, events) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.progress(TransferStage::Hashing, 0.0, SourceAccounting::default());

        let id = session_id_for(&data);
        if let Some(existing) = self.sessions.get(&id) {
            if !existing.task.is_finished() {
                return Err(match existing.role {
                    Role::Host => TransferError::AlreadySharing(id),
                    Role::Receiver => TransferError::ReceiveInProgress(id),
                });
            }
        }
        self.close(&id).await;

        let size = data.len() as u64;
        let info = SessionInfo::new(id.clone(), name.clone(), size, self.config.chunk_size, Role::Host)
            .filter(|info| info.total_chunks <= self.config.max_chunks)
            .ok_or(TransferError::FileTooLarge {
                size,
                max_chunks: self.config.max_chunks,
            })?;
        info!(session = %id, name = %info.name, size = info.total_size, chunks = info.total_chunks, "sharing file");

        sink.progress(TransferStage::Keys, 0.0, SourceAccounting::default());
        let key_a = generate_local(info.total_size, info.chunk_size);
        let provider = self.transport.open_keystream(info.total_size, info.chunk_size).await?;
        let key_b = collect_keystream(provider, info.total_size, info.chunk_size).await?;
        key_b.validate(info.total_size, info.chunk_size)?;
        sink.progress(TransferStage::Keys, 100.0, SourceAccounting::default());

        let relay = self.transport.open_relay(id.room()).await?;
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let links = PeerLinkManager::new(self.transport.link_backend(link_tx), relay.sender.clone());

        let host = HostSession::new(
            info,
            data,
            key_a,
            key_b,
            self.cipher.clone(),
            self.config.clone(),
            relay.sender,
            links,
            sink,
        );
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(host.run(relay.inbound, link_rx, shutdown_rx));

        self.sessions.insert(
            id.clone(),
            SessionHandle {
                role: Role::Host,
                completed: Arc::new(AtomicBool::new(true)),
                shutdown,
                task,
            },
        );

        Ok(TransferSession {
            link: ShareLink::new(id.clone(), name),
            id,
            role: Role::Host,
            events,
        })
    }

    /// Start receiving the file behind `link`.
    ///
    /// One receive per session id at a time. A receive that already finished
    /// or completed (and is only seeding) is torn down and replaced.
    pub async fn receive(&mut self, link: &str) -> Result<TransferSession, TransferError> {
        let link: ShareLink = link.parse()?;
        let id = link.session_id.clone();

        if let Some(existing) = self.sessions.get(&id) {
            match existing.role {
                Role::Host if !existing.task.is_finished() => return Err(TransferError::AlreadySharing(id)),
                Role::Receiver if existing.is_busy() => return Err(TransferError::ReceiveInProgress(id)),
                _ => {}
            }
        }
        self.close(&id).await;

        info!(session = %id, name = %link.file_name, "joining swarm");
        let (tx, events) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.progress(TransferStage::Connecting, 0.0, SourceAccounting::default());

        let relay = self.transport.open_relay(id.room()).await?;
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let links = PeerLinkManager::new(self.transport.link_backend(link_tx), relay.sender.clone());

        let completed = Arc::new(AtomicBool::new(false));
        let receiver = ReceiverSession::new(
            link.clone(),
            self.cipher.clone(),
            self.config.clone(),
            relay.sender,
            links,
            sink,
            completed.clone(),
        );
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(receiver.run(relay.inbound, link_rx, shutdown_rx));

        self.sessions.insert(
            id.clone(),
            SessionHandle {
                role: Role::Receiver,
                completed,
                shutdown,
                task,
            },
        );

        Ok(TransferSession {
            id,
            link,
            role: Role::Receiver,
            events,
        })
    }

    /// Tear a session down: links, relay and tracker go with its task.
    /// Returns whether the session existed.
    pub async fn close(&mut self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some(handle) => {
                debug!(session = %id, "closing session");
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        for (id, handle) in self.sessions.drain() {
            debug!(session = %id, "closing session");
            handle.stop().await;
        }
    }
}
