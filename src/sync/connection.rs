//! Owner of the single real-time connection.
//!
//! Consumers never touch the transport directly: they call `connect`,
//! `disconnect` and the `join_*_room` methods, observe [`ConnectionState`]
//! through a `watch` channel, and receive inbound events through
//! [`ConnectionManager::subscribe`].

use crate::backend::types::{InboundFrame, OutboundFrame, Room};
use crate::backend::PushTransport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Room currently joined on the server.
    pub room: Option<Room>,
    /// Room requested while not connected, joined on the next connect.
    pub pending_room: Option<Room>,
    pub consecutive_failures: u32,
}

/// A raw event delivered by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub name: String,
    pub data: serde_json::Value,
}

impl PushEvent {
    pub fn new(name: &str, data: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            data,
        }
    }
}

/// Everything a consumer can observe from the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Push(PushEvent),
    /// An established link went away.
    ConnectionLost(String),
    /// Opening the link failed.
    ConnectionError(String),
}

#[derive(Default)]
struct LinkSlot {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    task: Option<JoinHandle<()>>,
    /// How many consumers joined each room and have not released it yet.
    holders: HashMap<Room, usize>,
}

struct Shared {
    transport: Arc<dyn PushTransport>,
    user_id: String,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SyncEvent>,
    link: Mutex<LinkSlot>,
}

/// Cheaply cloneable handle. Create one per application and inject it.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>, user_id: &str) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                transport,
                user_id: user_id.to_string(),
                state_tx,
                events,
                link: Mutex::new(LinkSlot::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state_tx.borrow().status
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    fn lock_slot(&self) -> MutexGuard<'_, LinkSlot> {
        self.shared
            .link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: SyncEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.shared.events.send(event);
    }

    /// Open the connection. No-op while connecting or connected.
    pub fn connect(&self) {
        let mut slot = self.lock_slot();
        if self.status() != ConnectionStatus::Disconnected {
            return;
        }
        slot.generation += 1;
        let generation = slot.generation;
        self.shared
            .state_tx
            .send_modify(|s| s.status = ConnectionStatus::Connecting);
        tracing::debug!(generation, "push channel connecting");

        let this = self.clone();
        slot.task = Some(tokio::spawn(async move {
            this.run_link(generation).await;
        }));
    }

    /// Tear the connection down and forget any room. Idempotent.
    pub fn disconnect(&self) {
        let mut slot = self.lock_slot();
        slot.generation += 1;
        slot.outbound = None;
        slot.holders.clear();
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        let changed = self.shared.state_tx.send_if_modified(|s| {
            let changed = s.status != ConnectionStatus::Disconnected
                || s.room.is_some()
                || s.pending_room.is_some();
            s.status = ConnectionStatus::Disconnected;
            s.room = None;
            s.pending_room = None;
            changed
        });
        if changed {
            tracing::info!("push channel disconnected");
        }
    }

    pub fn join_execution_room(&self, execution_id: &str) {
        self.join_room(Room::Execution(execution_id.to_string()));
    }

    pub fn join_content_room(&self, content_id: &str) {
        self.join_room(Room::Content(content_id.to_string()));
    }

    pub fn join_workflow_room(&self, workflow_id: &str) {
        self.join_room(Room::Workflow(workflow_id.to_string()));
    }

    /// Scope the connection to `room`, leaving the previous one first.
    /// Remembered and replayed if the connection is not up yet. Each join
    /// is one hold on the room; pair it with [`release_room`](Self::release_room).
    pub fn join_room(&self, room: Room) {
        let mut slot = self.lock_slot();
        *slot.holders.entry(room.clone()).or_default() += 1;
        let mut frames = Vec::new();
        self.shared.state_tx.send_if_modified(|s| {
            if s.status == ConnectionStatus::Connected {
                if s.room.as_ref() == Some(&room) {
                    return false;
                }
                if let Some(old) = s.room.take() {
                    frames.push(OutboundFrame::Leave(old));
                }
                frames.push(OutboundFrame::Join(room.clone()));
                s.room = Some(room.clone());
            } else {
                if s.pending_room.as_ref() == Some(&room) {
                    return false;
                }
                tracing::debug!(room = %room, "room join deferred until connected");
                s.pending_room = Some(room.clone());
            }
            true
        });
        Self::send_frames(&slot, frames);
    }

    /// True while any consumer holds a room.
    pub fn is_held(&self) -> bool {
        !self.lock_slot().holders.is_empty()
    }

    /// Release the current room and any pending one.
    pub fn leave_room(&self) {
        let mut slot = self.lock_slot();
        slot.holders.clear();
        let mut frames = Vec::new();
        self.shared.state_tx.send_if_modified(|s| {
            let had_pending = s.pending_room.take().is_some();
            match s.room.take() {
                Some(room) => {
                    frames.push(OutboundFrame::Leave(room));
                    true
                }
                None => had_pending,
            }
        });
        Self::send_frames(&slot, frames);
    }

    /// Drop one hold on `room`. The room is left once nobody holds it, and
    /// only if it is still the current or pending one.
    pub fn release_room(&self, room: &Room) {
        let mut slot = self.lock_slot();
        if let Some(count) = slot.holders.get_mut(room) {
            *count = count.saturating_sub(1);
            if *count > 0 {
                tracing::debug!(room = %room, holders = *count, "room still held");
                return;
            }
            slot.holders.remove(room);
        }
        let mut frames = Vec::new();
        self.shared.state_tx.send_if_modified(|s| {
            let mut changed = false;
            if s.pending_room.as_ref() == Some(room) {
                s.pending_room = None;
                changed = true;
            }
            if s.room.as_ref() == Some(room) {
                s.room = None;
                frames.push(OutboundFrame::Leave(room.clone()));
                changed = true;
            }
            changed
        });
        Self::send_frames(&slot, frames);
    }

    fn send_frames(slot: &LinkSlot, frames: Vec<OutboundFrame>) {
        let Some(outbound) = &slot.outbound else {
            return;
        };
        for frame in frames {
            if outbound.send(frame).is_err() {
                tracing::warn!("push channel closed before room change was sent");
                return;
            }
        }
    }

    async fn run_link(self, generation: u64) {
        let opened = self.shared.transport.open(&self.shared.user_id).await;
        let mut link = match opened {
            Ok(link) => link,
            Err(e) => {
                let message = format!("{:#}", e);
                {
                    let mut slot = self.lock_slot();
                    if slot.generation != generation {
                        return;
                    }
                    slot.task = None;
                    self.shared.state_tx.send_modify(|s| {
                        s.status = ConnectionStatus::Disconnected;
                        s.consecutive_failures += 1;
                    });
                }
                tracing::warn!(error = %message, "push channel connect failed");
                self.publish(SyncEvent::ConnectionError(message));
                return;
            }
        };

        {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                // disconnect() won the race; dropping the link closes it
                return;
            }
            let mut replay = None;
            self.shared.state_tx.send_modify(|s| {
                s.status = ConnectionStatus::Connected;
                s.consecutive_failures = 0;
                if let Some(room) = s.pending_room.take() {
                    s.room = Some(room.clone());
                    replay = Some(room);
                }
            });
            if let Some(room) = replay {
                tracing::debug!(room = %room, "replaying pending room join");
                let _ = link.outbound.send(OutboundFrame::Join(room));
            }
            slot.outbound = Some(link.outbound.clone());
        }
        tracing::info!(user_id = %self.shared.user_id, "push channel connected");
        self.publish(SyncEvent::Connected);

        while let Some(frame) = link.inbound.recv().await {
            match frame {
                InboundFrame::Event { name, data } => {
                    tracing::trace!(event = %name, "push event");
                    self.publish(SyncEvent::Push(PushEvent { name, data }));
                }
                InboundFrame::Closed(reason) => {
                    let reason = reason.unwrap_or_else(|| "closed".to_string());
                    self.on_link_lost(generation, reason);
                    return;
                }
            }
        }
        self.on_link_lost(generation, "push channel closed".to_string());
    }

    fn on_link_lost(&self, generation: u64, reason: String) {
        {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                return;
            }
            slot.outbound = None;
            slot.task = None;
            // Nothing server-side survives a drop: re-join on the next connect.
            self.shared.state_tx.send_modify(|s| {
                s.status = ConnectionStatus::Disconnected;
                if let Some(room) = s.room.take() {
                    s.pending_room.get_or_insert(room);
                }
            });
        }
        tracing::warn!(reason = %reason, "push channel lost");
        self.publish(SyncEvent::ConnectionLost(reason));
    }
}
