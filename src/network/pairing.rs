//! Pairing Queue
//!
//! Single-slot matchmaking. The slot is owned by one task; `arrive` and
//! `remove` are commands on its channel, so they apply in the order they
//! are received.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::{ConnectionId, Identity, RoomId};
use crate::network::protocol::{MatchmakingResponse, MatchmakingStatus, ServerMessage};
use crate::network::registry::try_notify;
use crate::network::session::{Participant, Room, RoomError, RoomManager};

// =============================================================================
// WAITING SLOT
// =============================================================================

/// Result of an arrival at the slot.
#[derive(Debug)]
pub enum ArriveOutcome {
    /// Slot was empty; the arrival now waits.
    Waiting,
    /// The arrival was already the waiting connection.
    AlreadyWaiting,
    /// The waiting connection shares the arrival's identity and was
    /// displaced by it.
    Replaced {
        /// Connection that lost the slot.
        displaced: Participant,
    },
    /// Paired; the slot is empty again.
    Paired {
        /// Earlier arrival.
        white: Participant,
        /// The arrival.
        black: Participant,
    },
}

/// At most one connection waiting for an opponent.
#[derive(Debug, Default)]
pub struct WaitingSlot {
    waiter: Option<Participant>,
}

impl WaitingSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a connection to the slot.
    pub fn arrive(&mut self, arrival: Participant) -> ArriveOutcome {
        match self.waiter.take() {
            None => {
                self.waiter = Some(arrival);
                ArriveOutcome::Waiting
            }
            Some(waiting) if waiting.connection == arrival.connection => {
                self.waiter = Some(waiting);
                ArriveOutcome::AlreadyWaiting
            }
            Some(waiting) if waiting.identity == arrival.identity => {
                self.waiter = Some(arrival);
                ArriveOutcome::Replaced { displaced: waiting }
            }
            Some(waiting) => ArriveOutcome::Paired {
                white: waiting,
                black: arrival,
            },
        }
    }

    /// Clear the slot if it holds `connection`.
    pub fn remove(&mut self, connection: &ConnectionId) -> Option<Participant> {
        match &self.waiter {
            Some(w) if &w.connection == connection => self.waiter.take(),
            _ => None,
        }
    }

    /// The waiting connection.
    pub fn waiting(&self) -> Option<&Participant> {
        self.waiter.as_ref()
    }

    /// Whether nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiter.is_none()
    }
}

// =============================================================================
// PAIRING QUEUE
// =============================================================================

/// What an arrival led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// Waiting for an opponent.
    Waiting,
    /// Seated in a new room.
    Paired(RoomId),
}

/// Pairing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// Identity is seated in an active room.
    #[error("{0} is already in an active room")]
    AlreadyInMatch(Identity),
    /// Room could not be opened.
    #[error("room error: {0}")]
    Room(#[from] RoomError),
    /// Queue task is gone.
    #[error("pairing queue closed")]
    Closed,
}

enum Command {
    Arrive {
        participant: Participant,
        reply: oneshot::Sender<Result<Arrival, PairingError>>,
    },
    Remove {
        connection: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Waiting {
        reply: oneshot::Sender<Option<(ConnectionId, Identity)>>,
    },
}

/// Handle to the pairing task. Cheap to clone.
#[derive(Clone)]
pub struct PairingQueue {
    tx: mpsc::Sender<Command>,
}

impl PairingQueue {
    /// Spawn the pairing task. Paired rooms are opened in `rooms`.
    pub fn spawn(rooms: Arc<RoomManager>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_queue(rooms, rx));
        Self { tx }
    }

    /// Seek an opponent. The room, if any, is registered before this
    /// returns.
    pub async fn arrive(&self, participant: Participant) -> Result<Arrival, PairingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Arrive { participant, reply })
            .await
            .map_err(|_| PairingError::Closed)?;
        rx.await.map_err(|_| PairingError::Closed)?
    }

    /// Withdraw `connection` from the slot. Returns true if it was waiting.
    pub async fn remove(&self, connection: ConnectionId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Remove { connection, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// The waiting connection, if any.
    pub async fn waiting(&self) -> Option<(ConnectionId, Identity)> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Waiting { reply }).await.ok()?;
        rx.await.ok().flatten()
    }
}

async fn run_queue(rooms: Arc<RoomManager>, mut rx: mpsc::Receiver<Command>) {
    let mut slot = WaitingSlot::new();
    debug!("Pairing queue started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Arrive { participant, reply } => {
                let result = handle_arrive(&rooms, &mut slot, participant).await;
                let _ = reply.send(result);
            }
            Command::Remove { connection, reply } => {
                let removed = slot.remove(&connection).is_some();
                if removed {
                    debug!("Connection {} left the waiting slot", connection.short());
                }
                let _ = reply.send(removed);
            }
            Command::Waiting { reply } => {
                let _ = reply.send(
                    slot.waiting()
                        .map(|w| (w.connection, w.identity.clone())),
                );
            }
        }
    }

    debug!("Pairing queue stopped");
}

async fn handle_arrive(
    rooms: &RoomManager,
    slot: &mut WaitingSlot,
    participant: Participant,
) -> Result<Arrival, PairingError> {
    if rooms.active_room_for(&participant.identity).await.is_some() {
        return Err(PairingError::AlreadyInMatch(participant.identity));
    }

    let notify = participant.sender.clone();
    match slot.arrive(participant) {
        ArriveOutcome::Waiting | ArriveOutcome::AlreadyWaiting => {
            try_notify(&notify, ServerMessage::Waiting);
            Ok(Arrival::Waiting)
        }
        ArriveOutcome::Replaced { displaced } => {
            info!(
                "{} re-queued from another connection; superseding {}",
                displaced.identity,
                displaced.connection.short()
            );
            try_notify(
                &displaced.sender,
                ServerMessage::Matchmaking(MatchmakingResponse {
                    status: MatchmakingStatus::Superseded,
                }),
            );
            try_notify(&notify, ServerMessage::Waiting);
            Ok(Arrival::Waiting)
        }
        ArriveOutcome::Paired { white, black } => {
            let white_sender = white.sender.clone();
            let room = Room::new(white, black)?;
            match rooms.open_room(room).await {
                Ok(id) => Ok(Arrival::Paired(id)),
                Err(e) => {
                    // White left the slot already; tell it so it can re-queue.
                    warn!("Failed to open room: {}", e);
                    try_notify(
                        &white_sender,
                        ServerMessage::Matchmaking(MatchmakingResponse {
                            status: MatchmakingStatus::Cancelled,
                        }),
                    );
                    Err(e.into())
                }
            }
        }
    }
}
