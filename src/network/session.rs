//! Room Management
//!
//! A room binds exactly two paired connections. It relays moves and chat
//! between them, resolves the reported outcome, and hands the result to
//! the rating ledger exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::{
    ConnectionId, Identity, MatchOutcome, MatchRecord, ReportedOutcome, Role, RoomId,
};
use crate::network::protocol::{
    EndReason, MatchEndInfo, MovePayload, PairedInfo, ServerMessage,
};
use crate::network::registry::{try_notify, ClientSender};
use crate::rating::RatingLedger;

/// Room lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Game in progress; relay open.
    Active,
    /// Outcome resolved (or room abandoned); kept until cleanup.
    Concluded,
}

/// Configuration for rooms.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How long a disconnected member has before forfeiting. None disables
    /// forfeiture.
    pub forfeit_timeout: Option<Duration>,
    /// How long a concluded room stays addressable before cleanup.
    pub concluded_retention: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            forfeit_timeout: Some(Duration::from_secs(60)),
            concluded_retention: Duration::from_secs(30),
        }
    }
}

impl RoomConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let forfeit_timeout = match std::env::var("FORFEIT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.forfeit_timeout,
        };
        Self {
            forfeit_timeout,
            concluded_retention: std::env::var("CONCLUDED_RETENTION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.concluded_retention),
        }
    }
}

/// A connection entering a room.
#[derive(Debug, Clone)]
pub struct Participant {
    /// Connection id.
    pub connection: ConnectionId,
    /// Resolved identity.
    pub identity: Identity,
    /// Outbound channel.
    pub sender: ClientSender,
}

/// One of the two seats of a room.
#[derive(Debug)]
pub struct Seat {
    /// Seated connection.
    pub connection: ConnectionId,
    /// Seated identity.
    pub identity: Identity,
    /// White or Black.
    pub role: Role,
    /// When the connection dropped, if it did.
    pub disconnected_at: Option<Instant>,
    sender: ClientSender,
}

impl Seat {
    fn new(participant: Participant, role: Role) -> Self {
        Self {
            connection: participant.connection,
            identity: participant.identity,
            role,
            disconnected_at: None,
            sender: participant.sender,
        }
    }

    /// Check if the seated connection is still up.
    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }
}

/// A paired 1v1 session.
#[derive(Debug)]
pub struct Room {
    /// Room id.
    pub id: RoomId,
    /// Current state.
    pub state: RoomState,
    /// First seat.
    pub white: Seat,
    /// Second seat.
    pub black: Seat,
    /// Persisted outcome; None while active or if abandoned.
    pub outcome: Option<MatchOutcome>,
    /// When the room was created.
    pub created_at: Instant,
    /// When the room concluded.
    pub concluded_at: Option<Instant>,
}

impl Room {
    /// Seat `white` and `black`. Their identities must differ.
    pub fn new(white: Participant, black: Participant) -> Result<Self, RoomError> {
        if white.identity == black.identity {
            return Err(RoomError::SameIdentity(white.identity));
        }
        Ok(Self {
            id: RoomId::from_pair(white.connection, black.connection),
            state: RoomState::Active,
            white: Seat::new(white, Role::White),
            black: Seat::new(black, Role::Black),
            outcome: None,
            created_at: Instant::now(),
            concluded_at: None,
        })
    }

    /// Whether the room is still relaying.
    pub fn is_active(&self) -> bool {
        self.state == RoomState::Active
    }

    /// Seat held by `connection`.
    pub fn seat_of(&self, connection: &ConnectionId) -> Option<&Seat> {
        if &self.white.connection == connection {
            Some(&self.white)
        } else if &self.black.connection == connection {
            Some(&self.black)
        } else {
            None
        }
    }

    fn seat_of_mut(&mut self, connection: &ConnectionId) -> Option<&mut Seat> {
        if &self.white.connection == connection {
            Some(&mut self.white)
        } else if &self.black.connection == connection {
            Some(&mut self.black)
        } else {
            None
        }
    }

    /// The seat opposite `connection`'s.
    pub fn opponent_of(&self, connection: &ConnectionId) -> Option<&Seat> {
        match self.seat_of(connection)?.role {
            Role::White => Some(&self.black),
            Role::Black => Some(&self.white),
        }
    }

    /// Both seats, White first.
    pub fn seats(&self) -> [&Seat; 2] {
        [&self.white, &self.black]
    }

    /// Map a client report to a record outcome.
    pub fn resolve_outcome(&self, reported: &ReportedOutcome) -> Result<MatchOutcome, RoomError> {
        match reported {
            ReportedOutcome::Draw => Ok(MatchOutcome::Draw),
            ReportedOutcome::Winner(id) if id == &self.white.identity => Ok(MatchOutcome::AWin),
            ReportedOutcome::Winner(id) if id == &self.black.identity => Ok(MatchOutcome::BWin),
            ReportedOutcome::Winner(id) => Err(RoomError::InvalidOutcome(id.clone())),
        }
    }

    /// Transition to Concluded. Returns the record to persist, or None if
    /// the room had already concluded.
    pub fn conclude(&mut self, outcome: MatchOutcome) -> Option<MatchRecord> {
        if !self.is_active() {
            return None;
        }
        self.state = RoomState::Concluded;
        self.outcome = Some(outcome);
        self.concluded_at = Some(Instant::now());
        Some(MatchRecord::new(
            self.white.identity.clone(),
            self.black.identity.clone(),
            outcome,
        ))
    }

    /// Close without a result. Returns false if already concluded.
    fn abandon(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = RoomState::Concluded;
        self.concluded_at = Some(Instant::now());
        true
    }

    /// Mark a member's connection as gone. Returns false for non-members
    /// and repeated calls.
    pub fn mark_disconnected(&mut self, connection: &ConnectionId) -> bool {
        match self.seat_of_mut(connection) {
            Some(seat) if seat.is_connected() => {
                seat.disconnected_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Forfeit outcome if a member has been gone for `timeout` at `now`.
    /// When both are gone the earlier disconnect loses.
    pub fn forfeit_due(&self, timeout: Duration, now: Instant) -> Option<MatchOutcome> {
        if !self.is_active() {
            return None;
        }
        let loser = match (self.white.disconnected_at, self.black.disconnected_at) {
            (Some(w), Some(b)) => {
                if w <= b {
                    (Role::White, w)
                } else {
                    (Role::Black, b)
                }
            }
            (Some(w), None) => (Role::White, w),
            (None, Some(b)) => (Role::Black, b),
            (None, None) => return None,
        };
        if now.duration_since(loser.1) < timeout {
            return None;
        }
        Some(match loser.0 {
            Role::White => MatchOutcome::BWin,
            Role::Black => MatchOutcome::AWin,
        })
    }

    /// Both members gone.
    pub fn is_deserted(&self) -> bool {
        !self.white.is_connected() && !self.black.is_connected()
    }
}

/// Result of a conclude request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conclusion {
    /// The room concluded now; the record went to the ledger.
    Concluded(MatchRecord),
    /// The room had already concluded; nothing changed.
    AlreadyConcluded,
    /// Closed without a result.
    Abandoned,
}

/// Whether a relayed message reached the opponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the opponent's channel.
    Delivered,
    /// Opponent is disconnected; the message was dropped.
    PeerUnavailable,
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// Connection is not in an active room.
    #[error("no active room")]
    NoActiveRoom,
    /// Room does not exist.
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),
    /// Connection is not a member of the room.
    #[error("connection {0} is not a member of this room")]
    NotAMember(ConnectionId),
    /// Reported winner is not a member.
    #[error("{0} is not a member of this room")]
    InvalidOutcome(Identity),
    /// Both seats would share one identity.
    #[error("cannot pair {0} with itself")]
    SameIdentity(Identity),
    /// Identity is already seated in an active room.
    #[error("{0} is already in an active room")]
    AlreadyInMatch(Identity),
}

// =============================================================================
// ROOM MANAGER
// =============================================================================

/// Manages all rooms.
pub struct RoomManager {
    config: RoomConfig,
    /// All rooms, active and recently concluded.
    rooms: RwLock<BTreeMap<RoomId, Arc<RwLock<Room>>>>,
    /// Connection to its latest room.
    connection_rooms: RwLock<BTreeMap<ConnectionId, RoomId>>,
    /// Identity to its active room.
    identity_rooms: RwLock<BTreeMap<Identity, RoomId>>,
    ledger: RatingLedger,
}

impl RoomManager {
    /// Create a room manager reporting outcomes to `ledger`.
    pub fn new(config: RoomConfig, ledger: RatingLedger) -> Self {
        Self {
            config,
            rooms: RwLock::new(BTreeMap::new()),
            connection_rooms: RwLock::new(BTreeMap::new()),
            identity_rooms: RwLock::new(BTreeMap::new()),
            ledger,
        }
    }

    /// Room configuration.
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Register a freshly paired room and tell both members.
    pub async fn open_room(&self, room: Room) -> Result<RoomId, RoomError> {
        let id = room.id.clone();
        let white = (room.white.connection, room.white.identity.clone(), room.white.sender.clone());
        let black = (room.black.connection, room.black.identity.clone(), room.black.sender.clone());

        {
            let mut identity_rooms = self.identity_rooms.write().await;
            for identity in [&white.1, &black.1] {
                if identity_rooms.contains_key(identity) {
                    return Err(RoomError::AlreadyInMatch(identity.clone()));
                }
            }
            identity_rooms.insert(white.1.clone(), id.clone());
            identity_rooms.insert(black.1.clone(), id.clone());
        }
        {
            let mut connection_rooms = self.connection_rooms.write().await;
            connection_rooms.insert(white.0, id.clone());
            connection_rooms.insert(black.0, id.clone());
        }
        self.rooms
            .write()
            .await
            .insert(id.clone(), Arc::new(RwLock::new(room)));

        try_notify(
            &white.2,
            ServerMessage::Paired(PairedInfo {
                room_id: id.clone(),
                role: Role::White,
                opponent: black.1.clone(),
            }),
        );
        try_notify(
            &black.2,
            ServerMessage::Paired(PairedInfo {
                room_id: id.clone(),
                role: Role::Black,
                opponent: white.1.clone(),
            }),
        );

        info!("Opened room {} ({} vs {})", id, white.1, black.1);
        Ok(id)
    }

    /// Get a room by id.
    pub async fn get_room(&self, id: &RoomId) -> Option<Arc<RwLock<Room>>> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Latest room of a connection (may be concluded).
    pub async fn room_of(&self, connection: &ConnectionId) -> Option<RoomId> {
        self.connection_rooms.read().await.get(connection).cloned()
    }

    /// Active room an identity is seated in.
    pub async fn active_room_for(&self, identity: &Identity) -> Option<RoomId> {
        self.identity_rooms.read().await.get(identity).cloned()
    }

    /// Forward a move from `from` to the other member, verbatim.
    pub async fn relay_move(
        &self,
        room_id: &RoomId,
        from: ConnectionId,
        payload: MovePayload,
    ) -> Result<Delivery, RoomError> {
        let target = self.relay_target(room_id, &from).await?;
        Ok(deliver(target, ServerMessage::Move(payload)))
    }

    /// Forward a chat line from `from` to the other member.
    pub async fn relay_chat(
        &self,
        room_id: &RoomId,
        from: ConnectionId,
        text: String,
    ) -> Result<Delivery, RoomError> {
        let room = self.active_room(room_id).await?;
        let (sender_role, sender, target) = {
            let room = room.read().await;
            if !room.is_active() {
                return Err(RoomError::NoActiveRoom);
            }
            let seat = room.seat_of(&from).ok_or(RoomError::NotAMember(from))?;
            let opponent = room.opponent_of(&from).ok_or(RoomError::NotAMember(from))?;
            let target = opponent.is_connected().then(|| opponent.sender.clone());
            (seat.role, seat.identity.clone(), target)
        };
        Ok(deliver(target, ServerMessage::Chat { sender_role, sender, text }))
    }

    /// Resolve a member's `game_over` report.
    pub async fn conclude(
        &self,
        room_id: &RoomId,
        from: ConnectionId,
        reported: ReportedOutcome,
    ) -> Result<Conclusion, RoomError> {
        let room = self
            .get_room(room_id)
            .await
            .ok_or_else(|| RoomError::RoomNotFound(room_id.clone()))?;
        let outcome = {
            let room = room.read().await;
            if room.seat_of(&from).is_none() {
                return Err(RoomError::NotAMember(from));
            }
            if !room.is_active() {
                return Ok(Conclusion::AlreadyConcluded);
            }
            room.resolve_outcome(&reported)?
        };
        self.conclude_room(room_id, outcome, EndReason::Reported).await
    }

    /// Conclude a room with `outcome`. Idempotent: only the first call
    /// notifies members and reaches the ledger.
    pub async fn conclude_room(
        &self,
        room_id: &RoomId,
        outcome: MatchOutcome,
        reason: EndReason,
    ) -> Result<Conclusion, RoomError> {
        let room = self
            .get_room(room_id)
            .await
            .ok_or_else(|| RoomError::RoomNotFound(room_id.clone()))?;

        let (record, members) = {
            let mut room = room.write().await;
            let Some(record) = room.conclude(outcome) else {
                debug!("Room {} already concluded", room_id);
                return Ok(Conclusion::AlreadyConcluded);
            };
            let members: Vec<(Identity, ClientSender)> = room
                .seats()
                .iter()
                .map(|s| (s.identity.clone(), s.sender.clone()))
                .collect();
            (record, members)
        };

        self.release_identities(room_id, &record.player_a, &record.player_b).await;

        for (identity, sender) in &members {
            if let Some(result) = record.result_for(identity) {
                try_notify(
                    sender,
                    ServerMessage::MatchEnd(MatchEndInfo {
                        room_id: room_id.clone(),
                        winner: record.winner().cloned(),
                        result,
                        reason,
                    }),
                );
            }
        }

        info!("Room {} concluded: {:?} ({:?})", room_id, outcome, reason);

        // Queued here so records reach the ledger in conclusion order.
        let pending = match self.ledger.submit(record.clone()).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Ratings not updated for concluded room: {}", e);
                return Ok(Conclusion::Concluded(record));
            }
        };
        tokio::spawn(async move {
            match pending.await {
                Ok(Ok(receipt)) => {
                    for (identity, sender) in &members {
                        let change = if identity == &receipt.a.identity {
                            receipt.a.clone()
                        } else {
                            receipt.b.clone()
                        };
                        try_notify(sender, ServerMessage::RatingUpdate(change));
                    }
                }
                Ok(Err(e)) => warn!("Ratings not updated for concluded room: {}", e),
                Err(_) => warn!("Rating ledger dropped a concluded room"),
            }
        });

        Ok(Conclusion::Concluded(record))
    }

    /// A member's connection dropped. The room stays active; the opponent
    /// is told and the forfeit clock starts.
    pub async fn handle_disconnect(&self, connection: &ConnectionId) -> Option<RoomId> {
        let room_id = self.room_of(connection).await?;
        let room = self.get_room(&room_id).await?;

        let opponent = {
            let mut room = room.write().await;
            if !room.is_active() || !room.mark_disconnected(connection) {
                return None;
            }
            room.opponent_of(connection)
                .filter(|s| s.is_connected())
                .map(|s| s.sender.clone())
        };

        if let Some(sender) = opponent {
            try_notify(
                &sender,
                ServerMessage::OpponentDisconnected {
                    forfeit_in_secs: self.config.forfeit_timeout.map(|t| t.as_secs()),
                },
            );
        }

        info!("Member {} left active room {}", connection.short(), room_id);
        Some(room_id)
    }

    /// `connection` walks out of its active room; the opponent wins.
    pub async fn resign(&self, connection: &ConnectionId) -> Result<Conclusion, RoomError> {
        let room_id = self.room_of(connection).await.ok_or(RoomError::NoActiveRoom)?;
        let room = self.active_room(&room_id).await?;
        let outcome = {
            let room = room.read().await;
            if !room.is_active() {
                return Err(RoomError::NoActiveRoom);
            }
            match room.seat_of(connection).map(|s| s.role) {
                Some(Role::White) => MatchOutcome::BWin,
                Some(Role::Black) => MatchOutcome::AWin,
                None => return Err(RoomError::NotAMember(*connection)),
            }
        };
        self.conclude_room(&room_id, outcome, EndReason::Forfeit).await
    }

    /// Conclude rooms whose disconnected member ran out of time. Without a
    /// forfeit timeout, rooms with both members gone are abandoned instead.
    pub async fn forfeit_abandoned(&self) -> Vec<(RoomId, Conclusion)> {
        let now = Instant::now();
        let rooms: Vec<(RoomId, Arc<RwLock<Room>>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect();

        let mut results = Vec::new();
        for (id, room) in rooms {
            let due = {
                let room = room.read().await;
                match self.config.forfeit_timeout {
                    Some(timeout) => room.forfeit_due(timeout, now).map(Sweep::Forfeit),
                    None if room.is_active() && room.is_deserted() => Some(Sweep::Abandon),
                    None => None,
                }
            };

            match due {
                Some(Sweep::Forfeit(outcome)) => {
                    if let Ok(conclusion) = self.conclude_room(&id, outcome, EndReason::Forfeit).await {
                        results.push((id, conclusion));
                    }
                }
                Some(Sweep::Abandon) => {
                    let abandoned = room.write().await.abandon();
                    if abandoned {
                        let (a, b) = {
                            let room = room.read().await;
                            (room.white.identity.clone(), room.black.identity.clone())
                        };
                        self.release_identities(&id, &a, &b).await;
                        info!("Room {} abandoned", id);
                        results.push((id, Conclusion::Abandoned));
                    }
                }
                None => {}
            }
        }
        results
    }

    /// Drop concluded rooms past their retention.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.concluded_retention;

        let mut expired = Vec::new();
        {
            let rooms = self.rooms.read().await;
            for (id, room) in rooms.iter() {
                let room = room.read().await;
                let past = room
                    .concluded_at
                    .map(|at| now.duration_since(at) >= retention)
                    .unwrap_or(false);
                if past {
                    expired.push((id.clone(), room.white.connection, room.black.connection));
                }
            }
        }

        if expired.is_empty() {
            return 0;
        }

        {
            let mut rooms = self.rooms.write().await;
            for (id, _, _) in &expired {
                rooms.remove(id);
            }
        }
        {
            let mut connection_rooms = self.connection_rooms.write().await;
            for (id, white, black) in &expired {
                for conn in [white, black] {
                    if connection_rooms.get(conn) == Some(id) {
                        connection_rooms.remove(conn);
                    }
                }
            }
        }

        debug!("Cleaned up {} concluded rooms", expired.len());
        expired.len()
    }

    /// Number of rooms held (active and concluded).
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Number of active rooms.
    pub async fn active_room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        let mut count = 0;
        for room in rooms.values() {
            if room.read().await.is_active() {
                count += 1;
            }
        }
        count
    }

    async fn active_room(&self, room_id: &RoomId) -> Result<Arc<RwLock<Room>>, RoomError> {
        self.get_room(room_id).await.ok_or(RoomError::NoActiveRoom)
    }

    /// Sender of `from`'s opponent, None if the opponent is gone.
    async fn relay_target(
        &self,
        room_id: &RoomId,
        from: &ConnectionId,
    ) -> Result<Option<ClientSender>, RoomError> {
        let room = self.active_room(room_id).await?;
        let room = room.read().await;
        if !room.is_active() {
            return Err(RoomError::NoActiveRoom);
        }
        let opponent = room.opponent_of(from).ok_or(RoomError::NotAMember(*from))?;
        Ok(opponent.is_connected().then(|| opponent.sender.clone()))
    }

    async fn release_identities(&self, room_id: &RoomId, a: &Identity, b: &Identity) {
        let mut identity_rooms = self.identity_rooms.write().await;
        for identity in [a, b] {
            if identity_rooms.get(identity) == Some(room_id) {
                identity_rooms.remove(identity);
            }
        }
    }
}

enum Sweep {
    Forfeit(MatchOutcome),
    Abandon,
}

fn deliver(target: Option<ClientSender>, message: ServerMessage) -> Delivery {
    match target {
        Some(sender) if try_notify(&sender, message) => Delivery::Delivered,
        _ => Delivery::PeerUnavailable,
    }
}
