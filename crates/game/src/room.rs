//! Room matchmaking and the authoritative match loop.
//!
//! Rooms never touch a socket: every handler returns the messages to put on
//! the wire, tagged with peer, reliability and channel, and the server layer
//! does the sending. Slot indices double as the player ids clients see.

use std::collections::HashMap;

use log::{debug, info};

use crate::entity::{ATTACK_HIT_STEP, ActionState, PlayerInput};
use crate::level::{Level, RoomData};
use crate::net::{Channel, JoinStatus, Message, PeerId, Reliability, StartStatus};
use crate::sim::{step_for_time, time_for_step};

/// Fraction of the worst half-RTT added to "now" when scheduling go time.
const GO_CALIBRATION: f32 = 1.0;
/// How long an empty room lingers before the pool reclaims it.
const EMPTY_ROOM_GRACE_MS: u64 = 10_000;

const ATTACK_RANGE: f32 = 2.0;
const ATTACK_CONE: f32 = std::f32::consts::FRAC_PI_2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(pub u32);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "room {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Accepting joins until every slot is taken.
    WaitingJoin,
    /// Full; waiting for every peer to report ready.
    WaitingPlayers,
    /// Simulation running, anchored at go time.
    Playing,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("room is full")]
    Full,
    #[error("match already started")]
    Started,
    #[error("peer already holds a slot")]
    AlreadyJoined,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("room table full")]
    Capacity,
    #[error("room {0} not found")]
    NotFound(u32),
}

/// A message the caller must put on the wire.
#[derive(Debug)]
pub struct Outgoing {
    pub peer: PeerId,
    pub message: Message,
    pub reliability: Reliability,
    pub channel: Channel,
}

impl Outgoing {
    fn session(peer: PeerId, message: Message) -> Self {
        Self {
            peer,
            message,
            reliability: Reliability::Reliable,
            channel: Channel::Session,
        }
    }

    fn state(peer: PeerId, message: Message) -> Self {
        Self {
            peer,
            message,
            reliability: Reliability::Unreliable,
            channel: Channel::State,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    peer: PeerId,
    ready: bool,
    rtt_ms: f32,
    /// Action step of the last attack whose hit was resolved, so one swing
    /// lands at most once.
    resolved_attack: Option<u32>,
}

pub struct GameRoom {
    id: RoomId,
    state: RoomState,
    data: RoomData,
    slots: Vec<Option<Slot>>,
    level: Option<Level>,
    go_time_ms: u64,
    current_step: u32,
    empty_since_ms: Option<u64>,
}

impl GameRoom {
    pub fn new(id: RoomId, players_count: u8, now_ms: u64) -> Self {
        Self {
            id,
            state: RoomState::WaitingJoin,
            data: RoomData::generate(id.0, players_count),
            slots: (0..players_count).map(|_| None).collect(),
            level: None,
            go_time_ms: 0,
            current_step: 0,
            empty_since_ms: Some(now_ms),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn players_count(&self) -> u8 {
        self.slots.len() as u8
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn go_time_ms(&self) -> u64 {
        self.go_time_ms
    }

    pub fn slot_of(&self, peer: PeerId) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|slot| slot.peer == peer))
            .map(|i| i as u8)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.slots.iter().flatten().map(|slot| slot.peer)
    }

    /// Index into the level's player list for a slot, accounting for
    /// players deleted when peers dropped mid-match.
    fn level_index(&self, slot: usize) -> u8 {
        self.slots[..slot].iter().flatten().count() as u8
    }

    /// Takes the first free slot and replies with the room layout.
    pub fn join(&mut self, peer: PeerId) -> Result<Outgoing, JoinError> {
        if self.state == RoomState::Playing {
            return Err(JoinError::Started);
        }
        if self.slot_of(peer).is_some() {
            return Err(JoinError::AlreadyJoined);
        }
        let Some(free) = self.slots.iter().position(|s| s.is_none()) else {
            return Err(JoinError::Full);
        };

        self.slots[free] = Some(Slot {
            peer,
            ready: false,
            rtt_ms: 0.0,
            resolved_attack: None,
        });
        self.empty_since_ms = None;
        if self.slots.iter().all(|s| s.is_some()) {
            self.state = RoomState::WaitingPlayers;
        }
        debug!("{}: peer {peer} took slot {free}", self.id);

        Ok(Outgoing::session(
            peer,
            Message::JoinRoom {
                room_id: self.id.0,
                status: JoinStatus::Success,
                room_data: Some(self.data.clone()),
            },
        ))
    }

    /// Records a ready report. When the last one lands, schedules go time
    /// far enough out for the worst peer to hear about it, builds the
    /// authoritative level and tells every peer its slot and the shared
    /// go time.
    pub fn mark_ready(&mut self, peer: PeerId, rtt_ms: f32, now_ms: u64) -> Vec<Outgoing> {
        if self.state == RoomState::Playing {
            return Vec::new();
        }
        let Some(slot) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|slot| slot.peer == peer)
        else {
            return Vec::new();
        };
        slot.ready = true;
        slot.rtt_ms = rtt_ms;

        let all_ready = self.slots.iter().all(|s| s.as_ref().is_some_and(|p| p.ready));
        if self.state != RoomState::WaitingPlayers || !all_ready {
            return Vec::new();
        }

        let worst_rtt = self
            .slots
            .iter()
            .flatten()
            .map(|slot| slot.rtt_ms)
            .fold(0.0f32, f32::max);
        self.go_time_ms = now_ms + (worst_rtt * 0.5 * GO_CALIBRATION).ceil() as u64;
        self.level = Some(Level::new_server(&self.data));
        self.current_step = 0;
        self.state = RoomState::Playing;
        info!(
            "{}: all ready, go at t+{}ms",
            self.id,
            self.go_time_ms - now_ms
        );

        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot_id, slot)| {
                slot.as_ref().map(|slot| {
                    Outgoing::session(
                        slot.peer,
                        Message::StartGame {
                            room_id: self.id.0,
                            player_id: slot_id as u8,
                            status: StartStatus::Go,
                            go_time_ms: self.go_time_ms,
                        },
                    )
                })
            })
            .collect()
    }

    /// Buffers a client input on its authoritative player.
    pub fn handle_input(&mut self, peer: PeerId, input: PlayerInput) {
        if self.state != RoomState::Playing {
            return;
        }
        let Some(slot) = self.slot_of(peer) else {
            return;
        };
        let index = self.level_index(slot as usize);
        if let Some(level) = &mut self.level {
            level.apply_input(index, input);
        }
    }

    /// Steps the simulation up to `now_ms` and returns the changed entity
    /// states to broadcast.
    pub fn advance(&mut self, now_ms: u64) -> Vec<Outgoing> {
        if self.state != RoomState::Playing || now_ms < self.go_time_ms {
            return Vec::new();
        }
        let target = step_for_time((now_ms - self.go_time_ms) as f32 / 1000.0);
        if target <= self.current_step {
            return Vec::new();
        }

        let Some(level) = &mut self.level else {
            return Vec::new();
        };
        level.update(target);
        self.current_step = target;

        self.resolve_attacks();

        let peers: Vec<PeerId> = self.peers().collect();
        let mut out = Vec::new();
        let Some(level) = &self.level else {
            return out;
        };

        let slot_ids: Vec<u8> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as u8)
            .collect();

        for (index, player) in level.players() {
            if !player.has_changed() {
                continue;
            }
            let Some(&slot_id) = slot_ids.get(index as usize) else {
                continue;
            };
            let snapshot = *player.newest_snapshot();
            for &peer in &peers {
                out.push(Outgoing::state(
                    peer,
                    Message::PlayerState {
                        id: slot_id,
                        snapshot,
                    },
                ));
            }
        }

        for (id, enemy) in level.enemies() {
            if !enemy.has_changed() {
                continue;
            }
            let snapshot = *enemy.newest_snapshot();
            for &peer in &peers {
                out.push(Outgoing::state(peer, Message::EnemyState { id, snapshot }));
            }
        }

        out
    }

    /// Lands each in-flight swing once it reaches its hit step, against the
    /// enemy positions interpolated at that moment.
    fn resolve_attacks(&mut self) {
        let Some(level) = &self.level else {
            return;
        };

        let mapping: Vec<(usize, u8)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(s, _)| (s, self.level_index(s)))
            .collect();

        for (slot_index, level_idx) in mapping {
            let Some(player) = level.player(level_idx) else {
                continue;
            };
            let snapshot = *player.newest_snapshot();

            let Some(slot) = self.slots[slot_index].as_mut() else {
                continue;
            };

            if snapshot.action != ActionState::Attacking {
                slot.resolved_attack = None;
                continue;
            }
            if snapshot.step.saturating_sub(snapshot.action_step) < ATTACK_HIT_STEP {
                continue;
            }
            if slot.resolved_attack == Some(snapshot.action_step) {
                continue;
            }
            slot.resolved_attack = Some(snapshot.action_step);

            let t = time_for_step(snapshot.action_step + ATTACK_HIT_STEP);
            let view = player.state_at_time(t);
            let aim = view.direction.y.atan2(view.direction.x);
            let hits = level.enemies_in_range(t, view.position, aim, ATTACK_RANGE, ATTACK_CONE);
            if !hits.is_empty() {
                info!(
                    "{}: player {} hit enemies {:?} at step {}",
                    self.id,
                    slot_index,
                    hits,
                    snapshot.action_step + ATTACK_HIT_STEP
                );
            }
        }
    }

    /// Frees the peer's slot; mid-match its player is removed from the
    /// simulation. Returns false if the peer was not here.
    pub fn peer_dropped(&mut self, peer: PeerId, now_ms: u64) -> bool {
        let Some(slot) = self.slot_of(peer) else {
            return false;
        };
        let index = self.level_index(slot as usize);
        self.slots[slot as usize] = None;
        debug!("{}: peer {peer} left slot {slot}", self.id);

        match self.state {
            RoomState::WaitingJoin => {}
            RoomState::WaitingPlayers => self.state = RoomState::WaitingJoin,
            RoomState::Playing => {
                if let Some(level) = &mut self.level {
                    level.delete_player(index);
                }
            }
        }

        if self.occupied() == 0 {
            self.empty_since_ms = Some(now_ms);
        }
        true
    }

    pub fn should_reap(&self, now_ms: u64) -> bool {
        self.empty_since_ms
            .is_some_and(|since| now_ms >= since + EMPTY_ROOM_GRACE_MS)
    }
}

/// All live rooms, keyed by id.
pub struct RoomPool {
    rooms: HashMap<u32, GameRoom>,
    next_room_id: u32,
    max_rooms: usize,
}

impl RoomPool {
    pub fn new(max_rooms: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            next_room_id: 1,
            max_rooms,
        }
    }

    pub fn create(&mut self, players_count: u8, now_ms: u64) -> Result<&mut GameRoom, PoolError> {
        if self.rooms.len() >= self.max_rooms {
            return Err(PoolError::Capacity);
        }
        let id = self.next_room_id;
        self.next_room_id = self.next_room_id.wrapping_add(1).max(1);

        info!("created room {id} for {players_count} players");
        Ok(self
            .rooms
            .entry(id)
            .or_insert_with(|| GameRoom::new(RoomId(id), players_count, now_ms)))
    }

    pub fn get(&self, id: u32) -> Option<&GameRoom> {
        self.rooms.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut GameRoom> {
        self.rooms.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn advance_all(&mut self, now_ms: u64) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for room in self.rooms.values_mut() {
            out.extend(room.advance(now_ms));
        }
        out
    }

    /// Drops rooms that sat empty past the grace period.
    pub fn reap(&mut self, now_ms: u64) -> Vec<RoomId> {
        let dead: Vec<u32> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.should_reap(now_ms))
            .map(|(&id, _)| id)
            .collect();

        dead.iter()
            .map(|id| {
                self.rooms.remove(id);
                info!("reaped room {id}");
                RoomId(*id)
            })
            .collect()
    }
}
