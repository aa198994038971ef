//! Client-side session: connection lifecycle, matchmaking requests and the
//! predicted local simulation.
//!
//! The session owns the transport and a `Level` once a match starts. Each
//! fixed step it stamps the current input, records it on the predicted
//! player, ships it to the server and advances the level; server state
//! flowing back is fed into the entities, which reconcile or interpolate
//! on their own.

use std::io;
use std::net::SocketAddr;

use glam::Vec2;
use log::{debug, info, warn};

use clash::sim::{TICK_RATE, step_for_time};
use clash::{
    Channel, Event, Host, JoinStatus, Level, Message, PeerId, PlayerInput, PlayerView, Reliability,
    RoomData, StartStatus, UNKNOWN_PLAYER, UNKNOWN_ROOM,
};

/// Seconds of delay applied when sampling remote entities, so interpolation
/// has a bracket of snapshots to work with.
const INTERP_DELAY: f32 = 0.1;

/// Largest backlog replayed in one update, a quarter second of steps. A
/// stalled process (suspend, breakpoint) skips the older steps instead of
/// burst-simulating the whole gap.
const MAX_CATCHUP_STEPS: u32 = TICK_RATE / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    JoinedRoom,
    Waiting,
    Playing,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("a request of this kind is already outstanding")]
    Pending,
    #[error("the server refused the request")]
    Refused,
    #[error("connection lost")]
    Disconnected,
}

type RequestCallback = Box<dyn FnOnce(Result<u32, RequestError>)>;

/// App-level hooks driven by the session loop.
#[allow(unused_variables)]
pub trait Subsystem {
    fn on_update(&mut self, session: &mut ClientSession) {}
    fn on_late_update(&mut self, session: &mut ClientSession) {}
    fn on_pause(&mut self, session: &mut ClientSession) {}
    fn on_resume(&mut self, session: &mut ClientSession) {}
    fn on_quit(&mut self, session: &mut ClientSession) {}
}

pub struct ClientSession {
    host: Host,
    server: PeerId,
    state: SessionState,
    /// Messages composed before the handshake finished.
    send_queue: Vec<(Message, Reliability, Channel)>,
    on_create: Option<RequestCallback>,
    on_join: Option<RequestCallback>,
    on_start: Option<RequestCallback>,
    room_id: u32,
    room_data: Option<RoomData>,
    player_id: u8,
    go_time_ms: u64,
    level: Option<Level>,
    current_step: u32,
    axes: Vec2,
    attack_queued: bool,
    paused: bool,
    subsystems: Vec<Box<dyn Subsystem>>,
    quit: bool,
}

impl ClientSession {
    pub fn connect(server_addr: SocketAddr) -> io::Result<Self> {
        info!("connecting to {server_addr}");
        let host = Host::client(server_addr)?;

        Ok(Self {
            host,
            server: PeerId(0),
            state: SessionState::Connecting,
            send_queue: Vec::new(),
            on_create: None,
            on_join: None,
            on_start: None,
            room_id: UNKNOWN_ROOM,
            room_data: None,
            player_id: UNKNOWN_PLAYER,
            go_time_ms: 0,
            level: None,
            current_step: 0,
            axes: Vec2::ZERO,
            attack_queued: false,
            paused: false,
            subsystems: Vec::new(),
            quit: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> u32 {
        self.room_id
    }

    pub fn player_id(&self) -> u8 {
        self.player_id
    }

    pub fn room_data(&self) -> Option<&RoomData> {
        self.room_data.as_ref()
    }

    pub fn rtt_ms(&self) -> f32 {
        self.host.rtt_ms(self.server)
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn add_subsystem(&mut self, subsystem: Box<dyn Subsystem>) {
        self.subsystems.push(subsystem);
    }

    /// Asks the server for a fresh room. The callback fires with the new
    /// room id once the reply lands.
    pub fn request_create_room(
        &mut self,
        players_count: u8,
        callback: impl FnOnce(Result<u32, RequestError>) + 'static,
    ) -> Result<(), RequestError> {
        if self.on_create.is_some() {
            return Err(RequestError::Pending);
        }
        self.on_create = Some(Box::new(callback));
        self.queue_or_send(
            Message::CreateRoom {
                room_id: UNKNOWN_ROOM,
                players_count,
            },
            Reliability::Reliable,
            Channel::Session,
        );
        Ok(())
    }

    pub fn request_join_room(
        &mut self,
        room_id: u32,
        callback: impl FnOnce(Result<u32, RequestError>) + 'static,
    ) -> Result<(), RequestError> {
        if self.on_join.is_some() {
            return Err(RequestError::Pending);
        }
        self.on_join = Some(Box::new(callback));
        self.queue_or_send(
            Message::JoinRoom {
                room_id,
                status: JoinStatus::Request,
                room_data: None,
            },
            Reliability::Reliable,
            Channel::Session,
        );
        Ok(())
    }

    /// Reports that the app finished loading the room and can start on the
    /// shared go time. The callback fires with the room id once the match
    /// goes, or with an error if the server aborts the start.
    pub fn ready(
        &mut self,
        callback: impl FnOnce(Result<u32, RequestError>) + 'static,
    ) -> Result<(), RequestError> {
        if self.on_start.is_some() {
            return Err(RequestError::Pending);
        }
        if self.state != SessionState::JoinedRoom {
            return Err(RequestError::Refused);
        }
        self.on_start = Some(Box::new(callback));
        self.state = SessionState::Waiting;
        self.queue_or_send(
            Message::StartGame {
                room_id: self.room_id,
                player_id: UNKNOWN_PLAYER,
                status: StartStatus::Ready,
                go_time_ms: 0,
            },
            Reliability::Reliable,
            Channel::Session,
        );
        Ok(())
    }

    /// Sets the movement axes sampled at the next fixed steps.
    pub fn set_input(&mut self, axes: Vec2) {
        self.axes = axes;
    }

    /// Latches an attack; it is consumed by the next fixed step.
    pub fn trigger_attack(&mut self) {
        self.attack_queued = true;
    }

    /// Predicted position of the local player, smoothing offset included.
    pub fn local_position(&self) -> Option<Vec2> {
        let level = self.level.as_ref()?;
        Some(level.player(self.player_id)?.current_position())
    }

    /// Interpolated view of any player at the delayed render time.
    pub fn player_view(&self, id: u8) -> Option<PlayerView> {
        let level = self.level.as_ref()?;
        Some(level.player(id)?.state_at_time(self.render_time()?))
    }

    pub fn enemy_position(&self, id: u8) -> Option<Vec2> {
        let level = self.level.as_ref()?;
        Some(level.enemy(id)?.position_at_time(self.render_time()?))
    }

    fn render_time(&self) -> Option<f32> {
        if self.state != SessionState::Playing {
            return None;
        }
        let now = self.host.now_ms();
        if now < self.go_time_ms {
            return Some(0.0);
        }
        Some(((now - self.go_time_ms) as f32 / 1000.0 - INTERP_DELAY).max(0.0))
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Freezes the fixed-step clock. The server keeps simulating; the
    /// transport stays alive so the session does not time out.
    pub fn request_pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;

        let mut subsystems = std::mem::take(&mut self.subsystems);
        for subsystem in &mut subsystems {
            subsystem.on_pause(self);
        }
        self.subsystems = subsystems;
    }

    /// Unfreezes the clock, re-anchored on the shared timeline: steps that
    /// passed while paused are skipped, not replayed.
    pub fn request_resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;

        if self.state == SessionState::Playing {
            let now = self.host.now_ms();
            if now > self.go_time_ms {
                self.current_step = self
                    .current_step
                    .max(step_for_time((now - self.go_time_ms) as f32 / 1000.0));
            }
        }

        let mut subsystems = std::mem::take(&mut self.subsystems);
        for subsystem in &mut subsystems {
            subsystem.on_resume(self);
        }
        self.subsystems = subsystems;
    }

    /// Notifies subsystems, tells the server goodbye and tears the session
    /// down.
    pub fn request_quit(&mut self) {
        let mut subsystems = std::mem::take(&mut self.subsystems);
        for subsystem in &mut subsystems {
            subsystem.on_quit(self);
        }
        self.subsystems = subsystems;

        let _ = self.host.disconnect(self.server);
        self.teardown();
        self.quit = true;
    }

    /// Pumps the transport, advances the predicted simulation and runs the
    /// subsystem hooks. Call once per frame.
    pub fn update(&mut self) -> io::Result<()> {
        let events = self.host.service()?;
        for event in events {
            self.handle_event(event);
        }

        self.step_simulation()?;

        let mut subsystems = std::mem::take(&mut self.subsystems);
        for subsystem in &mut subsystems {
            subsystem.on_update(self);
        }
        for subsystem in &mut subsystems {
            subsystem.on_late_update(self);
        }
        self.subsystems.splice(0..0, subsystems);

        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::PeerConnected(_) => {
                info!("connected to server");
                if self.state == SessionState::Connecting {
                    self.state = SessionState::Connected;
                }
                for (message, reliability, channel) in std::mem::take(&mut self.send_queue) {
                    self.send(message, reliability, channel);
                }
            }
            Event::PeerDisconnected(_) => {
                warn!("lost connection to server");
                if let Some(callback) = self.on_create.take() {
                    callback(Err(RequestError::Disconnected));
                }
                if let Some(callback) = self.on_join.take() {
                    callback(Err(RequestError::Disconnected));
                }
                if let Some(callback) = self.on_start.take() {
                    callback(Err(RequestError::Disconnected));
                }
                self.teardown();
            }
            Event::Message { bytes, .. } => {
                match Message::decode(&bytes, self.host.clock_offset_ms(self.server)) {
                    Ok(message) => self.dispatch(message),
                    Err(e) => debug!("undecodable message from server: {e}"),
                }
            }
        }
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::CreateRoom { room_id, .. } => {
                if let Some(callback) = self.on_create.take() {
                    if room_id == UNKNOWN_ROOM {
                        callback(Err(RequestError::Refused));
                    } else {
                        callback(Ok(room_id));
                    }
                }
            }
            Message::JoinRoom {
                room_id,
                status,
                room_data,
            } => match status {
                JoinStatus::Success => {
                    self.room_id = room_id;
                    self.room_data = room_data;
                    self.state = SessionState::JoinedRoom;
                    if let Some(callback) = self.on_join.take() {
                        callback(Ok(room_id));
                    }
                }
                _ => {
                    if let Some(callback) = self.on_join.take() {
                        callback(Err(RequestError::Refused));
                    }
                }
            },
            Message::StartGame {
                player_id,
                status,
                go_time_ms,
                ..
            } => match status {
                StartStatus::Go => {
                    self.start_match(player_id, go_time_ms);
                    if let Some(callback) = self.on_start.take() {
                        callback(Ok(self.room_id));
                    }
                }
                StartStatus::Fail => {
                    warn!("server aborted match start");
                    self.state = SessionState::JoinedRoom;
                    if let Some(callback) = self.on_start.take() {
                        callback(Err(RequestError::Refused));
                    }
                }
                StartStatus::Ready => {}
            },
            Message::PlayerState { id, snapshot } => {
                if let Some(level) = &mut self.level {
                    level.apply_player_state(id, snapshot);
                }
            }
            Message::EnemyState { id, snapshot } => {
                if let Some(level) = &mut self.level {
                    level.apply_enemy_state(id, snapshot);
                }
            }
            other => debug!("unexpected message from server: {other:?}"),
        }
    }

    fn start_match(&mut self, player_id: u8, go_time_ms: u64) {
        let Some(data) = &self.room_data else {
            warn!("go without room data, ignoring");
            return;
        };
        info!(
            "match starts in {}ms as player {player_id}",
            go_time_ms.saturating_sub(self.host.now_ms())
        );
        self.player_id = player_id;
        self.go_time_ms = go_time_ms;
        self.level = Some(Level::new_client(data, player_id));
        self.current_step = 0;
        self.state = SessionState::Playing;
    }

    /// Stamps inputs for every fixed step since the last call, records them
    /// on the predicted player, ships them and advances the level.
    fn step_simulation(&mut self) -> io::Result<()> {
        if self.state != SessionState::Playing || self.paused {
            return Ok(());
        }
        let now = self.host.now_ms();
        if now < self.go_time_ms {
            return Ok(());
        }

        let target = step_for_time((now - self.go_time_ms) as f32 / 1000.0);
        if target <= self.current_step {
            return Ok(());
        }
        if target - self.current_step > MAX_CATCHUP_STEPS {
            self.current_step = target - MAX_CATCHUP_STEPS;
        }

        for step in self.current_step..target {
            let attack = std::mem::take(&mut self.attack_queued);
            let input = PlayerInput {
                step,
                axes: self.axes,
                attack,
            };
            if let Some(level) = &mut self.level {
                level.apply_input(self.player_id, input);
            }
            self.host.send(
                self.server,
                &Message::PlayerInputs {
                    step,
                    axes: input.axes,
                    attack,
                }
                .encode(),
                Reliability::Unreliable,
                Channel::State,
            )?;
        }

        if let Some(level) = &mut self.level {
            level.update(target);
        }
        self.current_step = target;
        Ok(())
    }

    fn queue_or_send(&mut self, message: Message, reliability: Reliability, channel: Channel) {
        if self.host.is_connected(self.server) {
            self.send(message, reliability, channel);
        } else {
            self.send_queue.push((message, reliability, channel));
        }
    }

    fn send(&mut self, message: Message, reliability: Reliability, channel: Channel) {
        if let Err(e) = self
            .host
            .send(self.server, &message.encode(), reliability, channel)
        {
            warn!("send failed: {e}");
        }
    }

    fn teardown(&mut self) {
        self.state = SessionState::Disconnected;
        self.send_queue.clear();
        self.room_id = UNKNOWN_ROOM;
        self.room_data = None;
        self.player_id = UNKNOWN_PLAYER;
        self.level = None;
        self.current_step = 0;
        self.paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use clash::RoomData;

    /// Handshakes a session against a bare server host so private state can
    /// then be driven directly.
    fn connected_session() -> (clash::Host, ClientSession) {
        let mut server = clash::Host::server("127.0.0.1:0", 4).unwrap();
        let mut session = ClientSession::connect(server.local_addr()).unwrap();

        for _ in 0..50 {
            server.service().unwrap();
            session.update().unwrap();
            if session.host.is_connected(PeerId(0)) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(session.host.is_connected(PeerId(0)));
        (server, session)
    }

    fn start_playing(session: &mut ClientSession) {
        session.dispatch(Message::JoinRoom {
            room_id: 1,
            status: JoinStatus::Success,
            room_data: Some(RoomData::generate(1, 1)),
        });
        let go = session.host.now_ms();
        session.dispatch(Message::StartGame {
            room_id: 1,
            player_id: 0,
            status: StartStatus::Go,
            go_time_ms: go,
        });
        assert_eq!(session.state(), SessionState::Playing);
    }

    #[test]
    fn second_request_of_a_kind_fails_synchronously() {
        let (_server, mut session) = connected_session();

        session.request_create_room(2, |_| {}).unwrap();
        let err = session.request_create_room(2, |_| {}).unwrap_err();
        assert_eq!(err, RequestError::Pending);
    }

    #[test]
    fn pause_freezes_the_step_clock() {
        let (mut server, mut session) = connected_session();
        start_playing(&mut session);

        std::thread::sleep(Duration::from_millis(40));
        session.update().unwrap();
        server.service().unwrap();
        assert!(session.current_step > 0);

        session.request_pause();
        let frozen = session.current_step;
        std::thread::sleep(Duration::from_millis(60));
        session.update().unwrap();
        assert_eq!(session.current_step, frozen);

        // Resume skips the paused steps instead of replaying them.
        session.request_resume();
        session.update().unwrap();
        assert!(session.current_step > frozen + 2);
    }

    #[test]
    fn long_stall_skips_steps_instead_of_bursting() {
        let (_server, mut session) = connected_session();
        start_playing(&mut session);

        // Pretend the process was suspended for ten seconds.
        session.go_time_ms = session.go_time_ms.saturating_sub(10_000);
        session.update().unwrap();

        assert!(session.current_step >= 600);
        let player = session.level.as_ref().unwrap().player(0).unwrap();
        assert!(player.buffered_inputs() <= MAX_CATCHUP_STEPS as usize);
    }

    #[test]
    fn start_callback_resolves_on_go_and_fail() {
        let (_server, mut session) = connected_session();
        session.dispatch(Message::JoinRoom {
            room_id: 1,
            status: JoinStatus::Success,
            room_data: Some(RoomData::generate(1, 1)),
        });

        let outcome = std::rc::Rc::new(std::cell::Cell::new(None));
        let seen = std::rc::Rc::clone(&outcome);
        session
            .ready(move |result| seen.set(Some(result)))
            .unwrap();
        assert_eq!(session.state(), SessionState::Waiting);

        // Only one start request may be outstanding.
        assert_eq!(session.ready(|_| {}).unwrap_err(), RequestError::Pending);

        session.dispatch(Message::StartGame {
            room_id: 1,
            player_id: 0,
            status: StartStatus::Fail,
            go_time_ms: 0,
        });
        assert_eq!(outcome.take(), Some(Err(RequestError::Refused)));
        assert_eq!(session.state(), SessionState::JoinedRoom);

        // A fresh attempt goes through and resolves on Go.
        let seen = std::rc::Rc::clone(&outcome);
        session
            .ready(move |result| seen.set(Some(result)))
            .unwrap();
        let go = session.host.now_ms();
        session.dispatch(Message::StartGame {
            room_id: 1,
            player_id: 0,
            status: StartStatus::Go,
            go_time_ms: go,
        });
        assert_eq!(outcome.take(), Some(Ok(1)));
        assert_eq!(session.state(), SessionState::Playing);
    }

    #[test]
    fn disconnect_fails_pending_requests() {
        let (_server, mut session) = connected_session();

        let outcome = std::rc::Rc::new(std::cell::Cell::new(None));
        let seen = std::rc::Rc::clone(&outcome);
        session
            .request_create_room(2, move |result| seen.set(Some(result)))
            .unwrap();

        session.handle_event(Event::PeerDisconnected(PeerId(0)));
        assert_eq!(outcome.take(), Some(Err(RequestError::Disconnected)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
