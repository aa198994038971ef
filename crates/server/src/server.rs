use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use clash::{
    Channel, Event, Host, JoinStatus, Message, Outgoing, PeerId, PlayerInput, Reliability,
    RoomPool, StartStatus, UNKNOWN_ROOM,
};

use crate::config::ServerConfig;

/// Headless authoritative server: one socket, a pool of rooms, and a
/// peer-to-room index for routing.
pub struct GameServer {
    host: Host,
    rooms: RoomPool,
    peer_rooms: HashMap<PeerId, u32>,
    running: Arc<AtomicBool>,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let host = Host::server(bind_addr, config.max_peers)?;

        Ok(Self {
            host,
            rooms: RoomPool::new(config.max_rooms),
            peer_rooms: HashMap::new(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.host.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn tick_once(&mut self) {
        match self.host.service() {
            Ok(events) => {
                for event in events {
                    self.handle_event(event);
                }
            }
            Err(e) => warn!("transport error: {e}"),
        }

        let now = self.host.now_ms();
        let outgoing = self.rooms.advance_all(now);
        self.flush(outgoing);

        for room_id in self.rooms.reap(now) {
            self.peer_rooms.retain(|_, id| *id != room_id.0);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::PeerConnected(peer) => {
                info!("peer {peer} connected");
            }
            Event::PeerDisconnected(peer) => {
                info!("peer {peer} disconnected");
                if let Some(room_id) = self.peer_rooms.remove(&peer) {
                    let now = self.host.now_ms();
                    if let Some(room) = self.rooms.get_mut(room_id) {
                        room.peer_dropped(peer, now);
                    }
                }
            }
            Event::Message { peer, bytes, .. } => {
                match Message::decode(&bytes, self.host.clock_offset_ms(peer)) {
                    Ok(message) => self.dispatch(peer, message),
                    Err(e) => debug!("undecodable message from peer {peer}: {e}"),
                }
            }
        }
    }

    fn dispatch(&mut self, peer: PeerId, message: Message) {
        let now = self.host.now_ms();

        match message {
            Message::CreateRoom { players_count, .. } => {
                let room_id = match self.rooms.create(players_count, now) {
                    Ok(room) => room.id().0,
                    Err(e) => {
                        warn!("create room for peer {peer} failed: {e}");
                        UNKNOWN_ROOM
                    }
                };
                self.send_session(
                    peer,
                    Message::CreateRoom {
                        room_id,
                        players_count,
                    },
                );
            }
            Message::JoinRoom {
                room_id,
                status: JoinStatus::Request,
                ..
            } => {
                // One room per peer; a second join would orphan the slot
                // the first room still holds.
                if let Some(&current) = self.peer_rooms.get(&peer) {
                    debug!("peer {peer} already sits in room {current}, rejecting {room_id}");
                    self.send_session(
                        peer,
                        Message::JoinRoom {
                            room_id,
                            status: JoinStatus::Fail,
                            room_data: None,
                        },
                    );
                    return;
                }

                let joined = self
                    .rooms
                    .get_mut(room_id)
                    .ok_or_else(|| {
                        debug!("peer {peer} asked for unknown room {room_id}");
                    })
                    .and_then(|room| {
                        room.join(peer).map_err(|e| {
                            debug!("peer {peer} cannot join room {room_id}: {e}");
                        })
                    });

                match joined {
                    Ok(reply) => {
                        self.peer_rooms.insert(peer, room_id);
                        self.flush(vec![reply]);
                    }
                    Err(()) => self.send_session(
                        peer,
                        Message::JoinRoom {
                            room_id,
                            status: JoinStatus::Fail,
                            room_data: None,
                        },
                    ),
                }
            }
            Message::StartGame {
                status: StartStatus::Ready,
                ..
            } => {
                let Some(&room_id) = self.peer_rooms.get(&peer) else {
                    debug!("ready from peer {peer} outside any room");
                    return;
                };
                let rtt = self.host.rtt_ms(peer);
                if let Some(room) = self.rooms.get_mut(room_id) {
                    let outgoing = room.mark_ready(peer, rtt, now);
                    self.flush(outgoing);
                }
            }
            Message::PlayerInputs { step, axes, attack } => {
                let Some(&room_id) = self.peer_rooms.get(&peer) else {
                    return;
                };
                if let Some(room) = self.rooms.get_mut(room_id) {
                    room.handle_input(peer, PlayerInput { step, axes, attack });
                }
            }
            other => debug!("unexpected message from peer {peer}: {other:?}"),
        }
    }

    fn send_session(&mut self, peer: PeerId, message: Message) {
        if let Err(e) = self.host.send(
            peer,
            &message.encode(),
            Reliability::Reliable,
            Channel::Session,
        ) {
            warn!("send to peer {peer} failed: {e}");
        }
    }

    fn flush(&mut self, outgoing: Vec<Outgoing>) {
        for out in outgoing {
            if let Err(e) =
                self.host
                    .send(out.peer, &out.message.encode(), out.reliability, out.channel)
            {
                warn!("send to peer {} failed: {e}", out.peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_request(room_id: u32) -> Message {
        Message::JoinRoom {
            room_id,
            status: JoinStatus::Request,
            room_data: None,
        }
    }

    #[test]
    fn peer_cannot_hold_slots_in_two_rooms() {
        let mut server = GameServer::new("127.0.0.1:0", ServerConfig::default()).unwrap();
        let peer = PeerId(1);

        let first = server.rooms.create(2, 0).unwrap().id().0;
        let second = server.rooms.create(2, 0).unwrap().id().0;

        server.dispatch(peer, join_request(first));
        assert_eq!(server.peer_rooms.get(&peer), Some(&first));
        assert_eq!(server.rooms.get(first).unwrap().occupied(), 1);

        // The second join is refused and the first slot stays intact.
        server.dispatch(peer, join_request(second));
        assert_eq!(server.peer_rooms.get(&peer), Some(&first));
        assert_eq!(server.rooms.get(second).unwrap().occupied(), 0);
        assert_eq!(server.rooms.get(first).unwrap().occupied(), 1);
    }
}
