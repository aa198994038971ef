//! UDP host with acked packets, a reliable-sequenced session channel and
//! an unreliable state channel, plus ping-based RTT and clock-offset
//! estimation.
//!
//! Every datagram carries a fixed header (magic, version, kind, sequence,
//! ack, ack bitfield). Reliable messages are resent until a packet that
//! carried them is acked; the session channel additionally holds back
//! out-of-order messages so they surface in send order.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use super::tracking::{AckTracker, ReceiveTracker, sequence_greater_than};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u8 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x434C_5348;
pub const DEFAULT_PORT: u16 = 27060;

const HEADER_LEN: usize = 18;
const PAYLOAD_PREFIX_LEN: usize = 6;

const KIND_CONNECT: u8 = 0;
const KIND_CONNECT_ACK: u8 = 1;
const KIND_DISCONNECT: u8 = 2;
const KIND_PING: u8 = 3;
const KIND_PONG: u8 = 4;
const KIND_PAYLOAD: u8 = 5;

const CONNECT_RETRY: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_millis(200);
const PEER_TIMEOUT: Duration = Duration::from_secs(10);
const OFFSET_GAIN: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Logical message lanes multiplexed over one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Matchmaking traffic; reliable-sequenced.
    Session = 0,
    /// Per-step entity traffic; losses are covered by later snapshots.
    State = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

#[derive(Debug)]
pub enum Event {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Message {
        peer: PeerId,
        channel: Channel,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug)]
struct ReliableMessage {
    channel: Channel,
    message_seq: u32,
    payload: Vec<u8>,
    /// Packet sequence of the latest transmission.
    sequence: u32,
    last_send: Instant,
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    connected: bool,
    send_sequence: u32,
    ack: AckTracker,
    receive: ReceiveTracker,
    last_receive: Instant,
    last_ping: Instant,
    next_out_seq: [u32; 2],
    next_in_seq: u32,
    holdback: HashMap<u32, Vec<u8>>,
    pending: Vec<ReliableMessage>,
    clock_offset_ms: Option<f64>,
}

impl Peer {
    fn new(addr: SocketAddr, connected: bool) -> Self {
        let now = Instant::now();
        Self {
            addr,
            connected,
            send_sequence: 0,
            ack: AckTracker::new(256),
            receive: ReceiveTracker::new(),
            last_receive: now,
            last_ping: now,
            next_out_seq: [0; 2],
            next_in_seq: 0,
            holdback: HashMap::new(),
            pending: Vec::new(),
            clock_offset_ms: None,
        }
    }
}

#[derive(Debug)]
enum Mode {
    Server { max_peers: usize },
    Client { last_attempt: Instant, deadline: Instant },
}

pub struct Host {
    socket: UdpSocket,
    local_addr: SocketAddr,
    mode: Mode,
    peers: HashMap<PeerId, Peer>,
    by_addr: HashMap<SocketAddr, PeerId>,
    next_peer_id: u32,
    epoch: Instant,
    stats: TransportStats,
}

impl Host {
    pub fn server<A: ToSocketAddrs>(addr: A, max_peers: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            mode: Mode::Server { max_peers },
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_peer_id: 1,
            epoch: Instant::now(),
            stats: TransportStats::default(),
        })
    }

    /// Binds an ephemeral port and starts the handshake towards `remote`.
    /// The server shows up as peer `#0` once `ConnectAck` arrives.
    pub fn client(remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let now = Instant::now();
        let mut host = Self {
            socket,
            local_addr,
            mode: Mode::Client {
                last_attempt: now,
                deadline: now + CONNECT_TIMEOUT,
            },
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_peer_id: 1,
            epoch: now,
            stats: TransportStats::default(),
        };

        let id = PeerId(0);
        host.peers.insert(id, Peer::new(remote, false));
        host.by_addr.insert(remote, id);
        if let Some(peer) = host.peers.get_mut(&id) {
            transmit(&host.socket, &mut host.stats, peer, KIND_CONNECT, &[])?;
        }

        Ok(host)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Milliseconds since this host started; the time base for ping frames
    /// and clock-offset-compensated timestamps.
    pub fn now_ms(&self) -> u64 {
        now_ms(self.epoch)
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|p| p.connected)
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.get(&peer).map(|p| p.addr)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn rtt_ms(&self, peer: PeerId) -> f32 {
        self.peers.get(&peer).map_or(0.0, |p| p.ack.srtt())
    }

    /// Estimated difference between the peer's clock and ours, in ms.
    /// Zero until the first pong comes back.
    pub fn clock_offset_ms(&self, peer: PeerId) -> i64 {
        self.peers
            .get(&peer)
            .and_then(|p| p.clock_offset_ms)
            .map_or(0, |o| o.round() as i64)
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn send(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        reliability: Reliability,
        channel: Channel,
    ) -> io::Result<()> {
        let Some(p) = self.peers.get_mut(&peer) else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "unknown peer"));
        };
        if !p.connected {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "handshake not finished",
            ));
        }

        let message_seq = p.next_out_seq[channel as usize];
        p.next_out_seq[channel as usize] = message_seq.wrapping_add(1);

        let mut body = Vec::with_capacity(PAYLOAD_PREFIX_LEN + bytes.len());
        body.push(channel as u8);
        body.push((reliability == Reliability::Reliable) as u8);
        body.extend_from_slice(&message_seq.to_le_bytes());
        body.extend_from_slice(bytes);

        let sequence = transmit(&self.socket, &mut self.stats, p, KIND_PAYLOAD, &body)?;

        if reliability == Reliability::Reliable {
            p.pending.push(ReliableMessage {
                channel,
                message_seq,
                payload: bytes.to_vec(),
                sequence,
                last_send: Instant::now(),
            });
        }

        Ok(())
    }

    /// Tells the peer we are leaving and forgets it. Best effort; the
    /// frame itself is not retried.
    pub fn disconnect(&mut self, peer: PeerId) -> io::Result<()> {
        if let Some(p) = self.peers.get_mut(&peer) {
            transmit(&self.socket, &mut self.stats, p, KIND_DISCONNECT, &[])?;
            let addr = p.addr;
            self.by_addr.remove(&addr);
            self.peers.remove(&peer);
        }
        Ok(())
    }

    /// Drains the socket, runs handshake/ping/resend/timeout timers and
    /// returns everything that happened. Call once per tick.
    pub fn service(&mut self) -> io::Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((size, addr)) => self.handle_datagram(&buf[..size], addr, &mut events)?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        self.drive_timers(&mut events)?;
        Ok(events)
    }

    fn handle_datagram(
        &mut self,
        data: &[u8],
        addr: SocketAddr,
        events: &mut Vec<Event>,
    ) -> io::Result<()> {
        if data.len() < HEADER_LEN {
            return Ok(());
        }
        if read_u32(&data[0..4]) != PROTOCOL_MAGIC || data[4] != PROTOCOL_VERSION {
            trace!("bad magic/version from {addr}");
            return Ok(());
        }
        let kind = data[5];
        let sequence = read_u32(&data[6..10]);
        let ack = read_u32(&data[10..14]);
        let ack_bitfield = read_u32(&data[14..18]);
        let body = &data[HEADER_LEN..];

        let id = match self.by_addr.get(&addr).copied() {
            Some(id) => id,
            None => {
                if kind != KIND_CONNECT {
                    trace!("dropping frame from unknown address {addr}");
                    return Ok(());
                }
                let Mode::Server { max_peers } = self.mode else {
                    return Ok(());
                };
                if self.peers.len() >= max_peers {
                    warn!("refusing connection from {addr}: peer table full");
                    self.send_unsessioned(addr, KIND_DISCONNECT)?;
                    return Ok(());
                }
                let id = PeerId(self.next_peer_id);
                self.next_peer_id += 1;
                self.peers.insert(id, Peer::new(addr, true));
                self.by_addr.insert(addr, id);
                debug!("peer {id} connected from {addr}");
                events.push(Event::PeerConnected(id));
                id
            }
        };

        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };

        if !peer.receive.record_received(sequence) {
            return Ok(());
        }
        let acked = peer.ack.process_ack(ack, ack_bitfield);
        if !acked.is_empty() {
            peer.pending.retain(|m| !acked.contains(&m.sequence));
        }
        peer.last_receive = Instant::now();
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        match kind {
            KIND_CONNECT => {
                // Retransmitted request; ack it again.
                transmit(&self.socket, &mut self.stats, peer, KIND_CONNECT_ACK, &[])?;
            }
            KIND_CONNECT_ACK => {
                if !peer.connected {
                    peer.connected = true;
                    debug!("connected to {}", peer.addr);
                    events.push(Event::PeerConnected(id));
                }
            }
            KIND_DISCONNECT => {
                debug!("peer {id} disconnected");
                self.by_addr.remove(&addr);
                self.peers.remove(&id);
                events.push(Event::PeerDisconnected(id));
            }
            KIND_PING => {
                if body.len() >= 8 {
                    let mut reply = [0u8; 16];
                    reply[..8].copy_from_slice(&body[..8]);
                    reply[8..].copy_from_slice(&now_ms(self.epoch).to_le_bytes());
                    transmit(&self.socket, &mut self.stats, peer, KIND_PONG, &reply)?;
                }
            }
            KIND_PONG => {
                if body.len() >= 16 {
                    let echo = read_u64(&body[0..8]);
                    let remote_now = read_u64(&body[8..16]);
                    let now = now_ms(self.epoch);
                    if now >= echo {
                        let rtt = (now - echo) as i64;
                        let sample = (remote_now as i64 + rtt / 2 - now as i64) as f64;
                        peer.clock_offset_ms = Some(match peer.clock_offset_ms {
                            Some(prev) => prev + (sample - prev) * OFFSET_GAIN,
                            None => sample,
                        });
                    }
                }
            }
            KIND_PAYLOAD => {
                if body.len() < PAYLOAD_PREFIX_LEN {
                    return Ok(());
                }
                let channel = match body[0] {
                    0 => Channel::Session,
                    1 => Channel::State,
                    other => {
                        trace!("unknown channel {other} from peer {id}");
                        return Ok(());
                    }
                };
                let reliable = body[1] & 1 != 0;
                let message_seq = read_u32(&body[2..6]);
                let bytes = body[PAYLOAD_PREFIX_LEN..].to_vec();

                if reliable && channel == Channel::Session {
                    if message_seq == peer.next_in_seq {
                        events.push(Event::Message {
                            peer: id,
                            channel,
                            bytes,
                        });
                        peer.next_in_seq = peer.next_in_seq.wrapping_add(1);
                        while let Some(held) = peer.holdback.remove(&peer.next_in_seq) {
                            events.push(Event::Message {
                                peer: id,
                                channel,
                                bytes: held,
                            });
                            peer.next_in_seq = peer.next_in_seq.wrapping_add(1);
                        }
                    } else if sequence_greater_than(message_seq, peer.next_in_seq) {
                        peer.holdback.insert(message_seq, bytes);
                    }
                    // Older than the cursor: retransmit of something
                    // already delivered.
                } else {
                    events.push(Event::Message {
                        peer: id,
                        channel,
                        bytes,
                    });
                }
            }
            other => trace!("unknown frame kind {other} from peer {id}"),
        }

        Ok(())
    }

    fn drive_timers(&mut self, events: &mut Vec<Event>) -> io::Result<()> {
        // Handshake retries until the server acks or the deadline passes.
        if let Mode::Client {
            last_attempt,
            deadline,
        } = &mut self.mode
        {
            let id = PeerId(0);
            let mut give_up = None;
            if let Some(peer) = self.peers.get_mut(&id) {
                if !peer.connected {
                    let now = Instant::now();
                    if now >= *deadline {
                        give_up = Some(peer.addr);
                    } else if now.duration_since(*last_attempt) >= CONNECT_RETRY {
                        *last_attempt = now;
                        transmit(&self.socket, &mut self.stats, peer, KIND_CONNECT, &[])?;
                    }
                }
            }
            if let Some(addr) = give_up {
                warn!("connection to {addr} timed out");
                self.by_addr.remove(&addr);
                self.peers.remove(&id);
                events.push(Event::PeerDisconnected(id));
            }
        }

        let now = Instant::now();
        let epoch = self.epoch;
        let mut dead = Vec::new();

        for (&id, peer) in self.peers.iter_mut() {
            if now.duration_since(peer.last_receive) > PEER_TIMEOUT {
                dead.push(id);
                continue;
            }
            if !peer.connected {
                continue;
            }

            if now.duration_since(peer.last_ping) >= PING_INTERVAL {
                peer.last_ping = now;
                let body = now_ms(epoch).to_le_bytes();
                transmit(&self.socket, &mut self.stats, peer, KIND_PING, &body)?;
            }

            let rto = Duration::from_millis(peer.ack.rto_ms() as u64);
            for i in 0..peer.pending.len() {
                if now.duration_since(peer.pending[i].last_send) < rto {
                    continue;
                }
                let body = {
                    let msg = &peer.pending[i];
                    let mut b = Vec::with_capacity(PAYLOAD_PREFIX_LEN + msg.payload.len());
                    b.push(msg.channel as u8);
                    b.push(1);
                    b.extend_from_slice(&msg.message_seq.to_le_bytes());
                    b.extend_from_slice(&msg.payload);
                    b
                };
                let sequence = transmit(&self.socket, &mut self.stats, peer, KIND_PAYLOAD, &body)?;
                let msg = &mut peer.pending[i];
                msg.sequence = sequence;
                msg.last_send = now;
            }
        }

        for id in dead {
            if let Some(peer) = self.peers.remove(&id) {
                self.by_addr.remove(&peer.addr);
                warn!("peer {id} timed out");
                events.push(Event::PeerDisconnected(id));
            }
        }

        Ok(())
    }

    /// One-shot frame to an address we refuse to track.
    fn send_unsessioned(&mut self, addr: SocketAddr, kind: u8) -> io::Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        write_header(&mut buf, kind, 0, 0, 0);
        let n = self.socket.send_to(&buf, addr)?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += n as u64;
        Ok(())
    }
}

fn now_ms(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

fn write_header(buf: &mut Vec<u8>, kind: u8, sequence: u32, ack: u32, ack_bitfield: u32) {
    buf.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
    buf.push(PROTOCOL_VERSION);
    buf.push(kind);
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&ack.to_le_bytes());
    buf.extend_from_slice(&ack_bitfield.to_le_bytes());
}

fn transmit(
    socket: &UdpSocket,
    stats: &mut TransportStats,
    peer: &mut Peer,
    kind: u8,
    body: &[u8],
) -> io::Result<u32> {
    if HEADER_LEN + body.len() > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "packet exceeds MTU",
        ));
    }

    let sequence = peer.send_sequence;
    peer.send_sequence = peer.send_sequence.wrapping_add(1);
    let (ack, ack_bitfield) = peer.receive.ack_data();

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    write_header(&mut buf, kind, sequence, ack, ack_bitfield);
    buf.extend_from_slice(body);

    let n = socket.send_to(&buf, peer.addr)?;
    peer.ack.track_packet(sequence);
    stats.packets_sent += 1;
    stats.bytes_sent += n as u64;

    Ok(sequence)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Host, Host) {
        let server = Host::server("127.0.0.1:0", 8).unwrap();
        let client = Host::client(server.local_addr()).unwrap();
        (server, client)
    }

    fn pump(server: &mut Host, client: &mut Host, iterations: u32) -> (Vec<Event>, Vec<Event>) {
        let mut server_events = Vec::new();
        let mut client_events = Vec::new();
        for _ in 0..iterations {
            server_events.extend(server.service().unwrap());
            client_events.extend(client.service().unwrap());
            std::thread::sleep(Duration::from_millis(2));
        }
        (server_events, client_events)
    }

    fn messages(events: &[Event]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Message { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn handshake_connects_both_sides() {
        let (mut server, mut client) = pair();
        let (server_events, client_events) = pump(&mut server, &mut client, 20);

        assert!(
            server_events
                .iter()
                .any(|e| matches!(e, Event::PeerConnected(_)))
        );
        assert!(
            client_events
                .iter()
                .any(|e| matches!(e, Event::PeerConnected(PeerId(0))))
        );
        assert!(client.is_connected(PeerId(0)));
    }

    #[test]
    fn reliable_session_messages_arrive_in_order() {
        let (mut server, mut client) = pair();
        pump(&mut server, &mut client, 20);

        client
            .send(PeerId(0), b"first", Reliability::Reliable, Channel::Session)
            .unwrap();
        client
            .send(PeerId(0), b"second", Reliability::Reliable, Channel::Session)
            .unwrap();

        let (server_events, _) = pump(&mut server, &mut client, 20);
        assert_eq!(
            messages(&server_events),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn unreliable_state_messages_arrive() {
        let (mut server, mut client) = pair();
        pump(&mut server, &mut client, 20);

        server
            .send(
                PeerId(1),
                b"snapshot",
                Reliability::Unreliable,
                Channel::State,
            )
            .unwrap();

        let (_, client_events) = pump(&mut server, &mut client, 20);
        assert_eq!(messages(&client_events), vec![b"snapshot".to_vec()]);
    }

    fn payload_frame(packet_seq: u32, message_seq: u32, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        write_header(&mut frame, KIND_PAYLOAD, packet_seq, 0, 0);
        frame.push(Channel::Session as u8);
        frame.push(1);
        frame.extend_from_slice(&message_seq.to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn session_channel_holds_back_out_of_order_messages() {
        let mut host = Host::server("127.0.0.1:0", 8).unwrap();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let id = PeerId(1);
        host.peers.insert(id, Peer::new(addr, true));
        host.by_addr.insert(addr, id);

        let mut events = Vec::new();
        // Message 1 arrives before message 0 and must wait for it.
        host.handle_datagram(&payload_frame(0, 1, b"second"), addr, &mut events)
            .unwrap();
        assert!(messages(&events).is_empty());

        host.handle_datagram(&payload_frame(1, 0, b"first"), addr, &mut events)
            .unwrap();
        assert_eq!(
            messages(&events),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn send_before_handshake_is_rejected() {
        let server = Host::server("127.0.0.1:0", 8).unwrap();
        let mut client = Host::client(server.local_addr()).unwrap();

        let err = client
            .send(PeerId(0), b"early", Reliability::Reliable, Channel::Session)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn pings_settle_rtt_and_clock_offset() {
        let (mut server, mut client) = pair();
        // Long enough for several ping exchanges.
        pump(&mut server, &mut client, 150);

        assert!(client.rtt_ms(PeerId(0)) > 0.0);
        // Same machine, same clock rate: the offset estimate stays small.
        assert!(client.clock_offset_ms(PeerId(0)).abs() < 100);
    }

    #[test]
    fn disconnect_notifies_remote() {
        let (mut server, mut client) = pair();
        pump(&mut server, &mut client, 20);

        client.disconnect(PeerId(0)).unwrap();
        let (server_events, _) = pump(&mut server, &mut client, 20);
        assert!(
            server_events
                .iter()
                .any(|e| matches!(e, Event::PeerDisconnected(_)))
        );
    }
}
