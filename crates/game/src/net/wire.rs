//! Tagged binary wire format.
//!
//! Every message is a 4-byte four-character tag followed by its fields in
//! declared order, all little-endian. Decoding is all-or-nothing: a short
//! buffer fails before a partially-populated message can escape.

use glam::Vec2;

use crate::entity::{ActionState, EnemySnapshot, PlayerSnapshot};
use crate::level::{EnemySpawn, PlayerSpawn, RoomData};

pub const UNKNOWN_ROOM: u32 = 0xffff_ffff;
pub const UNKNOWN_PLAYER: u8 = 0xff;

const TAG_CREATE_ROOM: u32 = u32::from_le_bytes(*b"CRRM");
const TAG_JOIN_ROOM: u32 = u32::from_le_bytes(*b"JNRM");
const TAG_START_GAME: u32 = u32::from_le_bytes(*b"STGM");
const TAG_PLAYER_INPUTS: u32 = u32::from_le_bytes(*b"PLIN");
const TAG_PLAYER_STATE: u32 = u32::from_le_bytes(*b"PLST");
const TAG_ENEMY_STATE: u32 = u32::from_le_bytes(*b"ENST");

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("buffer truncated at byte {0}")]
    Truncated(usize),
    #[error("unknown message tag {0:#010x}")]
    UnknownTag(u32),
    #[error("invalid value {value} for {field}")]
    InvalidField { field: &'static str, value: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JoinStatus {
    Request = 0,
    Success = 1,
    Fail = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StartStatus {
    Ready = 0,
    Go = 1,
    Fail = 2,
}

#[derive(Debug, Clone)]
pub enum Message {
    CreateRoom {
        room_id: u32,
        players_count: u8,
    },
    JoinRoom {
        room_id: u32,
        status: JoinStatus,
        /// Present only when `status` is `Success`.
        room_data: Option<RoomData>,
    },
    StartGame {
        room_id: u32,
        player_id: u8,
        status: StartStatus,
        /// Milliseconds on the receiver's clock once decoded; senders write
        /// their local clock and the decoder shifts by the peer offset.
        go_time_ms: u64,
    },
    PlayerInputs {
        step: u32,
        axes: Vec2,
        attack: bool,
    },
    PlayerState {
        id: u8,
        snapshot: PlayerSnapshot,
    },
    EnemyState {
        id: u8,
        snapshot: EnemySnapshot,
    },
}

impl Message {
    pub fn tag(&self) -> u32 {
        match self {
            Message::CreateRoom { .. } => TAG_CREATE_ROOM,
            Message::JoinRoom { .. } => TAG_JOIN_ROOM,
            Message::StartGame { .. } => TAG_START_GAME,
            Message::PlayerInputs { .. } => TAG_PLAYER_INPUTS,
            Message::PlayerState { .. } => TAG_PLAYER_STATE,
            Message::EnemyState { .. } => TAG_ENEMY_STATE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u32(self.tag());

        match self {
            Message::CreateRoom {
                room_id,
                players_count,
            } => {
                w.put_u32(*room_id);
                w.put_u8(*players_count);
            }
            Message::JoinRoom {
                room_id,
                status,
                room_data,
            } => {
                w.put_u32(*room_id);
                w.put_u8(*status as u8);
                if *status == JoinStatus::Success {
                    debug_assert!(room_data.is_some(), "success reply carries room data");
                    let empty = RoomData::default();
                    let data = room_data.as_ref().unwrap_or(&empty);
                    w.put_u8(data.players.len() as u8);
                    for spawn in &data.players {
                        w.put_vec2(spawn.position);
                    }
                    w.put_u8(data.enemies.len() as u8);
                    for spawn in &data.enemies {
                        for p in spawn.waypoints {
                            w.put_vec2(p);
                        }
                    }
                }
            }
            Message::StartGame {
                room_id,
                player_id,
                status,
                go_time_ms,
            } => {
                w.put_u32(*room_id);
                w.put_u8(*player_id);
                w.put_u8(*status as u8);
                w.put_u64(*go_time_ms);
            }
            Message::PlayerInputs { step, axes, attack } => {
                w.put_u32(*step);
                w.put_f32(axes.x);
                w.put_f32(axes.y);
                w.put_u8(*attack as u8);
            }
            Message::PlayerState { id, snapshot } => {
                w.put_u8(*id);
                w.put_u32(snapshot.step);
                w.put_f32(snapshot.position.x);
                w.put_f32(snapshot.position.y);
                w.put_f16(snapshot.direction.x);
                w.put_f16(snapshot.direction.y);
                w.put_u8(snapshot.action as u8);
                w.put_u32(snapshot.action_step);
            }
            Message::EnemyState { id, snapshot } => {
                w.put_u8(*id);
                w.put_u32(snapshot.step);
                w.put_f32(snapshot.position.x);
                w.put_f32(snapshot.position.y);
            }
        }

        w.into_bytes()
    }

    /// Decode a message, shifting timestamp fields onto the receiver's
    /// clock. `clock_offset_ms` is the sending peer's clock minus ours, so
    /// a sender-local timestamp lands locally as `raw - offset`.
    pub fn decode(data: &[u8], clock_offset_ms: i64) -> Result<Self, WireError> {
        let mut r = WireReader::new(data);

        let message = match r.get_u32()? {
            TAG_CREATE_ROOM => Message::CreateRoom {
                room_id: r.get_u32()?,
                players_count: r.get_u8()?,
            },
            TAG_JOIN_ROOM => {
                let room_id = r.get_u32()?;
                let status = match r.get_u8()? {
                    0 => JoinStatus::Request,
                    1 => JoinStatus::Success,
                    2 => JoinStatus::Fail,
                    value => {
                        return Err(WireError::InvalidField {
                            field: "join status",
                            value,
                        });
                    }
                };
                let room_data = if status == JoinStatus::Success {
                    let players = (0..r.get_u8()?)
                        .map(|_| {
                            Ok(PlayerSpawn {
                                position: r.get_vec2()?,
                            })
                        })
                        .collect::<Result<_, WireError>>()?;
                    let enemies = (0..r.get_u8()?)
                        .map(|_| {
                            Ok(EnemySpawn {
                                waypoints: [r.get_vec2()?, r.get_vec2()?, r.get_vec2()?],
                            })
                        })
                        .collect::<Result<_, WireError>>()?;
                    Some(RoomData { players, enemies })
                } else {
                    None
                };
                Message::JoinRoom {
                    room_id,
                    status,
                    room_data,
                }
            }
            TAG_START_GAME => {
                let room_id = r.get_u32()?;
                let player_id = r.get_u8()?;
                let status = match r.get_u8()? {
                    0 => StartStatus::Ready,
                    1 => StartStatus::Go,
                    2 => StartStatus::Fail,
                    value => {
                        return Err(WireError::InvalidField {
                            field: "start status",
                            value,
                        });
                    }
                };
                let raw = r.get_u64()?;
                Message::StartGame {
                    room_id,
                    player_id,
                    status,
                    go_time_ms: (raw as i64 - clock_offset_ms).max(0) as u64,
                }
            }
            TAG_PLAYER_INPUTS => Message::PlayerInputs {
                step: r.get_u32()?,
                axes: Vec2::new(r.get_f32()?, r.get_f32()?),
                attack: r.get_u8()? != 0,
            },
            TAG_PLAYER_STATE => {
                let id = r.get_u8()?;
                let step = r.get_u32()?;
                let position = Vec2::new(r.get_f32()?, r.get_f32()?);
                let direction = Vec2::new(r.get_f16()?, r.get_f16()?);
                let action = ActionState::from(r.get_u8()?);
                let action_step = r.get_u32()?;
                Message::PlayerState {
                    id,
                    snapshot: PlayerSnapshot {
                        step,
                        position,
                        direction,
                        action,
                        action_step,
                    },
                }
            }
            TAG_ENEMY_STATE => Message::EnemyState {
                id: r.get_u8()?,
                snapshot: EnemySnapshot {
                    step: r.get_u32()?,
                    position: Vec2::new(r.get_f32()?, r.get_f32()?),
                },
            },
            tag => return Err(WireError::UnknownTag(tag)),
        };

        Ok(message)
    }
}

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f16(&mut self, v: f32) {
        self.buf.extend_from_slice(&f32_to_f16_bits(v).to_le_bytes());
    }

    fn put_vec2(&mut self, v: Vec2) {
        self.put_f32(v.x);
        self.put_f32(v.y);
    }
}

struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(WireError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn get_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_f16(&mut self) -> Result<f32, WireError> {
        Ok(f16_bits_to_f32(u16::from_le_bytes(
            self.take(2)?.try_into().unwrap(),
        )))
    }

    fn get_vec2(&mut self) -> Result<Vec2, WireError> {
        Ok(Vec2::new(self.get_f32()?, self.get_f32()?))
    }
}

/// IEEE 754 binary16 conversion, round-to-nearest. Direction components
/// live in [-1, 1], well inside half precision.
fn f32_to_f16_bits(v: f32) -> u16 {
    let bits = v.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let man = bits & 0x007f_ffff;

    if exp == 0xff {
        // Inf or NaN.
        return sign | 0x7c00 | if man != 0 { 0x0200 } else { 0 };
    }

    let e = exp - 127 + 15;
    if e >= 0x1f {
        sign | 0x7c00
    } else if e <= 0 {
        if e < -10 {
            return sign;
        }
        let man = man | 0x0080_0000;
        let shift = (14 - e) as u32;
        let mut half = sign | (man >> shift) as u16;
        if man & (1 << (shift - 1)) != 0 {
            half += 1;
        }
        half
    } else {
        let mut half = sign | ((e as u16) << 10) | ((man >> 13) as u16);
        if man & 0x1000 != 0 {
            half += 1;
        }
        half
    }
}

fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let man = (bits & 0x03ff) as u32;

    let out = match (exp, man) {
        (0, 0) => sign,
        (0, m) => {
            // Subnormal: renormalize into f32 range.
            let msb = 31 - m.leading_zeros();
            let exp32 = (msb as i32 - 24 + 127) as u32;
            let man32 = (m << (23 - msb)) & 0x007f_ffff;
            sign | (exp32 << 23) | man32
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7fc0_0000,
        _ => sign | ((exp + 127 - 15) << 23) | (man << 13),
    };

    f32::from_bits(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: &Message) -> Message {
        Message::decode(&message.encode(), 0).unwrap()
    }

    #[test]
    fn create_room_roundtrip() {
        let m = Message::CreateRoom {
            room_id: UNKNOWN_ROOM,
            players_count: 4,
        };
        match roundtrip(&m) {
            Message::CreateRoom {
                room_id,
                players_count,
            } => {
                assert_eq!(room_id, UNKNOWN_ROOM);
                assert_eq!(players_count, 4);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn join_room_success_carries_room_data() {
        let data = RoomData::generate(3, 2);
        let m = Message::JoinRoom {
            room_id: 3,
            status: JoinStatus::Success,
            room_data: Some(data.clone()),
        };
        match roundtrip(&m) {
            Message::JoinRoom {
                room_id,
                status,
                room_data,
            } => {
                assert_eq!(room_id, 3);
                assert_eq!(status, JoinStatus::Success);
                let decoded = room_data.unwrap();
                assert_eq!(decoded.players.len(), 2);
                assert_eq!(decoded.enemies.len(), 3);
                assert_eq!(decoded.players[0].position, data.players[0].position);
                assert_eq!(decoded.enemies[2].waypoints, data.enemies[2].waypoints);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn join_room_fail_omits_room_data() {
        let m = Message::JoinRoom {
            room_id: 9,
            status: JoinStatus::Fail,
            room_data: None,
        };
        let bytes = m.encode();
        assert_eq!(bytes.len(), 4 + 4 + 1);
        match Message::decode(&bytes, 0).unwrap() {
            Message::JoinRoom { room_data, .. } => assert!(room_data.is_none()),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn start_game_timestamp_is_clock_compensated() {
        // The sender's clock runs 250ms ahead of ours (offset = theirs −
        // ours), so its timestamps land 250ms earlier on our clock.
        let m = Message::StartGame {
            room_id: 1,
            player_id: 0,
            status: StartStatus::Go,
            go_time_ms: 10_000,
        };
        match Message::decode(&m.encode(), 250).unwrap() {
            Message::StartGame { go_time_ms, .. } => assert_eq!(go_time_ms, 9_750),
            other => panic!("wrong variant: {:?}", other),
        }

        // A sender running behind shifts the other way.
        match Message::decode(&m.encode(), -250).unwrap() {
            Message::StartGame { go_time_ms, .. } => assert_eq!(go_time_ms, 10_250),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn player_state_direction_survives_quantization() {
        let dir = Vec2::new(0.6, -0.8);
        let m = Message::PlayerState {
            id: 2,
            snapshot: PlayerSnapshot {
                step: 77,
                position: Vec2::new(4.25, -1.5),
                direction: dir,
                action: ActionState::Attacking,
                action_step: 70,
            },
        };
        match roundtrip(&m) {
            Message::PlayerState { id, snapshot } => {
                assert_eq!(id, 2);
                assert_eq!(snapshot.step, 77);
                assert_eq!(snapshot.position, Vec2::new(4.25, -1.5));
                assert_eq!(snapshot.action, ActionState::Attacking);
                assert_eq!(snapshot.action_step, 70);
                // Half precision: ~3 decimal digits on unit components.
                assert!((snapshot.direction.x - dir.x).abs() < 1e-3);
                assert!((snapshot.direction.y - dir.y).abs() < 1e-3);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn player_inputs_roundtrip() {
        let m = Message::PlayerInputs {
            step: 123,
            axes: Vec2::new(-0.25, 1.0),
            attack: true,
        };
        match roundtrip(&m) {
            Message::PlayerInputs { step, axes, attack } => {
                assert_eq!(step, 123);
                assert_eq!(axes, Vec2::new(-0.25, 1.0));
                assert!(attack);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = u32::from_le_bytes(*b"XXXX").to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);
        assert!(matches!(
            Message::decode(&bytes, 0),
            Err(WireError::UnknownTag(_))
        ));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let m = Message::EnemyState {
            id: 1,
            snapshot: EnemySnapshot {
                step: 5,
                position: Vec2::ONE,
            },
        };
        let bytes = m.encode();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 2], 0),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn half_float_edge_values() {
        for v in [0.0f32, -0.0, 1.0, -1.0, 0.5, 0.70710677] {
            let back = f16_bits_to_f32(f32_to_f16_bits(v));
            assert!((back - v).abs() < 5e-4, "{} -> {}", v, back);
        }
        assert!(f16_bits_to_f32(f32_to_f16_bits(f32::INFINITY)).is_infinite());
        assert!(f16_bits_to_f32(f32_to_f16_bits(f32::NAN)).is_nan());
        // Values beyond half range saturate to infinity.
        assert!(f16_bits_to_f32(f32_to_f16_bits(1e6)).is_infinite());
    }
}
