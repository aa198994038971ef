//! Full match flow without sockets: a room on one side, a client level on
//! the other, every message round-tripped through the wire codec the way
//! the server and client binaries do it.

use std::time::Duration;

use glam::Vec2;

use clash::sim::FIXED_DT;
use clash::{
    GameRoom, Host, JoinError, Level, Message, PeerId, PlayerInput, RoomId, RoomState, StartStatus,
};

fn roundtrip(message: &Message, clock_offset_ms: i64) -> Message {
    Message::decode(&message.encode(), clock_offset_ms).expect("own messages decode")
}

#[test]
fn join_ready_go_input_state_reaches_a_reconciled_client() {
    let mut room = GameRoom::new(RoomId(7), 2, 0);

    // Both peers join; the first reply carries the layout the client
    // builds its level from.
    let join = room.join(PeerId(1)).unwrap();
    room.join(PeerId(2)).unwrap();
    assert_eq!(room.join(PeerId(1)).unwrap_err(), JoinError::AlreadyJoined);

    let Message::JoinRoom {
        room_data: Some(data),
        ..
    } = roundtrip(&join.message, 0)
    else {
        panic!("join reply without room data");
    };

    // Ready reports. Go time clears the worst round trip: 500 + 30/2.
    assert!(room.mark_ready(PeerId(1), 30.0, 500).is_empty());
    let gos = room.mark_ready(PeerId(2), 10.0, 500);
    assert_eq!(gos.len(), 2);
    assert_eq!(room.state(), RoomState::Playing);
    assert_eq!(room.go_time_ms(), 515);

    // Peer 1 sees the server clock 15ms ahead of its own, so the decoded
    // go time lands 15ms earlier on the peer's clock.
    let go = gos.iter().find(|o| o.peer == PeerId(1)).unwrap();
    let Message::StartGame {
        player_id,
        status: StartStatus::Go,
        go_time_ms,
        ..
    } = roundtrip(&go.message, 15)
    else {
        panic!("expected a go message");
    };
    assert_eq!(go_time_ms, 500);

    let mut client = Level::new_client(&data, player_id);
    let spawn = client.player(player_id).unwrap().current_position();

    // The client predicts twelve steps of running +x; only the first six
    // inputs have reached the server so far.
    for step in 0..12 {
        let input = PlayerInput {
            step,
            axes: Vec2::X,
            attack: false,
        };
        client.apply_input(player_id, input);
        if step < 6 {
            let Message::PlayerInputs { step, axes, attack } = roundtrip(
                &Message::PlayerInputs {
                    step: input.step,
                    axes: input.axes,
                    attack: input.attack,
                },
                0,
            ) else {
                panic!("expected inputs back");
            };
            room.handle_input(PeerId(1), PlayerInput { step, axes, attack });
        }
    }
    client.update(12);

    let predicted = *client.player(player_id).unwrap().newest_snapshot();
    assert_eq!(predicted.step, 12);
    assert!((predicted.position.x - spawn.x - 12.0 * 10.0 * FIXED_DT).abs() < 1e-4);

    // 100ms past go time the server has simulated six steps and broadcasts
    // what changed.
    let out = room.advance(615);
    assert!(!out.is_empty());

    let mut applied_player = false;
    for outgoing in out.iter().filter(|o| o.peer == PeerId(1)) {
        match roundtrip(&outgoing.message, 15) {
            Message::PlayerState { id, snapshot } => {
                client.apply_player_state(id, snapshot);
                if id == player_id {
                    assert_eq!(snapshot.step, 6);
                    applied_player = true;
                }
            }
            Message::EnemyState { id, snapshot } => {
                client.apply_enemy_state(id, snapshot);
            }
            other => panic!("unexpected broadcast: {other:?}"),
        }
    }
    assert!(applied_player);

    // The authoritative step 6 matched the client's retained prediction,
    // so the newer predicted steps survive untouched.
    let local = client.player(player_id).unwrap();
    assert_eq!(local.newest_snapshot().step, 12);
    assert_eq!(local.newest_snapshot().position, predicted.position);
    assert_eq!(local.smoothing_offset(), Vec2::ZERO);

    // Cloned enemies got their authoritative snapshots buffered.
    let enemy = client.enemy(0).unwrap();
    assert_eq!(enemy.newest_snapshot().step, 6);
}

#[test]
fn go_time_lands_on_the_receiver_clock_despite_skewed_epochs() {
    let mut server = Host::server("127.0.0.1:0", 4).unwrap();
    // Each host counts milliseconds from its own start; give the server a
    // healthy head start so the two clocks genuinely disagree.
    std::thread::sleep(Duration::from_millis(400));
    let mut client = Host::client(server.local_addr()).unwrap();

    for _ in 0..150 {
        server.service().unwrap();
        client.service().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    let offset = client.clock_offset_ms(PeerId(0));
    assert!(offset > 300, "offset estimate settled at {offset}ms");

    // The server stamps a go time on its own clock; decoded with the
    // client's offset estimate it must land ~500ms ahead on the client's.
    let go = Message::StartGame {
        room_id: 1,
        player_id: 0,
        status: StartStatus::Go,
        go_time_ms: server.now_ms() + 500,
    };
    let Message::StartGame { go_time_ms, .. } = Message::decode(&go.encode(), offset).unwrap()
    else {
        panic!("expected a go message");
    };

    let error = go_time_ms as i64 - (client.now_ms() + 500) as i64;
    assert!(error.abs() < 50, "go time lands {error}ms off the local clock");
}

#[test]
fn dropped_peer_before_start_reopens_the_room() {
    let mut room = GameRoom::new(RoomId(3), 2, 1_000);
    room.join(PeerId(1)).unwrap();
    room.join(PeerId(2)).unwrap();
    assert_eq!(room.state(), RoomState::WaitingPlayers);

    room.peer_dropped(PeerId(2), 2_000);
    assert_eq!(room.state(), RoomState::WaitingJoin);

    // The freed slot is usable again and the match can still start.
    room.join(PeerId(9)).unwrap();
    room.mark_ready(PeerId(1), 20.0, 3_000);
    let gos = room.mark_ready(PeerId(9), 20.0, 3_000);
    assert_eq!(gos.len(), 2);
    assert_eq!(room.state(), RoomState::Playing);
}
