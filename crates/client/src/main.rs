mod session;

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use glam::Vec2;

use session::{ClientSession, SessionState};

#[derive(Parser)]
#[command(name = "clash-client")]
#[command(about = "Clash bot client")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short, long, default_value_t = clash::DEFAULT_PORT)]
    port: u16,

    /// Join this room instead of creating one.
    #[arg(short, long)]
    room: Option<u32>,

    /// Slots in the room when creating.
    #[arg(long, default_value_t = 1)]
    players: u8,

    /// Seconds to keep playing before quitting.
    #[arg(short, long, default_value_t = 30)]
    duration: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let addr: SocketAddr = format!("{}:{}", args.server, args.port).parse()?;
    let mut session = ClientSession::connect(addr)?;

    let created_room: Rc<Cell<Option<u32>>> = Rc::new(Cell::new(None));
    let joined = Rc::new(Cell::new(false));

    if let Some(room) = args.room {
        let joined = Rc::clone(&joined);
        session.request_join_room(room, move |result| match result {
            Ok(room) => {
                log::info!("joined room {room}");
                joined.set(true);
            }
            Err(e) => log::error!("join failed: {e}"),
        })?;
    } else {
        let created = Rc::clone(&created_room);
        session.request_create_room(args.players, move |result| match result {
            Ok(room) => {
                log::info!("created room {room}");
                created.set(Some(room));
            }
            Err(e) => log::error!("create failed: {e}"),
        })?;
    }

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration);
    let mut last_report = Instant::now();

    while !session.should_quit() {
        session.update()?;

        if let Some(room) = created_room.take() {
            let joined = Rc::clone(&joined);
            session.request_join_room(room, move |result| match result {
                Ok(room) => {
                    log::info!("joined room {room}");
                    joined.set(true);
                }
                Err(e) => log::error!("join failed: {e}"),
            })?;
        }

        if joined.take() {
            session.ready(|result| match result {
                Ok(room) => log::info!("match live in room {room}"),
                Err(e) => log::error!("match start failed: {e}"),
            })?;
        }

        if session.state() == SessionState::Playing {
            // Steer in a slow circle, swinging now and then.
            let t = started.elapsed().as_secs_f32() * 0.5;
            session.set_input(Vec2::new(t.cos(), t.sin()));
            if started.elapsed().as_millis() % 3000 < 20 {
                session.trigger_attack();
            }

            if last_report.elapsed() >= Duration::from_secs(1) {
                last_report = Instant::now();
                if let Some(position) = session.local_position() {
                    log::info!(
                        "step position ({:.2}, {:.2}), rtt {:.1}ms",
                        position.x,
                        position.y,
                        session.rtt_ms()
                    );
                }
            }
        }

        if Instant::now() >= deadline || session.state() == SessionState::Disconnected {
            session.request_quit();
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    Ok(())
}
