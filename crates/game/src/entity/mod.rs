mod enemy;
mod history;
mod player;

pub use enemy::{Enemy, EnemySnapshot};
pub use history::{History, Stamped};
pub use player::{
    ATTACK_HIT_STEP, ATTACK_STEPS, ActionState, Player, PlayerInput, PlayerSnapshot, PlayerView,
};

/// Who drives an entity's state history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityMode {
    /// Authoritative: consumes buffered inputs, produces truth.
    SimulatedOnServer,
    /// Locally controlled: predicts ahead of server truth and reconciles.
    SimulatedLagless,
    /// Remote: driven purely by received snapshots, interpolation only.
    Cloned,
}

pub(crate) fn lerp(a: f32, b: f32, u: f32) -> f32 {
    a + (b - a) * u
}

/// Interpolate between two angles along the shortest arc.
pub(crate) fn angle_lerp(a0: f32, a1: f32, u: f32) -> f32 {
    use std::f32::consts::{PI, TAU};

    let mut delta = (a1 - a0) % TAU;
    if delta > PI {
        delta -= TAU;
    } else if delta < -PI {
        delta += TAU;
    }
    a0 + delta * u
}
