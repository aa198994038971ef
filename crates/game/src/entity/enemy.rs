use glam::Vec2;

use super::history::{History, Stamped};
use super::{lerp, EntityMode};
use crate::sim::FIXED_DT;

const CHASE_SPEED: f32 = 2.5;
/// Squared distance at which the current waypoint counts as reached.
const WAYPOINT_RADIUS_SQ: f32 = 1.0;

const SERVER_HISTORY: usize = 32;
/// Cloned enemies only interpolate, a short buffer is enough.
const CLONED_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct EnemySnapshot {
    pub step: u32,
    pub position: Vec2,
}

impl Stamped for EnemySnapshot {
    fn step(&self) -> u32 {
        self.step
    }
}

/// Waypoint-chasing enemy. The authoritative side steps it; clones buffer
/// received snapshots and interpolate.
pub struct Enemy {
    mode: EntityMode,
    states: History<EnemySnapshot>,
    waypoints: [Vec2; 3],
    waypoint_index: usize,
    has_changed: bool,
}

impl Enemy {
    pub fn new(mode: EntityMode, waypoints: [Vec2; 3]) -> Self {
        let capacity = if mode == EntityMode::SimulatedOnServer {
            SERVER_HISTORY
        } else {
            CLONED_HISTORY
        };
        let mut states = History::new(capacity);
        states.push_newest(EnemySnapshot {
            step: 0,
            position: waypoints[0],
        });

        Self {
            mode,
            states,
            waypoints,
            waypoint_index: 0,
            has_changed: false,
        }
    }

    pub fn mode(&self) -> EntityMode {
        self.mode
    }

    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    pub fn newest_snapshot(&self) -> &EnemySnapshot {
        self.states.newest().expect("state history is never empty")
    }

    fn step(&mut self, state: &mut EnemySnapshot) {
        let mut target = self.waypoints[self.waypoint_index];
        let mut to_target = target - state.position;

        if to_target.length_squared() <= WAYPOINT_RADIUS_SQ {
            self.waypoint_index = (self.waypoint_index + 1) % self.waypoints.len();
            target = self.waypoints[self.waypoint_index];
            to_target = target - state.position;
        }

        let dist = to_target.length();
        if dist > f32::EPSILON {
            state.position += (to_target / dist) * CHASE_SPEED * FIXED_DT;
        }

        state.step += 1;
    }

    /// Buffer a received snapshot. Not legal on the authoritative side.
    pub fn record_state(&mut self, snapshot: EnemySnapshot) {
        debug_assert!(self.mode != EntityMode::SimulatedOnServer);
        self.states.insert(snapshot);
    }

    pub fn advance(&mut self, step: u32) {
        if self.mode == EntityMode::Cloned {
            return;
        }

        self.has_changed = false;
        let Some(mut state) = self.states.newest().copied() else {
            debug_assert!(false, "state history is never empty");
            return;
        };

        while state.step < step {
            let mut next = state;
            self.step(&mut next);
            state = next;
            self.states.push_newest(state);
            self.has_changed = true;
        }
    }

    pub fn current_position(&self) -> Vec2 {
        self.newest_snapshot().position
    }

    /// Interpolated position at time `t` (seconds since go time), clamped
    /// to the oldest/newest retained state.
    pub fn position_at_time(&self, t: f32) -> Vec2 {
        let last = self.states.len() - 1;

        let mut i = last as isize;
        while i >= 0 && (self.states[i as usize].step as f32) * FIXED_DT < t {
            i -= 1;
        }

        if i < 0 {
            return self.states[0].position;
        }
        let i = i as usize;
        if i == last {
            return self.states[last].position;
        }

        let s0 = self.states[i + 1];
        let s1 = self.states[i];
        let t0 = s0.step as f32 * FIXED_DT;
        let t1 = s1.step as f32 * FIXED_DT;
        let u = (t - t0) / (t1 - t0);

        Vec2::new(
            lerp(s0.position.x, s1.position.x, u),
            lerp(s0.position.y, s1.position.y, u),
        )
    }
}
