use glam::Vec2;

use super::history::{History, Stamped};
use super::{angle_lerp, lerp, EntityMode};
use crate::sim::FIXED_DT;

pub const HISTORY_CAPACITY: usize = 32;

const MOVE_SPEED: f32 = 10.0;
const MOVE_DEADZONE: f32 = 0.02;
/// An attack runs for this many steps, speed decaying linearly to zero.
pub const ATTACK_STEPS: u32 = 30;
/// Step within a swing at which the hit is resolved.
pub const ATTACK_HIT_STEP: u32 = 15;
/// Squared distance between predicted and authoritative position below
/// which the prediction is accepted as-is.
const TOLERANCE_SQ: f32 = 0.0025;
/// Multiplicative decay of the visual smoothing offset per lagless step.
const OFFSET_DECAY: f32 = 1.0 - FIXED_DT * 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionState {
    Idle = 0,
    Moving = 1,
    Attacking = 2,
}

impl From<u8> for ActionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ActionState::Moving,
            2 => ActionState::Attacking,
            _ => ActionState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerInput {
    pub step: u32,
    pub axes: Vec2,
    pub attack: bool,
}

impl Stamped for PlayerInput {
    fn step(&self) -> u32 {
        self.step
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerSnapshot {
    pub step: u32,
    pub position: Vec2,
    pub direction: Vec2,
    pub action: ActionState,
    /// Step at which `action` was last entered.
    pub action_step: u32,
}

impl PlayerSnapshot {
    pub fn spawn(position: Vec2) -> Self {
        Self {
            step: 0,
            position,
            direction: Vec2::X,
            action: ActionState::Idle,
            action_step: 0,
        }
    }
}

impl Stamped for PlayerSnapshot {
    fn step(&self) -> u32 {
        self.step
    }
}

/// Interpolated view of a player at an arbitrary time.
#[derive(Debug, Clone, Copy)]
pub struct PlayerView {
    pub position: Vec2,
    pub direction: Vec2,
    pub action: ActionState,
    /// Seconds since the action was entered.
    pub action_time: f32,
}

pub struct Player {
    mode: EntityMode,
    inputs: History<PlayerInput>,
    states: History<PlayerSnapshot>,
    /// Lagless-only visual correction added on top of the simulated
    /// position so a resimulation does not pop the displayed position.
    offset: Vec2,
    has_changed: bool,
}

impl Player {
    pub fn new(mode: EntityMode, spawn: Vec2) -> Self {
        let mut states = History::new(HISTORY_CAPACITY);
        states.push_newest(PlayerSnapshot::spawn(spawn));

        Self {
            mode,
            inputs: History::new(HISTORY_CAPACITY),
            states,
            offset: Vec2::ZERO,
            has_changed: false,
        }
    }

    pub fn mode(&self) -> EntityMode {
        self.mode
    }

    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    pub fn smoothing_offset(&self) -> Vec2 {
        self.offset
    }

    pub fn buffered_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn buffered_states(&self) -> usize {
        self.states.len()
    }

    /// Freshest simulated state, without the smoothing offset.
    pub fn newest_snapshot(&self) -> &PlayerSnapshot {
        self.states.newest().expect("state history is never empty")
    }

    /// Advance one state by one input. Pure: no history side effects.
    pub fn step(state: &mut PlayerSnapshot, input: &PlayerInput) {
        debug_assert!(state.step <= input.step);

        let len = input.axes.length();
        let mag = len.min(1.0);
        let dir = if len > f32::EPSILON {
            input.axes / len
        } else {
            Vec2::ZERO
        };
        let moving = mag > MOVE_DEADZONE;
        let next = input.step + 1;

        match state.action {
            ActionState::Idle | ActionState::Moving if input.attack => {
                state.action = ActionState::Attacking;
                state.action_step = next;
                if moving {
                    state.direction = dir;
                }
                state.position += state.direction * MOVE_SPEED * FIXED_DT;
            }
            ActionState::Idle => {
                if moving {
                    state.action = ActionState::Moving;
                    state.action_step = next;
                    state.position += dir * mag * mag * MOVE_SPEED * FIXED_DT;
                    state.direction = dir;
                }
            }
            ActionState::Moving => {
                if !moving {
                    state.action = ActionState::Idle;
                    state.action_step = next;
                } else {
                    state.position += dir * mag * mag * MOVE_SPEED * FIXED_DT;
                    state.direction = dir;
                }
            }
            ActionState::Attacking => {
                let attack_step = next.saturating_sub(state.action_step);
                let speed = lerp(MOVE_SPEED, 0.0, attack_step as f32 / ATTACK_STEPS as f32);
                state.position += state.direction * speed * FIXED_DT;

                if attack_step >= ATTACK_STEPS {
                    state.action = ActionState::Idle;
                    state.action_step = next;
                }
            }
        }

        state.step = next;
    }

    /// Buffer an input. Not legal on cloned entities.
    pub fn record_input(&mut self, input: PlayerInput) {
        debug_assert!(self.mode != EntityMode::Cloned);
        self.inputs.insert(input);
    }

    /// Accept a received state snapshot. Not legal on the authoritative side.
    ///
    /// Cloned entities buffer the snapshot for interpolation. The lagless
    /// entity reconciles: if the authoritative state is newer than every
    /// prediction it snaps to it outright; otherwise the prediction made for
    /// that step is checked against it, and on a misprediction the history
    /// is rebuilt by resimulating the retained inputs forward from the
    /// authoritative state.
    pub fn record_state(&mut self, snapshot: PlayerSnapshot) {
        debug_assert!(self.mode != EntityMode::SimulatedOnServer);

        if self.mode == EntityMode::Cloned {
            self.states.insert(snapshot);
            return;
        }

        if snapshot.step >= self.newest_snapshot().step {
            // Newer than every prediction: no local state to check, snap.
            self.states.clear();
            self.states.push_newest(snapshot);
            self.offset = Vec2::ZERO;
            return;
        }

        let i = self.states.insertion_index(snapshot.step);
        let Some(predicted) = self.states.get(i).copied() else {
            // Older than everything retained; nothing left to reconcile.
            return;
        };

        // Predictions newer than the snapshot stay; the matched state and
        // everything older are spent.
        self.states.truncate(i);

        if snapshot.position.distance_squared(predicted.position) <= TOLERANCE_SQ {
            return;
        }

        // Misprediction. Remember what is currently on screen, rebuild the
        // history from the authoritative state, and fold the difference into
        // the smoothing offset so the correction is invisible.
        let latest = self.states[0];
        let shown = latest.position + self.offset;
        let target = latest.step;

        self.states.clear();
        self.states.push_newest(snapshot);

        self.mode = EntityMode::SimulatedOnServer;
        self.advance(target);
        self.mode = EntityMode::SimulatedLagless;

        self.offset = shown - self.states[0].position;
    }

    /// Advance the simulation to `step` by consuming buffered inputs.
    pub fn advance(&mut self, step: u32) {
        if self.mode == EntityMode::Cloned {
            return;
        }

        self.has_changed = false;
        let Some(mut state) = self.states.newest().copied() else {
            debug_assert!(false, "state history is never empty");
            return;
        };
        let mut newest_step = state.step;

        match self.mode {
            EntityMode::SimulatedLagless => {
                if !self.inputs.is_empty() {
                    let last = self.inputs.len() - 1;
                    let mut i = self.inputs.insertion_index(state.step).min(last) as isize;

                    while i >= 0 && state.step < step {
                        let input = self.inputs[i as usize];
                        i -= 1;
                        if input.step < state.step {
                            // Superseded by an already-known state.
                            continue;
                        }

                        Self::step(&mut state, &input);

                        if state.step > newest_step {
                            self.states.push_newest(state);
                            newest_step = state.step;
                            self.has_changed = true;
                        }
                    }
                }

                self.offset *= OFFSET_DECAY;
            }
            EntityMode::SimulatedOnServer => {
                self.drop_inputs_before(state.step);

                let mut i = self.inputs.len() as isize - 1;
                while i >= 0 && self.inputs[i as usize].step <= step {
                    let input = self.inputs[i as usize];
                    i -= 1;

                    Self::step(&mut state, &input);

                    if state.step > newest_step {
                        self.states.push_newest(state);
                        newest_step = state.step;
                        self.has_changed = true;
                    }
                }
            }
            EntityMode::Cloned => unreachable!(),
        }
    }

    fn drop_inputs_before(&mut self, step: u32) {
        while self.inputs.oldest().is_some_and(|i| i.step < step) {
            self.inputs.pop_oldest();
        }
    }

    pub fn current_position(&self) -> Vec2 {
        let s = self.newest_snapshot();
        if self.mode == EntityMode::SimulatedLagless {
            s.position + self.offset
        } else {
            s.position
        }
    }

    pub fn current_direction(&self) -> Vec2 {
        self.newest_snapshot().direction
    }

    pub fn current_action(&self) -> (ActionState, f32) {
        let s = self.newest_snapshot();
        (s.action, action_time(s))
    }

    /// Interpolated state at time `t` (seconds since go time). Clamps to the
    /// oldest retained state when `t` is too old and to the newest when it
    /// is too new; never extrapolates.
    pub fn state_at_time(&self, t: f32) -> PlayerView {
        let last = self.states.len() - 1;

        let mut i = last as isize;
        while i >= 0 && (self.states[i as usize].step as f32) * FIXED_DT < t {
            i -= 1;
        }

        if i < 0 {
            // Too new.
            let s = self.states[0];
            return PlayerView {
                position: s.position,
                direction: s.direction,
                action: s.action,
                action_time: action_time(&s),
            };
        }
        let i = i as usize;
        if i == last {
            // Too old.
            let s = self.states[last];
            return PlayerView {
                position: s.position,
                direction: s.direction,
                action: s.action,
                action_time: action_time(&s),
            };
        }

        let s0 = self.states[i + 1];
        let s1 = self.states[i];
        let t0 = s0.step as f32 * FIXED_DT;
        let t1 = s1.step as f32 * FIXED_DT;
        let u = (t - t0) / (t1 - t0);

        let a0 = s0.direction.y.atan2(s0.direction.x);
        let a1 = s1.direction.y.atan2(s1.direction.x);
        let a = angle_lerp(a0, a1, u);

        PlayerView {
            position: Vec2::new(
                lerp(s0.position.x, s1.position.x, u),
                lerp(s0.position.y, s1.position.y, u),
            ),
            direction: Vec2::new(a.cos(), a.sin()),
            action: s0.action,
            action_time: action_time(&s0) + (t - t0),
        }
    }
}

/// Seconds since the snapshot's last action transition. `action_step` can
/// exceed `step` on a corrupt snapshot; saturate rather than underflow.
fn action_time(s: &PlayerSnapshot) -> f32 {
    s.step.saturating_sub(s.action_step) as f32 * FIXED_DT
}
