//! Fixed-step simulation clock.
//!
//! Both sides of the connection integrate with the same quantum: the lagless
//! client replays server states through the exact integrator the server ran,
//! so the step duration is a shared constant rather than a per-host setting.

pub const TICK_RATE: u32 = 60;
pub const FIXED_DT: f32 = 1.0 / TICK_RATE as f32;

/// Step number covering wall-clock time `t` (seconds since go time).
pub fn step_for_time(t: f32) -> u32 {
    (t / FIXED_DT).floor().max(0.0) as u32
}

/// Start of `step` in seconds since go time.
pub fn time_for_step(step: u32) -> f32 {
    step as f32 * FIXED_DT
}
