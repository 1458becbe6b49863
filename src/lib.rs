//! Core motion simulation for the arcana card swarm.
//!
//! Twenty-two card-shaped bodies drift around the viewer, attracted to
//! slowly-mutating parametric curves, repelling one another and the pointer,
//! flocking, bounded by soft walls, periodically kicked by random impulses,
//! and individually grabbable. The rendering/input host owns the frame loop
//! and calls [`Simulation::step`] once per frame with the elapsed delta and
//! the pointer projected into simulation space; it copies the returned body
//! transforms onto its own scene objects.

use glam::Vec3;
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::f32::consts::TAU;
use thiserror::Error;
use tracing::{debug, trace};

/// Default roster size: one body per major arcana card.
pub const DEFAULT_BODY_COUNT: usize = 22;

/// Monotonic tick counter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Tick zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The following tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Cubic smoothstep, `3x^2 - 2x^3` on a clamped input.
#[inline]
#[must_use]
pub fn smoothstep(x: f32) -> f32 {
    let x = x.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

#[inline]
fn lerp(a: f32, b: f32, s: f32) -> f32 {
    a + (b - a) * s
}

/// Wrap into `[0, 1)`. `rem_euclid(1.0)` can round up to exactly 1.0 for
/// tiny negative inputs, so the result is folded back to zero.
#[inline]
fn wrap_unit(value: f32) -> f32 {
    let wrapped = value.rem_euclid(1.0);
    if wrapped >= 1.0 { 0.0 } else { wrapped }
}

// ---------------------------------------------------------------------------
// Curve library
// ---------------------------------------------------------------------------

/// Named attractor curves the swarm cycles through.
///
/// Every curve maps a normalized parameter `t` in `[0, 1)` and the elapsed
/// simulation time to a point in 3D space. The time term drifts the phase
/// offsets inside the trig arguments so the same `t` traces a slightly
/// different point minute to minute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum CurveKind {
    /// (3,4) torus knot.
    #[default]
    TorusKnot,
    /// (2,3) torus knot.
    Trefoil,
    /// (2,5) torus knot.
    Cinquefoil,
    /// 3D Lissajous figure.
    Lissajous,
    /// Spherical rose curve.
    Rose,
    /// Chaotic-looking wing curve built from incommensurate frequencies.
    Wing,
}

impl CurveKind {
    /// Fixed cycle order; [`CurveCycleState`] wraps around this sequence.
    pub const CYCLE: [CurveKind; 6] = [
        CurveKind::TorusKnot,
        CurveKind::Trefoil,
        CurveKind::Cinquefoil,
        CurveKind::Lissajous,
        CurveKind::Rose,
        CurveKind::Wing,
    ];

    /// Evaluate the curve at parameter `t` (wrapped into `[0, 1)`) and `time`.
    #[must_use]
    pub fn evaluate(self, t: f32, time: f32) -> Vec3 {
        let phi = t.rem_euclid(1.0) * TAU;
        match self {
            CurveKind::TorusKnot => torus_knot(phi, 3.0, 4.0, 4.6, 1.8, time * 0.05),
            CurveKind::Trefoil => torus_knot(phi, 2.0, 3.0, 5.0, 2.1, time * 0.07),
            CurveKind::Cinquefoil => torus_knot(phi, 2.0, 5.0, 4.4, 1.6, time * 0.04),
            CurveKind::Lissajous => {
                let drift = time * 0.06;
                Vec3::new(
                    5.2 * (3.0 * phi + drift).sin(),
                    4.4 * (2.0 * phi + 0.7 + drift * 0.8).sin(),
                    3.6 * (5.0 * phi + 1.9 - drift * 0.5).sin(),
                )
            }
            CurveKind::Rose => {
                let drift = time * 0.05;
                let rho = 5.6 * (4.0 * phi + drift).cos();
                Vec3::new(
                    rho * phi.cos(),
                    rho * phi.sin(),
                    2.4 * (2.0 * phi + drift * 1.3).sin(),
                )
            }
            CurveKind::Wing => {
                let drift = time * 0.08;
                let flap = (phi * 1.0 + drift).sin() * (phi * 2.6 - drift * 0.6).cos();
                Vec3::new(
                    4.8 * (phi * 1.7 + 0.4 * drift.sin()).sin() * (phi * 0.9).cos(),
                    4.2 * flap,
                    3.4 * (phi * 3.3 + drift * 0.9).sin() * (phi * 1.3 + 0.8).cos(),
                )
            }
        }
    }
}

fn torus_knot(phi: f32, p: f32, q: f32, major: f32, minor: f32, drift: f32) -> Vec3 {
    let r = major + minor * (q * phi + drift).cos();
    Vec3::new(
        r * (p * phi).cos(),
        r * (p * phi).sin(),
        minor * (q * phi + drift).sin(),
    )
}

/// Evaluate both curves at `t` and interpolate with a smoothstep-eased blend
/// factor. The easing keeps the blend velocity continuous at the boundaries
/// of a transition window; a raw linear blend shows a visible kink there.
#[must_use]
pub fn blend_curves(t: f32, time: f32, a: CurveKind, b: CurveKind, blend: f32) -> Vec3 {
    let pa = a.evaluate(t, time);
    if a == b {
        return pa;
    }
    let pb = b.evaluate(t, time);
    pa.lerp(pb, smoothstep(blend))
}

// ---------------------------------------------------------------------------
// Flow field
// ---------------------------------------------------------------------------

/// Deterministic pseudo-noise vector field used as a small ambient
/// perturbation. Three sine/cosine product fields with phase-shifted time
/// offsets are combined as pairwise differences, so the output has no RNG
/// dependency and replays exactly for a given `(position, time)`.
#[must_use]
pub fn flow_field(position: Vec3, time: f32) -> Vec3 {
    let s = position * 0.35;
    let n1 = (s.x + time * 0.7).sin() * (s.y + time * 0.3).cos();
    let n2 = (s.y + time * 0.5).sin() * (s.z + time * 0.9).cos();
    let n3 = (s.z + time * 0.4).sin() * (s.x + time * 0.6).cos();
    Vec3::new(n1 - n2, n2 - n3, n3 - n1) * 0.25
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// How a body reacts to the pointer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Personality {
    /// Flees the pointer hard.
    Shy,
    /// Flees the pointer gently.
    Neutral,
    /// Mildly attracted to the pointer.
    Curious,
}

impl Personality {
    /// Deterministic assignment from the body's roster index.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        match index % 3 {
            0 => Personality::Shy,
            1 => Personality::Neutral,
            _ => Personality::Curious,
        }
    }

    /// Signed gain applied to the pointer force. Positive values repel.
    #[must_use]
    pub const fn pointer_gain(self) -> f32 {
        match self {
            Personality::Shy => 1.5,
            Personality::Neutral => 0.6,
            Personality::Curious => -0.45,
        }
    }
}

/// Per-force magnitudes captured while accumulating a body's acceleration.
/// Introspection only; nothing in the tick reads these back.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BodyForces {
    /// Last evaluated blended-curve target point.
    pub curve_target: Vec3,
    /// Distance from the body to that target.
    pub curve_distance: f32,
    pub curve: f32,
    pub separation: f32,
    pub flocking: f32,
    pub pointer: f32,
    pub containment: f32,
    pub current: f32,
    pub boundary: f32,
    pub flow: f32,
}

/// One simulated card body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Body {
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    /// Positive scalar; the anchor bodies are heavier and respond less.
    pub mass: f32,
    pub personality: Personality,
    /// Drives the idle scale pulse. Advances only while the body is neither
    /// hovered nor dragged.
    pub breath_phase: f32,
    /// Scales the flow-field contribution, in roughly `[0.3, 0.7]`.
    pub restlessness: f32,
    /// Parameter along the blended attractor curve, always in `[0, 1)`.
    pub curve_param: f32,
    pub curve_param_velocity: f32,
    /// Recent positions for optional visual trailing, oldest first.
    pub trail: VecDeque<Vec3>,
    pub diagnostics: BodyForces,
}

/// Per-body output copied by the renderer onto its visual transform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BodyTransform {
    pub index: usize,
    pub position: Vec3,
    pub velocity: Vec3,
    pub breath_phase: f32,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Errors that can occur when constructing a simulation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static tuning for the swarm. Every constant is tuned for visual appeal,
/// not physical accuracy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Number of bodies in the roster; fixed for the session.
    pub body_count: usize,
    /// Indices given `anchor_mass` instead of `body_mass`.
    pub anchor_indices: Vec<usize>,
    pub body_mass: f32,
    pub anchor_mass: f32,
    /// Optional RNG seed for reproducible sessions.
    pub rng_seed: Option<u64>,
    /// Radius of the sphere initial positions are drawn from.
    pub spawn_radius: f32,

    /// Clamped-spring gain toward the blended curve target.
    pub curve_gain: f32,
    /// Cap on the curve pull magnitude; keeps distant bodies from
    /// overshooting wildly.
    pub curve_max_pull: f32,
    /// Range initial `curve_param_velocity` values are drawn from.
    pub curve_param_speed_min: f32,
    pub curve_param_speed_max: f32,

    /// Inverse-square repulsion radius between bodies.
    pub separation_radius: f32,
    pub separation_strength: f32,
    /// Distance floor below which repulsion is zeroed to avoid singularities.
    pub separation_floor: f32,

    /// Outer radius of the flocking neighborhood.
    pub flock_radius: f32,
    /// Bodies closer than this are left to the separation force.
    pub flock_min_distance: f32,
    pub alignment_gain: f32,
    pub cohesion_gain: f32,

    /// Radius of pointer influence.
    pub pointer_radius: f32,
    /// Base pointer force strength; signed per-personality gain applies on top.
    pub pointer_strength: f32,

    /// Distance from the origin beyond which containment pulls back.
    pub containment_radius: f32,
    pub containment_gain: f32,
    /// Half extent of the soft boundary cube.
    pub boundary_half_extent: f32,
    pub boundary_gain: f32,

    /// Ambient current retarget interval bounds, seconds.
    pub current_min_interval: f32,
    pub current_max_interval: f32,
    /// Chance a retarget picks zero strength.
    pub current_zero_chance: f64,
    pub current_max_strength: f32,
    /// Exponential smoothing rate for strength.
    pub current_smoothing: f32,

    /// Scale on the flow-field contribution (further scaled by restlessness).
    pub flow_strength: f32,

    /// Master phase cycle length, seconds.
    pub phase_cycle: f32,
    /// Portion of the cycle spent in the fast phase.
    pub phase_fast_duration: f32,
    /// Length of the eased multiplier transition at a phase boundary.
    pub phase_transition: f32,
    pub fast_multiplier: f32,
    pub slow_multiplier: f32,

    /// Seconds each curve is held before blending into the next.
    pub curve_hold: f32,
    /// Length of the blend window between curves.
    pub curve_transition: f32,

    /// Seconds between injection bursts.
    pub injection_interval: f32,
    /// Bodies energized per burst; clamped to the roster size.
    pub injection_count: usize,
    pub injection_min_impulse: f32,
    pub injection_max_impulse: f32,
    /// How long the energized set stays exposed for highlighting.
    pub injection_highlight: f32,

    /// Fraction of `separation_radius` respected while dragging.
    pub drag_separation_scale: f32,
    /// Positional push strength used during drag-neighbor avoidance. Kept
    /// separate from `separation_strength`; the two are tuned independently.
    pub drag_repulsion: f32,
    /// Cumulative movement distinguishing a drag from a click.
    pub drag_click_threshold: f32,
    /// Fraction of the sampled pointer velocity inherited on release.
    pub drag_throw_factor: f32,

    /// Base speed cap before phase and mass scaling.
    pub max_speed: f32,
    pub damping_fast: f32,
    pub damping_slow: f32,
    /// Per-unit-mass damping correction.
    pub mass_damping_bias: f32,
    /// Fixed scale on position advancement.
    pub motion_scale: f32,

    /// Delta-time clamp range, seconds.
    pub dt_min: f32,
    pub dt_max: f32,

    pub breath_rate: f32,
    /// Pointer distance below which a body counts as hovered.
    pub hover_radius: f32,

    /// Maximum retained trail samples per body.
    pub trail_capacity: usize,
    /// Trail sampling stride in ticks, per phase.
    pub trail_stride_fast: u64,
    pub trail_stride_slow: u64,

    /// Diagnostics ring buffer capacity in frames.
    pub diagnostics_capacity: usize,
    /// Diagnostics sampling rate, Hz.
    pub diagnostics_rate: f32,
    /// How many leading bodies each frame record samples.
    pub diagnostics_bodies: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            body_count: DEFAULT_BODY_COUNT,
            anchor_indices: vec![0, 1],
            body_mass: 1.0,
            anchor_mass: 2.2,
            rng_seed: None,
            spawn_radius: 6.0,
            curve_gain: 2.0,
            curve_max_pull: 6.0,
            curve_param_speed_min: 0.01,
            curve_param_speed_max: 0.05,
            separation_radius: 3.5,
            separation_strength: 1.6,
            separation_floor: 0.05,
            flock_radius: 4.5,
            flock_min_distance: 1.2,
            alignment_gain: 0.35,
            cohesion_gain: 0.18,
            pointer_radius: 6.0,
            pointer_strength: 2.5,
            containment_radius: 11.0,
            containment_gain: 0.8,
            boundary_half_extent: 13.0,
            boundary_gain: 1.2,
            current_min_interval: 8.0,
            current_max_interval: 15.0,
            current_zero_chance: 0.3,
            current_max_strength: 0.45,
            current_smoothing: 1.5,
            flow_strength: 1.0,
            phase_cycle: 30.0,
            phase_fast_duration: 10.0,
            phase_transition: 1.5,
            fast_multiplier: 5.0,
            slow_multiplier: 0.5,
            curve_hold: 20.0,
            curve_transition: 5.0,
            injection_interval: 45.0,
            injection_count: 8,
            injection_min_impulse: 1.0,
            injection_max_impulse: 2.8,
            injection_highlight: 1.2,
            drag_separation_scale: 0.9,
            drag_repulsion: 1.0,
            drag_click_threshold: 0.25,
            drag_throw_factor: 0.5,
            max_speed: 1.8,
            damping_fast: 0.988,
            damping_slow: 0.92,
            mass_damping_bias: 0.012,
            motion_scale: 0.9,
            dt_min: 1.0 / 60.0,
            dt_max: 0.1,
            breath_rate: 1.4,
            hover_radius: 1.3,
            trail_capacity: 24,
            trail_stride_fast: 2,
            trail_stride_slow: 6,
            diagnostics_capacity: 600,
            diagnostics_rate: 10.0,
            diagnostics_bodies: 4,
        }
    }
}

impl SwarmConfig {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), SimError> {
        if self.body_count == 0 {
            return Err(SimError::InvalidConfig("body_count must be non-zero"));
        }
        if self.anchor_indices.iter().any(|&i| i >= self.body_count) {
            return Err(SimError::InvalidConfig(
                "anchor_indices must be within the roster",
            ));
        }
        if self.body_mass <= 0.0 || self.anchor_mass <= 0.0 {
            return Err(SimError::InvalidConfig("masses must be positive"));
        }
        if self.separation_radius <= 0.0
            || self.flock_radius <= 0.0
            || self.pointer_radius <= 0.0
            || self.containment_radius <= 0.0
            || self.boundary_half_extent <= 0.0
            || self.spawn_radius <= 0.0
            || self.hover_radius <= 0.0
        {
            return Err(SimError::InvalidConfig("radii must be positive"));
        }
        if self.separation_floor <= 0.0 {
            return Err(SimError::InvalidConfig(
                "separation_floor must be positive",
            ));
        }
        if !(self.dt_min > 0.0 && self.dt_min < self.dt_max) {
            return Err(SimError::InvalidConfig(
                "dt clamp range must be positive and ordered",
            ));
        }
        if self.injection_count > self.body_count {
            return Err(SimError::InvalidConfig(
                "injection_count cannot exceed body_count",
            ));
        }
        if self.injection_min_impulse > self.injection_max_impulse {
            return Err(SimError::InvalidConfig(
                "injection impulse range is inverted",
            ));
        }
        if self.phase_fast_duration <= 0.0 || self.phase_fast_duration >= self.phase_cycle {
            return Err(SimError::InvalidConfig(
                "phase_fast_duration must sit inside phase_cycle",
            ));
        }
        if self.phase_transition <= 0.0 {
            return Err(SimError::InvalidConfig(
                "phase_transition must be positive",
            ));
        }
        if self.curve_hold <= 0.0 || self.curve_transition <= 0.0 {
            return Err(SimError::InvalidConfig(
                "curve timings must be positive",
            ));
        }
        if self.current_min_interval <= 0.0
            || self.current_min_interval >= self.current_max_interval
        {
            return Err(SimError::InvalidConfig(
                "current retarget interval range is invalid",
            ));
        }
        if self.current_max_strength <= CURRENT_STRENGTH_FLOOR {
            return Err(SimError::InvalidConfig(
                "current_max_strength must exceed the sampling floor",
            ));
        }
        if self.curve_param_speed_min <= 0.0
            || self.curve_param_speed_min > self.curve_param_speed_max
        {
            return Err(SimError::InvalidConfig(
                "curve_param_speed range is invalid",
            ));
        }
        if self.max_speed <= 0.0 || self.motion_scale <= 0.0 {
            return Err(SimError::InvalidConfig(
                "max_speed and motion_scale must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.damping_fast) || !(0.0..=1.0).contains(&self.damping_slow) {
            return Err(SimError::InvalidConfig("damping must lie in [0, 1]"));
        }
        if self.diagnostics_capacity == 0 || self.diagnostics_rate <= 0.0 {
            return Err(SimError::InvalidConfig(
                "diagnostics capacity and rate must be positive",
            ));
        }
        if self.trail_stride_fast == 0 || self.trail_stride_slow == 0 {
            return Err(SimError::InvalidConfig(
                "trail strides must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeded from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }

    /// Speed cap for a body: the base cap scaled by the phase multiplier,
    /// with heavier bodies capped lower.
    #[must_use]
    pub fn effective_max_speed(&self, velocity_multiplier: f32, mass: f32) -> f32 {
        self.max_speed * velocity_multiplier / mass.sqrt()
    }

    fn mass_for(&self, index: usize) -> f32 {
        if self.anchor_indices.contains(&index) {
            self.anchor_mass
        } else {
            self.body_mass
        }
    }
}

// ---------------------------------------------------------------------------
// Global controllers
// ---------------------------------------------------------------------------

/// Global fast/slow velocity regime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Fast,
    Slow,
}

/// State of the two-phase velocity oscillator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PhaseState {
    /// Time into the master cycle; wraps at `phase_cycle`.
    pub elapsed: f32,
    pub phase: Phase,
    /// Uniform scale on curve-parameter advance and the speed cap.
    pub velocity_multiplier: f32,
    /// Eased transition progress; `>= 1.0` means settled on the target.
    pub transition_progress: f32,
    transition_from: f32,
}

impl PhaseState {
    fn new(config: &SwarmConfig) -> Self {
        Self {
            elapsed: 0.0,
            phase: Phase::Fast,
            velocity_multiplier: config.fast_multiplier,
            transition_progress: 1.0,
            transition_from: config.fast_multiplier,
        }
    }

    fn target_multiplier(&self, config: &SwarmConfig) -> f32 {
        match self.phase {
            Phase::Fast => config.fast_multiplier,
            Phase::Slow => config.slow_multiplier,
        }
    }

    /// Advance the oscillator one tick; returns the new phase on a boundary
    /// crossing.
    fn advance(&mut self, dt: f32, config: &SwarmConfig) -> Option<Phase> {
        self.elapsed = (self.elapsed + dt).rem_euclid(config.phase_cycle);
        let target = if self.elapsed < config.phase_fast_duration {
            Phase::Fast
        } else {
            Phase::Slow
        };
        let mut changed = None;
        if target != self.phase {
            self.phase = target;
            self.transition_from = self.velocity_multiplier;
            self.transition_progress = 0.0;
            changed = Some(target);
            debug!(?target, "phase boundary crossed");
        }
        let target_multiplier = self.target_multiplier(config);
        if self.transition_progress < 1.0 {
            self.transition_progress =
                (self.transition_progress + dt / config.phase_transition).min(1.0);
            self.velocity_multiplier = lerp(
                self.transition_from,
                target_multiplier,
                smoothstep(self.transition_progress),
            );
        } else {
            self.velocity_multiplier = target_multiplier;
        }
        changed
    }
}

/// State of the curve cycle: which curve pair is active and how far the
/// blend between them has progressed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CurveCycleState {
    pub current: CurveKind,
    pub next: CurveKind,
    /// 0 through the hold window, ramping linearly to 1 across the
    /// transition window.
    pub transition_progress: f32,
    pub cycle_time: f32,
    pub curve_index: usize,
}

impl CurveCycleState {
    fn new() -> Self {
        Self {
            current: CurveKind::CYCLE[0],
            next: CurveKind::CYCLE[1],
            transition_progress: 0.0,
            cycle_time: 0.0,
            curve_index: 0,
        }
    }

    /// Advance the cycle; returns the newly promoted curve when a blend
    /// completes.
    fn advance(&mut self, dt: f32, config: &SwarmConfig) -> Option<CurveKind> {
        self.cycle_time += dt;
        if self.cycle_time <= config.curve_hold {
            self.transition_progress = 0.0;
            return None;
        }
        self.transition_progress =
            ((self.cycle_time - config.curve_hold) / config.curve_transition).min(1.0);
        if self.transition_progress < 1.0 {
            return None;
        }
        self.curve_index = (self.curve_index + 1) % CurveKind::CYCLE.len();
        self.current = CurveKind::CYCLE[self.curve_index];
        self.next = CurveKind::CYCLE[(self.curve_index + 1) % CurveKind::CYCLE.len()];
        self.cycle_time = 0.0;
        self.transition_progress = 0.0;
        debug!(curve = ?self.current, "curve cycle advanced");
        Some(self.current)
    }
}

/// Lowest non-zero strength a retarget can draw; `current_max_strength`
/// must sit above it for the draw range to be non-empty.
const CURRENT_STRENGTH_FLOOR: f32 = 0.05;

/// Slowly-smoothed ambient directional push applied to every body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AmbientCurrentState {
    /// Unit direction; snaps on retarget since transitions are visually
    /// subtle at low strength.
    pub direction: Vec3,
    pub strength: f32,
    pub target_strength: f32,
    pub change_timer: f32,
    next_change: f32,
}

impl AmbientCurrentState {
    fn new(config: &SwarmConfig, rng: &mut SmallRng) -> Self {
        Self {
            direction: random_unit(rng),
            strength: 0.0,
            target_strength: 0.0,
            change_timer: 0.0,
            next_change: rng.random_range(config.current_min_interval..config.current_max_interval),
        }
    }

    fn advance(&mut self, dt: f32, config: &SwarmConfig, rng: &mut SmallRng) {
        self.change_timer += dt;
        if self.change_timer >= self.next_change {
            self.change_timer = 0.0;
            self.next_change =
                rng.random_range(config.current_min_interval..config.current_max_interval);
            self.target_strength = if rng.random_bool(config.current_zero_chance) {
                0.0
            } else {
                rng.random_range(CURRENT_STRENGTH_FLOOR..config.current_max_strength)
            };
            self.direction = random_unit(rng);
            trace!(
                strength = self.target_strength,
                "ambient current retargeted"
            );
        }
        let alpha = 1.0 - (-dt * config.current_smoothing).exp();
        self.strength += (self.target_strength - self.strength) * alpha;
    }

    /// Current force contribution.
    #[must_use]
    pub fn force(&self) -> Vec3 {
        self.direction * self.strength
    }
}

/// Periodic random impulse bursts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InjectionState {
    pub time_since_last: f32,
    /// Indices energized by the most recent burst, retained for the
    /// highlight window.
    energized: SmallVec<[usize; 8]>,
    highlight_timer: f32,
}

impl InjectionState {
    /// Advance the scheduler; applies impulses directly to `bodies` and
    /// returns the freshly energized indices when a burst fires. A body
    /// pinned by a drag (`held`) is never picked: its velocity is
    /// overwritten by the drag session the same tick, so an impulse there
    /// would highlight a body that never moves.
    fn advance(
        &mut self,
        dt: f32,
        config: &SwarmConfig,
        rng: &mut SmallRng,
        bodies: &mut [Body],
        held: Option<usize>,
    ) -> SmallVec<[usize; 8]> {
        if self.highlight_timer > 0.0 {
            self.highlight_timer -= dt;
            if self.highlight_timer <= 0.0 {
                self.energized.clear();
            }
        }
        self.time_since_last += dt;
        if self.time_since_last < config.injection_interval {
            return SmallVec::new();
        }
        self.time_since_last = 0.0;

        // Sample from the roster minus the held body, then shift the drawn
        // indices past the hole.
        let pool = bodies.len() - usize::from(held.is_some());
        let count = config.injection_count.min(pool);
        let chosen = index::sample(rng, pool, count);
        let mut burst: SmallVec<[usize; 8]> = SmallVec::with_capacity(count);
        for idx in chosen.iter() {
            let idx = match held {
                Some(pinned) if idx >= pinned => idx + 1,
                _ => idx,
            };
            let impulse = random_unit(rng)
                * rng.random_range(config.injection_min_impulse..=config.injection_max_impulse);
            bodies[idx].velocity += impulse;
            burst.push(idx);
        }
        self.energized = burst.clone();
        self.highlight_timer = config.injection_highlight;
        debug!(count = burst.len(), "injection burst applied");
        burst
    }

    /// Indices still inside the post-burst highlight window.
    #[must_use]
    pub fn recently_energized(&self) -> &[usize] {
        &self.energized
    }
}

fn random_unit(rng: &mut SmallRng) -> Vec3 {
    let z: f32 = rng.random_range(-1.0..1.0);
    let theta: f32 = rng.random_range(0.0..TAU);
    let r = (1.0 - z * z).max(0.0).sqrt();
    Vec3::new(r * theta.cos(), r * theta.sin(), z)
}

// ---------------------------------------------------------------------------
// Drag controller
// ---------------------------------------------------------------------------

/// Transient state of an exclusive pointer capture.
#[derive(Debug, Clone, PartialEq)]
struct DragSession {
    body_index: usize,
    /// Body position minus pointer position at grab time.
    offset: Vec3,
    /// Recent `(pointer, dt)` samples used to estimate release velocity.
    samples: SmallVec<[(Vec3, f32); 8]>,
    /// Cumulative movement; distinguishes a drag from a click.
    moved: f32,
}

impl DragSession {
    const SAMPLE_WINDOW: usize = 6;

    fn record(&mut self, pointer: Vec3, dt: f32) {
        if self.samples.len() == Self::SAMPLE_WINDOW {
            self.samples.remove(0);
        }
        self.samples.push((pointer, dt));
    }

    /// Pointer velocity estimated over the sample window.
    fn pointer_velocity(&self) -> Vec3 {
        let Some(&(first, _)) = self.samples.first() else {
            return Vec3::ZERO;
        };
        let Some(&(last, _)) = self.samples.last() else {
            return Vec3::ZERO;
        };
        let span: f32 = self.samples.iter().skip(1).map(|&(_, dt)| dt).sum();
        if span <= f32::EPSILON {
            return Vec3::ZERO;
        }
        (last - first) / span
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Sampled state of one body inside a [`FrameRecord`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BodySample {
    pub index: usize,
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub curve_target: Vec3,
    pub curve_distance: f32,
}

/// One diagnostics frame: global controller state plus a fixed body subset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameRecord {
    pub time: f32,
    pub phase: Phase,
    pub velocity_multiplier: f32,
    pub current_curve: CurveKind,
    pub bodies: Vec<BodySample>,
}

/// Fixed-capacity ring buffer sampling the simulation at a fixed rate.
/// Observability hook only; never read back by the tick itself.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsRecorder {
    frames: VecDeque<FrameRecord>,
    accumulator: f32,
}

impl DiagnosticsRecorder {
    fn sample(
        &mut self,
        dt: f32,
        time: f32,
        config: &SwarmConfig,
        phase: &PhaseState,
        curve: &CurveCycleState,
        bodies: &[Body],
    ) {
        self.accumulator += dt;
        let interval = 1.0 / config.diagnostics_rate;
        if self.accumulator < interval {
            return;
        }
        self.accumulator -= interval;

        let subset = config.diagnostics_bodies.min(bodies.len());
        let record = FrameRecord {
            time,
            phase: phase.phase,
            velocity_multiplier: phase.velocity_multiplier,
            current_curve: curve.current,
            bodies: bodies[..subset]
                .iter()
                .enumerate()
                .map(|(index, body)| BodySample {
                    index,
                    position: body.position,
                    velocity: body.velocity,
                    acceleration: body.acceleration,
                    curve_target: body.diagnostics.curve_target,
                    curve_distance: body.diagnostics.curve_distance,
                })
                .collect(),
        };
        if self.frames.len() >= config.diagnostics_capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(record);
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true when nothing has been sampled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Clone the buffer contents, oldest first. The host serializes the
    /// result (it is plain serde data) and writes it wherever it likes.
    #[must_use]
    pub fn export(&self) -> Vec<FrameRecord> {
        self.frames.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tick events
// ---------------------------------------------------------------------------

/// Discrete events emitted by one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickEvents {
    pub tick: Tick,
    /// True when the tick was rejected (non-finite input) and no state moved.
    pub skipped: bool,
    /// Indices impulse-energized this tick.
    pub energized: SmallVec<[usize; 8]>,
    /// Set when the phase oscillator crossed a boundary.
    pub phase_changed: Option<Phase>,
    /// Set when the curve cycle promoted a new active curve.
    pub curve_advanced: Option<CurveKind>,
}

// ---------------------------------------------------------------------------
// Force helpers
// ---------------------------------------------------------------------------

/// Inverse-square repulsion along `offset` (pointing away from the
/// repelling neighbor), zeroed outside `radius` and below the distance
/// `floor`.
#[must_use]
fn inverse_square_repulsion(offset: Vec3, radius: f32, strength: f32, floor: f32) -> Vec3 {
    let dist_sq = offset.length_squared();
    if dist_sq >= radius * radius || dist_sq < floor * floor {
        return Vec3::ZERO;
    }
    let dist = dist_sq.sqrt();
    (offset / dist) * (strength / dist_sq)
}

/// Per-axis corrective force beyond the soft boundary cube.
#[inline]
fn boundary_axis(value: f32, half_extent: f32, gain: f32) -> f32 {
    if value > half_extent {
        -(value - half_extent) * gain
    } else if value < -half_extent {
        (-half_extent - value) * gain
    } else {
        0.0
    }
}

/// Minimal per-body view the force pass reads for every neighbor.
#[derive(Clone, Copy)]
struct BodySnapshot {
    position: Vec3,
    velocity: Vec3,
}

// ---------------------------------------------------------------------------
// Simulation driver
// ---------------------------------------------------------------------------

/// The whole swarm: roster, global controllers, drag capture and
/// diagnostics. One instance per session; everything advances inside
/// [`Simulation::step`], synchronously, on the caller's frame.
pub struct Simulation {
    config: SwarmConfig,
    rng: SmallRng,
    tick: Tick,
    time: f32,
    bodies: Vec<Body>,
    phase: PhaseState,
    curve: CurveCycleState,
    current: AmbientCurrentState,
    injection: InjectionState,
    drag: Option<DragSession>,
    recorder: DiagnosticsRecorder,
    snapshots: Vec<BodySnapshot>,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("tick", &self.tick)
            .field("time", &self.time)
            .field("body_count", &self.bodies.len())
            .field("phase", &self.phase.phase)
            .field("curve", &self.curve.current)
            .field("dragging", &self.drag.as_ref().map(|d| d.body_index))
            .finish()
    }
}

impl Simulation {
    /// Build a simulation from `config`, spawning the full roster. Bodies
    /// are never added or removed afterwards.
    pub fn new(config: SwarmConfig) -> Result<Self, SimError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let count = config.body_count;

        let mut bodies = Vec::with_capacity(count);
        for index in 0..count {
            let radial = rng.random_range(0.3..1.0f32) * config.spawn_radius;
            let jitter: f32 = rng.random_range(-0.3..0.3);
            bodies.push(Body {
                position: random_unit(&mut rng) * radial,
                velocity: random_unit(&mut rng) * rng.random_range(0.0..0.4f32),
                acceleration: Vec3::ZERO,
                mass: config.mass_for(index),
                personality: Personality::from_index(index),
                breath_phase: rng.random_range(0.0..TAU),
                restlessness: rng.random_range(0.3..0.7),
                curve_param: wrap_unit((index as f32 + jitter) / count as f32),
                curve_param_velocity: rng
                    .random_range(config.curve_param_speed_min..=config.curve_param_speed_max),
                trail: VecDeque::with_capacity(config.trail_capacity),
                diagnostics: BodyForces::default(),
            });
        }

        let phase = PhaseState::new(&config);
        let current = AmbientCurrentState::new(&config, &mut rng);
        Ok(Self {
            config,
            rng,
            tick: Tick::zero(),
            time: 0.0,
            bodies,
            phase,
            curve: CurveCycleState::new(),
            current,
            injection: InjectionState::default(),
            drag: None,
            recorder: DiagnosticsRecorder::default(),
            snapshots: Vec::with_capacity(count),
        })
    }

    /// Advance the whole simulation by one frame.
    ///
    /// `pointer` is the pointer position projected into simulation space by
    /// the host. Non-finite inputs reject the tick outright: integrating a
    /// NaN would corrupt body state for the rest of the session.
    pub fn step(&mut self, dt: f32, pointer: Vec3) -> TickEvents {
        if !dt.is_finite() || !pointer.is_finite() {
            return TickEvents {
                tick: self.tick,
                skipped: true,
                ..TickEvents::default()
            };
        }
        let dt = dt.clamp(self.config.dt_min, self.config.dt_max);
        self.tick = self.tick.next();
        self.time += dt;

        let phase_changed = self.phase.advance(dt, &self.config);
        let curve_advanced = self.curve.advance(dt, &self.config);
        self.current.advance(dt, &self.config, &mut self.rng);
        let held = self.drag.as_ref().map(|session| session.body_index);
        let energized =
            self.injection
                .advance(dt, &self.config, &mut self.rng, &mut self.bodies, held);

        self.snapshots.clear();
        self.snapshots.extend(self.bodies.iter().map(|b| BodySnapshot {
            position: b.position,
            velocity: b.velocity,
        }));

        let dragged = self.drag.as_ref().map(|session| session.body_index);
        for index in 0..self.bodies.len() {
            if Some(index) == dragged {
                continue;
            }
            self.advance_body(index, dt, pointer);
        }
        if self.drag.is_some() {
            self.advance_drag(dt, pointer);
        }

        self.recorder.sample(
            dt,
            self.time,
            &self.config,
            &self.phase,
            &self.curve,
            &self.bodies,
        );

        TickEvents {
            tick: self.tick,
            skipped: false,
            energized,
            phase_changed,
            curve_advanced,
        }
    }

    /// Force accumulation plus the damped, clamped semi-implicit step for
    /// one free body.
    fn advance_body(&mut self, index: usize, dt: f32, pointer: Vec3) {
        let config = &self.config;
        let multiplier = self.phase.velocity_multiplier;

        // Advance the curve parameter first; the attraction target is the
        // curve point at the new parameter.
        let body = &self.bodies[index];
        let curve_param =
            wrap_unit(body.curve_param + body.curve_param_velocity * dt * multiplier);
        let target = blend_curves(
            curve_param,
            self.time,
            self.curve.current,
            self.curve.next,
            self.curve.transition_progress,
        );

        let position = body.position;
        let velocity = body.velocity;
        let mass = body.mass;
        let mut diag = BodyForces {
            curve_target: target,
            ..BodyForces::default()
        };

        // 1. Clamped spring toward the moving curve target.
        let to_target = target - position;
        diag.curve_distance = to_target.length();
        let mut force = if diag.curve_distance > f32::EPSILON {
            let pull = (diag.curve_distance * config.curve_gain).min(config.curve_max_pull);
            (to_target / diag.curve_distance) * pull
        } else {
            Vec3::ZERO
        };
        diag.curve = force.length();

        // 2. Inverse-square neighbor separation.
        let mut separation = Vec3::ZERO;
        // 3. Flocking alignment and cohesion over the wider neighborhood.
        let mut neighbor_velocity = Vec3::ZERO;
        let mut neighbor_position = Vec3::ZERO;
        let mut neighbor_count = 0u32;
        for (other_index, other) in self.snapshots.iter().enumerate() {
            if other_index == index {
                continue;
            }
            separation += inverse_square_repulsion(
                position - other.position,
                config.separation_radius,
                config.separation_strength,
                config.separation_floor,
            );
            let dist = position.distance(other.position);
            if dist < config.flock_radius && dist > config.flock_min_distance {
                neighbor_velocity += other.velocity;
                neighbor_position += other.position;
                neighbor_count += 1;
            }
        }
        force += separation;
        diag.separation = separation.length();
        if neighbor_count > 0 {
            let inv = 1.0 / neighbor_count as f32;
            let alignment = (neighbor_velocity * inv - velocity) * config.alignment_gain;
            let cohesion = (neighbor_position * inv - position) * config.cohesion_gain;
            force += alignment + cohesion;
            diag.flocking = (alignment + cohesion).length();
        }

        // 4. Personality-signed pointer interaction.
        let pointer_force = inverse_square_repulsion(
            position - pointer,
            config.pointer_radius,
            config.pointer_strength,
            config.separation_floor,
        ) * self.bodies[index].personality.pointer_gain();
        force += pointer_force;
        diag.pointer = pointer_force.length();

        // 5. Center containment beyond the containment radius.
        let origin_distance = position.length();
        if origin_distance > config.containment_radius {
            let containment = -(position / origin_distance)
                * (origin_distance - config.containment_radius)
                * config.containment_gain;
            force += containment;
            diag.containment = containment.length();
        }

        // 6. Smoothed ambient current.
        let current = self.current.force();
        force += current;
        diag.current = current.length();

        // 7. Soft boundary cube, one corrective component per exceeded axis.
        let boundary = Vec3::new(
            boundary_axis(position.x, config.boundary_half_extent, config.boundary_gain),
            boundary_axis(position.y, config.boundary_half_extent, config.boundary_gain),
            boundary_axis(position.z, config.boundary_half_extent, config.boundary_gain),
        );
        force += boundary;
        diag.boundary = boundary.length();

        // 8. Restlessness-scaled flow-field noise.
        let flow =
            flow_field(position, self.time) * config.flow_strength * self.bodies[index].restlessness;
        force += flow;
        diag.flow = flow.length();

        // Semi-implicit integration: lighter bodies get a larger response.
        let acceleration = force / mass;
        let mut next_velocity = velocity + acceleration * dt;
        let base_damping = match self.phase.phase {
            Phase::Fast => config.damping_fast,
            Phase::Slow => config.damping_slow,
        };
        let damping = (base_damping - (mass - 1.0) * config.mass_damping_bias).clamp(0.0, 1.0);
        next_velocity *= damping;
        next_velocity =
            next_velocity.clamp_length_max(config.effective_max_speed(multiplier, mass));
        let next_position = position + next_velocity * dt * config.motion_scale;

        let stride = match self.phase.phase {
            Phase::Fast => config.trail_stride_fast,
            Phase::Slow => config.trail_stride_slow,
        };
        let hovered = pointer.distance(next_position) < config.hover_radius;

        let body = &mut self.bodies[index];
        body.curve_param = curve_param;
        body.acceleration = acceleration;
        body.velocity = next_velocity;
        body.position = next_position;
        body.diagnostics = diag;
        if !hovered {
            body.breath_phase = (body.breath_phase + dt * config.breath_rate).rem_euclid(TAU);
        }
        if self.tick.0 % stride == 0 {
            if body.trail.len() >= config.trail_capacity {
                body.trail.pop_front();
            }
            body.trail.push_back(next_position);
        }
    }

    /// Pointer-follow with neighbor avoidance for the captured body; the
    /// force model and integrator are bypassed entirely.
    fn advance_drag(&mut self, dt: f32, pointer: Vec3) {
        let config = &self.config;
        let Some(session) = self.drag.as_mut() else {
            return;
        };
        session.record(pointer, dt);

        let index = session.body_index;
        let mut candidate = pointer + session.offset;
        let avoid_radius = config.separation_radius * config.drag_separation_scale;
        for (other_index, other) in self.snapshots.iter().enumerate() {
            if other_index == index {
                continue;
            }
            let offset = candidate - other.position;
            let dist = offset.length();
            if dist < avoid_radius && dist > f32::EPSILON {
                candidate += (offset / dist) * (avoid_radius - dist) * config.drag_repulsion;
            }
        }

        let body = &mut self.bodies[index];
        session.moved += candidate.distance(body.position);
        body.position = candidate;
        body.velocity = Vec3::ZERO;
        body.acceleration = Vec3::ZERO;
    }

    /// Attempt to capture `index` with the pointer at `pointer`. A no-op
    /// (returning false) while another body is already captured or when the
    /// index is out of range; capture is exclusive system-wide.
    pub fn pointer_down(&mut self, index: usize, pointer: Vec3) -> bool {
        if self.drag.is_some() || index >= self.bodies.len() || !pointer.is_finite() {
            return false;
        }
        let body = &mut self.bodies[index];
        body.velocity = Vec3::ZERO;
        body.acceleration = Vec3::ZERO;
        self.drag = Some(DragSession {
            body_index: index,
            offset: body.position - pointer,
            samples: SmallVec::new(),
            moved: 0.0,
        });
        debug!(index, "drag captured");
        true
    }

    /// Release the current capture, from anywhere on screen. A real drag
    /// (cumulative movement above the click threshold) inherits a throw
    /// velocity from the sampled pointer motion; a click leaves the body at
    /// rest. Returns the released index, if any.
    pub fn pointer_up(&mut self) -> Option<usize> {
        let session = self.drag.take()?;
        let index = session.body_index;
        if session.moved > self.config.drag_click_threshold {
            self.bodies[index].velocity =
                session.pointer_velocity() * self.config.drag_throw_factor;
        } else {
            self.bodies[index].velocity = Vec3::ZERO;
        }
        debug!(index, moved = session.moved, "drag released");
        Some(index)
    }

    /// Index of the captured body, if a drag is in progress.
    #[must_use]
    pub fn drag_target(&self) -> Option<usize> {
        self.drag.as_ref().map(|session| session.body_index)
    }

    /// Per-body transforms for the renderer to copy, in roster order.
    #[must_use]
    pub fn transforms(&self) -> Vec<BodyTransform> {
        self.bodies
            .iter()
            .enumerate()
            .map(|(index, body)| BodyTransform {
                index,
                position: body.position,
                velocity: body.velocity,
                breath_phase: body.breath_phase,
            })
            .collect()
    }

    /// The full roster.
    #[must_use]
    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Phase oscillator state.
    #[must_use]
    pub fn phase(&self) -> &PhaseState {
        &self.phase
    }

    /// Curve cycle state.
    #[must_use]
    pub fn curve_cycle(&self) -> &CurveCycleState {
        &self.curve
    }

    /// Ambient current state.
    #[must_use]
    pub fn ambient_current(&self) -> &AmbientCurrentState {
        &self.current
    }

    /// Indices still inside the post-injection highlight window.
    #[must_use]
    pub fn recently_energized(&self) -> &[usize] {
        self.injection.recently_energized()
    }

    /// Elapsed simulation time in seconds.
    #[must_use]
    pub fn time(&self) -> f32 {
        self.time
    }

    /// Tick counter.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Snapshot the diagnostics ring buffer for the host's "dump" command.
    #[must_use]
    pub fn export_diagnostics(&self) -> Vec<FrameRecord> {
        self.recorder.export()
    }

    /// Number of buffered diagnostics frames.
    #[must_use]
    pub fn diagnostics_len(&self) -> usize {
        self.recorder.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 60.0;

    fn seeded_config(seed: u64) -> SwarmConfig {
        SwarmConfig {
            rng_seed: Some(seed),
            ..SwarmConfig::default()
        }
    }

    fn seeded_sim(seed: u64) -> Simulation {
        Simulation::new(seeded_config(seed)).expect("valid config")
    }

    /// A sparse three-body roster with bodies parked far apart, used by the
    /// drag tests so neighbor avoidance stays out of the way.
    fn sparse_sim() -> Simulation {
        let config = SwarmConfig {
            body_count: 3,
            anchor_indices: vec![1],
            injection_count: 2,
            rng_seed: Some(99),
            ..SwarmConfig::default()
        };
        let mut sim = Simulation::new(config).expect("valid config");
        sim.bodies[0].position = Vec3::ZERO;
        sim.bodies[1].position = Vec3::new(30.0, 30.0, 0.0);
        sim.bodies[2].position = Vec3::new(-30.0, 30.0, 0.0);
        for body in &mut sim.bodies {
            body.velocity = Vec3::ZERO;
        }
        sim
    }

    #[test]
    fn default_config_validates() {
        assert!(Simulation::new(seeded_config(1)).is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let empty = SwarmConfig {
            body_count: 0,
            anchor_indices: Vec::new(),
            ..SwarmConfig::default()
        };
        assert!(matches!(
            Simulation::new(empty),
            Err(SimError::InvalidConfig(_))
        ));

        let greedy_injection = SwarmConfig {
            injection_count: 40,
            ..SwarmConfig::default()
        };
        assert!(matches!(
            Simulation::new(greedy_injection),
            Err(SimError::InvalidConfig(_))
        ));

        let inverted_dt = SwarmConfig {
            dt_min: 0.2,
            dt_max: 0.1,
            ..SwarmConfig::default()
        };
        assert!(matches!(
            Simulation::new(inverted_dt),
            Err(SimError::InvalidConfig(_))
        ));

        let stray_anchor = SwarmConfig {
            anchor_indices: vec![55],
            ..SwarmConfig::default()
        };
        assert!(matches!(
            Simulation::new(stray_anchor),
            Err(SimError::InvalidConfig(_))
        ));

        // Degenerate ranges that would otherwise panic inside the RNG draws.
        let collapsed_interval = SwarmConfig {
            current_min_interval: 10.0,
            current_max_interval: 10.0,
            ..SwarmConfig::default()
        };
        assert!(matches!(
            Simulation::new(collapsed_interval),
            Err(SimError::InvalidConfig(_))
        ));

        let feeble_current = SwarmConfig {
            current_max_strength: 0.04,
            ..SwarmConfig::default()
        };
        assert!(matches!(
            Simulation::new(feeble_current),
            Err(SimError::InvalidConfig(_))
        ));

        let inverted_param_speed = SwarmConfig {
            curve_param_speed_min: 0.05,
            curve_param_speed_max: 0.01,
            ..SwarmConfig::default()
        };
        assert!(matches!(
            Simulation::new(inverted_param_speed),
            Err(SimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn blending_a_curve_with_itself_is_identity() {
        for &blend in &[0.0, 0.25, 0.5, 0.99, 1.0] {
            for &t in &[0.0, 0.13, 0.5, 0.87] {
                let direct = CurveKind::Trefoil.evaluate(t, 12.0);
                let blended = blend_curves(t, 12.0, CurveKind::Trefoil, CurveKind::Trefoil, blend);
                assert!(direct.distance(blended) < 1e-6);
            }
        }
    }

    #[test]
    fn blend_is_continuous_at_transition_boundaries() {
        let (a, b) = (CurveKind::TorusKnot, CurveKind::Rose);
        for &t in &[0.1, 0.4, 0.77] {
            let at_zero = blend_curves(t, 5.0, a, b, 0.0);
            let near_zero = blend_curves(t, 5.0, a, b, 0.001);
            assert!(at_zero.distance(near_zero) < 0.05);

            let near_one = blend_curves(t, 5.0, a, b, 0.999);
            let at_one = blend_curves(t, 5.0, a, b, 1.0);
            assert!(at_one.distance(near_one) < 0.05);
        }
    }

    #[test]
    fn flow_field_is_deterministic_and_time_varying() {
        let p = Vec3::new(1.2, -0.7, 3.1);
        assert_eq!(flow_field(p, 4.0), flow_field(p, 4.0));
        assert!(flow_field(p, 4.0).distance(flow_field(p, 9.0)) > 1e-4);
    }

    #[test]
    fn separation_force_decreases_with_distance() {
        let config = SwarmConfig::default();
        let magnitude = |dist: f32| {
            inverse_square_repulsion(
                Vec3::new(dist, 0.0, 0.0),
                config.separation_radius,
                config.separation_strength,
                config.separation_floor,
            )
            .length()
        };
        let near = magnitude(0.5);
        let mid = magnitude(1.0);
        let far = magnitude(2.0);
        assert!(near > mid && mid > far);
        assert!(far > 0.0);
        // Outside the radius and below the floor the force is zero.
        assert_eq!(magnitude(4.0), 0.0);
        assert_eq!(magnitude(0.01), 0.0);
    }

    #[test]
    fn personalities_assign_deterministically() {
        assert_eq!(Personality::from_index(0), Personality::Shy);
        assert_eq!(Personality::from_index(1), Personality::Neutral);
        assert_eq!(Personality::from_index(2), Personality::Curious);
        assert_eq!(Personality::from_index(21), Personality::Shy);
        assert!(Personality::Shy.pointer_gain() > Personality::Neutral.pointer_gain());
        assert!(Personality::Curious.pointer_gain() < 0.0);
    }

    #[test]
    fn phase_oscillator_cycles_fast_then_slow() {
        let config = SwarmConfig::default();
        let mut phase = PhaseState::new(&config);
        assert_eq!(phase.phase, Phase::Fast);
        assert!((phase.velocity_multiplier - config.fast_multiplier).abs() < 1e-6);

        let mut slow_event = None;
        for _ in 0..((10.5 / 0.05) as usize) {
            if let Some(p) = phase.advance(0.05, &config) {
                slow_event = Some(p);
            }
        }
        assert_eq!(slow_event, Some(Phase::Slow));
        // Mid-transition the multiplier sits strictly between the targets.
        assert!(phase.velocity_multiplier < config.fast_multiplier);
        assert!(phase.velocity_multiplier > config.slow_multiplier);

        for _ in 0..((2.0 / 0.05) as usize) {
            phase.advance(0.05, &config);
        }
        assert!((phase.velocity_multiplier - config.slow_multiplier).abs() < 1e-4);

        // Wrapping the 30 s cycle lands back in the fast phase.
        let mut fast_event = None;
        for _ in 0..((18.5 / 0.05) as usize) {
            if let Some(p) = phase.advance(0.05, &config) {
                fast_event = Some(p);
            }
        }
        assert_eq!(fast_event, Some(Phase::Fast));
    }

    #[test]
    fn curve_cycle_holds_then_promotes() {
        let config = SwarmConfig::default();
        let mut cycle = CurveCycleState::new();
        assert_eq!(cycle.current, CurveKind::CYCLE[0]);

        // Through the hold window progress stays pinned at zero.
        for _ in 0..190 {
            assert!(cycle.advance(0.1, &config).is_none());
            assert_eq!(cycle.transition_progress, 0.0);
        }
        // Partway into the transition window progress is strictly inside (0, 1).
        for _ in 0..25 {
            cycle.advance(0.1, &config);
        }
        assert!(cycle.transition_progress > 0.0 && cycle.transition_progress < 1.0);

        let mut promoted = None;
        for _ in 0..40 {
            if let Some(curve) = cycle.advance(0.1, &config) {
                promoted = Some(curve);
                break;
            }
        }
        assert_eq!(promoted, Some(CurveKind::CYCLE[1]));
        assert_eq!(cycle.next, CurveKind::CYCLE[2]);
        assert_eq!(cycle.transition_progress, 0.0);
    }

    #[test]
    fn curve_params_stay_in_unit_range() {
        let mut sim = seeded_sim(3);
        sim.bodies[0].curve_param_velocity = -3.0;
        sim.bodies[1].curve_param_velocity = 7.5;
        for _ in 0..500 {
            sim.step(DT, Vec3::ZERO);
            for body in sim.bodies() {
                assert!((0.0..1.0).contains(&body.curve_param));
            }
        }
    }

    #[test]
    fn velocities_respect_the_effective_cap() {
        let mut sim = seeded_sim(17);
        for _ in 0..600 {
            sim.step(DT, Vec3::new(1.0, 0.5, 0.0));
            let multiplier = sim.phase().velocity_multiplier;
            for body in sim.bodies() {
                let cap = sim.config().effective_max_speed(multiplier, body.mass);
                assert!(
                    body.velocity.length() <= cap * 1.0001,
                    "speed {} exceeds cap {}",
                    body.velocity.length(),
                    cap
                );
            }
        }
    }

    #[test]
    fn heavier_bodies_have_a_lower_speed_cap() {
        let config = SwarmConfig::default();
        let light = config.effective_max_speed(1.0, config.body_mass);
        let heavy = config.effective_max_speed(1.0, config.anchor_mass);
        assert!(heavy < light);
    }

    #[test]
    fn dragged_body_tracks_pointer_plus_offset() {
        let mut sim = sparse_sim();
        let grab = Vec3::new(-0.4, 0.2, 0.0);
        let offset = sim.bodies[0].position - grab;
        assert!(sim.pointer_down(0, grab));

        for i in 1..=10 {
            let pointer = grab + Vec3::new(0.3 * i as f32, 0.1 * i as f32, 0.0);
            sim.step(DT, pointer);
            assert!(sim.bodies[0].position.distance(pointer + offset) < 1e-4);
            // Force pipeline is bypassed while captured.
            assert_eq!(sim.bodies[0].velocity, Vec3::ZERO);
            assert_eq!(sim.bodies[0].acceleration, Vec3::ZERO);
        }
    }

    #[test]
    fn drag_capture_is_exclusive() {
        let mut sim = sparse_sim();
        assert!(sim.pointer_down(0, Vec3::ZERO));
        assert!(!sim.pointer_down(1, Vec3::new(30.0, 30.0, 0.0)));
        assert_eq!(sim.drag_target(), Some(0));

        assert_eq!(sim.pointer_up(), Some(0));
        assert_eq!(sim.drag_target(), None);
        assert!(sim.pointer_down(1, Vec3::new(30.0, 30.0, 0.0)));
        assert_eq!(sim.drag_target(), Some(1));
    }

    #[test]
    fn releasing_a_click_leaves_velocity_at_zero() {
        let mut sim = sparse_sim();
        let grab = sim.bodies[0].position;
        assert!(sim.pointer_down(0, grab));
        for _ in 0..5 {
            sim.step(DT, grab);
        }
        assert_eq!(sim.pointer_up(), Some(0));
        assert_eq!(sim.bodies[0].velocity, Vec3::ZERO);
    }

    #[test]
    fn releasing_a_drag_inherits_a_throw_velocity() {
        let mut sim = sparse_sim();
        let dt = 0.05;
        let grab = sim.bodies[0].position;
        assert!(sim.pointer_down(0, grab));

        // Pointer sweeps +x at a steady 10 units/s.
        for i in 1..=8 {
            sim.step(dt, grab + Vec3::new(0.5 * i as f32, 0.0, 0.0));
        }
        assert_eq!(sim.pointer_up(), Some(0));
        let thrown = sim.bodies[0].velocity;
        let expected = 10.0 * sim.config().drag_throw_factor;
        assert!(thrown.length() > 0.0);
        assert!((thrown.x - expected).abs() < 0.2, "throw x was {}", thrown.x);
        assert!(thrown.y.abs() < 1e-4 && thrown.z.abs() < 1e-4);
    }

    #[test]
    fn out_of_range_capture_is_refused() {
        let mut sim = sparse_sim();
        assert!(!sim.pointer_down(12, Vec3::ZERO));
        assert!(!sim.pointer_down(0, Vec3::new(f32::NAN, 0.0, 0.0)));
        assert_eq!(sim.drag_target(), None);
    }

    #[test]
    fn injections_fire_on_schedule_with_distinct_targets() {
        let mut sim = seeded_sim(5);
        let mut bursts = Vec::new();
        // 90-odd simulated seconds at the dt ceiling; the second burst lands
        // at the 90 s mark and the third not until 135 s.
        for _ in 0..910 {
            let events = sim.step(0.1, Vec3::ZERO);
            if !events.energized.is_empty() {
                bursts.push(events.energized.clone());
            }
        }
        assert_eq!(bursts.len(), 2);
        for burst in &bursts {
            assert_eq!(burst.len(), sim.config().injection_count);
            let mut sorted: Vec<usize> = burst.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), sim.config().injection_count);
            assert!(sorted.iter().all(|&i| i < sim.config().body_count));
        }
    }

    #[test]
    fn bursts_never_target_a_dragged_body() {
        let config = SwarmConfig {
            body_count: 4,
            anchor_indices: vec![0],
            injection_count: 3,
            injection_interval: 1.0,
            rng_seed: Some(21),
            ..SwarmConfig::default()
        };
        let mut sim = Simulation::new(config).expect("valid config");
        let pointer = sim.bodies()[2].position;
        assert!(sim.pointer_down(2, pointer));

        let mut bursts = 0;
        for _ in 0..200 {
            let events = sim.step(0.05, pointer);
            if !events.energized.is_empty() {
                bursts += 1;
                assert_eq!(events.energized.len(), 3);
                assert!(!events.energized.contains(&2));
            }
        }
        assert!(bursts >= 2);
    }

    #[test]
    fn energized_set_clears_after_the_highlight_window() {
        let mut sim = seeded_sim(5);
        for _ in 0..451 {
            sim.step(0.1, Vec3::ZERO);
        }
        assert!(!sim.recently_energized().is_empty());
        for _ in 0..20 {
            sim.step(0.1, Vec3::ZERO);
        }
        assert!(sim.recently_energized().is_empty());
    }

    #[test]
    fn diagnostics_buffer_evicts_oldest_first() {
        let config = SwarmConfig {
            diagnostics_capacity: 5,
            rng_seed: Some(8),
            ..SwarmConfig::default()
        };
        let mut sim = Simulation::new(config).expect("valid config");
        for _ in 0..30 {
            sim.step(0.1, Vec3::ZERO);
        }
        assert_eq!(sim.diagnostics_len(), 5);
        let frames = sim.export_diagnostics();
        assert_eq!(frames.len(), 5);
        for pair in frames.windows(2) {
            assert!(pair[0].time < pair[1].time);
        }
        // Early samples were evicted.
        assert!(frames[0].time > 2.0);
        for frame in &frames {
            assert_eq!(frame.bodies.len(), sim.config().diagnostics_bodies);
        }
    }

    #[test]
    fn non_finite_input_skips_the_tick() {
        let mut sim = seeded_sim(21);
        sim.step(DT, Vec3::ZERO);
        let before = sim.bodies().to_vec();
        let before_tick = sim.tick();

        let events = sim.step(f32::NAN, Vec3::ZERO);
        assert!(events.skipped);
        let events = sim.step(DT, Vec3::new(f32::INFINITY, 0.0, 0.0));
        assert!(events.skipped);

        assert_eq!(sim.bodies(), &before[..]);
        assert_eq!(sim.tick(), before_tick);
    }

    #[test]
    fn identical_seeds_produce_identical_swarms() {
        let mut a = seeded_sim(0xDEAD_BEEF);
        let mut b = seeded_sim(0xDEAD_BEEF);
        for i in 0..300 {
            let pointer = Vec3::new((i as f32 * 0.01).sin() * 4.0, 0.0, 0.0);
            a.step(DT, pointer);
            b.step(DT, pointer);
        }
        for (ba, bb) in a.bodies().iter().zip(b.bodies()) {
            assert_eq!(ba.position, bb.position);
            assert_eq!(ba.velocity, bb.velocity);
            assert_eq!(ba.curve_param, bb.curve_param);
        }

        let mut c = seeded_sim(0xF00D);
        for i in 0..300 {
            let pointer = Vec3::new((i as f32 * 0.01).sin() * 4.0, 0.0, 0.0);
            c.step(DT, pointer);
        }
        assert!(
            a.bodies()
                .iter()
                .zip(c.bodies())
                .any(|(ba, bc)| ba.position != bc.position)
        );
    }

    #[test]
    fn long_run_stays_finite_and_bounded() {
        let mut sim = seeded_sim(7);
        for _ in 0..1000 {
            sim.step(DT, Vec3::ZERO);
        }
        for body in sim.bodies() {
            assert!(body.position.is_finite());
            assert!(body.velocity.is_finite());
            assert!(
                body.position.length() < 25.0,
                "body drifted to {}",
                body.position.length()
            );
        }
    }

    #[test]
    fn breath_pauses_while_hovered_or_dragged() {
        let mut sim = sparse_sim();
        let pos = sim.bodies[0].position;

        // Hovered: pointer sits on the body, breath stays put.
        let before = sim.bodies[0].breath_phase;
        sim.step(DT, pos);
        assert_eq!(sim.bodies[0].breath_phase, before);

        // Unhovered: breath advances.
        sim.step(DT, Vec3::new(50.0, 0.0, 0.0));
        assert!(sim.bodies[0].breath_phase != before);

        // Dragged: frozen again even though the pointer moves.
        let held = sim.bodies[0].breath_phase;
        assert!(sim.pointer_down(0, sim.bodies[0].position));
        sim.step(DT, sim.bodies[0].position + Vec3::new(0.4, 0.0, 0.0));
        assert_eq!(sim.bodies[0].breath_phase, held);
    }

    #[test]
    fn trails_stay_bounded() {
        let config = SwarmConfig {
            trail_capacity: 6,
            rng_seed: Some(2),
            ..SwarmConfig::default()
        };
        let mut sim = Simulation::new(config).expect("valid config");
        for _ in 0..200 {
            sim.step(DT, Vec3::ZERO);
        }
        for body in sim.bodies() {
            assert!(body.trail.len() <= 6);
            assert!(!body.trail.is_empty());
        }
    }

    #[test]
    fn transforms_mirror_the_roster() {
        let mut sim = seeded_sim(11);
        sim.step(DT, Vec3::ZERO);
        let transforms = sim.transforms();
        assert_eq!(transforms.len(), sim.config().body_count);
        for (i, transform) in transforms.iter().enumerate() {
            assert_eq!(transform.index, i);
            assert_eq!(transform.position, sim.bodies()[i].position);
            assert_eq!(transform.velocity, sim.bodies()[i].velocity);
        }
    }
}
