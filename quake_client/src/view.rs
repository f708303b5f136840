//! Camera/view pipeline.
//!
//! The eye starts at the player entity's origin raised by the view height,
//! looking along the client's view angles. A fixed sequence of stages then
//! adjusts it: bob, idle sway, roll (strafe lean plus damage kick) and, when
//! enabled, the chase camera.

use std::f32::consts::PI;

use quake_shared::{
    bsp::BspModel,
    config::ViewConfig,
    math::{angle_vectors, Vec3, PITCH, ROLL, YAW},
    render::RefDef,
};
use tracing::trace;

/// Everything the stages read about the current frame.
#[derive(Debug, Clone, Copy)]
pub struct ViewInput<'a> {
    pub time: f64,
    pub frametime: f32,
    /// Interpolated player entity origin and angles.
    pub origin: Vec3,
    pub entity_angles: Vec3,
    /// Client view angles.
    pub view_angles: Vec3,
    pub velocity: Vec3,
    pub view_height: f32,
    pub health: i32,
    /// Viewport height over width.
    pub aspect: f32,
    pub world: Option<&'a BspModel>,
}

impl Default for ViewInput<'_> {
    fn default() -> Self {
        Self {
            time: 0.0,
            frametime: 0.0,
            origin: Vec3::ZERO,
            entity_angles: Vec3::ZERO,
            view_angles: Vec3::ZERO,
            velocity: Vec3::ZERO,
            view_height: 22.0,
            health: 100,
            aspect: 0.75,
            world: None,
        }
    }
}

/// The eye position being built up by the stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingView {
    pub origin: Vec3,
    pub angles: Vec3,
}

/// One step of the view pipeline.
pub trait ViewStage {
    fn name(&self) -> &'static str;
    fn apply(&mut self, input: &ViewInput<'_>, cfg: &ViewConfig, view: &mut PendingView);
}

/// Vertical bob driven by horizontal speed.
#[derive(Debug, Default)]
pub struct BobStage;

impl BobStage {
    pub fn calc_bob(input: &ViewInput<'_>, cfg: &ViewConfig) -> f32 {
        if cfg.bob_cycle <= 0.0 || cfg.bob_up <= 0.0 || cfg.bob_up >= 1.0 {
            return 0.0;
        }
        let period = f64::from(cfg.bob_cycle);
        let mut cycle = (input.time - (input.time / period).trunc() * period) as f32;
        cycle /= cfg.bob_cycle;
        cycle = if cycle < cfg.bob_up {
            PI * cycle / cfg.bob_up
        } else {
            PI + PI * (cycle - cfg.bob_up) / (1.0 - cfg.bob_up)
        };
        let v = input.velocity;
        let speed = (v.x * v.x + v.y * v.y).sqrt() * cfg.bob;
        let bob = speed * 0.3 + speed * 0.7 * cycle.sin();
        bob.clamp(-7.0, 4.0)
    }
}

impl ViewStage for BobStage {
    fn name(&self) -> &'static str {
        "bob"
    }

    fn apply(&mut self, input: &ViewInput<'_>, cfg: &ViewConfig, view: &mut PendingView) {
        view.origin.z += Self::calc_bob(input, cfg);
    }
}

/// Idle sway: three independent sine oscillators on the view angles.
#[derive(Debug, Default)]
pub struct SwayStage;

impl ViewStage for SwayStage {
    fn name(&self) -> &'static str {
        "sway"
    }

    fn apply(&mut self, input: &ViewInput<'_>, cfg: &ViewConfig, view: &mut PendingView) {
        let t = input.time as f32;
        let scale = cfg.idle_scale;
        view.angles[ROLL] += scale * (t * cfg.iroll_cycle).sin() * cfg.iroll_level;
        view.angles[PITCH] += scale * (t * cfg.ipitch_cycle).sin() * cfg.ipitch_level;
        view.angles[YAW] += scale * (t * cfg.iyaw_cycle).sin() * cfg.iyaw_level;
    }
}

/// Strafe lean plus the decaying kick from the last hit taken.
#[derive(Debug, Default)]
pub struct RollStage {
    kick_time: f32,
    kick_roll: f32,
    kick_pitch: f32,
}

impl RollStage {
    /// Roll angle for moving at `velocity` while facing `angles`.
    pub fn calc_roll(angles: Vec3, velocity: Vec3, cfg: &ViewConfig) -> f32 {
        let right = angle_vectors(angles).right;
        let side = velocity.dot(right);
        let sign = if side < 0.0 { -1.0 } else { 1.0 };
        let side = side.abs();
        let value = if side < cfg.roll_speed {
            side * cfg.roll_angle / cfg.roll_speed
        } else {
            cfg.roll_angle
        };
        value * sign
    }

    /// Seconds of kick left.
    pub fn kick_remaining(&self) -> f32 {
        self.kick_time.max(0.0)
    }

    fn prime(&mut self, count: f32, from: Vec3, origin: Vec3, angles: Vec3, cfg: &ViewConfig) {
        let dir = (from - origin).normalize();
        let basis = angle_vectors(angles);
        self.kick_roll = count * dir.dot(basis.right) * cfg.kick_roll;
        self.kick_pitch = count * dir.dot(basis.forward) * cfg.kick_pitch;
        self.kick_time = cfg.kick_time;
    }
}

impl ViewStage for RollStage {
    fn name(&self) -> &'static str {
        "roll"
    }

    fn apply(&mut self, input: &ViewInput<'_>, cfg: &ViewConfig, view: &mut PendingView) {
        view.angles[ROLL] += Self::calc_roll(input.entity_angles, input.velocity, cfg);
        if self.kick_time > 0.0 && cfg.kick_time > 0.0 {
            let k = self.kick_time / cfg.kick_time;
            view.angles[ROLL] += k * self.kick_roll;
            view.angles[PITCH] += k * self.kick_pitch;
            self.kick_time -= input.frametime;
        }
        if input.health <= 0 {
            view.angles[ROLL] = 80.0;
        }
    }
}

/// Third-person camera pulled back from the eye.
#[derive(Debug, Default)]
pub struct ChaseStage;

impl ViewStage for ChaseStage {
    fn name(&self) -> &'static str {
        "chase"
    }

    fn apply(&mut self, input: &ViewInput<'_>, cfg: &ViewConfig, view: &mut PendingView) {
        if !cfg.chase_active {
            return;
        }
        let basis = angle_vectors(input.view_angles);
        let eye = view.origin;
        let mut dest = eye - basis.forward * cfg.chase_back - basis.right * cfg.chase_right;
        dest.z = eye.z + cfg.chase_up;

        // Keep looking at the spot the player is aiming at.
        let far = eye + basis.forward * 4096.0;
        let aim = input
            .world
            .and_then(|w| w.trace_line(eye, far))
            .unwrap_or(far);
        let to_aim = aim - eye;
        let dist = to_aim.dot(basis.forward).max(1.0);
        view.angles[PITCH] = -(to_aim.z / dist).atan().to_degrees();

        if let Some(hit) = input.world.and_then(|w| w.trace_line(eye, dest)) {
            dest = hit;
        }
        view.origin = dest;
    }
}

/// Horizontal field of view to vertical, for a viewport of the given
/// height-over-width ratio.
pub fn calc_fov_y(fov_x: f32, aspect: f32) -> f32 {
    let x = (fov_x.to_radians() / 2.0).tan();
    ((x * aspect).atan() * 2.0).to_degrees()
}

/// The stages in their fixed order.
#[derive(Debug, Default)]
pub struct ViewPipeline {
    bob: BobStage,
    sway: SwayStage,
    roll: RollStage,
    chase: ChaseStage,
}

impl ViewPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages_mut(&mut self) -> [&mut dyn ViewStage; 4] {
        [&mut self.bob, &mut self.sway, &mut self.roll, &mut self.chase]
    }

    pub fn stage_names(&self) -> [&'static str; 4] {
        [
            self.bob.name(),
            self.sway.name(),
            self.roll.name(),
            self.chase.name(),
        ]
    }

    /// Primes the damage kick from a hit of strength `count` coming from
    /// `from`, for a player at `origin` facing `angles`.
    pub fn parse_damage(&mut self, count: f32, from: Vec3, origin: Vec3, angles: Vec3, cfg: &ViewConfig) {
        self.roll.prime(count, from, origin, angles, cfg);
        trace!(count, kick = self.roll.kick_time, "damage kick");
    }

    pub fn kick_remaining(&self) -> f32 {
        self.roll.kick_remaining()
    }

    /// Runs every stage and returns the final view.
    pub fn calc_refdef(&mut self, input: &ViewInput<'_>, cfg: &ViewConfig) -> RefDef {
        let mut view = PendingView {
            // Nudge off exact integer positions.
            origin: input.origin + Vec3::splat(1.0 / 32.0) + Vec3::new(0.0, 0.0, input.view_height),
            angles: input.view_angles,
        };
        for stage in self.stages_mut() {
            stage.apply(input, cfg, &mut view);
        }
        let fov_x = cfg.fov.clamp(10.0, 170.0);
        RefDef {
            origin: view.origin,
            angles: view.angles,
            fov_x,
            fov_y: calc_fov_y(fov_x, input.aspect),
        }
    }
}

/// Kick strength of a damage message.
pub fn damage_count(armor: u8, blood: u8) -> f32 {
    (f32::from(blood) * 0.5 + f32::from(armor) * 0.5).max(10.0)
}
