//! Entity state and interpolation.
//!
//! The server sends discrete entity updates; the client renders at its own
//! rate and interpolates between the last two received states of each slot.
//!
//! A slot that was not part of the previous server message is on its first
//! sighting and snaps to its new state. A slot missing from the latest
//! message is retired.

use quake_shared::{
    error::CapacityError,
    math::{lerp_angle, Vec3},
    protocol::{EntityBaseline, EntityEffects, EntityState, EntityUpdate, MAX_EDICTS},
};
use tracing::{debug, trace};

/// Position jump treated as a teleport rather than motion.
pub const TELEPORT_DISTANCE: f32 = 100.0;
/// Largest gap between server messages that is interpolated across.
pub const MAX_LERP_INTERVAL: f64 = 0.1;

/// One entity slot.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub baseline: EntityBaseline,
    pub current: EntityState,
    pub previous: EntityState,
    /// Time of the last message that carried this slot.
    pub msg_time: f64,
    /// Snap to `current` instead of interpolating.
    pub force_link: bool,
    pub active: bool,
}

/// Render-ready placement of an entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityTransform {
    pub origin: Vec3,
    pub angles: Vec3,
    pub model: u8,
    pub frame: u8,
    pub skin: u8,
    pub colormap: u8,
    pub effects: EntityEffects,
}

impl EntityTransform {
    fn from_state(s: &EntityState, origin: Vec3, angles: Vec3) -> Self {
        Self {
            origin,
            angles,
            model: s.model,
            frame: s.frame,
            skin: s.skin,
            colormap: s.colormap,
            effects: s.effects,
        }
    }
}

/// All entity slots for the current level.
#[derive(Debug)]
pub struct EntityStore {
    slots: Vec<Entity>,
    /// Latest and previous distinct server message times.
    mtime: [f64; 2],
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            mtime: [0.0; 2],
        }
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut Entity, CapacityError> {
        if slot >= MAX_EDICTS {
            return Err(CapacityError::EntitySlots {
                slot,
                max: MAX_EDICTS,
            });
        }
        if slot >= self.slots.len() {
            self.slots.resize_with(slot + 1, Entity::default);
        }
        Ok(&mut self.slots[slot])
    }

    pub fn get(&self, slot: usize) -> Option<&Entity> {
        self.slots.get(slot).filter(|e| e.active)
    }

    /// Records that a server message stamped `time` has started.
    pub fn begin_message(&mut self, time: f64) {
        if time != self.mtime[0] {
            self.mtime[1] = self.mtime[0];
            self.mtime[0] = time;
        }
    }

    pub fn message_times(&self) -> [f64; 2] {
        self.mtime
    }

    pub fn set_baseline(&mut self, slot: usize, baseline: EntityBaseline) -> Result<(), CapacityError> {
        self.slot_mut(slot)?.baseline = baseline;
        Ok(())
    }

    pub fn baseline(&self, slot: usize) -> Option<&EntityBaseline> {
        self.slots.get(slot).map(|e| &e.baseline)
    }

    /// Resolves a delta against the slot's baseline and stores it.
    pub fn apply_update(&mut self, update: &EntityUpdate, time: f64) -> Result<(), CapacityError> {
        let slot = update.entity as usize;
        let state = update.apply(&self.slot_mut(slot)?.baseline);
        self.store(slot, state, time)
    }

    /// Rotates `previous <- current <- state` for `slot`.
    pub fn store(&mut self, slot: usize, state: EntityState, time: f64) -> Result<(), CapacityError> {
        self.begin_message(time);
        let previous_message = self.mtime[1];
        let e = self.slot_mut(slot)?;
        let first_sighting = !e.active || e.msg_time != previous_message;
        e.previous = if first_sighting { state } else { e.current };
        e.current = state;
        e.force_link = first_sighting || state.nolerp;
        e.msg_time = time;
        if !e.active {
            trace!(slot, model = state.model, "entity appeared");
        }
        e.active = true;
        Ok(())
    }

    pub fn remove(&mut self, slot: usize) {
        if let Some(e) = self.slots.get_mut(slot) {
            e.active = false;
        }
    }

    /// Frees every slot not carried by the message at `time`.
    pub fn retire_missing(&mut self, time: f64) -> usize {
        let mut retired = 0;
        for (slot, e) in self.slots.iter_mut().enumerate() {
            if e.active && e.msg_time != time {
                e.active = false;
                retired += 1;
                trace!(slot, "entity retired");
            }
        }
        retired
    }

    /// Frees all slots and baselines.
    pub fn clear(&mut self) {
        debug!(slots = self.slots.len(), "entity store cleared");
        self.slots.clear();
        self.mtime = [0.0; 2];
    }

    pub fn active(&self) -> impl Iterator<Item = (usize, &Entity)> {
        self.slots.iter().enumerate().filter(|(_, e)| e.active)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Position and orientation of `slot` at `fraction` between the last two
    /// states.
    pub fn interpolate(&self, slot: usize, fraction: f32) -> Option<EntityTransform> {
        let e = self.get(slot)?;
        let cur = &e.current;
        if e.force_link {
            return Some(EntityTransform::from_state(cur, cur.origin, cur.angles));
        }
        let delta = cur.origin - e.previous.origin;
        if (0..3).any(|i| delta[i].abs() > TELEPORT_DISTANCE) {
            return Some(EntityTransform::from_state(cur, cur.origin, cur.angles));
        }
        let origin = e.previous.origin.mul_add(fraction, delta);
        let mut angles = Vec3::ZERO;
        for i in 0..3 {
            angles[i] = lerp_angle(e.previous.angles[i], cur.angles[i], fraction);
        }
        Some(EntityTransform::from_state(cur, origin, angles))
    }

    /// Interpolation fraction for client time `time`.
    ///
    /// Returns the fraction and the (possibly clamped) client time. Gaps
    /// longer than [`MAX_LERP_INTERVAL`] are shortened so slow servers do
    /// not cause long slides.
    pub fn lerp_fraction(&mut self, time: f64) -> (f32, f64) {
        let mut f = self.mtime[0] - self.mtime[1];
        if f <= 0.0 {
            return (1.0, self.mtime[0]);
        }
        if f > MAX_LERP_INTERVAL {
            self.mtime[1] = self.mtime[0] - MAX_LERP_INTERVAL;
            f = MAX_LERP_INTERVAL;
        }
        let frac = (time - self.mtime[1]) / f;
        if frac < 0.0 {
            let t = if frac < -0.01 { self.mtime[1] } else { time };
            (0.0, t)
        } else if frac > 1.0 {
            let t = if frac > 1.01 { self.mtime[0] } else { time };
            (1.0, t)
        } else {
            (frac as f32, time)
        }
    }
}
