//! Light styles and dynamic lights.

use quake_shared::{
    bsp::{BspModel, Child},
    error::ProtocolError,
    math::{angle_vectors, Vec3},
    protocol::{EntityEffects, MAX_LIGHTSTYLES},
};
use rand::Rng;
use tracing::trace;

pub const MAX_DLIGHTS: usize = 32;

/// Value of a style that is not animated by the server.
const DEFAULT_STYLE_VALUE: i32 = 264;

/// Animated light style strings, sampled at 10 Hz.
///
/// Each character `a..z` maps to a brightness of `(c - 'a') * 22`, so `m`
/// is normal light. An empty string is a constant 256.
#[derive(Debug, Clone)]
pub struct LightStyles {
    patterns: Vec<String>,
    values: [i32; 256],
}

impl Default for LightStyles {
    fn default() -> Self {
        Self::new()
    }
}

impl LightStyles {
    pub fn new() -> Self {
        Self {
            patterns: vec![String::new(); MAX_LIGHTSTYLES],
            values: [DEFAULT_STYLE_VALUE; 256],
        }
    }

    /// Replaces the pattern of `style`. Only `a..=z` are valid levels.
    pub fn set(&mut self, style: usize, pattern: &str) -> Result<(), ProtocolError> {
        let bad = || ProtocolError::BadLightStyle {
            style,
            pattern: pattern.to_string(),
        };
        if !pattern.bytes().all(|c| c.is_ascii_lowercase()) {
            return Err(bad());
        }
        let slot = self.patterns.get_mut(style).ok_or_else(bad)?;
        *slot = pattern.to_string();
        Ok(())
    }

    pub fn pattern(&self, style: usize) -> Option<&str> {
        self.patterns.get(style).map(String::as_str)
    }

    /// Forgets every pattern; used on level change.
    pub fn clear(&mut self) {
        for p in &mut self.patterns {
            p.clear();
        }
    }

    /// Recomputes style values for client time `time`.
    pub fn animate(&mut self, time: f64) {
        let tick = (time * 10.0).max(0.0) as usize;
        for (value, pattern) in self.values.iter_mut().zip(&self.patterns) {
            let bytes = pattern.as_bytes();
            *value = if bytes.is_empty() {
                256
            } else {
                (i32::from(bytes[tick % bytes.len()]) - i32::from(b'a')) * 22
            };
        }
    }

    /// Current brightness scale of `style`.
    pub fn value(&self, style: u8) -> i32 {
        self.values[style as usize]
    }
}

/// A short-lived point light.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DynamicLight {
    /// Owner; a new light with the same non-zero key replaces the old one.
    pub key: i32,
    pub origin: Vec3,
    pub radius: f32,
    pub die: f64,
    /// Radius lost per second.
    pub decay: f32,
    pub minlight: f32,
}

impl DynamicLight {
    pub fn is_active(&self, time: f64) -> bool {
        self.die >= time && self.radius > 0.0
    }
}

/// Fixed table of dynamic lights.
#[derive(Debug, Clone)]
pub struct DynamicLights {
    lights: [DynamicLight; MAX_DLIGHTS],
}

impl Default for DynamicLights {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicLights {
    pub fn new() -> Self {
        Self {
            lights: [DynamicLight::default(); MAX_DLIGHTS],
        }
    }

    pub fn clear(&mut self) {
        self.lights = [DynamicLight::default(); MAX_DLIGHTS];
    }

    pub fn get(&self, index: usize) -> Option<&DynamicLight> {
        self.lights.get(index)
    }

    /// Claims a slot: the one already owned by `key`, else the first
    /// expired one, else slot 0.
    pub fn alloc(&mut self, key: i32, time: f64) -> &mut DynamicLight {
        let index = (key != 0)
            .then(|| self.lights.iter().position(|l| l.key == key))
            .flatten()
            .or_else(|| self.lights.iter().position(|l| l.die < time))
            .unwrap_or(0);
        self.lights[index] = DynamicLight {
            key,
            ..Default::default()
        };
        &mut self.lights[index]
    }

    /// Shrinks every live light by its decay rate.
    pub fn decay(&mut self, time: f64, frametime: f32) {
        for l in &mut self.lights {
            if !l.is_active(time) {
                continue;
            }
            l.radius = (l.radius - frametime * l.decay).max(0.0);
        }
    }

    pub fn active(&self, time: f64) -> impl Iterator<Item = (usize, &DynamicLight)> {
        self.lights
            .iter()
            .enumerate()
            .filter(move |(_, l)| l.is_active(time))
    }

    /// Spawns the lights an entity's effect bits ask for. Radii get up to 31
    /// units of random flicker.
    pub fn spawn_effect_lights<R: Rng>(
        &mut self,
        key: i32,
        origin: Vec3,
        angles: Vec3,
        effects: EntityEffects,
        time: f64,
        rng: &mut R,
    ) {
        if effects.contains(EntityEffects::MUZZLEFLASH) {
            let forward = angle_vectors(angles).forward;
            let dl = self.alloc(key, time);
            dl.origin = origin + Vec3::new(0.0, 0.0, 16.0) + forward * 18.0;
            dl.radius = 200.0 + rng.gen_range(0..32) as f32;
            dl.minlight = 32.0;
            dl.die = time + 0.1;
        }
        if effects.contains(EntityEffects::BRIGHTLIGHT) {
            let dl = self.alloc(key, time);
            dl.origin = origin + Vec3::new(0.0, 0.0, 16.0);
            dl.radius = 400.0 + rng.gen_range(0..32) as f32;
            dl.die = time + 0.001;
        }
        if effects.contains(EntityEffects::DIMLIGHT) {
            let dl = self.alloc(key, time);
            dl.origin = origin;
            dl.radius = 200.0 + rng.gen_range(0..32) as f32;
            dl.die = time + 0.001;
        }
    }

    /// Flags the faces each live light can reach for this frame.
    pub fn mark_lights(&self, model: &mut BspModel, time: f64, frame: u32) -> usize {
        let mut marked = 0;
        for (index, light) in self.active(time) {
            marked += mark_light(model, light, 1 << index, frame);
        }
        if marked > 0 {
            trace!(marked, frame, "dynamic light faces");
        }
        marked
    }

    /// Adds the lights flagged on `face` to a lightmap accumulator of
    /// `smax` by `tmax` luxels.
    pub fn add_to_lightmap(
        &self,
        model: &BspModel,
        face: usize,
        smax: usize,
        tmax: usize,
        blocklights: &mut [u32],
    ) {
        let f = &model.faces[face];
        let plane = model.plane_of(face);
        let tex = model.texinfo_of(face);
        for (bit, light) in self.lights.iter().enumerate() {
            if f.cache.dlightbits & (1 << bit) == 0 {
                continue;
            }
            let dist = plane.normal.dot(light.origin) - plane.dist;
            let rad = light.radius - dist.abs();
            if rad < light.minlight {
                continue;
            }
            let min = rad - light.minlight;
            let impact = light.origin - plane.normal * dist;
            let local_s = tex.project(impact, 0) - f.texture_mins[0] as f32;
            let local_t = tex.project(impact, 1) - f.texture_mins[1] as f32;

            for t in 0..tmax {
                let td = ((local_t - (t * 16) as f32) as i32).abs();
                for s in 0..smax {
                    let sd = ((local_s - (s * 16) as f32) as i32).abs();
                    let d = (if sd > td { sd + (td >> 1) } else { td + (sd >> 1) }) as f32;
                    if d < min {
                        blocklights[t * smax + s] += ((rad - d) * 256.0) as u32;
                    }
                }
            }
        }
    }
}

/// Marks every face on a node plane within `light.radius` of the light.
fn mark_light(model: &mut BspModel, light: &DynamicLight, bit: u32, frame: u32) -> usize {
    let mut marked = 0;
    let mut stack = vec![model.root()];
    while let Some(child) = stack.pop() {
        let Child::Node(n) = child else {
            continue;
        };
        let node = &model.nodes[n];
        let dist = model.planes[node.plane].distance(light.origin);
        if dist > light.radius {
            stack.push(node.children[0]);
            continue;
        }
        if dist < -light.radius {
            stack.push(node.children[1]);
            continue;
        }
        let children = node.children;
        let faces = node.first_face..node.first_face + node.num_faces;
        for face in &mut model.faces[faces] {
            let cache = &mut face.cache;
            if cache.dlightframe != frame {
                cache.dlightbits = 0;
                cache.dlightframe = frame;
            }
            cache.dlightbits |= bit;
            marked += 1;
        }
        stack.extend(children);
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    use crate::lightmap::build_lightmap;
    use crate::surface::tests::square_world;
    use crate::visibility::tests::slab_world;

    #[test]
    fn styles_animate_at_ten_hz() {
        let mut styles = LightStyles::new();
        styles.set(0, "az").unwrap();
        styles.animate(0.05);
        assert_eq!(styles.value(0), 0);
        styles.animate(0.15);
        assert_eq!(styles.value(0), 25 * 22);
        // Unset styles are constant; styles past the table keep the default.
        assert_eq!(styles.value(1), 256);
        assert_eq!(styles.value(200), 264);
        assert!(styles.set(MAX_LIGHTSTYLES, "m").is_err());
    }

    #[test]
    fn rejects_levels_outside_a_to_z() {
        let mut styles = LightStyles::new();
        styles.set(1, "mz").unwrap();
        for bad in ["A", "m0", "m m", "\u{e9}"] {
            assert_eq!(
                styles.set(1, bad),
                Err(ProtocolError::BadLightStyle {
                    style: 1,
                    pattern: bad.to_string()
                })
            );
        }
        assert_eq!(styles.pattern(1), Some("mz"));

        // Whatever is stored lights a face without overflowing.
        let mut model = square_world();
        model.lighting = vec![255; 25];
        model.faces[0].light_offset = Some(0);
        model.faces[0].styles = [1, 255, 255, 255];
        styles.animate(0.15);
        assert_eq!(styles.value(1), 25 * 22);
        let texels = build_lightmap(&mut model, 0, &styles, None, false);
        assert!(texels.iter().all(|&t| t == 255));
    }

    #[test]
    fn keyed_lights_reuse_their_slot() {
        let mut lights = DynamicLights::new();
        lights.alloc(7, 1.0).die = 2.0;
        lights.alloc(8, 1.0).die = 2.0;
        let again = lights.alloc(7, 1.0);
        again.radius = 50.0;
        again.die = 2.0;
        assert_eq!(lights.get(0).map(|l| l.radius), Some(50.0));
        assert_eq!(lights.active(1.5).count(), 1);
        assert_eq!(lights.active(2.5).count(), 0);
    }

    #[test]
    fn lights_decay_to_zero() {
        let mut lights = DynamicLights::new();
        let dl = lights.alloc(1, 0.0);
        dl.radius = 100.0;
        dl.decay = 300.0;
        dl.die = 10.0;
        lights.decay(0.5, 0.25);
        assert_eq!(lights.get(0).map(|l| l.radius), Some(25.0));
        lights.decay(0.75, 0.25);
        assert_eq!(lights.active(0.75).count(), 0);
    }

    #[test]
    fn effects_spawn_jittered_lights() {
        let mut lights = DynamicLights::new();
        let mut rng = StdRng::seed_from_u64(1);
        lights.spawn_effect_lights(
            3,
            Vec3::ZERO,
            Vec3::ZERO,
            EntityEffects::MUZZLEFLASH,
            5.0,
            &mut rng,
        );
        let dl = lights.get(0).copied().unwrap();
        assert_eq!(dl.origin, Vec3::new(18.0, 0.0, 16.0));
        assert!((200.0..232.0).contains(&dl.radius));
        assert_eq!(dl.minlight, 32.0);
        assert!(dl.is_active(5.05));
        assert!(!dl.is_active(5.2));
    }

    #[test]
    fn marks_faces_on_nearby_node_planes() {
        let mut model = slab_world(1024.0);
        model.nodes[0].num_faces = 1;
        let mut lights = DynamicLights::new();
        let dl = lights.alloc(1, 0.0);
        dl.origin = Vec3::new(10.0, 0.0, 0.0);
        dl.radius = 50.0;
        dl.die = 1.0;
        assert_eq!(lights.mark_lights(&mut model, 0.0, 4), 1);
        assert_eq!(model.faces[0].cache.dlightframe, 4);
        assert_eq!(model.faces[0].cache.dlightbits, 1);

        let mut model = slab_world(1024.0);
        model.nodes[0].num_faces = 1;
        let dl = lights.alloc(1, 0.0);
        dl.origin = Vec3::new(100.0, 0.0, 0.0);
        dl.radius = 10.0;
        dl.die = 1.0;
        assert_eq!(lights.mark_lights(&mut model, 0.0, 4), 0);
    }

    #[test]
    fn dynamic_light_falls_off_across_the_face() {
        let mut model = square_world();
        model.lighting = vec![0; 25];
        model.faces[0].light_offset = Some(0);
        model.faces[0].cache.dlightframe = 1;
        model.faces[0].cache.dlightbits = 1;

        let mut lights = DynamicLights::new();
        let dl = lights.alloc(1, 0.0);
        dl.origin = Vec3::new(0.0, 0.0, 10.0);
        dl.radius = 100.0;
        dl.die = 1.0;

        let styles = LightStyles::new();
        let texels = build_lightmap(&mut model, 0, &styles, Some(&lights), false);
        assert_eq!(texels[0], 90);
        assert_eq!(texels[1], 74);
        assert!(model.faces[0].cache.cached_dlight);
    }
}
