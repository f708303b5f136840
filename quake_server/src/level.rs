//! Level state.
//!
//! A level is built from a world model: its entity lump fills the edict
//! table and the precache lists, and standard light styles are installed.
//! Edict 0 is the world and edicts `1..=max_clients` are reserved for
//! players; map entities follow.

use quake_shared::{
    bsp::{BspEntity, BspModel},
    error::CapacityError,
    math::Vec3,
    protocol::{EntityBaseline, EntityState, MAX_EDICTS, MAX_LIGHTSTYLES, MAX_MODELS, MAX_SOUNDS},
};
use tracing::{debug, info};

pub const PLAYER_MODEL: &str = "progs/player.mdl";
pub const TALK_SOUND: &str = "misc/talk.wav";

/// First style number handed to switchable lights.
const FIRST_SWITCHED_STYLE: usize = 32;
const LIGHT_START_OFF: i32 = 1;

/// Animated styles every level starts with.
const STANDARD_STYLES: [(usize, &str); 13] = [
    (0, "m"),
    (1, "mmnmmommommnonmmonqnmmo"),
    (2, "abcdefghijklmnopqrstuvwxyzyxwvutsrqponmlkjihgfedcba"),
    (3, "mmmmmaaaaammmmmaaaaaabcdefgabcdefg"),
    (4, "mamamamamama"),
    (5, "jklmnopqrstuvwxyzyxwvutsrqponmlkj"),
    (6, "nmonqnmomnmomomno"),
    (7, "mmmaaaabcdefgmmmmaaaammmaamm"),
    (8, "mmmaaammmaaammmabcdefaaaammmmabcdefmmmaaaa"),
    (9, "aaaaaaaazzzzzzzz"),
    (10, "mmamammmmammamamaaamammma"),
    (11, "abcdefghijklmnopqrrqponmlkjihgfedcba"),
    (63, "a"),
];

/// Server-side entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Edict {
    pub classname: String,
    pub baseline: EntityBaseline,
    pub state: EntityState,
    pub free: bool,
}

impl Edict {
    fn new(classname: &str, baseline: EntityBaseline) -> Self {
        Self {
            classname: classname.to_string(),
            baseline,
            state: EntityState {
                model: baseline.model,
                frame: baseline.frame,
                colormap: baseline.colormap,
                skin: baseline.skin,
                origin: baseline.origin,
                angles: baseline.angles,
                ..Default::default()
            },
            free: false,
        }
    }

    /// Puts the entity back to its baseline.
    pub fn reset_state(&mut self) {
        *self = Self::new(&self.classname, self.baseline);
    }
}

#[derive(Debug)]
pub struct Level {
    /// Short map name, e.g. `e1m1`.
    pub name: String,
    /// Title from the worldspawn `message` key.
    pub message: String,
    pub world: BspModel,
    /// Model precache; entity model index `i` names `models[i - 1]`.
    pub models: Vec<String>,
    /// Sound precache; sound index `i` names `sounds[i - 1]`.
    pub sounds: Vec<String>,
    /// Style patterns; empty means unset.
    pub light_styles: Vec<String>,
    pub edicts: Vec<Edict>,
    pub spawn_points: Vec<(Vec3, Vec3)>,
    max_clients: usize,
}

impl Level {
    pub fn new(name: &str, world: BspModel, max_clients: usize) -> Result<Self, CapacityError> {
        let mut level = Level {
            name: name.to_string(),
            message: String::new(),
            models: vec![world.name.clone()],
            world,
            sounds: Vec::new(),
            light_styles: vec![String::new(); MAX_LIGHTSTYLES],
            edicts: Vec::new(),
            spawn_points: Vec::new(),
            max_clients,
        };
        for i in 1..level.world.submodels.len() {
            level.precache_model(&format!("*{i}"))?;
        }
        let player_model = level.precache_model(PLAYER_MODEL)?;
        level.precache_sound(TALK_SOUND)?;
        for (style, pattern) in STANDARD_STYLES {
            level.light_styles[style] = pattern.to_string();
        }

        level.edicts.push(Edict::new(
            "worldspawn",
            EntityBaseline {
                model: 1,
                ..Default::default()
            },
        ));
        for slot in 0..max_clients {
            let mut player = Edict::new(
                "player",
                EntityBaseline {
                    model: player_model,
                    colormap: (slot + 1) as u8,
                    ..Default::default()
                },
            );
            player.free = true;
            level.edicts.push(player);
        }

        let entities = std::mem::take(&mut level.world.entities);
        let spawned = entities.iter().try_for_each(|ent| level.spawn(ent).map(drop));
        level.world.entities = entities;
        spawned?;

        info!(
            map = %level.name,
            edicts = level.edicts.len(),
            models = level.models.len(),
            spawn_points = level.spawn_points.len(),
            "level built"
        );
        Ok(level)
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Title shown to clients.
    pub fn title(&self) -> &str {
        if self.message.is_empty() {
            &self.name
        } else {
            &self.message
        }
    }

    /// Adds `name` to the model precache and returns its index.
    pub fn precache_model(&mut self, name: &str) -> Result<u8, CapacityError> {
        precache(&mut self.models, name, "models", MAX_MODELS)
    }

    pub fn precache_sound(&mut self, name: &str) -> Result<u8, CapacityError> {
        precache(&mut self.sounds, name, "sounds", MAX_SOUNDS)
    }

    pub fn sound_index(&self, name: &str) -> Option<u8> {
        self.sounds.iter().position(|s| s == name).map(|i| (i + 1) as u8)
    }

    fn model_name(&self, index: u8) -> Option<&str> {
        (index as usize)
            .checked_sub(1)
            .and_then(|i| self.models.get(i))
            .map(String::as_str)
    }

    /// Spawns one map entity. Returns its edict number when it got one.
    pub fn spawn(&mut self, ent: &BspEntity) -> Result<Option<u16>, CapacityError> {
        let origin = ent.origin().unwrap_or(Vec3::ZERO);
        let angles = ent.angles().unwrap_or(Vec3::ZERO);
        match ent.classname.as_str() {
            "worldspawn" => {
                if let Some(m) = ent.get("message") {
                    self.message = m.to_string();
                }
                return Ok(None);
            }
            "info_player_start" | "info_player_deathmatch" | "info_player_coop" => {
                self.spawn_points.push((origin, angles));
                return Ok(None);
            }
            c if c.starts_with("light") && ent.get("model").is_none() => {
                self.switchable_light(ent);
                return Ok(None);
            }
            _ => {}
        }

        let model = match ent.get("model") {
            Some(m) => self.precache_model(m)?,
            None => 0,
        };
        if let Some(noise) = ent.get("noise") {
            self.precache_sound(noise)?;
        }
        if self.edicts.len() >= MAX_EDICTS {
            return Err(CapacityError::Table {
                what: "edicts",
                max: MAX_EDICTS,
            });
        }
        let num = self.edicts.len() as u16;
        self.edicts.push(Edict::new(
            &ent.classname,
            EntityBaseline {
                model,
                origin,
                angles,
                ..Default::default()
            },
        ));
        debug!(num, classname = %ent.classname, model, "spawned");
        Ok(Some(num))
    }

    /// Lights on styles 32 and up can be toggled; they start lit unless
    /// flagged otherwise.
    fn switchable_light(&mut self, ent: &BspEntity) {
        let Some(style) = ent.get("style").and_then(|s| s.trim().parse::<usize>().ok()) else {
            return;
        };
        if !(FIRST_SWITCHED_STYLE..MAX_LIGHTSTYLES).contains(&style) {
            return;
        }
        let flags: i32 = ent
            .get("spawnflags")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let pattern = if flags & LIGHT_START_OFF != 0 { "a" } else { "m" };
        self.light_styles[style] = pattern.to_string();
    }

    /// Edict number of the player in `slot`.
    pub fn player_edict(slot: usize) -> usize {
        slot + 1
    }

    /// Spawn point for `slot`, cycling through the map's starts.
    pub fn spawn_point(&self, slot: usize) -> (Vec3, Vec3) {
        if self.spawn_points.is_empty() {
            return (Vec3::ZERO, Vec3::ZERO);
        }
        self.spawn_points[slot % self.spawn_points.len()]
    }

    /// Visible leaf set from `eye`.
    pub fn pvs(&self, eye: Vec3) -> Vec<u8> {
        self.world.leaf_pvs(self.world.point_in_leaf(eye))
    }

    /// Whether edict `e` is worth sending to a viewer with `pvs`.
    pub fn is_visible(&self, e: &Edict, pvs: &[u8]) -> bool {
        // Brush models are positioned by their geometry, not their origin.
        if self.model_name(e.state.model).is_some_and(|m| m.starts_with('*')) {
            return true;
        }
        let leaf = self.world.point_in_leaf(e.state.origin);
        if leaf == 0 {
            return true;
        }
        let bit = leaf - 1;
        pvs.get(bit >> 3).map_or(true, |b| b & (1 << (bit & 7)) != 0)
    }
}

fn precache(list: &mut Vec<String>, name: &str, what: &'static str, max: usize) -> Result<u8, CapacityError> {
    if let Some(i) = list.iter().position(|s| s == name) {
        return Ok((i + 1) as u8);
    }
    // Index 0 means "none", so one slot of the table is unusable.
    if list.len() + 1 >= max {
        return Err(CapacityError::Table { what, max });
    }
    list.push(name.to_string());
    Ok(list.len() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quake_shared::bsp::parse_entity_lump;

    fn world(lump: &str) -> BspModel {
        BspModel {
            name: "maps/start.bsp".into(),
            entities: parse_entity_lump(lump),
            ..Default::default()
        }
    }

    const LUMP: &str = r#"
{ "classname" "worldspawn" "message" "Introduction" }
{ "classname" "info_player_start" "origin" "480 -352 88" "angle" "90" }
{ "classname" "light" "origin" "0 0 0" "style" "32" "spawnflags" "1" }
{ "classname" "light_fluoro" "origin" "0 0 0" }
{ "classname" "misc_explobox" "model" "maps/b_explob.bsp" "origin" "64 0 0" }
{ "classname" "ambient_drip" "noise" "ambience/drip1.wav" "origin" "0 64 0" }
"#;

    #[test]
    fn builds_tables_from_entity_lump() {
        let level = Level::new("start", world(LUMP), 4).unwrap();
        assert_eq!(level.title(), "Introduction");
        assert_eq!(level.models, ["maps/start.bsp", PLAYER_MODEL, "maps/b_explob.bsp"]);
        assert_eq!(level.sounds, [TALK_SOUND, "ambience/drip1.wav"]);
        assert_eq!(level.spawn_point(0), (Vec3::new(480.0, -352.0, 88.0), Vec3::new(0.0, 90.0, 0.0)));
        assert_eq!(level.light_styles[32], "a");
        assert_eq!(level.light_styles[0], "m");

        // World, four player slots, the box and the drip.
        assert_eq!(level.edicts.len(), 7);
        assert!(level.edicts[1..=4].iter().all(|e| e.free && e.baseline.model == 2));
        assert_eq!(level.edicts[3].baseline.colormap, 3);
        let bx = &level.edicts[5];
        assert_eq!(bx.classname, "misc_explobox");
        assert_eq!(bx.state.model, 3);
        assert_eq!(bx.state.origin, Vec3::new(64.0, 0.0, 0.0));
        assert_eq!(level.edicts[6].state.model, 0);
    }

    #[test]
    fn precache_reuses_and_fills() {
        let mut names = Vec::new();
        assert_eq!(precache(&mut names, "a", "models", 4), Ok(1));
        assert_eq!(precache(&mut names, "b", "models", 4), Ok(2));
        assert_eq!(precache(&mut names, "a", "models", 4), Ok(1));
        assert_eq!(precache(&mut names, "c", "models", 4), Ok(3));
        assert_eq!(
            precache(&mut names, "d", "models", 4),
            Err(CapacityError::Table {
                what: "models",
                max: 4
            })
        );
    }

    #[test]
    fn no_spawn_points_uses_the_origin() {
        let level = Level::new("void", world(r#"{ "classname" "worldspawn" }"#), 1).unwrap();
        assert_eq!(level.spawn_point(3), (Vec3::ZERO, Vec3::ZERO));
        assert_eq!(level.title(), "void");
    }
}
