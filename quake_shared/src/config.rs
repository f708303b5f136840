//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to app).
//! Tunables that players change at runtime are mirrored as console cvars:
//! each section registers its fields with their configured values as the
//! defaults and reads them back every frame with `sync_from_console`.

use serde::{Deserialize, Serialize};

use crate::console::{Console, CvarFlags};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:26000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Root directory holding game directories.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Game directory searched for content (`id1`).
    #[serde(default = "default_game_dir")]
    pub game_dir: String,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub input: InputConfig,
}

fn default_base_dir() -> String {
    ".".to_string()
}

fn default_game_dir() -> String {
    "id1".to_string()
}

fn default_player_name() -> String {
    "player".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:26000".to_string(),
            tick_hz: 20,
            base_dir: default_base_dir(),
            game_dir: default_game_dir(),
            player_name: default_player_name(),
            net: NetConfig::default(),
            view: ViewConfig::default(),
            render: RenderConfig::default(),
            input: InputConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Registers every runtime-tunable section as cvars.
    pub fn register_cvars(&self, console: &mut Console) {
        console.register_cvar("_cl_name", &self.player_name, "player name", CvarFlags::ARCHIVE);
        self.net.register_cvars(console);
        self.view.register_cvars(console);
        self.render.register_cvars(console);
        self.input.register_cvars(console);
    }

    /// Pulls current cvar values back into the config sections.
    pub fn sync_from_console(&mut self, console: &Console) {
        if let Some(name) = console.string("_cl_name") {
            self.player_name = name.to_string();
        }
        self.net.sync_from_console(console);
        self.view.sync_from_console(console);
        self.render.sync_from_console(console);
        self.input.sync_from_console(console);
    }
}

/// Implements cvar mirroring for a config section whose fields are all
/// numeric or boolean.
macro_rules! cvar_section {
    (@show f32, $v:expr) => { $v.to_string() };
    (@show u32, $v:expr) => { $v.to_string() };
    (@show bool, $v:expr) => { if $v { "1".to_string() } else { "0".to_string() } };
    (@read f32, $v:expr) => { $v };
    (@read u32, $v:expr) => { $v.max(0.0) as u32 };
    (@read bool, $v:expr) => { $v != 0.0 };
    ($ty:ty { $($field:ident : $kind:ident = $cvar:literal),* $(,)? }) => {
        impl $ty {
            pub fn register_cvars(&self, console: &mut Console) {
                $(
                    console.register_cvar(
                        $cvar,
                        &cvar_section!(@show $kind, self.$field),
                        "",
                        CvarFlags::ARCHIVE,
                    );
                )*
            }

            pub fn sync_from_console(&mut self, console: &Console) {
                $(
                    if let Some(c) = console.cvar($cvar) {
                        self.$field = cvar_section!(@read $kind, c.value);
                    }
                )*
            }
        }
    };
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetConfig {
    /// Seconds of silence before a connection is dropped.
    pub timeout_secs: f32,
    /// Seconds between connect request retries.
    pub connect_retry_secs: f32,
    /// Connect attempts before giving up.
    pub connect_attempts: u32,
    /// Server player slots.
    pub max_clients: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30.0,
            connect_retry_secs: 2.5,
            connect_attempts: 3,
            max_clients: 4,
        }
    }
}

cvar_section!(NetConfig {
    timeout_secs: f32 = "net_messagetimeout",
    connect_retry_secs: f32 = "net_connectretry",
    connect_attempts: u32 = "net_connectattempts",
    max_clients: u32 = "sv_maxclients",
});

/// Camera effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewConfig {
    pub fov: f32,
    pub bob: f32,
    pub bob_cycle: f32,
    pub bob_up: f32,
    pub roll_angle: f32,
    pub roll_speed: f32,
    pub kick_time: f32,
    pub kick_roll: f32,
    pub kick_pitch: f32,
    pub idle_scale: f32,
    pub iyaw_cycle: f32,
    pub iroll_cycle: f32,
    pub ipitch_cycle: f32,
    pub iyaw_level: f32,
    pub iroll_level: f32,
    pub ipitch_level: f32,
    pub chase_active: bool,
    pub chase_back: f32,
    pub chase_up: f32,
    pub chase_right: f32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            fov: 90.0,
            bob: 0.02,
            bob_cycle: 0.6,
            bob_up: 0.5,
            roll_angle: 2.0,
            roll_speed: 200.0,
            kick_time: 0.5,
            kick_roll: 0.6,
            kick_pitch: 0.6,
            idle_scale: 0.0,
            iyaw_cycle: 2.0,
            iroll_cycle: 0.5,
            ipitch_cycle: 1.0,
            iyaw_level: 0.3,
            iroll_level: 0.1,
            ipitch_level: 0.3,
            chase_active: false,
            chase_back: 100.0,
            chase_up: 16.0,
            chase_right: 0.0,
        }
    }
}

cvar_section!(ViewConfig {
    fov: f32 = "fov",
    bob: f32 = "cl_bob",
    bob_cycle: f32 = "cl_bobcycle",
    bob_up: f32 = "cl_bobup",
    roll_angle: f32 = "cl_rollangle",
    roll_speed: f32 = "cl_rollspeed",
    kick_time: f32 = "v_kicktime",
    kick_roll: f32 = "v_kickroll",
    kick_pitch: f32 = "v_kickpitch",
    idle_scale: f32 = "v_idlescale",
    iyaw_cycle: f32 = "v_iyaw_cycle",
    iroll_cycle: f32 = "v_iroll_cycle",
    ipitch_cycle: f32 = "v_ipitch_cycle",
    iyaw_level: f32 = "v_iyaw_level",
    iroll_level: f32 = "v_iroll_level",
    ipitch_level: f32 = "v_ipitch_level",
    chase_active: bool = "chase_active",
    chase_back: f32 = "chase_back",
    chase_up: f32 = "chase_up",
    chase_right: f32 = "chase_right",
});

/// World renderer switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// Treat every leaf as visible.
    pub novis: bool,
    /// Keep collinear vertices that close T-junctions.
    pub keep_tjunctions: bool,
    pub dynamic_lights: bool,
    /// Ignore lightmaps and draw everything full bright.
    pub full_bright: bool,
    pub draw_entities: bool,
    /// Lightmap atlas pages.
    pub lightmap_pages: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            novis: false,
            keep_tjunctions: false,
            dynamic_lights: true,
            full_bright: false,
            draw_entities: true,
            lightmap_pages: 64.0,
        }
    }
}

cvar_section!(RenderConfig {
    novis: bool = "r_novis",
    keep_tjunctions: bool = "gl_keeptjunctions",
    dynamic_lights: bool = "r_dynamic",
    full_bright: bool = "r_fullbright",
    draw_entities: bool = "r_drawentities",
    lightmap_pages: f32 = "gl_lightmap_pages",
});

/// Movement speeds and mouse scaling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    pub forward_speed: f32,
    pub back_speed: f32,
    pub side_speed: f32,
    pub up_speed: f32,
    pub move_speed_key: f32,
    pub yaw_speed: f32,
    pub pitch_speed: f32,
    pub angle_speed_key: f32,
    pub sensitivity: f32,
    pub m_pitch: f32,
    pub m_yaw: f32,
    pub always_run: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            forward_speed: 200.0,
            back_speed: 200.0,
            side_speed: 350.0,
            up_speed: 200.0,
            move_speed_key: 2.0,
            yaw_speed: 140.0,
            pitch_speed: 150.0,
            angle_speed_key: 1.5,
            sensitivity: 3.0,
            m_pitch: 0.022,
            m_yaw: 0.022,
            always_run: false,
        }
    }
}

cvar_section!(InputConfig {
    forward_speed: f32 = "cl_forwardspeed",
    back_speed: f32 = "cl_backspeed",
    side_speed: f32 = "cl_sidespeed",
    up_speed: f32 = "cl_upspeed",
    move_speed_key: f32 = "cl_movespeedkey",
    yaw_speed: f32 = "cl_yawspeed",
    pitch_speed: f32 = "cl_pitchspeed",
    angle_speed_key: f32 = "cl_anglespeedkey",
    sensitivity: f32 = "sensitivity",
    m_pitch: f32 = "m_pitch",
    m_yaw: f32 = "m_yaw",
    always_run: bool = "cl_alwaysrun",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{ "server_addr": "10.0.0.2:26000", "tick_hz": 10, "view": { "bob": 0.0 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.game_dir, "id1");
        assert_eq!(cfg.view.bob, 0.0);
        assert_eq!(cfg.view.bob_cycle, 0.6);
        assert_eq!(cfg.net.timeout_secs, 30.0);
    }

    #[test]
    fn cvars_mirror_config() {
        let mut cfg = EngineConfig::default();
        let mut console = Console::new();
        cfg.register_cvars(&mut console);
        assert_eq!(console.value("cl_rollspeed"), 200.0);

        console.exec("chase_active 1").unwrap();
        console.exec("cl_bob 0.05").unwrap();
        console.exec("r_novis 1").unwrap();
        cfg.sync_from_console(&console);
        assert!(cfg.view.chase_active);
        assert_eq!(cfg.view.bob, 0.05);
        assert!(cfg.render.novis);
    }

    #[test]
    fn counters_sync_as_whole_numbers() {
        let mut cfg = EngineConfig::default();
        let mut console = Console::new();
        cfg.register_cvars(&mut console);
        assert_eq!(console.string("net_connectattempts"), Some("3"));

        console.exec("net_connectattempts 2.9").unwrap();
        console.exec("sv_maxclients -4").unwrap();
        cfg.sync_from_console(&console);
        assert_eq!(cfg.net.connect_attempts, 2);
        assert_eq!(cfg.net.max_clients, 0);
    }
}
