//! Input handling.
//!
//! Raw key and mouse events come from the platform layer. Keys are turned
//! into console commands through the binding table; `+action` / `-action`
//! commands drive [`KeyButton`]s, and once per frame the buttons are sampled
//! into a movement command for the server.
//!
//! Up to two physical keys can hold the same button down; a third is
//! rejected.

use std::collections::{HashMap, HashSet};

use quake_shared::{
    config::InputConfig,
    math::{angle_mod, Vec3, PITCH, ROLL, YAW},
    protocol::{Buttons, UserCmd},
};
use tracing::{debug, warn};

pub type KeyCode = u16;

pub const K_TAB: KeyCode = 9;
pub const K_ENTER: KeyCode = 13;
pub const K_ESCAPE: KeyCode = 27;
pub const K_SPACE: KeyCode = 32;
pub const K_UPARROW: KeyCode = 128;
pub const K_DOWNARROW: KeyCode = 129;
pub const K_LEFTARROW: KeyCode = 130;
pub const K_RIGHTARROW: KeyCode = 131;
pub const K_ALT: KeyCode = 132;
pub const K_CTRL: KeyCode = 133;
pub const K_SHIFT: KeyCode = 134;
pub const K_MOUSE1: KeyCode = 200;
pub const K_MOUSE2: KeyCode = 201;
pub const K_MOUSE3: KeyCode = 202;

const NAMED_KEYS: &[(&str, KeyCode)] = &[
    ("TAB", K_TAB),
    ("ENTER", K_ENTER),
    ("ESCAPE", K_ESCAPE),
    ("SPACE", K_SPACE),
    ("UPARROW", K_UPARROW),
    ("DOWNARROW", K_DOWNARROW),
    ("LEFTARROW", K_LEFTARROW),
    ("RIGHTARROW", K_RIGHTARROW),
    ("ALT", K_ALT),
    ("CTRL", K_CTRL),
    ("SHIFT", K_SHIFT),
    ("MOUSE1", K_MOUSE1),
    ("MOUSE2", K_MOUSE2),
    ("MOUSE3", K_MOUSE3),
];

/// Parses a key name: a single printable character or a named key.
pub fn key_from_name(name: &str) -> Option<KeyCode> {
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_graphic() {
            return Some(c.to_ascii_lowercase() as KeyCode);
        }
    }
    NAMED_KEYS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|&(_, k)| k)
}

pub fn key_name(key: KeyCode) -> String {
    if let Some((n, _)) = NAMED_KEYS.iter().find(|&&(_, k)| k == key) {
        return n.to_string();
    }
    match u8::try_from(key) {
        Ok(b) if b.is_ascii_graphic() => (b as char).to_string(),
        _ => format!("<{key}>"),
    }
}

/// Platform input event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    KeyDown(KeyCode),
    KeyUp(KeyCode),
    MouseMove { dx: f32, dy: f32 },
}

const STATE_DOWN: u8 = 1;
const IMPULSE_DOWN: u8 = 2;
const IMPULSE_UP: u8 = 4;

/// A button that up to two keys can hold down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyButton {
    down: [Option<KeyCode>; 2],
    state: u8,
}

impl KeyButton {
    /// `key` is `None` when the command was typed rather than bound.
    pub fn key_down(&mut self, key: Option<KeyCode>) {
        if let Some(k) = key {
            if self.down.contains(&Some(k)) {
                return;
            }
            if self.down[0].is_none() {
                self.down[0] = Some(k);
            } else if self.down[1].is_none() {
                self.down[1] = Some(k);
            } else {
                warn!(key = %key_name(k), "three keys down for a button");
                return;
            }
        }
        if self.state & STATE_DOWN != 0 {
            return;
        }
        self.state |= STATE_DOWN | IMPULSE_DOWN;
    }

    pub fn key_up(&mut self, key: Option<KeyCode>) {
        let Some(k) = key else {
            // Typed release clears everything.
            self.down = [None, None];
            self.state = IMPULSE_UP;
            return;
        };
        if self.down[0] == Some(k) {
            self.down[0] = None;
        } else if self.down[1] == Some(k) {
            self.down[1] = None;
        } else {
            return;
        }
        if self.down.iter().any(Option::is_some) {
            return;
        }
        if self.state & STATE_DOWN == 0 {
            return;
        }
        self.state &= !STATE_DOWN;
        self.state |= IMPULSE_UP;
    }

    pub fn is_down(&self) -> bool {
        self.state & STATE_DOWN != 0
    }

    /// Pressed or held at any point since the last sample.
    pub fn was_active(&self) -> bool {
        self.state & (STATE_DOWN | IMPULSE_DOWN) != 0
    }

    fn clear_impulse_down(&mut self) {
        self.state &= !IMPULSE_DOWN;
    }

    /// Fraction of the frame the button was held, clearing edge impulses.
    ///
    /// 0.25 for a tap inside one frame, 0.5 for a press, 0.75 for a
    /// release-and-press, 1.0 while held.
    pub fn key_state(&mut self) -> f32 {
        let impulse_down = self.state & IMPULSE_DOWN != 0;
        let impulse_up = self.state & IMPULSE_UP != 0;
        let down = self.is_down();
        let val = match (impulse_down, impulse_up) {
            (true, false) if down => 0.5,
            (false, false) if down => 1.0,
            (true, true) if down => 0.75,
            (true, true) => 0.25,
            _ => 0.0,
        };
        self.state &= STATE_DOWN;
        val
    }
}

/// Named buttons driven by `+name` / `-name` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Forward,
    Back,
    Left,
    Right,
    MoveLeft,
    MoveRight,
    MoveUp,
    MoveDown,
    LookUp,
    LookDown,
    Speed,
    Strafe,
    Attack,
    Jump,
    KeyLook,
    MouseLook,
    Use,
}

impl Action {
    pub const ALL: [Action; 17] = [
        Action::Forward,
        Action::Back,
        Action::Left,
        Action::Right,
        Action::MoveLeft,
        Action::MoveRight,
        Action::MoveUp,
        Action::MoveDown,
        Action::LookUp,
        Action::LookDown,
        Action::Speed,
        Action::Strafe,
        Action::Attack,
        Action::Jump,
        Action::KeyLook,
        Action::MouseLook,
        Action::Use,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Action::Forward => "forward",
            Action::Back => "back",
            Action::Left => "left",
            Action::Right => "right",
            Action::MoveLeft => "moveleft",
            Action::MoveRight => "moveright",
            Action::MoveUp => "moveup",
            Action::MoveDown => "movedown",
            Action::LookUp => "lookup",
            Action::LookDown => "lookdown",
            Action::Speed => "speed",
            Action::Strafe => "strafe",
            Action::Attack => "attack",
            Action::Jump => "jump",
            Action::KeyLook => "klook",
            Action::MouseLook => "mlook",
            Action::Use => "use",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }
}

/// Key bindings, button state and accumulated mouse motion.
#[derive(Debug, Default)]
pub struct InputSystem {
    bindings: HashMap<KeyCode, String>,
    held: HashSet<KeyCode>,
    buttons: HashMap<Action, KeyButton>,
    mouse: (f32, f32),
    impulse: u8,
}

impl InputSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard keyboard layout.
    pub fn with_default_bindings() -> Self {
        let mut input = Self::new();
        for (key, cmd) in [
            ("w", "+forward"),
            ("s", "+back"),
            ("a", "+moveleft"),
            ("d", "+moveright"),
            ("UPARROW", "+forward"),
            ("DOWNARROW", "+back"),
            ("LEFTARROW", "+left"),
            ("RIGHTARROW", "+right"),
            ("SPACE", "+jump"),
            ("MOUSE1", "+attack"),
            ("SHIFT", "+speed"),
            ("ALT", "+strafe"),
            ("c", "+movedown"),
        ] {
            if let Some(k) = key_from_name(key) {
                input.bind(k, cmd);
            }
        }
        input
    }

    pub fn bind(&mut self, key: KeyCode, command: &str) {
        self.bindings.insert(key, command.to_string());
    }

    pub fn unbind(&mut self, key: KeyCode) {
        self.bindings.remove(&key);
    }

    pub fn binding(&self, key: KeyCode) -> Option<&str> {
        self.bindings.get(&key).map(String::as_str)
    }

    /// `bind` lines for writing a config file, sorted by key.
    pub fn bindings_config(&self) -> Vec<String> {
        let mut lines: Vec<(KeyCode, String)> = self
            .bindings
            .iter()
            .map(|(k, c)| (*k, format!("bind \"{}\" \"{}\"", key_name(*k), c)))
            .collect();
        lines.sort();
        lines.into_iter().map(|(_, l)| l).collect()
    }

    /// Converts a platform event into console text to buffer.
    ///
    /// Auto-repeat key downs are dropped; `+` bindings get a matching `-`
    /// command on release with the key number appended.
    pub fn handle_event(&mut self, event: InputEvent) -> Option<String> {
        match event {
            InputEvent::KeyDown(k) => {
                if !self.held.insert(k) {
                    return None;
                }
                let cmd = self.bindings.get(&k)?;
                if cmd.starts_with('+') {
                    Some(format!("{cmd} {k}"))
                } else {
                    Some(cmd.clone())
                }
            }
            InputEvent::KeyUp(k) => {
                self.held.remove(&k);
                let cmd = self.bindings.get(&k)?;
                cmd.strip_prefix('+').map(|rest| format!("-{rest} {k}"))
            }
            InputEvent::MouseMove { dx, dy } => {
                self.mouse.0 += dx;
                self.mouse.1 += dy;
                None
            }
        }
    }

    /// Handles `+action`, `-action` and `impulse`; false for anything else.
    pub fn exec_command(&mut self, args: &[String]) -> bool {
        let Some(cmd) = args.first() else {
            return false;
        };
        if cmd == "impulse" {
            self.impulse = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            return true;
        }
        let (pressed, name) = if let Some(name) = cmd.strip_prefix('+') {
            (true, name)
        } else if let Some(name) = cmd.strip_prefix('-') {
            (false, name)
        } else {
            return false;
        };
        let Some(action) = Action::from_name(name) else {
            return false;
        };
        let key = args.get(1).and_then(|s| s.parse::<KeyCode>().ok());
        let button = self.buttons.entry(action).or_default();
        if pressed {
            button.key_down(key);
        } else {
            button.key_up(key);
        }
        true
    }

    pub fn button(&self, action: Action) -> KeyButton {
        self.buttons.get(&action).copied().unwrap_or_default()
    }

    fn state(&mut self, action: Action) -> f32 {
        self.buttons.entry(action).or_default().key_state()
    }

    fn is_down(&self, action: Action) -> bool {
        self.button(action).is_down()
    }

    /// Turns keyboard look buttons and mouse motion into view angle changes.
    pub fn adjust_angles(&mut self, frametime: f32, angles: &mut Vec3, cfg: &InputConfig) {
        let speed = if self.is_down(Action::Speed) {
            frametime * cfg.angle_speed_key
        } else {
            frametime
        };
        if !self.is_down(Action::Strafe) {
            angles[YAW] -= speed * cfg.yaw_speed * self.state(Action::Right);
            angles[YAW] += speed * cfg.yaw_speed * self.state(Action::Left);
            angles[YAW] = angle_mod(angles[YAW]);
        }
        if self.is_down(Action::KeyLook) {
            angles[PITCH] -= speed * cfg.pitch_speed * self.state(Action::Forward);
            angles[PITCH] += speed * cfg.pitch_speed * self.state(Action::Back);
        }
        let up = self.state(Action::LookUp);
        let down = self.state(Action::LookDown);
        angles[PITCH] -= speed * cfg.pitch_speed * up;
        angles[PITCH] += speed * cfg.pitch_speed * down;

        let (mx, my) = std::mem::take(&mut self.mouse);
        if !self.is_down(Action::Strafe) {
            angles[YAW] = angle_mod(angles[YAW] - cfg.m_yaw * cfg.sensitivity * mx);
        }
        angles[PITCH] += cfg.m_pitch * cfg.sensitivity * my;

        angles[PITCH] = angles[PITCH].clamp(-70.0, 80.0);
        angles[ROLL] = angles[ROLL].clamp(-50.0, 50.0);
    }

    /// Samples buttons into a movement command; call once per frame.
    pub fn build_cmd(&mut self, frametime: f32, angles: &mut Vec3, cfg: &InputConfig) -> UserCmd {
        self.adjust_angles(frametime, angles, cfg);

        let mut cmd = UserCmd {
            view_angles: *angles,
            ..Default::default()
        };
        if self.is_down(Action::Strafe) {
            cmd.side_move += cfg.side_speed * self.state(Action::Right);
            cmd.side_move -= cfg.side_speed * self.state(Action::Left);
        }
        cmd.side_move += cfg.side_speed * self.state(Action::MoveRight);
        cmd.side_move -= cfg.side_speed * self.state(Action::MoveLeft);
        cmd.up_move += cfg.up_speed * self.state(Action::MoveUp);
        cmd.up_move -= cfg.up_speed * self.state(Action::MoveDown);
        if !self.is_down(Action::KeyLook) {
            cmd.forward_move += cfg.forward_speed * self.state(Action::Forward);
            cmd.forward_move -= cfg.back_speed * self.state(Action::Back);
        }
        if self.is_down(Action::Speed) ^ cfg.always_run {
            cmd.forward_move *= cfg.move_speed_key;
            cmd.side_move *= cfg.move_speed_key;
            cmd.up_move *= cfg.move_speed_key;
        }

        for (action, bit) in [(Action::Attack, Buttons::ATTACK), (Action::Jump, Buttons::JUMP)] {
            let b = self.buttons.entry(action).or_default();
            if b.was_active() {
                cmd.buttons |= bit;
            }
            b.clear_impulse_down();
        }
        cmd.impulse = std::mem::take(&mut self.impulse);
        if cmd.impulse != 0 {
            debug!(impulse = cmd.impulse, "impulse sent");
        }
        cmd
    }

    /// Releases every button, e.g. when focus is lost.
    pub fn clear_states(&mut self) {
        self.buttons.clear();
        self.held.clear();
        self.mouse = (0.0, 0.0);
    }
}
