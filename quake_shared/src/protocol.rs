//! Wire protocol.
//!
//! Every message is a command byte followed by a command-specific payload,
//! read sequentially from a buffer. All multi-byte values are little-endian;
//! coordinates travel as `i16` eighths of a unit, angles as one byte of
//! `360/256` degrees, strings NUL-terminated.
//!
//! Entity updates use the high bit of the command byte as a signal: the
//! remaining seven bits (plus an optional second byte) say which fields
//! differ from the entity's baseline.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::math::Vec3;

/// Game protocol version announced in `svc_serverinfo`.
pub const PROTOCOL_VERSION: i32 = 15;

/// Largest reliable message.
pub const MAX_MSGLEN: usize = 8000;
/// Largest unreliable message.
pub const MAX_DATAGRAM: usize = 1024;

pub const MAX_EDICTS: usize = 600;
pub const MAX_LIGHTSTYLES: usize = 64;
pub const MAX_MODELS: usize = 256;
pub const MAX_SOUNDS: usize = 256;
pub const MAX_CL_STATS: usize = 32;

pub const DEFAULT_VIEWHEIGHT: f32 = 22.0;

/// Server → client command bytes.
pub mod svc {
    pub const BAD: u8 = 0;
    pub const NOP: u8 = 1;
    pub const DISCONNECT: u8 = 2;
    pub const UPDATESTAT: u8 = 3;
    pub const VERSION: u8 = 4;
    pub const SETVIEW: u8 = 5;
    pub const SOUND: u8 = 6;
    pub const TIME: u8 = 7;
    pub const PRINT: u8 = 8;
    pub const STUFFTEXT: u8 = 9;
    pub const SETANGLE: u8 = 10;
    pub const SERVERINFO: u8 = 11;
    pub const LIGHTSTYLE: u8 = 12;
    pub const CLIENTDATA: u8 = 15;
    pub const DAMAGE: u8 = 19;
    pub const SPAWNBASELINE: u8 = 22;
    pub const SETPAUSE: u8 = 24;
    pub const SIGNONNUM: u8 = 25;
    pub const CENTERPRINT: u8 = 26;
    /// High bit marks a fast entity update.
    pub const UPDATE_SIGNAL: u8 = 0x80;
}

/// Client → server command bytes.
pub mod clc {
    pub const BAD: u8 = 0;
    pub const NOP: u8 = 1;
    pub const DISCONNECT: u8 = 2;
    pub const MOVE: u8 = 3;
    pub const STRINGCMD: u8 = 4;
}

bitflags! {
    /// Fields present in a fast entity update.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateBits: u16 {
        const MOREBITS = 1 << 0;
        const ORIGIN1 = 1 << 1;
        const ORIGIN2 = 1 << 2;
        const ORIGIN3 = 1 << 3;
        const ANGLE2 = 1 << 4;
        const NOLERP = 1 << 5;
        const FRAME = 1 << 6;
        const SIGNAL = 1 << 7;
        const ANGLE1 = 1 << 8;
        const ANGLE3 = 1 << 9;
        const MODEL = 1 << 10;
        const COLORMAP = 1 << 11;
        const SKIN = 1 << 12;
        const EFFECTS = 1 << 13;
        const LONGENTITY = 1 << 14;
    }
}

bitflags! {
    /// Fields present in `svc_clientdata`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientDataBits: u16 {
        const VIEWHEIGHT = 1 << 0;
        const IDEALPITCH = 1 << 1;
        const PUNCH1 = 1 << 2;
        const PUNCH2 = 1 << 3;
        const PUNCH3 = 1 << 4;
        const VELOCITY1 = 1 << 5;
        const VELOCITY2 = 1 << 6;
        const VELOCITY3 = 1 << 7;
        const ITEMS = 1 << 9;
        const ONGROUND = 1 << 10;
        const INWATER = 1 << 11;
        const WEAPONFRAME = 1 << 12;
        const ARMOR = 1 << 13;
        const WEAPON = 1 << 14;
    }
}

bitflags! {
    /// Visual effects carried by entities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntityEffects: u8 {
        const BRIGHTFIELD = 1 << 0;
        const MUZZLEFLASH = 1 << 1;
        const BRIGHTLIGHT = 1 << 2;
        const DIMLIGHT = 1 << 3;
    }
}

bitflags! {
    /// Buttons in a movement command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u8 {
        const ATTACK = 1 << 0;
        const JUMP = 1 << 1;
    }
}

const SND_VOLUME: u8 = 1 << 0;
const SND_ATTENUATION: u8 = 1 << 1;
pub const DEFAULT_SOUND_VOLUME: u8 = 255;
pub const DEFAULT_SOUND_ATTENUATION: f32 = 1.0;

/// Growable outgoing message buffer.
#[derive(Debug, Clone, Default)]
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Takes the accumulated bytes, leaving the writer empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn write_byte(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_char(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_short(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn write_long(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_float(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn write_string(&mut self, s: &str) {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    pub fn write_coord(&mut self, f: f32) {
        self.write_short((f * 8.0) as i16);
    }

    pub fn write_angle(&mut self, f: f32) {
        self.write_byte((((f * 256.0 / 360.0) as i32) & 255) as u8);
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.put_slice(b);
    }
}

/// Sequential reader over a received message.
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    data: &'a [u8],
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn need(&self, n: usize, what: &'static str) -> Result<(), ProtocolError> {
        if self.data.remaining() < n {
            Err(ProtocolError::Truncated(what))
        } else {
            Ok(())
        }
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        self.need(1, "byte")?;
        Ok(self.data.get_u8())
    }

    pub fn read_char(&mut self) -> Result<i8, ProtocolError> {
        self.need(1, "char")?;
        Ok(self.data.get_i8())
    }

    pub fn read_short(&mut self) -> Result<i16, ProtocolError> {
        self.need(2, "short")?;
        Ok(self.data.get_i16_le())
    }

    pub fn read_long(&mut self) -> Result<i32, ProtocolError> {
        self.need(4, "long")?;
        Ok(self.data.get_i32_le())
    }

    pub fn read_float(&mut self) -> Result<f32, ProtocolError> {
        self.need(4, "float")?;
        Ok(self.data.get_f32_le())
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::Truncated("string"))?;
        let s = String::from_utf8_lossy(&self.data[..end]).into_owned();
        self.data.advance(end + 1);
        Ok(s)
    }

    pub fn read_coord(&mut self) -> Result<f32, ProtocolError> {
        Ok(self.read_short()? as f32 * (1.0 / 8.0))
    }

    pub fn read_angle(&mut self) -> Result<f32, ProtocolError> {
        Ok(self.read_char()? as f32 * (360.0 / 256.0))
    }

    fn read_vec3_coord(&mut self) -> Result<Vec3, ProtocolError> {
        Ok(Vec3::new(self.read_coord()?, self.read_coord()?, self.read_coord()?))
    }

    fn read_vec3_angle(&mut self) -> Result<Vec3, ProtocolError> {
        Ok(Vec3::new(self.read_angle()?, self.read_angle()?, self.read_angle()?))
    }
}

/// Default state of an entity slot, sent once during signon.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityBaseline {
    pub model: u8,
    pub frame: u8,
    pub colormap: u8,
    pub skin: u8,
    pub origin: Vec3,
    pub angles: Vec3,
}

/// Fully resolved entity state after applying an update to a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityState {
    pub model: u8,
    pub frame: u8,
    pub colormap: u8,
    pub skin: u8,
    pub effects: EntityEffects,
    pub origin: Vec3,
    pub angles: Vec3,
    pub nolerp: bool,
}

/// Delta of an entity against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityUpdate {
    pub entity: u16,
    pub model: Option<u8>,
    pub frame: Option<u8>,
    pub colormap: Option<u8>,
    pub skin: Option<u8>,
    pub effects: Option<EntityEffects>,
    pub origin: [Option<f32>; 3],
    pub angles: [Option<f32>; 3],
    pub nolerp: bool,
}

impl EntityUpdate {
    /// Builds the smallest update that turns `baseline` into `state`.
    pub fn diff(entity: u16, baseline: &EntityBaseline, state: &EntityState) -> Self {
        let pick = |a: u8, b: u8| (a != b).then_some(a);
        let mut u = EntityUpdate {
            entity,
            model: pick(state.model, baseline.model),
            frame: pick(state.frame, baseline.frame),
            colormap: pick(state.colormap, baseline.colormap),
            skin: pick(state.skin, baseline.skin),
            effects: (!state.effects.is_empty()).then_some(state.effects),
            nolerp: state.nolerp,
            ..Default::default()
        };
        for i in 0..3 {
            u.origin[i] = (state.origin[i] != baseline.origin[i]).then_some(state.origin[i]);
            u.angles[i] = (state.angles[i] != baseline.angles[i]).then_some(state.angles[i]);
        }
        u
    }

    /// Resolves the update against the slot's baseline.
    pub fn apply(&self, baseline: &EntityBaseline) -> EntityState {
        let mut s = EntityState {
            model: self.model.unwrap_or(baseline.model),
            frame: self.frame.unwrap_or(baseline.frame),
            colormap: self.colormap.unwrap_or(baseline.colormap),
            skin: self.skin.unwrap_or(baseline.skin),
            effects: self.effects.unwrap_or_default(),
            origin: baseline.origin,
            angles: baseline.angles,
            nolerp: self.nolerp,
        };
        for i in 0..3 {
            if let Some(v) = self.origin[i] {
                s.origin[i] = v;
            }
            if let Some(v) = self.angles[i] {
                s.angles[i] = v;
            }
        }
        s
    }

    fn bits(&self) -> UpdateBits {
        let mut bits = UpdateBits::SIGNAL;
        let mut set = |flag: UpdateBits, present: bool| {
            if present {
                bits |= flag;
            }
        };
        set(UpdateBits::MODEL, self.model.is_some());
        set(UpdateBits::FRAME, self.frame.is_some());
        set(UpdateBits::COLORMAP, self.colormap.is_some());
        set(UpdateBits::SKIN, self.skin.is_some());
        set(UpdateBits::EFFECTS, self.effects.is_some());
        set(UpdateBits::ORIGIN1, self.origin[0].is_some());
        set(UpdateBits::ORIGIN2, self.origin[1].is_some());
        set(UpdateBits::ORIGIN3, self.origin[2].is_some());
        set(UpdateBits::ANGLE1, self.angles[0].is_some());
        set(UpdateBits::ANGLE2, self.angles[1].is_some());
        set(UpdateBits::ANGLE3, self.angles[2].is_some());
        set(UpdateBits::NOLERP, self.nolerp);
        set(UpdateBits::LONGENTITY, self.entity > 255);
        if bits.bits() & 0xff00 != 0 {
            bits |= UpdateBits::MOREBITS;
        }
        bits
    }

    fn encode(&self, w: &mut MessageWriter) {
        let bits = self.bits();
        w.write_byte((bits.bits() & 0xff) as u8 | svc::UPDATE_SIGNAL);
        if bits.contains(UpdateBits::MOREBITS) {
            w.write_byte((bits.bits() >> 8) as u8);
        }
        if bits.contains(UpdateBits::LONGENTITY) {
            w.write_short(self.entity as i16);
        } else {
            w.write_byte(self.entity as u8);
        }
        for v in [self.model, self.frame, self.colormap, self.skin].into_iter().flatten() {
            w.write_byte(v);
        }
        if let Some(e) = self.effects {
            w.write_byte(e.bits());
        }
        for i in 0..3 {
            if let Some(o) = self.origin[i] {
                w.write_coord(o);
            }
            if let Some(a) = self.angles[i] {
                w.write_angle(a);
            }
        }
    }

    fn decode(cmd: u8, r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let mut raw = (cmd & 0x7f) as u16;
        if raw & UpdateBits::MOREBITS.bits() != 0 {
            raw |= (r.read_byte()? as u16) << 8;
        }
        let bits = UpdateBits::from_bits_truncate(raw);
        let entity = if bits.contains(UpdateBits::LONGENTITY) {
            r.read_short()? as u16
        } else {
            r.read_byte()? as u16
        };
        let mut opt = |flag: UpdateBits, r: &mut MessageReader| -> Result<Option<u8>, ProtocolError> {
            if bits.contains(flag) {
                Ok(Some(r.read_byte()?))
            } else {
                Ok(None)
            }
        };
        let mut u = EntityUpdate {
            entity,
            model: opt(UpdateBits::MODEL, r)?,
            frame: opt(UpdateBits::FRAME, r)?,
            colormap: opt(UpdateBits::COLORMAP, r)?,
            skin: opt(UpdateBits::SKIN, r)?,
            effects: opt(UpdateBits::EFFECTS, r)?.map(EntityEffects::from_bits_truncate),
            nolerp: bits.contains(UpdateBits::NOLERP),
            ..Default::default()
        };
        let axes = [
            (UpdateBits::ORIGIN1, UpdateBits::ANGLE1),
            (UpdateBits::ORIGIN2, UpdateBits::ANGLE2),
            (UpdateBits::ORIGIN3, UpdateBits::ANGLE3),
        ];
        for (i, (o, a)) in axes.into_iter().enumerate() {
            if bits.contains(o) {
                u.origin[i] = Some(r.read_coord()?);
            }
            if bits.contains(a) {
                u.angles[i] = Some(r.read_angle()?);
            }
        }
        Ok(u)
    }
}

/// Per-frame player state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientData {
    pub view_height: f32,
    pub ideal_pitch: f32,
    pub punch_angle: Vec3,
    pub velocity: Vec3,
    pub items: i32,
    pub on_ground: bool,
    pub in_water: bool,
    pub weapon_frame: u8,
    pub armor: u8,
    pub weapon: u8,
    pub health: i16,
    pub ammo: u8,
    pub ammo_counts: [u8; 4],
    pub active_weapon: u8,
}

impl Default for ClientData {
    fn default() -> Self {
        Self {
            view_height: DEFAULT_VIEWHEIGHT,
            ideal_pitch: 0.0,
            punch_angle: Vec3::ZERO,
            velocity: Vec3::ZERO,
            items: 0,
            on_ground: false,
            in_water: false,
            weapon_frame: 0,
            armor: 0,
            weapon: 0,
            health: 100,
            ammo: 0,
            ammo_counts: [0; 4],
            active_weapon: 0,
        }
    }
}

impl ClientData {
    fn encode(&self, w: &mut MessageWriter) {
        let mut bits = ClientDataBits::ITEMS;
        bits.set(ClientDataBits::VIEWHEIGHT, self.view_height != DEFAULT_VIEWHEIGHT);
        bits.set(ClientDataBits::IDEALPITCH, self.ideal_pitch != 0.0);
        for i in 0..3 {
            bits.set(
                ClientDataBits::from_bits_truncate(ClientDataBits::PUNCH1.bits() << i),
                self.punch_angle[i] != 0.0,
            );
            bits.set(
                ClientDataBits::from_bits_truncate(ClientDataBits::VELOCITY1.bits() << i),
                self.velocity[i] != 0.0,
            );
        }
        bits.set(ClientDataBits::ONGROUND, self.on_ground);
        bits.set(ClientDataBits::INWATER, self.in_water);
        bits.set(ClientDataBits::WEAPONFRAME, self.weapon_frame != 0);
        bits.set(ClientDataBits::ARMOR, self.armor != 0);
        bits.set(ClientDataBits::WEAPON, self.weapon != 0);

        w.write_short(bits.bits() as i16);
        if bits.contains(ClientDataBits::VIEWHEIGHT) {
            w.write_char(self.view_height as i8);
        }
        if bits.contains(ClientDataBits::IDEALPITCH) {
            w.write_char(self.ideal_pitch as i8);
        }
        for i in 0..3 {
            if self.punch_angle[i] != 0.0 {
                w.write_char(self.punch_angle[i] as i8);
            }
            if self.velocity[i] != 0.0 {
                w.write_char((self.velocity[i] / 16.0) as i8);
            }
        }
        w.write_long(self.items);
        if bits.contains(ClientDataBits::WEAPONFRAME) {
            w.write_byte(self.weapon_frame);
        }
        if bits.contains(ClientDataBits::ARMOR) {
            w.write_byte(self.armor);
        }
        if bits.contains(ClientDataBits::WEAPON) {
            w.write_byte(self.weapon);
        }
        w.write_short(self.health);
        w.write_byte(self.ammo);
        w.write_bytes(&self.ammo_counts);
        w.write_byte(self.active_weapon);
    }

    fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let bits = ClientDataBits::from_bits_truncate(r.read_short()? as u16);
        let mut cd = ClientData {
            view_height: if bits.contains(ClientDataBits::VIEWHEIGHT) {
                r.read_char()? as f32
            } else {
                DEFAULT_VIEWHEIGHT
            },
            ideal_pitch: if bits.contains(ClientDataBits::IDEALPITCH) {
                r.read_char()? as f32
            } else {
                0.0
            },
            ..Default::default()
        };
        for i in 0..3 {
            if bits.bits() & (ClientDataBits::PUNCH1.bits() << i) != 0 {
                cd.punch_angle[i] = r.read_char()? as f32;
            }
            if bits.bits() & (ClientDataBits::VELOCITY1.bits() << i) != 0 {
                cd.velocity[i] = r.read_char()? as f32 * 16.0;
            }
        }
        cd.items = r.read_long()?;
        cd.on_ground = bits.contains(ClientDataBits::ONGROUND);
        cd.in_water = bits.contains(ClientDataBits::INWATER);
        if bits.contains(ClientDataBits::WEAPONFRAME) {
            cd.weapon_frame = r.read_byte()?;
        }
        if bits.contains(ClientDataBits::ARMOR) {
            cd.armor = r.read_byte()?;
        }
        if bits.contains(ClientDataBits::WEAPON) {
            cd.weapon = r.read_byte()?;
        }
        cd.health = r.read_short()?;
        cd.ammo = r.read_byte()?;
        for c in &mut cd.ammo_counts {
            *c = r.read_byte()?;
        }
        cd.active_weapon = r.read_byte()?;
        Ok(cd)
    }
}

/// Level description sent at the start of signon.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerInfo {
    pub protocol: i32,
    pub max_clients: u8,
    pub game_type: u8,
    pub level_name: String,
    /// Model precache, starting at index 1; entry 0 is the world.
    pub models: Vec<String>,
    /// Sound precache, starting at index 1.
    pub sounds: Vec<String>,
}

/// Positional sound start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundEvent {
    pub volume: u8,
    pub attenuation: f32,
    pub entity: u16,
    pub channel: u8,
    pub sound: u8,
    pub origin: Vec3,
}

/// Decoded server → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Nop,
    Disconnect,
    UpdateStat { index: u8, value: i32 },
    Version(i32),
    SetView(u16),
    Sound(SoundEvent),
    Time(f32),
    Print(String),
    StuffText(String),
    SetAngle(Vec3),
    ServerInfo(ServerInfo),
    LightStyle { style: u8, pattern: String },
    ClientData(ClientData),
    Damage { armor: u8, blood: u8, from: Vec3 },
    SpawnBaseline { entity: u16, baseline: EntityBaseline },
    SetPause(bool),
    SignonNum(u8),
    CenterPrint(String),
    EntityUpdate(EntityUpdate),
}

impl ServerMessage {
    pub fn encode(&self, w: &mut MessageWriter) {
        match self {
            ServerMessage::Nop => w.write_byte(svc::NOP),
            ServerMessage::Disconnect => w.write_byte(svc::DISCONNECT),
            ServerMessage::UpdateStat { index, value } => {
                w.write_byte(svc::UPDATESTAT);
                w.write_byte(*index);
                w.write_long(*value);
            }
            ServerMessage::Version(v) => {
                w.write_byte(svc::VERSION);
                w.write_long(*v);
            }
            ServerMessage::SetView(e) => {
                w.write_byte(svc::SETVIEW);
                w.write_short(*e as i16);
            }
            ServerMessage::Sound(s) => {
                let mut mask = 0;
                if s.volume != DEFAULT_SOUND_VOLUME {
                    mask |= SND_VOLUME;
                }
                if s.attenuation != DEFAULT_SOUND_ATTENUATION {
                    mask |= SND_ATTENUATION;
                }
                w.write_byte(svc::SOUND);
                w.write_byte(mask);
                if mask & SND_VOLUME != 0 {
                    w.write_byte(s.volume);
                }
                if mask & SND_ATTENUATION != 0 {
                    w.write_byte((s.attenuation * 64.0) as u8);
                }
                w.write_short(((s.entity << 3) | (s.channel as u16 & 7)) as i16);
                w.write_byte(s.sound);
                for i in 0..3 {
                    w.write_coord(s.origin[i]);
                }
            }
            ServerMessage::Time(t) => {
                w.write_byte(svc::TIME);
                w.write_float(*t);
            }
            ServerMessage::Print(s) => {
                w.write_byte(svc::PRINT);
                w.write_string(s);
            }
            ServerMessage::StuffText(s) => {
                w.write_byte(svc::STUFFTEXT);
                w.write_string(s);
            }
            ServerMessage::SetAngle(a) => {
                w.write_byte(svc::SETANGLE);
                for i in 0..3 {
                    w.write_angle(a[i]);
                }
            }
            ServerMessage::ServerInfo(info) => {
                w.write_byte(svc::SERVERINFO);
                w.write_long(info.protocol);
                w.write_byte(info.max_clients);
                w.write_byte(info.game_type);
                w.write_string(&info.level_name);
                for m in &info.models {
                    w.write_string(m);
                }
                w.write_string("");
                for s in &info.sounds {
                    w.write_string(s);
                }
                w.write_string("");
            }
            ServerMessage::LightStyle { style, pattern } => {
                w.write_byte(svc::LIGHTSTYLE);
                w.write_byte(*style);
                w.write_string(pattern);
            }
            ServerMessage::ClientData(cd) => {
                w.write_byte(svc::CLIENTDATA);
                cd.encode(w);
            }
            ServerMessage::Damage { armor, blood, from } => {
                w.write_byte(svc::DAMAGE);
                w.write_byte(*armor);
                w.write_byte(*blood);
                for i in 0..3 {
                    w.write_coord(from[i]);
                }
            }
            ServerMessage::SpawnBaseline { entity, baseline } => {
                w.write_byte(svc::SPAWNBASELINE);
                w.write_short(*entity as i16);
                w.write_byte(baseline.model);
                w.write_byte(baseline.frame);
                w.write_byte(baseline.colormap);
                w.write_byte(baseline.skin);
                for i in 0..3 {
                    w.write_coord(baseline.origin[i]);
                    w.write_angle(baseline.angles[i]);
                }
            }
            ServerMessage::SetPause(p) => {
                w.write_byte(svc::SETPAUSE);
                w.write_byte(u8::from(*p));
            }
            ServerMessage::SignonNum(n) => {
                w.write_byte(svc::SIGNONNUM);
                w.write_byte(*n);
            }
            ServerMessage::CenterPrint(s) => {
                w.write_byte(svc::CENTERPRINT);
                w.write_string(s);
            }
            ServerMessage::EntityUpdate(u) => u.encode(w),
        }
    }

    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let cmd = r.read_byte()?;
        if cmd & svc::UPDATE_SIGNAL != 0 {
            return Ok(ServerMessage::EntityUpdate(EntityUpdate::decode(cmd, r)?));
        }
        let msg = match cmd {
            svc::NOP => ServerMessage::Nop,
            svc::DISCONNECT => ServerMessage::Disconnect,
            svc::UPDATESTAT => ServerMessage::UpdateStat {
                index: r.read_byte()?,
                value: r.read_long()?,
            },
            svc::VERSION => ServerMessage::Version(r.read_long()?),
            svc::SETVIEW => ServerMessage::SetView(r.read_short()? as u16),
            svc::SOUND => {
                let mask = r.read_byte()?;
                let volume = if mask & SND_VOLUME != 0 {
                    r.read_byte()?
                } else {
                    DEFAULT_SOUND_VOLUME
                };
                let attenuation = if mask & SND_ATTENUATION != 0 {
                    r.read_byte()? as f32 / 64.0
                } else {
                    DEFAULT_SOUND_ATTENUATION
                };
                let channel = r.read_short()? as u16;
                let sound = r.read_byte()?;
                ServerMessage::Sound(SoundEvent {
                    volume,
                    attenuation,
                    entity: channel >> 3,
                    channel: (channel & 7) as u8,
                    sound,
                    origin: r.read_vec3_coord()?,
                })
            }
            svc::TIME => ServerMessage::Time(r.read_float()?),
            svc::PRINT => ServerMessage::Print(r.read_string()?),
            svc::STUFFTEXT => ServerMessage::StuffText(r.read_string()?),
            svc::SETANGLE => ServerMessage::SetAngle(r.read_vec3_angle()?),
            svc::SERVERINFO => {
                let protocol = r.read_long()?;
                let max_clients = r.read_byte()?;
                let game_type = r.read_byte()?;
                let level_name = r.read_string()?;
                let models = read_precache(r, MAX_MODELS)?;
                let sounds = read_precache(r, MAX_SOUNDS)?;
                ServerMessage::ServerInfo(ServerInfo {
                    protocol,
                    max_clients,
                    game_type,
                    level_name,
                    models,
                    sounds,
                })
            }
            svc::LIGHTSTYLE => ServerMessage::LightStyle {
                style: r.read_byte()?,
                pattern: r.read_string()?,
            },
            svc::CLIENTDATA => ServerMessage::ClientData(ClientData::decode(r)?),
            svc::DAMAGE => ServerMessage::Damage {
                armor: r.read_byte()?,
                blood: r.read_byte()?,
                from: r.read_vec3_coord()?,
            },
            svc::SPAWNBASELINE => {
                let entity = r.read_short()? as u16;
                let mut b = EntityBaseline {
                    model: r.read_byte()?,
                    frame: r.read_byte()?,
                    colormap: r.read_byte()?,
                    skin: r.read_byte()?,
                    ..Default::default()
                };
                for i in 0..3 {
                    b.origin[i] = r.read_coord()?;
                    b.angles[i] = r.read_angle()?;
                }
                ServerMessage::SpawnBaseline {
                    entity,
                    baseline: b,
                }
            }
            svc::SETPAUSE => ServerMessage::SetPause(r.read_byte()? != 0),
            svc::SIGNONNUM => ServerMessage::SignonNum(r.read_byte()?),
            svc::CENTERPRINT => ServerMessage::CenterPrint(r.read_string()?),
            other => return Err(ProtocolError::BadServerCommand(other)),
        };
        Ok(msg)
    }
}

fn read_precache(r: &mut MessageReader, max: usize) -> Result<Vec<String>, ProtocolError> {
    let mut names = Vec::new();
    loop {
        let name = r.read_string()?;
        if name.is_empty() {
            return Ok(names);
        }
        if names.len() + 1 >= max {
            return Err(ProtocolError::Other(format!("server sent too many precaches (max {max})")));
        }
        names.push(name);
    }
}

/// Decodes every message in a buffer, failing on the first illegible one.
pub fn decode_server_messages(data: &[u8]) -> Result<Vec<ServerMessage>, ProtocolError> {
    let mut r = MessageReader::new(data);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(ServerMessage::decode(&mut r)?);
    }
    Ok(out)
}

/// One tick of intended movement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UserCmd {
    pub view_angles: Vec3,
    pub forward_move: f32,
    pub side_move: f32,
    pub up_move: f32,
    pub buttons: Buttons,
    pub impulse: u8,
}

/// Decoded client → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Nop,
    Disconnect,
    /// `time` echoes the server time the command was built against.
    Move { time: f32, cmd: UserCmd },
    StringCmd(String),
}

impl ClientMessage {
    pub fn encode(&self, w: &mut MessageWriter) {
        match self {
            ClientMessage::Nop => w.write_byte(clc::NOP),
            ClientMessage::Disconnect => w.write_byte(clc::DISCONNECT),
            ClientMessage::Move { time, cmd } => {
                w.write_byte(clc::MOVE);
                w.write_float(*time);
                for i in 0..3 {
                    w.write_angle(cmd.view_angles[i]);
                }
                w.write_short(cmd.forward_move as i16);
                w.write_short(cmd.side_move as i16);
                w.write_short(cmd.up_move as i16);
                w.write_byte(cmd.buttons.bits());
                w.write_byte(cmd.impulse);
            }
            ClientMessage::StringCmd(s) => {
                w.write_byte(clc::STRINGCMD);
                w.write_string(s);
            }
        }
    }

    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        let cmd = r.read_byte()?;
        let msg = match cmd {
            clc::NOP => ClientMessage::Nop,
            clc::DISCONNECT => ClientMessage::Disconnect,
            clc::MOVE => {
                let time = r.read_float()?;
                let view_angles = r.read_vec3_angle()?;
                ClientMessage::Move {
                    time,
                    cmd: UserCmd {
                        view_angles,
                        forward_move: r.read_short()? as f32,
                        side_move: r.read_short()? as f32,
                        up_move: r.read_short()? as f32,
                        buttons: Buttons::from_bits_truncate(r.read_byte()?),
                        impulse: r.read_byte()?,
                    },
                }
            }
            clc::STRINGCMD => ClientMessage::StringCmd(r.read_string()?),
            other => return Err(ProtocolError::BadClientCommand(other)),
        };
        Ok(msg)
    }
}

pub fn decode_client_messages(data: &[u8]) -> Result<Vec<ClientMessage>, ProtocolError> {
    let mut r = MessageReader::new(data);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(ClientMessage::decode(&mut r)?);
    }
    Ok(out)
}
