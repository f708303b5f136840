//! Server implementation.
//!
//! The server owns a level and a fixed number of client slots. Each tick
//! it:
//! - drains the socket, answering connect requests and feeding data
//!   packets to the owning client's [`NetChannel`]
//! - moves players by their latest movement command
//! - drops clients that went silent
//! - flushes queued reliable messages and sends every spawned client a
//!   datagram with the server time, its player state and entity updates
//!
//! Clients sign on in three stages. Each stage starts with a reliable
//! `svc_signonnum` and the client answers with a string command
//! (`prespawn`, `spawn`, `begin`).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use quake_shared::{
    bsp::{BspModel, CONTENTS_SOLID},
    config::EngineConfig,
    console::{parse_command_line, Console, CvarFlags, Dispatch},
    error::{CapacityError, ProtocolError},
    math::{angle_vectors, Vec3, YAW},
    net::{
        parse_packet, ControlPacket, Delivered, NetChannel, Packet, PacketSocket, SendError, NET_GAME_NAME,
        NET_MAX_PACKET, NET_PROTOCOL_VERSION,
    },
    protocol::{
        decode_client_messages, Buttons, ClientData, ClientMessage, EntityEffects, EntityUpdate, MessageWriter,
        ServerInfo, ServerMessage, SoundEvent, UserCmd, DEFAULT_SOUND_ATTENUATION, DEFAULT_SOUND_VOLUME,
        MAX_DATAGRAM, MAX_LIGHTSTYLES, MAX_MSGLEN, PROTOCOL_VERSION,
    },
    vfs::Vfs,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::level::Level;

/// Most player slots a level can have.
pub const MAX_SCOREBOARD: usize = 16;
/// Longest player name kept.
pub const MAX_NAME_LEN: usize = 15;
/// Player speed in units per second.
const MAX_SPEED: f32 = 320.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No level loaded, waiting for `map`.
    Idle,
    /// Level loaded; accepting clients and running ticks.
    Running,
}

/// How far a client has signed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignonStage {
    /// Serverinfo sent; waiting for `prespawn`.
    Prespawn,
    /// Baselines sent; waiting for `spawn`.
    Spawn,
    /// Player state sent; waiting for `begin`.
    Begin,
    /// In the game.
    Active,
}

/// Reliable server messages waiting for the channel, packed into
/// chunks that never split a message.
#[derive(Default)]
struct ReliableQueue {
    chunks: VecDeque<MessageWriter>,
}

impl ReliableQueue {
    fn push(&mut self, msg: &ServerMessage) {
        let mut w = MessageWriter::new();
        msg.encode(&mut w);
        match self.chunks.back_mut() {
            Some(last) if last.len() + w.len() <= MAX_MSGLEN => last.write_bytes(w.as_bytes()),
            _ => self.chunks.push_back(w),
        }
    }

    fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Hands the next chunk to `channel` once it is free.
    fn flush(&mut self, channel: &mut NetChannel, now: f64) -> Result<(), SendError> {
        if !channel.can_send_reliable() {
            return Ok(());
        }
        match self.chunks.pop_front() {
            Some(chunk) => channel.send_reliable(chunk.as_bytes(), now),
            None => Ok(()),
        }
    }
}

/// One connected player.
struct ServerClient {
    name: String,
    channel: NetChannel,
    stage: SignonStage,
    reliable: ReliableQueue,
    last_cmd: UserCmd,
    data: ClientData,
    /// Damage to report in the next datagram: armor, blood, source.
    damage: Option<(u8, u8, Vec3)>,
    /// Latency measured from echoed move times.
    ping: f64,
}

impl ServerClient {
    fn new(channel: NetChannel) -> Self {
        Self {
            name: "unconnected".to_string(),
            channel,
            stage: SignonStage::Prespawn,
            reliable: ReliableQueue::default(),
            last_cmd: UserCmd::default(),
            data: ClientData::default(),
            damage: None,
            ping: 0.0,
        }
    }
}

/// Game server.
pub struct GameServer {
    pub cfg: EngineConfig,
    pub console: Console,
    vfs: Arc<Vfs>,
    level: Option<Level>,
    clients: Vec<Option<ServerClient>>,
    /// Broadcast messages for every spawned client's next datagram.
    datagram: Vec<ServerMessage>,

    time: f64,
    tick: u64,
    state: ServerState,
    quit: bool,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    pub fn new(cfg: EngineConfig, vfs: Arc<Vfs>) -> Self {
        let mut console = Console::new();
        Self::register_cvars(&cfg, &mut console);
        Self {
            cfg,
            console,
            vfs,
            level: None,
            clients: Vec::new(),
            datagram: Vec::new(),
            time: 0.0,
            tick: 0,
            state: ServerState::Idle,
            quit: false,
            console_rx: None,
        }
    }

    fn register_cvars(cfg: &EngineConfig, console: &mut Console) {
        cfg.net.register_cvars(console);
        console.register_cvar("hostname", "UNNAMED", "Server name shown to players", CvarFlags::SERVER);
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn level(&self) -> Option<&Level> {
        self.level.as_ref()
    }

    pub fn level_mut(&mut self) -> Option<&mut Level> {
        self.level.as_mut()
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    /// Number of occupied slots.
    pub fn client_count(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    pub fn client_stage(&self, slot: usize) -> Option<SignonStage> {
        self.client(slot).map(|c| c.stage)
    }

    pub fn client_name(&self, slot: usize) -> Option<&str> {
        self.client(slot).map(|c| c.name.as_str())
    }

    fn client(&self, slot: usize) -> Option<&ServerClient> {
        self.clients.get(slot).and_then(Option::as_ref)
    }

    fn client_mut(&mut self, slot: usize) -> Option<&mut ServerClient> {
        self.clients.get_mut(slot).and_then(Option::as_mut)
    }

    fn slot_of(&self, addr: SocketAddr) -> Option<usize> {
        self.clients
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.channel.remote() == addr))
    }

    fn hostname(&self) -> String {
        self.console.string("hostname").unwrap_or("UNNAMED").to_string()
    }

    /// Loads `maps/<name>.bsp` and starts it.
    pub fn load_map(&mut self, name: &str) -> anyhow::Result<()> {
        let path = format!("maps/{name}.bsp");
        let data = self.vfs.open_read(&path)?;
        let world = BspModel::load(&path, &data)?;
        self.spawn_level(name, world)?;
        Ok(())
    }

    /// Starts a level on `world`. Connected clients sign on again.
    pub fn spawn_level(&mut self, name: &str, world: BspModel) -> Result<(), CapacityError> {
        self.cfg.net.sync_from_console(&self.console);
        let max_clients = (self.cfg.net.max_clients.max(1) as usize).min(MAX_SCOREBOARD);
        let level = Level::new(name, world, max_clients)?;

        let previous = std::mem::take(&mut self.clients);
        self.clients = (0..max_clients).map(|_| None).collect();
        for (slot, client) in previous.into_iter().enumerate() {
            let Some(client) = client else { continue };
            match self.clients.get_mut(slot) {
                Some(s) => *s = Some(client),
                None => warn!(slot, name = %client.name, "slot removed by level change"),
            }
        }

        self.level = Some(level);
        self.datagram.clear();
        self.state = ServerState::Running;
        for slot in 0..self.clients.len() {
            self.send_serverinfo(slot);
        }
        info!(map = name, max_clients, "level started");
        Ok(())
    }

    /// Queues serverinfo and the first signon stage for `slot`.
    fn send_serverinfo(&mut self, slot: usize) {
        let hostname = self.hostname();
        let Some(level) = self.level.as_ref() else {
            return;
        };
        let Some(client) = self.clients.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };
        client.reliable.clear();
        client.stage = SignonStage::Prespawn;
        client.damage = None;
        client.reliable.push(&ServerMessage::Print(format!("Welcome to {hostname}\n")));
        client.reliable.push(&ServerMessage::ServerInfo(ServerInfo {
            protocol: PROTOCOL_VERSION,
            max_clients: level.max_clients() as u8,
            game_type: 0,
            level_name: level.title().to_string(),
            models: level.models.clone(),
            sounds: level.sounds.clone(),
        }));
        client
            .reliable
            .push(&ServerMessage::SetView(Level::player_edict(slot) as u16));
        client.reliable.push(&ServerMessage::SignonNum(1));
    }

    /// Executes one fixed simulation step.
    pub fn step(&mut self, socket: &dyn PacketSocket, dt: f64) -> anyhow::Result<()> {
        self.process_console_commands(socket);
        self.time += dt;
        self.read_packets(socket)?;
        if self.state == ServerState::Running {
            self.physics(dt as f32);
        }
        self.check_timeouts(socket);
        self.send_messages(socket);
        self.tick += 1;
        Ok(())
    }

    fn process_console_commands(&mut self, socket: &dyn PacketSocket) {
        let mut lines = Vec::new();
        if let Some(rx) = self.console_rx.as_mut() {
            while let Ok(line) = rx.try_recv() {
                lines.push(line);
            }
        }
        for line in lines {
            match self.exec_console(socket, &line) {
                Ok(out) => out.iter().for_each(|l| println!("{l}")),
                Err(e) => println!("{e:#}"),
            }
        }
    }

    /// Executes a console command and returns what it printed.
    pub fn exec_console(&mut self, socket: &dyn PacketSocket, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens = parse_command_line(line.trim());
        let Some(cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        match cmd.as_str() {
            "map" => {
                let Some(name) = tokens.get(1) else {
                    return Ok(vec!["Usage: map <mapname>".to_string()]);
                };
                match self.load_map(name) {
                    Ok(()) => Ok(vec![format!("Map '{name}' loaded")]),
                    Err(e) => Ok(vec![format!("Failed to load map: {e:#}")]),
                }
            }
            "status" => Ok(self.status()),
            "kick" => {
                let who = tokens.get(1).context("Usage: kick <name | #slot>")?;
                let slot = match who.strip_prefix('#') {
                    Some(n) => n.parse::<usize>().ok().and_then(|n| n.checked_sub(1)),
                    None => (0..self.clients.len()).find(|&s| self.client_name(s) == Some(who.as_str())),
                };
                match slot.filter(|&s| self.client(s).is_some()) {
                    Some(s) => {
                        self.drop_client(socket, s, "kicked", true);
                        Ok(vec![format!("Kicked {who}")])
                    }
                    None => Ok(vec![format!("No player {who}")]),
                }
            }
            "say" => {
                let text = tokens[1..].join(" ");
                self.broadcast_print(&format!("console: {text}\n"));
                Ok(Vec::new())
            }
            "lightstyle" => {
                let (Some(style), Some(pattern)) = (tokens.get(1), tokens.get(2)) else {
                    return Ok(vec!["Usage: lightstyle <style> <pattern>".to_string()]);
                };
                let style: usize = style.parse().with_context(|| format!("bad style {style}"))?;
                self.set_light_style(style, pattern)?;
                Ok(Vec::new())
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.quit = true;
                Ok(Vec::new())
            }
            _ => match self.console.exec(line)? {
                Dispatch::Done(out) => Ok(out),
                Dispatch::Unhandled(tokens) => Ok(vec![format!("Unknown command \"{}\"", tokens[0])]),
            },
        }
    }

    fn status(&self) -> Vec<String> {
        let mut out = vec![
            format!("host:    {}", self.hostname()),
            format!("state:   {:?}", self.state),
            format!("tick:    {}", self.tick),
        ];
        if let Some(level) = &self.level {
            out.push(format!("map:     {}", level.name));
        }
        out.push(format!("players: {} active", self.client_count()));
        for (slot, c) in self.clients.iter().enumerate() {
            if let Some(c) = c {
                out.push(format!(
                    "#{:<2} {:<16} {:>4}ms {:?} {}",
                    slot + 1,
                    c.name,
                    (c.ping * 1000.0) as i32,
                    c.stage,
                    c.channel.remote()
                ));
            }
        }
        out
    }

    fn read_packets(&mut self, socket: &dyn PacketSocket) -> anyhow::Result<()> {
        let mut buf = [0u8; NET_MAX_PACKET];
        while let Some((n, from)) = socket.try_recv_from(&mut buf).context("server recv")? {
            let data = &buf[..n];
            match parse_packet(data) {
                Ok(Packet::Control(ctl)) => self.handle_control(socket, from, ctl),
                Ok(Packet::Data { .. }) => {
                    let Some(slot) = self.slot_of(from) else {
                        trace!(%from, "data from unknown address");
                        continue;
                    };
                    match self.handle_data(slot, data) {
                        Ok(true) => {}
                        Ok(false) => self.drop_client(socket, slot, "left the game", false),
                        Err(e) => {
                            warn!(slot, %from, error = %e, "bad client packet");
                            self.drop_client(socket, slot, &e.to_string(), true);
                        }
                    }
                }
                Err(e) => debug!(%from, error = %e, "bad packet"),
            }
        }
        Ok(())
    }

    fn handle_control(&mut self, socket: &dyn PacketSocket, from: SocketAddr, ctl: ControlPacket) {
        let (game, version) = match ctl {
            ControlPacket::Connect { game, version } => (game, version),
            other => {
                trace!(%from, ?other, "ignored control packet");
                return;
            }
        };
        let reject = |reason: &str| {
            info!(%from, reason, "connection rejected");
            let packet = ControlPacket::Reject {
                reason: reason.to_string(),
            }
            .encode();
            if let Err(e) = socket.try_send_to(&packet, from) {
                debug!(%from, error = %e, "reject not sent");
            }
        };
        if game != NET_GAME_NAME || version != NET_PROTOCOL_VERSION {
            return reject("Incompatible version.\n");
        }
        if self.level.is_none() {
            return reject("No level running.\n");
        }

        if let Some(slot) = self.slot_of(from) {
            let fresh = self
                .client(slot)
                .is_some_and(|c| c.channel.stats().packets_received == 0);
            if fresh {
                // The accept got lost; the client is still asking.
                self.send_accept(socket, from, slot);
                return;
            }
            self.drop_client(socket, slot, "reconnected", false);
        }

        let Some(slot) = self.clients.iter().position(Option::is_none) else {
            return reject("Server is full.\n");
        };
        let channel = NetChannel::new(from, self.time).with_timeout(f64::from(self.cfg.net.timeout_secs));
        self.clients[slot] = Some(ServerClient::new(channel));
        info!(%from, slot, "client connected");
        self.send_accept(socket, from, slot);
        self.send_serverinfo(slot);
    }

    fn send_accept(&self, socket: &dyn PacketSocket, to: SocketAddr, slot: usize) {
        let packet = ControlPacket::Accept { slot: slot as u32 }.encode();
        if let Err(e) = socket.try_send_to(&packet, to) {
            warn!(%to, error = %e, "accept not sent");
        }
    }

    /// Returns false when the client asked to leave.
    fn handle_data(&mut self, slot: usize, data: &[u8]) -> Result<bool, ProtocolError> {
        let now = self.time;
        let Some(client) = self.client_mut(slot) else {
            return Ok(true);
        };
        let mut messages = Vec::new();
        for delivered in client.channel.process_packet(now, data)? {
            let (Delivered::Reliable(payload) | Delivered::Unreliable(payload)) = delivered;
            messages.extend(decode_client_messages(&payload)?);
        }
        for msg in messages {
            match msg {
                ClientMessage::Nop => {}
                ClientMessage::Disconnect => return Ok(false),
                ClientMessage::Move { time, cmd } => self.client_move(slot, time, cmd),
                ClientMessage::StringCmd(text) => self.client_command(slot, &text),
            }
        }
        Ok(true)
    }

    fn client_move(&mut self, slot: usize, time: f32, cmd: UserCmd) {
        let now = self.time;
        let Some(client) = self.client_mut(slot) else {
            return;
        };
        if client.stage != SignonStage::Active {
            return;
        }
        client.ping = (now - f64::from(time)).max(0.0);
        client.last_cmd = cmd;
    }

    fn client_command(&mut self, slot: usize, text: &str) {
        let tokens = parse_command_line(text);
        let Some(cmd) = tokens.first() else {
            return;
        };
        debug!(slot, command = %text, "client command");
        let Some(level) = self.level.as_mut() else {
            return;
        };
        let Some(client) = self.clients.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };

        let mut announce = None;
        match (cmd.as_str(), client.stage) {
            ("prespawn", SignonStage::Prespawn) => {
                for (num, e) in level.edicts.iter().enumerate() {
                    if num <= level.max_clients() || e.baseline.model != 0 {
                        client.reliable.push(&ServerMessage::SpawnBaseline {
                            entity: num as u16,
                            baseline: e.baseline,
                        });
                    }
                }
                client.reliable.push(&ServerMessage::SignonNum(2));
                client.stage = SignonStage::Spawn;
            }
            ("spawn", SignonStage::Spawn) => {
                let (origin, angles) = level.spawn_point(slot);
                let player = &mut level.edicts[Level::player_edict(slot)];
                player.free = false;
                player.reset_state();
                player.state.origin = origin;
                player.state.angles = angles;
                client.data = ClientData::default();

                for (style, pattern) in level.light_styles.iter().enumerate() {
                    if !pattern.is_empty() {
                        client.reliable.push(&ServerMessage::LightStyle {
                            style: style as u8,
                            pattern: pattern.clone(),
                        });
                    }
                }
                client.reliable.push(&ServerMessage::ClientData(client.data));
                client.reliable.push(&ServerMessage::SetAngle(angles));
                client.reliable.push(&ServerMessage::SignonNum(3));
                client.stage = SignonStage::Begin;
            }
            ("begin", SignonStage::Begin) => {
                client.stage = SignonStage::Active;
                info!(slot, name = %client.name, "client entered the game");
                announce = Some(format!("{} entered the game\n", client.name));
            }
            ("prespawn" | "spawn" | "begin", stage) => {
                warn!(slot, command = %cmd, ?stage, "signon command out of order");
            }
            ("name", _) => {
                let Some(name) = tokens.get(1) else {
                    return;
                };
                let name: String = name.chars().take(MAX_NAME_LEN).collect();
                if client.stage == SignonStage::Active && client.name != name {
                    announce = Some(format!("{} renamed to {}\n", client.name, name));
                }
                client.name = name;
            }
            ("say", _) => {
                announce = Some(format!("{}: {}\n", client.name, tokens[1..].join(" ")));
            }
            _ => {
                client
                    .reliable
                    .push(&ServerMessage::Print(format!("Unknown command \"{cmd}\"\n")));
            }
        }
        if let Some(text) = announce {
            self.broadcast_print(&text);
        }
    }

    fn physics(&mut self, dt: f32) {
        let Some(level) = self.level.as_mut() else {
            return;
        };
        let solid_world = !level.world.nodes.is_empty();
        for (slot, client) in self.clients.iter_mut().enumerate() {
            let Some(client) = client else { continue };
            if client.stage != SignonStage::Active {
                continue;
            }
            let cmd = client.last_cmd;
            let yaw = Vec3::new(0.0, cmd.view_angles[YAW], 0.0);
            let basis = angle_vectors(yaw);
            let mut velocity = basis.forward * cmd.forward_move + basis.right * cmd.side_move;
            velocity.z = cmd.up_move;
            if velocity.length() > MAX_SPEED {
                velocity = velocity.normalize() * MAX_SPEED;
            }

            let player = &mut level.edicts[Level::player_edict(slot)];
            let target = player.state.origin + velocity * dt;
            if !solid_world || level.world.point_contents(target) != CONTENTS_SOLID {
                player.state.origin = target;
            } else {
                velocity = Vec3::ZERO;
            }
            player.state.angles = yaw;
            player.state.effects.set(EntityEffects::MUZZLEFLASH, cmd.buttons.contains(Buttons::ATTACK));
            client.data.velocity = velocity;
        }
    }

    fn check_timeouts(&mut self, socket: &dyn PacketSocket) {
        let now = self.time;
        let timed_out: Vec<usize> = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.as_ref().is_some_and(|c| c.channel.is_timed_out(now)))
            .map(|(slot, _)| slot)
            .collect();
        for slot in timed_out {
            self.drop_client(socket, slot, "timed out", true);
        }
    }

    fn send_messages(&mut self, socket: &dyn PacketSocket) {
        let now = self.time;
        let mut failed = Vec::new();
        for (slot, client) in self.clients.iter_mut().enumerate() {
            let Some(client) = client else { continue };
            client.channel.poll(now);
            let mut result = client
                .reliable
                .flush(&mut client.channel, now)
                .map_err(|e| e.to_string());
            if client.stage == SignonStage::Active {
                if let Some(level) = self.level.as_ref() {
                    let datagram = build_datagram(level, slot, client, &self.datagram, now);
                    result = result.and_then(|()| {
                        client
                            .channel
                            .send_unreliable(datagram.as_bytes())
                            .map_err(|e| e.to_string())
                    });
                }
            }
            let result = result.and_then(|()| client.channel.transmit(socket).map_err(|e| e.to_string()));
            if let Err(reason) = result {
                warn!(slot, %reason, "send failed");
                failed.push(slot);
            }
        }
        self.datagram.clear();
        if let Some(level) = self.level.as_mut() {
            // Muzzle flashes last one frame.
            for e in &mut level.edicts {
                e.state.effects.remove(EntityEffects::MUZZLEFLASH);
            }
        }
        for slot in failed {
            self.drop_client(socket, slot, "send failed", false);
        }
    }

    /// Frees `slot`. With `notify`, the client is told it was dropped.
    fn drop_client(&mut self, socket: &dyn PacketSocket, slot: usize, reason: &str, notify: bool) {
        let Some(mut client) = self.clients.get_mut(slot).and_then(Option::take) else {
            return;
        };
        info!(slot, name = %client.name, reason, "client dropped");
        if notify {
            let mut w = MessageWriter::new();
            ServerMessage::Disconnect.encode(&mut w);
            let sent = client
                .channel
                .send_unreliable(w.as_bytes())
                .map_err(|e| e.to_string())
                .and_then(|()| client.channel.transmit(socket).map_err(|e| e.to_string()));
            if let Err(e) = sent {
                debug!(slot, error = %e, "disconnect not sent");
            }
        }
        if let Some(player) = self
            .level
            .as_mut()
            .and_then(|l| l.edicts.get_mut(Level::player_edict(slot)))
        {
            player.free = true;
        }
        if client.stage == SignonStage::Active {
            self.broadcast_print(&format!("{} left the game\n", client.name));
        }
    }

    /// Disconnects everyone.
    pub fn shutdown(&mut self, socket: &dyn PacketSocket) {
        for slot in 0..self.clients.len() {
            self.drop_client(socket, slot, "server shutdown", true);
        }
        self.state = ServerState::Idle;
    }

    /// Prints `text` on every client's console.
    pub fn broadcast_print(&mut self, text: &str) {
        let msg = ServerMessage::Print(text.to_string());
        for client in self.clients.iter_mut().flatten() {
            client.reliable.push(&msg);
        }
    }

    pub fn center_print(&mut self, slot: usize, text: &str) {
        if let Some(client) = self.client_mut(slot) {
            client.reliable.push(&ServerMessage::CenterPrint(text.to_string()));
        }
    }

    /// Changes a light style on the server and every client.
    pub fn set_light_style(&mut self, style: usize, pattern: &str) -> Result<(), CapacityError> {
        let level = self.level.as_mut().ok_or(CapacityError::Table {
            what: "light styles",
            max: 0,
        })?;
        let slot = level.light_styles.get_mut(style).ok_or(CapacityError::Table {
            what: "light styles",
            max: MAX_LIGHTSTYLES,
        })?;
        *slot = pattern.to_string();
        let msg = ServerMessage::LightStyle {
            style: style as u8,
            pattern: pattern.to_string(),
        };
        for client in self.clients.iter_mut().flatten() {
            if matches!(client.stage, SignonStage::Begin | SignonStage::Active) {
                client.reliable.push(&msg);
            }
        }
        Ok(())
    }

    /// Starts a precached sound on `entity`. Returns false for unknown
    /// samples.
    pub fn start_sound(&mut self, entity: u16, channel: u8, sample: &str, origin: Vec3) -> bool {
        let Some(sound) = self.level.as_ref().and_then(|l| l.sound_index(sample)) else {
            warn!(sample, "sound not precached");
            return false;
        };
        self.datagram.push(ServerMessage::Sound(SoundEvent {
            volume: DEFAULT_SOUND_VOLUME,
            attenuation: DEFAULT_SOUND_ATTENUATION,
            entity,
            channel,
            sound,
            origin,
        }));
        true
    }

    /// Hurts the player in `slot`; reported in its next datagram.
    pub fn damage(&mut self, slot: usize, armor: u8, blood: u8, from: Vec3) {
        if let Some(client) = self.client_mut(slot) {
            client.data.armor = client.data.armor.saturating_sub(armor);
            client.data.health -= i16::from(blood);
            let (a, b, _) = client.damage.unwrap_or((0, 0, from));
            client.damage = Some((a.saturating_add(armor), b.saturating_add(blood), from));
        }
    }
}

/// Builds one spawned client's per-tick datagram. Entity updates that do
/// not fit are left out until a later tick.
fn build_datagram(
    level: &Level,
    slot: usize,
    client: &mut ServerClient,
    broadcast: &[ServerMessage],
    now: f64,
) -> MessageWriter {
    let mut w = MessageWriter::new();
    ServerMessage::Time(now as f32).encode(&mut w);
    if let Some((armor, blood, from)) = client.damage.take() {
        ServerMessage::Damage { armor, blood, from }.encode(&mut w);
    }
    ServerMessage::ClientData(client.data).encode(&mut w);

    fn append(w: &mut MessageWriter, msg: &ServerMessage) -> bool {
        let mut tmp = MessageWriter::new();
        msg.encode(&mut tmp);
        if w.len() + tmp.len() > MAX_DATAGRAM {
            return false;
        }
        w.write_bytes(tmp.as_bytes());
        true
    }

    for msg in broadcast {
        if !append(&mut w, msg) {
            trace!(slot, "datagram full, broadcast dropped");
        }
    }

    let player = Level::player_edict(slot);
    let eye = level.edicts[player].state.origin + Vec3::new(0.0, 0.0, client.data.view_height);
    let pvs = level.pvs(eye);
    for (num, e) in level.edicts.iter().enumerate().skip(1) {
        if e.free || e.state.model == 0 || !level.is_visible(e, &pvs) {
            continue;
        }
        let update = ServerMessage::EntityUpdate(EntityUpdate::diff(num as u16, &e.baseline, &e.state));
        if !append(&mut w, &update) {
            trace!(slot, entity = num, "datagram full");
            break;
        }
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use quake_shared::bsp::parse_entity_lump;
    use quake_shared::net::{LoopbackNet, LoopbackSocket};
    use quake_shared::protocol::decode_server_messages;

    /// Minimal client side of a connection.
    struct Peer {
        socket: LoopbackSocket,
        channel: Option<NetChannel>,
        received: Vec<ServerMessage>,
        rejected: Option<String>,
    }

    impl Peer {
        fn new(net: &LoopbackNet) -> Self {
            Self {
                socket: net.bind(0),
                channel: None,
                received: Vec::new(),
                rejected: None,
            }
        }

        fn connect(&self, server: SocketAddr, version: u8) {
            let packet = ControlPacket::Connect {
                game: NET_GAME_NAME.into(),
                version,
            }
            .encode();
            self.socket.try_send_to(&packet, server).unwrap();
        }

        fn pump(&mut self, now: f64) {
            let mut buf = [0u8; NET_MAX_PACKET];
            while let Some((n, from)) = self.socket.try_recv_from(&mut buf).unwrap() {
                match parse_packet(&buf[..n]).unwrap() {
                    Packet::Control(ControlPacket::Accept { .. }) => {
                        self.channel = Some(NetChannel::new(from, now));
                    }
                    Packet::Control(ControlPacket::Reject { reason }) => self.rejected = Some(reason),
                    Packet::Control(_) => {}
                    Packet::Data { .. } => {
                        let channel = self.channel.as_mut().unwrap();
                        for d in channel.process_packet(now, &buf[..n]).unwrap() {
                            let (Delivered::Reliable(b) | Delivered::Unreliable(b)) = d;
                            self.received.extend(decode_server_messages(&b).unwrap());
                        }
                    }
                }
            }
            if let Some(c) = self.channel.as_mut() {
                c.transmit(&self.socket).unwrap();
            }
        }

        fn send(&mut self, msg: ClientMessage, now: f64) {
            let mut w = MessageWriter::new();
            msg.encode(&mut w);
            let channel = self.channel.as_mut().unwrap();
            channel.send_reliable(w.as_bytes(), now).unwrap();
            channel.transmit(&self.socket).unwrap();
        }

        fn command(&mut self, text: &str, now: f64) {
            self.send(ClientMessage::StringCmd(text.into()), now);
        }

        fn take(&mut self) -> Vec<ServerMessage> {
            std::mem::take(&mut self.received)
        }
    }

    fn world() -> BspModel {
        BspModel {
            name: "maps/test.bsp".into(),
            entities: parse_entity_lump(
                r#"{ "classname" "worldspawn" "message" "Test Hall" }
{ "classname" "info_player_start" "origin" "0 0 24" "angle" "180" }
{ "classname" "misc_explobox" "model" "maps/b_explob.bsp" "origin" "64 0 0" }"#,
            ),
            ..Default::default()
        }
    }

    fn server(max_clients: u32) -> (LoopbackNet, LoopbackSocket, GameServer) {
        let net = LoopbackNet::new();
        let socket = net.bind(26000);
        let mut cfg = EngineConfig::default();
        cfg.net.max_clients = max_clients;
        let mut sv = GameServer::new(cfg, Arc::new(Vfs::new()));
        sv.spawn_level("test", world()).unwrap();
        (net, socket, sv)
    }

    fn signon(
        peer: &mut Peer,
        sv: &mut GameServer,
        socket: &LoopbackSocket,
        now: &mut f64,
        replies: &[&str],
    ) -> Vec<ServerMessage> {
        let mut all = Vec::new();
        for reply in replies {
            peer.command(reply, *now);
            for _ in 0..3 {
                *now += 0.05;
                sv.step(socket, 0.05).unwrap();
                peer.pump(*now);
            }
            all.extend(peer.take());
        }
        all
    }

    #[test]
    fn rejects_wrong_version_and_full_server() {
        let (net, socket, mut sv) = server(1);
        let addr = socket.local_addr().unwrap();

        let mut old = Peer::new(&net);
        old.connect(addr, NET_PROTOCOL_VERSION + 1);
        sv.step(&socket, 0.05).unwrap();
        old.pump(0.05);
        assert_eq!(old.rejected.as_deref(), Some("Incompatible version.\n"));

        let mut first = Peer::new(&net);
        first.connect(addr, NET_PROTOCOL_VERSION);
        let mut second = Peer::new(&net);
        second.connect(addr, NET_PROTOCOL_VERSION);
        sv.step(&socket, 0.05).unwrap();
        first.pump(0.1);
        second.pump(0.1);
        assert!(first.channel.is_some());
        assert_eq!(second.rejected.as_deref(), Some("Server is full.\n"));
        assert_eq!(sv.client_count(), 1);
    }

    #[test]
    fn idle_server_rejects() {
        let net = LoopbackNet::new();
        let socket = net.bind(26000);
        let mut sv = GameServer::new(EngineConfig::default(), Arc::new(Vfs::new()));
        let mut peer = Peer::new(&net);
        peer.connect(socket.local_addr().unwrap(), NET_PROTOCOL_VERSION);
        sv.step(&socket, 0.05).unwrap();
        peer.pump(0.05);
        assert_eq!(peer.rejected.as_deref(), Some("No level running.\n"));
        assert_eq!(sv.state(), ServerState::Idle);
    }

    #[test]
    fn signon_stages_answer_client_commands() {
        let (net, socket, mut sv) = server(4);
        let mut peer = Peer::new(&net);
        peer.connect(socket.local_addr().unwrap(), NET_PROTOCOL_VERSION);
        let mut now = 0.05;
        sv.step(&socket, 0.05).unwrap();
        peer.pump(now);
        for _ in 0..2 {
            now += 0.05;
            sv.step(&socket, 0.05).unwrap();
            peer.pump(now);
        }

        let first = peer.take();
        assert!(matches!(&first[1], ServerMessage::ServerInfo(i) if i.level_name == "Test Hall" && i.max_clients == 4));
        assert_eq!(first[2], ServerMessage::SetView(1));
        assert_eq!(first.last(), Some(&ServerMessage::SignonNum(1)));
        assert_eq!(sv.client_stage(0), Some(SignonStage::Prespawn));

        let second = signon(&mut peer, &mut sv, &socket, &mut now, &["prespawn"]);
        let baselines = second
            .iter()
            .filter(|m| matches!(m, ServerMessage::SpawnBaseline { .. }))
            .count();
        // World, four player slots and the box.
        assert_eq!(baselines, 6);
        assert_eq!(second.last(), Some(&ServerMessage::SignonNum(2)));

        let third = signon(&mut peer, &mut sv, &socket, &mut now, &["name \"ranger\"", "spawn"]);
        assert!(third.contains(&ServerMessage::LightStyle {
            style: 0,
            pattern: "m".into()
        }));
        assert!(third.contains(&ServerMessage::SetAngle(Vec3::new(0.0, 180.0, 0.0))));
        assert_eq!(sv.client_stage(0), Some(SignonStage::Begin));
        assert_eq!(sv.client_name(0), Some("ranger"));

        let fourth = signon(&mut peer, &mut sv, &socket, &mut now, &["begin"]);
        assert_eq!(sv.client_stage(0), Some(SignonStage::Active));
        assert!(fourth.contains(&ServerMessage::Print("ranger entered the game\n".into())));
        assert!(fourth.iter().any(|m| matches!(m, ServerMessage::Time(_))));
        let player = fourth.iter().find_map(|m| match m {
            ServerMessage::EntityUpdate(u) if u.entity == 1 => Some(*u),
            _ => None,
        });
        assert_eq!(player.map(|u| u.origin[2]), Some(Some(24.0)));
    }

    #[test]
    fn out_of_order_signon_is_ignored() {
        let (net, socket, mut sv) = server(2);
        let mut peer = Peer::new(&net);
        peer.connect(socket.local_addr().unwrap(), NET_PROTOCOL_VERSION);
        sv.step(&socket, 0.05).unwrap();
        peer.pump(0.05);
        let mut now = 0.05;
        signon(&mut peer, &mut sv, &socket, &mut now, &["begin"]);
        assert_eq!(sv.client_stage(0), Some(SignonStage::Prespawn));
    }

    #[test]
    fn movement_and_timeout() {
        let (net, socket, mut sv) = server(2);
        let mut peer = Peer::new(&net);
        peer.connect(socket.local_addr().unwrap(), NET_PROTOCOL_VERSION);
        sv.step(&socket, 0.05).unwrap();
        peer.pump(0.05);
        let mut now = 0.05;
        signon(&mut peer, &mut sv, &socket, &mut now, &["prespawn", "spawn", "begin"]);
        assert_eq!(sv.client_stage(0), Some(SignonStage::Active));

        let cmd = UserCmd {
            view_angles: Vec3::new(0.0, 90.0, 0.0),
            forward_move: 200.0,
            ..Default::default()
        };
        let mut w = MessageWriter::new();
        ClientMessage::Move { time: sv.time() as f32, cmd }.encode(&mut w);
        let channel = peer.channel.as_mut().unwrap();
        channel.send_unreliable(w.as_bytes()).unwrap();
        channel.transmit(&peer.socket).unwrap();
        sv.step(&socket, 0.5).unwrap();

        let level = sv.level().unwrap();
        let origin = level.edicts[1].state.origin;
        assert!(origin.x.abs() < 0.01);
        assert!((origin.y - 100.0).abs() < 0.01);
        assert_eq!(origin.z, 24.0);

        sv.step(&socket, 31.0).unwrap();
        assert_eq!(sv.client_count(), 0);
        assert!(sv.level().unwrap().edicts[1].free);
        peer.pump(now + 31.0);
        assert!(peer.take().contains(&ServerMessage::Disconnect));
    }

    #[test]
    fn broadcasts_reach_spawned_clients() {
        let (net, socket, mut sv) = server(2);
        let mut peer = Peer::new(&net);
        peer.connect(socket.local_addr().unwrap(), NET_PROTOCOL_VERSION);
        sv.step(&socket, 0.05).unwrap();
        peer.pump(0.05);
        let mut now = 0.05;
        signon(&mut peer, &mut sv, &socket, &mut now, &["prespawn", "spawn", "begin"]);

        assert!(sv.start_sound(5, 1, "misc/talk.wav", Vec3::ZERO));
        assert!(!sv.start_sound(5, 1, "weapons/rocket.wav", Vec3::ZERO));
        sv.damage(0, 0, 10, Vec3::new(1.0, 0.0, 0.0));
        sv.set_light_style(32, "z").unwrap();
        let out = sv.exec_console(&socket, "say hello").unwrap();
        assert!(out.is_empty());

        for _ in 0..4 {
            now += 0.05;
            sv.step(&socket, 0.05).unwrap();
            peer.pump(now);
        }
        let msgs = peer.take();
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::Sound(s) if s.sound == 1 && s.entity == 5)));
        assert!(msgs.contains(&ServerMessage::Damage {
            armor: 0,
            blood: 10,
            from: Vec3::new(1.0, 0.0, 0.0)
        }));
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::ClientData(d) if d.health == 90)));
        assert!(msgs.contains(&ServerMessage::LightStyle {
            style: 32,
            pattern: "z".into()
        }));
        assert!(msgs.contains(&ServerMessage::Print("console: hello\n".into())));
    }

    #[test]
    fn console_commands() {
        let (net, socket, mut sv) = server(2);
        let mut peer = Peer::new(&net);
        peer.connect(socket.local_addr().unwrap(), NET_PROTOCOL_VERSION);
        sv.step(&socket, 0.05).unwrap();

        let status = sv.exec_console(&socket, "status").unwrap();
        assert!(status.iter().any(|l| l.starts_with("map:") && l.ends_with("test")));
        assert!(status.iter().any(|l| l.starts_with("#1")));

        assert_eq!(sv.exec_console(&socket, "hostname \"Frag Pit\"").unwrap(), Vec::<String>::new());
        assert_eq!(sv.exec_console(&socket, "kick #1").unwrap(), ["Kicked #1"]);
        assert_eq!(sv.client_count(), 0);
        assert_eq!(sv.exec_console(&socket, "kick nobody").unwrap(), ["No player nobody"]);
        assert_eq!(sv.exec_console(&socket, "fly").unwrap(), ["Unknown command \"fly\""]);
        assert!(sv.exec_console(&socket, "map e1m1").unwrap()[0].starts_with("Failed to load map"));

        sv.exec_console(&socket, "quit").unwrap();
        assert!(sv.quit_requested());
    }

    #[test]
    fn reliable_queue_packs_without_splitting() {
        let mut q = ReliableQueue::default();
        let long = ServerMessage::Print("x".repeat(5000));
        q.push(&long);
        q.push(&long);
        q.push(&ServerMessage::SignonNum(1));
        assert_eq!(q.chunks.len(), 2);
        assert_eq!(q.chunks[1].len(), 5002 + 2);
    }
}
