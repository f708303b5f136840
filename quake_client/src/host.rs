//! Engine host: owns every client subsystem and runs one frame at a time.
//!
//! Frame order:
//! 1. advance the simulation clock
//! 2. run buffered console commands
//! 3. pump the network and route client events
//! 4. build and send the movement command
//! 5. animate lights and interpolate entities
//! 6. compute the view, draw the world and overlays

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use quake_shared::{
    audio::{AudioBackend, SoundParams},
    bsp::BspModel,
    config::EngineConfig,
    console::{Console, Dispatch},
    error::{EngineError, LoadError, Severity},
    math::{angle_vectors, Vec3},
    model::Model,
    net::PacketSocket,
    protocol::ServerInfo,
    render::{ModelInstance, RefDef, RenderBackend},
    vfs::Vfs,
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::{
    client::{Client, ClientEvent, STAT_HEALTH},
    input::{key_from_name, InputEvent, InputSystem},
    lights::DynamicLights,
    overlay::{CenterPrint, NotifyLines, OverlayRegistry},
    render::{FrameStats, WorldRenderer},
    view::{damage_count, ViewInput, ViewPipeline},
};

/// Seconds a center print stays up.
pub const CENTER_PRINT_TIME: f32 = 2.0;
/// Seconds a console line stays in the notify area.
pub const NOTIFY_TIME: f32 = 3.0;
/// Bounding radius used for entities whose model is not loaded.
const DEFAULT_ENTITY_RADIUS: f32 = 16.0;

/// Engine time, passed explicitly to whatever needs it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimulationClock {
    realtime: f64,
    time: f64,
    frametime: f32,
    frames: u64,
}

impl SimulationClock {
    pub const MIN_FRAMETIME: f64 = 0.001;
    pub const MAX_FRAMETIME: f64 = 0.1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Advances by `real_dt` seconds of wall time. Game time moves by the
    /// clamped frame time.
    pub fn advance(&mut self, real_dt: f64) -> f32 {
        self.realtime += real_dt.max(0.0);
        let dt = real_dt.clamp(Self::MIN_FRAMETIME, Self::MAX_FRAMETIME);
        self.time += dt;
        self.frametime = dt as f32;
        self.frames += 1;
        self.frametime
    }

    /// Restarts level time; wall time keeps running.
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.frametime = 0.0;
        self.frames = 0;
    }

    pub fn realtime(&self) -> f64 {
        self.realtime
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn frametime(&self) -> f32 {
        self.frametime
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// The single engine instance.
pub struct EngineHost {
    pub config: EngineConfig,
    pub console: Console,
    pub client: Client,
    pub input: InputSystem,
    pub overlays: OverlayRegistry,
    vfs: Arc<Vfs>,
    socket: Box<dyn PacketSocket>,
    backend: Box<dyn RenderBackend>,
    audio: Box<dyn AudioBackend>,
    view: ViewPipeline,
    renderer: WorldRenderer,
    dlights: DynamicLights,
    world: Option<BspModel>,
    /// Loaded models by precache index; index 0 is unused.
    models: Vec<Option<Model>>,
    sounds: Vec<String>,
    clock: SimulationClock,
    /// Interpolation fraction of the current frame.
    lerp: f32,
    rng: StdRng,
    last_view: Option<RefDef>,
    last_stats: FrameStats,
    quit: bool,
}

impl EngineHost {
    pub fn new(
        config: EngineConfig,
        vfs: Arc<Vfs>,
        socket: Box<dyn PacketSocket>,
        backend: Box<dyn RenderBackend>,
        audio: Box<dyn AudioBackend>,
    ) -> Self {
        let mut console = Console::new();
        config.register_cvars(&mut console);
        let client = Client::new(&config.player_name, &config.net);
        let renderer = WorldRenderer::new(&config.render);
        Self {
            console,
            client,
            input: InputSystem::with_default_bindings(),
            overlays: OverlayRegistry::with_defaults(CENTER_PRINT_TIME, NOTIFY_TIME),
            vfs,
            socket,
            backend,
            audio,
            view: ViewPipeline::new(),
            renderer,
            dlights: DynamicLights::new(),
            world: None,
            models: Vec::new(),
            sounds: Vec::new(),
            clock: SimulationClock::new(),
            lerp: 1.0,
            rng: StdRng::from_entropy(),
            last_view: None,
            last_stats: FrameStats::default(),
            quit: false,
            config,
        }
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn world(&self) -> Option<&BspModel> {
        self.world.as_ref()
    }

    pub fn last_view(&self) -> Option<&RefDef> {
        self.last_view.as_ref()
    }

    pub fn last_stats(&self) -> FrameStats {
        self.last_stats
    }

    pub fn backend(&self) -> &dyn RenderBackend {
        self.backend.as_ref()
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    /// Feeds a platform input event through the key bindings.
    pub fn handle_input(&mut self, event: InputEvent) {
        if let Some(text) = self.input.handle_event(event) {
            self.console.add_text(&text);
        }
    }

    /// Window lost focus: release every held button.
    pub fn focus_lost(&mut self) {
        self.input.clear_states();
    }

    /// Runs one console line now.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<()> {
        match self.console.exec(line)? {
            Dispatch::Done(lines) => {
                for l in lines {
                    info!(target: "console", "{l}");
                }
            }
            Dispatch::Unhandled(tokens) => self.dispatch(&tokens)?,
        }
        Ok(())
    }

    /// Commands that act on engine state the console does not own.
    fn dispatch(&mut self, tokens: &[String]) -> anyhow::Result<()> {
        let Some(cmd) = tokens.first() else {
            return Ok(());
        };
        let now = self.clock.realtime();
        match cmd.as_str() {
            "connect" => {
                let target = tokens.get(1).map(String::as_str).unwrap_or("local");
                let target = if target == "local" {
                    self.config.server_addr.as_str()
                } else {
                    target
                };
                let addr: SocketAddr = target
                    .parse()
                    .with_context(|| format!("bad server address {target}"))?;
                self.client.connect(self.socket.as_ref(), addr, now)?;
            }
            "disconnect" => {
                self.client.disconnect(Some(self.socket.as_ref()), "user disconnect");
                self.end_level();
            }
            "quit" => self.quit = true,
            "bind" => {
                let (Some(key), Some(command)) = (tokens.get(1), tokens.get(2)) else {
                    anyhow::bail!("usage: bind <key> <command>");
                };
                let code = key_from_name(key).with_context(|| format!("unknown key {key}"))?;
                self.input.bind(code, command);
            }
            "unbind" => {
                let key = tokens.get(1).context("usage: unbind <key>")?;
                let code = key_from_name(key).with_context(|| format!("unknown key {key}"))?;
                self.input.unbind(code);
            }
            "name" => {
                let name = tokens.get(1).context("usage: name <name>")?;
                self.console.set_cvar("_cl_name", name)?;
                if self.client.channel().is_some() {
                    self.client.queue_string_cmd(&format!("name \"{name}\""));
                }
            }
            _ if self.input.exec_command(tokens) => {}
            _ if self.client.channel().is_some() => {
                // Anything else goes to the server (say, kill, god, ...).
                self.client.queue_string_cmd(&tokens.join(" "));
            }
            _ => warn!(command = %cmd, "unknown command"),
        }
        Ok(())
    }

    /// Runs one frame of `real_dt` seconds.
    ///
    /// Content and protocol errors end the connection and are reported on
    /// screen; capacity errors end it and are returned.
    pub fn frame(&mut self, real_dt: f64) -> Result<(), EngineError> {
        let frametime = self.clock.advance(real_dt);
        self.config.sync_from_console(&self.console);
        self.client.set_name(&self.config.player_name);
        self.client.set_net_config(&self.config.net);

        for tokens in self.console.execute_buffer() {
            if let Err(e) = self.dispatch(&tokens) {
                warn!(command = %tokens.join(" "), "{e:#}");
            }
        }

        let events = self.client.pump(self.socket.as_ref(), self.clock.realtime())?;
        self.route_events(events)?;

        if self.client.is_active() {
            let cmd = self
                .input
                .build_cmd(frametime, &mut self.client.view_angles, &self.config.input);
            let events = self.client.send_cmd(self.socket.as_ref(), &cmd);
            self.route_events(events)?;
        }

        self.simulate(frametime);
        self.draw(frametime);
        Ok(())
    }

    fn route_events(&mut self, events: Vec<ClientEvent>) -> Result<(), EngineError> {
        for event in events {
            if let Err(err) = self.handle_event(event) {
                self.client.disconnect(Some(self.socket.as_ref()), &err.to_string());
                self.end_level();
                self.report(&err);
                if err.severity() == Severity::Session {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: ClientEvent) -> Result<(), EngineError> {
        let time = self.clock.realtime();
        match event {
            ClientEvent::Connected { slot } => info!(slot, "connected"),
            ClientEvent::LevelChange(info) => self.load_level(&info)?,
            ClientEvent::Print(text) => {
                self.overlays.send_text(NotifyLines::NAME, &text, time);
            }
            ClientEvent::CenterPrint(text) => {
                self.overlays.send_text(CenterPrint::NAME, &text, time);
            }
            ClientEvent::StuffText(text) => self.console.add_text(&text),
            ClientEvent::Sound(s) => {
                let Some(name) = self.sounds.get(s.sound as usize) else {
                    debug!(sound = s.sound, "sound index out of range");
                    return Ok(());
                };
                let params = SoundParams {
                    entity: s.entity,
                    channel: s.channel,
                    origin: s.origin,
                    volume: f32::from(s.volume) / 255.0,
                    attenuation: s.attenuation,
                };
                self.audio.play(name, &params);
            }
            ClientEvent::Damage { armor, blood, from } => {
                let origin = self.player_origin();
                let angles = self.client.view_angles;
                self.view
                    .parse_damage(damage_count(armor, blood), from, origin, angles, &self.config.view);
            }
            ClientEvent::Active => info!("entered the game"),
            ClientEvent::Disconnected { reason } => {
                self.end_level();
                self.overlays
                    .send_text(NotifyLines::NAME, &format!("Disconnected: {reason}"), time);
            }
        }
        Ok(())
    }

    fn report(&mut self, err: &EngineError) {
        error!(error = %err, severity = ?err.severity(), "session error");
        let time = self.clock.realtime();
        self.overlays.send_text(NotifyLines::NAME, &err.to_string(), time);
    }

    /// Loads the world and precached models named by `info`.
    fn load_level(&mut self, info: &ServerInfo) -> Result<(), EngineError> {
        self.end_level();
        self.overlays.reset_all();
        self.clock.reset();
        let world_name = info.models.first().ok_or_else(|| LoadError::NotFound {
            name: "world model".into(),
        })?;
        info!(level = %info.level_name, map = %world_name, "loading level");

        let data = self.vfs.open_read(world_name)?;
        let mut world = BspModel::load(world_name, &data)?;

        self.models = Vec::with_capacity(info.models.len() + 1);
        self.models.push(None);
        self.models.push(None);
        for name in info.models.iter().skip(1) {
            // Inline brush models live inside the world.
            if name.starts_with('*') {
                self.models.push(None);
                continue;
            }
            let model = self
                .vfs
                .open_read(name)
                .and_then(|data| Model::load(name, &data));
            match model {
                Ok(m) => self.models.push(Some(m)),
                Err(e) => {
                    warn!(model = %name, error = %e, "model not loaded");
                    self.models.push(None);
                }
            }
        }
        self.sounds = std::iter::once(String::new())
            .chain(info.sounds.iter().cloned())
            .collect();

        self.renderer
            .load_world(&mut world, &self.client.light_styles, self.backend.as_mut(), &self.config.render)?;
        self.world = Some(world);
        Ok(())
    }

    /// Forgets everything tied to the current level.
    fn end_level(&mut self) {
        self.world = None;
        self.models.clear();
        self.sounds.clear();
        self.dlights.clear();
        self.last_view = None;
        self.audio.stop_all();
    }

    fn player_origin(&self) -> Vec3 {
        self.view_placement().0
    }

    /// Interpolated origin and angles of the view entity, matching where
    /// the entity itself is drawn this frame.
    fn view_placement(&self) -> (Vec3, Vec3) {
        self.client
            .entities
            .interpolate(self.client.view_entity as usize, self.lerp)
            .map(|t| (t.origin, t.angles))
            .unwrap_or_default()
    }

    fn simulate(&mut self, frametime: f32) {
        let frac = self.client.advance(f64::from(frametime));
        self.lerp = frac;
        let time = self.client.time();
        self.client.light_styles.animate(time);
        self.dlights.decay(time, frametime);

        let Some(world) = self.world.as_ref() else {
            return;
        };
        let view_entity = self.client.view_entity as usize;
        let chase = self.config.view.chase_active;
        let mut linked = Vec::new();
        for (slot, _) in self.client.entities.active() {
            let Some(t) = self.client.entities.interpolate(slot, frac) else {
                continue;
            };
            if !t.effects.is_empty() {
                self.dlights
                    .spawn_effect_lights(slot as i32, t.origin, t.angles, t.effects, time, &mut self.rng);
            }
            if t.model == 0 || (slot == view_entity && !chase) {
                continue;
            }
            let radius = self
                .models
                .get(t.model as usize)
                .and_then(Option::as_ref)
                .map(Model::radius)
                .unwrap_or(DEFAULT_ENTITY_RADIUS);
            let instance = ModelInstance {
                model: t.model as usize,
                origin: t.origin,
                angles: t.angles,
                frame: t.frame,
                skin: t.skin,
            };
            linked.push((slot, instance, radius));
        }
        self.renderer.link_entities(world, linked);
    }

    fn draw(&mut self, frametime: f32) {
        let time = self.client.time();
        self.backend.begin_frame();
        let (origin, entity_angles) = self.view_placement();
        if let (true, Some(world)) = (self.client.is_active(), self.world.as_mut()) {
            let input = ViewInput {
                time,
                frametime,
                origin,
                entity_angles,
                view_angles: self.client.view_angles,
                velocity: self.client.client_data.velocity,
                view_height: self.client.client_data.view_height,
                health: self.client.stats[STAT_HEALTH],
                aspect: 0.75,
                world: Some(&*world),
            };
            let view = self.view.calc_refdef(&input, &self.config.view);
            let basis = angle_vectors(view.angles);
            self.audio.set_listener(view.origin, &basis);
            self.last_stats = self.renderer.render_frame(
                world,
                &view,
                time,
                &self.client.light_styles,
                &self.dlights,
                self.backend.as_mut(),
                &self.config.render,
            );
            self.last_view = Some(view);
        }
        self.overlays.draw_all(self.backend.as_mut(), self.clock.realtime());
        self.backend.end_frame();
    }

    /// Disconnects cleanly; used on shutdown.
    pub fn shutdown(&mut self) {
        self.client.disconnect(Some(self.socket.as_ref()), "shutdown");
        self.end_level();
        info!(frames = self.clock.frames(), "host shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quake_shared::{audio::NullAudio, net::LoopbackNet, protocol::EntityState, render::NullRenderer};

    fn host() -> EngineHost {
        let net = LoopbackNet::new();
        EngineHost::new(
            EngineConfig::default(),
            Arc::new(Vfs::new()),
            Box::new(net.bind(0)),
            Box::new(NullRenderer::default()),
            Box::new(NullAudio),
        )
    }

    #[test]
    fn clock_clamps_and_resets() {
        let mut clock = SimulationClock::new();
        assert_eq!(clock.advance(0.5), 0.1);
        clock.advance(0.0);
        assert!((clock.time() - 0.101).abs() < 1e-9);
        assert_eq!(clock.realtime(), 0.5);
        clock.reset();
        assert_eq!((clock.time(), clock.frames()), (0.0, 0));
        assert_eq!(clock.realtime(), 0.5);
    }

    #[test]
    fn console_drives_input_and_bindings() {
        let mut h = host();
        h.exec("bind w +forward").unwrap();
        h.handle_input(InputEvent::KeyDown(b'w' as u16));
        h.frame(0.01).unwrap();
        assert!(h.input.button(crate::input::Action::Forward).is_down());
        h.handle_input(InputEvent::KeyUp(b'w' as u16));
        h.frame(0.01).unwrap();
        assert!(!h.input.button(crate::input::Action::Forward).is_down());

        h.exec("quit").unwrap();
        assert!(h.quit_requested());
        assert!(h.exec("bind").is_err());
    }

    #[test]
    fn camera_follows_the_interpolated_view_entity() {
        let mut h = host();
        h.client.view_entity = 1;
        let at = |x: f32| EntityState {
            origin: Vec3::new(x, 0.0, 0.0),
            angles: Vec3::new(0.0, x, 0.0),
            ..Default::default()
        };
        h.client.entities.store(1, at(0.0), 0.1).unwrap();
        h.client.entities.store(1, at(40.0), 0.2).unwrap();

        h.lerp = 0.25;
        assert_eq!(h.view_placement(), (Vec3::new(10.0, 0.0, 0.0), Vec3::new(0.0, 10.0, 0.0)));
        assert_eq!(h.player_origin(), Vec3::new(10.0, 0.0, 0.0));
        h.lerp = 1.0;
        assert_eq!(h.view_placement().0, Vec3::new(40.0, 0.0, 0.0));
    }

    #[test]
    fn missing_world_reports_and_disconnects() {
        let mut h = host();
        let info = ServerInfo {
            protocol: quake_shared::protocol::PROTOCOL_VERSION,
            max_clients: 1,
            game_type: 0,
            level_name: "nowhere".into(),
            models: vec!["maps/none.bsp".into()],
            sounds: vec![],
        };
        h.route_events(vec![ClientEvent::LevelChange(info)]).unwrap();
        assert!(h.world().is_none());
        assert!(h.overlays.is_visible(NotifyLines::NAME, h.clock().realtime()));
    }

    #[test]
    fn cvars_flow_into_config() {
        let mut h = host();
        h.console.add_text("fov 110\ncl_bob 0\n");
        h.frame(0.01).unwrap();
        h.frame(0.01).unwrap();
        assert_eq!(h.config.view.fov, 110.0);
        assert_eq!(h.config.view.bob, 0.0);
    }
}
