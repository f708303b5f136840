//! Client session.
//!
//! The client maintains:
//! - The connection lifecycle (`ConnState`) and its [`NetChannel`]
//! - Signon replies, queued on an outgoing reliable buffer
//! - Entity slots, light styles and player state fed by server messages
//! - Per-frame movement commands sent as unreliable datagrams
//!
//! Server messages that concern other systems (prints, sounds, damage,
//! stuffed console text, level changes) come back out of [`Client::pump`]
//! as [`ClientEvent`]s for the host to route.

use std::net::SocketAddr;

use quake_shared::{
    config::NetConfig,
    error::{EngineError, ProtocolError},
    math::Vec3,
    net::{parse_packet, ControlPacket, Delivered, NetChannel, Packet, PacketSocket, NET_GAME_NAME, NET_MAX_PACKET, NET_PROTOCOL_VERSION},
    protocol::{
        decode_server_messages, ClientData, ClientMessage, MessageWriter, ServerInfo, ServerMessage,
        SoundEvent, UserCmd, MAX_CL_STATS, PROTOCOL_VERSION,
    },
};
use tracing::{debug, info, trace, warn};

use crate::{entity::EntityStore, lights::LightStyles};

/// Number of signon stages before the client is active.
pub const SIGNONS: u8 = 3;
pub const STAT_HEALTH: usize = 0;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnState {
    Disconnected,
    /// Connect request sent, waiting for an accept.
    Connecting { attempts: u32, last_attempt: f64 },
    /// Accepted; `signon` stages consumed so far.
    Connected { signon: u8 },
    /// Fully signed on; sends movement and receives snapshots.
    Active,
}

/// Something the host should act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { slot: u32 },
    /// A new level starts; the host loads the world model.
    LevelChange(ServerInfo),
    Print(String),
    CenterPrint(String),
    /// Console text the server asks the client to execute.
    StuffText(String),
    Sound(SoundEvent),
    Damage { armor: u8, blood: u8, from: Vec3 },
    Active,
    Disconnected { reason: String },
}

/// High-level game client.
pub struct Client {
    state: ConnState,
    name: String,
    net: NetConfig,
    server: Option<SocketAddr>,
    channel: Option<NetChannel>,
    /// Reliable client messages waiting for the channel to free up.
    pending_reliable: MessageWriter,

    pub entities: EntityStore,
    pub light_styles: LightStyles,
    pub server_info: Option<ServerInfo>,
    pub stats: [i32; MAX_CL_STATS],
    pub client_data: ClientData,
    pub view_entity: u16,
    pub view_angles: Vec3,
    pub paused: bool,
    /// Latest server time received.
    server_time: f64,
    /// Interpolation clock; trails `server_time`.
    time: f64,
}

impl Client {
    pub fn new(name: &str, net: &NetConfig) -> Self {
        Self {
            state: ConnState::Disconnected,
            name: name.to_string(),
            net: net.clone(),
            server: None,
            channel: None,
            pending_reliable: MessageWriter::new(),
            entities: EntityStore::new(),
            light_styles: LightStyles::new(),
            server_info: None,
            stats: [0; MAX_CL_STATS],
            client_data: ClientData::default(),
            view_entity: 0,
            view_angles: Vec3::ZERO,
            paused: false,
            server_time: 0.0,
            time: 0.0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnState::Active
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn channel(&self) -> Option<&NetChannel> {
        self.channel.as_ref()
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn set_net_config(&mut self, net: &NetConfig) {
        self.net = net.clone();
    }

    pub fn server_time(&self) -> f64 {
        self.server_time
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Sends a connect request to `server`.
    pub fn connect(&mut self, socket: &dyn PacketSocket, server: SocketAddr, now: f64) -> anyhow::Result<()> {
        if self.state != ConnState::Disconnected {
            self.disconnect(Some(socket), "reconnecting");
        }
        info!(%server, "connecting");
        self.server = Some(server);
        self.state = ConnState::Connecting {
            attempts: 1,
            last_attempt: now,
        };
        send_connect_request(socket, server)?;
        Ok(())
    }

    /// Queues a console command for the server on the reliable stream.
    pub fn queue_string_cmd(&mut self, cmd: &str) {
        ClientMessage::StringCmd(cmd.to_string()).encode(&mut self.pending_reliable);
    }

    /// Receives and handles everything waiting on `socket`, then performs
    /// connect retries, timeouts, resends and flushes.
    pub fn pump(&mut self, socket: &dyn PacketSocket, now: f64) -> Result<Vec<ClientEvent>, EngineError> {
        let mut events = Vec::new();
        let mut buf = [0u8; NET_MAX_PACKET];
        loop {
            let (n, from) = match socket.try_recv_from(&mut buf) {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "socket read failed");
                    break;
                }
            };
            if self.server != Some(from) {
                trace!(%from, "packet from unknown address ignored");
                continue;
            }
            match self.state {
                ConnState::Disconnected => {}
                ConnState::Connecting { .. } => self.handle_handshake(&buf[..n], now, &mut events),
                ConnState::Connected { .. } | ConnState::Active => {
                    if let Err(e) = self.handle_packet(&buf[..n], now, &mut events) {
                        self.fail(socket, e, &mut events)?;
                    }
                }
            }
        }

        match self.state {
            ConnState::Connecting {
                attempts,
                last_attempt,
            } if now - last_attempt >= f64::from(self.net.connect_retry_secs) => {
                if attempts >= self.net.connect_attempts {
                    self.drop_connection("no response from server", &mut events);
                } else if let Some(server) = self.server {
                    debug!(%server, attempt = attempts + 1, "retrying connect");
                    self.state = ConnState::Connecting {
                        attempts: attempts + 1,
                        last_attempt: now,
                    };
                    if let Err(e) = send_connect_request(socket, server) {
                        warn!(error = %e, "connect request failed");
                    }
                }
            }
            ConnState::Connected { .. } | ConnState::Active => {
                let timed_out = self.channel.as_ref().is_some_and(|c| c.is_timed_out(now));
                if timed_out {
                    warn!("connection timed out");
                    self.drop_connection("timed out", &mut events);
                } else {
                    self.flush(socket, now, &mut events)?;
                }
            }
            _ => {}
        }
        Ok(events)
    }

    fn handle_handshake(&mut self, data: &[u8], now: f64, events: &mut Vec<ClientEvent>) {
        let Some(server) = self.server else {
            return;
        };
        match parse_packet(data) {
            Ok(Packet::Control(ControlPacket::Accept { slot })) => {
                info!(%server, slot, "connection accepted");
                self.channel = Some(NetChannel::new(server, now).with_timeout(f64::from(self.net.timeout_secs)));
                self.state = ConnState::Connected { signon: 0 };
                events.push(ClientEvent::Connected { slot });
            }
            Ok(Packet::Control(ControlPacket::Reject { reason })) => {
                warn!(%server, %reason, "connection rejected");
                let reason = ProtocolError::Rejected(reason).to_string();
                self.drop_connection(&reason, events);
            }
            Ok(other) => trace!(?other, "ignored while connecting"),
            Err(e) => debug!(error = %e, "bad handshake packet"),
        }
    }

    fn handle_packet(&mut self, data: &[u8], now: f64, events: &mut Vec<ClientEvent>) -> Result<(), EngineError> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        for delivered in channel.process_packet(now, data)? {
            let (payload, datagram) = match delivered {
                Delivered::Reliable(b) => (b, false),
                Delivered::Unreliable(b) => (b, true),
            };
            let mut saw_time = false;
            for msg in decode_server_messages(&payload)? {
                saw_time |= matches!(msg, ServerMessage::Time(_));
                self.handle_message(msg, events)?;
                if self.state == ConnState::Disconnected {
                    return Ok(());
                }
            }
            if datagram && saw_time {
                let retired = self.entities.retire_missing(self.server_time);
                if retired > 0 {
                    trace!(retired, "entities left the snapshot");
                }
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: ServerMessage, events: &mut Vec<ClientEvent>) -> Result<(), EngineError> {
        match msg {
            ServerMessage::Nop => {}
            ServerMessage::Disconnect => {
                info!("server disconnected");
                self.drop_connection("server disconnected", events);
            }
            ServerMessage::UpdateStat { index, value } => {
                let slot = self
                    .stats
                    .get_mut(index as usize)
                    .ok_or_else(|| ProtocolError::Other(format!("stat {index} is invalid")))?;
                *slot = value;
            }
            ServerMessage::Version(v) => {
                if v != PROTOCOL_VERSION {
                    return Err(ProtocolError::WrongVersion {
                        found: v,
                        expected: PROTOCOL_VERSION,
                    }
                    .into());
                }
            }
            ServerMessage::SetView(e) => self.view_entity = e,
            ServerMessage::Sound(s) => events.push(ClientEvent::Sound(s)),
            ServerMessage::Time(t) => {
                self.server_time = f64::from(t);
                self.entities.begin_message(self.server_time);
            }
            ServerMessage::Print(text) => {
                info!(target: "console", "{}", text.trim_end());
                events.push(ClientEvent::Print(text));
            }
            ServerMessage::StuffText(text) => events.push(ClientEvent::StuffText(text)),
            ServerMessage::SetAngle(a) => self.view_angles = a,
            ServerMessage::ServerInfo(info) => {
                if info.protocol != PROTOCOL_VERSION {
                    return Err(ProtocolError::WrongVersion {
                        found: info.protocol,
                        expected: PROTOCOL_VERSION,
                    }
                    .into());
                }
                info!(level = %info.level_name, models = info.models.len(), "server info");
                self.clear_level_state();
                self.state = ConnState::Connected { signon: 0 };
                self.server_info = Some(info.clone());
                events.push(ClientEvent::LevelChange(info));
            }
            ServerMessage::LightStyle { style, pattern } => {
                self.light_styles.set(style as usize, &pattern)?;
            }
            ServerMessage::ClientData(cd) => {
                self.stats[STAT_HEALTH] = i32::from(cd.health);
                self.client_data = cd;
            }
            ServerMessage::Damage { armor, blood, from } => {
                events.push(ClientEvent::Damage { armor, blood, from });
            }
            ServerMessage::SpawnBaseline { entity, baseline } => {
                self.entities.set_baseline(entity as usize, baseline)?;
            }
            ServerMessage::SetPause(p) => self.paused = p,
            ServerMessage::SignonNum(n) => self.signon_reply(n, events)?,
            ServerMessage::CenterPrint(text) => events.push(ClientEvent::CenterPrint(text)),
            ServerMessage::EntityUpdate(update) => {
                self.entities.apply_update(&update, self.server_time)?;
            }
        }
        Ok(())
    }

    /// Advances the signon sequence, queuing the reply each stage expects.
    fn signon_reply(&mut self, received: u8, events: &mut Vec<ClientEvent>) -> Result<(), ProtocolError> {
        let current = match self.state {
            ConnState::Connected { signon } => signon,
            ConnState::Active => SIGNONS,
            _ => 0,
        };
        if received != current + 1 || received > SIGNONS {
            return Err(ProtocolError::SignonOrder { received, current });
        }
        debug!(signon = received, "signon");
        match received {
            1 => self.queue_string_cmd("prespawn"),
            2 => {
                let name = format!("name \"{}\"", self.name);
                self.queue_string_cmd(&name);
                self.queue_string_cmd("spawn");
            }
            _ => self.queue_string_cmd("begin"),
        }
        if received == SIGNONS {
            info!("signon complete");
            self.state = ConnState::Active;
            events.push(ClientEvent::Active);
        } else {
            self.state = ConnState::Connected { signon: received };
        }
        Ok(())
    }

    /// Sends this frame's movement command.
    pub fn send_cmd(&mut self, socket: &dyn PacketSocket, cmd: &UserCmd) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if self.state != ConnState::Active {
            return events;
        }
        let Some(channel) = self.channel.as_mut() else {
            return events;
        };
        let mut w = MessageWriter::new();
        ClientMessage::Move {
            time: self.server_time as f32,
            cmd: *cmd,
        }
        .encode(&mut w);
        let sent = channel
            .send_unreliable(w.as_bytes())
            .map_err(|e| e.to_string())
            .and_then(|()| channel.transmit(socket).map_err(|e| e.to_string()));
        if let Err(reason) = sent {
            warn!(%reason, "unreliable send failed");
            self.drop_connection(&format!("send failed: {reason}"), &mut events);
        }
        events
    }

    fn flush(&mut self, socket: &dyn PacketSocket, now: f64, events: &mut Vec<ClientEvent>) -> Result<(), EngineError> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        if !self.pending_reliable.is_empty() && channel.can_send_reliable() {
            let msg = self.pending_reliable.take();
            if let Err(e) = channel.send_reliable(&msg, now) {
                let err = ProtocolError::Other(e.to_string());
                return self.fail(socket, err.into(), events);
            }
        }
        channel.poll(now);
        if let Err(e) = channel.transmit(socket) {
            warn!(error = %e, "send failed");
            self.drop_connection("send failed", events);
        }
        Ok(())
    }

    /// Ends the connection for an error. Capacity errors are passed on.
    fn fail(&mut self, socket: &dyn PacketSocket, err: EngineError, events: &mut Vec<ClientEvent>) -> Result<(), EngineError> {
        warn!(error = %err, severity = ?err.severity(), "connection error");
        self.disconnect(Some(socket), &err.to_string());
        events.push(ClientEvent::Disconnected {
            reason: err.to_string(),
        });
        match err {
            EngineError::Capacity(_) | EngineError::Content(_) => Err(err),
            EngineError::Protocol(_) => Ok(()),
        }
    }

    fn drop_connection(&mut self, reason: &str, events: &mut Vec<ClientEvent>) {
        self.reset(reason);
        events.push(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Tells the server we are leaving, then clears all session state.
    pub fn disconnect(&mut self, socket: Option<&dyn PacketSocket>, reason: &str) {
        if let (Some(channel), Some(socket)) = (self.channel.as_mut(), socket) {
            let mut w = MessageWriter::new();
            ClientMessage::Disconnect.encode(&mut w);
            for _ in 0..3 {
                if channel.send_unreliable(w.as_bytes()).is_err() {
                    break;
                }
            }
            if let Err(e) = channel.transmit(socket) {
                debug!(error = %e, "disconnect notice not sent");
            }
        }
        self.reset(reason);
    }

    fn reset(&mut self, reason: &str) {
        if self.state != ConnState::Disconnected {
            info!(%reason, "disconnected");
        }
        self.state = ConnState::Disconnected;
        self.channel = None;
        self.pending_reliable.clear();
        self.clear_level_state();
        self.server_info = None;
    }

    fn clear_level_state(&mut self) {
        self.entities.clear();
        self.light_styles.clear();
        self.stats = [0; MAX_CL_STATS];
        self.client_data = ClientData::default();
        self.view_entity = 0;
        self.paused = false;
        self.server_time = 0.0;
        self.time = 0.0;
    }

    /// Advances the interpolation clock and returns the lerp fraction
    /// between the last two server messages.
    pub fn advance(&mut self, frametime: f64) -> f32 {
        if !self.paused {
            self.time += frametime;
        }
        let (frac, time) = self.entities.lerp_fraction(self.time);
        self.time = time;
        frac
    }
}

fn send_connect_request(socket: &dyn PacketSocket, server: SocketAddr) -> std::io::Result<()> {
    let packet = ControlPacket::Connect {
        game: NET_GAME_NAME.to_string(),
        version: NET_PROTOCOL_VERSION,
    }
    .encode();
    socket.try_send_to(&packet, server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quake_shared::{
        net::{LoopbackNet, LoopbackSocket},
        protocol::{decode_client_messages, EntityBaseline, EntityUpdate},
    };

    /// Drives the server end of a connection by hand.
    struct FakeServer {
        socket: LoopbackSocket,
        channel: Option<NetChannel>,
        received: Vec<ClientMessage>,
    }

    impl FakeServer {
        fn new(net: &LoopbackNet) -> Self {
            Self {
                socket: net.bind(26000),
                channel: None,
                received: Vec::new(),
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        fn pump(&mut self, now: f64) {
            let mut buf = [0u8; NET_MAX_PACKET];
            while let Some((n, from)) = self.socket.try_recv_from(&mut buf).unwrap() {
                match parse_packet(&buf[..n]).unwrap() {
                    Packet::Control(ControlPacket::Connect { .. }) => {
                        self.socket
                            .try_send_to(&ControlPacket::Accept { slot: 1 }.encode(), from)
                            .unwrap();
                        self.channel = Some(NetChannel::new(from, now));
                    }
                    Packet::Control(_) => {}
                    Packet::Data { .. } => {
                        let channel = self.channel.as_mut().unwrap();
                        for d in channel.process_packet(now, &buf[..n]).unwrap() {
                            let (Delivered::Reliable(b) | Delivered::Unreliable(b)) = d;
                            self.received.extend(decode_client_messages(&b).unwrap());
                        }
                    }
                }
            }
            if let Some(c) = self.channel.as_mut() {
                c.transmit(&self.socket).unwrap();
            }
        }

        fn send(&mut self, msgs: &[ServerMessage], reliable: bool, now: f64) {
            let mut w = MessageWriter::new();
            for m in msgs {
                m.encode(&mut w);
            }
            let channel = self.channel.as_mut().unwrap();
            if reliable {
                channel.send_reliable(w.as_bytes(), now).unwrap();
            } else {
                channel.send_unreliable(w.as_bytes()).unwrap();
            }
            channel.transmit(&self.socket).unwrap();
        }

        fn string_cmds(&self) -> Vec<&str> {
            self.received
                .iter()
                .filter_map(|m| match m {
                    ClientMessage::StringCmd(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    fn server_info() -> ServerMessage {
        ServerMessage::ServerInfo(ServerInfo {
            protocol: PROTOCOL_VERSION,
            max_clients: 4,
            game_type: 0,
            level_name: "Slipgate".into(),
            models: vec!["maps/e1m1.bsp".into()],
            sounds: vec![],
        })
    }

    fn connected() -> (LoopbackNet, LoopbackSocket, FakeServer, Client) {
        let net = LoopbackNet::new();
        let mut server = FakeServer::new(&net);
        let sock = net.bind(0);
        let mut client = Client::new("ranger", &NetConfig::default());
        client.connect(&sock, server.addr(), 0.0).unwrap();
        server.pump(0.0);
        let events = client.pump(&sock, 0.0).unwrap();
        assert_eq!(events, vec![ClientEvent::Connected { slot: 1 }]);
        (net, sock, server, client)
    }

    #[test]
    fn signon_goes_active_only_after_stage_three() {
        let (_net, sock, mut server, mut client) = connected();

        server.send(&[server_info(), ServerMessage::SignonNum(1)], true, 0.1);
        let events = client.pump(&sock, 0.1).unwrap();
        assert!(matches!(events[0], ClientEvent::LevelChange(_)));
        assert_eq!(client.state(), ConnState::Connected { signon: 1 });
        server.pump(0.1);
        assert_eq!(server.string_cmds(), ["prespawn"]);
        client.pump(&sock, 0.2).unwrap();

        server.send(&[ServerMessage::SignonNum(2)], true, 0.2);
        client.pump(&sock, 0.2).unwrap();
        assert_eq!(client.state(), ConnState::Connected { signon: 2 });
        assert!(!client.is_active());
        server.pump(0.2);
        assert_eq!(server.string_cmds(), ["prespawn", "name \"ranger\"", "spawn"]);
        client.pump(&sock, 0.3).unwrap();

        server.send(&[ServerMessage::SignonNum(3)], true, 0.3);
        let events = client.pump(&sock, 0.3).unwrap();
        assert!(events.contains(&ClientEvent::Active));
        assert!(client.is_active());
        server.pump(0.3);
        assert_eq!(server.string_cmds().last(), Some(&"begin"));
    }

    #[test]
    fn out_of_order_signon_never_activates() {
        let (_net, sock, mut server, mut client) = connected();
        server.send(&[server_info(), ServerMessage::SignonNum(2)], true, 0.1);
        let events = client.pump(&sock, 0.1).unwrap();
        assert!(!client.is_active());
        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::Disconnected { reason } if reason.contains("signon 2")
        )));
    }

    /// Reliable packets with sequences 0, 1, 2.. carrying one batch each.
    fn reliable_packets(batches: &[&[ServerMessage]], to: SocketAddr) -> Vec<Vec<u8>> {
        let mut tx = NetChannel::new(to, 0.0);
        let mut sink = NetChannel::new(to, 0.0);
        let mut out = Vec::new();
        for batch in batches {
            let mut w = MessageWriter::new();
            for m in *batch {
                m.encode(&mut w);
            }
            tx.send_reliable(w.as_bytes(), 0.0).unwrap();
            let packets: Vec<_> = tx.drain_outgoing().collect();
            for p in &packets {
                sink.process_packet(0.0, p).unwrap();
            }
            let acks: Vec<_> = sink.drain_outgoing().collect();
            for a in &acks {
                tx.process_packet(0.0, a).unwrap();
            }
            out.extend(packets.iter().map(|p| p.to_vec()));
        }
        out
    }

    #[test]
    fn reordered_signon_stalls_until_the_gap_fills() {
        let (_net, sock, server, mut client) = connected();
        let info = [server_info(), ServerMessage::SignonNum(1)];
        let packets = reliable_packets(
            &[&info[..], &[ServerMessage::SignonNum(2)][..], &[ServerMessage::SignonNum(3)][..]],
            sock.local_addr().unwrap(),
        );
        assert_eq!(packets.len(), 3);
        let to = sock.local_addr().unwrap();

        for (i, seq) in [2usize, 1].into_iter().enumerate() {
            server.socket.try_send_to(&packets[seq], to).unwrap();
            let events = client.pump(&sock, 0.1 * (i + 1) as f64).unwrap();
            assert!(events.is_empty(), "{events:?}");
            assert_eq!(client.state(), ConnState::Connected { signon: 0 });
        }

        server.socket.try_send_to(&packets[0], to).unwrap();
        let events = client.pump(&sock, 0.3).unwrap();
        assert!(matches!(events[0], ClientEvent::LevelChange(_)));
        assert_eq!(events.last(), Some(&ClientEvent::Active));
        assert!(client.is_active());
    }

    #[test]
    fn silent_server_times_out() {
        let (_net, sock, mut server, mut client) = connected();
        server.send(&[server_info()], true, 0.0);
        client.pump(&sock, 0.0).unwrap();
        client.entities.store(3, Default::default(), 0.0).unwrap();

        let events = client.pump(&sock, 31.0).unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::Disconnected {
                reason: "timed out".into()
            }]
        );
        assert_eq!(client.entities.active_count(), 0);
    }

    #[test]
    fn snapshots_update_and_retire_entities() {
        let (_net, sock, mut server, mut client) = connected();
        server.send(&[server_info(), ServerMessage::SignonNum(1)], true, 0.0);
        client.pump(&sock, 0.0).unwrap();
        server.pump(0.0);
        client.pump(&sock, 0.0).unwrap();
        server.send(
            &[
                ServerMessage::SpawnBaseline {
                    entity: 5,
                    baseline: EntityBaseline {
                        model: 2,
                        ..Default::default()
                    },
                },
                ServerMessage::SignonNum(2),
            ],
            true,
            0.0,
        );
        client.pump(&sock, 0.0).unwrap();
        server.pump(0.0);
        client.pump(&sock, 0.0).unwrap();
        server.send(&[ServerMessage::SignonNum(3)], true, 0.0);
        client.pump(&sock, 0.0).unwrap();
        assert!(client.is_active());

        let update = EntityUpdate {
            entity: 5,
            origin: [Some(8.0), None, None],
            ..Default::default()
        };
        server.send(&[ServerMessage::Time(1.0), ServerMessage::EntityUpdate(update)], false, 0.1);
        client.pump(&sock, 0.1).unwrap();
        let e = client.entities.get(5).unwrap();
        assert_eq!((e.current.model, e.current.origin.x), (2, 8.0));

        server.send(&[ServerMessage::Time(1.1)], false, 0.2);
        client.pump(&sock, 0.2).unwrap();
        assert!(client.entities.get(5).is_none());
    }

    #[test]
    fn movement_is_sent_only_when_active() {
        let (_net, sock, mut server, mut client) = connected();
        assert!(client.send_cmd(&sock, &UserCmd::default()).is_empty());
        server.pump(0.0);
        assert!(server.received.is_empty());

        server.send(&[server_info(), ServerMessage::SignonNum(1)], true, 0.0);
        client.pump(&sock, 0.0).unwrap();
        client.state = ConnState::Active;
        let cmd = UserCmd {
            forward_move: 200.0,
            ..Default::default()
        };
        client.send_cmd(&sock, &cmd);
        server.pump(0.0);
        assert!(server
            .received
            .iter()
            .any(|m| matches!(m, ClientMessage::Move { cmd, .. } if cmd.forward_move == 200.0)));
    }

    #[test]
    fn connect_gives_up_after_retries() {
        let net = LoopbackNet::new();
        let sock = net.bind(0);
        let nobody = "127.0.0.1:9".parse().unwrap();
        let mut client = Client::new("ranger", &NetConfig::default());
        client.connect(&sock, nobody, 0.0).unwrap();
        assert!(client.pump(&sock, 3.0).unwrap().is_empty());
        assert!(client.pump(&sock, 6.0).unwrap().is_empty());
        let events = client.pump(&sock, 9.0).unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::Disconnected {
                reason: "no response from server".into()
            }]
        );
    }

    #[test]
    fn connect_attempts_counts_whole_requests() {
        let net = LoopbackNet::new();
        let sock = net.bind(0);
        let silent = net.bind(26001);
        let mut cfg = NetConfig::default();
        cfg.connect_attempts = 5;
        let mut client = Client::new("ranger", &cfg);
        client.connect(&sock, silent.local_addr().unwrap(), 0.0).unwrap();

        let mut gave_up_at = None;
        for step in 1..=10 {
            let events = client.pump(&sock, step as f64 * 3.0).unwrap();
            if !events.is_empty() {
                gave_up_at = Some(step);
                break;
            }
        }
        assert_eq!(gave_up_at, Some(5));

        let mut buf = [0u8; NET_MAX_PACKET];
        let mut requests = 0;
        while let Some((n, _)) = silent.try_recv_from(&mut buf).unwrap() {
            assert!(matches!(parse_packet(&buf[..n]).unwrap(), Packet::Control(ControlPacket::Connect { .. })));
            requests += 1;
        }
        assert_eq!(requests, 5);
    }

    #[test]
    fn server_disconnect_clears_state() {
        let (_net, sock, mut server, mut client) = connected();
        server.send(
            &[
                server_info(),
                ServerMessage::LightStyle {
                    style: 0,
                    pattern: "m".into(),
                },
                ServerMessage::Disconnect,
            ],
            true,
            0.0,
        );
        let events = client.pump(&sock, 0.0).unwrap();
        assert_eq!(
            events.last(),
            Some(&ClientEvent::Disconnected {
                reason: "server disconnected".into()
            })
        );
        assert_eq!(client.light_styles.pattern(0), Some(""));
        assert!(client.server_info.is_none());
    }
}
