//! Datagram transport.
//!
//! Goals:
//! - One connection per peer, multiplexed over a single datagram socket.
//! - A reliable, in-order message stream (one message in flight at a time,
//!   fragmented at `MAX_DATAGRAM`) alongside a latest-wins unreliable one.
//! - Keep the channel transport-agnostic: callers pass the current time in
//!   and drain outgoing packets themselves.
//!
//! Packet header (big-endian, 8 bytes): `u32 length | flags`, `u32 sequence`.
//! Control packets carry only the first word followed by a command byte.

use anyhow::Context;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex,
    },
};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::error::ProtocolError;
use crate::protocol::{MAX_DATAGRAM, MAX_MSGLEN};

/// Transport protocol version sent in connect requests.
pub const NET_PROTOCOL_VERSION: u8 = 3;
pub const NET_GAME_NAME: &str = "QUAKE";
pub const NET_HEADER_SIZE: usize = 8;
pub const NET_MAX_PACKET: usize = NET_HEADER_SIZE + MAX_DATAGRAM;

pub const DEFAULT_TIMEOUT: f64 = 30.0;
pub const INITIAL_RESEND_INTERVAL: f64 = 1.0;
pub const MAX_RESEND_INTERVAL: f64 = 8.0;
/// Reliable fragments this far ahead of the expected sequence are held.
pub const REORDER_WINDOW: u32 = 8;

const LENGTH_MASK: u32 = 0x0000_ffff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u32 {
        const DATA = 0x0001_0000;
        const ACK = 0x0002_0000;
        const NAK = 0x0004_0000;
        const EOM = 0x0008_0000;
        const UNRELIABLE = 0x0010_0000;
        const CTL = 0x8000_0000;
    }
}

/// Control command bytes.
pub mod ccmd {
    pub const REQ_CONNECT: u8 = 0x01;
    pub const REP_ACCEPT: u8 = 0x81;
    pub const REP_REJECT: u8 = 0x82;
}

/// Connectionless handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Connect { game: String, version: u8 },
    /// Carries the slot the server assigned.
    Accept { slot: u32 },
    Reject { reason: String },
}

impl ControlPacket {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            ControlPacket::Connect { game, version } => {
                body.put_u8(ccmd::REQ_CONNECT);
                body.put_slice(game.as_bytes());
                body.put_u8(0);
                body.put_u8(*version);
            }
            ControlPacket::Accept { slot } => {
                body.put_u8(ccmd::REP_ACCEPT);
                body.put_u32_le(*slot);
            }
            ControlPacket::Reject { reason } => {
                body.put_u8(ccmd::REP_REJECT);
                body.put_slice(reason.as_bytes());
                body.put_u8(0);
            }
        }
        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32(PacketFlags::CTL.bits() | (4 + body.len()) as u32);
        out.extend_from_slice(&body);
        out.freeze()
    }

    /// Decodes the body that follows the control header word.
    fn decode(mut body: &[u8]) -> Result<Self, ProtocolError> {
        if !body.has_remaining() {
            return Err(ProtocolError::Truncated("control command"));
        }
        let cmd = body.get_u8();
        let cstr = |b: &mut &[u8]| -> Result<String, ProtocolError> {
            let end = b
                .iter()
                .position(|&c| c == 0)
                .ok_or(ProtocolError::Truncated("control string"))?;
            let s = String::from_utf8_lossy(&b[..end]).into_owned();
            b.advance(end + 1);
            Ok(s)
        };
        match cmd {
            ccmd::REQ_CONNECT => {
                let game = cstr(&mut body)?;
                if !body.has_remaining() {
                    return Err(ProtocolError::Truncated("connect version"));
                }
                Ok(ControlPacket::Connect {
                    game,
                    version: body.get_u8(),
                })
            }
            ccmd::REP_ACCEPT => {
                if body.remaining() < 4 {
                    return Err(ProtocolError::Truncated("accept slot"));
                }
                Ok(ControlPacket::Accept {
                    slot: body.get_u32_le(),
                })
            }
            ccmd::REP_REJECT => Ok(ControlPacket::Reject {
                reason: cstr(&mut body)?,
            }),
            other => Err(ProtocolError::BadControl(other)),
        }
    }
}

/// A classified incoming packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet<'a> {
    Control(ControlPacket),
    Data {
        flags: PacketFlags,
        sequence: u32,
        payload: &'a [u8],
    },
}

/// Splits a raw datagram into header and payload, validating the length.
pub fn parse_packet(data: &[u8]) -> Result<Packet<'_>, ProtocolError> {
    let mut head = data;
    if head.remaining() < 4 {
        return Err(ProtocolError::Truncated("packet header"));
    }
    let word = head.get_u32();
    let declared = (word & LENGTH_MASK) as usize;
    let flags = PacketFlags::from_bits(word & !LENGTH_MASK).ok_or(ProtocolError::BadFlags(word))?;
    if declared != data.len() {
        return Err(ProtocolError::BadLength {
            declared,
            actual: data.len(),
        });
    }
    if flags.contains(PacketFlags::CTL) {
        return Ok(Packet::Control(ControlPacket::decode(head)?));
    }
    if head.remaining() < 4 {
        return Err(ProtocolError::Truncated("packet sequence"));
    }
    let sequence = head.get_u32();
    Ok(Packet::Data {
        flags,
        sequence,
        payload: head,
    })
}

fn encode_packet(flags: PacketFlags, sequence: u32, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(NET_HEADER_SIZE + payload.len());
    out.put_u32(flags.bits() | (NET_HEADER_SIZE + payload.len()) as u32);
    out.put_u32(sequence);
    out.extend_from_slice(payload);
    out.freeze()
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("a reliable message is still awaiting acknowledgement")]
    ReliableBusy,
    #[error("message of {len} bytes exceeds the {limit} byte limit")]
    Oversize { len: usize, limit: usize },
}

/// A message handed up by [`NetChannel::process_packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Reliable(Bytes),
    Unreliable(Bytes),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub reliable_resent: u64,
    pub duplicates: u64,
    pub unreliable_dropped: u64,
    pub stale_acks: u64,
}

#[derive(Debug)]
struct InFlight {
    sequence: u32,
    data: Bytes,
    eom: bool,
    first_sent: f64,
    last_sent: f64,
    interval: f64,
    resent: bool,
}

/// One side of a connection.
#[derive(Debug)]
pub struct NetChannel {
    remote: SocketAddr,
    timeout: f64,

    send_sequence: u32,
    in_flight: Option<InFlight>,
    queued_fragments: VecDeque<(Bytes, bool)>,
    unreliable_send_sequence: u32,

    receive_sequence: u32,
    reassembly: BytesMut,
    held: BTreeMap<u32, (Bytes, bool)>,
    unreliable_receive_sequence: u32,

    last_received: f64,
    rtt: Option<f64>,
    outgoing: VecDeque<Bytes>,
    stats: ChannelStats,
}

impl NetChannel {
    pub fn new(remote: SocketAddr, now: f64) -> Self {
        Self {
            remote,
            timeout: DEFAULT_TIMEOUT,
            send_sequence: 0,
            in_flight: None,
            queued_fragments: VecDeque::new(),
            unreliable_send_sequence: 0,
            receive_sequence: 0,
            reassembly: BytesMut::new(),
            held: BTreeMap::new(),
            unreliable_receive_sequence: 0,
            last_received: now,
            rtt: None,
            outgoing: VecDeque::new(),
            stats: ChannelStats::default(),
        }
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Smoothed round-trip estimate, once an ack has been measured.
    pub fn rtt(&self) -> Option<f64> {
        self.rtt
    }

    pub fn can_send_reliable(&self) -> bool {
        self.in_flight.is_none() && self.queued_fragments.is_empty()
    }

    /// Starts sending a reliable message.
    pub fn send_reliable(&mut self, msg: &[u8], now: f64) -> Result<(), SendError> {
        if !self.can_send_reliable() {
            return Err(SendError::ReliableBusy);
        }
        if msg.len() > MAX_MSGLEN {
            return Err(SendError::Oversize {
                len: msg.len(),
                limit: MAX_MSGLEN,
            });
        }
        let msg = Bytes::copy_from_slice(msg);
        let mut offset = 0;
        loop {
            let end = (offset + MAX_DATAGRAM).min(msg.len());
            let eom = end == msg.len();
            self.queued_fragments.push_back((msg.slice(offset..end), eom));
            if eom {
                break;
            }
            offset = end;
        }
        self.send_next_fragment(now);
        Ok(())
    }

    pub fn send_unreliable(&mut self, msg: &[u8]) -> Result<(), SendError> {
        if msg.len() > MAX_DATAGRAM {
            return Err(SendError::Oversize {
                len: msg.len(),
                limit: MAX_DATAGRAM,
            });
        }
        let seq = self.unreliable_send_sequence;
        self.unreliable_send_sequence = seq.wrapping_add(1);
        self.push_out(encode_packet(PacketFlags::UNRELIABLE, seq, msg));
        Ok(())
    }

    fn send_next_fragment(&mut self, now: f64) {
        let Some((data, eom)) = self.queued_fragments.pop_front() else {
            return;
        };
        let sequence = self.send_sequence;
        self.send_sequence = sequence.wrapping_add(1);
        let mut flags = PacketFlags::DATA;
        if eom {
            flags |= PacketFlags::EOM;
        }
        self.push_out(encode_packet(flags, sequence, &data));
        self.in_flight = Some(InFlight {
            sequence,
            data,
            eom,
            first_sent: now,
            last_sent: now,
            interval: INITIAL_RESEND_INTERVAL,
            resent: false,
        });
    }

    fn push_out(&mut self, packet: Bytes) {
        self.stats.packets_sent += 1;
        self.outgoing.push_back(packet);
    }

    /// Resends the in-flight fragment if its resend interval has elapsed.
    pub fn poll(&mut self, now: f64) {
        let Some(f) = self.in_flight.as_mut() else {
            return;
        };
        if now - f.last_sent < f.interval {
            return;
        }
        let mut flags = PacketFlags::DATA;
        if f.eom {
            flags |= PacketFlags::EOM;
        }
        let packet = encode_packet(flags, f.sequence, &f.data);
        f.last_sent = now;
        f.interval = (f.interval * 2.0).min(MAX_RESEND_INTERVAL);
        f.resent = true;
        debug!(peer = %self.remote, seq = f.sequence, next_in = f.interval, "reliable resend");
        self.stats.reliable_resent += 1;
        self.push_out(packet);
    }

    pub fn is_timed_out(&self, now: f64) -> bool {
        now - self.last_received > self.timeout
    }

    /// Feeds one received data packet into the channel.
    pub fn process_packet(&mut self, now: f64, data: &[u8]) -> Result<Vec<Delivered>, ProtocolError> {
        let Packet::Data {
            flags,
            sequence,
            payload,
        } = parse_packet(data)?
        else {
            return Err(ProtocolError::Other("control packet on an open connection".into()));
        };
        self.last_received = now;
        self.stats.packets_received += 1;

        if flags.contains(PacketFlags::ACK) {
            self.handle_ack(sequence, now);
            return Ok(Vec::new());
        }
        if flags.contains(PacketFlags::UNRELIABLE) {
            if sequence < self.unreliable_receive_sequence {
                trace!(peer = %self.remote, seq = sequence, "stale unreliable dropped");
                self.stats.unreliable_dropped += 1;
                return Ok(Vec::new());
            }
            if sequence != self.unreliable_receive_sequence {
                let missed = sequence - self.unreliable_receive_sequence;
                trace!(peer = %self.remote, missed, "unreliable packets lost");
            }
            self.unreliable_receive_sequence = sequence.wrapping_add(1);
            return Ok(vec![Delivered::Unreliable(Bytes::copy_from_slice(payload))]);
        }
        if flags.contains(PacketFlags::DATA) {
            return self.handle_reliable(sequence, flags.contains(PacketFlags::EOM), payload);
        }
        Err(ProtocolError::BadFlags(flags.bits()))
    }

    fn handle_ack(&mut self, sequence: u32, now: f64) {
        match &self.in_flight {
            Some(f) if f.sequence == sequence => {
                if !f.resent {
                    let sample = now - f.first_sent;
                    self.rtt = Some(match self.rtt {
                        Some(rtt) => rtt * 0.875 + sample * 0.125,
                        None => sample,
                    });
                }
                self.in_flight = None;
                self.send_next_fragment(now);
            }
            _ => {
                debug!(peer = %self.remote, seq = sequence, "stale ack");
                self.stats.stale_acks += 1;
            }
        }
    }

    fn handle_reliable(&mut self, sequence: u32, eom: bool, payload: &[u8]) -> Result<Vec<Delivered>, ProtocolError> {
        if sequence < self.receive_sequence {
            self.stats.duplicates += 1;
            self.send_ack(sequence);
            return Ok(Vec::new());
        }
        if sequence > self.receive_sequence {
            if sequence - self.receive_sequence <= REORDER_WINDOW {
                self.held
                    .insert(sequence, (Bytes::copy_from_slice(payload), eom));
            } else {
                warn!(peer = %self.remote, seq = sequence, expected = self.receive_sequence, "reliable fragment outside window");
            }
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        self.accept_fragment(sequence, eom, payload, &mut out)?;
        while let Some((data, eom)) = self.held.remove(&self.receive_sequence) {
            self.accept_fragment(self.receive_sequence, eom, &data, &mut out)?;
        }
        Ok(out)
    }

    /// Appends one in-order fragment. A message that grows past
    /// `MAX_MSGLEN` is discarded along with any held fragments.
    fn accept_fragment(&mut self, sequence: u32, eom: bool, payload: &[u8], out: &mut Vec<Delivered>) -> Result<(), ProtocolError> {
        self.send_ack(sequence);
        self.receive_sequence = sequence.wrapping_add(1);
        if self.reassembly.len() + payload.len() > MAX_MSGLEN {
            warn!(peer = %self.remote, seq = sequence, "reliable message too long, discarded");
            self.reassembly.clear();
            self.held.clear();
            return Err(ProtocolError::Oversize { limit: MAX_MSGLEN });
        }
        self.reassembly.extend_from_slice(payload);
        if eom {
            out.push(Delivered::Reliable(self.reassembly.split().freeze()));
        }
        Ok(())
    }

    fn send_ack(&mut self, sequence: u32) {
        self.push_out(encode_packet(PacketFlags::ACK, sequence, &[]));
    }

    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.outgoing.drain(..)
    }

    /// Sends every queued packet to the remote.
    pub fn transmit<S: PacketSocket + ?Sized>(&mut self, socket: &S) -> io::Result<()> {
        let remote = self.remote;
        for packet in self.outgoing.drain(..) {
            socket.try_send_to(&packet, remote)?;
        }
        Ok(())
    }
}

/// Non-blocking datagram socket.
///
/// `WouldBlock` is reported as "nothing happened", never as an error.
pub trait PacketSocket: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn try_send_to(&self, data: &[u8], to: SocketAddr) -> io::Result<()>;
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

impl PacketSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn try_send_to(&self, data: &[u8], to: SocketAddr) -> io::Result<()> {
        match UdpSocket::try_send_to(self, data, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(%to, "udp send would block, packet dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match UdpSocket::try_recv_from(self, buf) {
            Ok(r) => Ok(Some(r)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Binds a UDP socket for the engine.
pub async fn bind_udp(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .with_context(|| format!("udp bind {addr}"))
}

type Mailboxes = HashMap<SocketAddr, VecDeque<(Bytes, SocketAddr)>>;

/// In-process packet hub for a listen server and local client.
#[derive(Debug, Clone)]
pub struct LoopbackNet {
    boxes: Arc<Mutex<Mailboxes>>,
    next_port: Arc<AtomicU16>,
}

impl Default for LoopbackNet {
    fn default() -> Self {
        Self {
            boxes: Arc::default(),
            next_port: Arc::new(AtomicU16::new(1)),
        }
    }
}

impl LoopbackNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an endpoint; `port` 0 picks the next free one.
    pub fn bind(&self, port: u16) -> LoopbackSocket {
        let port = if port == 0 {
            self.next_port.fetch_add(1, Ordering::Relaxed)
        } else {
            port
        };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        self.lock().entry(addr).or_default();
        LoopbackSocket {
            addr,
            net: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Mailboxes> {
        self.boxes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
pub struct LoopbackSocket {
    addr: SocketAddr,
    net: LoopbackNet,
}

impl PacketSocket for LoopbackSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn try_send_to(&self, data: &[u8], to: SocketAddr) -> io::Result<()> {
        // Unbound destinations swallow the packet like a real network would.
        if let Some(q) = self.net.lock().get_mut(&to) {
            q.push_back((Bytes::copy_from_slice(data), self.addr));
        }
        Ok(())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut boxes = self.net.lock();
        let Some((data, from)) = boxes.get_mut(&self.addr).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(Some((n, from)))
    }
}

impl Drop for LoopbackSocket {
    fn drop(&mut self) {
        self.net.lock().remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Moves every outgoing packet from `from` into `to`, returning deliveries.
    fn pump(from: &mut NetChannel, to: &mut NetChannel, now: f64) -> Vec<Delivered> {
        let packets: Vec<Bytes> = from.drain_outgoing().collect();
        let mut out = Vec::new();
        for p in packets {
            out.extend(to.process_packet(now, &p).unwrap());
        }
        out
    }

    #[test]
    fn reliable_is_retransmitted_before_timeout_and_not_after_ack() {
        let mut a = NetChannel::new(addr(1), 0.0);
        let mut b = NetChannel::new(addr(2), 0.0);
        a.send_reliable(b"hello", 0.0).unwrap();
        // First transmission is lost.
        assert_eq!(a.drain_outgoing().count(), 1);

        a.poll(0.5);
        assert_eq!(a.drain_outgoing().count(), 0);
        a.poll(1.0);
        assert_eq!(a.stats().reliable_resent, 1);
        assert!(!a.is_timed_out(1.0));

        let got = pump(&mut a, &mut b, 1.1);
        assert_eq!(got, vec![Delivered::Reliable(Bytes::from_static(b"hello"))]);
        pump(&mut b, &mut a, 1.2);
        assert!(a.can_send_reliable());

        a.poll(20.0);
        assert_eq!(a.drain_outgoing().count(), 0);
        assert_eq!(a.stats().reliable_resent, 1);
    }

    #[test]
    fn resend_interval_backs_off() {
        let mut a = NetChannel::new(addr(1), 0.0);
        a.send_reliable(b"x", 0.0).unwrap();
        a.drain_outgoing().count();
        let mut resends = Vec::new();
        let mut t = 0.0;
        while t < 30.0 {
            t += 0.25;
            a.poll(t);
            if a.drain_outgoing().count() > 0 {
                resends.push(t);
            }
        }
        assert_eq!(&resends[..4], &[1.0, 3.0, 7.0, 15.0]);
        assert_eq!(resends[4], 23.0);
    }

    #[test]
    fn second_reliable_while_in_flight_is_busy() {
        let mut a = NetChannel::new(addr(1), 0.0);
        a.send_reliable(b"one", 0.0).unwrap();
        assert!(matches!(
            a.send_reliable(b"two", 0.0),
            Err(SendError::ReliableBusy)
        ));
    }

    #[test]
    fn large_reliable_is_fragmented_and_reassembled() {
        let mut a = NetChannel::new(addr(1), 0.0);
        let mut b = NetChannel::new(addr(2), 0.0);
        let msg: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        a.send_reliable(&msg, 0.0).unwrap();

        let mut delivered = Vec::new();
        for step in 0..3 {
            let now = step as f64 * 0.1;
            delivered.extend(pump(&mut a, &mut b, now));
            pump(&mut b, &mut a, now);
        }
        assert_eq!(delivered, vec![Delivered::Reliable(Bytes::from(msg))]);
        assert!(a.can_send_reliable());
    }

    #[test]
    fn duplicate_reliable_is_reacked_not_redelivered() {
        let mut a = NetChannel::new(addr(1), 0.0);
        let mut b = NetChannel::new(addr(2), 0.0);
        a.send_reliable(b"m", 0.0).unwrap();
        let first: Vec<Bytes> = a.drain_outgoing().collect();
        assert_eq!(b.process_packet(0.1, &first[0]).unwrap().len(), 1);
        assert!(b.process_packet(0.2, &first[0]).unwrap().is_empty());
        assert_eq!(b.stats().duplicates, 1);
        assert_eq!(b.drain_outgoing().count(), 2);
    }

    #[test]
    fn stale_unreliable_is_dropped() {
        let mut a = NetChannel::new(addr(1), 0.0);
        let mut b = NetChannel::new(addr(2), 0.0);
        a.send_unreliable(b"old").unwrap();
        a.send_unreliable(b"new").unwrap();
        let packets: Vec<Bytes> = a.drain_outgoing().collect();
        assert_eq!(
            b.process_packet(0.0, &packets[1]).unwrap(),
            vec![Delivered::Unreliable(Bytes::from_static(b"new"))]
        );
        assert!(b.process_packet(0.0, &packets[0]).unwrap().is_empty());
        assert_eq!(b.stats().unreliable_dropped, 1);
    }

    #[test]
    fn silence_times_out() {
        let c = NetChannel::new(addr(1), 0.0).with_timeout(5.0);
        assert!(!c.is_timed_out(5.0));
        assert!(c.is_timed_out(5.1));
    }

    #[test]
    fn control_packets_parse() {
        let p = ControlPacket::Connect {
            game: NET_GAME_NAME.into(),
            version: NET_PROTOCOL_VERSION,
        };
        let bytes = p.encode();
        assert_eq!(parse_packet(&bytes).unwrap(), Packet::Control(p));
        assert_eq!(
            parse_packet(&ControlPacket::Accept { slot: 3 }.encode()).unwrap(),
            Packet::Control(ControlPacket::Accept { slot: 3 })
        );
    }

    #[test]
    fn endless_fragments_are_cut_off_at_msglen() {
        let mut b = NetChannel::new(addr(2), 0.0);
        let chunk = vec![7u8; MAX_DATAGRAM];
        let full = MAX_MSGLEN / MAX_DATAGRAM;
        for seq in 0..full as u32 {
            let p = encode_packet(PacketFlags::DATA, seq, &chunk);
            assert!(b.process_packet(0.1, &p).unwrap().is_empty());
        }
        let p = encode_packet(PacketFlags::DATA, full as u32, &chunk);
        assert_eq!(
            b.process_packet(0.1, &p),
            Err(ProtocolError::Oversize { limit: MAX_MSGLEN })
        );

        // The next message starts from an empty buffer.
        let p = encode_packet(PacketFlags::DATA | PacketFlags::EOM, full as u32 + 1, b"ok");
        assert_eq!(
            b.process_packet(0.2, &p).unwrap(),
            vec![Delivered::Reliable(Bytes::from_static(b"ok"))]
        );
    }

    #[test]
    fn bad_length_is_rejected() {
        let mut p = BytesMut::from(&encode_packet(PacketFlags::UNRELIABLE, 0, b"abc")[..]);
        p.put_u8(0);
        assert!(matches!(
            parse_packet(&p),
            Err(ProtocolError::BadLength { declared: 11, actual: 12 })
        ));
    }

    #[test]
    fn loopback_delivers_between_endpoints() {
        let net = LoopbackNet::new();
        let a = net.bind(0);
        let b = net.bind(0);
        let b_addr = b.local_addr().unwrap();
        a.try_send_to(b"ping", b_addr).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
        assert!(b.try_recv_from(&mut buf).unwrap().is_none());
    }
}
