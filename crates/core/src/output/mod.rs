//! Lighting controller output.
//!
//! Each intensity change becomes one UDP datagram: a fixed DMX-out header
//! followed by an escaped trailer that selects the board, then the channel,
//! then carries the intensity byte.

use std::{
    fmt,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::{engine::EngineStats, LightsError, Result};

pub const KINET_MAGIC: u32 = 0x4adc_0104;
pub const KINET_VERSION: u16 = 0x0001;
pub const KINET_DMX_OUT: u16 = 0x0101;
/// Universe field value meaning "not set".
pub const UNIVERSE_UNSET: u32 = u32::MAX;
pub const HEADER_LEN: usize = 20;
/// Longest possible packet: header, two address pairs, doubled intensity.
pub const MAX_PACKET_LEN: usize = HEADER_LEN + 6;

/// Marks the next byte as an address; doubled when sent as data.
pub const ESCAPE: u8 = 0xF0;
pub const BOARD_BASE: u8 = 0x88;
pub const BOARD_MAX: u8 = 0x8B;
pub const CHANNEL_BASE: u8 = 0x40;
pub const LIGHTS_PER_BOARD: usize = 20;

/// Board and channel a light is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightAddress {
    pub board: u8,
    pub channel: u8,
}

impl LightAddress {
    pub fn for_light(light: usize) -> Result<Self> {
        let board_offset = light / LIGHTS_PER_BOARD;
        if board_offset > usize::from(BOARD_MAX - BOARD_BASE) {
            return Err(LightsError::InvalidLightAddress { light });
        }
        Ok(Self {
            board: BOARD_BASE + board_offset as u8,
            channel: CHANNEL_BASE + (light % LIGHTS_PER_BOARD) as u8,
        })
    }
}

/// Serialises a single intensity command.
pub fn encode_command(address: LightAddress, intensity: u8) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MAX_PACKET_LEN);

    packet.extend_from_slice(&KINET_MAGIC.to_le_bytes());
    packet.extend_from_slice(&KINET_VERSION.to_le_bytes());
    packet.extend_from_slice(&KINET_DMX_OUT.to_le_bytes());
    // sequence
    packet.extend_from_slice(&0u32.to_le_bytes());
    // port, flags, timer
    packet.push(0);
    packet.push(0);
    packet.extend_from_slice(&0u16.to_le_bytes());
    packet.extend_from_slice(&UNIVERSE_UNSET.to_le_bytes());

    packet.extend_from_slice(&[ESCAPE, address.board, ESCAPE, address.channel]);
    if intensity == ESCAPE {
        packet.push(ESCAPE);
    }
    packet.push(intensity);

    packet
}

/// Fire-and-forget packet sink.
pub trait LightTransport: Send {
    fn send(&mut self, packet: &[u8]) -> Result<()>;
}

/// Sends packets to a lighting controller over UDP.
pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTransport {
    pub fn connect(address: &str) -> Result<Self> {
        let target: SocketAddr = address.parse().map_err(|err| {
            LightsError::config(format!("invalid controller address {address:?}: {err}"))
        })?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        tracing::info!(%target, "lighting transport ready");
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl LightTransport for UdpTransport {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        let sent = self
            .socket
            .send_to(packet, self.target)
            .map_err(|err| LightsError::TransportFailure(err.to_string()))?;
        if sent != packet.len() {
            return Err(LightsError::TransportFailure(format!(
                "short send: {sent} of {} bytes",
                packet.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpTransport")
            .field("target", &self.target)
            .finish()
    }
}

/// Keeps every packet in memory. Clones share the same buffer, so a host
/// can hand one clone to the engine and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    packets: Arc<Mutex<Vec<Vec<u8>>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail without recording anything.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(
            &mut *self
                .packets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

impl LightTransport for MemoryTransport {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(LightsError::TransportFailure("transport disabled".into()));
        }
        self.packets
            .lock()
            .map_err(|_| LightsError::TransportFailure("packet log has been poisoned".into()))?
            .push(packet.to_vec());
        Ok(())
    }
}

/// Turns light intensity changes into packets on a transport.
pub struct Dispatcher {
    transport: Box<dyn LightTransport>,
    stats: Arc<EngineStats>,
}

impl Dispatcher {
    pub fn new(transport: Box<dyn LightTransport>, stats: Arc<EngineStats>) -> Self {
        Self { transport, stats }
    }

    /// Encodes and sends one command. Nothing is sent for lights that do not
    /// map to a board, and failed sends are not retried.
    pub fn update(&mut self, light: usize, intensity: u8) -> Result<()> {
        let address = LightAddress::for_light(light).inspect_err(|_| {
            self.stats.invalid_addresses.fetch_add(1, Ordering::Relaxed);
        })?;
        let packet = encode_command(address, intensity);

        match self.transport.send(&packet) {
            Ok(()) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(light, intensity, board = address.board, channel = address.channel, "sent");
                Ok(())
            }
            Err(err) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Like [`Dispatcher::update`], but logs the failure instead of
    /// returning it. Returns whether the packet went out.
    pub fn emit(&mut self, light: usize, intensity: u8) -> bool {
        match self.update(light, intensity) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(light, intensity, %err, "light update failed");
                false
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
