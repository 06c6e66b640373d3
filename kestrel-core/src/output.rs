//! Audio output to network subscribers.
//!
//! Blocks arrive as interleaved f32 samples and leave as 16-bit big-endian
//! PCM datagrams. Muted blocks are suppressed entirely; the sender keeps
//! the sequence/timestamp state and flags the first packet after silence
//! with a mark so downstream framing can reset.

use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Samples (per channel set) carried in one datagram.
const SAMPLES_PER_PACKET: usize = 480;

/// Sequence, timestamp and silence state for one output stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamState {
    pub seq: u16,
    pub timestamp: u32,
    /// The previous block was suppressed; the next sent packet is marked.
    pub silent: bool,
    pub marks: u64,
}

/// One channel's PCM output stream. A channel without a destination still
/// runs its demodulator; the sender just counts instead of transmitting.
pub struct PcmSender {
    sock: Option<UdpSocket>,
    pub state: StreamState,
    pub samples_sent: u64,
    buf: Vec<u8>,
}

impl PcmSender {
    pub fn new(dest: Option<SocketAddr>) -> io::Result<Self> {
        let sock = match dest {
            Some(addr) => {
                let bind_addr: SocketAddr = if addr.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                };
                let sock = UdpSocket::bind(bind_addr)?;
                sock.connect(addr)?;
                Some(sock)
            }
            None => None,
        };
        Ok(PcmSender {
            sock,
            state: StreamState::default(),
            samples_sent: 0,
            buf: Vec::with_capacity(2 * SAMPLES_PER_PACKET * 2),
        })
    }

    /// Send one block of interleaved samples, or suppress it when muted.
    /// `channels` is 1 or 2; the timestamp advances by sample frames either
    /// way so silence keeps time.
    pub fn send(&mut self, samples: &[f32], channels: u8, mute: bool) -> io::Result<()> {
        let frames = samples.len() / channels.max(1) as usize;
        if mute {
            self.state.silent = true;
            self.state.timestamp = self.state.timestamp.wrapping_add(frames as u32);
            return Ok(());
        }
        if self.state.silent {
            self.state.marks += 1;
            self.state.silent = false;
        }
        let step = SAMPLES_PER_PACKET * channels as usize;
        for chunk in samples.chunks(step) {
            if let Some(sock) = &self.sock {
                self.buf.clear();
                for &s in chunk {
                    let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                    self.buf.extend_from_slice(&v.to_be_bytes());
                }
                sock.send(&self.buf)?;
            }
            self.state.seq = self.state.seq.wrapping_add(1);
            self.state.timestamp = self
                .state
                .timestamp
                .wrapping_add((chunk.len() / channels.max(1) as usize) as u32);
            self.samples_sent += chunk.len() as u64;
        }
        Ok(())
    }
}
