//! Status frames and command dispatch for the control plane.
//!
//! Status frames are TLV responses on the device's multicast group; every
//! accepted command produces a fresh frame. Channel commands mutate the
//! channel's settable configuration under its lock and bump the epoch so
//! the demodulator picks the change up at its next block boundary.

use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chan::{Chan, DemodKind};
use crate::frontend::Frontend;
use crate::tlv::{self, Tag, TlvReader, PKT_COMMAND};

/// Seconds from the Unix epoch to the GPS epoch, 1980-01-06 00:00:00 UTC.
const GPS_EPOCH_UNIX: i64 = 315_964_800;
/// GPS runs ahead of UTC by the accumulated leap seconds.
const GPS_UTC_OFFSET: i64 = 18;

/// Nanoseconds since the GPS epoch.
pub fn gps_time_ns() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64 - (GPS_EPOCH_UNIX - GPS_UTC_OFFSET) * 1_000_000_000,
        Err(_) => 0,
    }
}

/// Build the per-device status frame (§ fixed tag set: identity, clock,
/// stream parameters, tuning, coverage).
pub fn build_frontend_status(fe: &Frontend) -> Vec<u8> {
    fe.metadata_packets.fetch_add(1, Ordering::Relaxed);

    let mut buf = Vec::with_capacity(256);
    buf.push(tlv::PKT_RESPONSE);
    tlv::encode_int32(&mut buf, Tag::CommandTag, fe.command_tag.load(Ordering::Relaxed));
    tlv::encode_int64(&mut buf, Tag::CommandCount, u64::from(fe.commands.load(Ordering::Relaxed)));
    tlv::encode_int64(&mut buf, Tag::GpsTime, gps_time_ns() as u64);
    if !fe.description.is_empty() {
        tlv::encode_string(&mut buf, Tag::Description, fe.description.as_bytes());
    }
    tlv::encode_int32(&mut buf, Tag::InputSamprate, fe.samprate());
    tlv::encode_int64(
        &mut buf,
        Tag::MetadataPackets,
        fe.metadata_packets.load(Ordering::Relaxed),
    );
    tlv::encode_double(&mut buf, Tag::Calibrate, fe.calibrate.load(Ordering::Relaxed));
    tlv::encode_float(&mut buf, Tag::RfGain, fe.rf_gain.load(Ordering::Relaxed));
    tlv::encode_float(&mut buf, Tag::RfAtten, fe.rf_atten.load(Ordering::Relaxed));
    tlv::encode_double(&mut buf, Tag::RadioFrequency, fe.frequency.load(Ordering::Relaxed));
    tlv::encode_bool(&mut buf, Tag::TuneLock, fe.lock.load(Ordering::Relaxed));
    tlv::encode_byte(&mut buf, Tag::DemodType, DemodKind::Linear.to_tag());
    tlv::encode_int32(&mut buf, Tag::OutputSamprate, fe.samprate());
    tlv::encode_int32(&mut buf, Tag::OutputChannels, 1);
    tlv::encode_bool(&mut buf, Tag::DirectConversion, fe.direct_conversion);
    tlv::encode_float(&mut buf, Tag::LowEdge, fe.min_if.load(Ordering::Relaxed));
    tlv::encode_float(&mut buf, Tag::HighEdge, fe.max_if.load(Ordering::Relaxed));
    tlv::encode_int32(&mut buf, Tag::BitsPerSample, fe.bitspersample);
    tlv::encode_int64(&mut buf, Tag::SamplesSinceStart, fe.samples.load(Ordering::Relaxed));
    tlv::encode_int64(&mut buf, Tag::AdOverranges, fe.overranges.load(Ordering::Relaxed));
    tlv::encode_float(&mut buf, Tag::OutputLevel, fe.output_level.load(Ordering::Relaxed));
    tlv::encode_eol(&mut buf);
    buf
}

/// Build a per-channel status frame.
pub fn build_chan_status(chan: &Chan) -> Vec<u8> {
    let cfg = chan.config();
    let mut buf = Vec::with_capacity(512);
    buf.push(tlv::PKT_RESPONSE);
    tlv::encode_int32(&mut buf, Tag::OutputSsrc, chan.ssrc);
    tlv::encode_int32(&mut buf, Tag::CommandTag, chan.command_tag.load(Ordering::Relaxed));
    tlv::encode_int64(&mut buf, Tag::CommandCount, u64::from(chan.commands.load(Ordering::Relaxed)));
    tlv::encode_int64(&mut buf, Tag::GpsTime, gps_time_ns() as u64);
    tlv::encode_double(&mut buf, Tag::RadioFrequency, cfg.tune.freq);
    tlv::encode_double(&mut buf, Tag::ShiftFrequency, cfg.tune.shift);
    tlv::encode_double(&mut buf, Tag::DopplerFrequency, cfg.tune.doppler);
    tlv::encode_double(&mut buf, Tag::DopplerRate, cfg.tune.doppler_rate);
    tlv::encode_float(&mut buf, Tag::LowEdge, cfg.filter.min_if);
    tlv::encode_float(&mut buf, Tag::HighEdge, cfg.filter.max_if);
    tlv::encode_float(&mut buf, Tag::KaiserBeta, cfg.filter.kaiser_beta);
    tlv::encode_byte(&mut buf, Tag::DemodType, cfg.demod.to_tag());
    tlv::encode_int32(&mut buf, Tag::OutputSamprate, cfg.output.samprate);
    tlv::encode_int32(&mut buf, Tag::OutputChannels, u32::from(cfg.output.channels));
    tlv::encode_float(&mut buf, Tag::Gain, cfg.output.gain);
    tlv::encode_float(&mut buf, Tag::Headroom, cfg.output.headroom);
    if let Some(dest) = cfg.output.dest {
        tlv::encode_socket(&mut buf, Tag::OutputDataDest, &dest);
    }
    tlv::encode_bool(&mut buf, Tag::Envelope, cfg.linear.env);
    tlv::encode_bool(&mut buf, Tag::AgcEnable, cfg.linear.agc);
    tlv::encode_float(&mut buf, Tag::AgcHangtime, cfg.linear.hangtime);
    tlv::encode_float(&mut buf, Tag::AgcRecoveryRate, cfg.linear.recovery_rate);
    tlv::encode_float(&mut buf, Tag::AgcThreshold, cfg.linear.threshold);
    tlv::encode_bool(&mut buf, Tag::PllEnable, cfg.linear.pll);
    tlv::encode_bool(&mut buf, Tag::PllSquare, cfg.linear.square);
    tlv::encode_float(&mut buf, Tag::PllBandwidth, cfg.linear.loop_bw);
    tlv::encode_float(&mut buf, Tag::SquelchOpen, cfg.squelch_open);
    tlv::encode_float(&mut buf, Tag::SquelchClose, cfg.squelch_close);

    let sig = &chan.sig;
    tlv::encode_float(&mut buf, Tag::BasebandPower, sig.bb_power.load(Ordering::Relaxed));
    tlv::encode_float(&mut buf, Tag::NoiseDensity, sig.n0.load(Ordering::Relaxed));
    tlv::encode_float(&mut buf, Tag::FreqOffset, sig.foffset.load(Ordering::Relaxed));
    tlv::encode_float(&mut buf, Tag::Snr, sig.snr.load(Ordering::Relaxed));
    tlv::encode_float(&mut buf, Tag::CarrierPhase, sig.cphase.load(Ordering::Relaxed));
    tlv::encode_bool(&mut buf, Tag::PllLock, sig.pll_lock.load(Ordering::Relaxed));
    // Accumulated since the previous poll; reading resets it
    let energy = sig.output_energy.swap(0.0, Ordering::Relaxed);
    tlv::encode_float(&mut buf, Tag::OutputLevel, energy);
    let lifetime = chan.lifetime.load(Ordering::Relaxed);
    if lifetime > 0 {
        tlv::encode_int64(&mut buf, Tag::Lifetime, lifetime as u64);
    }
    tlv::encode_int64(&mut buf, Tag::BlockDrops, chan.block_drops.load(Ordering::Relaxed));
    tlv::encode_int64(
        &mut buf,
        Tag::SamplesSinceStart,
        chan.output_samples.load(Ordering::Relaxed),
    );
    tlv::encode_eol(&mut buf);
    buf
}

/// Front-end settings parsed out of one command packet body; the caller
/// applies them through the driver, honoring the tuning lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrontendCommand {
    Calibrate(f64),
    RfGain(f32),
    RfAtten(f32),
    Frequency(f64),
}

/// Walk a command body addressed to the front end. Returns the command tag
/// and the recognized settings in wire order.
pub fn parse_frontend_commands(body: &[u8]) -> (u32, Vec<FrontendCommand>) {
    let mut tag = 0u32;
    let mut out = Vec::new();
    for (t, value) in TlvReader::new(body) {
        match t {
            Tag::CommandTag => tag = tlv::decode_int(value) as u32,
            Tag::Calibrate => out.push(FrontendCommand::Calibrate(tlv::decode_double(value))),
            Tag::RfGain => out.push(FrontendCommand::RfGain(tlv::decode_float(value))),
            Tag::RfAtten => out.push(FrontendCommand::RfAtten(tlv::decode_float(value))),
            Tag::RadioFrequency => {
                out.push(FrontendCommand::Frequency(tlv::decode_double(value)))
            }
            _ => {} // not ours
        }
    }
    (tag, out)
}

/// Apply a command body to a channel's settable state. Returns the number
/// of recognized settings; the channel's command counter and tag are
/// updated and the epoch bumped exactly once.
pub fn apply_chan_commands(chan: &Chan, body: &[u8]) -> usize {
    let mut applied = 0;
    let mut new_tag = None;
    let mut lifetime = None;
    chan.update_config(|cfg| {
        for (tag, value) in TlvReader::new(body) {
            applied += 1;
            match tag {
                Tag::CommandTag => {
                    new_tag = Some(tlv::decode_int(value) as u32);
                    applied -= 1;
                }
                Tag::OutputSsrc => {
                    applied -= 1; // addressing, not a setting
                }
                Tag::RadioFrequency => cfg.tune.freq = tlv::decode_double(value),
                Tag::ShiftFrequency => cfg.tune.shift = tlv::decode_double(value),
                Tag::DopplerFrequency => cfg.tune.doppler = tlv::decode_double(value),
                Tag::DopplerRate => cfg.tune.doppler_rate = tlv::decode_double(value),
                Tag::LowEdge => cfg.filter.min_if = tlv::decode_float(value),
                Tag::HighEdge => cfg.filter.max_if = tlv::decode_float(value),
                Tag::KaiserBeta => cfg.filter.kaiser_beta = tlv::decode_float(value),
                Tag::DemodType => {
                    if let Some(kind) = DemodKind::from_tag(tlv::decode_int(value) as u8) {
                        cfg.demod = kind;
                    } else {
                        applied -= 1;
                    }
                }
                Tag::OutputSamprate => cfg.output.samprate = tlv::decode_int(value) as u32,
                Tag::OutputChannels => {
                    let ch = tlv::decode_int(value) as u8;
                    if ch == 1 || ch == 2 {
                        cfg.output.channels = ch;
                    } else {
                        applied -= 1;
                    }
                }
                Tag::Gain => cfg.output.gain = tlv::decode_float(value),
                Tag::Headroom => cfg.output.headroom = tlv::decode_float(value),
                Tag::OutputDataDest => {
                    if let Some(addr) = tlv::decode_socket(value) {
                        cfg.output.dest = Some(addr);
                    } else {
                        applied -= 1;
                    }
                }
                Tag::Envelope => cfg.linear.env = tlv::decode_bool(value),
                Tag::AgcEnable => cfg.linear.agc = tlv::decode_bool(value),
                Tag::AgcHangtime => cfg.linear.hangtime = tlv::decode_float(value),
                Tag::AgcRecoveryRate => cfg.linear.recovery_rate = tlv::decode_float(value),
                Tag::AgcThreshold => cfg.linear.threshold = tlv::decode_float(value),
                Tag::PllEnable => cfg.linear.pll = tlv::decode_bool(value),
                Tag::PllSquare => cfg.linear.square = tlv::decode_bool(value),
                Tag::PllBandwidth => cfg.linear.loop_bw = tlv::decode_float(value),
                Tag::SquelchOpen => cfg.squelch_open = tlv::decode_float(value),
                Tag::SquelchClose => cfg.squelch_close = tlv::decode_float(value),
                Tag::Lifetime => lifetime = Some(tlv::decode_int(value) as i64),
                _ => {
                    applied -= 1; // readout-only or unknown
                }
            }
        }
    });
    if let Some(tag) = new_tag {
        chan.command_tag.store(tag, Ordering::Relaxed);
    }
    if let Some(secs) = lifetime {
        chan.lifetime.store(secs, Ordering::Release);
    }
    chan.commands.fetch_add(1, Ordering::Relaxed);
    applied
}

/// Send an empty poll command, returning the random tag chosen so the
/// caller can match the response.
pub fn send_poll(sock: &UdpSocket, ssrc: u32) -> std::io::Result<u32> {
    let mut buf = Vec::with_capacity(32);
    buf.push(PKT_COMMAND);
    if ssrc != 0 {
        tlv::encode_int32(&mut buf, Tag::OutputSsrc, ssrc);
    }
    let tag: u32 = rand::random();
    tlv::encode_int32(&mut buf, Tag::CommandTag, tag);
    tlv::encode_eol(&mut buf);
    sock.send(&buf)?;
    Ok(tag)
}
