//! TOML configuration for the receiver daemon.
//!
//! One `[global]` section, one `[device]` section and any number of
//! `[[channel]]` sections. Every key has a safe default so a minimal
//! config is just a device name.

use color_eyre::eyre::{eyre, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use kestrel_core::chan::{ChanConfig, DemodKind};
use kestrel_core::multicast;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GlobalConfig {
    /// Filter block duration, milliseconds.
    pub blocktime: f64,
    /// Forward FFT overlap factor.
    pub overlap: usize,
    /// Multicast group for the status/command plane.
    pub status: String,
    pub ttl: u32,
    /// Directory for persisted per-device state.
    pub state_dir: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            blocktime: 20.0,
            overlap: 5,
            status: "239.251.8.1:5006".into(),
            ttl: 1,
            state_dir: PathBuf::from("/var/lib/kestrel"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeviceConfig {
    pub device: String,
    pub serial: Option<String>,
    /// 0 lets the driver pick its default.
    pub samprate: u32,
    /// Clock error ratio, ppm scale.
    pub calibrate: f64,
    /// Initial tuning; 0 falls back to the persisted frequency.
    pub frequency: f64,
    pub description: String,
    /// Per-device status group override.
    pub status: Option<String>,
    pub ttl: u32,
    pub firmware: Option<String>,
    pub queuedepth: usize,
    pub reqsize: usize,
    pub dither: bool,
    pub rand: bool,
    pub att: f32,
    pub gain: f32,
    pub gainmode: String,
    pub hf_agc: bool,
    pub agc_thresh: bool,
    pub hf_att: bool,
    pub hf_lna: bool,
    pub lib_dsp: bool,

    // Signal-generator driver
    /// Test tones, absolute RF Hz.
    pub tones: Vec<f64>,
    pub tone_amplitude: f32,
    /// AWGN standard deviation per I/Q rail.
    pub noise: f32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            device: String::new(),
            serial: None,
            samprate: 0,
            calibrate: 0.0,
            frequency: 0.0,
            description: String::new(),
            status: None,
            ttl: 1,
            firmware: None,
            queuedepth: 16,
            reqsize: 8,
            dither: false,
            rand: false,
            att: 0.0,
            gain: 1.5,
            gainmode: "high".into(),
            hf_agc: false,
            agc_thresh: false,
            hf_att: false,
            hf_lna: false,
            lib_dsp: true,
            tones: Vec::new(),
            tone_amplitude: 0.5,
            noise: 0.0,
        }
    }
}

/// Statically configured channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ChannelSection {
    pub ssrc: u32,
    pub frequency: f64,
    /// Mode preset; see [`apply_preset`].
    pub mode: String,
    pub samprate: u32,
    /// Explicit filter edges override the preset's.
    pub low: Option<f32>,
    pub high: Option<f32>,
    /// Audio destination, "host:port".
    pub data: Option<String>,
    /// Seconds until the channel is reaped; 0 = permanent.
    pub lifetime: i64,
}

impl Default for ChannelSection {
    fn default() -> Self {
        ChannelSection {
            ssrc: 0,
            frequency: 0.0,
            mode: "usb".into(),
            samprate: 12_000,
            low: None,
            high: None,
            data: None,
            lifetime: 0,
        }
    }
}

impl ChannelSection {
    pub fn to_chan_config(&self) -> Result<ChanConfig> {
        let mut cfg = ChanConfig::default();
        cfg.tune.freq = self.frequency;
        cfg.output.samprate = self.samprate;
        apply_preset(&mut cfg, &self.mode)
            .ok_or_else(|| eyre!("unknown mode preset {:?}", self.mode))?;
        if let Some(low) = self.low {
            cfg.filter.min_if = low;
        }
        if let Some(high) = self.high {
            cfg.filter.max_if = high;
        }
        if let Some(data) = &self.data {
            let addr: SocketAddr = multicast::resolve(data, 5004)
                .wrap_err_with(|| format!("bad data destination {data:?}"))?;
            cfg.output.dest = Some(addr);
        }
        Ok(cfg)
    }
}

/// Seed a channel config from a mode name. Edges and flags follow amateur
/// practice; anything unusual is set explicitly in the channel section.
pub fn apply_preset(cfg: &mut ChanConfig, mode: &str) -> Option<()> {
    match mode.to_ascii_lowercase().as_str() {
        "usb" => {
            cfg.filter.min_if = 100.0;
            cfg.filter.max_if = 3000.0;
        }
        "lsb" => {
            cfg.filter.min_if = -3000.0;
            cfg.filter.max_if = -100.0;
        }
        "cwu" => {
            cfg.filter.min_if = -200.0;
            cfg.filter.max_if = 200.0;
            cfg.tune.shift = 700.0;
        }
        "cwl" => {
            cfg.filter.min_if = -200.0;
            cfg.filter.max_if = 200.0;
            cfg.tune.shift = -700.0;
        }
        "am" => {
            cfg.filter.min_if = -5000.0;
            cfg.filter.max_if = 5000.0;
            cfg.linear.env = true;
        }
        "cam" => {
            // Coherent AM: carrier-tracking PLL with envelope output
            cfg.filter.min_if = -5000.0;
            cfg.filter.max_if = 5000.0;
            cfg.linear.env = true;
            cfg.linear.pll = true;
        }
        "dsb" => {
            cfg.filter.min_if = -5000.0;
            cfg.filter.max_if = 5000.0;
            cfg.linear.pll = true;
            cfg.linear.square = true;
        }
        "iq" => {
            cfg.filter.min_if = -5000.0;
            cfg.filter.max_if = 5000.0;
            cfg.output.channels = 2;
            cfg.linear.agc = false;
        }
        "spectrum" => {
            cfg.demod = DemodKind::Spectrum;
        }
        _ => return None,
    }
    Some(())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub global: GlobalConfig,
    pub device: DeviceConfig,
    #[serde(rename = "channel")]
    pub channels: Vec<ChannelSection>,
}

pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read config {}", path.display()))?;
    let cfg: Config = toml::from_str(&text)
        .wrap_err_with(|| format!("cannot parse config {}", path.display()))?;
    if cfg.device.device.is_empty() {
        return Err(eyre!("config has no [device] section with a device name"));
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [device]
            device = "siggen"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.global.blocktime, 20.0);
        assert_eq!(cfg.global.overlap, 5);
        assert_eq!(cfg.device.queuedepth, 16);
        assert_eq!(cfg.device.gainmode, "high");
        assert!(cfg.device.lib_dsp);
        assert!(cfg.channels.is_empty());
    }

    #[test]
    fn test_kebab_case_device_keys() {
        let cfg: Config = toml::from_str(
            r#"
            [device]
            device = "siggen"
            hf-agc = true
            agc-thresh = true
            lib-dsp = false
            tone-amplitude = 0.25
            "#,
        )
        .unwrap();
        assert!(cfg.device.hf_agc);
        assert!(cfg.device.agc_thresh);
        assert!(!cfg.device.lib_dsp);
        assert_eq!(cfg.device.tone_amplitude, 0.25);
    }

    #[test]
    fn test_channel_sections_and_presets() {
        let cfg: Config = toml::from_str(
            r#"
            [device]
            device = "siggen"

            [[channel]]
            ssrc = 1
            frequency = 14074000.0
            mode = "usb"
            data = "239.251.9.1:5004"

            [[channel]]
            ssrc = 2
            frequency = 7074000.0
            mode = "lsb"
            low = -2700.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.channels.len(), 2);
        let c1 = cfg.channels[0].to_chan_config().unwrap();
        assert_eq!(c1.filter.min_if, 100.0);
        assert_eq!(c1.filter.max_if, 3000.0);
        assert!(c1.output.dest.is_some());
        let c2 = cfg.channels[1].to_chan_config().unwrap();
        assert_eq!(c2.filter.min_if, -2700.0); // explicit edge wins
        assert_eq!(c2.filter.max_if, -100.0);
    }

    #[test]
    fn test_unknown_preset_rejected() {
        let section = ChannelSection {
            mode: "chirp".into(),
            ..Default::default()
        };
        assert!(section.to_chan_config().is_err());
    }

    #[test]
    fn test_preset_flags() {
        let mut cfg = ChanConfig::default();
        apply_preset(&mut cfg, "dsb").unwrap();
        assert!(cfg.linear.pll);
        assert!(cfg.linear.square);

        let mut cfg = ChanConfig::default();
        apply_preset(&mut cfg, "cwu").unwrap();
        assert_eq!(cfg.tune.shift, 700.0);
    }
}
