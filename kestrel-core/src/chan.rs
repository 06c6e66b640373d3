//! Channel state and lifecycle.
//!
//! Channels are keyed by a 32-bit SSRC and live in a grow-only table;
//! structural changes take the table mutex, and allocation happens in fixed
//! quanta to bound reallocation. Each live channel runs one demodulator
//! thread that polls the channel's `terminate` flag at block boundaries;
//! `free` raises the flag and joins the thread. A reaper decrements finite
//! lifetimes once per second.

use atomic_float::AtomicF32;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::errors::ChannelError;

/// SSRC 0 is reserved to mean "broadcast / no channel".
pub const SSRC_NONE: u32 = 0;

/// Channel slots are allocated in quanta of this size.
pub const CHANNEL_ALLOC_QUANTUM: usize = 16;

/// Demodulator selector. Only the linear demodulator is implemented in this
/// crate; the other kinds run a null demodulator that keeps the channel's
/// signal statistics alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemodKind {
    Linear,
    Fm,
    Wfm,
    Spectrum,
}

impl DemodKind {
    pub fn name(self) -> &'static str {
        match self {
            DemodKind::Linear => "linear",
            DemodKind::Fm => "fm",
            DemodKind::Wfm => "wfm",
            DemodKind::Spectrum => "spectrum",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "linear" => Some(DemodKind::Linear),
            "fm" => Some(DemodKind::Fm),
            "wfm" => Some(DemodKind::Wfm),
            "spectrum" => Some(DemodKind::Spectrum),
            _ => None,
        }
    }

    /// Wire value used in status frames.
    pub fn to_tag(self) -> u8 {
        match self {
            DemodKind::Linear => 0,
            DemodKind::Fm => 1,
            DemodKind::Wfm => 2,
            DemodKind::Spectrum => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DemodKind::Linear),
            1 => Some(DemodKind::Fm),
            2 => Some(DemodKind::Wfm),
            3 => Some(DemodKind::Spectrum),
            _ => None,
        }
    }
}

/// Tuning set: desired carrier, post-demod shift, Doppler and its rate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    pub freq: f64,
    pub shift: f64,
    pub doppler: f64,
    pub doppler_rate: f64,
}

/// Pre-demod filter edges and window shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Filter edges, Hz relative to the channel center.
    pub min_if: f32,
    pub max_if: f32,
    pub kaiser_beta: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            min_if: -5000.0,
            max_if: 5000.0,
            kaiser_beta: 11.0,
        }
    }
}

/// Linear-demodulator options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearConfig {
    /// Envelope detection instead of the I channel.
    pub env: bool,
    pub agc: bool,
    /// AGC hang time, seconds.
    pub hangtime: f32,
    /// AGC recovery rate, dB/s.
    pub recovery_rate: f32,
    /// AGC threshold above the noise floor, dB.
    pub threshold: f32,
    /// Carrier-tracking PLL.
    pub pll: bool,
    /// Square the PLL input (DSB/BPSK carrier recovery).
    pub square: bool,
    /// PLL loop bandwidth, Hz.
    pub loop_bw: f32,
    /// Drive the lock detector from the squelch thresholds instead of the
    /// sign of the measured SNR.
    pub snr_squelch: bool,
}

impl Default for LinearConfig {
    fn default() -> Self {
        LinearConfig {
            env: false,
            agc: true,
            hangtime: 1.1,
            recovery_rate: 20.0,
            threshold: -15.0,
            pll: false,
            square: false,
            loop_bw: 50.0,
            snr_squelch: false,
        }
    }
}

/// Audio output settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub samprate: u32,
    /// 1 = mono, 2 = stereo.
    pub channels: u8,
    /// Digital gain, voltage ratio.
    pub gain: f32,
    /// Target peak level, fraction of full scale (voltage ratio).
    pub headroom: f32,
    pub dest: Option<SocketAddr>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            samprate: 12_000,
            channels: 1,
            gain: 1.0,
            headroom: 0.316, // -10 dBFS
            dest: None,
        }
    }
}

/// The settable half of a channel, mutated by the command plane and
/// snapshotted by the demodulator thread at block boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChanConfig {
    pub tune: Tuning,
    pub filter: FilterConfig,
    pub demod: DemodKind,
    pub linear: LinearConfig,
    pub output: OutputConfig,
    /// Squelch thresholds, power ratios.
    pub squelch_open: f32,
    pub squelch_close: f32,
}

impl Default for ChanConfig {
    fn default() -> Self {
        ChanConfig {
            tune: Tuning::default(),
            filter: FilterConfig::default(),
            demod: DemodKind::Linear,
            linear: LinearConfig::default(),
            output: OutputConfig::default(),
            squelch_open: 6.31,  // ~8 dB
            squelch_close: 3.98, // ~6 dB
        }
    }
}

/// Per-channel signal measurements, written by the demod thread and read by
/// the status plane without locking.
#[derive(Debug, Default)]
pub struct SigStats {
    /// Baseband power after the filter, before digital gain.
    pub bb_power: AtomicF32,
    /// Frequency offset from the PLL, Hz.
    pub foffset: AtomicF32,
    /// SNR power ratio; NaN when unmeasurable.
    pub snr: AtomicF32,
    /// Carrier phase, radians.
    pub cphase: AtomicF32,
    /// Estimated noise density.
    pub n0: AtomicF32,
    /// Output energy accumulated since the last status poll.
    pub output_energy: AtomicF32,
    pub pll_lock: AtomicBool,
}

/// One receiver channel.
pub struct Chan {
    pub ssrc: u32,
    inuse: AtomicBool,
    pub terminate: AtomicBool,
    /// Remaining lifetime in seconds; 0 means no expiry.
    pub lifetime: AtomicI64,
    config: Mutex<ChanConfig>,
    epoch: AtomicU64,
    pub sig: SigStats,
    pub commands: AtomicU32,
    pub command_tag: AtomicU32,
    pub blocks: AtomicU64,
    pub block_drops: AtomicU64,
    pub output_samples: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Chan {
    fn new(ssrc: u32) -> Self {
        Chan {
            ssrc,
            inuse: AtomicBool::new(true),
            terminate: AtomicBool::new(false),
            lifetime: AtomicI64::new(0),
            config: Mutex::new(ChanConfig::default()),
            epoch: AtomicU64::new(1),
            sig: SigStats::default(),
            commands: AtomicU32::new(0),
            command_tag: AtomicU32::new(0),
            blocks: AtomicU64::new(0),
            block_drops: AtomicU64::new(0),
            output_samples: AtomicU64::new(0),
            thread: Mutex::new(None),
        }
    }

    pub fn inuse(&self) -> bool {
        self.inuse.load(Ordering::Acquire)
    }

    /// Snapshot of the settable state.
    pub fn config(&self) -> ChanConfig {
        self.config.lock().unwrap().clone()
    }

    /// Mutate the settable state and bump the epoch so the demod thread
    /// picks the change up at its next block boundary.
    pub fn update_config<F: FnOnce(&mut ChanConfig)>(&self, f: F) {
        let mut cfg = self.config.lock().unwrap();
        f(&mut cfg);
        self.epoch.fetch_add(1, Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn attach_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock().unwrap() = Some(handle);
    }
}

/// Grow-only table of channels keyed by SSRC.
pub struct ChannelTable {
    slots: Mutex<Vec<Arc<Chan>>>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTable {
    pub fn new() -> Self {
        ChannelTable {
            slots: Mutex::new(Vec::with_capacity(CHANNEL_ALLOC_QUANTUM)),
        }
    }

    /// Create a channel; fails when the SSRC is reserved or already live.
    pub fn create(&self, ssrc: u32) -> Result<Arc<Chan>, ChannelError> {
        if ssrc == SSRC_NONE {
            return Err(ChannelError::ReservedSsrc);
        }
        let mut slots = self.slots.lock().unwrap();
        let mut reusable = None;
        for (i, chan) in slots.iter().enumerate() {
            if chan.inuse() {
                if chan.ssrc == ssrc {
                    return Err(ChannelError::SsrcInUse { ssrc });
                }
            } else if reusable.is_none() && Arc::strong_count(chan) == 1 {
                reusable = Some(i);
            }
        }
        if let Some(i) = reusable {
            // Dead slots whose threads are fully gone can change identity
            let chan = Arc::new(Chan::new(ssrc));
            slots[i] = Arc::clone(&chan);
            return Ok(chan);
        }
        if slots.len() == slots.capacity() {
            slots.reserve(CHANNEL_ALLOC_QUANTUM);
        }
        let chan = Arc::new(Chan::new(ssrc));
        slots.push(Arc::clone(&chan));
        Ok(chan)
    }

    pub fn lookup(&self, ssrc: u32) -> Option<Arc<Chan>> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .find(|c| c.inuse() && c.ssrc == ssrc)
            .map(Arc::clone)
    }

    /// Lookup-or-create with defaults.
    pub fn setup(&self, ssrc: u32) -> Result<Arc<Chan>, ChannelError> {
        if let Some(chan) = self.lookup(ssrc) {
            return Ok(chan);
        }
        self.create(ssrc)
    }

    /// Raise terminate, join the demod thread, release the slot.
    pub fn free(&self, chan: &Arc<Chan>) {
        chan.terminate.store(true, Ordering::Release);
        let handle = chan.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.join() {
                log::error!("demod thread for ssrc {:#010x} panicked: {:?}", chan.ssrc, e);
            }
        }
        chan.inuse.store(false, Ordering::Release);
        log::info!("channel {:#010x} freed", chan.ssrc);
    }

    /// Snapshot of all live channels.
    pub fn active(&self) -> Vec<Arc<Chan>> {
        let slots = self.slots.lock().unwrap();
        slots.iter().filter(|c| c.inuse()).map(Arc::clone).collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|c| c.inuse()).count()
    }

    /// One reaper tick: decrement positive lifetimes, free the expired.
    pub fn reap_expired(&self) {
        for chan in self.active() {
            let remaining = chan.lifetime.load(Ordering::Acquire);
            if remaining > 0 && chan.lifetime.fetch_sub(1, Ordering::AcqRel) == 1 {
                log::info!("channel {:#010x} lifetime expired", chan.ssrc);
                self.free(&chan);
            }
        }
    }
}

/// Run the lifetime reaper until `shutdown` is dropped or signalled.
pub fn reaper_loop(table: Arc<ChannelTable>, shutdown: crossbeam::channel::Receiver<()>) {
    let tick = crossbeam::channel::tick(Duration::from_secs(1));
    loop {
        crossbeam::select! {
            recv(tick) -> _ => table.reap_expired(),
            recv(shutdown) -> _ => return,
        }
    }
}

/// Spawn the reaper thread; dropping (or signalling) the returned sender
/// stops it.
pub fn spawn_reaper(
    table: Arc<ChannelTable>,
) -> (crossbeam::channel::Sender<()>, JoinHandle<()>) {
    let (tx, rx) = crossbeam::channel::bounded(1);
    let handle = std::thread::Builder::new()
        .name("chan-reaper".into())
        .spawn(move || reaper_loop(table, rx))
        .expect("spawn reaper");
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_lookup_setup() {
        let table = ChannelTable::new();
        assert!(table.lookup(42).is_none());
        let chan = table.create(42).unwrap();
        assert_eq!(chan.ssrc, 42);
        assert!(matches!(
            table.create(42),
            Err(ChannelError::SsrcInUse { ssrc: 42 })
        ));
        let again = table.setup(42).unwrap();
        assert!(Arc::ptr_eq(&chan, &again));
        assert_eq!(table.active_count(), 1);
    }

    #[test]
    fn test_ssrc_zero_reserved() {
        let table = ChannelTable::new();
        assert!(matches!(table.create(0), Err(ChannelError::ReservedSsrc)));
        assert!(table.setup(0).is_err());
    }

    #[test]
    fn test_free_releases_slot_for_reuse() {
        let table = ChannelTable::new();
        let chan = table.create(7).unwrap();
        table.free(&chan);
        assert!(chan.terminate.load(Ordering::Acquire));
        assert!(table.lookup(7).is_none());
        drop(chan);
        let other = table.create(8).unwrap();
        assert_eq!(other.ssrc, 8);
        assert_eq!(table.active_count(), 1);
        // The freed slot was recycled rather than grown past
        assert_eq!(table.slots.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_free_joins_thread() {
        let table = ChannelTable::new();
        let chan = table.create(9).unwrap();
        let c2 = Arc::clone(&chan);
        chan.attach_thread(std::thread::spawn(move || {
            while !c2.terminate.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }));
        table.free(&chan);
        assert!(!chan.inuse());
    }

    #[test]
    fn test_epoch_bumps_on_update() {
        let chan = Chan::new(1);
        let before = chan.epoch();
        chan.update_config(|cfg| cfg.tune.freq = 7_074_000.0);
        assert!(chan.epoch() > before);
        assert_eq!(chan.config().tune.freq, 7_074_000.0);
    }

    #[test]
    fn test_reaper_counts_down_and_frees() {
        let table = ChannelTable::new();
        let chan = table.create(5).unwrap();
        chan.lifetime.store(2, Ordering::Release);
        table.reap_expired();
        assert!(table.lookup(5).is_some());
        table.reap_expired();
        assert!(table.lookup(5).is_none());
        // Immortal channels never expire
        let chan2 = table.create(6).unwrap();
        for _ in 0..10 {
            table.reap_expired();
        }
        assert!(table.lookup(6).is_some());
        drop(chan);
        drop(chan2);
    }
}
