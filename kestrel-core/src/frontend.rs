//! Shared front-end state and the sample-ingest path.
//!
//! One `Frontend` exists per receiver process. Statistical fields are plain
//! atomics: the ingest callback updates them on every burst and everyone
//! else reads them without locking; the values are informational, not
//! authoritative. The only blocking handshake is "sample rate known", a
//! one-shot condition the driver signals once streaming parameters are
//! fixed.

use atomic_float::{AtomicF32, AtomicF64};
use num_complex::Complex32;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::filter::FilterInput;
use crate::status::gps_time_ns;

/// Fallback tuning when neither the config nor the persisted state supplies
/// a frequency.
pub const FALLBACK_FREQUENCY: f64 = 10e6;

const SCALE16: f32 = 1.0 / i16::MAX as f32;

/// Smoothing constant for the exponentially averaged IF power readout.
const IF_POWER_RATE: f32 = 0.05;

/// Process-wide front-end state, shared read-mostly with every channel.
pub struct Frontend {
    pub description: String,
    pub isreal: bool,
    pub direct_conversion: bool,
    pub bitspersample: u32,

    // Tuning & calibration; written by the command path, read everywhere
    pub frequency: AtomicF64,
    pub calibrate: AtomicF64,
    pub lock: AtomicBool,
    pub min_if: AtomicF32,
    pub max_if: AtomicF32,
    pub rf_gain: AtomicF32,
    pub rf_atten: AtomicF32,
    /// Composite voltage gain applied when scaling A/D samples.
    pub gain: AtomicF32,

    // Filter block parameters, fixed once the sample rate is known
    pub filter_l: AtomicUsize,
    pub filter_m: AtomicUsize,

    // Statistical fields, ingest-updated, read without locking
    pub samples: AtomicU64,
    pub dropped_samples: AtomicU64,
    pub overranges: AtomicU64,
    pub output_level: AtomicF32,
    pub if_power: AtomicF32,
    pub timestamp: AtomicI64,

    // Status plane counters
    pub commands: AtomicU32,
    pub command_tag: AtomicU32,
    pub metadata_packets: AtomicU64,

    samprate: AtomicU32, // 0 until the driver reports it
    samprate_mutex: Mutex<()>,
    samprate_cond: Condvar,
}

impl Frontend {
    pub fn new(description: String, isreal: bool, bitspersample: u32) -> Self {
        Frontend {
            description,
            isreal,
            direct_conversion: !isreal,
            bitspersample,
            frequency: AtomicF64::new(0.0),
            calibrate: AtomicF64::new(0.0),
            lock: AtomicBool::new(false),
            min_if: AtomicF32::new(0.0),
            max_if: AtomicF32::new(0.0),
            rf_gain: AtomicF32::new(0.0),
            rf_atten: AtomicF32::new(0.0),
            gain: AtomicF32::new(1.0),
            filter_l: AtomicUsize::new(0),
            filter_m: AtomicUsize::new(0),
            samples: AtomicU64::new(0),
            dropped_samples: AtomicU64::new(0),
            overranges: AtomicU64::new(0),
            output_level: AtomicF32::new(0.0),
            if_power: AtomicF32::new(0.0),
            timestamp: AtomicI64::new(0),
            commands: AtomicU32::new(0),
            command_tag: AtomicU32::new(0),
            metadata_packets: AtomicU64::new(0),
            samprate: AtomicU32::new(0),
            samprate_mutex: Mutex::new(()),
            samprate_cond: Condvar::new(),
        }
    }

    /// Sample rate in Hz; 0 while still unknown.
    pub fn samprate(&self) -> u32 {
        self.samprate.load(Ordering::Acquire)
    }

    /// Driver-side half of the startup handshake.
    pub fn set_samprate(&self, rate: u32) {
        let _guard = self.samprate_mutex.lock().unwrap();
        self.samprate.store(rate, Ordering::Release);
        self.samprate_cond.notify_all();
    }

    /// Block until the driver has reported the sample rate.
    pub fn wait_samprate(&self) -> u32 {
        let mut guard = self.samprate_mutex.lock().unwrap();
        loop {
            let rate = self.samprate.load(Ordering::Acquire);
            if rate != 0 {
                return rate;
            }
            guard = self.samprate_cond.wait(guard).unwrap();
        }
    }
}

/// Decibels to voltage ratio.
pub fn db2voltage(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Voltage ratio to decibels.
pub fn voltage2db(v: f32) -> f32 {
    20.0 * v.log10()
}

/// Compute the integer frequency to program into the device so that the
/// calibrated result lands on `freq`: `round(freq / (1 + calibrate))`.
pub fn device_frequency(freq: f64, calibrate: f64) -> i64 {
    (freq / (1.0 + calibrate)).round() as i64
}

/// The frequency actually realized once the device rounding (`true_freq`)
/// and the calibration ratio are applied.
pub fn actual_frequency(true_freq: f64, calibrate: f64) -> f64 {
    true_freq * (1.0 + calibrate)
}

/// Sample sink handed to the front-end driver; the driver's callback thread
/// calls the accept methods with each burst. Both paths are non-blocking
/// with bounded work: scale, accumulate energy, advance the filter ring.
pub struct Ingest {
    fe: std::sync::Arc<Frontend>,
    input: FilterInput,
}

impl Ingest {
    pub fn new(fe: std::sync::Arc<Frontend>, input: FilterInput) -> Self {
        Ingest { fe, input }
    }

    /// Complex I/Q burst from a direct-sampling front end.
    pub fn accept_complex(&mut self, samples: &[Complex32], dropped: u64) {
        if samples.is_empty() {
            return;
        }
        let mut energy = 0.0f32;
        for s in samples {
            energy += s.norm_sqr();
        }
        self.input.write_complex(samples);
        self.finish_burst(energy / samples.len() as f32, samples.len() as u64, dropped);
    }

    /// Signed 16-bit burst from a real-sampling front end. When the device's
    /// output randomizer is on, a set LSB means all other bits are flipped.
    pub fn accept_real(&mut self, samples: &[i16], randomizer: bool, dropped: u64) {
        if samples.is_empty() {
            return;
        }
        let inv_gain = SCALE16 / self.fe.gain.load(Ordering::Relaxed).max(f32::MIN_POSITIVE);
        let mut energy = 0u64;
        let mut overranges = 0u64;
        let mut scaled = Vec::with_capacity(samples.len());
        for &raw in samples {
            let s = if randomizer {
                raw ^ ((raw & 1).wrapping_mul(-2))
            } else {
                raw
            };
            if s == i16::MAX || s == i16::MIN {
                overranges += 1;
            }
            energy += (i64::from(s) * i64::from(s)) as u64;
            scaled.push(f32::from(s) * inv_gain);
        }
        self.input.write_real(&scaled);
        if overranges > 0 {
            self.fe.overranges.fetch_add(overranges, Ordering::Relaxed);
        }
        // Real sampling: +3 dB to refer the mean square to full scale
        let level = 2.0 * energy as f32 * SCALE16 * SCALE16 / samples.len() as f32;
        self.finish_burst(level, samples.len() as u64, dropped);
    }

    fn finish_burst(&mut self, level: f32, count: u64, dropped: u64) {
        let fe = &self.fe;
        fe.output_level.store(level, Ordering::Relaxed);
        let smoothed =
            fe.if_power.load(Ordering::Relaxed) * (1.0 - IF_POWER_RATE) + level * IF_POWER_RATE;
        fe.if_power.store(smoothed, Ordering::Relaxed);
        fe.samples.fetch_add(count, Ordering::Relaxed);
        if dropped > 0 {
            fe.dropped_samples.fetch_add(dropped, Ordering::Relaxed);
        }
        fe.timestamp.store(gps_time_ns(), Ordering::Relaxed);
    }
}

/// Best-effort persistence of the last tuned frequency, one decimal number
/// per device serial. Written atomically (temp + rename); loss on crash is
/// acceptable.
pub struct FrequencyFile {
    path: PathBuf,
}

impl FrequencyFile {
    pub fn new(state_dir: &Path, serial: &str) -> Self {
        FrequencyFile {
            path: state_dir.join(format!("tune-{serial}")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored frequency; `None` when missing or unparseable, in
    /// which case the caller falls back to [`FALLBACK_FREQUENCY`].
    pub fn load(&self) -> Option<f64> {
        let text = fs::read_to_string(&self.path).ok()?;
        let freq: f64 = text.trim().split_whitespace().next()?.parse().ok()?;
        (freq != 0.0).then_some(freq)
    }

    pub fn store(&self, freq: f64) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{freq:.6}\n"))?;
        fs::rename(&tmp, &self.path)
    }
}

/// Ask for a real-time scheduling class for the current thread. Best
/// effort: returns false (and the thread stays at normal priority) when the
/// process lacks the privilege.
pub fn realtime() -> bool {
    #[cfg(target_os = "linux")]
    {
        let param = libc::sched_param { sched_priority: 10 };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            log::debug!("real-time scheduling unavailable: {}", io::Error::last_os_error());
        }
        rc == 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
