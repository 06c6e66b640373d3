//! Synthetic signal-generator front end.
//!
//! Produces configured test tones plus Gaussian noise at the configured
//! sample rate, delivered through the same burst callback contract a
//! hardware driver uses. Tones are specified as absolute RF frequencies,
//! so retuning the "device" moves them through the passband like real
//! signals.

use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use kestrel_core::errors::{DeviceError, RadioError};
use kestrel_core::frontend::{
    actual_frequency, db2voltage, device_frequency, realtime, Frontend, FrequencyFile, Ingest,
    FALLBACK_FREQUENCY,
};

use super::FrontendDriver;
use crate::config::DeviceConfig;

const DEFAULT_SAMPRATE: u32 = 192_000;
/// Burst length in samples; about 5 ms at the default rate.
const BURST: usize = 1024;

pub struct SigGen {
    fe: Option<Arc<Frontend>>,
    freq_file: Option<FrequencyFile>,
    tones: Vec<f64>,
    amplitude: f32,
    noise: f32,
    samprate: u32,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SigGen {
    pub fn new() -> Self {
        SigGen {
            fe: None,
            freq_file: None,
            tones: Vec::new(),
            amplitude: 0.5,
            noise: 0.0,
            samprate: DEFAULT_SAMPRATE,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    fn frontend(&self) -> &Arc<Frontend> {
        self.fe.as_ref().expect("setup() not called")
    }
}

impl Default for SigGen {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontendDriver for SigGen {
    fn setup(
        &mut self,
        fe: &Arc<Frontend>,
        cfg: &DeviceConfig,
        state_dir: &Path,
    ) -> kestrel_core::Result<()> {
        self.fe = Some(Arc::clone(fe));
        self.samprate = if cfg.samprate == 0 {
            DEFAULT_SAMPRATE
        } else {
            cfg.samprate
        };
        self.tones = cfg.tones.clone();
        self.amplitude = cfg.tone_amplitude;
        self.noise = cfg.noise;

        fe.calibrate.store(cfg.calibrate, Ordering::Relaxed);
        fe.rf_gain.store(cfg.gain, Ordering::Relaxed);
        fe.rf_atten.store(cfg.att, Ordering::Relaxed);
        fe.gain
            .store(db2voltage(cfg.gain - cfg.att), Ordering::Relaxed);
        // Usable IF band, complex sampling: nearly the whole Nyquist span
        let edge = 0.47 * self.samprate as f32;
        fe.min_if.store(-edge, Ordering::Relaxed);
        fe.max_if.store(edge, Ordering::Relaxed);

        if let Err(e) = std::fs::create_dir_all(state_dir) {
            log::warn!("cannot create state dir {}: {}", state_dir.display(), e);
        }
        let serial = cfg.serial.clone().unwrap_or_else(|| "siggen0".into());
        let freq_file = FrequencyFile::new(state_dir, &serial);

        // Config frequency wins and locks tuning; otherwise resume from the
        // persisted state, or fall back
        let mut init_frequency = cfg.frequency;
        if init_frequency != 0.0 {
            fe.lock.store(true, Ordering::Relaxed);
        } else {
            init_frequency = freq_file.load().unwrap_or_else(|| {
                log::info!(
                    "no stored frequency in {}, using fallback",
                    freq_file.path().display()
                );
                FALLBACK_FREQUENCY
            });
        }
        self.freq_file = Some(freq_file);
        let actual = self.tune(init_frequency)?;
        log::info!(
            "siggen {}: {} Hz, {} tones, noise {}",
            serial,
            actual,
            self.tones.len(),
            self.noise
        );

        // Streaming parameters are now final; release anyone waiting
        fe.set_samprate(self.samprate);
        Ok(())
    }

    fn start(&mut self, mut ingest: Ingest) -> kestrel_core::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RadioError::Device(DeviceError::OpenFailed {
                reason: "already streaming".into(),
            }));
        }
        let fe = Arc::clone(self.frontend());
        let running = Arc::clone(&self.running);
        let tones = self.tones.clone();
        let amplitude = self.amplitude;
        let noise = self.noise;
        let samprate = self.samprate;

        let handle = std::thread::Builder::new()
            .name("siggen".into())
            .spawn(move || {
                realtime();
                let mut rng = StdRng::seed_from_u64(0x5e_ed);
                let burst_time = Duration::from_secs_f64(BURST as f64 / f64::from(samprate));
                let mut next = Instant::now();
                let mut sample_index = 0u64;
                let mut burst = vec![Complex32::new(0.0, 0.0); BURST];
                while running.load(Ordering::Acquire) {
                    let center = fe.frequency.load(Ordering::Relaxed);
                    for (i, out) in burst.iter_mut().enumerate() {
                        let t = (sample_index + i as u64) as f64 / f64::from(samprate);
                        let mut s = Complex32::new(0.0, 0.0);
                        for &tone in &tones {
                            let phase = std::f64::consts::TAU * (tone - center) * t;
                            s += Complex32::new(phase.cos() as f32, phase.sin() as f32)
                                * amplitude;
                        }
                        if noise > 0.0 {
                            let ni: f32 = rng.sample(StandardNormal);
                            let nq: f32 = rng.sample(StandardNormal);
                            s += Complex32::new(ni, nq) * noise;
                        }
                        *out = s;
                    }
                    sample_index += BURST as u64;
                    ingest.accept_complex(&burst, 0);

                    next += burst_time;
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    } else {
                        // Fell behind; resynchronize rather than spiral
                        next = now;
                    }
                }
                log::debug!("siggen burst thread exiting");
            })
            .expect("spawn siggen thread");
        self.handle = Some(handle);
        Ok(())
    }

    fn tune(&mut self, freq: f64) -> kestrel_core::Result<f64> {
        let fe = Arc::clone(self.frontend());
        let calibrate = fe.calibrate.load(Ordering::Relaxed);
        let intfreq = device_frequency(freq, calibrate);
        let actual = actual_frequency(self.true_freq(intfreq), calibrate);
        fe.frequency.store(actual, Ordering::Relaxed);
        if let Some(freq_file) = &self.freq_file {
            if let Err(e) = freq_file.store(actual) {
                log::warn!(
                    "cannot write tuner state {}: {}",
                    freq_file.path().display(),
                    e
                );
            }
        }
        Ok(actual)
    }

    fn is_streaming(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::filter::{FilterInput, FilterParams, SpectrumBus};

    fn setup_siggen(cfg: &DeviceConfig) -> (Arc<Frontend>, SigGen, tempdir::Dir) {
        let dir = tempdir::Dir::new();
        let fe = Arc::new(Frontend::new("siggen test".into(), false, 16));
        let mut drv = SigGen::new();
        drv.setup(&fe, cfg, &dir.0).unwrap();
        (fe, drv, dir)
    }

    // Minimal scratch-dir helper so driver tests stay hermetic
    mod tempdir {
        use std::path::PathBuf;

        pub struct Dir(pub PathBuf);

        impl Dir {
            pub fn new() -> Self {
                let path = std::env::temp_dir().join(format!(
                    "kestrel-siggen-{}-{:?}",
                    std::process::id(),
                    std::thread::current().id()
                ));
                let _ = std::fs::remove_dir_all(&path); // stale state from a reused thread id
                std::fs::create_dir_all(&path).unwrap();
                Dir(path)
            }
        }

        impl Drop for Dir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn test_setup_reports_samprate_and_persists_tuning() {
        let cfg = DeviceConfig {
            device: "siggen".into(),
            samprate: 96_000,
            calibrate: 1e-6,
            frequency: 10_000_000.0,
            ..Default::default()
        };
        let (fe, mut drv, dir) = setup_siggen(&cfg);
        assert_eq!(fe.samprate(), 96_000);
        assert!(fe.lock.load(Ordering::Relaxed)); // config frequency locks
        let f = fe.frequency.load(Ordering::Relaxed);
        // intfreq 9,999,990 scaled back up by the calibration ratio
        assert!((f - 9_999_990.0 * (1.0 + 1e-6)).abs() < 1e-3, "{}", f);

        // A fresh driver in the same state dir resumes the stored tuning
        let cfg2 = DeviceConfig {
            device: "siggen".into(),
            ..Default::default()
        };
        let fe2 = Arc::new(Frontend::new(String::new(), false, 16));
        let mut drv2 = SigGen::new();
        drv2.setup(&fe2, &cfg2, &dir.0).unwrap();
        let resumed = fe2.frequency.load(Ordering::Relaxed);
        assert!((resumed - f).abs() < 1.0, "resumed {}", resumed);
        assert!(!fe2.lock.load(Ordering::Relaxed));
        drv.close();
        drv2.close();
    }

    #[test]
    fn test_fallback_frequency_when_no_state() {
        let cfg = DeviceConfig {
            device: "siggen".into(),
            ..Default::default()
        };
        let (fe, mut drv, _dir) = setup_siggen(&cfg);
        assert_eq!(fe.frequency.load(Ordering::Relaxed), FALLBACK_FREQUENCY);
        drv.close();
    }

    #[test]
    fn test_streaming_delivers_tone_bursts() {
        let cfg = DeviceConfig {
            device: "siggen".into(),
            samprate: 48_000,
            frequency: 14_000_000.0,
            tones: vec![14_001_000.0],
            tone_amplitude: 0.5,
            ..Default::default()
        };
        let (fe, mut drv, _dir) = setup_siggen(&cfg);
        let params = FilterParams::derive(48_000, 20.0, 5).unwrap();
        let bus = SpectrumBus::new();
        let ingest = Ingest::new(Arc::clone(&fe), FilterInput::new(params, Arc::clone(&bus)));
        drv.start(ingest).unwrap();
        assert!(drv.is_streaming());

        // Half a second of wall clock is ~23 blocks at 20 ms
        std::thread::sleep(Duration::from_millis(500));
        drv.close();
        assert!(!drv.is_streaming());
        assert!(bus.latest_seq() >= 10, "only {} blocks", bus.latest_seq());
        let level = fe.output_level.load(Ordering::Relaxed);
        // One tone at amplitude 0.5 has mean square 0.25
        assert!((level - 0.25).abs() < 0.05, "level {}", level);
    }
}
