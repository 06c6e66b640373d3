//! Linear demodulator: SSB, CW, DSB, coherent AM and raw I/Q.
//!
//! Each block from the channelizer makes two passes. The first runs the
//! optional carrier-tracking PLL (with optional squaring for suppressed
//! carriers), measures SNR from the in-phase/quadrature power split and
//! drives the hysteretic lock detector. The second applies the digital
//! gain per sample, so AGC transitions spread smoothly across the block
//! instead of stepping at its boundary.

use num_complex::Complex32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::chan::{Chan, ChanConfig, DemodKind};
use crate::filter::{compute_tuning, BlockStatus, FilterOutput, FilterParams, SpectrumBus};
use crate::frontend::{realtime, Frontend};
use crate::osc::{LockDetector, Osc, Pll, DEFAULT_PLL_DAMPING, DEFAULT_PLL_LOCKTIME};
use crate::output::PcmSender;

/// How long a block wait may park before the terminate flag is rechecked.
const BLOCK_POLL: Duration = Duration::from_millis(100);

/// Slow upward creep of the noise-floor tracker, per block.
const N0_CREEP: f32 = 1.001;

/// Outcome of one processed block.
#[derive(Debug, Clone, Copy)]
pub struct BlockResult {
    pub mute: bool,
    /// Mean output power per sample (mono referred to full-scale peak).
    pub output_power: f32,
}

/// Per-thread linear demodulator state. Kept separate from the thread loop
/// so block processing stays synchronously testable.
pub struct LinearDemod {
    out_samprate: u32,
    olen: usize,
    cfg: ChanConfig,

    pll: Pll,
    lock: LockDetector,
    pll_was_on: bool,
    fine: Osc,
    shift: Osc,

    gain: f32,
    hangcount: i32,
    hang_blocks: i32,
    recovery_per_block: f32, // voltage ratio
    threshold_v: f32,        // voltage ratio

    n0: f32,
    n0_smooth: f32,

    last_bb_power: f32,
    last_snr: f32,

    /// Interleaved audio produced by the latest block.
    pub audio: Vec<f32>,
}

impl LinearDemod {
    pub fn new(out_samprate: u32, olen: usize, cfg: &ChanConfig) -> Self {
        let lock_limit = (DEFAULT_PLL_LOCKTIME * out_samprate as f32) as i64;
        let mut demod = LinearDemod {
            out_samprate,
            olen,
            cfg: cfg.clone(),
            pll: Pll::new(out_samprate as f32),
            lock: LockDetector::new(lock_limit),
            pll_was_on: false,
            fine: Osc::new(),
            shift: Osc::new(),
            gain: cfg.output.gain,
            hangcount: 0,
            hang_blocks: 0,
            recovery_per_block: 1.0,
            threshold_v: 1.0,
            n0: 0.0,
            n0_smooth: 0.0,
            last_bb_power: 0.0,
            last_snr: f32::NAN,
            audio: Vec::with_capacity(2 * olen),
        };
        demod.apply_config(cfg);
        demod
    }

    /// Refresh settable parameters; loop state (gain, PLL, noise tracker)
    /// carries across so a retune does not click.
    pub fn apply_config(&mut self, cfg: &ChanConfig) {
        let block_time = self.olen as f32 / self.out_samprate as f32;
        self.hang_blocks = (cfg.linear.hangtime / block_time).round() as i32;
        self.recovery_per_block = 10f32.powf(cfg.linear.recovery_rate * block_time / 20.0);
        self.threshold_v = 10f32.powf(cfg.linear.threshold / 20.0);
        self.cfg = cfg.clone();
    }

    /// Program the fine oscillator with the sub-bin remainder (Hz) and the
    /// Doppler sweep rate (Hz/s).
    pub fn set_fine(&mut self, remainder_hz: f64, doppler_rate: f64) {
        let rate = f64::from(self.out_samprate);
        self.fine.set(remainder_hz / rate, doppler_rate / (rate * rate));
    }

    /// Track the noise floor: fast to follow drops, slow creep upward so a
    /// carrier parked in the passband does not capture it.
    fn update_n0(&mut self, bb_power: f32, bw: f32) -> f32 {
        let density = bb_power / bw.max(1.0);
        if self.n0_smooth == 0.0 {
            self.n0_smooth = density;
        } else {
            self.n0_smooth += 0.1 * (density - self.n0_smooth);
        }
        if self.n0 == 0.0 || self.n0_smooth < self.n0 {
            self.n0 = self.n0_smooth;
        } else {
            self.n0 *= N0_CREEP;
        }
        self.n0
    }

    /// Per-block AGC decision; returns the per-sample gain factor.
    fn agc_gain_change(&mut self, bb_power: f32, n0: f32) -> f32 {
        if !self.cfg.linear.agc {
            return 1.0;
        }
        let n = self.olen as f32;
        let headroom = self.cfg.output.headroom;
        let bw = (self.cfg.filter.max_if - self.cfg.filter.min_if).abs();
        let bn = (bw * n0).sqrt(); // noise amplitude
        let ampl = bb_power.sqrt();

        if ampl * self.gain > headroom {
            // Strong signal: reach the headroom target by the end of this
            // block, then hang
            let newgain = headroom / ampl;
            self.hangcount = self.hang_blocks;
            (newgain / self.gain).powf(1.0 / n)
        } else if bn * self.gain > self.threshold_v * headroom {
            // Noise over threshold: same smooth reduction
            let newgain = self.threshold_v * headroom / bn;
            (newgain / self.gain).powf(1.0 / n)
        } else if self.hangcount > 0 {
            self.hangcount -= 1;
            1.0
        } else {
            self.recovery_per_block.powf(1.0 / n)
        }
    }

    /// Process one downconverted block in place and fill [`audio`](Self::audio).
    pub fn process_block(&mut self, buffer: &mut [Complex32]) -> BlockResult {
        let n = buffer.len();
        debug_assert_eq!(n, self.olen);

        // Fine frequency shift (sub-bin remainder plus Doppler)
        if !self.fine.is_idle() {
            for s in buffer.iter_mut() {
                let p = self.fine.step();
                *s *= Complex32::new(p.re as f32, p.im as f32);
            }
        }

        let bb_power = buffer.iter().map(|s| s.norm_sqr()).sum::<f32>() / n as f32;
        self.last_bb_power = bb_power;
        let bw = (self.cfg.filter.max_if - self.cfg.filter.min_if).abs();
        let n0 = self.update_n0(bb_power, bw);

        // First pass: PLL
        let mut snr_readout = f32::NAN;
        let mut raw_snr = 0.0f32;
        let mut have_snr = false;
        if self.cfg.linear.pll {
            if !self.pll_was_on {
                self.pll.reset();
                self.pll_was_on = true;
            }
            self.pll
                .set_params(self.cfg.linear.loop_bw, DEFAULT_PLL_DAMPING);
            let mut signal = 0.0f32;
            let mut noise = 0.0f32;
            for s in buffer.iter_mut() {
                *s *= self.pll.phasor().conj();
                let phase = if self.cfg.linear.square {
                    (*s * *s).arg()
                } else {
                    s.arg()
                };
                self.pll.run(phase);
                // In-phase power is signal + noise, quadrature is noise
                signal += s.re * s.re;
                noise += s.im * s.im;
            }
            if noise != 0.0 {
                raw_snr = signal / noise - 1.0;
                snr_readout = raw_snr.max(0.0);
                have_snr = true;
            }
            let vote = if self.cfg.linear.snr_squelch {
                if raw_snr > self.cfg.squelch_open {
                    1
                } else if raw_snr < self.cfg.squelch_close {
                    -1
                } else {
                    0
                }
            } else if !have_snr {
                0
            } else if raw_snr > 0.0 {
                1
            } else if raw_snr < 0.0 {
                -1
            } else {
                0
            };
            self.lock.update(vote, n as i64);
        } else {
            self.pll_was_on = false;
        }

        // Post-demod shift, e.g. a CW offset tone. Runs after the PLL,
        // which only operates at DC.
        self.shift
            .set(self.cfg.tune.shift / f64::from(self.out_samprate), 0.0);
        if !self.shift.is_idle() {
            for s in buffer.iter_mut() {
                let p = self.shift.step();
                *s *= Complex32::new(p.re as f32, p.im as f32);
            }
        }

        let gain_change = self.agc_gain_change(bb_power, n0);

        // Second pass: demodulate, apply gain, accumulate output energy
        self.audio.clear();
        let mut output_power = 0.0f32;
        let env = self.cfg.linear.env;
        if self.cfg.output.channels == 1 {
            for s in buffer.iter() {
                let v = if env {
                    s.norm() * self.gain
                } else {
                    s.re * self.gain
                };
                output_power += v * v;
                self.audio.push(v);
                self.gain *= gain_change;
            }
            // +3 dB: mono full scale is 1 unit peak, not RMS
            output_power = 2.0 * output_power / n as f32;
        } else {
            for s in buffer.iter() {
                let (l, r) = if env {
                    // I on the left, envelope on the right (+6 dB empirical)
                    (s.re * self.gain, s.norm() * 2.0 * self.gain)
                } else {
                    (s.re * self.gain, s.im * self.gain)
                };
                output_power += l * l + r * r;
                self.audio.push(l);
                self.audio.push(r);
                self.gain *= gain_change;
            }
            output_power /= n as f32;
        }

        // Mute on dead air, or use the PLL as an AM carrier squelch
        let mut mute = output_power == 0.0;
        if self.cfg.linear.pll && !self.lock.locked() {
            mute = true;
        }

        self.last_snr = snr_readout;
        BlockResult { mute, output_power }
    }

    pub fn pll_locked(&self) -> bool {
        self.lock.locked()
    }

    pub fn pll_freq(&self) -> f32 {
        self.pll.freq()
    }

    /// Carrier phase readout, halved when squaring doubles it.
    pub fn carrier_phase(&self) -> f32 {
        let phase = self.pll.phasor().arg();
        if self.cfg.linear.square {
            phase / 2.0
        } else {
            phase
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn noise_density(&self) -> f32 {
        self.n0
    }

    /// Export the latest block's measurements to the channel's shared
    /// statistics.
    pub fn publish_stats(&self, chan: &Chan, result: &BlockResult) {
        let sig = &chan.sig;
        sig.bb_power.store(self.last_bb_power, Ordering::Relaxed);
        sig.n0.store(self.n0, Ordering::Relaxed);
        sig.snr.store(self.last_snr, Ordering::Relaxed);
        if self.cfg.linear.pll {
            sig.foffset.store(self.pll.freq(), Ordering::Relaxed);
            sig.cphase.store(self.carrier_phase(), Ordering::Relaxed);
            sig.pll_lock.store(self.lock.locked(), Ordering::Relaxed);
        }
        let prev = sig.output_energy.load(Ordering::Relaxed);
        sig.output_energy
            .store(prev + result.output_power, Ordering::Relaxed);
    }
}

/// Compute the per-block output length for a channel. The output sample
/// rate must land on the block grid: `out_rate · L ≡ 0 (mod samprate)`.
pub fn output_block_length(out_samprate: u32, params: FilterParams, samprate: u32) -> Option<usize> {
    let num = u64::from(out_samprate) * params.l as u64;
    if samprate == 0 || num % u64::from(samprate) != 0 {
        return None;
    }
    Some((num / u64::from(samprate)) as usize)
}

/// Spawn the demodulator thread appropriate to the channel's configured
/// kind and attach it to the channel.
pub fn start_demod(
    chan: &Arc<Chan>,
    fe: &Arc<Frontend>,
    bus: &Arc<SpectrumBus>,
    params: FilterParams,
) {
    let kind = chan.config().demod;
    let chan2 = Arc::clone(chan);
    let fe2 = Arc::clone(fe);
    let bus2 = Arc::clone(bus);
    let name = format!("{} {:x}", kind.name(), chan.ssrc);
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || match kind {
            DemodKind::Linear => run_linear(chan2, fe2, bus2, params),
            _ => run_null(chan2, fe2, bus2, params),
        })
        .expect("spawn demod thread");
    chan.attach_thread(handle);
}

/// Linear demodulator thread body.
fn run_linear(chan: Arc<Chan>, fe: Arc<Frontend>, bus: Arc<SpectrumBus>, params: FilterParams) {
    realtime();
    let samprate = fe.samprate();
    let mut cfg = chan.config();
    let mut epoch = chan.epoch();

    let olen = match output_block_length(cfg.output.samprate, params, samprate) {
        Some(olen) => olen,
        None => {
            log::error!(
                "ssrc {:#010x}: output rate {} incompatible with block grid",
                chan.ssrc,
                cfg.output.samprate
            );
            return;
        }
    };
    let mut out = match FilterOutput::new(bus, params, samprate, olen) {
        Ok(out) => out,
        Err(e) => {
            log::error!("ssrc {:#010x}: {}", chan.ssrc, e);
            return;
        }
    };
    let mut sender = match PcmSender::new(cfg.output.dest) {
        Ok(sender) => sender,
        Err(e) => {
            log::error!("ssrc {:#010x}: output socket: {}", chan.ssrc, e);
            return;
        }
    };
    let mut demod = LinearDemod::new(cfg.output.samprate, olen, &cfg);

    let retune = |out: &mut FilterOutput, demod: &mut LinearDemod, cfg: &ChanConfig| {
        let if_freq =
            cfg.tune.freq + cfg.tune.doppler - fe.frequency.load(Ordering::Relaxed);
        let (bin_shift, remainder) = compute_tuning(params.n(), samprate, if_freq);
        out.retune(bin_shift);
        // Negated: the fine oscillator removes the residual, not adds it
        demod.set_fine(-remainder, -cfg.tune.doppler_rate);
        let rate = cfg.output.samprate as f32;
        out.set_response(
            cfg.filter.min_if / rate,
            cfg.filter.max_if / rate,
            cfg.filter.kaiser_beta,
        );
    };
    retune(&mut out, &mut demod, &cfg);
    log::info!(
        "ssrc {:#010x}: linear demod at {:.0} Hz, {} Hz out",
        chan.ssrc,
        cfg.tune.freq,
        cfg.output.samprate
    );

    while !chan.terminate.load(Ordering::Acquire) {
        if chan.epoch() != epoch {
            epoch = chan.epoch();
            let newcfg = chan.config();
            if newcfg.output.samprate != cfg.output.samprate
                || newcfg.output.channels != cfg.output.channels
            {
                // Block grid changes require a restart by the control plane
                log::warn!(
                    "ssrc {:#010x}: output format change ignored at runtime",
                    chan.ssrc
                );
            }
            if newcfg.output.dest != cfg.output.dest {
                match PcmSender::new(newcfg.output.dest) {
                    Ok(s) => sender = s,
                    Err(e) => {
                        log::error!("ssrc {:#010x}: output socket: {}", chan.ssrc, e);
                        break;
                    }
                }
            }
            demod.apply_config(&newcfg);
            cfg = newcfg;
            retune(&mut out, &mut demod, &cfg);
        }
        match out.next_block(BLOCK_POLL) {
            BlockStatus::TimedOut => continue,
            BlockStatus::Ready => {}
        }
        let result = demod.process_block(&mut out.output);
        demod.publish_stats(&chan, &result);
        chan.blocks.fetch_add(1, Ordering::Relaxed);
        chan.block_drops.store(out.dropped, Ordering::Relaxed);
        if let Err(e) = sender.send(&demod.audio, cfg.output.channels, result.mute) {
            log::warn!("ssrc {:#010x}: output stream failed: {}", chan.ssrc, e);
            break;
        }
        chan.output_samples
            .fetch_add(demod.audio.len() as u64, Ordering::Relaxed);
    }
    log::debug!("ssrc {:#010x}: linear demod exiting", chan.ssrc);
}

fn chan_bb_power(buffer: &[Complex32], n: usize) -> f32 {
    buffer.iter().map(|s| s.norm_sqr()).sum::<f32>() / n.max(1) as f32
}

/// Null demodulator for kinds this crate does not implement: drains blocks
/// in order and keeps the channel's signal statistics alive.
fn run_null(chan: Arc<Chan>, fe: Arc<Frontend>, bus: Arc<SpectrumBus>, params: FilterParams) {
    let samprate = fe.samprate();
    let cfg = chan.config();
    let olen = match output_block_length(cfg.output.samprate, params, samprate) {
        Some(olen) => olen,
        None => return,
    };
    let mut out = match FilterOutput::new(bus, params, samprate, olen) {
        Ok(out) => out,
        Err(e) => {
            log::error!("ssrc {:#010x}: {}", chan.ssrc, e);
            return;
        }
    };
    let rate = cfg.output.samprate as f32;
    out.set_response(
        cfg.filter.min_if / rate,
        cfg.filter.max_if / rate,
        cfg.filter.kaiser_beta,
    );
    let if_freq = cfg.tune.freq - fe.frequency.load(Ordering::Relaxed);
    let (bin_shift, _) = compute_tuning(params.n(), samprate, if_freq);
    out.retune(bin_shift);

    while !chan.terminate.load(Ordering::Acquire) {
        match out.next_block(BLOCK_POLL) {
            BlockStatus::TimedOut => continue,
            BlockStatus::Ready => {}
        }
        chan.blocks.fetch_add(1, Ordering::Relaxed);
        chan.sig
            .bb_power
            .store(chan_bb_power(&out.output, olen), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::ChanConfig;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::TAU;

    fn base_config() -> ChanConfig {
        let mut cfg = ChanConfig::default();
        cfg.output.samprate = 12_000;
        cfg.output.gain = 1.0;
        cfg.linear.agc = false;
        cfg
    }

    fn flat_block(olen: usize, ampl: f32) -> Vec<Complex32> {
        vec![Complex32::new(ampl, 0.0); olen]
    }

    fn tone_block(olen: usize, samprate: u32, freq: f64, start: usize) -> Vec<Complex32> {
        (0..olen)
            .map(|i| {
                let phase = TAU * freq * (start + i) as f64 / f64::from(samprate);
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn test_plain_mono_output_is_scaled_real_part() {
        let mut cfg = base_config();
        cfg.output.gain = 2.0;
        let mut demod = LinearDemod::new(12_000, 240, &cfg);
        let mut block = flat_block(240, 0.25);
        let result = demod.process_block(&mut block);
        assert_eq!(demod.audio.len(), 240);
        for &v in &demod.audio {
            assert_relative_eq!(v, 0.5, epsilon = 1e-6);
        }
        assert!(!result.mute);
        // Mono power gets the +3 dB full-scale referral
        assert_relative_eq!(result.output_power, 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_envelope_outputs() {
        let mut cfg = base_config();
        cfg.linear.env = true;
        let mut demod = LinearDemod::new(12_000, 240, &cfg);
        // Pure imaginary input: envelope sees it, the I channel would not
        let mut block = vec![Complex32::new(0.0, 0.3); 240];
        demod.process_block(&mut block);
        for &v in &demod.audio {
            assert_relative_eq!(v, 0.3, epsilon = 1e-6);
        }

        // Stereo envelope: I left, envelope +6 dB right
        let mut cfg = base_config();
        cfg.linear.env = true;
        cfg.output.channels = 2;
        let mut demod = LinearDemod::new(12_000, 240, &cfg);
        let mut block = vec![Complex32::new(0.3, 0.4); 240];
        demod.process_block(&mut block);
        assert_relative_eq!(demod.audio[0], 0.3, epsilon = 1e-6);
        assert_relative_eq!(demod.audio[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mute_on_zero_output() {
        let cfg = base_config();
        let mut demod = LinearDemod::new(12_000, 240, &cfg);
        // Pure imaginary: the I channel demodulates to silence
        let mut block = vec![Complex32::new(0.0, 0.7); 240];
        let result = demod.process_block(&mut block);
        assert_eq!(result.output_power, 0.0);
        assert!(result.mute);
    }

    #[test]
    fn test_post_demod_shift_tone() {
        let mut cfg = base_config();
        cfg.tune.shift = 1000.0;
        let mut demod = LinearDemod::new(12_000, 240, &cfg);
        let mut block = flat_block(240, 1.0);
        demod.process_block(&mut block);
        // A DC input shifted by 1 kHz comes out as a 1 kHz tone
        for (k, &v) in demod.audio.iter().enumerate().take(48) {
            let expect = (TAU * 1000.0 * k as f64 / 12_000.0).cos() as f32;
            assert_relative_eq!(v, expect, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_agc_strong_signal_settles_within_one_block() {
        let mut cfg = base_config();
        cfg.linear.agc = true;
        let headroom = cfg.output.headroom;
        let olen = 240;
        let mut demod = LinearDemod::new(12_000, olen, &cfg);

        let ampl = 5.0f32;
        let mut block = flat_block(olen, ampl);
        demod.process_block(&mut block);

        // Gain ends the block at the headroom target
        assert_relative_eq!(demod.gain() * ampl, headroom, epsilon = 0.02);
        // Output amplitude decreases monotonically toward it, and never
        // exceeds the start-of-block level
        let first = demod.audio[0].abs();
        assert!(first <= ampl);
        for pair in demod.audio.windows(2) {
            assert!(pair[1].abs() <= pair[0].abs() + 1e-6);
        }
        let last = demod.audio.last().unwrap().abs();
        assert_relative_eq!(last, headroom, epsilon = 0.02);
    }

    #[test]
    fn test_agc_hang_then_recover() {
        let mut cfg = base_config();
        cfg.linear.agc = true;
        let olen = 240;
        let block_time = olen as f32 / 12_000.0;
        cfg.linear.hangtime = 2.0 * block_time; // two blocks of hang
        cfg.linear.recovery_rate = 20.0;
        // Keep the noise branch out of the way: the floor tracker has only
        // seen the strong block when the weak ones arrive
        cfg.linear.threshold = 100.0;
        let mut demod = LinearDemod::new(12_000, olen, &cfg);

        let mut strong = flat_block(olen, 5.0);
        demod.process_block(&mut strong);
        let g_after_strong = demod.gain();

        // Two weak blocks: gain held by the hang timer
        let mut weak = flat_block(olen, 1e-3);
        demod.process_block(&mut weak.clone());
        assert_relative_eq!(demod.gain(), g_after_strong, epsilon = 1e-6);
        demod.process_block(&mut weak);
        assert_relative_eq!(demod.gain(), g_after_strong, epsilon = 1e-6);

        // Third weak block: recovery at 20 dB/s over one block time
        let mut weak = flat_block(olen, 1e-3);
        demod.process_block(&mut weak);
        let expect = g_after_strong * 10f32.powf(20.0 * block_time / 20.0);
        assert_relative_eq!(demod.gain(), expect, epsilon = 1e-3);
    }

    #[test]
    fn test_pll_locks_on_offset_tone() {
        // +100 Hz tone at 48 kHz for 0.5 s with a 50 Hz loop: must end
        // locked with the offset read out within a hertz
        let mut cfg = base_config();
        cfg.output.samprate = 48_000;
        cfg.output.channels = 2; // I/Q out so the block is never silent
        cfg.linear.pll = true;
        cfg.linear.loop_bw = 50.0;
        let olen = 960;
        let mut demod = LinearDemod::new(48_000, olen, &cfg);

        let mut start = 0;
        let mut final_mute = true;
        for _ in 0..25 {
            let mut block = tone_block(olen, 48_000, 100.0, start);
            let result = demod.process_block(&mut block);
            final_mute = result.mute;
            start += olen;
        }
        assert!(demod.pll_locked());
        assert!(!final_mute);
        let foffset = demod.pll_freq();
        assert!(
            (99.0..=101.0).contains(&foffset),
            "frequency offset {} Hz",
            foffset
        );
    }

    #[test]
    fn test_pll_squelch_unlocks_on_noise() {
        let mut cfg = base_config();
        cfg.output.samprate = 48_000;
        cfg.output.channels = 2;
        cfg.linear.pll = true;
        cfg.linear.loop_bw = 50.0;
        cfg.linear.snr_squelch = true; // threshold form of the lock detector
        let olen = 960;
        let mut demod = LinearDemod::new(48_000, olen, &cfg);

        let mut start = 0;
        for _ in 0..25 {
            let mut block = tone_block(olen, 48_000, 10.0, start);
            demod.process_block(&mut block);
            start += olen;
        }
        assert!(demod.pll_locked());

        // Noise-only blocks measure SNR near zero, below squelch_close;
        // one block must not unlock, sustained noise must
        let mut rng = StdRng::seed_from_u64(7);
        let mut noise_block = || -> Vec<Complex32> {
            (0..olen)
                .map(|_| {
                    Complex32::new(rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5)
                })
                .collect()
        };
        demod.process_block(&mut noise_block());
        assert!(demod.pll_locked(), "single bad block must not unlock");
        for _ in 0..10 {
            demod.process_block(&mut noise_block());
        }
        assert!(!demod.pll_locked());
    }

    #[test]
    fn test_pll_mutes_until_locked() {
        let mut cfg = base_config();
        cfg.output.samprate = 48_000;
        cfg.output.channels = 2;
        cfg.linear.pll = true;
        let olen = 960;
        let mut demod = LinearDemod::new(48_000, olen, &cfg);
        // First block cannot be locked yet: AM carrier squelch mutes
        let mut block = tone_block(olen, 48_000, 0.0, 0);
        let result = demod.process_block(&mut block);
        assert!(result.mute);
    }
}
