//! Overlap-save fast convolver.
//!
//! The front end writes time-domain samples into a [`FilterInput`]; every
//! `L` new samples it runs one forward FFT over the latest `N = L + M - 1`
//! samples and publishes the frequency-domain block on a [`SpectrumBus`].
//! Each channel owns a [`FilterOutput`] that selects its slice of the shared
//! spectrum, multiplies by a Kaiser-windowed frequency kernel, runs a small
//! inverse FFT and discards the overlap, yielding `olen` time-domain samples
//! per block at the channel's decimated rate.

use num_complex::{Complex, Complex32, Complex64};
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::ConfigError;

/// Input block length `L` and impulse length `M` of the forward filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterParams {
    pub l: usize,
    pub m: usize,
}

impl FilterParams {
    /// Derive block parameters from the sample rate, the block duration in
    /// milliseconds and the overlap factor: `L` samples per block,
    /// `M = L/(overlap-1) + 1`.
    pub fn derive(samprate: u32, blocktime_ms: f64, overlap: usize) -> Result<Self, ConfigError> {
        if samprate == 0 {
            return Err(ConfigError::InvalidSampleRate { rate: samprate });
        }
        let el = f64::from(samprate) * blocktime_ms / 1000.0;
        let l = el.round() as usize;
        if l == 0 || overlap < 2 {
            return Err(ConfigError::InvalidBlockParams { l, m: overlap });
        }
        if (el - l as f64).abs() > 1e-6 {
            log::warn!(
                "non-integral block: {} ms at {} Hz leaves remainder {:.6}",
                blocktime_ms,
                samprate,
                el - l as f64
            );
        }
        let m = l / (overlap - 1) + 1;
        Ok(FilterParams { l, m })
    }

    /// Forward FFT size `N = L + M - 1`.
    pub fn n(&self) -> usize {
        self.l + self.m - 1
    }
}

/// One forward-FFT output: the frequency-domain view of the latest `N`
/// input samples. Blocks are totally ordered by `seq`.
pub struct SpectrumBlock {
    pub seq: u64,
    pub bins: Vec<Complex32>,
}

/// One-producer many-consumer broadcast of frequency-domain blocks.
///
/// The producer rotates the current block under a short lock and never waits
/// for consumers; a consumer that falls behind sees a sequence gap and
/// counts the missed blocks as dropped.
pub struct SpectrumBus {
    latest: Mutex<Option<Arc<SpectrumBlock>>>,
    cond: Condvar,
}

impl SpectrumBus {
    pub fn new() -> Arc<Self> {
        Arc::new(SpectrumBus {
            latest: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    /// Publish the next block, assigning the next sequence number.
    pub fn publish(&self, bins: Vec<Complex32>) -> u64 {
        let mut latest = self.latest.lock().unwrap();
        let seq = latest.as_ref().map_or(0, |b| b.seq) + 1;
        *latest = Some(Arc::new(SpectrumBlock { seq, bins }));
        self.cond.notify_all();
        seq
    }

    /// Sequence number of the most recent block; 0 before the first.
    pub fn latest_seq(&self) -> u64 {
        self.latest.lock().unwrap().as_ref().map_or(0, |b| b.seq)
    }

    /// Wait for a block newer than `seen`, or time out. Timeouts let the
    /// caller poll its terminate flag; they are not errors.
    pub fn wait_after(&self, seen: u64, timeout: Duration) -> Option<Arc<SpectrumBlock>> {
        let deadline = Instant::now() + timeout;
        let mut latest = self.latest.lock().unwrap();
        loop {
            if let Some(block) = latest.as_ref() {
                if block.seq > seen {
                    return Some(Arc::clone(block));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self.cond.wait_timeout(latest, deadline - now).unwrap();
            latest = guard;
            if result.timed_out() {
                if let Some(block) = latest.as_ref() {
                    if block.seq > seen {
                        return Some(Arc::clone(block));
                    }
                }
                return None;
            }
        }
    }
}

/// Forward half of the fast convolver, exclusively owned by the front-end
/// ingest path.
pub struct FilterInput {
    params: FilterParams,
    hist: Vec<Complex32>, // last N samples; new data lands in the tail L
    fill: usize,          // new samples since the last FFT
    fft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
    bus: Arc<SpectrumBus>,
}

impl FilterInput {
    pub fn new(params: FilterParams, bus: Arc<SpectrumBus>) -> Self {
        let n = params.n();
        let fft = FftPlanner::new().plan_fft_forward(n);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        FilterInput {
            params,
            hist: vec![Complex::new(0.0, 0.0); n],
            fill: 0,
            fft,
            scratch,
            bus,
        }
    }

    pub fn params(&self) -> FilterParams {
        self.params
    }

    pub fn bus(&self) -> Arc<SpectrumBus> {
        Arc::clone(&self.bus)
    }

    /// Append complex samples; runs one forward FFT per `L` accumulated.
    /// Returns the number of blocks published.
    pub fn write_complex(&mut self, samples: &[Complex32]) -> usize {
        let mut published = 0;
        let mut rest = samples;
        while !rest.is_empty() {
            let n = self.params.n();
            let l = self.params.l;
            let take = rest.len().min(l - self.fill);
            let base = n - l + self.fill;
            self.hist[base..base + take].copy_from_slice(&rest[..take]);
            self.fill += take;
            rest = &rest[take..];
            if self.fill == l {
                self.execute();
                published += 1;
            }
        }
        published
    }

    /// Append real samples (zero imaginary part). Same block contract as
    /// [`write_complex`](Self::write_complex).
    pub fn write_real(&mut self, samples: &[f32]) -> usize {
        let mut published = 0;
        let mut rest = samples;
        while !rest.is_empty() {
            let n = self.params.n();
            let l = self.params.l;
            let take = rest.len().min(l - self.fill);
            let base = n - l + self.fill;
            for (dst, &src) in self.hist[base..base + take].iter_mut().zip(rest) {
                *dst = Complex::new(src, 0.0);
            }
            self.fill += take;
            rest = &rest[take..];
            if self.fill == l {
                self.execute();
                published += 1;
            }
        }
        published
    }

    fn execute(&mut self) {
        let n = self.params.n();
        let l = self.params.l;
        let mut bins = self.hist.clone();
        self.fft.process_with_scratch(&mut bins, &mut self.scratch);
        self.bus.publish(bins);
        // Slide: the newest M-1 samples become the next block's overlap
        self.hist.copy_within(l..n, 0);
        self.fill = 0;
    }
}

/// Split a frequency (Hz relative to the front-end center) into the integer
/// bin shift and the sub-bin remainder in Hz. The remainder is realized by
/// the per-sample fine oscillator; the bin shift selects the slice.
pub fn compute_tuning(n: usize, samprate: u32, freq: f64) -> (i64, f64) {
    let spacing = f64::from(samprate) / n as f64;
    let bin_shift = (freq / spacing).round() as i64;
    let remainder = freq - bin_shift as f64 * spacing;
    (bin_shift, remainder)
}

/// Zeroth-order modified Bessel function of the first kind, by series.
fn bessel_i0(x: f64) -> f64 {
    let q = x * x / 4.0;
    let mut sum = 1.0;
    let mut term = 1.0;
    let mut k = 1.0;
    loop {
        term *= q / (k * k);
        sum += term;
        if term < 1e-12 * sum {
            return sum;
        }
        k += 1.0;
    }
}

/// Kaiser window of `len` points with shape parameter `beta`.
fn kaiser_window(len: usize, beta: f32) -> Vec<f32> {
    let denom = bessel_i0(f64::from(beta));
    let half = (len - 1) as f64 / 2.0;
    (0..len)
        .map(|i| {
            let t = (i as f64 - half) / half;
            (bessel_i0(f64::from(beta) * (1.0 - t * t).max(0.0).sqrt()) / denom) as f32
        })
        .collect()
}

/// Consumer half of the fast convolver, owned by one demodulator thread.
pub struct FilterOutput {
    bus: Arc<SpectrumBus>,
    n: usize,
    l: usize,
    olen: usize,
    points: usize, // per-channel FFT size, N * olen / L
    bin_shift: i64,
    response: Vec<Complex32>,
    rotator: Complex64,
    rot_step: Complex64,
    rot_angle: f64,
    ifft: Arc<dyn Fft<f32>>,
    fwd: Arc<dyn Fft<f32>>,
    fbuf: Vec<Complex32>,
    scratch: Vec<Complex32>,
    /// Time-domain output of the most recent block.
    pub output: Vec<Complex32>,
    last_seq: u64,
    /// Blocks processed and blocks missed while this consumer was behind.
    pub blocks: u64,
    pub dropped: u64,
}

/// Result of waiting for the next downconverted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ready,
    TimedOut,
}

impl FilterOutput {
    /// Attach a new output to the shared spectrum. `olen` is the number of
    /// time-domain samples produced per block; the channel's sample rate is
    /// `samprate * olen / L`, and `olen` must divide the FFT grid evenly.
    pub fn new(
        bus: Arc<SpectrumBus>,
        params: FilterParams,
        samprate: u32,
        olen: usize,
    ) -> Result<Self, ConfigError> {
        let n = params.n();
        let l = params.l;
        if olen == 0 || (n * olen) % l != 0 {
            return Err(ConfigError::IncompatibleOutputRate {
                rate: (u64::from(samprate) * olen as u64 / l as u64) as u32,
                l,
                samprate,
            });
        }
        let points = n * olen / l;
        let mut planner = FftPlanner::new();
        let ifft = planner.plan_fft_inverse(points);
        let fwd = planner.plan_fft_forward(points);
        let scratch_len = ifft
            .get_inplace_scratch_len()
            .max(fwd.get_inplace_scratch_len());
        Ok(FilterOutput {
            bus,
            n,
            l,
            olen,
            points,
            bin_shift: 0,
            response: vec![Complex::new(0.0, 0.0); points],
            rotator: Complex::new(1.0, 0.0),
            rot_step: Complex::new(1.0, 0.0),
            rot_angle: 0.0,
            ifft,
            fwd,
            fbuf: vec![Complex::new(0.0, 0.0); points],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            output: vec![Complex::new(0.0, 0.0); olen],
            last_seq: 0,
            blocks: 0,
            dropped: 0,
        })
    }

    pub fn olen(&self) -> usize {
        self.olen
    }

    /// Point the slice at a new integer bin shift. The block-to-block
    /// rotator compensates the phase jump the sliding window introduces for
    /// a shifted slice: each block advances it by `-2π·shift·L/N`.
    pub fn retune(&mut self, bin_shift: i64) {
        self.bin_shift = bin_shift;
        let r = (bin_shift * self.l as i64).rem_euclid(self.n as i64);
        self.rot_angle = -std::f64::consts::TAU * r as f64 / self.n as f64;
        self.rot_step = Complex::from_polar(1.0, self.rot_angle);
        self.rotator = Complex::new(1.0, 0.0);
    }

    pub fn bin_shift(&self) -> i64 {
        self.bin_shift
    }

    /// Rebuild the frequency-domain kernel: an ideal band edge pair smoothed
    /// by a Kaiser window on the impulse response. `low` and `high` are
    /// normalized to the channel's output sample rate (cycles/sample).
    pub fn set_response(&mut self, low: f32, high: f32, beta: f32) {
        let points = self.points;
        let mut kernel: Vec<Complex32> = (0..points)
            .map(|b| {
                let fb = if b < points.div_ceil(2) {
                    b as f32 / points as f32
                } else {
                    b as f32 / points as f32 - 1.0
                };
                if fb >= low && fb <= high {
                    Complex::new(1.0, 0.0)
                } else {
                    Complex::new(0.0, 0.0)
                }
            })
            .collect();

        // To the time domain, window the impulse, and back. The windowed
        // impulse is laid out causally over taps [0, m_out) so the
        // overlap-save discard of points - olen samples covers exactly the
        // circular-convolution wraparound region.
        self.ifft.process_with_scratch(&mut kernel, &mut self.scratch);
        let m_out = points - self.olen + 1;
        let window = kaiser_window(m_out, beta);
        let half = (m_out - 1) / 2;
        let mut windowed = vec![Complex::new(0.0, 0.0); points];
        for (t, &w) in window.iter().enumerate() {
            let src = (t as isize - half as isize).rem_euclid(points as isize) as usize;
            windowed[t] = kernel[src] * w;
        }
        self.fwd.process_with_scratch(&mut windowed, &mut self.scratch);

        // Fold in the FFT round trip (1/points) and the master forward FFT
        // gain (1/N) so a unit passband tone comes out at unit amplitude
        let scale = 1.0 / (points as f32 * self.n as f32);
        for v in windowed.iter_mut() {
            *v *= scale;
        }
        self.response = windowed;
    }

    /// Wait for the next frequency-domain block and downconvert it into
    /// [`output`](Self::output). A timeout lets the caller poll terminate.
    pub fn next_block(&mut self, timeout: Duration) -> BlockStatus {
        let block = match self.bus.wait_after(self.last_seq, timeout) {
            Some(block) => block,
            None => return BlockStatus::TimedOut,
        };
        if self.last_seq != 0 {
            let gap = block.seq - self.last_seq - 1;
            if gap > 0 {
                self.dropped += gap;
                // Missed blocks still advanced the window; keep the phase
                // correction in step with the true block index
                self.rotator *= Complex::from_polar(1.0, self.rot_angle * gap as f64);
            }
        }
        self.last_seq = block.seq;

        let n = self.n as i64;
        let points = self.points;
        for b in 0..points {
            let sb = if b < points.div_ceil(2) {
                b as i64
            } else {
                b as i64 - points as i64
            };
            let k = (self.bin_shift + sb).rem_euclid(n) as usize;
            self.fbuf[b] = block.bins[k] * self.response[b];
        }
        self.ifft.process_with_scratch(&mut self.fbuf, &mut self.scratch);

        // Overlap-save: discard the first points - olen samples
        let skip = points - self.olen;
        let rot = Complex32::new(self.rotator.re as f32, self.rotator.im as f32);
        for (out, v) in self.output.iter_mut().zip(&self.fbuf[skip..]) {
            *out = v * rot;
        }
        self.rotator *= self.rot_step;
        if self.blocks % 32768 == 32767 {
            self.rotator /= self.rotator.norm();
        }
        self.blocks += 1;
        BlockStatus::Ready
    }
}
