//! Complex oscillator and phase-locked loop primitives.
//!
//! The oscillator is a unit-modulus phasor advanced by complex
//! multiplication; the PLL is a classical second-order loop with
//! configurable bandwidth and damping. Both renormalize their phasors
//! periodically so rounding drift never accumulates.

use num_complex::{Complex, Complex32, Complex64};
use std::f32::consts::FRAC_1_SQRT_2;
use std::f64::consts::TAU;

/// Critical damping, the default for all coherent modes.
pub const DEFAULT_PLL_DAMPING: f32 = FRAC_1_SQRT_2;
/// Seconds the measured SNR must stay above/below threshold to lock/unlock.
pub const DEFAULT_PLL_LOCKTIME: f32 = 0.05;

const RENORM_INTERVAL: u32 = 32768;

/// Numerically controlled oscillator: a phasor, a per-step increment, and an
/// optional per-step acceleration for Doppler tracking.
#[derive(Debug, Clone)]
pub struct Osc {
    freq: f64, // cycles per sample
    rate: f64, // cycles per sample per sample
    phasor: Complex64,
    step: Complex64,
    step_step: Complex64,
    steps: u32,
}

impl Default for Osc {
    fn default() -> Self {
        Self::new()
    }
}

impl Osc {
    pub fn new() -> Self {
        Osc {
            freq: 0.0,
            rate: 0.0,
            phasor: Complex::new(1.0, 0.0),
            step: Complex::new(1.0, 0.0),
            step_step: Complex::new(1.0, 0.0),
            steps: 0,
        }
    }

    /// Set frequency (cycles/sample) and sweep rate (cycles/sample²).
    pub fn set(&mut self, freq: f64, rate: f64) {
        self.freq = freq;
        self.rate = rate;
        self.step = Complex::from_polar(1.0, TAU * freq);
        self.step_step = if rate != 0.0 {
            Complex::from_polar(1.0, TAU * rate)
        } else {
            Complex::new(1.0, 0.0)
        };
    }

    pub fn freq(&self) -> f64 {
        self.freq
    }

    /// True when stepping would be a no-op.
    pub fn is_idle(&self) -> bool {
        self.freq == 0.0 && self.rate == 0.0
    }

    pub fn phasor(&self) -> Complex64 {
        self.phasor
    }

    /// Return the current phasor, then advance.
    pub fn step(&mut self) -> Complex64 {
        let out = self.phasor;
        self.phasor *= self.step;
        if self.rate != 0.0 {
            self.step *= self.step_step;
        }
        self.steps += 1;
        if self.steps >= RENORM_INTERVAL {
            self.steps = 0;
            self.phasor /= self.phasor.norm();
            self.step /= self.step.norm();
        }
        out
    }
}

/// Second-order phase-locked loop.
///
/// Gains follow the standard normalized loop-filter derivation from loop
/// bandwidth and damping: with `b = bandwidth / samprate` and damping `ζ`,
/// `denom = 1 + 2ζb + b²`, proportional gain `α = 4ζb / denom`, integral
/// gain `β = 4b² / denom`. Per error sample the integrator accumulates
/// `β·error` and the VCO advances by `integrator + α·error` radians.
#[derive(Debug, Clone)]
pub struct Pll {
    samprate: f32,
    loop_bw: f32,
    damping: f32,
    alpha: f32,
    beta: f32,
    integrator: f32, // radians per sample
    vco: Complex32,
    steps: u32,
}

impl Pll {
    pub fn new(samprate: f32) -> Self {
        let mut pll = Pll {
            samprate,
            loop_bw: 0.0,
            damping: 0.0,
            alpha: 0.0,
            beta: 0.0,
            integrator: 0.0,
            vco: Complex::new(1.0, 0.0),
            steps: 0,
        };
        pll.set_params(1.0, DEFAULT_PLL_DAMPING);
        pll
    }

    /// Recompute loop gains. Cheap to call every block; a no-op when nothing
    /// changed.
    pub fn set_params(&mut self, loop_bw: f32, damping: f32) {
        if loop_bw == self.loop_bw && damping == self.damping {
            return;
        }
        self.loop_bw = loop_bw;
        self.damping = damping;
        let b = loop_bw / self.samprate;
        let denom = 1.0 + 2.0 * damping * b + b * b;
        self.alpha = 4.0 * damping * b / denom;
        self.beta = 4.0 * b * b / denom;
    }

    /// Zero the loop integrator. Required when the PLL re-enters the signal
    /// path after having been off.
    pub fn reset(&mut self) {
        self.integrator = 0.0;
        self.vco = Complex::new(1.0, 0.0);
    }

    /// Advance the loop by one sample of phase error (radians).
    pub fn run(&mut self, phase_error: f32) {
        self.integrator += self.beta * phase_error;
        let dphi = self.integrator + self.alpha * phase_error;
        self.vco *= Complex::from_polar(1.0, dphi);
        self.steps += 1;
        if self.steps >= RENORM_INTERVAL {
            self.steps = 0;
            self.vco /= self.vco.norm();
        }
    }

    /// Current VCO phasor (unit modulus).
    pub fn phasor(&self) -> Complex32 {
        self.vco
    }

    /// Current frequency offset estimate, Hz.
    pub fn freq(&self) -> f32 {
        self.integrator * self.samprate / std::f32::consts::TAU
    }
}

/// Hysteretic lock counter.
///
/// Raised by the block length while the lock criterion holds, lowered while
/// it fails, clamped to ±limit; the lock bit only flips at the clamp
/// extremes. `limit` is `lock_time · samprate`.
#[derive(Debug, Clone)]
pub struct LockDetector {
    count: i64,
    limit: i64,
    locked: bool,
}

impl LockDetector {
    pub fn new(limit: i64) -> Self {
        LockDetector {
            count: 0,
            limit: limit.max(1),
            locked: false,
        }
    }

    /// Feed one block's verdict: `vote` > 0 raises the counter by `n`,
    /// < 0 lowers it, 0 holds (dead zone between squelch thresholds).
    pub fn update(&mut self, vote: i32, n: i64) {
        if vote > 0 {
            self.count += n;
        } else if vote < 0 {
            self.count -= n;
        }
        if self.count >= self.limit {
            self.count = self.limit;
            self.locked = true;
        }
        if self.count <= -self.limit {
            self.count = -self.limit;
            self.locked = false;
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Raw counter value, exposed as the lock timer in status.
    pub fn timer(&self) -> i64 {
        self.count
    }
}
