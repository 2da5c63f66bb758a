//! Measurement driver and result post-processing.
//!
//! Each case is measured four ways: latency and throughput, each with an
//! overhead-only twin whose loop carries all scaffolding but not the
//! instruction. The driver keeps the minimum cycle reading across repeated
//! calls and stops once a long streak of calls fails to improve it. The
//! minimum is the noise-free value, robust against interrupts and frequency
//! wobble in a way means and medians are not.

use iced_x86::Mnemonic;

use crate::codegen::{assemble, BenchCase};
use crate::exec::CompiledFn;
use crate::hostcpu::HostCpu;
use crate::spec::mnemonic_str;
use crate::types::N_UNROLL;

/// Convergence and iteration-count knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeasureConfig {
    /// Loosen convergence for a quick, less precise run.
    pub estimate: bool,
}

/// Iterations per call of the emitted function. A handful of instructions
/// are so slow that the standard count would run for ages.
pub fn num_iter_for(m: Mnemonic) -> u32 {
    match m {
        Mnemonic::Cpuid | Mnemonic::Rdrand | Mnemonic::Rdseed => 4,
        _ => 160,
    }
}

/// Measure one (case, parallelism, overhead) combination.
///
/// Returns cycles per instruction copy, or -1.0 when the case cannot be
/// emitted (reported to stderr; the caller drops the record).
pub fn test_instruction(
    case: &BenchCase,
    parallel: bool,
    overhead_only: bool,
    cfg: MeasureConfig,
    host: &HostCpu,
) -> f64 {
    let bytes = match assemble(case, parallel, overhead_only, host) {
        Ok(b) => b,
        Err(e) => {
            eprintln!(
                "failed to assemble function for '{}': {e}",
                mnemonic_str(case.mnemonic)
            );
            return -1.0;
        }
    };
    let func = match CompiledFn::from_code(&bytes) {
        Ok(f) => f,
        Err(e) => {
            eprintln!(
                "failed to map function for '{}': {e}",
                mnemonic_str(case.mnemonic)
            );
            return -1.0;
        }
    };

    let n_iter = num_iter_for(case.mnemonic);

    // A significant improvement is 0.08 cycles per instruction (0.2 in
    // estimate mode); after this many calls without one, stop.
    let significant = (n_iter as f64 * if cfg.estimate { 0.2 } else { 0.08 }) as u64;
    let max_tries: u32 = if cfg.estimate { 1000 } else { 50_000 };
    let max_calls: u32 = 1_000_000;

    let f = unsafe { func.entry() };
    let mut best = u64::MAX;
    unsafe { f(n_iter, &mut best) };

    let mut previous_best = best;
    let mut tries: u32 = 0;

    for _ in 0..max_calls {
        let mut n = u64::MAX;
        unsafe { f(n_iter, &mut n) };

        best = best.min(n);
        if n < previous_best {
            if previous_best - n >= significant {
                previous_best = n;
                tries = 0;
            }
        } else {
            tries += 1;
        }
        if tries >= max_tries {
            break;
        }
    }

    best as f64 / (n_iter as f64 * N_UNROLL as f64)
}

/// Round a cycle count to the nearest canonical pipeline fraction.
///
/// Piecewise table over the fractional part; large counts snap to whole
/// cycles. The `(0.12, 0.22]` band maps to 0.20 only below two cycles and to
/// zero above, exactly as measured distributions warrant.
pub fn round_result(x: f64) -> f64 {
    let n = x.trunc();
    let mut f = x - n;

    if n >= 50.0 {
        f = if f > 0.12 { 1.0 } else { 0.0 };
    } else if f <= 0.12 {
        f = 0.0;
    } else if f <= 0.22 {
        f = if n > 1.0 { 0.0 } else { 0.20 };
    } else if (0.22..=0.28).contains(&f) {
        f = 0.25;
    } else if (0.27..=0.38).contains(&f) {
        f = 0.33;
    } else if f <= 0.57 {
        f = 0.50;
    } else if f <= 0.70 {
        f = 0.66;
    } else {
        f = 1.0;
    }

    n + f
}

/// Combine the four raw readings of one case into the final (lat, rcp) pair.
///
/// Overhead is subtracted and floored at zero; the serial variant can never
/// beat the parallel one, so a faster serial reading is attributed to skew
/// and clamped. Returns `None` when any reading carries the emission-failure
/// sentinel.
pub fn finish(
    lat: f64,
    rcp: f64,
    lat_overhead: f64,
    rcp_overhead: f64,
    round: bool,
) -> Option<(f64, f64)> {
    if lat < 0.0 || rcp < 0.0 || lat_overhead < 0.0 || rcp_overhead < 0.0 {
        return None;
    }

    let mut lat = (lat - lat_overhead).max(0.0);
    let mut rcp = (rcp - rcp_overhead).max(0.0);

    if round {
        lat = round_result(lat);
        rcp = round_result(rcp);
    }

    if rcp > lat {
        lat = rcp;
    }
    Some((lat, rcp))
}
