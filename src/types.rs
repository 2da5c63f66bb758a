//! Shared types and the crate-wide error enum.

use std::fmt;

/// Number of instruction copies emitted back-to-back inside one loop iteration.
pub const N_UNROLL: usize = 64;

/// Number of independent chains targeted by a throughput (parallel) run.
pub const N_PARALLEL: u32 = 6;

/// Errors from classification, emission and execution.
///
/// None of these abort a benchmark run; the per-instruction loop reports and
/// continues.
#[derive(Debug)]
pub enum BenchError {
    /// The encoder refused an instruction or operand combination.
    Emit(String),
    /// Executable memory could not be allocated or protected.
    Exec(String),
    /// Output file I/O.
    Io(std::io::Error),
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emit(s) => write!(f, "emit error: {s}"),
            Self::Exec(s) => write!(f, "exec error: {s}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for BenchError {}

impl From<std::io::Error> for BenchError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<iced_x86::IcedError> for BenchError {
    fn from(e: iced_x86::IcedError) -> Self {
        Self::Emit(e.to_string())
    }
}
