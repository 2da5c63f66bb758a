//! instlat: per-instruction latency and reciprocal throughput measurement
//! for x86-64.
//!
//! For every instruction the host CPU can execute, the library enumerates
//! the operand shapes worth benchmarking, JIT-assembles a tight unrolled
//! loop per shape (serial register rotation for latency, independent
//! chains for throughput), runs it against a serialised RDTSC and reports
//! the minimum observed cost in cycles per instruction, overhead-subtracted.
//!
//! Pipeline: [`classify::Classifier`] -> [`streams::build_streams`] ->
//! [`codegen::assemble`] -> [`exec::CompiledFn`] ->
//! [`measure::test_instruction`] -> [`measure::finish`] ->
//! [`report::JsonWriter`].

pub mod asm;
pub mod classify;
pub mod codegen;
pub mod database;
pub mod exec;
pub mod hostcpu;
pub mod measure;
pub mod report;
pub mod sigiter;
pub mod spec;
pub mod streams;
pub mod tsc;
pub mod types;

pub use classify::Classifier;
pub use codegen::BenchCase;
pub use database::InstDb;
pub use hostcpu::HostCpu;
pub use measure::{finish, round_result, test_instruction, MeasureConfig};
pub use spec::{inst_text, mnemonic_str, InstSpec, OperandKind};
pub use types::{BenchError, N_PARALLEL, N_UNROLL};
