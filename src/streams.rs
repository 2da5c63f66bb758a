//! Concrete operand streams for one spec: per-slot columns of length
//! `N_UNROLL`.
//!
//! A serial run rotates registers so every copy consumes its predecessor's
//! result; a parallel run gives each copy an independent destination.
//! Memory operands alias one stack slot in serial mode (a true dependency
//! through the store buffer) and stride by the access width in parallel
//! mode. Immediates walk by a prime-ish step so constant-folding fast paths
//! in the pipeline are never hit twice with the same value.

use iced_x86::Register;

use crate::spec::{InstSpec, OperandKind, MAX_SLOTS};
use crate::types::N_UNROLL;

#[cfg(test)]
use crate::types::N_PARALLEL;

/// One concrete operand of one unrolled copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchOp {
    None,
    Reg(Register),
    Mem { base: Register, disp: i64 },
    Imm(u64),
}

/// Loop counter of the emitted measurement loop. Kept outside the 8-bit
/// register-pool universe so it never collides with rotated operands.
pub const LOOP_COUNTER: Register = Register::R15;

/// Physical register tables indexed by encoding id 0..=7.
pub const GPB: [Register; 8] = [
    Register::AL, Register::CL, Register::DL, Register::BL,
    Register::SPL, Register::BPL, Register::SIL, Register::DIL,
];
pub const GPW: [Register; 8] = [
    Register::AX, Register::CX, Register::DX, Register::BX,
    Register::SP, Register::BP, Register::SI, Register::DI,
];
pub const GPD: [Register; 8] = [
    Register::EAX, Register::ECX, Register::EDX, Register::EBX,
    Register::ESP, Register::EBP, Register::ESI, Register::EDI,
];
pub const GPQ: [Register; 8] = [
    Register::RAX, Register::RCX, Register::RDX, Register::RBX,
    Register::RSP, Register::RBP, Register::RSI, Register::RDI,
];
pub const XMM: [Register; 8] = [
    Register::XMM0, Register::XMM1, Register::XMM2, Register::XMM3,
    Register::XMM4, Register::XMM5, Register::XMM6, Register::XMM7,
];
pub const YMM: [Register; 8] = [
    Register::YMM0, Register::YMM1, Register::YMM2, Register::YMM3,
    Register::YMM4, Register::YMM5, Register::YMM6, Register::YMM7,
];
pub const ZMM: [Register; 8] = [
    Register::ZMM0, Register::ZMM1, Register::ZMM2, Register::ZMM3,
    Register::ZMM4, Register::ZMM5, Register::ZMM6, Register::ZMM7,
];
pub const MMREG: [Register; 8] = [
    Register::MM0, Register::MM1, Register::MM2, Register::MM3,
    Register::MM4, Register::MM5, Register::MM6, Register::MM7,
];
pub const KREG: [Register; 8] = [
    Register::K0, Register::K1, Register::K2, Register::K3,
    Register::K4, Register::K5, Register::K6, Register::K7,
];

const SP_ID: u32 = 4;

/// Per-slot operand columns.
#[derive(Debug, Clone)]
pub struct OperandStreams {
    pub cols: Vec<Vec<BenchOp>>,
    pub op_count: usize,
    /// Number of leading slots that participate in register rotation
    /// (trailing immediate/memory slots stripped).
    pub reg_count: usize,
}

fn fill_same(reg: Register) -> Vec<BenchOp> {
    vec![BenchOp::Reg(reg); N_UNROLL]
}

fn fill_reg(
    r_start: u32,
    r_inc: u32,
    r_mask: u32,
    table: &[Register; 8],
) -> Vec<BenchOp> {
    let pool: Vec<Register> = (0..8)
        .filter(|i| r_mask & (1 << i) != 0)
        .map(|i| table[i as usize])
        .collect();
    let len = pool.len().max(1);
    let mut rid = r_start as usize % len;
    let mut out = Vec::with_capacity(N_UNROLL);
    for _ in 0..N_UNROLL {
        out.push(BenchOp::Reg(pool[rid]));
        rid = (rid + r_inc as usize) % len;
    }
    out
}

fn fill_mem(width: u32, parallel: bool) -> Vec<BenchOp> {
    let step = if parallel { width as i64 } else { 0 };
    let mut disp = 0i64;
    let mut out = Vec::with_capacity(N_UNROLL);
    for _ in 0..N_UNROLL {
        out.push(BenchOp::Mem { base: Register::RSP, disp });
        disp += step;
    }
    out
}

fn fill_imm(start: u64, inc: u64, max_value: u64) -> Vec<BenchOp> {
    let mut n = start;
    let mut out = Vec::with_capacity(N_UNROLL);
    for _ in 0..N_UNROLL {
        out.push(BenchOp::Imm(n));
        n = (n.wrapping_add(inc)) % (max_value + 1);
    }
    out
}

/// Register pool masks per class, with the loop counter, the stack pointer,
/// the dependency-injection scratch registers (k7, mm7, xmm7, k0) and every
/// implicitly bound physical id removed.
fn pool_masks(spec: InstSpec) -> (u32, u32, u32, u32) {
    let mut gp: u32 = 0xFF & !(1 << SP_ID);
    let counter_id = LOOP_COUNTER as u32 - Register::RAX as u32;
    if counter_id < 8 {
        gp &= !(1 << counter_id);
    }
    let mut vec_pool: u32 = 0xFF & !(1 << 7);
    let mm: u32 = 0xFF & !(1 << 7);
    let k: u32 = 0xFE & !(1 << 7);

    for i in 0..MAX_SLOTS {
        let kind = spec.get(i);
        if let Some(id) = kind.implicit_gp_id() {
            gp &= !(1 << id);
        }
        if kind == OperandKind::Xmm0 {
            vec_pool &= !1;
        }
    }
    (gp, vec_pool, mm, k)
}

/// Rotation start for slot `i` given how many slots rotate registers.
///
/// Serial chains feed each copy's source from the previous copy's
/// destination; parallel chains give consecutive copies distinct
/// destinations.
fn rotation(reg_count: usize, slot: usize, parallel: bool) -> (u32, u32) {
    let mut r_start = 0u32;
    let mut r_inc = 1u32;
    match reg_count {
        1 => {
            if !parallel {
                r_inc = 0;
            }
        }
        2 => {
            r_start = if parallel {
                if slot == 0 { 0 } else { 1 }
            } else if slot == 0 {
                1
            } else {
                0
            };
        }
        3 => {
            r_start = if parallel {
                if slot < 2 { 0 } else { 1 }
            } else if slot < 2 {
                1
            } else {
                0
            };
        }
        _ => {
            r_start = if parallel {
                if slot < 1 { 0 } else if slot < 3 { 1 } else { 2 }
            } else if slot < 1 {
                2
            } else if slot < 3 {
                1
            } else {
                0
            };
        }
    }
    (r_start, r_inc)
}

pub fn build_streams(spec: InstSpec, parallel: bool) -> OperandStreams {
    let op_count = spec.count();
    let (gp, vec_pool, mm, k) = pool_masks(spec);

    let mut reg_count = op_count;
    while reg_count > 0 && spec.get(reg_count - 1).is_imm_or_mem() {
        reg_count -= 1;
    }

    let mut cols = Vec::with_capacity(op_count);
    for i in 0..op_count {
        let (r_start, r_inc) = rotation(reg_count, i, parallel);
        use OperandKind::*;
        let col = match spec.get(i) {
            Al => fill_same(Register::AL),
            Cl => fill_same(Register::CL),
            Dl => fill_same(Register::DL),
            Bl => fill_same(Register::BL),
            Ax => fill_same(Register::AX),
            Cx => fill_same(Register::CX),
            Dx => fill_same(Register::DX),
            Bx => fill_same(Register::BX),
            Eax => fill_same(Register::EAX),
            Ecx => fill_same(Register::ECX),
            Edx => fill_same(Register::EDX),
            Ebx => fill_same(Register::EBX),
            Rax => fill_same(Register::RAX),
            Rcx => fill_same(Register::RCX),
            Rdx => fill_same(Register::RDX),
            Rbx => fill_same(Register::RBX),
            Xmm0 => fill_same(Register::XMM0),

            Gpb => fill_reg(r_start, r_inc, gp, &GPB),
            Gpw => fill_reg(r_start, r_inc, gp, &GPW),
            Gpd => fill_reg(r_start, r_inc, gp, &GPD),
            Gpq => fill_reg(r_start, r_inc, gp, &GPQ),
            Xmm => fill_reg(r_start, r_inc, vec_pool, &XMM),
            Ymm => fill_reg(r_start, r_inc, vec_pool, &YMM),
            Zmm => fill_reg(r_start, r_inc, vec_pool, &ZMM),
            Mm => fill_reg(r_start, r_inc, mm, &MMREG),
            KReg => fill_reg(r_start, r_inc, k, &KREG),

            Imm8 => fill_imm(0, 1, 15),
            Imm16 => fill_imm(1, 13099, 65535),
            Imm32 => fill_imm(1, 19231, 2_000_000_000),
            Imm64 => fill_imm(1, 9_876_543_219_231, 0x0FFF_FFFF_FFFF_FFFF),

            Mem8 | Mem16 | Mem32 | Mem64 | Mem128 | Mem256 | Mem512 => {
                fill_mem(spec.get(i).mem_width(), parallel)
            }

            Rel | None => vec![BenchOp::None; N_UNROLL],
        };
        cols.push(col);
    }

    OperandStreams { cols, op_count, reg_count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::OperandKind::*;

    fn regs(col: &[BenchOp]) -> Vec<Register> {
        col.iter()
            .map(|o| match o {
                BenchOp::Reg(r) => *r,
                _ => panic!("expected register"),
            })
            .collect()
    }

    #[test]
    fn test_implicit_slots_are_constant() {
        let s = build_streams(InstSpec::pack(&[Ax, Cl]), false);
        assert!(s.cols[0].iter().all(|o| *o == BenchOp::Reg(Register::AX)));
        assert!(s.cols[1].iter().all(|o| *o == BenchOp::Reg(Register::CL)));
    }

    #[test]
    fn test_serial_single_reg_repeats() {
        let s = build_streams(InstSpec::pack(&[Gpd]), false);
        let r = regs(&s.cols[0]);
        assert!(r.iter().all(|&x| x == r[0]));
    }

    #[test]
    fn test_parallel_single_reg_rotates() {
        let s = build_streams(InstSpec::pack(&[Gpd]), true);
        let r = regs(&s.cols[0]);
        assert_ne!(r[0], r[1]);
        // No two consecutive copies may share a destination.
        for w in r.windows(2) {
            assert_ne!(w[0], w[1]);
        }
    }

    #[test]
    fn test_serial_two_reg_chains() {
        // Copy n's source must equal copy n+1's destination... the serial
        // pattern is dst=pool[1+n], src=pool[0+n], so src(n+1) == dst(n).
        let s = build_streams(InstSpec::pack(&[Gpd, Gpd]), false);
        let dst = regs(&s.cols[0]);
        let src = regs(&s.cols[1]);
        for n in 0..N_UNROLL - 1 {
            assert_eq!(src[n + 1], dst[n], "serial chain broken at copy {n}");
        }
    }

    #[test]
    fn test_parallel_two_reg_distinct_destinations() {
        let s = build_streams(InstSpec::pack(&[Gpd, Gpd]), true);
        let dst = regs(&s.cols[0]);
        for w in dst.windows(2) {
            assert_ne!(w[0], w[1], "consecutive copies share a destination");
        }
        // The rotation must sustain the targeted number of independent
        // chains: enough distinct destinations before the pool wraps.
        let mut ids: Vec<u32> = dst.iter().map(|&r| r as u32).collect();
        ids.sort_unstable();
        ids.dedup();
        assert!(ids.len() >= N_PARALLEL as usize);
    }

    #[test]
    fn test_pool_excludes_sp_and_scratch() {
        let s = build_streams(InstSpec::pack(&[Gpq, Gpq]), true);
        for col in &s.cols {
            for r in regs(col) {
                assert_ne!(r, Register::RSP);
                assert_ne!(r, LOOP_COUNTER);
            }
        }
        let s = build_streams(InstSpec::pack(&[Xmm, Xmm]), true);
        for col in &s.cols {
            assert!(!regs(col).contains(&Register::XMM7), "xmm7 is scratch");
        }
        let s = build_streams(InstSpec::pack(&[KReg, KReg]), true);
        for col in &s.cols {
            let r = regs(col);
            assert!(!r.contains(&Register::K0));
            assert!(!r.contains(&Register::K7));
        }
    }

    #[test]
    fn test_implicit_binding_removed_from_pool() {
        // `shl r32, cl`: generic slots must not rotate through ecx.
        let s = build_streams(InstSpec::pack(&[Gpd, Cl]), true);
        assert!(!regs(&s.cols[0]).contains(&Register::ECX));
    }

    #[test]
    fn test_mem_stream_serial_aliases_parallel_strides() {
        let serial = build_streams(InstSpec::pack(&[Mem32, Gpd]), false);
        for o in &serial.cols[0] {
            assert_eq!(*o, BenchOp::Mem { base: Register::RSP, disp: 0 });
        }
        let par = build_streams(InstSpec::pack(&[Mem32, Gpd]), true);
        for (n, o) in par.cols[0].iter().enumerate() {
            assert_eq!(*o, BenchOp::Mem { base: Register::RSP, disp: 4 * n as i64 });
        }
    }

    #[test]
    fn test_imm_stream_wraps() {
        let s = build_streams(InstSpec::pack(&[Gpd, Imm8]), false);
        for (n, o) in s.cols[1].iter().enumerate() {
            assert_eq!(*o, BenchOp::Imm((n as u64) % 16));
        }
    }

    #[test]
    fn test_reg_count_strips_trailing_imm_and_mem() {
        let s = build_streams(InstSpec::pack(&[Gpd, Gpd, Imm8]), false);
        assert_eq!(s.reg_count, 2);
        let s = build_streams(InstSpec::pack(&[Gpd, Mem32]), false);
        assert_eq!(s.reg_count, 1);
        let s = build_streams(InstSpec::pack(&[Mem32, Gpd]), false);
        assert_eq!(s.reg_count, 2);
    }
}
