//! Adapter from the iced-x86 instruction tables to per-operand flag bitsets.
//!
//! iced-x86 describes every encodable form as a `Code` whose `OpCodeInfo`
//! names one `OpCodeOperandKind` per operand. The signature iterator wants
//! the classic per-operand *bitset* view instead (one bit per operand kind a
//! slot accepts, so `r32/m32` is two bits). This module widens each operand
//! kind into that bitset and indexes all forms of a mnemonic together.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use iced_x86::{Code, Mnemonic, OpCodeOperandKind};

use crate::spec::OperandKind;

/// One bit per operand kind a signature slot may accept.
pub mod flags {
    pub const REL: u64 = 1 << 0;
    pub const GPB: u64 = 1 << 1;
    pub const GPW: u64 = 1 << 2;
    pub const GPD: u64 = 1 << 3;
    pub const GPQ: u64 = 1 << 4;
    pub const MM: u64 = 1 << 5;
    pub const XMM: u64 = 1 << 6;
    pub const YMM: u64 = 1 << 7;
    pub const ZMM: u64 = 1 << 8;
    pub const KREG: u64 = 1 << 9;
    pub const IMM8: u64 = 1 << 10;
    pub const IMM16: u64 = 1 << 11;
    pub const IMM32: u64 = 1 << 12;
    pub const IMM64: u64 = 1 << 13;
    pub const MEM8: u64 = 1 << 14;
    pub const MEM16: u64 = 1 << 15;
    pub const MEM32: u64 = 1 << 16;
    pub const MEM64: u64 = 1 << 17;
    pub const MEM128: u64 = 1 << 18;
    pub const MEM256: u64 = 1 << 19;
    pub const MEM512: u64 = 1 << 20;
    /// Vector-memory (vsib gather/scatter) operands. Never placed in a
    /// filter, so forms carrying one are skipped whole.
    pub const VM: u64 = 1 << 21;

    pub const GP_ANY: u64 = GPB | GPW | GPD | GPQ;
    pub const IMM_ANY: u64 = IMM8 | IMM16 | IMM32 | IMM64;
    pub const MEM_ANY: u64 = MEM8 | MEM16 | MEM32 | MEM64 | MEM128 | MEM256 | MEM512;
}

/// One operand slot of a form: the accepted-kind bitset plus the pinned
/// physical register when the encoding fixes one (`al`, `cl`, `ax`, `dx`,
/// `eax`, `rax`).
#[derive(Debug, Clone, Copy)]
pub struct SigOp {
    pub flags: u64,
    pub fixed: Option<OperandKind>,
}

impl SigOp {
    const EMPTY: SigOp = SigOp { flags: 0, fixed: None };
}

/// Per-operand signature of one `Code`.
#[derive(Debug, Clone)]
pub struct CodeSig {
    pub code: Code,
    pub op_count: usize,
    pub ops: [SigOp; 5],
}

/// Widen one iced operand kind into (bitset, pinned register).
///
/// Kinds the benchmark cannot exercise (segment/control registers, string-op
/// implicit memory, AMX tiles, far branches, fixed shift-by-one immediates)
/// map to an empty set, which invalidates every combination of the form.
fn widen(kind: OpCodeOperandKind) -> SigOp {
    use flags::*;
    use OpCodeOperandKind as K;

    let (f, fixed) = match kind {
        K::r8_reg | K::r8_opcode => (GPB, None),
        K::r8_or_mem => (GPB | MEM8, None),
        K::r16_reg | K::r16_rm | K::r16_opcode => (GPW, None),
        K::r16_or_mem => (GPW | MEM16, None),
        K::r32_reg | K::r32_rm | K::r32_opcode => (GPD, None),
        K::r32_or_mem | K::r32_or_mem_mpx => (GPD | MEM32, None),
        K::r64_reg | K::r64_rm | K::r64_opcode => (GPQ, None),
        K::r64_or_mem | K::r64_or_mem_mpx => (GPQ | MEM64, None),

        K::al => (GPB, Some(OperandKind::Al)),
        K::cl => (GPB, Some(OperandKind::Cl)),
        K::ax => (GPW, Some(OperandKind::Ax)),
        K::dx => (GPW, Some(OperandKind::Dx)),
        K::eax => (GPD, Some(OperandKind::Eax)),
        K::rax => (GPQ, Some(OperandKind::Rax)),

        K::mm_reg | K::mm_rm => (MM, None),
        K::mm_or_mem => (MM | MEM64, None),

        K::xmm_reg | K::xmm_rm | K::xmm_vvvv | K::xmm_is4 | K::xmm_is5 => (XMM, None),
        K::xmm_or_mem => (XMM | MEM128, None),
        K::ymm_reg | K::ymm_rm | K::ymm_vvvv | K::ymm_is4 | K::ymm_is5 => (YMM, None),
        K::ymm_or_mem => (YMM | MEM256, None),
        K::zmm_reg | K::zmm_rm | K::zmm_vvvv => (ZMM, None),
        K::zmm_or_mem => (ZMM | MEM512, None),

        K::k_reg | K::k_rm | K::k_vvvv => (KREG, None),

        K::imm8 | K::imm8sex16 | K::imm8sex32 | K::imm8sex64 => (IMM8, None),
        K::imm16 => (IMM16, None),
        K::imm32 | K::imm32sex64 => (IMM32, None),
        K::imm64 => (IMM64, None),

        K::br32_1 | K::br32_4 | K::br64_1 | K::br64_4 => (REL, None),

        K::mem_vsib32x | K::mem_vsib64x | K::mem_vsib32y | K::mem_vsib64y
        | K::mem_vsib32z | K::mem_vsib64z => (VM, None),

        // Everything else (seg/cr/dr/tr/st/tmm/bnd registers, moffs, implicit
        // string memory, far branches, pinned immediates, register pairs) is
        // outside the benchmark vocabulary.
        _ => (0, None),
    };
    SigOp { flags: f, fixed }
}

/// Build the per-operand signature of one form.
pub fn signature_of(code: Code) -> CodeSig {
    let info = code.op_code();
    let op_count = info.op_count() as usize;
    let mut ops = [SigOp::EMPTY; 5];
    for (i, slot) in ops.iter_mut().enumerate().take(op_count.min(5)) {
        *slot = widen(info.op_kind(i as u32));
    }
    CodeSig { code, op_count: op_count.min(5), ops }
}

/// All encodable forms of one mnemonic, in `Code` order.
#[derive(Debug, Clone)]
pub struct InstGroup {
    pub mnemonic: Mnemonic,
    pub codes: Vec<Code>,
}

/// The instruction database: every mnemonic with its forms, ordered by
/// mnemonic value. Built once per process.
pub struct InstDb {
    groups: Vec<InstGroup>,
}

static DB: OnceLock<InstDb> = OnceLock::new();

impl InstDb {
    pub fn get() -> &'static InstDb {
        DB.get_or_init(InstDb::build)
    }

    fn build() -> InstDb {
        let mut by_mnemonic: BTreeMap<u16, InstGroup> = BTreeMap::new();
        for code in Code::values() {
            if code == Code::INVALID || !code.op_code().is_instruction() {
                continue;
            }
            let m = code.mnemonic();
            if m == Mnemonic::INVALID {
                continue;
            }
            by_mnemonic
                .entry(m as u16)
                .or_insert_with(|| InstGroup { mnemonic: m, codes: Vec::new() })
                .codes
                .push(code);
        }
        InstDb { groups: by_mnemonic.into_values().collect() }
    }

    /// Mnemonic groups in ascending mnemonic order; this is the output order
    /// of the whole benchmark.
    pub fn groups(&self) -> &[InstGroup] {
        &self.groups
    }

    pub fn find(&self, mnemonic: Mnemonic) -> Option<&InstGroup> {
        self.groups
            .binary_search_by_key(&(mnemonic as u16), |g| g.mnemonic as u16)
            .ok()
            .map(|i| &self.groups[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_has_common_mnemonics() {
        let db = InstDb::get();
        for m in [Mnemonic::Add, Mnemonic::Nop, Mnemonic::Imul, Mnemonic::Vaddps] {
            let g = db.find(m).expect("mnemonic missing from database");
            assert!(!g.codes.is_empty());
            assert!(g.codes.iter().all(|c| c.mnemonic() == m));
        }
    }

    #[test]
    fn test_groups_sorted_and_unique() {
        let db = InstDb::get();
        let mut prev: Option<u16> = None;
        for g in db.groups() {
            let v = g.mnemonic as u16;
            if let Some(p) = prev {
                assert!(v > p, "groups must be strictly ascending");
            }
            prev = Some(v);
        }
    }

    #[test]
    fn test_widen_reg_or_mem() {
        let sig = signature_of(Code::Add_r32_rm32);
        assert_eq!(sig.op_count, 2);
        assert_eq!(sig.ops[0].flags, flags::GPD);
        assert_eq!(sig.ops[1].flags, flags::GPD | flags::MEM32);
        assert!(sig.ops[0].fixed.is_none());
    }

    #[test]
    fn test_widen_fixed_register() {
        // shl r/m32, cl pins the count register.
        let sig = signature_of(Code::Shl_rm32_CL);
        assert_eq!(sig.op_count, 2);
        assert_eq!(sig.ops[1].flags, flags::GPB);
        assert_eq!(sig.ops[1].fixed, Some(OperandKind::Cl));
    }

    #[test]
    fn test_widen_unsupported_is_empty() {
        // mov to a segment register has no benchmarkable second operand.
        let sig = signature_of(Code::Mov_Sreg_r64m16);
        assert_eq!(sig.ops[0].flags, 0);
    }

    #[test]
    fn test_widen_vsib_flag() {
        let sig = signature_of(Code::VEX_Vgatherdps_xmm_vm32x_xmm);
        assert!(sig.ops.iter().any(|o| o.flags == flags::VM));
    }
}
