//! Operand-kind vocabulary and the packed per-instruction operand tuple.
//!
//! An `InstSpec` identifies one benchmarkable operand shape of an instruction:
//! up to six operand kinds packed one byte per slot into a `u64`. Two specs
//! are the same shape iff their packed words match, which is also how the
//! classifier deduplicates.

use iced_x86::Mnemonic;

/// Every operand kind the benchmark understands.
///
/// The sixteen named general registers plus `Xmm0` are "implicit" kinds: they
/// pin a specific physical register instead of naming a class. Discriminants
/// are laid out so that `Al as u8 + reg_id` lands on the right implicit kind
/// for ids 0..=3, and so that every immediate and memory kind sorts after
/// every register kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum OperandKind {
    None = 0,
    Rel,

    Gpb,
    Gpw,
    Gpd,
    Gpq,

    Al,
    Cl,
    Dl,
    Bl,
    Ax,
    Cx,
    Dx,
    Bx,
    Eax,
    Ecx,
    Edx,
    Ebx,
    Rax,
    Rcx,
    Rdx,
    Rbx,

    Mm,
    Xmm,
    Xmm0,
    Ymm,
    Zmm,
    KReg,

    Imm8,
    Imm16,
    Imm32,
    Imm64,

    Mem8,
    Mem16,
    Mem32,
    Mem64,
    Mem128,
    Mem256,
    Mem512,
}

impl OperandKind {
    pub fn from_u8(v: u8) -> OperandKind {
        use OperandKind::*;
        match v {
            0 => None,
            1 => Rel,
            2 => Gpb,
            3 => Gpw,
            4 => Gpd,
            5 => Gpq,
            6 => Al,
            7 => Cl,
            8 => Dl,
            9 => Bl,
            10 => Ax,
            11 => Cx,
            12 => Dx,
            13 => Bx,
            14 => Eax,
            15 => Ecx,
            16 => Edx,
            17 => Ebx,
            18 => Rax,
            19 => Rcx,
            20 => Rdx,
            21 => Rbx,
            22 => Mm,
            23 => Xmm,
            24 => Xmm0,
            25 => Ymm,
            26 => Zmm,
            27 => KReg,
            28 => Imm8,
            29 => Imm16,
            30 => Imm32,
            31 => Imm64,
            32 => Mem8,
            33 => Mem16,
            34 => Mem32,
            35 => Mem64,
            36 => Mem128,
            37 => Mem256,
            38 => Mem512,
            _ => None,
        }
    }

    /// True for kinds that name one specific physical register.
    pub fn is_implicit(self) -> bool {
        use OperandKind::*;
        matches!(
            self,
            Al | Cl | Dl | Bl
                | Ax | Cx | Dx | Bx
                | Eax | Ecx | Edx | Ebx
                | Rax | Rcx | Rdx | Rbx
                | Xmm0
        )
    }

    /// True for immediate and memory kinds (they never consume a register
    /// rotation slot).
    pub fn is_imm_or_mem(self) -> bool {
        self as u8 >= OperandKind::Imm8 as u8
    }

    pub fn is_mem(self) -> bool {
        self as u8 >= OperandKind::Mem8 as u8
    }

    pub fn is_imm(self) -> bool {
        use OperandKind::*;
        matches!(self, Imm8 | Imm16 | Imm32 | Imm64)
    }

    /// Memory access width in bytes, 0 for non-memory kinds.
    pub fn mem_width(self) -> u32 {
        use OperandKind::*;
        match self {
            Mem8 => 1,
            Mem16 => 2,
            Mem32 => 4,
            Mem64 => 8,
            Mem128 => 16,
            Mem256 => 32,
            Mem512 => 64,
            _ => 0,
        }
    }

    /// Physical register id pinned by an implicit GP kind (a/c/d/b order).
    pub fn implicit_gp_id(self) -> Option<u32> {
        use OperandKind::*;
        match self {
            Al | Ax | Eax | Rax => Some(0),
            Cl | Cx | Ecx | Rcx => Some(1),
            Dl | Dx | Edx | Rdx => Some(2),
            Bl | Bx | Ebx | Rbx => Some(3),
            _ => Option::None,
        }
    }

    /// Operand token used in output records.
    pub fn as_str(self) -> &'static str {
        use OperandKind::*;
        match self {
            None => "none",
            Rel => "rel",
            Al => "al",
            Bl => "bl",
            Cl => "cl",
            Dl => "dl",
            Gpb => "r8",
            Ax => "ax",
            Bx => "bx",
            Cx => "cx",
            Dx => "dx",
            Gpw => "r16",
            Eax => "eax",
            Ebx => "ebx",
            Ecx => "ecx",
            Edx => "edx",
            Gpd => "r32",
            Rax => "rax",
            Rbx => "rbx",
            Rcx => "rcx",
            Rdx => "rdx",
            Gpq => "r64",
            Mm => "mm",
            Xmm0 => "xmm0",
            Xmm => "xmm",
            Ymm => "ymm",
            Zmm => "zmm",
            KReg => "k",
            Imm8 => "i8",
            Imm16 => "i16",
            Imm32 => "i32",
            Imm64 => "i64",
            Mem8 => "m8",
            Mem16 => "m16",
            Mem32 => "m32",
            Mem64 => "m64",
            Mem128 => "m128",
            Mem256 => "m256",
            Mem512 => "m512",
        }
    }
}

/// Packed 6-slot operand tuple, one byte per slot, unused slots zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstSpec(u64);

pub const MAX_SLOTS: usize = 6;

impl InstSpec {
    pub const fn none() -> InstSpec {
        InstSpec(0)
    }

    pub fn pack(kinds: &[OperandKind]) -> InstSpec {
        debug_assert!(kinds.len() <= MAX_SLOTS);
        let mut v = 0u64;
        for (i, k) in kinds.iter().enumerate() {
            v |= (*k as u64) << (i * 8);
        }
        InstSpec(v)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn get(self, index: usize) -> OperandKind {
        debug_assert!(index < MAX_SLOTS);
        OperandKind::from_u8(((self.0 >> (index * 8)) & 0xFF) as u8)
    }

    /// Number of leading non-`None` slots.
    pub fn count(self) -> usize {
        let mut i = 0;
        let mut v = self.0;
        while v & 0xFF != 0 {
            i += 1;
            v >>= 8;
        }
        i
    }

    pub fn uses_mm(self) -> bool {
        (0..MAX_SLOTS).any(|i| self.get(i) == OperandKind::Mm)
    }

    pub fn uses_vec(self) -> bool {
        use OperandKind::*;
        (0..MAX_SLOTS).any(|i| matches!(self.get(i), Xmm0 | Xmm | Ymm | Zmm))
    }
}

/// Lowercase mnemonic text, e.g. `Mnemonic::Vaddps` -> "vaddps".
pub fn mnemonic_str(m: Mnemonic) -> String {
    format!("{m:?}").to_ascii_lowercase()
}

/// Render the output text for one record: mnemonic plus operand tokens.
///
/// `call` is rendered as `call+ret` (the benchmark measures the pair), and
/// `lea` operands are reconstituted into bracket form.
pub fn inst_text(m: Mnemonic, spec: InstSpec) -> String {
    let mut s = if m == Mnemonic::Call {
        "call+ret".to_string()
    } else {
        mnemonic_str(m)
    };

    let op_count = spec.count();
    for i in 0..op_count {
        if i == 0 {
            s.push(' ');
        } else if m == Mnemonic::Lea {
            s.push_str(if i == 1 { ", [" } else { " + " });
        } else {
            s.push_str(", ");
        }
        s.push_str(spec.get(i).as_str());
        if m == Mnemonic::Lea && i == op_count - 1 {
            s.push(']');
        }
    }
    s
}
