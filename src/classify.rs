//! Classification: which operand shapes of an instruction are worth
//! benchmarking on this host.
//!
//! For one mnemonic the classifier walks every encodable form, expands each
//! form's operand bitsets into concrete kind tuples, applies the admission
//! policy (ignored set, safe general-purpose allow-list, host feature and
//! encodability checks) and deduplicates by packed spec word. Order is the
//! enumeration order, which is also the output order of the run.

use std::collections::HashSet;

use iced_x86::{Code, Encoder, Mnemonic, Register};

use crate::codegen::{build_inst, BenchCase};
use crate::database::{flags, signature_of, InstDb, SigOp};
use crate::hostcpu::HostCpu;
use crate::sigiter::SigIter;
use crate::spec::{InstSpec, OperandKind};
use crate::streams::BenchOp;

/// Everything the benchmark is willing to rotate through: all GP widths,
/// the vector files, MM, mask registers, and all immediate and memory
/// widths. Branch targets and vsib operands are deliberately absent.
pub fn wide_filter(bitness: u32) -> u64 {
    let mut f = flags::GP_ANY
        | flags::XMM
        | flags::YMM
        | flags::ZMM
        | flags::MM
        | flags::KREG
        | flags::IMM_ANY
        | flags::MEM_ANY;
    if bitness == 32 {
        f &= !flags::GPQ;
    }
    f
}

/// Families that need register patterns the harness does not model.
fn is_ignored(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Vp4dpwssd
            | Mnemonic::Vp4dpwssds
            | Mnemonic::V4fmaddps
            | Mnemonic::V4fmaddss
            | Mnemonic::V4fnmaddps
            | Mnemonic::V4fnmaddss
            | Mnemonic::Vp2intersectd
            | Mnemonic::Vp2intersectq
            | Mnemonic::Ldtilecfg
            | Mnemonic::Sttilecfg
            | Mnemonic::Tileloadd
            | Mnemonic::Tileloaddt1
            | Mnemonic::Tilerelease
            | Mnemonic::Tilestored
            | Mnemonic::Tilezero
            | Mnemonic::Tdpbf16ps
            | Mnemonic::Tdpbssd
            | Mnemonic::Tdpbsud
            | Mnemonic::Tdpbusd
            | Mnemonic::Tdpbuud
    )
}

/// General-purpose instructions that commonly appear in user code. Anything
/// general-purpose outside this list (system instructions, I/O, string ops,
/// serialisation) is not benchmarked.
fn is_safe_gp(m: Mnemonic) -> bool {
    use Mnemonic as M;
    matches!(
        m,
        M::Adc | M::Adcx | M::Add | M::Adox | M::And | M::Andn
            | M::Bextr | M::Blcfill | M::Blci | M::Blcic | M::Blcmsk | M::Blcs
            | M::Blsfill | M::Blsi | M::Blsic | M::Blsmsk | M::Blsr
            | M::Bsf | M::Bsr | M::Bswap | M::Bt | M::Btc | M::Btr | M::Bts | M::Bzhi
            | M::Cbw | M::Cdq | M::Cdqe | M::Cmp | M::Crc32 | M::Cqo | M::Cwd | M::Cwde
            | M::Dec | M::Div | M::Idiv | M::Imul | M::Inc | M::Lzcnt | M::Mul
            | M::Mov | M::Movbe | M::Movsx | M::Movsxd | M::Movzx
            | M::Neg | M::Nop | M::Not | M::Or | M::Pdep | M::Pext
            | M::Pop | M::Popcnt | M::Push
            | M::Rcl | M::Rcr | M::Rdrand | M::Rdseed | M::Rol | M::Ror | M::Rorx
            | M::Sar | M::Sarx | M::Sbb | M::Shl | M::Shld | M::Shlx | M::Shr
            | M::Shrd | M::Shrx | M::Sub | M::T1mskc | M::Test | M::Tzcnt | M::Tzmsk
            | M::Xadd | M::Xchg | M::Xor
    )
}

/// Zero-operand instructions benchmarked as-is when the host supports them.
fn zero_operand_code(m: Mnemonic) -> Option<Code> {
    Some(match m {
        Mnemonic::Cpuid => Code::Cpuid,
        Mnemonic::Emms => Code::Emms,
        Mnemonic::Femms => Code::Femms,
        Mnemonic::Lfence => Code::Lfence,
        Mnemonic::Mfence => Code::Mfence,
        Mnemonic::Rdtsc => Code::Rdtsc,
        Mnemonic::Rdtscp => Code::Rdtscp,
        Mnemonic::Sfence => Code::Sfence,
        Mnemonic::Xgetbv => Code::Xgetbv,
        Mnemonic::Vzeroall => Code::VEX_Vzeroall,
        Mnemonic::Vzeroupper => Code::VEX_Vzeroupper,
        _ => return None,
    })
}

pub struct Classifier<'a> {
    db: &'a InstDb,
    cpu: &'a HostCpu,
    bitness: u32,
}

impl<'a> Classifier<'a> {
    pub fn new(db: &'a InstDb, cpu: &'a HostCpu, bitness: u32) -> Classifier<'a> {
        Classifier { db, cpu, bitness }
    }

    pub fn classify(&self, mnemonic: Mnemonic) -> Vec<BenchCase> {
        let mut out = Vec::new();

        if is_ignored(mnemonic) {
            return out;
        }

        if let Some(code) = zero_operand_code(mnemonic) {
            if self.can_run(code, &[]) {
                out.push(BenchCase { mnemonic, code, spec: InstSpec::none() });
            }
            return out;
        }

        match mnemonic {
            Mnemonic::Call => {
                self.push_hand(&mut out, mnemonic, Code::Call_rel32_64, &[OperandKind::Rel]);
                if self.bitness == 64 {
                    self.push_hand(&mut out, mnemonic, Code::Call_rm64, &[OperandKind::Gpq]);
                } else {
                    self.push_hand(&mut out, mnemonic, Code::Call_rm32, &[OperandKind::Gpd]);
                }
                return out;
            }
            Mnemonic::Jmp => {
                self.push_hand(&mut out, mnemonic, Code::Jmp_rel32_64, &[OperandKind::Rel]);
                return out;
            }
            Mnemonic::Lea => {
                self.lea_cases(&mut out);
                return out;
            }
            _ => {}
        }

        let Some(group) = self.db.find(mnemonic) else {
            return out;
        };

        let filter = wide_filter(self.bitness);
        let mut known: HashSet<u64> = HashSet::new();

        for &code in &group.codes {
            if !self.supports_mode(code) {
                continue;
            }
            let sig = signature_of(code);
            let mut it = SigIter::new(&sig.ops[..sig.op_count], filter);

            while it.is_valid() {
                if let Some((spec, vec)) = self.convert(&sig.ops[..sig.op_count], &it) {
                    if (vec || is_safe_gp(mnemonic)) && self.validate(code, spec) {
                        if known.insert(spec.value()) {
                            out.push(BenchCase { mnemonic, code, spec });
                        }
                    }
                }
                if !it.next() {
                    break;
                }
            }
        }
        out
    }

    fn supports_mode(&self, code: Code) -> bool {
        let info = code.op_code();
        if self.bitness == 64 { info.mode64() } else { info.mode32() }
    }

    fn push_hand(
        &self,
        out: &mut Vec<BenchCase>,
        mnemonic: Mnemonic,
        code: Code,
        kinds: &[OperandKind],
    ) {
        out.push(BenchCase { mnemonic, code, spec: InstSpec::pack(kinds) });
    }

    fn lea_cases(&self, out: &mut Vec<BenchCase>) {
        use OperandKind::*;
        let shapes: [&[OperandKind]; 6] = [
            &[Gpd, Gpd],
            &[Gpd, Gpd, Imm8],
            &[Gpd, Gpd, Imm32],
            &[Gpd, Gpd, Gpd],
            &[Gpd, Gpd, Gpd, Imm8],
            &[Gpd, Gpd, Gpd, Imm32],
        ];
        for s in shapes {
            self.push_hand(out, Mnemonic::Lea, Code::Lea_r32_m, s);
        }
        if self.bitness == 64 {
            let shapes64: [&[OperandKind]; 6] = [
                &[Gpq, Gpq],
                &[Gpq, Gpq, Imm8],
                &[Gpq, Gpq, Imm32],
                &[Gpq, Gpq, Gpq],
                &[Gpq, Gpq, Gpq, Imm8],
                &[Gpq, Gpq, Gpq, Imm32],
            ];
            for s in shapes64 {
                self.push_hand(out, Mnemonic::Lea, Code::Lea_r64_m, s);
            }
        }
    }

    /// Map the iterator's one-bit-per-slot state to an operand tuple.
    /// Returns the packed spec and whether any slot is a vector/mask kind.
    fn convert(&self, ops: &[SigOp], it: &SigIter<'_>) -> Option<(InstSpec, bool)> {
        use OperandKind::*;
        let mut kinds = [OperandKind::None; 6];
        let mut vec = false;

        for i in 0..it.op_count() {
            let bit = it.op_mask(i);
            let kind = match bit {
                flags::GPB => ops[i].fixed.unwrap_or(Gpb),
                flags::GPW => ops[i].fixed.unwrap_or(Gpw),
                flags::GPD => ops[i].fixed.unwrap_or(Gpd),
                flags::GPQ => ops[i].fixed.unwrap_or(Gpq),
                flags::MM => {
                    vec = true;
                    Mm
                }
                flags::XMM => {
                    vec = true;
                    Xmm
                }
                flags::YMM => {
                    vec = true;
                    Ymm
                }
                flags::ZMM => {
                    vec = true;
                    Zmm
                }
                flags::KREG => {
                    vec = true;
                    KReg
                }
                flags::IMM8 => Imm8,
                flags::IMM16 => Imm16,
                flags::IMM32 => Imm32,
                flags::IMM64 => Imm64,
                flags::MEM8 => Mem8,
                flags::MEM16 => Mem16,
                flags::MEM32 => Mem32,
                flags::MEM64 => Mem64,
                flags::MEM128 => Mem128,
                flags::MEM256 => Mem256,
                flags::MEM512 => Mem512,
                _ => {
                    log::debug!("unrecognised operand bit 0x{bit:016X}, tuple skipped");
                    return Option::None;
                }
            };
            kinds[i] = kind;
        }
        Some((InstSpec::pack(&kinds[..it.op_count()]), vec))
    }

    /// Admission check: the host advertises every required feature and the
    /// encoder accepts a representative instance of the tuple.
    fn validate(&self, code: Code, spec: InstSpec) -> bool {
        if !self.cpu.supports_all(code.cpuid_features()) {
            return false;
        }
        let ops: Vec<BenchOp> = (0..spec.count()).map(|i| probe_op(spec.get(i))).collect();
        self.can_run(code, &ops)
    }

    fn can_run(&self, code: Code, ops: &[BenchOp]) -> bool {
        if !self.cpu.supports_all(code.cpuid_features()) {
            return false;
        }
        let inst = match build_inst(code, ops) {
            Ok(i) => i,
            Err(e) => {
                log::debug!("{code:?}: {e}");
                return false;
            }
        };
        let mut enc = Encoder::new(self.bitness);
        enc.encode(&inst, 0x1000).is_ok()
    }
}

/// A representative concrete operand for admission checking.
fn probe_op(kind: OperandKind) -> BenchOp {
    use OperandKind::*;
    match kind {
        Al => BenchOp::Reg(Register::AL),
        Cl => BenchOp::Reg(Register::CL),
        Dl => BenchOp::Reg(Register::DL),
        Bl => BenchOp::Reg(Register::BL),
        Ax => BenchOp::Reg(Register::AX),
        Cx => BenchOp::Reg(Register::CX),
        Dx => BenchOp::Reg(Register::DX),
        Bx => BenchOp::Reg(Register::BX),
        Eax => BenchOp::Reg(Register::EAX),
        Ecx => BenchOp::Reg(Register::ECX),
        Edx => BenchOp::Reg(Register::EDX),
        Ebx => BenchOp::Reg(Register::EBX),
        Rax => BenchOp::Reg(Register::RAX),
        Rcx => BenchOp::Reg(Register::RCX),
        Rdx => BenchOp::Reg(Register::RDX),
        Rbx => BenchOp::Reg(Register::RBX),
        Gpb => BenchOp::Reg(Register::AL),
        Gpw => BenchOp::Reg(Register::AX),
        Gpd => BenchOp::Reg(Register::EAX),
        Gpq => BenchOp::Reg(Register::RAX),
        Mm => BenchOp::Reg(Register::MM0),
        Xmm0 | Xmm => BenchOp::Reg(Register::XMM0),
        Ymm => BenchOp::Reg(Register::YMM0),
        Zmm => BenchOp::Reg(Register::ZMM0),
        KReg => BenchOp::Reg(Register::K1),
        Imm8 | Imm16 | Imm32 | Imm64 => BenchOp::Imm(1),
        Mem8 | Mem16 | Mem32 | Mem64 | Mem128 | Mem256 | Mem512 => {
            BenchOp::Mem { base: Register::RSP, disp: 0 }
        }
        Rel | None => BenchOp::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::OperandKind::*;

    fn classifier() -> Classifier<'static> {
        Classifier::new(InstDb::get(), HostCpu::get(), 64)
    }

    #[test]
    fn test_ignored_families_are_empty() {
        let c = classifier();
        assert!(c.classify(Mnemonic::Vp2intersectd).is_empty());
        assert!(c.classify(Mnemonic::V4fmaddps).is_empty());
        assert!(c.classify(Mnemonic::Tilezero).is_empty());
    }

    #[test]
    fn test_no_duplicates_per_mnemonic() {
        let c = classifier();
        for m in [Mnemonic::Add, Mnemonic::Mov, Mnemonic::Paddb, Mnemonic::Vaddps] {
            let cases = c.classify(m);
            let mut words: Vec<u64> = cases.iter().map(|b| b.spec.value()).collect();
            words.sort_unstable();
            let before = words.len();
            words.dedup();
            assert_eq!(before, words.len(), "{m:?} produced duplicate specs");
        }
    }

    #[test]
    fn test_add_has_reg_reg_shape() {
        let c = classifier();
        let cases = c.classify(Mnemonic::Add);
        assert!(!cases.is_empty());
        assert!(cases
            .iter()
            .any(|b| b.spec == InstSpec::pack(&[Gpd, Gpd])));
        assert!(cases
            .iter()
            .any(|b| b.spec == InstSpec::pack(&[Gpd, Mem32])));
    }

    #[test]
    fn test_unsafe_gp_is_filtered() {
        let c = classifier();
        // Privileged / system instructions never classify.
        assert!(c.classify(Mnemonic::Hlt).is_empty());
        assert!(c.classify(Mnemonic::In).is_empty());
        assert!(c.classify(Mnemonic::Wrmsr).is_empty());
        assert!(c.classify(Mnemonic::Cmpxchg).is_empty());
    }

    #[test]
    fn test_call_and_jmp_hand_specs() {
        let c = classifier();
        let call = c.classify(Mnemonic::Call);
        assert_eq!(call.len(), 2);
        assert_eq!(call[0].spec, InstSpec::pack(&[Rel]));
        assert_eq!(call[1].spec, InstSpec::pack(&[Gpq]));
        let jmp = c.classify(Mnemonic::Jmp);
        assert_eq!(jmp.len(), 1);
        assert_eq!(jmp[0].spec, InstSpec::pack(&[Rel]));
    }

    #[test]
    fn test_lea_spec_count() {
        let c = classifier();
        assert_eq!(c.classify(Mnemonic::Lea).len(), 12);
        let c32 = Classifier::new(InstDb::get(), HostCpu::get(), 32);
        assert_eq!(c32.classify(Mnemonic::Lea).len(), 6);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_zero_operand_fast_path() {
        let c = classifier();
        let cpuid = c.classify(Mnemonic::Cpuid);
        assert_eq!(cpuid.len(), 1);
        assert_eq!(cpuid[0].spec.count(), 0);
        let nops = c.classify(Mnemonic::Nop);
        assert!(nops.iter().any(|b| b.spec.count() == 0));
    }

    #[test]
    fn test_gather_scatter_skipped() {
        let c = classifier();
        assert!(c.classify(Mnemonic::Vgatherdps).is_empty());
        assert!(c.classify(Mnemonic::Vscatterdps).is_empty());
    }

    #[test]
    fn test_32bit_filter_drops_gpq() {
        let c32 = Classifier::new(InstDb::get(), HostCpu::get(), 32);
        for b in c32.classify(Mnemonic::Add) {
            for i in 0..b.spec.count() {
                assert_ne!(b.spec.get(i), Gpq);
            }
        }
        assert_eq!(wide_filter(32) & flags::GPQ, 0);
        assert_ne!(wide_filter(64) & flags::GPQ, 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_admitted_specs_are_encodable() {
        let c = classifier();
        for m in [Mnemonic::Add, Mnemonic::Shl, Mnemonic::Paddb] {
            for b in c.classify(m) {
                let ops: Vec<BenchOp> =
                    (0..b.spec.count()).map(|i| probe_op(b.spec.get(i))).collect();
                assert!(build_inst(b.code, &ops).is_ok(), "{:?} not encodable", b.code);
            }
        }
    }

    #[test]
    fn test_shift_by_cl_shape() {
        let c = classifier();
        let cases = c.classify(Mnemonic::Shl);
        assert!(cases.iter().any(|b| b.spec == InstSpec::pack(&[Gpd, Cl])));
    }
}
