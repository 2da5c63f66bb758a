//! Emission of one measurement function.
//!
//! The produced code is `extern "C" fn(n_iter: u32, out: *mut u64)`: it
//! brackets a 64-byte-aligned decrement-and-branch loop with serialised
//! RDTSC reads and writes the cycle delta through `out`. The loop body holds
//! `N_UNROLL` copies of the instruction under test (or nothing in
//! overhead-only mode, keeping all scaffolding so the reading can be
//! subtracted), with per-family scaffolding for implicit registers,
//! division state, stack-modifying push/pop, control transfers and masked
//! vector moves.

use iced_x86::{Code, EncodingKind, Instruction, MemoryOperand, Mnemonic, Register};

use crate::asm::{Asm, Label};
use crate::hostcpu::HostCpu;
use crate::spec::{InstSpec, OperandKind};
use crate::streams::{self, build_streams, BenchOp, OperandStreams};
use crate::types::{BenchError, N_UNROLL};

/// Scratch area above RSP used by memory operand streams. Large enough for
/// the widest stride (64 copies of 64-byte accesses) plus slack.
const SCRATCH_BYTES: i32 = 0x2000;

/// One (mnemonic, form, operand shape) to benchmark.
#[derive(Debug, Clone, Copy)]
pub struct BenchCase {
    pub mnemonic: Mnemonic,
    pub code: Code,
    pub spec: InstSpec,
}

/// Build an instruction from a form id and dynamic operands.
///
/// Covers every operand-category combination the classifier can admit; a
/// combination outside the table is an emission error, reported upward, never
/// a panic.
pub fn build_inst(code: Code, ops: &[BenchOp]) -> Result<Instruction, BenchError> {
    use BenchOp::{Imm, Mem, Reg};

    fn m(base: Register, disp: i64) -> MemoryOperand {
        if disp == 0 {
            MemoryOperand::with_base(base)
        } else {
            MemoryOperand::with_base_displ(base, disp)
        }
    }

    let inst = match *ops {
        [] => Instruction::with(code),

        [Reg(a)] => Instruction::with1(code, a)?,
        [Mem { base, disp }] => Instruction::with1(code, m(base, disp))?,
        [Imm(v)] => Instruction::with1(code, v as u32)?,

        [Reg(a), Reg(b)] => Instruction::with2(code, a, b)?,
        [Reg(a), Mem { base, disp }] => Instruction::with2(code, a, m(base, disp))?,
        [Reg(a), Imm(v)] => Instruction::with2(code, a, v)?,
        [Mem { base, disp }, Reg(b)] => Instruction::with2(code, m(base, disp), b)?,
        [Mem { base, disp }, Imm(v)] => Instruction::with2(code, m(base, disp), v as u32)?,

        [Reg(a), Reg(b), Reg(c)] => Instruction::with3(code, a, b, c)?,
        [Reg(a), Reg(b), Mem { base, disp }] => {
            Instruction::with3(code, a, b, m(base, disp))?
        }
        [Reg(a), Reg(b), Imm(v)] => Instruction::with3(code, a, b, v as u32)?,
        [Reg(a), Mem { base, disp }, Reg(c)] => {
            Instruction::with3(code, a, m(base, disp), c)?
        }
        [Reg(a), Mem { base, disp }, Imm(v)] => {
            Instruction::with3(code, a, m(base, disp), v as u32)?
        }
        [Reg(a), Imm(v), Imm(w)] => {
            Instruction::with3(code, a, v as i32, w as i32)?
        }
        [Mem { base, disp }, Reg(b), Reg(c)] => {
            Instruction::with3(code, m(base, disp), b, c)?
        }
        [Mem { base, disp }, Reg(b), Imm(v)] => {
            Instruction::with3(code, m(base, disp), b, v as u32)?
        }

        [Reg(a), Reg(b), Reg(c), Reg(d)] => Instruction::with4(code, a, b, c, d)?,
        [Reg(a), Reg(b), Mem { base, disp }, Reg(d)] => {
            Instruction::with4(code, a, b, m(base, disp), d)?
        }
        [Reg(a), Reg(b), Reg(c), Imm(v)] => {
            Instruction::with4(code, a, b, c, v as u32)?
        }
        [Reg(a), Reg(b), Mem { base, disp }, Imm(v)] => {
            Instruction::with4(code, a, b, m(base, disp), v as u32)?
        }
        [Reg(a), Reg(b), Imm(v), Imm(w)] => {
            Instruction::with4(code, a, b, v as i32, w as i32)?
        }

        [Reg(a), Reg(b), Reg(c), Reg(d), Imm(v)] => {
            Instruction::with5(code, a, b, c, d, v as u32)?
        }
        [Reg(a), Reg(b), Reg(c), Mem { base, disp }, Imm(v)] => {
            Instruction::with5(code, a, b, c, m(base, disp), v as u32)?
        }

        _ => {
            return Err(BenchError::Emit(format!(
                "unsupported operand combination for {code:?}"
            )))
        }
    };
    Ok(inst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegClass {
    Gp,
    Vec,
    K,
    Mm,
    Other,
}

fn reg_class(r: Register) -> RegClass {
    let in_any = |tables: &[&[Register; 8]]| tables.iter().any(|t| t.contains(&r));
    if in_any(&[&streams::GPB, &streams::GPW, &streams::GPD, &streams::GPQ]) {
        RegClass::Gp
    } else if in_any(&[&streams::XMM, &streams::YMM, &streams::ZMM]) {
        RegClass::Vec
    } else if streams::KREG.contains(&r) {
        RegClass::K
    } else if streams::MMREG.contains(&r) {
        RegClass::Mm
    } else {
        RegClass::Other
    }
}

fn gp32_of(r: Register) -> Result<Register, BenchError> {
    for table in [&streams::GPB, &streams::GPW, &streams::GPD, &streams::GPQ] {
        if let Some(i) = table.iter().position(|&x| x == r) {
            return Ok(streams::GPD[i]);
        }
    }
    Err(BenchError::Emit(format!("no 32-bit alias for {r:?}")))
}

fn xmm_of(r: Register) -> Result<Register, BenchError> {
    for table in [&streams::XMM, &streams::YMM, &streams::ZMM] {
        if let Some(i) = table.iter().position(|&x| x == r) {
            return Ok(streams::XMM[i]);
        }
    }
    Err(BenchError::Emit(format!("no xmm alias for {r:?}")))
}

struct FnLabels {
    end: Label,
    body: Label,
    sub_fn: Label,
}

/// Assemble the whole measurement function for one case.
pub fn assemble(
    case: &BenchCase,
    parallel: bool,
    overhead_only: bool,
    host: &HostCpu,
) -> Result<Vec<u8>, BenchError> {
    let mut s = build_streams(case.spec, parallel);
    pin_maskmov_mask(case.mnemonic, &mut s);

    let mut a = Asm::new();
    let labels = FnLabels {
        end: a.label(),
        body: a.label(),
        sub_fn: a.label(),
    };

    emit_prologue(&mut a)?;
    emit_timestamp_start(&mut a)?;
    emit_state_setup(&mut a, case, &labels)?;

    let stack_op = stack_operation_size(case);

    a.push(Instruction::with2(Code::Test_rm64_r64, Register::R15, Register::R15)?);
    a.branch(Code::Je_rel32_64, labels.end);
    a.align(64);
    a.bind(labels.body);

    if case.mnemonic == Mnemonic::Pop && !overhead_only && stack_op != 0 {
        a.push(Instruction::with2(Code::Sub_rm64_imm32, Register::RSP, stack_op)?);
    }

    emit_body(&mut a, case, &s, parallel, overhead_only, &labels)?;

    if case.mnemonic == Mnemonic::Push && !overhead_only && stack_op != 0 {
        a.push(Instruction::with2(Code::Add_rm64_imm32, Register::RSP, stack_op)?);
    }

    a.push(Instruction::with2(Code::Sub_rm64_imm8, Register::R15, 1i32)?);
    a.branch(Code::Jne_rel32_64, labels.body);
    a.bind(labels.end);

    if case.spec.uses_mm() {
        a.push(Instruction::with(Code::Emms));
    }
    if case.spec.uses_vec() && host.has_avx() {
        a.push(Instruction::with(Code::VEX_Vzeroupper));
    }
    if case.mnemonic == Mnemonic::Call {
        let real_end = a.label();
        a.branch(Code::Jmp_rel32_64, real_end);
        a.bind(labels.sub_fn);
        a.push(Instruction::with(Code::Retnq));
        a.bind(real_end);
    }

    emit_timestamp_end(&mut a)?;
    emit_epilogue(&mut a)?;

    a.encode()
}

fn emit_prologue(a: &mut Asm) -> Result<(), BenchError> {
    for r in [
        Register::RBP,
        Register::RBX,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ] {
        a.push(Instruction::with1(Code::Push_r64, r)?);
    }
    // out pointer and caller rsp survive the body in callee-saved registers.
    a.push(Instruction::with2(Code::Mov_r64_rm64, Register::R14, Register::RSI)?);
    a.push(Instruction::with2(Code::Mov_r64_rm64, Register::R13, Register::RSP)?);
    a.push(Instruction::with2(Code::Sub_rm64_imm32, Register::RSP, SCRATCH_BYTES)?);
    // Aligned scratch keeps the aligned vector load/store forms valid.
    a.push(Instruction::with2(Code::And_rm64_imm8, Register::RSP, -64i32)?);
    a.push(Instruction::with2(Code::Mov_r32_rm32, Register::R15D, Register::EDI)?);
    Ok(())
}

fn emit_epilogue(a: &mut Asm) -> Result<(), BenchError> {
    a.push(Instruction::with2(Code::Mov_r64_rm64, Register::RSP, Register::R13)?);
    for r in [
        Register::R15,
        Register::R14,
        Register::R13,
        Register::R12,
        Register::RBX,
        Register::RBP,
    ] {
        a.push(Instruction::with1(Code::Pop_r64, r)?);
    }
    a.push(Instruction::with(Code::Retnq));
    Ok(())
}

/// lfence / rdtsc / lfence, packed into rax, parked in r12.
fn emit_timestamp_start(a: &mut Asm) -> Result<(), BenchError> {
    emit_rdtsc_packed(a)?;
    a.push(Instruction::with2(Code::Mov_r64_rm64, Register::R12, Register::RAX)?);
    Ok(())
}

fn emit_timestamp_end(a: &mut Asm) -> Result<(), BenchError> {
    emit_rdtsc_packed(a)?;
    a.push(Instruction::with2(Code::Sub_r64_rm64, Register::RAX, Register::R12)?);
    a.push(Instruction::with2(
        Code::Mov_rm64_r64,
        MemoryOperand::with_base(Register::R14),
        Register::RAX,
    )?);
    Ok(())
}

fn emit_rdtsc_packed(a: &mut Asm) -> Result<(), BenchError> {
    a.push(Instruction::with(Code::Lfence));
    a.push(Instruction::with(Code::Rdtsc));
    a.push(Instruction::with(Code::Lfence));
    a.push(Instruction::with2(Code::Shl_rm64_imm8, Register::RDX, 32i32)?);
    a.push(Instruction::with2(Code::Or_r64_rm64, Register::RAX, Register::RDX)?);
    Ok(())
}

fn mov32(a: &mut Asm, r: Register, v: u32) -> Result<(), BenchError> {
    a.push(Instruction::with2(Code::Mov_r32_imm32, r, v)?);
    Ok(())
}

fn xor32(a: &mut Asm, r: Register) -> Result<(), BenchError> {
    a.push(Instruction::with2(Code::Xor_r32_rm32, r, r)?);
    Ok(())
}

/// Pre-loop architectural state, per instruction family.
fn emit_state_setup(a: &mut Asm, case: &BenchCase, labels: &FnLabels) -> Result<(), BenchError> {
    match case.mnemonic {
        Mnemonic::Push | Mnemonic::Pop => {}

        Mnemonic::Call => {
            if case.spec.get(0) != OperandKind::Rel {
                a.lea_label(Register::RAX, labels.sub_fn);
            }
        }

        Mnemonic::Cpuid => {
            xor32(a, Register::EAX)?;
            xor32(a, Register::ECX)?;
        }

        Mnemonic::Xgetbv => {
            xor32(a, Register::ECX)?;
        }

        // Small in-range bit indices so memory-form bit tests stay inside
        // the scratch buffer.
        Mnemonic::Bt | Mnemonic::Btc | Mnemonic::Btr | Mnemonic::Bts => {
            mov32(a, Register::EAX, 3)?;
            mov32(a, Register::EBX, 14)?;
            mov32(a, Register::ECX, 35)?;
            mov32(a, Register::EDX, 256)?;
            mov32(a, Register::ESI, 577)?;
            mov32(a, Register::EDI, 1198)?;
            mov32(a, Register::EBP, 77)?;
        }

        // Predictable state costs a few cycles once; ecx stays small because
        // it is the divisor of the division families.
        _ => {
            mov32(a, Register::EAX, 999)?;
            mov32(a, Register::EBX, 49182)?;
            mov32(a, Register::ECX, 3)?;
            mov32(a, Register::EDX, 1193833)?;
            mov32(a, Register::ESI, 192822)?;
            mov32(a, Register::EDI, 1)?;
            mov32(a, Register::EBP, 3333)?;
        }
    }

    if is_maskmov(case.mnemonic) {
        a.push(Instruction::with3(
            Code::VEX_Vpxor_xmm_xmm_xmmm128,
            Register::XMM0,
            Register::XMM0,
            Register::XMM0,
        )?);
        a.push(Instruction::with3(
            Code::VEX_Vpcmpeqd_ymm_ymm_ymmm256,
            Register::YMM1,
            Register::YMM1,
            Register::YMM1,
        )?);
        a.push(Instruction::with3(
            Code::VEX_Vpsrldq_ymm_ymm_imm8,
            Register::YMM1,
            Register::YMM1,
            8u32,
        )?);
    }
    Ok(())
}

fn is_maskmov(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Vmaskmovps | Mnemonic::Vmaskmovpd | Mnemonic::Vpmaskmovd | Mnemonic::Vpmaskmovq
    )
}

/// The mask operand of the masked-move family is pinned to register id 1,
/// which the state setup fills with a half-set compare mask.
fn pin_maskmov_mask(m: Mnemonic, s: &mut OperandStreams) {
    if !is_maskmov(m) || s.cols.len() < 2 {
        return;
    }
    for op in &mut s.cols[1] {
        if let BenchOp::Reg(r) = op {
            if streams::YMM.contains(r) {
                *r = Register::YMM1;
            } else if streams::XMM.contains(r) {
                *r = Register::XMM1;
            }
        }
    }
}

/// Bytes push/pop move the stack pointer per copy, times the unroll count.
fn stack_operation_size(case: &BenchCase) -> i32 {
    if case.mnemonic != Mnemonic::Push && case.mnemonic != Mnemonic::Pop {
        return 0;
    }
    let width = if case.code.op_code().operand_size() == 16 { 2 } else { 8 };
    width * N_UNROLL as i32
}

fn emit_body(
    a: &mut Asm,
    case: &BenchCase,
    s: &OperandStreams,
    parallel: bool,
    overhead_only: bool,
    labels: &FnLabels,
) -> Result<(), BenchError> {
    match case.mnemonic {
        Mnemonic::Call => {
            if overhead_only {
                return Ok(());
            }
            for _ in 0..N_UNROLL {
                if case.spec.get(0) == OperandKind::Rel {
                    a.branch(Code::Call_rel32_64, labels.sub_fn);
                } else {
                    a.push(Instruction::with1(Code::Call_rm64, Register::RAX)?);
                }
            }
            Ok(())
        }

        Mnemonic::Jmp => {
            if overhead_only {
                return Ok(());
            }
            for _ in 0..N_UNROLL {
                let next = a.label();
                a.branch(Code::Jmp_rel32_64, next);
                a.bind(next);
            }
            Ok(())
        }

        Mnemonic::Div | Mnemonic::Idiv => emit_div_body(a, case, parallel, overhead_only),

        Mnemonic::Mul | Mnemonic::Imul if s.op_count <= 2 => {
            emit_mul_body(a, case, s, parallel, overhead_only)
        }

        Mnemonic::Lea => emit_lea_body(a, case, s, overhead_only),

        _ => emit_default_body(a, case, s, parallel, overhead_only),
    }
}

/// Division: quotient state is re-seeded around every copy and the divisor is
/// forced into the count-register alias of the operand width (which the
/// common prologue seeded with 3).
fn emit_div_body(
    a: &mut Asm,
    case: &BenchCase,
    parallel: bool,
    overhead_only: bool,
) -> Result<(), BenchError> {
    if overhead_only {
        return Ok(());
    }
    use OperandKind::*;
    let kind = case.spec.get(0);
    let byte_form = matches!(kind, Gpb | Mem8);
    let divisor = match kind {
        Gpb | Mem8 => Register::CL,
        Gpw | Mem16 => Register::CX,
        Gpd | Mem32 => Register::ECX,
        _ => Register::RCX,
    };

    for n in 0..N_UNROLL {
        if byte_form {
            if n == 0 {
                mov32(a, Register::EAX, 127)?;
            }
            a.push(Instruction::with1(case.code, divisor)?);
            if n + 1 != N_UNROLL {
                mov32(a, Register::EAX, 127)?;
            }
        } else {
            xor32(a, Register::EDX)?;
            if n == 0 {
                mov32(a, Register::EAX, 32123)?;
            }
            a.push(Instruction::with1(case.code, divisor)?);
            if n + 1 != N_UNROLL {
                xor32(a, Register::EDX)?;
                if parallel {
                    mov32(a, Register::EAX, 32123)?;
                }
            }
        }
    }
    Ok(())
}

/// Widening multiplies accumulate into fixed registers; the parallel variant
/// re-materialises the input before every copy so successive copies do not
/// serialise on the implicit accumulator.
fn emit_mul_body(
    a: &mut Asm,
    case: &BenchCase,
    s: &OperandStreams,
    parallel: bool,
    overhead_only: bool,
) -> Result<(), BenchError> {
    if overhead_only {
        return Ok(());
    }
    for n in 0..N_UNROLL {
        if s.op_count == 1 {
            if parallel {
                match s.cols[0][n] {
                    BenchOp::Reg(src) => {
                        a.push(Instruction::with2(
                            Code::Mov_r32_rm32,
                            Register::EAX,
                            gp32_of(src)?,
                        )?);
                    }
                    _ => mov32(a, Register::EAX, 32123)?,
                }
            }
            let ops = [s.cols[0][n]];
            a.push(build_inst(case.code, &ops)?);
        } else {
            if parallel {
                if let (BenchOp::Reg(dst), BenchOp::Reg(src)) = (s.cols[0][n], s.cols[1][n]) {
                    a.push(Instruction::with2(
                        Code::Mov_r32_rm32,
                        gp32_of(dst)?,
                        gp32_of(src)?,
                    )?);
                }
            }
            let ops = [s.cols[0][n], s.cols[1][n]];
            a.push(build_inst(case.code, &ops)?);
        }
    }
    Ok(())
}

/// lea operands are reconstituted into one addressing expression.
fn emit_lea_body(
    a: &mut Asm,
    case: &BenchCase,
    s: &OperandStreams,
    overhead_only: bool,
) -> Result<(), BenchError> {
    if overhead_only {
        return Ok(());
    }
    for n in 0..N_UNROLL {
        let dst = match s.cols[0][n] {
            BenchOp::Reg(r) => r,
            _ => return Err(BenchError::Emit("lea destination must be a register".into())),
        };
        let base = match s.cols[1][n] {
            BenchOp::Reg(r) => r,
            _ => return Err(BenchError::Emit("lea base must be a register".into())),
        };
        let mem = match s.op_count {
            2 => MemoryOperand::with_base(base),
            3 => match s.cols[2][n] {
                BenchOp::Reg(index) => MemoryOperand::with_base_index(base, index),
                BenchOp::Imm(v) => MemoryOperand::with_base_displ(base, v as i64),
                _ => return Err(BenchError::Emit("bad lea operand".into())),
            },
            _ => {
                let index = match s.cols[2][n] {
                    BenchOp::Reg(r) => r,
                    _ => return Err(BenchError::Emit("bad lea index".into())),
                };
                let disp = match s.cols[3][n] {
                    BenchOp::Imm(v) => v as i64,
                    _ => return Err(BenchError::Emit("bad lea displacement".into())),
                };
                MemoryOperand::new(base, index, 1, disp, 1, false, Register::None)
            }
        };
        a.push(Instruction::with2(case.code, dst, mem)?);
    }
    Ok(())
}

/// Default emission, including the serial dependency-injection fallback.
///
/// When the destination register class never appears among the sources (and
/// for the conversion family plus register pop, whose data flow runs through
/// fixed registers), neither rotation pattern yields a chain, so each copy is
/// followed by a fold of the destination into a scratch accumulator and a
/// self-combine of the source. The same scaffolding is emitted in overhead
/// mode, which cancels its cost out of the final reading.
fn emit_default_body(
    a: &mut Asm,
    case: &BenchCase,
    s: &OperandStreams,
    parallel: bool,
    overhead_only: bool,
) -> Result<(), BenchError> {
    // Conversion instructions have no explicit operands at all; their chain
    // runs eax -> (edx or rax) -> folded back into eax.
    if !parallel
        && matches!(
            case.mnemonic,
            Mnemonic::Cdq | Mnemonic::Cdqe | Mnemonic::Cqo | Mnemonic::Cwd
        )
    {
        let dst = match case.mnemonic {
            Mnemonic::Cdqe => Register::EAX,
            _ => Register::EDX,
        };
        for _ in 0..N_UNROLL {
            if !overhead_only {
                a.push(Instruction::with(case.code));
            }
            emit_fold_dst(a, dst, true)?;
            emit_fold_src(a, Register::EAX, true)?;
        }
        return Ok(());
    }

    if !parallel && s.op_count >= 1 {
        if let BenchOp::Reg(dst) = s.cols[0][0] {
            let dst_class = reg_class(dst);
            let mut same_kind = false;
            for slot in 1..s.op_count.min(4) {
                if let BenchOp::Reg(r) = s.cols[slot][0] {
                    if reg_class(r) == dst_class {
                        same_kind = true;
                    }
                }
            }
            let fire = (s.op_count >= 2 && !same_kind) || case.mnemonic == Mnemonic::Pop;
            if fire {
                let legacy = case.code.op_code().encoding() == EncodingKind::Legacy;
                let first: Vec<BenchOp> = (0..s.op_count).map(|i| s.cols[i][0]).collect();
                for _ in 0..N_UNROLL {
                    if !overhead_only {
                        a.push(build_inst(case.code, &first)?);
                    }
                    emit_fold_dst(a, dst, legacy)?;
                    if s.op_count >= 2 {
                        if let BenchOp::Reg(src) = s.cols[1][0] {
                            emit_fold_src(a, src, legacy)?;
                        }
                    }
                }
                return Ok(());
            }
        }
    }

    if overhead_only {
        return Ok(());
    }
    for n in 0..N_UNROLL {
        let ops: Vec<BenchOp> = (0..s.op_count).map(|i| s.cols[i][n]).collect();
        a.push(build_inst(case.code, &ops)?);
    }
    Ok(())
}

/// Fold the destination register into the scratch accumulator of its class.
fn emit_fold_dst(a: &mut Asm, dst: Register, legacy: bool) -> Result<(), BenchError> {
    match reg_class(dst) {
        RegClass::Gp => {
            a.push(Instruction::with2(Code::Add_r32_rm32, Register::EAX, gp32_of(dst)?)?);
        }
        RegClass::K => {
            a.push(Instruction::with3(Code::VEX_Korw_kr_kr_kr, Register::K7, Register::K7, dst)?);
        }
        RegClass::Mm => {
            a.push(Instruction::with2(Code::Paddb_mm_mmm64, Register::MM7, dst)?);
        }
        RegClass::Vec if legacy && streams::XMM.contains(&dst) => {
            a.push(Instruction::with2(Code::Paddb_xmm_xmmm128, Register::XMM7, dst)?);
        }
        RegClass::Vec => {
            a.push(Instruction::with3(
                Code::VEX_Vpaddb_xmm_xmm_xmmm128,
                Register::XMM7,
                Register::XMM7,
                xmm_of(dst)?,
            )?);
        }
        RegClass::Other => {
            return Err(BenchError::Emit(format!("no scratch accumulator for {dst:?}")))
        }
    }
    Ok(())
}

/// Self-combine a source register so it carries a chain of its own.
fn emit_fold_src(a: &mut Asm, src: Register, legacy: bool) -> Result<(), BenchError> {
    match reg_class(src) {
        RegClass::Gp => {
            let r = gp32_of(src)?;
            a.push(Instruction::with2(Code::Add_r32_rm32, r, r)?);
        }
        RegClass::K => {
            a.push(Instruction::with3(Code::VEX_Korw_kr_kr_kr, src, Register::K7, src)?);
        }
        RegClass::Mm => {
            a.push(Instruction::with2(Code::Paddb_mm_mmm64, src, src)?);
        }
        RegClass::Vec if legacy && streams::XMM.contains(&src) => {
            a.push(Instruction::with2(Code::Paddb_xmm_xmmm128, src, src)?);
        }
        RegClass::Vec => {
            let x = xmm_of(src)?;
            a.push(Instruction::with3(
                Code::VEX_Vpaddb_xmm_xmm_xmmm128,
                x,
                Register::XMM7,
                x,
            )?);
        }
        RegClass::Other => {
            return Err(BenchError::Emit(format!("no self-combine for {src:?}")))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::OperandKind::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn case(m: Mnemonic, code: Code, kinds: &[OperandKind]) -> BenchCase {
        BenchCase { mnemonic: m, code, spec: InstSpec::pack(kinds) }
    }

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        let mut dec = Decoder::new(64, bytes, DecoderOptions::NONE);
        let mut out = Vec::new();
        while dec.can_decode() {
            out.push(dec.decode());
        }
        out
    }

    fn assemble_ok(case: &BenchCase, parallel: bool, overhead: bool) -> Vec<Instruction> {
        let bytes = assemble(case, parallel, overhead, HostCpu::get()).unwrap();
        decode_all(&bytes)
    }

    #[test]
    fn test_nop_body_has_unroll_copies() {
        let c = case(Mnemonic::Nop, Code::Nopd, &[]);
        let insts = assemble_ok(&c, true, false);
        // 64 measured nops plus the alignment nop padding before the loop.
        let nops = insts.iter().filter(|i| i.code() == Code::Nopd).count();
        assert!(nops >= N_UNROLL, "expected at least {N_UNROLL} nops, got {nops}");
        assert!(insts.iter().any(|i| i.code() == Code::Rdtsc));
        assert_eq!(insts.iter().filter(|i| i.code() == Code::Rdtsc).count(), 2);
        assert_eq!(insts.last().unwrap().code(), Code::Retnq);
    }

    #[test]
    fn test_overhead_body_omits_instruction() {
        let c = case(Mnemonic::Add, Code::Add_r32_rm32, &[Gpd, Gpd]);
        let active = assemble_ok(&c, true, false);
        let overhead = assemble_ok(&c, true, true);
        let count = |v: &[Instruction]| {
            v.iter().filter(|i| i.code() == Code::Add_r32_rm32).count()
        };
        assert_eq!(count(&active), N_UNROLL);
        assert_eq!(count(&overhead), 0);
        // The loop skeleton survives in overhead mode.
        assert!(overhead.iter().any(|i| i.code() == Code::Jne_rel32_64));
    }

    #[test]
    fn test_parallel_distinct_destinations() {
        let c = case(Mnemonic::Add, Code::Add_r32_rm32, &[Gpd, Gpd]);
        let insts = assemble_ok(&c, true, false);
        let adds: Vec<&Instruction> = insts
            .iter()
            .filter(|i| i.code() == Code::Add_r32_rm32)
            .collect();
        for w in adds.windows(2) {
            assert_ne!(
                w[0].op0_register(),
                w[1].op0_register(),
                "consecutive parallel copies share a destination"
            );
        }
    }

    #[test]
    fn test_serial_chain_feeds_previous_destination() {
        let c = case(Mnemonic::Add, Code::Add_r32_rm32, &[Gpd, Gpd]);
        let insts = assemble_ok(&c, false, false);
        let adds: Vec<&Instruction> = insts
            .iter()
            .filter(|i| i.code() == Code::Add_r32_rm32)
            .collect();
        assert_eq!(adds.len(), N_UNROLL);
        for w in adds.windows(2) {
            assert_eq!(w[1].op1_register(), w[0].op0_register());
        }
    }

    #[test]
    fn test_push_compensation_balances_stack() {
        let c = case(Mnemonic::Push, Code::Push_r64, &[Gpq]);
        let insts = assemble_ok(&c, false, false);
        let add_rsp = insts.iter().find(|i| {
            i.code() == Code::Add_rm64_imm32 && i.op0_register() == Register::RSP
        });
        let add_rsp = add_rsp.expect("push loop must restore rsp");
        assert_eq!(add_rsp.immediate(1), 8 * N_UNROLL as u64);
        // Overhead mode keeps the loop but not the compensation.
        let overhead = assemble_ok(&c, false, true);
        assert!(!overhead.iter().any(|i| {
            i.code() == Code::Add_rm64_imm32 && i.op0_register() == Register::RSP
        }));
    }

    #[test]
    fn test_pop_pre_decrements_stack() {
        let c = case(Mnemonic::Pop, Code::Pop_r64, &[Gpq]);
        let insts = assemble_ok(&c, false, false);
        // The loop-top sub is the second rsp subtraction (the first is the
        // scratch allocation in the prologue).
        let subs: Vec<&Instruction> = insts
            .iter()
            .filter(|i| i.code() == Code::Sub_rm64_imm32 && i.op0_register() == Register::RSP)
            .collect();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1].immediate(1), 8 * N_UNROLL as u64);
    }

    #[test]
    fn test_pop_serial_gets_dependency_injection() {
        let c = case(Mnemonic::Pop, Code::Pop_r64, &[Gpq]);
        let insts = assemble_ok(&c, false, false);
        let folds = insts
            .iter()
            .filter(|i| i.code() == Code::Add_r32_rm32 && i.op0_register() == Register::EAX)
            .count();
        assert_eq!(folds, N_UNROLL);
    }

    #[test]
    fn test_div_reseeds_quotient() {
        let c = case(Mnemonic::Div, Code::Div_rm8, &[Gpb]);
        let insts = assemble_ok(&c, false, false);
        let divs = insts.iter().filter(|i| i.code() == Code::Div_rm8).count();
        assert_eq!(divs, N_UNROLL);
        // ax is re-seeded to 127 before every copy.
        let seeds = insts
            .iter()
            .filter(|i| {
                i.code() == Code::Mov_r32_imm32
                    && i.op0_register() == Register::EAX
                    && i.immediate(1) == 127
            })
            .count();
        assert_eq!(seeds, N_UNROLL);
        // The divisor is pinned to cl.
        assert!(insts
            .iter()
            .filter(|i| i.code() == Code::Div_rm8)
            .all(|i| i.op0_register() == Register::CL));
    }

    #[test]
    fn test_call_rel_emits_sub_function() {
        let c = case(Mnemonic::Call, Code::Call_rel32_64, &[Rel]);
        let insts = assemble_ok(&c, false, false);
        let calls = insts.iter().filter(|i| i.code() == Code::Call_rel32_64).count();
        assert_eq!(calls, N_UNROLL);
        // Exactly two rets: the sub-function and the epilogue.
        let rets = insts.iter().filter(|i| i.code() == Code::Retnq).count();
        assert_eq!(rets, 2);
    }

    #[test]
    fn test_jmp_body_jumps_to_next() {
        let c = case(Mnemonic::Jmp, Code::Jmp_rel32_64, &[Rel]);
        let bytes = assemble(&c, false, false, HostCpu::get()).unwrap();
        let mut dec = Decoder::new(64, &bytes, DecoderOptions::NONE);
        let mut jmp_count = 0;
        while dec.can_decode() {
            let i = dec.decode();
            if i.code() == Code::Jmp_rel32_64 && jmp_count < N_UNROLL {
                // Ignore the final jump over the (absent) sub-function; the
                // measured jumps all land on the following instruction.
                if i.near_branch_target() == i.ip() + i.len() as u64 {
                    jmp_count += 1;
                }
            }
        }
        assert_eq!(jmp_count, N_UNROLL);
    }

    #[test]
    fn test_cdq_serial_injection() {
        let c = case(Mnemonic::Cdq, Code::Cdq, &[]);
        let insts = assemble_ok(&c, false, false);
        let cdqs = insts.iter().filter(|i| i.code() == Code::Cdq).count();
        assert_eq!(cdqs, N_UNROLL);
        // add eax, edx then add eax, eax after every copy.
        let folds = insts
            .iter()
            .filter(|i| i.code() == Code::Add_r32_rm32 && i.op1_register() == Register::EDX)
            .count();
        assert_eq!(folds, N_UNROLL);
    }

    #[test]
    fn test_movd_serial_injection_uses_scratch() {
        // movd mm, r32: destination class absent from sources.
        let c = case(Mnemonic::Movd, Code::Movd_mm_rm32, &[Mm, Gpd]);
        let insts = assemble_ok(&c, false, false);
        let folds = insts
            .iter()
            .filter(|i| i.code() == Code::Paddb_mm_mmm64 && i.op0_register() == Register::MM7)
            .count();
        assert_eq!(folds, N_UNROLL);
        // MMX use forces emms cleanup.
        assert!(insts.iter().any(|i| i.code() == Code::Emms));
    }

    #[test]
    fn test_loop_skeleton_shape() {
        let c = case(Mnemonic::Nop, Code::Nopd, &[]);
        let bytes = assemble(&c, false, false, HostCpu::get()).unwrap();
        let insts = decode_all(&bytes);
        let jne = insts.iter().find(|i| i.code() == Code::Jne_rel32_64).unwrap();
        assert_eq!(jne.near_branch_target() % 64, 0, "loop head must be 64-aligned");
        assert!(insts.iter().any(|i| i.code() == Code::Test_rm64_r64));
    }
}
