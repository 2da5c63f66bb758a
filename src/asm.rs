//! Minimal two-pass assembler over the iced-x86 encoder.
//!
//! The emitted measurement functions only ever branch within themselves, so
//! the whole body is encoded at IP 0 and stays position-independent: the
//! bytes can be copied into any executable buffer unchanged. Labels are
//! resolved with two passes. Every label-consuming instruction is emitted in
//! a fixed-length form (rel32 branches, RIP-relative lea), so pass one,
//! which encodes with placeholder targets, already produces the final
//! layout, and pass two only rewrites displacements.

use iced_x86::{Code, Encoder, Instruction, MemoryOperand, Register};

use crate::types::BenchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

enum Item {
    Inst(Instruction),
    /// rel32 jump/call to a label.
    Branch { code: Code, target: Label },
    /// RIP-relative `lea reg, [label]`.
    LeaLabel { dst: Register, target: Label },
    Bind(Label),
    /// Pad with single-byte nops to the given power-of-two boundary.
    Align(usize),
}

pub struct Asm {
    items: Vec<Item>,
    label_count: usize,
}

impl Asm {
    pub fn new() -> Asm {
        Asm { items: Vec::new(), label_count: 0 }
    }

    pub fn label(&mut self) -> Label {
        let l = Label(self.label_count);
        self.label_count += 1;
        l
    }

    pub fn bind(&mut self, label: Label) {
        self.items.push(Item::Bind(label));
    }

    pub fn align(&mut self, boundary: usize) {
        debug_assert!(boundary.is_power_of_two());
        self.items.push(Item::Align(boundary));
    }

    pub fn push(&mut self, inst: Instruction) {
        self.items.push(Item::Inst(inst));
    }

    pub fn branch(&mut self, code: Code, target: Label) {
        self.items.push(Item::Branch { code, target });
    }

    pub fn lea_label(&mut self, dst: Register, target: Label) {
        self.items.push(Item::LeaLabel { dst, target });
    }

    /// Encode everything at IP 0 and return the bytes.
    pub fn encode(&self) -> Result<Vec<u8>, BenchError> {
        let mut offsets = vec![0u64; self.label_count];
        // Pass one fixes the layout (all label forms are fixed-length),
        // pass two patches the real displacements in.
        self.pass(&mut offsets)?;
        let out = self.pass(&mut offsets)?;
        Ok(out)
    }

    fn pass(&self, offsets: &mut [u64]) -> Result<Vec<u8>, BenchError> {
        fn emit_one(
            enc: &mut Encoder,
            out: &mut Vec<u8>,
            inst: &Instruction,
        ) -> Result<(), BenchError> {
            enc.encode(inst, out.len() as u64)
                .map_err(|e| BenchError::Emit(e.to_string()))?;
            out.append(&mut enc.take_buffer());
            Ok(())
        }

        let mut enc = Encoder::new(64);
        let mut out: Vec<u8> = Vec::with_capacity(4096);

        for item in &self.items {
            match item {
                Item::Inst(inst) => emit_one(&mut enc, &mut out, inst)?,
                Item::Branch { code, target } => {
                    let inst = Instruction::with_branch(*code, offsets[target.0])?;
                    emit_one(&mut enc, &mut out, &inst)?;
                }
                Item::LeaLabel { dst, target } => {
                    let mem = MemoryOperand::with_base_displ(
                        Register::RIP,
                        offsets[target.0] as i64,
                    );
                    let inst = Instruction::with2(Code::Lea_r64_m, *dst, mem)?;
                    emit_one(&mut enc, &mut out, &inst)?;
                }
                Item::Bind(label) => {
                    offsets[label.0] = out.len() as u64;
                }
                Item::Align(boundary) => {
                    while out.len() % boundary != 0 {
                        out.push(0x90);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for Asm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        let mut dec = Decoder::new(64, bytes, DecoderOptions::NONE);
        let mut out = Vec::new();
        while dec.can_decode() {
            out.push(dec.decode());
        }
        out
    }

    #[test]
    fn test_backward_branch_targets_label() {
        let mut a = Asm::new();
        let body = a.label();
        a.bind(body);
        a.push(Instruction::with2(Code::Add_r32_rm32, Register::EAX, Register::ECX).unwrap());
        a.push(Instruction::with2(Code::Sub_rm64_imm8, Register::R15, 1i32).unwrap());
        a.branch(Code::Jne_rel32_64, body);
        a.push(Instruction::with(Code::Retnq));

        let bytes = a.encode().unwrap();
        let insts = decode_all(&bytes);
        let jne = insts
            .iter()
            .find(|i| i.code() == Code::Jne_rel32_64)
            .expect("jne missing");
        assert_eq!(jne.near_branch_target(), 0, "back-edge must target offset 0");
    }

    #[test]
    fn test_forward_branch_resolves_on_second_pass() {
        let mut a = Asm::new();
        let end = a.label();
        a.branch(Code::Je_rel32_64, end);
        a.push(Instruction::with2(Code::Mov_r32_imm32, Register::EAX, 7u32).unwrap());
        a.bind(end);
        a.push(Instruction::with(Code::Retnq));

        let bytes = a.encode().unwrap();
        let insts = decode_all(&bytes);
        assert_eq!(insts[0].code(), Code::Je_rel32_64);
        // je (6) + mov eax, imm32 (5) = 11.
        assert_eq!(insts[0].near_branch_target(), 11);
        assert_eq!(insts[2].code(), Code::Retnq);
    }

    #[test]
    fn test_align_pads_with_nops() {
        let mut a = Asm::new();
        a.push(Instruction::with(Code::Retnq));
        a.align(64);
        let body = a.label();
        a.bind(body);
        a.push(Instruction::with(Code::Retnq));
        let bytes = a.encode().unwrap();
        assert_eq!(bytes.len(), 65);
        assert!(bytes[1..64].iter().all(|&b| b == 0x90));
        assert_eq!(bytes[64], 0xC3);
    }

    #[test]
    fn test_lea_label_is_rip_relative() {
        let mut a = Asm::new();
        let fnlab = a.label();
        a.lea_label(Register::RAX, fnlab);
        a.push(Instruction::with(Code::Retnq));
        a.bind(fnlab);
        a.push(Instruction::with(Code::Retnq));

        let bytes = a.encode().unwrap();
        let insts = decode_all(&bytes);
        assert_eq!(insts[0].code(), Code::Lea_r64_m);
        assert_eq!(insts[0].memory_base(), Register::RIP);
        // lea (7) + ret (1) = 8, which is where the label lives.
        assert_eq!(insts[0].memory_displacement64(), 8);
    }

    #[test]
    fn test_two_pass_layout_is_stable() {
        let mut a = Asm::new();
        let end = a.label();
        let body = a.label();
        a.push(Instruction::with2(Code::Test_rm64_r64, Register::R15, Register::R15).unwrap());
        a.branch(Code::Je_rel32_64, end);
        a.align(64);
        a.bind(body);
        a.push(Instruction::with2(Code::Add_r32_rm32, Register::EAX, Register::EBX).unwrap());
        a.push(Instruction::with2(Code::Sub_rm64_imm8, Register::R15, 1i32).unwrap());
        a.branch(Code::Jne_rel32_64, body);
        a.bind(end);
        a.push(Instruction::with(Code::Retnq));

        let bytes = a.encode().unwrap();
        let insts = decode_all(&bytes);
        let jne = insts.iter().find(|i| i.code() == Code::Jne_rel32_64).unwrap();
        assert_eq!(jne.near_branch_target(), 64, "loop head must be aligned");
    }
}
