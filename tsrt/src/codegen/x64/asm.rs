//! Encoding x64 instructions into machine code blocks. Uses [iced_x86] to do the encoding.

use crate::{
    codegen::codebuf::MachineCodeBlock,
    error::CompilationError,
    log::{log_ir, should_log_ir, IRPhase},
};
use iced_x86::{Encoder, Formatter, Instruction as Op, NasmFormatter};

pub(super) struct Asm {
    /// A scratch Icedx86 encoding buffer used solely by [Self::push_inst] to avoid
    /// reallocations.
    enc: Encoder,
    /// A scratch Icedx86 formatter used solely by [Self::push_inst]. Set to `None` if logging is
    /// not enabled.
    fmtr: Option<NasmFormatter>,
}

impl Asm {
    pub(super) fn new() -> Self {
        let fmtr = if should_log_ir(IRPhase::Asm) {
            let mut fmtr = NasmFormatter::new();
            fmtr.options_mut().set_branch_leading_zeros(false);
            fmtr.options_mut().set_hex_prefix("0x");
            fmtr.options_mut().set_hex_suffix("");
            fmtr.options_mut().set_show_branch_size(false);
            fmtr.options_mut().set_space_after_operand_separator(true);
            Some(fmtr)
        } else {
            None
        };
        Asm {
            enc: Encoder::new(64),
            fmtr,
        }
    }

    /// Log a comment line if assembly logging is enabled.
    pub(super) fn log(&self, s: &str) {
        if self.fmtr.is_some() {
            log_ir(&format!("; {s}\n"));
        }
    }

    /// Encode `op` at the cursor of `mc` and append it.
    pub(super) fn push_inst(
        &mut self,
        mc: &mut MachineCodeBlock,
        op: Result<Op, iced_x86::IcedError>,
    ) -> Result<(), CompilationError> {
        let inst = op.map_err(|e| CompilationError::InternalError(e.to_string()))?;
        let ip = u64::try_from(mc.tell()).unwrap();
        self.enc
            .encode(&inst, ip)
            .map_err(|e| CompilationError::InternalError(e.to_string()))?;
        let mut enc_buf = self.enc.take_buffer();
        let r = mc.write(&enc_buf);
        enc_buf.clear();
        self.enc.set_buffer(enc_buf);
        r?;

        if let Some(fmtr) = &mut self.fmtr {
            let mut s = String::new();
            fmtr.format(&inst, &mut s);
            log_ir(&format!("  {ip:x}: {s}\n"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codegen::codebuf::CodePool;
    use iced_x86::{Code, Decoder, DecoderOptions, Instruction, IntelFormatter, Register};

    /// Disassemble `len` bytes at `addr` into Intel syntax, one string per instruction.
    pub(crate) fn disassemble(addr: usize, len: usize) -> Vec<String> {
        let code = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
        let mut decoder = Decoder::with_ip(64, code, addr as u64, DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        formatter
            .options_mut()
            .set_space_after_operand_separator(true);
        formatter.options_mut().set_hex_prefix("0x");
        formatter.options_mut().set_hex_suffix("");
        formatter.options_mut().set_uppercase_hex(false);
        formatter.options_mut().set_branch_leading_zeros(false);
        formatter.options_mut().set_show_branch_size(false);
        let mut instruction = Instruction::default();
        let mut out = Vec::new();
        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            let mut s = String::new();
            formatter.format(&instruction, &mut s);
            out.push(s);
        }
        out
    }

    #[test]
    fn push_and_overflow() {
        let mut pool = CodePool::new(4096, 1024).unwrap();
        let mut mc = pool.open_mc().unwrap();
        let start = mc.tell();
        let mut asm = Asm::new();
        asm.push_inst(&mut mc, Op::with2(Code::Mov_r64_imm64, Register::RAX, 42i64))
            .unwrap();
        asm.push_inst(&mut mc, Ok(Op::with(Code::Retnq))).unwrap();
        assert_eq!(
            disassemble(start, mc.tell() - start),
            vec!["mov rax, 0x2a", "ret"]
        );
        let mut region = MachineCodeBlock::over(mc.tell(), mc.tell() + 4);
        assert!(matches!(
            asm.push_inst(&mut region, Op::with2(Code::Mov_r64_imm64, Register::RAX, 1i64)),
            Err(CompilationError::CodeBlockOverflow(10, 4))
        ));
    }
}
