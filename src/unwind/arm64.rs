//! ARM64 virtual unwinder.
//!
//! ARM64 function entries come in two forms, selected by the low two bits of the second
//! word of the `.pdata` entry:
//!
//! - **packed** (`Flag` 1 or 2): the canonical prologue is described entirely by bit fields
//!   (saved integer and FP register counts, home area, frame chain kind and frame size);
//! - **full** (`Flag` 0): the word is the RVA of an `.xdata` record holding a header, optional
//!   epilogue scopes, a byte stream of unwind codes and optionally the handler RVA.
//!
//! Unwind codes are listed in the reverse order of the prologue instructions. A pc inside the
//! prologue or inside one of the recorded epilogues replays only the codes for the
//! instructions that have actually executed.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::{
    image::Machine,
    unwind::{
        memory::MemoryReader,
        table::{FunctionLookup, FunctionTables, RuntimeFunction},
        FrameUnwind, UnwindContext, UnwindEngine, UnwindFlags,
    },
    Error, Result,
};

/// Index of the frame pointer in [`Arm64Context::x`].
pub const FP: usize = 29;
/// Index of the link register in [`Arm64Context::x`].
pub const LR: usize = 30;

/// ARM64 register snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Arm64Context {
    /// X0-X28, FP (X29) and LR (X30)
    pub x: [u64; 31],
    /// Stack pointer
    pub sp: u64,
    /// Program counter
    pub pc: u64,
    /// Vector registers
    pub v: [u128; 32],
    /// Processor state
    pub cpsr: u32,
    /// Floating point control register
    pub fpcr: u32,
    /// Floating point status register
    pub fpsr: u32,
    /// Whether `pc` is a return address (`CONTEXT_UNWOUND_TO_CALL`)
    pub unwound_to_call: bool,
}

impl Arm64Context {
    /// Create a context with `pc`, `sp` and `lr` set.
    pub fn new(pc: u64, sp: u64, lr: u64) -> Self {
        let mut context = Arm64Context {
            pc,
            sp,
            ..Default::default()
        };
        context.x[LR] = lr;
        context
    }

    /// Frame pointer.
    pub fn fp(&self) -> u64 {
        self.x[FP]
    }

    /// Link register.
    pub fn lr(&self) -> u64 {
        self.x[LR]
    }

    fn set_d(&mut self, index: usize, value: u64) {
        if let Some(v) = self.v.get_mut(index) {
            *v = (*v & !(u64::MAX as u128)) | value as u128;
        }
    }
}

impl UnwindContext for Arm64Context {
    fn instruction_pointer(&self) -> u64 {
        self.pc
    }

    fn set_instruction_pointer(&mut self, ip: u64) {
        self.pc = ip;
    }

    fn stack_pointer(&self) -> u64 {
        self.sp
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.sp = sp;
    }

    fn set_return_value(&mut self, value: u64) {
        self.x[0] = value;
    }

    fn unwound_to_call(&self) -> bool {
        self.unwound_to_call
    }

    fn jump_buffer_target(&self, memory: &dyn MemoryReader, buffer: u64) -> Result<u64> {
        memory.read_u64(buffer + 104)
    }

    fn restore_jump_buffer(&mut self, memory: &dyn MemoryReader, buffer: u64) -> Result<()> {
        // Frame, Reserved, X19-X28, Fp, Lr, Sp, Fpcr, Fpsr, D8-D15
        for i in 0..10 {
            self.x[19 + i] = memory.read_u64(buffer + 16 + 8 * i as u64)?;
        }
        self.x[FP] = memory.read_u64(buffer + 96)?;
        self.x[LR] = memory.read_u64(buffer + 104)?;
        self.sp = memory.read_u64(buffer + 112)?;
        self.fpcr = memory.read_u32(buffer + 120)?;
        self.fpsr = memory.read_u32(buffer + 124)?;
        for i in 0..8 {
            let d = memory.read_u64(buffer + 128 + 8 * i as u64)?;
            self.set_d(8 + i, d);
        }
        Ok(())
    }
}

/// Length in bytes of the unwind code starting with `op`.
fn code_len(op: u8) -> usize {
    match op {
        0xc0..=0xdf => 2,
        0xe0 => 4,
        0xe2 => 2,
        0xe7 => 3,
        _ => 1,
    }
}

/// Number of instructions described by the code sequence starting at `start`.
fn sequence_len(codes: &[u8], start: usize) -> u32 {
    let mut len = 0;
    let mut ptr = start;
    while let Some(&op) = codes.get(ptr) {
        if op == 0xe4 || op == 0xe5 {
            break;
        }
        // custom stack frames don't count
        if op & 0xf8 != 0xe8 {
            len += 1;
        }
        ptr += code_len(op);
    }
    len
}

/// Register restore primitives over one context.
struct Restorer<'a> {
    context: &'a mut Arm64Context,
    memory: &'a dyn MemoryReader,
}

impl Restorer<'_> {
    fn slot(&self, index: i64) -> u64 {
        self.context.sp.wrapping_add((index * 8) as u64)
    }

    fn regs(&mut self, reg: usize, count: u32, pos: i64) -> Result<()> {
        let offset = pos.max(0);
        for i in 0..count as usize {
            let value = self.memory.read_u64(self.slot(i as i64 + offset))?;
            match self.context.x.get_mut(reg + i) {
                Some(register) => *register = value,
                None => warn!("unwind code restores invalid register x{}", reg + i),
            }
        }
        if pos < 0 {
            self.context.sp = self.context.sp.wrapping_add((-8 * pos) as u64);
        }
        Ok(())
    }

    fn fpregs(&mut self, reg: usize, count: u32, pos: i64) -> Result<()> {
        let offset = pos.max(0);
        for i in 0..count as usize {
            let value = self.memory.read_u64(self.slot(i as i64 + offset))?;
            self.context.set_d(reg + i, value);
        }
        if pos < 0 {
            self.context.sp = self.context.sp.wrapping_add((-8 * pos) as u64);
        }
        Ok(())
    }

    fn qregs(&mut self, reg: usize, count: u32, pos: i64) -> Result<()> {
        let offset = pos.max(0);
        for i in 0..count as usize {
            let value = self.memory.read_u128(self.slot(2 * (i as i64 + offset)))?;
            if let Some(v) = self.context.v.get_mut(reg + i) {
                *v = value;
            }
        }
        if pos < 0 {
            self.context.sp = self.context.sp.wrapping_add((-16 * pos) as u64);
        }
        Ok(())
    }

    fn any_reg(&mut self, reg: u8, count: u32, kind: u8, pos: i64) -> Result<()> {
        let mut pos = pos;
        if reg & 0x20 != 0 {
            pos = -pos - 1;
        }
        let index = (reg & 0x1f) as usize;
        match kind {
            0 => {
                if count > 1 || pos < 0 {
                    pos *= 2;
                }
                self.regs(index, count, pos)
            }
            1 => {
                if count > 1 || pos < 0 {
                    pos *= 2;
                }
                self.fpregs(index, count, pos)
            }
            2 => self.qregs(index, count, pos),
            _ => Ok(()),
        }
    }

    fn add_sp(&mut self, amount: u64) {
        self.context.sp = self.context.sp.wrapping_add(amount);
    }

    /// Replay the codes from `start`, skipping the first `skip` of them.
    ///
    /// Returns `false` if a code replaced the program counter itself (machine frame).
    fn process_codes(&mut self, codes: &[u8], start: usize, skip: u32) -> Result<bool> {
        let end = codes.len();
        let mut ptr = start;
        let mut skip = skip;
        let mut save_next = 2;
        let mut final_pc_from_lr = true;

        while ptr < end && skip > 0 {
            if codes[ptr] == 0xe4 {
                break;
            }
            ptr += code_len(codes[ptr]);
            skip -= 1;
        }

        while ptr < end {
            let op = codes[ptr];
            let len = code_len(op);
            let val = if len > 1 {
                if ptr + len > end {
                    break;
                }
                (op as i64) << 8 | codes[ptr + 1] as i64
            } else {
                op as i64
            };

            match op {
                // alloc_s
                0x00..=0x1f => self.add_sp(16 * (val & 0x1f) as u64),
                // save_r19r20_x
                0x20..=0x3f => self.regs(19, save_next, -(val & 0x1f))?,
                // save_fplr
                0x40..=0x7f => self.regs(FP, 2, val & 0x3f)?,
                // save_fplr_x
                0x80..=0xbf => self.regs(FP, 2, -(val & 0x3f) - 1)?,
                // alloc_m
                0xc0..=0xc7 => self.add_sp(16 * (val & 0x7ff) as u64),
                // save_regp
                0xc8..=0xcb => {
                    self.regs(19 + ((val >> 6) & 0xf) as usize, save_next, val & 0x3f)?
                }
                // save_regp_x
                0xcc..=0xcf => self.regs(
                    19 + ((val >> 6) & 0xf) as usize,
                    save_next,
                    -(val & 0x3f) - 1,
                )?,
                // save_reg
                0xd0..=0xd3 => self.regs(19 + ((val >> 6) & 0xf) as usize, 1, val & 0x3f)?,
                // save_reg_x
                0xd4..=0xd5 => {
                    self.regs(19 + ((val >> 5) & 0xf) as usize, 1, -(val & 0x1f) - 1)?
                }
                // save_lrpair
                0xd6..=0xd7 => {
                    self.regs(19 + 2 * ((val >> 6) & 0x7) as usize, 1, val & 0x3f)?;
                    self.regs(LR, 1, (val & 0x3f) + 1)?;
                }
                // save_fregp
                0xd8..=0xd9 => {
                    self.fpregs(8 + ((val >> 6) & 0x7) as usize, save_next, val & 0x3f)?
                }
                // save_fregp_x
                0xda..=0xdb => self.fpregs(
                    8 + ((val >> 6) & 0x7) as usize,
                    save_next,
                    -(val & 0x3f) - 1,
                )?,
                // save_freg
                0xdc..=0xdd => self.fpregs(8 + ((val >> 6) & 0x7) as usize, 1, val & 0x3f)?,
                // save_freg_x
                0xde => self.fpregs(8 + ((val >> 5) & 0x7) as usize, 1, -(val & 0x3f) - 1)?,
                // alloc_l
                0xe0 => {
                    let amount = (codes[ptr + 1] as u64) << 16
                        | (codes[ptr + 2] as u64) << 8
                        | codes[ptr + 3] as u64;
                    self.add_sp(16 * amount);
                }
                // set_fp
                0xe1 => self.context.sp = self.context.fp(),
                // add_fp
                0xe2 => {
                    self.context.sp = self.context.fp().wrapping_sub(8 * (val & 0xff) as u64)
                }
                // nop
                0xe3 => {}
                // end
                0xe4 => break,
                // end_c
                0xe5 => {}
                // save_next
                0xe6 => {
                    save_next += 2;
                    ptr += len;
                    continue;
                }
                // save_any_reg
                0xe7 => {
                    let reg = codes[ptr + 1];
                    let count = if reg & 0x40 != 0 { save_next } else { 1 };
                    let kind = codes[ptr + 2] >> 6;
                    let pos = (codes[ptr + 2] & 0x3f) as i64;
                    self.any_reg(reg, count, kind, pos)?;
                }
                // machine frame
                0xe9 => {
                    self.context.pc = self.memory.read_u64(self.context.sp.wrapping_add(8))?;
                    self.context.sp = self.memory.read_u64(self.context.sp)?;
                    self.context.unwound_to_call = false;
                    final_pc_from_lr = false;
                }
                // clear unwound to call
                0xec => {
                    self.context.pc = self.context.lr();
                    self.context.unwound_to_call = false;
                    final_pc_from_lr = false;
                }
                // pac_sign_lr: pointer authentication is not modelled
                0xfc => {}
                _ => {
                    warn!("unsupported unwind code {:02x}", op);
                    return Ok(final_pc_from_lr);
                }
            }
            trace!("code {:02x} sp {:#x}", op, self.context.sp);
            save_next = 2;
            ptr += len;
        }
        Ok(final_pc_from_lr)
    }
}

/// Post-increment `pos`, returning whether the instruction at the old position has executed.
fn advance(pos: &mut u32, skip: u32) -> bool {
    let executed = *pos >= skip;
    *pos += 1;
    executed
}

/// Decoded `.xdata` header.
struct XData {
    function_length: u32,
    exception_data: bool,
    epilog_in_header: bool,
    epilogs: u32,
    code_words: u32,
    /// Address of the epilogue scopes (or of the codes when `epilog_in_header`)
    scopes: u64,
}

impl XData {
    fn read(memory: &dyn MemoryReader, address: u64) -> Result<Self> {
        let header = memory.read_u32(address)?;
        let mut epilogs = (header >> 22) & 0x1f;
        let mut code_words = (header >> 27) & 0x1f;
        let mut scopes = address + 4;
        if epilogs == 0 && code_words == 0 {
            let extended = memory.read_u32(scopes)?;
            epilogs = extended & 0xffff;
            code_words = (extended >> 16) & 0xff;
            scopes += 4;
        }

        let version = (header >> 18) & 0x3;
        if version != 0 {
            return Err(malformed_error!(
                "Unknown xdata version {} at {:#x}",
                version,
                address
            ));
        }

        Ok(XData {
            function_length: header & 0x3ffff,
            exception_data: header & (1 << 20) != 0,
            epilog_in_header: header & (1 << 21) != 0,
            epilogs,
            code_words,
            scopes,
        })
    }

    fn codes_address(&self) -> u64 {
        if self.epilog_in_header {
            self.scopes
        } else {
            self.scopes + 4 * self.epilogs as u64
        }
    }
}

/// Fields of a packed `.pdata` entry.
struct Packed {
    flag: u32,
    function_length: u32,
    reg_f: u32,
    reg_i: u32,
    h: u32,
    cr: u32,
    frame_size: u32,
}

impl Packed {
    fn decode(word: u32) -> Self {
        Packed {
            flag: word & 0x3,
            function_length: (word >> 2) & 0x7ff,
            reg_f: (word >> 13) & 0x7,
            reg_i: (word >> 16) & 0xf,
            h: (word >> 20) & 0x1,
            cr: (word >> 21) & 0x3,
            frame_size: (word >> 23) & 0x1ff,
        }
    }
}

/// Length in bytes of the function described by an ARM64 entry.
///
/// Packed entries carry the length inline, full entries in their `.xdata` header.
pub fn function_length(memory: &dyn MemoryReader, base: u64, unwind_word: u32) -> Result<u32> {
    if unwind_word & 3 != 0 {
        Ok(Packed::decode(unwind_word).function_length * 4)
    } else {
        Ok((memory.read_u32(base + unwind_word as u64)? & 0x3ffff) * 4)
    }
}

/// The ARM64 [`UnwindEngine`].
pub struct Arm64Unwinder {
    tables: Arc<FunctionTables>,
}

impl Arm64Unwinder {
    /// Create an unwinder over `tables`.
    pub fn new(tables: Arc<FunctionTables>) -> Self {
        Arm64Unwinder { tables }
    }

    fn unwind_packed(
        &self,
        base: u64,
        pc: u64,
        function: &RuntimeFunction,
        restorer: &mut Restorer<'_>,
    ) -> Result<()> {
        let func = Packed::decode(function.unwind_data);
        let mut int_size = func.reg_i * 8;
        let mut fp_size = func.reg_f * 8;
        let mut h_size = func.h * 4;
        if func.cr == 1 {
            int_size += 8;
        }
        if func.reg_f != 0 {
            fp_size += 8;
        }

        let regsave = ((int_size + fp_size + 8 * 8 * func.h) + 0xf) & !0xf;
        let local_size = (func.frame_size * 16).wrapping_sub(regsave);
        let int_regs = (int_size / 8) as i64;
        let fp_regs = (fp_size / 8) as i64;
        let saved_regs = (regsave / 8) as i64;
        let local_size_regs = (local_size / 8) as i64;

        let mut skip = 0u32;
        if func.flag == 1 {
            let offset = ((pc - base) as u32).wrapping_sub(function.begin) / 4;
            if offset < 17 || offset >= func.function_length.wrapping_sub(15) {
                let mut len = (int_size + 8) / 16 + (fp_size + 8) / 16;
                let chained_frame = func.cr == 2 || func.cr == 3;
                if func.cr == 2 {
                    len += 1; // pacibsp
                }
                if chained_frame {
                    len += 2; // mov x29,sp; stp x29,lr,[sp,0]
                }
                if !chained_frame || local_size > 512 {
                    if local_size != 0 {
                        len += 1;
                    }
                    if local_size > 4088 {
                        len += 1;
                    }
                }

                let epilog_start = func.function_length.wrapping_sub(len + 1);
                if offset < len + h_size {
                    skip = len + h_size - offset;
                } else if offset >= epilog_start {
                    skip = offset - epilog_start;
                    h_size = 0;
                }
            }
        }

        if skip == 0 {
            if func.cr == 3 || func.cr == 2 {
                restorer.context.sp = restorer.context.fp();
                restorer.regs(FP, 2, 0)?;
            }
            restorer.add_sp(local_size as u64);
            if fp_size != 0 {
                restorer.fpregs(8, fp_regs as u32, int_regs)?;
            }
            if func.cr == 1 {
                restorer.regs(LR, 1, int_regs - 1)?;
            }
            restorer.regs(19, func.reg_i, -saved_regs)?;
            return Ok(());
        }

        let mut pos = 0u32;
        let mut step = |pos: &mut u32| advance(pos, skip);

        if func.cr == 3 || func.cr == 2 {
            if step(&mut pos) {
                restorer.context.sp = restorer.context.fp();
            }
            if local_size <= 512 {
                if step(&mut pos) {
                    restorer.regs(FP, 2, -local_size_regs)?;
                }
            } else {
                if step(&mut pos) {
                    restorer.regs(FP, 2, 0)?;
                }
                self.packed_local(restorer, local_size, &mut pos, &mut step);
            }
        } else {
            self.packed_local(restorer, local_size, &mut pos, &mut step);
        }

        pos += h_size;

        if fp_size != 0 {
            if func.reg_f % 2 == 0 && step(&mut pos) {
                restorer.fpregs(8 + func.reg_f as usize, 1, int_regs + fp_regs - 1)?;
            }
            for i in (0..(func.reg_f + 1) / 2).rev() {
                if !step(&mut pos) {
                    continue;
                }
                if i == 0 && int_size == 0 {
                    restorer.fpregs(8, 2, -saved_regs)?;
                } else {
                    restorer.fpregs(8 + 2 * i as usize, 2, int_regs + 2 * i as i64)?;
                }
            }
        }

        if func.reg_i % 2 == 1 {
            if step(&mut pos) {
                if func.cr == 1 {
                    restorer.regs(LR, 1, int_regs - 1)?;
                }
                let slot = if func.reg_i > 1 {
                    func.reg_i as i64 - 1
                } else {
                    -saved_regs
                };
                restorer.regs(18 + func.reg_i as usize, 1, slot)?;
            }
        } else if func.cr == 1 && step(&mut pos) {
            let slot = if func.reg_i != 0 {
                int_regs - 1
            } else {
                -saved_regs
            };
            restorer.regs(LR, 1, slot)?;
        }

        for i in (0..func.reg_i / 2).rev() {
            if !step(&mut pos) {
                continue;
            }
            if i != 0 {
                restorer.regs(19 + 2 * i as usize, 2, 2 * i as i64)?;
            } else {
                restorer.regs(19, 2, -saved_regs)?;
            }
        }
        Ok(())
    }

    fn packed_local(
        &self,
        restorer: &mut Restorer<'_>,
        local_size: u32,
        pos: &mut u32,
        step: &mut impl FnMut(&mut u32) -> bool,
    ) {
        // sub sp,sp,#local_size
        if local_size == 0 {
            return;
        }
        if step(pos) {
            restorer.add_sp(((local_size - 1) % 4088 + 1) as u64);
        }
        if local_size > 4088 && step(pos) {
            restorer.add_sp(4088);
        }
    }

    /// Returns the handler and handler data address, if any.
    fn unwind_full(
        &self,
        base: u64,
        pc: u64,
        function: &RuntimeFunction,
        restorer: &mut Restorer<'_>,
        final_pc_from_lr: &mut bool,
    ) -> Result<Option<(u64, u64)>> {
        let memory = restorer.memory;
        let info = XData::read(memory, base + function.unwind_data as u64)?;
        let data = info.codes_address();
        let mut codes = vec![0u8; info.code_words as usize * 4];
        memory.read(data, &mut codes)?;
        let code_bytes = codes.len() as u32;
        let offset = ((pc - base) as u32).wrapping_sub(function.begin) / 4;

        trace!(
            "function {:#x}-{:#x}: E={} X={} epilogs={} codes={}",
            base + function.begin as u64,
            base + function.begin as u64 + info.function_length as u64 * 4,
            info.epilog_in_header,
            info.exception_data,
            info.epilogs,
            code_bytes
        );

        if offset < code_bytes {
            let len = sequence_len(&codes, 0);
            if offset < len {
                *final_pc_from_lr = restorer.process_codes(&codes, 0, len - offset)?;
                return Ok(None);
            }
        }

        if !info.epilog_in_header {
            for i in 0..info.epilogs as u64 {
                let scope = memory.read_u32(info.scopes + 4 * i)?;
                let start = scope & 0x3ffff;
                let index = scope >> 22;
                if offset < start {
                    break;
                }
                if offset - start < code_bytes.wrapping_sub(index) {
                    let len = sequence_len(&codes, index as usize);
                    if offset <= start + len {
                        *final_pc_from_lr =
                            restorer.process_codes(&codes, index as usize, offset - start)?;
                        return Ok(None);
                    }
                }
            }
        } else if info.function_length.wrapping_sub(offset)
            <= code_bytes.wrapping_sub(info.epilogs)
        {
            let index = info.epilogs as usize;
            let len = sequence_len(&codes, index) + 1;
            let start = info.function_length.wrapping_sub(len);
            if offset >= start {
                *final_pc_from_lr = restorer.process_codes(&codes, index, offset - start)?;
                return Ok(None);
            }
        }

        *final_pc_from_lr = restorer.process_codes(&codes, 0, 0)?;

        if info.exception_data {
            let handler_slot = data + code_bytes as u64;
            let handler = base + memory.read_u32(handler_slot)? as u64;
            return Ok(Some((handler, handler_slot + 4)));
        }
        Ok(None)
    }
}

impl UnwindEngine for Arm64Unwinder {
    type Context = Arm64Context;

    fn machine(&self) -> Machine {
        Machine::Arm64
    }

    fn function_tables(&self) -> &FunctionTables {
        &self.tables
    }

    fn unwind_one_frame(
        &self,
        kind: UnwindFlags,
        function: Option<&FunctionLookup>,
        context: &mut Arm64Context,
        memory: &dyn MemoryReader,
    ) -> Result<FrameUnwind> {
        let pc = context.pc;
        trace!("unwind pc {:#x} sp {:#x} lr {:#x}", pc, context.sp, context.lr());
        if function.is_none() && pc == context.lr() {
            return Err(Error::NoUnwindInfo(pc));
        }

        context.unwound_to_call = true;
        let mut final_pc_from_lr = true;
        let mut handler = None;
        {
            let mut restorer = Restorer {
                context: &mut *context,
                memory,
            };
            if let Some(lookup) = function {
                if lookup.function.unwind_data & 3 != 0 {
                    self.unwind_packed(lookup.image_base, pc, &lookup.function, &mut restorer)?;
                } else {
                    handler = self.unwind_full(
                        lookup.image_base,
                        pc,
                        &lookup.function,
                        &mut restorer,
                        &mut final_pc_from_lr,
                    )?;
                }
            }
        }

        if final_pc_from_lr {
            context.pc = context.lr();
        }

        let handler = handler.filter(|_| kind.intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER));
        Ok(FrameUnwind {
            establisher_frame: context.sp,
            handler: handler.map(|(routine, _)| routine),
            handler_data: handler.map_or(0, |(_, data)| data),
        })
    }
}
