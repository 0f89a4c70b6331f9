//! x86-64 virtual unwinder.
//!
//! Interprets `UNWIND_INFO` records (versions 1 and 2): a 4-byte header followed by 16-bit
//! unwind code slots, ordered the reverse of prologue execution. Each slot holds the prologue
//! offset of the instruction it describes, a 4-bit operation and a 4-bit operation info;
//! some operations take one or two extra slots as operands.
//!
//! ```text
//! +0  version:3 flags:5 | prolog size | code count | frame reg:4 frame offset:4
//! +4  code slots [count], padded to an even count
//!     then either a chained RUNTIME_FUNCTION (CHAININFO)
//!     or the handler RVA followed by the handler data (EHANDLER / UHANDLER)
//! ```
//!
//! When the instruction pointer is inside an epilogue the unwind codes do not describe the
//! state of the frame; the epilogue instructions are then decoded and executed directly
//! (`add rsp`/`lea rsp`, `pop`, `ret`/`jmp`).

use std::sync::Arc;

use tracing::{trace, warn};

use crate::{
    image::Machine,
    unwind::{
        memory::MemoryReader,
        table::{FunctionLookup, FunctionTables, HistoryTable, RuntimeFunction},
        FrameUnwind, UnwindContext, UnwindEngine, UnwindFlags,
    },
    Error, Result,
};

/// Unwind operation codes (`UWOP_*`).
pub mod unwind_op {
    /// `push reg`
    pub const PUSH_NONVOL: u8 = 0;
    /// `sub rsp, n` with a 16 or 32-bit operand
    pub const ALLOC_LARGE: u8 = 1;
    /// `sub rsp, (info + 1) * 8`
    pub const ALLOC_SMALL: u8 = 2;
    /// `lea framereg, [rsp + offset * 16]`
    pub const SET_FPREG: u8 = 3;
    /// `mov [rsp + n * 8], reg`
    pub const SAVE_NONVOL: u8 = 4;
    /// `mov [rsp + n], reg` with a 32-bit offset
    pub const SAVE_NONVOL_FAR: u8 = 5;
    /// Epilogue location (version 2 only)
    pub const EPILOG: u8 = 6;
    /// `movaps [rsp + n * 16], xmm`
    pub const SAVE_XMM128: u8 = 8;
    /// `movaps [rsp + n], xmm` with a 32-bit offset
    pub const SAVE_XMM128_FAR: u8 = 9;
    /// Hardware trap frame, optionally with an error code
    pub const PUSH_MACHFRAME: u8 = 10;
}

/// General purpose register numbers as used by unwind codes.
pub mod reg {
    #![allow(missing_docs)]
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R9: usize = 9;
    pub const R10: usize = 10;
    pub const R11: usize = 11;
    pub const R12: usize = 12;
    pub const R13: usize = 13;
    pub const R14: usize = 14;
    pub const R15: usize = 15;
}

const MAX_CHAIN_DEPTH: usize = 32;

/// x86-64 register snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct X64Context {
    /// Instruction pointer
    pub rip: u64,
    /// General purpose registers, indexed by [`reg`]
    pub gpr: [u64; 16],
    /// Vector registers
    pub xmm: [u128; 16],
    /// Flags register
    pub eflags: u32,
}

impl X64Context {
    /// Create a context with only `rip` and `rsp` set.
    pub fn new(rip: u64, rsp: u64) -> Self {
        let mut context = X64Context {
            rip,
            ..Default::default()
        };
        context.gpr[reg::RSP] = rsp;
        context
    }

    /// Stack pointer.
    pub fn rsp(&self) -> u64 {
        self.gpr[reg::RSP]
    }

    fn pop(&mut self, memory: &dyn MemoryReader) -> Result<u64> {
        let value = memory.read_u64(self.rsp())?;
        self.gpr[reg::RSP] = self.rsp().wrapping_add(8);
        Ok(value)
    }
}

impl UnwindContext for X64Context {
    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn set_instruction_pointer(&mut self, ip: u64) {
        self.rip = ip;
    }

    fn stack_pointer(&self) -> u64 {
        self.rsp()
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.gpr[reg::RSP] = sp;
    }

    fn set_return_value(&mut self, value: u64) {
        self.gpr[reg::RAX] = value;
    }

    fn jump_buffer_target(&self, memory: &dyn MemoryReader, buffer: u64) -> Result<u64> {
        memory.read_u64(buffer + 80)
    }

    fn restore_jump_buffer(&mut self, memory: &dyn MemoryReader, buffer: u64) -> Result<()> {
        // Frame, Rbx, Rsp, Rbp, Rsi, Rdi, R12-R15, Rip, MxCsr/FpCsr, Xmm6-Xmm15
        self.gpr[reg::RBX] = memory.read_u64(buffer + 8)?;
        self.gpr[reg::RSP] = memory.read_u64(buffer + 16)?;
        self.gpr[reg::RBP] = memory.read_u64(buffer + 24)?;
        self.gpr[reg::RSI] = memory.read_u64(buffer + 32)?;
        self.gpr[reg::RDI] = memory.read_u64(buffer + 40)?;
        for (i, register) in (reg::R12..=reg::R15).enumerate() {
            self.gpr[register] = memory.read_u64(buffer + 48 + 8 * i as u64)?;
        }
        self.rip = memory.read_u64(buffer + 80)?;
        for i in 0..10 {
            self.xmm[6 + i] = memory.read_u128(buffer + 96 + 16 * i as u64)?;
        }
        Ok(())
    }
}

/// Decoded `UNWIND_INFO` header plus its code slots.
struct UnwindInfo {
    address: u64,
    version: u8,
    flags: UnwindFlags,
    prolog: u8,
    frame_reg: u8,
    frame_offset: u8,
    codes: Vec<[u8; 2]>,
}

impl UnwindInfo {
    fn read(memory: &dyn MemoryReader, address: u64) -> Result<Self> {
        let mut header = [0u8; 4];
        memory.read(address, &mut header)?;
        let count = header[2] as usize;
        let mut raw = vec![0u8; count * 2];
        memory.read(address + 4, &mut raw)?;

        Ok(UnwindInfo {
            address,
            version: header[0] & 0x7,
            flags: UnwindFlags::from_bits_retain(header[0] >> 3),
            prolog: header[1],
            frame_reg: header[3] & 0xf,
            frame_offset: header[3] >> 4,
            codes: raw.chunks_exact(2).map(|slot| [slot[0], slot[1]]).collect(),
        })
    }

    fn count(&self) -> usize {
        self.codes.len()
    }

    /// Prologue offset, operation and info of the slot at `index`.
    fn op(&self, index: usize) -> (u8, u8, u8) {
        let [offset, packed] = self.codes[index];
        (offset, packed & 0xf, packed >> 4)
    }

    fn slot_u16(&self, index: usize) -> Result<u16> {
        self.codes
            .get(index)
            .map(|slot| u16::from_le_bytes(*slot))
            .ok_or_else(|| malformed_error!("Unwind code operand past the end at {:#x}", self.address))
    }

    fn slot_u32(&self, index: usize) -> Result<u32> {
        let low = self.slot_u16(index)? as u32;
        let high = self.slot_u16(index + 1)? as u32;
        Ok(low | high << 16)
    }

    /// Address following the code slots (chained entry or handler RVA).
    fn tail_address(&self) -> u64 {
        self.address + 4 + ((self.count() as u64 + 1) & !1) * 2
    }
}

fn opcode_size(op: u8, info: u8) -> usize {
    match op {
        unwind_op::ALLOC_LARGE => 2 + (info != 0) as usize,
        unwind_op::SAVE_NONVOL | unwind_op::SAVE_XMM128 | unwind_op::EPILOG => 2,
        unwind_op::SAVE_NONVOL_FAR | unwind_op::SAVE_XMM128_FAR => 3,
        _ => 1,
    }
}

fn read_function(memory: &dyn MemoryReader, address: u64) -> Result<RuntimeFunction> {
    Ok(RuntimeFunction::new(
        memory.read_u32(address)?,
        memory.read_u32(address + 4)?,
        memory.read_u32(address + 8)?,
    ))
}

/// Whether the bytes at `pc` form an epilogue of `function`.
fn is_inside_epilog(
    memory: &dyn MemoryReader,
    pc: u64,
    base: u64,
    function: &RuntimeFunction,
) -> Result<bool> {
    let byte = |address: u64| memory.read_u8(address);
    let outside = |target: u64| {
        let rva = target.wrapping_sub(base);
        !(rva >= function.begin as u64 && rva < function.end as u64)
    };
    let mut pc = pc;

    // add or lea must be the first instruction, with a rex.W prefix
    let first = byte(pc)?;
    if first & 0xf8 == 0x48 {
        match byte(pc + 1)? {
            0x81 => {
                if first != 0x48 || byte(pc + 2)? != 0xc4 {
                    return Ok(false);
                }
                pc += 7;
            }
            0x83 => {
                if first != 0x48 || byte(pc + 2)? != 0xc4 {
                    return Ok(false);
                }
                pc += 4;
            }
            0x8d => {
                let modrm = byte(pc + 2)?;
                if first & 0x06 != 0 || (modrm >> 3) & 7 != 4 || modrm & 7 == 4 {
                    return Ok(false);
                }
                match modrm >> 6 {
                    1 => pc += 4,
                    2 => pc += 7,
                    _ => return Ok(false),
                }
            }
            _ => {}
        }
    }

    loop {
        let mut rex = 0;
        if byte(pc)? & 0xf0 == 0x40 {
            rex = byte(pc)? & 0x0f;
            pc += 1;
        }

        return match byte(pc)? {
            0x58..=0x5f => {
                pc += 1;
                continue;
            }
            0xc2 | 0xc3 => Ok(true),
            0xe9 => {
                let displacement = memory.read_u32(pc + 1)? as i32 as i64;
                Ok(outside(pc.wrapping_add(5).wrapping_add(displacement as u64)))
            }
            0xeb => {
                let displacement = byte(pc + 1)? as i8 as i64;
                Ok(outside(pc.wrapping_add(2).wrapping_add(displacement as u64)))
            }
            0xf3 => Ok(byte(pc + 1)? == 0xc3),
            0xff => {
                if rex != 0 && rex != 8 {
                    return Ok(false);
                }
                let modrm = byte(pc + 1)?;
                Ok(modrm == 0x25 || (rex != 0 && (modrm >> 3) & 7 == 4))
            }
            _ => Ok(false),
        };
    }
}

/// Execute an epilogue previously validated with [`is_inside_epilog`].
fn interpret_epilog(memory: &dyn MemoryReader, pc: u64, context: &mut X64Context) -> Result<()> {
    let mut pc = pc;
    loop {
        let mut rex = 0;
        if memory.read_u8(pc)? & 0xf0 == 0x40 {
            rex = memory.read_u8(pc)? & 0x0f;
            pc += 1;
        }

        match memory.read_u8(pc)? {
            op @ 0x58..=0x5f => {
                let register = (op - 0x58) as usize + (rex as usize & 1) * 8;
                context.gpr[register] = context.pop(memory)?;
                trace!("epilog pop r{}", register);
                pc += 1;
            }
            0x81 => {
                let amount = memory.read_u32(pc + 2)? as i32 as i64;
                context.gpr[reg::RSP] = context.rsp().wrapping_add(amount as u64);
                pc += 6;
            }
            0x83 => {
                let amount = memory.read_u8(pc + 2)? as i8 as i64;
                context.gpr[reg::RSP] = context.rsp().wrapping_add(amount as u64);
                pc += 3;
            }
            0x8d => {
                let modrm = memory.read_u8(pc + 1)?;
                let source = context.gpr[(modrm & 7) as usize + (rex as usize & 1) * 8];
                if modrm >> 6 == 1 {
                    let displacement = memory.read_u8(pc + 2)? as i8 as i64;
                    context.gpr[reg::RSP] = source.wrapping_add(displacement as u64);
                    pc += 3;
                } else {
                    let displacement = memory.read_u32(pc + 2)? as i32 as i64;
                    context.gpr[reg::RSP] = source.wrapping_add(displacement as u64);
                    pc += 6;
                }
            }
            0xc2 => {
                let extra = memory.read_u16(pc + 1)? as u64;
                context.rip = context.pop(memory)?;
                context.gpr[reg::RSP] = context.rsp().wrapping_add(extra);
                return Ok(());
            }
            0xe9 | 0xeb | 0xc3 | 0xf3 | 0xff => {
                context.rip = context.pop(memory)?;
                return Ok(());
            }
            _ => return Ok(()),
        }
    }
}

/// The x86-64 [`UnwindEngine`].
pub struct X64Unwinder {
    tables: Arc<FunctionTables>,
}

impl X64Unwinder {
    /// Create an unwinder over `tables`.
    pub fn new(tables: Arc<FunctionTables>) -> Self {
        X64Unwinder { tables }
    }

    fn virtual_unwind(
        &self,
        kind: UnwindFlags,
        lookup: &FunctionLookup,
        context: &mut X64Context,
        memory: &dyn MemoryReader,
    ) -> Result<FrameUnwind> {
        let base = lookup.image_base;
        let pc = context.rip;
        let mut function = lookup.function;
        let mut frame = context.rsp();
        let mut establisher_frame = frame;
        let mut mach_frame = false;
        let mut depth = 0;

        trace!(
            "unwind rip {:#x} rva {:#x} rsp {:#x}",
            pc,
            pc.wrapping_sub(base),
            context.rsp()
        );

        let (info, prolog_offset) = loop {
            let info = UnwindInfo::read(memory, base + function.unwind_data as u64)?;
            if info.version != 1 && info.version != 2 {
                return Err(malformed_error!(
                    "Unknown unwind info version {} at {:#x}",
                    info.version,
                    info.address
                ));
            }

            if info.frame_reg != 0 {
                frame = context.gpr[info.frame_reg as usize]
                    .wrapping_sub(info.frame_offset as u64 * 16);
            }

            let begin = base + function.begin as u64;
            let prolog_offset = if pc >= begin && pc < begin + info.prolog as u64 {
                trace!("inside prolog");
                Some((pc - begin) as u32)
            } else {
                if info.count() != 0 && is_inside_epilog(memory, pc, base, &function)? {
                    trace!("inside epilog");
                    interpret_epilog(memory, pc, context)?;
                    return Ok(FrameUnwind {
                        establisher_frame: if info.frame_reg != 0 {
                            context.rsp().wrapping_sub(8)
                        } else {
                            frame
                        },
                        handler: None,
                        handler_data: 0,
                    });
                }
                None
            };

            let mut i = 0;
            while i < info.count() {
                let (offset, op, op_info) = info.op(i);
                let size = opcode_size(op, op_info);
                if prolog_offset.is_some_and(|prolog| prolog < offset as u32) {
                    i += size;
                    continue;
                }

                match op {
                    unwind_op::PUSH_NONVOL => {
                        context.gpr[op_info as usize] = context.pop(memory)?;
                        trace!("pop r{}", op_info);
                    }
                    unwind_op::ALLOC_LARGE => {
                        let amount = if op_info != 0 {
                            info.slot_u32(i + 1)? as u64
                        } else {
                            info.slot_u16(i + 1)? as u64 * 8
                        };
                        context.gpr[reg::RSP] = context.rsp().wrapping_add(amount);
                    }
                    unwind_op::ALLOC_SMALL => {
                        context.gpr[reg::RSP] =
                            context.rsp().wrapping_add((op_info as u64 + 1) * 8);
                    }
                    unwind_op::SET_FPREG => {
                        context.gpr[reg::RSP] = frame;
                        establisher_frame = frame;
                    }
                    unwind_op::SAVE_NONVOL => {
                        let address = frame.wrapping_add(info.slot_u16(i + 1)? as u64 * 8);
                        context.gpr[op_info as usize] = memory.read_u64(address)?;
                    }
                    unwind_op::SAVE_NONVOL_FAR => {
                        let address = frame.wrapping_add(info.slot_u32(i + 1)? as u64);
                        context.gpr[op_info as usize] = memory.read_u64(address)?;
                    }
                    unwind_op::SAVE_XMM128 => {
                        let address = frame.wrapping_add(info.slot_u16(i + 1)? as u64 * 16);
                        context.xmm[op_info as usize] = memory.read_u128(address)?;
                    }
                    unwind_op::SAVE_XMM128_FAR => {
                        let address = frame.wrapping_add(info.slot_u32(i + 1)? as u64);
                        context.xmm[op_info as usize] = memory.read_u128(address)?;
                    }
                    unwind_op::PUSH_MACHFRAME => {
                        if info.flags.contains(UnwindFlags::CHAININFO) || i + size < info.count() {
                            trace!("ignoring misplaced PUSH_MACHFRAME");
                        } else {
                            if op_info != 0 {
                                context.gpr[reg::RSP] = context.rsp().wrapping_add(8);
                            }
                            context.rip = memory.read_u64(context.rsp())?;
                            context.gpr[reg::RSP] = memory.read_u64(context.rsp() + 24)?;
                            mach_frame = true;
                        }
                    }
                    unwind_op::EPILOG if info.version == 2 => {}
                    _ => warn!("unknown unwind code {} at {:#x}", op, info.address),
                }
                i += size;
            }

            if !info.flags.contains(UnwindFlags::CHAININFO) {
                break (info, prolog_offset);
            }
            depth += 1;
            if depth > MAX_CHAIN_DEPTH {
                return Err(Error::RecursionLimit(MAX_CHAIN_DEPTH));
            }
            function = read_function(memory, info.tail_address())?;
            trace!(
                "chained to function {:#x}-{:#x}",
                base + function.begin as u64,
                base + function.end as u64
            );
        };

        if !mach_frame {
            context.rip = context.pop(memory)?;
        }

        let handler_kinds = UnwindFlags::EHANDLER | UnwindFlags::UHANDLER;
        if !info.flags.intersects(kind & handler_kinds) || prolog_offset.is_some() {
            return Ok(FrameUnwind {
                establisher_frame,
                handler: None,
                handler_data: 0,
            });
        }

        let handler_slot = info.tail_address();
        Ok(FrameUnwind {
            establisher_frame,
            handler: Some(base + memory.read_u32(handler_slot)? as u64),
            handler_data: handler_slot + 4,
        })
    }
}

impl UnwindEngine for X64Unwinder {
    type Context = X64Context;

    fn machine(&self) -> Machine {
        Machine::X86_64
    }

    fn function_tables(&self) -> &FunctionTables {
        &self.tables
    }

    fn lookup_function(
        &self,
        pc: u64,
        memory: &dyn MemoryReader,
        history: Option<&mut HistoryTable>,
    ) -> Option<FunctionLookup> {
        let mut lookup = self.tables.lookup_cached(pc, history)?;
        for _ in 0..MAX_CHAIN_DEPTH {
            if lookup.function.unwind_data & 1 == 0 {
                return Some(lookup);
            }
            let address = lookup.image_base + (lookup.function.unwind_data & !1) as u64;
            lookup.function = read_function(memory, address).ok()?;
        }
        None
    }

    fn unwind_one_frame(
        &self,
        kind: UnwindFlags,
        function: Option<&FunctionLookup>,
        context: &mut X64Context,
        memory: &dyn MemoryReader,
    ) -> Result<FrameUnwind> {
        match function {
            Some(lookup) => self.virtual_unwind(kind, lookup, context, memory),
            None => {
                let establisher_frame = context.rsp();
                context.rip = context.pop(memory)?;
                Ok(FrameUnwind {
                    establisher_frame,
                    handler: None,
                    handler_data: 0,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{unwind_code, x64_unwind_info, IMAGE_BASE, STACK_BASE},
        unwind::memory::SimulatedMemory,
    };

    const FUNC: RuntimeFunction = RuntimeFunction {
        begin: 0x1000,
        end: 0x1100,
        unwind_data: 0x3000,
    };

    fn setup(info: &[u8], code: &[u8]) -> (X64Unwinder, SimulatedMemory) {
        let mut memory = SimulatedMemory::new();
        memory.map_zeroed(IMAGE_BASE, 0x10000).unwrap();
        memory.map_zeroed(STACK_BASE - 0x1000, 0x1000).unwrap();
        memory.write(IMAGE_BASE + 0x3000, info).unwrap();
        memory.write(IMAGE_BASE + 0x1040, code).unwrap();

        let tables = Arc::new(FunctionTables::new());
        tables.register_module("test.dll", IMAGE_BASE, 0x10000, vec![FUNC]);
        (X64Unwinder::new(tables), memory)
    }

    // push rbp; push rbx; sub rsp, 0x28
    fn standard_codes() -> Vec<[u8; 2]> {
        vec![
            unwind_code(6, unwind_op::ALLOC_SMALL, 4),
            unwind_code(2, unwind_op::PUSH_NONVOL, reg::RBX as u8),
            unwind_code(1, unwind_op::PUSH_NONVOL, reg::RBP as u8),
        ]
    }

    fn unwind_at(
        engine: &X64Unwinder,
        memory: &SimulatedMemory,
        context: &mut X64Context,
        kind: UnwindFlags,
    ) -> FrameUnwind {
        let lookup = engine.lookup_function(context.rip, memory, None);
        engine
            .unwind_one_frame(kind, lookup.as_ref(), context, memory)
            .unwrap()
    }

    #[test]
    fn test_unwind_body() {
        let info = x64_unwind_info(UnwindFlags::empty(), 6, 0, 0, &standard_codes(), &[]);
        let (engine, mut memory) = setup(&info, &[0x90]);
        let sp = STACK_BASE - 0x100;
        memory.write_u64(sp + 0x28, 0xb0b0).unwrap();
        memory.write_u64(sp + 0x30, 0xbebe).unwrap();
        memory.write_u64(sp + 0x38, 0x1234_5678).unwrap();

        let mut context = X64Context::new(IMAGE_BASE + 0x1040, sp);
        let frame = unwind_at(&engine, &memory, &mut context, UnwindFlags::empty());

        assert_eq!(frame.establisher_frame, sp);
        assert_eq!(context.gpr[reg::RBX], 0xb0b0);
        assert_eq!(context.gpr[reg::RBP], 0xbebe);
        assert_eq!(context.rip, 0x1234_5678);
        assert_eq!(context.rsp(), sp + 0x40);
    }

    #[test]
    fn test_unwind_inside_prolog() {
        let info = x64_unwind_info(UnwindFlags::empty(), 6, 0, 0, &standard_codes(), &[]);
        let (engine, mut memory) = setup(&info, &[]);
        let sp = STACK_BASE - 0x100;
        memory.write_u64(sp, 0xb0b0).unwrap();
        memory.write_u64(sp + 8, 0xbebe).unwrap();
        memory.write_u64(sp + 16, 0x4242).unwrap();

        // both pushes executed, the allocation has not
        let mut context = X64Context::new(IMAGE_BASE + 0x1002, sp);
        unwind_at(&engine, &memory, &mut context, UnwindFlags::empty());

        assert_eq!(context.gpr[reg::RBX], 0xb0b0);
        assert_eq!(context.gpr[reg::RBP], 0xbebe);
        assert_eq!(context.rip, 0x4242);
        assert_eq!(context.rsp(), sp + 24);
    }

    #[test]
    fn test_unwind_inside_epilog() {
        let info = x64_unwind_info(UnwindFlags::EHANDLER, 6, 0, 0, &standard_codes(), &0x2000u32.to_le_bytes());
        // add rsp, 0x28; pop rbx; pop rbp; ret
        let epilog = [0x48, 0x83, 0xc4, 0x28, 0x5b, 0x5d, 0xc3];
        let (engine, mut memory) = setup(&info, &epilog);
        let sp = STACK_BASE - 0x100;
        memory.write_u64(sp + 0x28, 0xb0b0).unwrap();
        memory.write_u64(sp + 0x30, 0xbebe).unwrap();
        memory.write_u64(sp + 0x38, 0x7777).unwrap();

        let mut context = X64Context::new(IMAGE_BASE + 0x1040, sp);
        let frame = unwind_at(&engine, &memory, &mut context, UnwindFlags::EHANDLER);

        assert!(frame.handler.is_none());
        assert_eq!(context.gpr[reg::RBX], 0xb0b0);
        assert_eq!(context.gpr[reg::RBP], 0xbebe);
        assert_eq!(context.rip, 0x7777);
        assert_eq!(context.rsp(), sp + 0x40);
    }

    #[test]
    fn test_epilog_detection() {
        let (_, mut memory) = setup(&[], &[]);
        let at = IMAGE_BASE + 0x1040;
        let mut check = |bytes: &[u8]| {
            memory.write(at, bytes).unwrap();
            is_inside_epilog(&memory, at, IMAGE_BASE, &FUNC).unwrap()
        };

        assert!(check(&[0x5b, 0xc3]));
        assert!(check(&[0x41, 0x5f, 0x5d, 0xc3]));
        assert!(check(&[0xf3, 0xc3]));
        assert!(check(&[0x48, 0x8d, 0x65, 0x10, 0xc3]));
        // jmp back into the function body is not a tail call
        assert!(!check(&[0xeb, 0xf0]));
        // jmp out of the function is
        assert!(check(&[0xe9, 0x00, 0x10, 0x00, 0x00]));
        assert!(!check(&[0x90, 0xc3]));
        assert!(!check(&[0x48, 0x83, 0xc0, 0x28, 0xc3]));
    }

    #[test]
    fn test_frame_register_and_handler() {
        let codes = [
            unwind_code(4, unwind_op::SET_FPREG, 0),
            unwind_code(1, unwind_op::PUSH_NONVOL, reg::RBP as u8),
        ];
        let info = x64_unwind_info(
            UnwindFlags::EHANDLER,
            4,
            reg::RBP as u8,
            2,
            &codes,
            &0x2000u32.to_le_bytes(),
        );
        let (engine, mut memory) = setup(&info, &[0x90]);
        let frame_base = STACK_BASE - 0x200;
        memory.write_u64(frame_base, 0xbebe).unwrap();
        memory.write_u64(frame_base + 8, 0x5555).unwrap();

        let mut context = X64Context::new(IMAGE_BASE + 0x1040, STACK_BASE - 0x400);
        context.gpr[reg::RBP] = frame_base + 0x20;
        let frame = unwind_at(&engine, &memory, &mut context.clone(), UnwindFlags::UHANDLER);
        assert!(frame.handler.is_none());

        let frame = unwind_at(&engine, &memory, &mut context, UnwindFlags::EHANDLER);
        assert_eq!(frame.establisher_frame, frame_base);
        assert_eq!(frame.handler, Some(IMAGE_BASE + 0x2000));
        assert_eq!(frame.handler_data, IMAGE_BASE + 0x3000 + 4 + 4 + 4);
        assert_eq!(context.gpr[reg::RBP], 0xbebe);
        assert_eq!(context.rip, 0x5555);
    }

    #[test]
    fn test_chained_info() {
        let mut chain = Vec::new();
        chain.extend_from_slice(&0x1000u32.to_le_bytes());
        chain.extend_from_slice(&0x1100u32.to_le_bytes());
        chain.extend_from_slice(&0x3100u32.to_le_bytes());
        let child = x64_unwind_info(
            UnwindFlags::CHAININFO,
            0,
            0,
            0,
            &[unwind_code(0, unwind_op::ALLOC_SMALL, 1)],
            &chain,
        );
        let parent = x64_unwind_info(UnwindFlags::empty(), 0, 0, 0, &standard_codes(), &[]);
        let (engine, mut memory) = setup(&child, &[0x90]);
        memory.write(IMAGE_BASE + 0x3100, &parent).unwrap();

        let sp = STACK_BASE - 0x100;
        memory.write_u64(sp + 0x10 + 0x28, 0xb0b0).unwrap();
        memory.write_u64(sp + 0x10 + 0x30, 0xbebe).unwrap();
        memory.write_u64(sp + 0x10 + 0x38, 0x9999).unwrap();

        let mut context = X64Context::new(IMAGE_BASE + 0x1040, sp);
        unwind_at(&engine, &memory, &mut context, UnwindFlags::empty());

        assert_eq!(context.gpr[reg::RBX], 0xb0b0);
        assert_eq!(context.rip, 0x9999);
        assert_eq!(context.rsp(), sp + 0x10 + 0x40);
    }

    #[test]
    fn test_machine_frame() {
        let info = x64_unwind_info(
            UnwindFlags::empty(),
            0,
            0,
            0,
            &[unwind_code(0, unwind_op::PUSH_MACHFRAME, 0)],
            &[],
        );
        let (engine, mut memory) = setup(&info, &[0x90]);
        let sp = STACK_BASE - 0x100;
        memory.write_u64(sp, 0xabcd).unwrap();
        memory.write_u64(sp + 24, STACK_BASE - 0x40).unwrap();

        let mut context = X64Context::new(IMAGE_BASE + 0x1040, sp);
        unwind_at(&engine, &memory, &mut context, UnwindFlags::empty());

        assert_eq!(context.rip, 0xabcd);
        assert_eq!(context.rsp(), STACK_BASE - 0x40);
    }

    #[test]
    fn test_leaf_and_indirect_lookup() {
        let (engine, mut memory) = setup(&[], &[]);
        let sp = STACK_BASE - 0x100;
        memory.write_u64(sp, 0x4444).unwrap();

        let mut context = X64Context::new(IMAGE_BASE + 0x8000, sp);
        assert!(engine.lookup_function(context.rip, &memory, None).is_none());
        let frame = engine
            .unwind_one_frame(UnwindFlags::empty(), None, &mut context, &memory)
            .unwrap();
        assert_eq!(frame.establisher_frame, sp);
        assert_eq!(context.rip, 0x4444);
        assert_eq!(context.rsp(), sp + 8);

        let tables = Arc::new(FunctionTables::new());
        tables.register_module(
            "indirect.dll",
            IMAGE_BASE,
            0x10000,
            vec![RuntimeFunction::new(0x1200, 0x1280, 0x4001)],
        );
        memory.write_u32(IMAGE_BASE + 0x4000, 0x1000).unwrap();
        memory.write_u32(IMAGE_BASE + 0x4004, 0x1100).unwrap();
        memory.write_u32(IMAGE_BASE + 0x4008, 0x3000).unwrap();
        let engine = X64Unwinder::new(tables);
        let lookup = engine
            .lookup_function(IMAGE_BASE + 0x1210, &memory, None)
            .unwrap();
        assert_eq!(lookup.function, FUNC);
    }

    #[test]
    fn test_bad_version() {
        let mut info = x64_unwind_info(UnwindFlags::empty(), 0, 0, 0, &standard_codes(), &[]);
        info[0] = (info[0] & !7) | 3;
        let (engine, memory) = setup(&info, &[0x90]);
        let mut context = X64Context::new(IMAGE_BASE + 0x1040, STACK_BASE - 0x100);
        let lookup = engine.lookup_function(context.rip, &memory, None);
        assert!(matches!(
            engine.unwind_one_frame(UnwindFlags::empty(), lookup.as_ref(), &mut context, &memory),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_jump_buffer_restore() {
        let mut memory = SimulatedMemory::new();
        let buffer = STACK_BASE - 0x400;
        memory.map_zeroed(buffer, 0x200).unwrap();
        memory.write_u64(buffer + 8, 0x33).unwrap();
        memory.write_u64(buffer + 16, STACK_BASE - 0x80).unwrap();
        memory.write_u64(buffer + 72, 0xf15).unwrap();
        memory.write_u64(buffer + 80, IMAGE_BASE + 0x1234).unwrap();
        memory.write(buffer + 96, &7u128.to_le_bytes()).unwrap();

        let mut context = X64Context::default();
        context.restore_jump_buffer(&memory, buffer).unwrap();

        assert_eq!(context.gpr[reg::RBX], 0x33);
        assert_eq!(context.rsp(), STACK_BASE - 0x80);
        assert_eq!(context.gpr[reg::R15], 0xf15);
        assert_eq!(context.rip, IMAGE_BASE + 0x1234);
        assert_eq!(context.xmm[6], 7);
    }
}
