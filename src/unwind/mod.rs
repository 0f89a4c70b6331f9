//! Virtual unwinding.
//!
//! An [`UnwindEngine`] turns the register state of one frame into the register state of its
//! caller by replaying the function's unwind metadata. The frame-walking protocol in
//! [`crate::exception`] is written once against this trait; the per-architecture opcode
//! interpreters live in [`x86_64`] and [`arm64`].
//!
//! # Key Components
//!
//! - [`UnwindContext`] - the register snapshot an engine mutates
//! - [`UnwindEngine`] - function lookup plus one-frame virtual unwind
//! - [`table::FunctionTables`] - static and dynamic function tables
//! - [`memory::MemoryReader`] - access to unwind data, code bytes and the stack
//! - [`backtrace`] - collect the return addresses of a call chain
//!
//! # Example
//!
//! ```rust,ignore
//! use ldrkit::prelude::*;
//!
//! let engine = X64Unwinder::new(tables);
//! let mut context = X64Context::new(fault_ip, fault_sp);
//! let lookup = engine.lookup_function(context.rip, &memory, None);
//! let frame = engine.unwind_one_frame(UnwindFlags::EHANDLER, lookup.as_ref(), &mut context, &memory)?;
//! println!("caller at {:#x}, frame {:#x}", context.rip, frame.establisher_frame);
//! ```

use std::fmt::Debug;

use bitflags::bitflags;

use crate::{image::Machine, Result};

pub mod arm64;
pub mod memory;
pub mod table;
pub mod x86_64;

use memory::MemoryReader;
use table::{FunctionLookup, FunctionTables, HistoryTable};

bitflags! {
    /// Which handler kind a virtual unwind should report (`UNW_FLAG_*`).
    ///
    /// The same bits appear in x86-64 `UNWIND_INFO` headers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UnwindFlags: u8 {
        /// Exception handler (exception pass)
        const EHANDLER = 0x1;
        /// Termination handler (unwind pass)
        const UHANDLER = 0x2;
        /// The unwind info chains to a parent function entry
        const CHAININFO = 0x4;
    }
}

/// Outcome of unwinding one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameUnwind {
    /// Stack address owning the frame
    pub establisher_frame: u64,
    /// Language-specific handler routine
    pub handler: Option<u64>,
    /// Address of the handler's data blob
    pub handler_data: u64,
}

/// A mutable register snapshot.
pub trait UnwindContext: Clone + Debug + Send + Sync + 'static {
    /// Current instruction pointer.
    fn instruction_pointer(&self) -> u64;

    /// Set the instruction pointer.
    fn set_instruction_pointer(&mut self, ip: u64);

    /// Current stack pointer.
    fn stack_pointer(&self) -> u64;

    /// Set the stack pointer.
    fn set_stack_pointer(&mut self, sp: u64);

    /// Place `value` in the return-value register.
    fn set_return_value(&mut self, value: u64);

    /// Whether the instruction pointer is a return address (points after a call).
    fn unwound_to_call(&self) -> bool {
        false
    }

    /// Resume address stored in the jump buffer at `buffer`.
    fn jump_buffer_target(&self, memory: &dyn MemoryReader, buffer: u64) -> Result<u64>;

    /// Restore the non-volatile registers saved in a jump buffer at `buffer`.
    fn restore_jump_buffer(&mut self, memory: &dyn MemoryReader, buffer: u64) -> Result<()>;
}

/// Per-architecture virtual unwind capability.
pub trait UnwindEngine: Send + Sync {
    /// Register snapshot type.
    type Context: UnwindContext;

    /// Architecture handled by this engine.
    fn machine(&self) -> Machine;

    /// Function tables consulted by [`UnwindEngine::lookup_function`].
    fn function_tables(&self) -> &FunctionTables;

    /// Find the function entry covering `pc`.
    fn lookup_function(
        &self,
        pc: u64,
        _memory: &dyn MemoryReader,
        history: Option<&mut HistoryTable>,
    ) -> Option<FunctionLookup> {
        self.function_tables().lookup_cached(pc, history)
    }

    /// Unwind `context` by one frame.
    ///
    /// `function` is `None` for a leaf frame without metadata, in which case the return
    /// address is taken straight from the stack (x86-64) or the link register (ARM64).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for corrupt unwind data,
    /// [`crate::Error::NoUnwindInfo`] when a leaf frame cannot be unwound, and
    /// [`crate::Error::MemoryFault`] for unreadable stack or metadata.
    fn unwind_one_frame(
        &self,
        kind: UnwindFlags,
        function: Option<&FunctionLookup>,
        context: &mut Self::Context,
        memory: &dyn MemoryReader,
    ) -> Result<FrameUnwind>;
}

/// Walk the call chain starting at `context`, returning up to `max_frames` instruction
/// pointers, innermost first.
///
/// The walk stops at a zero instruction pointer, at an unreadable frame, or when the stack
/// pointer stops moving towards the stack base. Only the first frame may lack metadata.
pub fn backtrace<E: UnwindEngine>(
    engine: &E,
    context: &E::Context,
    memory: &dyn MemoryReader,
    max_frames: usize,
) -> Vec<u64> {
    let mut context = context.clone();
    let mut history = HistoryTable::new();
    let mut frames = Vec::new();

    while frames.len() < max_frames {
        let pc = context.instruction_pointer();
        if pc == 0 {
            break;
        }
        frames.push(pc);

        let lookup_pc = if context.unwound_to_call() {
            pc.wrapping_sub(4)
        } else {
            pc
        };
        let lookup = engine.lookup_function(lookup_pc, memory, Some(&mut history));
        if lookup.is_none() && frames.len() > 1 {
            break;
        }
        let sp = context.stack_pointer();
        if engine
            .unwind_one_frame(UnwindFlags::empty(), lookup.as_ref(), &mut context, memory)
            .is_err()
        {
            break;
        }
        if context.stack_pointer() <= sp && context.instruction_pointer() == pc {
            break;
        }
    }
    frames
}
