//! The C scope-table handler (`__C_specific_handler`).
//!
//! The handler data of a function compiled with `__try` blocks is a scope table:
//!
//! ```text
//! u32 count
//! count x { u32 begin, u32 end, u32 handler, u32 jump_target }   (image-relative)
//! ```
//!
//! A record with a non-zero `jump_target` is a `__try` / `__except` block whose `handler` is
//! the filter routine, or the constant [`filter::EXCEPTION_EXECUTE_HANDLER`]. A record with a
//! zero `jump_target` is a `__try` / `__finally` block whose `handler` is the termination
//! routine.

use tracing::trace;

use crate::{
    exception::{
        dispatch::{DispatcherContext, HandlerOutcome, LanguageHandler},
        filter, ExceptionDisposition, ExceptionFlags, ExceptionRecord,
    },
    unwind::{memory::MemoryReader, UnwindEngine},
    Result,
};

/// Upper bound on the scope count read from handler data.
const MAX_SCOPES: u32 = 0x1_0000;

/// One entry of a scope table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeRecord {
    /// First byte of the guarded region
    pub begin: u32,
    /// End of the guarded region (exclusive)
    pub end: u32,
    /// Filter or termination routine
    pub handler: u32,
    /// `__except` block, or 0 for `__finally`
    pub jump_target: u32,
}

impl ScopeRecord {
    /// Whether the guarded region covers `rva`.
    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.begin as u64 && rva < self.end as u64
    }

    /// Whether this is a `__finally` record.
    pub fn is_termination(&self) -> bool {
        self.jump_target == 0
    }
}

/// Read the scope table at `address`.
///
/// # Errors
/// Returns [`crate::Error::MemoryFault`] for unreadable data and
/// [`crate::Error::Malformed`] for an implausible count.
pub fn read_scope_table(memory: &dyn MemoryReader, address: u64) -> Result<Vec<ScopeRecord>> {
    let count = memory.read_u32(address)?;
    if count > MAX_SCOPES {
        return Err(malformed_error!(
            "Scope table at {:#x} claims {} entries",
            address,
            count
        ));
    }

    let mut scopes = Vec::with_capacity(count as usize);
    for index in 0..count as u64 {
        let entry = address + 4 + index * 16;
        scopes.push(ScopeRecord {
            begin: memory.read_u32(entry)?,
            end: memory.read_u32(entry + 4)?,
            handler: memory.read_u32(entry + 8)?,
            jump_target: memory.read_u32(entry + 12)?,
        });
    }
    Ok(scopes)
}

/// Standard handler for functions with a scope table.
///
/// During the unwind pass it runs the termination handlers of the scopes covering the frame's
/// instruction pointer, innermost first, resuming after the last scope it ran when the pass
/// is restarted by a collided unwind. During the exception pass it evaluates the filters of
/// the covering `__except` scopes and unwinds to the first one that accepts the exception.
#[derive(Clone, Copy, Debug, Default)]
pub struct CSpecificHandler;

impl<E: UnwindEngine> LanguageHandler<E> for CSpecificHandler {
    fn handle(
        &self,
        record: &mut ExceptionRecord,
        establisher_frame: u64,
        context: &mut E::Context,
        dispatch: &mut DispatcherContext<'_, E>,
    ) -> Result<HandlerOutcome<E::Context>> {
        let scopes = read_scope_table(dispatch.memory(), dispatch.handler_data)?;
        let base = dispatch.image_base;
        let mut pc = dispatch.control_pc;
        if dispatch.control_pc_is_unwound {
            pc = pc.wrapping_sub(4);
        }
        let rva = pc.wrapping_sub(base);
        trace!(
            "C scope handler pc {:#x} frame {:#x} scopes {} flags {:?}",
            pc,
            establisher_frame,
            scopes.len(),
            record.flags
        );

        if record.is_unwinding() {
            let target_rva = dispatch.target_ip.wrapping_sub(base);
            for index in dispatch.scope_index as usize..scopes.len() {
                let scope = scopes[index];
                if !scope.contains(rva) || !scope.is_termination() {
                    continue;
                }
                if record.flags.contains(ExceptionFlags::TARGET_UNWIND)
                    && scope.contains(target_rva)
                {
                    break;
                }

                let handler = dispatch
                    .routines()
                    .termination(base + scope.handler as u64)?;
                dispatch.scope_index = index as u32 + 1;
                trace!("calling __finally {:#x}", base + scope.handler as u64);
                handler(true, establisher_frame);
            }
            return Ok(ExceptionDisposition::ContinueSearch.into());
        }

        for scope in scopes.iter().skip(dispatch.scope_index as usize) {
            if !scope.contains(rva) || scope.is_termination() {
                continue;
            }

            let decision = if scope.handler as i32 == filter::EXCEPTION_EXECUTE_HANDLER {
                filter::EXCEPTION_EXECUTE_HANDLER
            } else {
                let routine = dispatch.routines().filter(base + scope.handler as u64)?;
                trace!("calling filter {:#x}", base + scope.handler as u64);
                routine(record, context, establisher_frame)
            };

            if decision < 0 {
                return Ok(ExceptionDisposition::ContinueExecution.into());
            }
            if decision == 0 {
                continue;
            }

            let target = base + scope.jump_target as u64;
            trace!("unwinding to __except {:#x}", target);
            let retval = record.code as u64;
            let unwound =
                dispatch.unwind_to(Some(establisher_frame), target, record, retval, context)?;
            return Ok(HandlerOutcome::Transfer(unwound.context));
        }
        Ok(ExceptionDisposition::ContinueSearch.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::memory::SimulatedMemory;

    #[test]
    fn test_read_scope_table() {
        let mut memory = SimulatedMemory::new();
        memory.map_zeroed(0x1000, 0x100).unwrap();
        memory.write_u32(0x1000, 2).unwrap();
        for (i, value) in [0x10u32, 0x20, 1, 0x30, 0x10, 0x18, 0x40, 0].iter().enumerate() {
            memory.write_u32(0x1004 + 4 * i as u64, *value).unwrap();
        }

        let scopes = read_scope_table(&memory, 0x1000).unwrap();
        assert_eq!(scopes.len(), 2);
        assert!(scopes[0].contains(0x1f));
        assert!(!scopes[0].contains(0x20));
        assert!(!scopes[0].is_termination());
        assert!(scopes[1].is_termination());

        memory.write_u32(0x1000, MAX_SCOPES + 1).unwrap();
        assert!(read_scope_table(&memory, 0x1000).is_err());
    }
}
