//! Structured exceptions.
//!
//! This module holds the exception data model ([`ExceptionRecord`], [`ExceptionFlags`],
//! [`status`] codes and [`ExceptionDisposition`]) and the frame-walking machinery built on the
//! [`crate::unwind::UnwindEngine`] capability:
//!
//! - [`dispatch::ExceptionDispatcher`] runs the exception pass (vectored handlers, then frame
//!   handlers) and the unwind pass (termination handlers up to a target frame), including
//!   collided unwinds, `longjmp` and unwind consolidation
//! - [`routines::RoutineTable`] maps code addresses to the Rust routines standing in for
//!   language handlers, exception filters, termination handlers and consolidation callbacks
//! - [`scope::CSpecificHandler`] is the standard scope-table handler for `__try` / `__except` /
//!   `__finally` regions

use bitflags::bitflags;
use strum::{Display, FromRepr};

pub mod dispatch;
pub mod routines;
pub mod scope;

/// Maximum number of extra parameters carried by an exception record.
pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

/// Exception and status codes.
pub mod status {
    /// Unwind without an exception record
    pub const STATUS_UNWIND: u32 = 0xC000_0027;
    /// `longjmp` unwind; parameter 0 is the jump buffer
    pub const STATUS_LONGJUMP: u32 = 0x8000_0026;
    /// Consolidating unwind; parameter 0 is the callback
    pub const STATUS_UNWIND_CONSOLIDATE: u32 = 0x8000_0029;
    /// A handler returned an unknown disposition
    pub const STATUS_INVALID_DISPOSITION: u32 = 0xC000_0026;
    /// A handler tried to continue a non-continuable exception
    pub const STATUS_NONCONTINUABLE_EXCEPTION: u32 = 0xC000_0025;
    /// An establisher frame lies outside the stack
    pub const STATUS_BAD_STACK: u32 = 0xC000_0028;
    /// The end frame of an unwind was not found
    pub const STATUS_INVALID_UNWIND_TARGET: u32 = 0xC000_0029;
    /// A DLL entry point failed its attach notification
    pub const STATUS_DLL_INIT_FAILED: u32 = 0xC000_0142;
    /// A DLL could not be found
    pub const STATUS_DLL_NOT_FOUND: u32 = 0xC000_0135;
    /// An entry point could not be found
    pub const STATUS_PROCEDURE_NOT_FOUND: u32 = 0xC000_007A;
    /// Invalid memory access
    pub const STATUS_ACCESS_VIOLATION: u32 = 0xC000_0005;
    /// Breakpoint instruction
    pub const STATUS_BREAKPOINT: u32 = 0x8000_0003;
    /// Unhandled exception
    pub const STATUS_UNHANDLED_EXCEPTION: u32 = 0xC000_0144;
    /// Missing or corrupt function table
    pub const STATUS_BAD_FUNCTION_TABLE: u32 = 0xC000_00FF;
    /// Call through an import that was never resolved
    pub const EXCEPTION_WINE_STUB: u32 = 0x8000_0100;
}

/// Exception filter results, as returned by filter routines.
pub mod filter {
    /// Run the `__except` block
    pub const EXCEPTION_EXECUTE_HANDLER: i32 = 1;
    /// Keep looking for a handler
    pub const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
    /// Resume at the faulting instruction
    pub const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
}

bitflags! {
    /// Exception record flags (`EXCEPTION_*` / `EH_*`).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ExceptionFlags: u32 {
        /// The exception cannot be continued
        const NONCONTINUABLE = 0x01;
        /// The handler is called as part of an unwind
        const UNWINDING = 0x02;
        /// The unwind has no end frame
        const EXIT_UNWIND = 0x04;
        /// An invalid establisher frame was found
        const STACK_INVALID = 0x08;
        /// Raised while another exception was being handled
        const NESTED_CALL = 0x10;
        /// The current frame is the end frame of the unwind
        const TARGET_UNWIND = 0x20;
        /// The unwind collided with another unwind
        const COLLIDED_UNWIND = 0x40;
    }
}

/// Handler return codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u32)]
pub enum ExceptionDisposition {
    /// Resume execution at the faulting context
    ContinueExecution = 0,
    /// Continue with the next frame
    ContinueSearch = 1,
    /// An exception occurred while a handler was running
    NestedException = 2,
    /// This pass was overtaken by another unwind
    CollidedUnwind = 3,
}

impl ExceptionDisposition {
    /// Raw disposition value.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// An exception record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// Exception code, see [`status`]
    pub code: u32,
    /// Record flags
    pub flags: ExceptionFlags,
    /// The exception that was being handled when this one was raised
    pub nested: Option<Box<ExceptionRecord>>,
    /// Faulting address
    pub address: u64,
    parameter_count: usize,
    parameters: [u64; EXCEPTION_MAXIMUM_PARAMETERS],
}

impl ExceptionRecord {
    /// Create a continuable record with no parameters.
    pub fn new(code: u32) -> Self {
        ExceptionRecord {
            code,
            flags: ExceptionFlags::empty(),
            nested: None,
            address: 0,
            parameter_count: 0,
            parameters: [0; EXCEPTION_MAXIMUM_PARAMETERS],
        }
    }

    /// Mark the record non-continuable.
    pub fn noncontinuable(mut self) -> Self {
        self.flags |= ExceptionFlags::NONCONTINUABLE;
        self
    }

    /// Set the faulting address.
    pub fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    /// Set the extra parameters, truncated to [`EXCEPTION_MAXIMUM_PARAMETERS`].
    pub fn with_parameters(mut self, parameters: &[u64]) -> Self {
        let count = parameters.len().min(EXCEPTION_MAXIMUM_PARAMETERS);
        self.parameters[..count].copy_from_slice(&parameters[..count]);
        self.parameter_count = count;
        self
    }

    /// Chain the record being handled when this one was raised.
    pub fn with_nested(mut self, nested: ExceptionRecord) -> Self {
        self.nested = Some(Box::new(nested));
        self
    }

    /// The extra parameters.
    pub fn parameters(&self) -> &[u64] {
        &self.parameters[..self.parameter_count]
    }

    /// Whether the record is non-continuable.
    pub fn is_noncontinuable(&self) -> bool {
        self.flags.contains(ExceptionFlags::NONCONTINUABLE)
    }

    /// Whether the record is being processed by an unwind pass.
    pub fn is_unwinding(&self) -> bool {
        self.flags
            .intersects(ExceptionFlags::UNWINDING | ExceptionFlags::EXIT_UNWIND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_record_parameters() {
        let record = ExceptionRecord::new(status::STATUS_ACCESS_VIOLATION)
            .with_address(0x1000)
            .with_parameters(&[1, 0xdead]);
        assert_eq!(record.parameters(), &[1, 0xdead]);
        assert!(!record.is_noncontinuable());

        let many: Vec<u64> = (0..20).collect();
        let record = ExceptionRecord::new(0).with_parameters(&many);
        assert_eq!(record.parameters().len(), EXCEPTION_MAXIMUM_PARAMETERS);
    }

    #[test]
    fn test_disposition_from_repr() {
        assert_eq!(
            ExceptionDisposition::from_repr(3),
            Some(ExceptionDisposition::CollidedUnwind)
        );
        assert_eq!(ExceptionDisposition::from_repr(7), None);
        assert_eq!(ExceptionDisposition::ContinueSearch.code(), 1);
    }

    #[test]
    fn test_error_to_exception_record() {
        let inner = ExceptionRecord::new(status::STATUS_BREAKPOINT).with_address(0x4000);
        let error = Error::InvalidDisposition {
            disposition: 9,
            record: Box::new(inner.clone()),
        };

        let raised = error.exception_record().unwrap();
        assert_eq!(raised.code, status::STATUS_INVALID_DISPOSITION);
        assert!(raised.is_noncontinuable());
        assert_eq!(raised.address, 0x4000);
        assert_eq!(raised.nested.as_deref(), Some(&inner));

        let raised = Error::DllInitFailed("a.dll".into()).exception_record().unwrap();
        assert_eq!(raised.code, status::STATUS_DLL_INIT_FAILED);
        assert!(Error::ModuleNotFound("a.dll".into()).exception_record().is_none());
    }
}
