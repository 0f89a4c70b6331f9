use thiserror::Error;

use crate::exception::{status, ExceptionRecord};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants follow the failure classes of the two subsystems: module resolution and
/// loading, symbol lookup, the attach/detach lifecycle, and stack unwinding / exception
/// dispatch. Variants produced by the dispatcher carry the [`ExceptionRecord`] that was being
/// processed so an outer layer can raise a follow-up exception with the original record
/// nested inside (see [`Error::exception_record`]).
///
/// # Error Categories
///
/// ## Image Errors
/// - [`Error::Malformed`] - Corrupted image, export table or unwind data
/// - [`Error::OutOfBounds`] - Read or write outside of an image
/// - [`Error::NotSupported`] - Image or unwind feature that is not implemented
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - PE parsing errors from goblin crate
///
/// ## Resolution Errors
/// - [`Error::ModuleNotFound`] - No mechanism could locate the module (recoverable)
/// - [`Error::LoadFailed`] - A mechanism found the module but mapping failed (fatal)
/// - [`Error::DependencyNotFound`] / [`Error::DependencyFailed`] - Import descriptor failures
/// - [`Error::OutOfMemory`] - Allocation failure (TLS blocks)
///
/// ## Symbol Errors
/// - [`Error::ProcedureNotFound`] - Export lookup failed
/// - [`Error::UnresolvedImport`] - Call through an import slot that was never bound
///
/// ## Lifecycle Errors
/// - [`Error::DllInitFailed`] - A module entry point refused the attach notification
/// - [`Error::InvalidHandle`] - Stale or unknown module handle
/// - [`Error::ProcessDetaching`] - Load attempted after process shutdown started
///
/// ## Unwind Errors
/// - [`Error::NoUnwindInfo`] - Missing metadata at a non-leaf frame
/// - [`Error::InvalidDisposition`] - Handler returned an unknown disposition
/// - [`Error::InvalidEstablisherFrame`] - Frame outside the thread's stack
/// - [`Error::InvalidUnwindTarget`] - End frame not reachable
/// - [`Error::NonContinuable`] - Handler asked to resume a non-continuable exception
/// - [`Error::Unhandled`] - No handler accepted the exception
/// - [`Error::RoutineNotFound`] - Handler address without a registered routine
/// - [`Error::MemoryFault`] - Simulated memory read failed
/// - [`Error::RecursionLimit`] - Forward chains or frame walks too deep
///
/// # Examples
///
/// ```rust,ignore
/// use ldrkit::{Error, prelude::*};
///
/// match loader.load_module("missing.dll", LoadFlags::empty()) {
///     Ok(handle) => println!("loaded {:?}", handle),
///     Err(Error::ModuleNotFound(name)) => eprintln!("{} not found", name),
///     Err(Error::DllInitFailed(name)) => eprintln!("{} refused to initialize", name),
///     Err(e) => eprintln!("load failed: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Image errors
    /// The image or its unwind data is damaged and could not be parsed.
    ///
    /// Includes the source location where the malformation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted on an image.
    #[error("Out of Bound access would have occurred!")]
    OutOfBounds,

    /// The image or unwind feature is not supported.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    // Resolution errors
    /// No load mechanism could find the requested module.
    ///
    /// This is the recoverable resolution failure: callers may retry with another
    /// mechanism or search path.
    #[error("Module not found - {0}")]
    ModuleNotFound(String),

    /// The module was found but could not be mapped.
    ///
    /// Any mapping failure other than "not found" aborts the whole load.
    #[error("Loading {name} failed - {reason}")]
    LoadFailed {
        /// Name of the module being loaded
        name: String,
        /// Description of the failure
        reason: String,
    },

    /// An import descriptor names a module that could not be found.
    #[error("Library {name} (which is needed by {needed_by}) not found")]
    DependencyNotFound {
        /// The imported module
        name: String,
        /// The importing module
        needed_by: String,
    },

    /// An import descriptor names a module that was found but failed to load.
    #[error("Loading library {name} (which is needed by {needed_by}) failed - {source}")]
    DependencyFailed {
        /// The imported module
        name: String,
        /// The importing module
        needed_by: String,
        /// The underlying load failure
        source: Box<Error>,
    },

    /// An allocation failed.
    #[error("Out of memory")]
    OutOfMemory,

    // Symbol errors
    /// Export lookup by name or ordinal failed.
    #[error("Procedure not found - {0}")]
    ProcedureNotFound(String),

    /// A call was attempted through an import slot that could not be bound.
    #[error("Unimplemented function {dll}.{symbol} called")]
    UnresolvedImport {
        /// The module the symbol was imported from
        dll: String,
        /// The symbol name, or `#ordinal`
        symbol: String,
    },

    // Lifecycle errors
    /// A module entry point returned failure for the attach notification.
    #[error("Initialization of {0} failed")]
    DllInitFailed(String),

    /// The module handle does not refer to a live module.
    #[error("Invalid module handle")]
    InvalidHandle,

    /// The process is shutting down and no further modules may be loaded.
    #[error("Process is detaching")]
    ProcessDetaching,

    // Unwind errors
    /// No unwind metadata exists for a frame that is not a leaf.
    #[error("No unwind information for pc {0:#x}")]
    NoUnwindInfo(u64),

    /// A handler returned a disposition outside the known set.
    #[error("Invalid disposition {disposition} returned by handler")]
    InvalidDisposition {
        /// The raw disposition code
        disposition: u32,
        /// The record being dispatched
        record: Box<ExceptionRecord>,
    },

    /// The establisher frame lies outside the current thread's stack.
    #[error("Invalid establisher frame {frame:#x}")]
    InvalidEstablisherFrame {
        /// The offending frame address
        frame: u64,
        /// The record being dispatched
        record: Box<ExceptionRecord>,
    },

    /// The end frame of an unwind cannot be reached from the current frame.
    #[error("Invalid unwind target {end_frame:#x} (reached frame {frame:#x})")]
    InvalidUnwindTarget {
        /// The frame at which the walk overshot
        frame: u64,
        /// The requested end frame
        end_frame: u64,
        /// The record being unwound
        record: Box<ExceptionRecord>,
    },

    /// A handler asked to continue execution of a non-continuable exception.
    #[error("Non-continuable exception {:#x} continued", .0.code)]
    NonContinuable(Box<ExceptionRecord>),

    /// No handler accepted the exception.
    #[error("Unhandled exception {:#x} at {:#x}", .0.code, .0.address)]
    Unhandled(Box<ExceptionRecord>),

    /// A handler, filter or callback address has no registered routine.
    #[error("No routine registered at {0:#x}")]
    RoutineNotFound(u64),

    /// A simulated memory access failed.
    #[error("Memory fault at {0:#x}")]
    MemoryFault(u64),

    /// Recursion limit reached.
    ///
    /// Forward chains and frame walks are bounded; the associated value is the limit.
    #[error("Reach the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),
}

impl Error {
    /// Returns `true` for the recoverable "not found" class of resolution failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ModuleNotFound(_) | Error::DependencyNotFound { .. }
        )
    }

    /// Builds the exception that reports this error to an outer dispatch layer.
    ///
    /// Lifecycle and unwind failures propagate by raising a new exception with the
    /// original record (if any) nested inside. Returns `None` for plain resolution and
    /// symbol errors, which propagate as ordinary values.
    ///
    /// # Returns
    /// The new, non-continuable exception record, or `None`.
    pub fn exception_record(&self) -> Option<ExceptionRecord> {
        let (code, nested) = match self {
            Error::DllInitFailed(_) => (status::STATUS_DLL_INIT_FAILED, None),
            Error::InvalidDisposition { record, .. } => {
                (status::STATUS_INVALID_DISPOSITION, Some(record))
            }
            Error::InvalidEstablisherFrame { record, .. } => {
                (status::STATUS_BAD_STACK, Some(record))
            }
            Error::InvalidUnwindTarget { record, .. } => {
                (status::STATUS_INVALID_UNWIND_TARGET, Some(record))
            }
            Error::NonContinuable(record) => {
                (status::STATUS_NONCONTINUABLE_EXCEPTION, Some(record))
            }
            Error::NoUnwindInfo(_) => (status::STATUS_BAD_FUNCTION_TABLE, None),
            _ => return None,
        };

        let mut raised = ExceptionRecord::new(code).noncontinuable();
        if let Some(record) = nested {
            raised.address = record.address;
            raised.nested = Some(record.clone());
        }
        Some(raised)
    }
}
