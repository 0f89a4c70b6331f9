//! # ldrkit Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the ldrkit library. Import this module to get quick access to the loader, the
//! unwind engines and the exception dispatcher.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all ldrkit operations
pub use crate::Error;

/// The result type used throughout ldrkit
pub use crate::Result;

// ================================================================================================
// Images
// ================================================================================================

/// The mapped-image model and its directories
pub use crate::image::{
    ExportDirectory, ImportDescriptor, ImportThunk, Machine, MappedImage, TlsDirectory,
};

/// Image sources
pub use crate::image::{
    builder::ImageBuilder,
    pe::{PeFile, PeFileConfig, PeMapper},
    store::ImageStore,
};

// ================================================================================================
// Loader
// ================================================================================================

/// Loader entry points
pub use crate::loader::{Loader, LoaderBuilder, LoaderSession};

/// Loader configuration
pub use crate::loader::config::{LoadMechanism, LoaderConfig};

/// Module identity and state
pub use crate::loader::module::{LoadCount, ModuleFlags, ModuleHandle, ModuleInfo, ModuleState};

/// Load requests and lookups
pub use crate::loader::{exports::Procedure, imports::ImportSlot, load::LoadFlags};

/// Collaborators the loader drives
pub use crate::loader::collab::{
    DllReason, EntryCall, EntryPoints, EntryTable, ImageMapper, MapError, ModuleSearch,
};

/// Thread-local storage
pub use crate::loader::tls::TlsAllocator;

// ================================================================================================
// Unwinding
// ================================================================================================

/// Engine abstraction
pub use crate::unwind::{backtrace, FrameUnwind, UnwindContext, UnwindEngine, UnwindFlags};

/// Function tables
pub use crate::unwind::table::{FunctionLookup, FunctionTables, HistoryTable, RuntimeFunction};

/// Memory access
pub use crate::unwind::memory::{MemoryReader, SimulatedMemory};

/// Architecture engines
pub use crate::unwind::{
    arm64::{Arm64Context, Arm64Unwinder},
    x86_64::{X64Context, X64Unwinder},
};

// ================================================================================================
// Exception Dispatch
// ================================================================================================

/// Exception records and dispositions
pub use crate::exception::{status, ExceptionDisposition, ExceptionRecord};

/// The dispatcher
pub use crate::exception::dispatch::{
    DispatcherConfig, DispatcherContext, ExceptionDispatcher, HandlerOutcome, LanguageHandler,
    Resumption, StackBounds, Unwound,
};

/// Registered routines and the C scope-table handler
pub use crate::exception::{routines::RoutineTable, scope::CSpecificHandler};
