// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// - 'image/pe.rs' uses mmap to map an image file into memory

//! # ldrkit
//!
//! A PE module loader and structured-exception unwinding runtime for emulated Windows
//! address spaces. Built in pure Rust, `ldrkit` maps executable images, binds their import
//! tables against already-loaded or newly-loaded dependencies, drives the DLL attach/detach
//! protocol in dependency order, and walks call stacks with per-function unwind metadata to
//! dispatch structured exceptions.
//!
//! ## Features
//!
//! - **Module bookkeeping** - load, memory and initialization order over a generation-checked arena
//! - **Import binding** - by name (with hint) and by ordinal, following export forwarders
//! - **Lifecycle** - attach in dependency order, detach in reverse completion order, TLS callbacks
//! - **Thread-local storage** - process-wide slot assignment and per-thread data blocks
//! - **Virtual unwinding** - x86-64 and ARM64 unwind code interpreters, prologue and epilogue aware
//! - **Exception dispatch** - exception and unwind passes, collided unwinds, longjmp, consolidation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ldrkit::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(ImageStore::new());
//! store.add_file("C:\\app\\app.exe", ImageBuilder::exe("app.exe").import("kernel32.dll", [ImportThunk::name("Sleep")]).build()?);
//! store.add_builtin(ImageBuilder::dll("kernel32.dll").export("Sleep", 0x1000).build()?);
//!
//! let loader = Loader::builder(LoaderConfig::native_first().with_search_path("C:\\app"))
//!     .search(store.clone())
//!     .mapper(store)
//!     .build();
//! loader.start_process("app.exe")?;
//! # Ok::<(), ldrkit::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`image`] - the mapped-image data model, a synthetic image builder and the on-disk PE mapper
//! - [`loader`] - module table, export resolution, import binding, TLS and lifecycle
//! - [`unwind`] - unwind contexts, function tables and the per-architecture engines
//! - [`exception`] - exception records, the frame-walking dispatcher and standard handlers
//! - [`prelude`] - Convenient re-exports of commonly used types and traits
//! - [`Error`] and [`Result`] - Comprehensive error handling
//!
//! ### Concurrency
//!
//! The loader is serialized by a single reentrant loader lock, exposed as an explicit
//! [`loader::LoaderSession`] token: entry points receive the session and may load further
//! modules through it. Bookkeeping is protected by a short-held mutex that is never held while
//! module code runs. The unwinder and dispatcher are lock-free and only read immutable function
//! tables.

#[macro_use]
pub(crate) mod error;

#[cfg(test)]
pub(crate) mod test;

pub mod exception;
pub mod image;
pub mod loader;
pub mod prelude;
pub mod unwind;

/// `ldrkit` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `ldrkit` Error type
///
/// The main error type for all operations in this crate. See [`Error`] for the
/// individual failure classes.
pub use error::Error;
