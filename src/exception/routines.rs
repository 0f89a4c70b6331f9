//! Code addresses bound to Rust routines.
//!
//! Unwind metadata names handlers, filters and termination blocks by address. An emulated
//! address space has no native code behind those addresses, so the dispatcher resolves them
//! through a [`RoutineTable`] populated by the embedder.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    exception::{
        dispatch::{DispatcherContext, HandlerOutcome, LanguageHandler},
        ExceptionRecord,
    },
    unwind::UnwindEngine,
    Error, Result,
};

/// Exception filter: `(record, context, establisher_frame) -> filter result`.
///
/// See [`crate::exception::filter`] for the result values.
pub type ExceptionFilter<C> = Arc<dyn Fn(&ExceptionRecord, &C, u64) -> i32 + Send + Sync>;

/// Termination handler: `(abnormal_termination, establisher_frame)`.
pub type TerminationHandler = Arc<dyn Fn(bool, u64) + Send + Sync>;

/// Unwind consolidation callback, returning the address to resume at.
pub type ConsolidateCallback<C> =
    Arc<dyn Fn(&ExceptionRecord, &mut C) -> Result<u64> + Send + Sync>;

/// Routines registered by address.
pub struct RoutineTable<E: UnwindEngine> {
    handlers: DashMap<u64, Arc<dyn LanguageHandler<E>>>,
    filters: DashMap<u64, ExceptionFilter<E::Context>>,
    terminations: DashMap<u64, TerminationHandler>,
    consolidations: DashMap<u64, ConsolidateCallback<E::Context>>,
}

impl<E: UnwindEngine> Default for RoutineTable<E> {
    fn default() -> Self {
        RoutineTable {
            handlers: DashMap::new(),
            filters: DashMap::new(),
            terminations: DashMap::new(),
            consolidations: DashMap::new(),
        }
    }
}

impl<E: UnwindEngine> RoutineTable<E> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a language handler object to `address`.
    pub fn register_language_handler(&self, address: u64, handler: Arc<dyn LanguageHandler<E>>) {
        self.handlers.insert(address, handler);
    }

    /// Bind a language handler closure to `address`.
    pub fn register_handler<F>(&self, address: u64, handler: F)
    where
        F: Fn(
                &mut ExceptionRecord,
                u64,
                &mut E::Context,
                &mut DispatcherContext<'_, E>,
            ) -> Result<HandlerOutcome<E::Context>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(address, Arc::new(handler));
    }

    /// Bind an exception filter to `address`.
    pub fn register_filter<F>(&self, address: u64, filter: F)
    where
        F: Fn(&ExceptionRecord, &E::Context, u64) -> i32 + Send + Sync + 'static,
    {
        self.filters.insert(address, Arc::new(filter));
    }

    /// Bind a termination handler to `address`.
    pub fn register_termination<F>(&self, address: u64, handler: F)
    where
        F: Fn(bool, u64) + Send + Sync + 'static,
    {
        self.terminations.insert(address, Arc::new(handler));
    }

    /// Bind an unwind consolidation callback to `address`.
    pub fn register_consolidate<F>(&self, address: u64, callback: F)
    where
        F: Fn(&ExceptionRecord, &mut E::Context) -> Result<u64> + Send + Sync + 'static,
    {
        self.consolidations.insert(address, Arc::new(callback));
    }

    /// Language handler at `address`.
    ///
    /// # Errors
    /// Returns [`Error::RoutineNotFound`] if nothing is registered there.
    pub fn language_handler(&self, address: u64) -> Result<Arc<dyn LanguageHandler<E>>> {
        self.handlers
            .get(&address)
            .map(|entry| entry.value().clone())
            .ok_or(Error::RoutineNotFound(address))
    }

    /// Exception filter at `address`.
    ///
    /// # Errors
    /// Returns [`Error::RoutineNotFound`] if nothing is registered there.
    pub fn filter(&self, address: u64) -> Result<ExceptionFilter<E::Context>> {
        self.filters
            .get(&address)
            .map(|entry| entry.value().clone())
            .ok_or(Error::RoutineNotFound(address))
    }

    /// Termination handler at `address`.
    ///
    /// # Errors
    /// Returns [`Error::RoutineNotFound`] if nothing is registered there.
    pub fn termination(&self, address: u64) -> Result<TerminationHandler> {
        self.terminations
            .get(&address)
            .map(|entry| entry.value().clone())
            .ok_or(Error::RoutineNotFound(address))
    }

    /// Consolidation callback at `address`.
    ///
    /// # Errors
    /// Returns [`Error::RoutineNotFound`] if nothing is registered there.
    pub fn consolidate(&self, address: u64) -> Result<ConsolidateCallback<E::Context>> {
        self.consolidations
            .get(&address)
            .map(|entry| entry.value().clone())
            .ok_or(Error::RoutineNotFound(address))
    }

    /// Remove every routine registered inside `[low, high)`, e.g. when a module unloads.
    pub fn remove_range(&self, low: u64, high: u64) {
        let outside = |address: &u64| *address < low || *address >= high;
        self.handlers.retain(|address, _| outside(address));
        self.filters.retain(|address, _| outside(address));
        self.terminations.retain(|address, _| outside(address));
        self.consolidations.retain(|address, _| outside(address));
    }
}
