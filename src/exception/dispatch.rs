//! Two-pass exception dispatch.
//!
//! The [`ExceptionDispatcher`] walks frames with an [`UnwindEngine`] and invokes the language
//! handlers the unwind metadata names:
//!
//! - the **exception pass** ([`ExceptionDispatcher::raise_exception`]) offers the exception to
//!   the vectored handlers, then to each frame's exception handler, innermost first, until one
//!   resumes execution or transfers control
//! - the **unwind pass** ([`ExceptionDispatcher::unwind_to`]) calls each frame's termination
//!   handler up to and including the end frame, then resumes at the target address
//!
//! Handlers receive a [`DispatcherContext`] that exposes the dispatcher state of the frame
//! being processed and lets them start a nested unwind. When a nested unwind overtakes the
//! pass that invoked the handler, the handler copies the nested pass's state back with
//! [`DispatcherContext::resync`] and returns [`ExceptionDisposition::CollidedUnwind`]; the
//! interrupted pass then continues from that state rather than from its own.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::{
    exception::{
        filter, routines::RoutineTable, status, ExceptionDisposition, ExceptionFlags,
        ExceptionRecord,
    },
    unwind::{
        memory::MemoryReader,
        table::{FunctionLookup, HistoryTable},
        UnwindContext, UnwindEngine, UnwindFlags,
    },
    Error, Result,
};

/// Default bound on the number of frames a single pass may visit.
pub const DEFAULT_MAX_FRAMES: usize = 1024;

/// Address range of a thread's stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest valid address
    pub limit: u64,
    /// Highest address (the initial stack pointer)
    pub base: u64,
}

impl StackBounds {
    /// Create bounds for the stack `[limit, base]`.
    pub fn new(limit: u64, base: u64) -> Self {
        StackBounds { limit, base }
    }

    /// Whether `frame` is an aligned address inside the stack.
    pub fn contains(&self, frame: u64) -> bool {
        frame % 8 == 0 && frame >= self.limit && frame <= self.base
    }
}

/// Dispatcher settings.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Stack of the thread being dispatched on
    pub stack_bounds: StackBounds,
    /// Maximum number of frames per pass
    pub max_frames: usize,
}

impl DispatcherConfig {
    /// Settings for a thread with the given stack.
    pub fn new(stack_bounds: StackBounds) -> Self {
        DispatcherConfig {
            stack_bounds,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    /// Override the frame limit.
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }
}

/// Per-frame state of a dispatch pass, as seen by language handlers.
#[derive(Clone, Debug)]
pub struct DispatcherState<C> {
    /// Instruction pointer of the frame
    pub control_pc: u64,
    /// Base of the image owning the function entry
    pub image_base: u64,
    /// Function entry covering the frame, if any
    pub function_entry: Option<FunctionLookup>,
    /// Establisher frame of the frame
    pub establisher_frame: u64,
    /// Resume address of the unwind in progress
    pub target_ip: u64,
    /// Register context associated with the frame
    pub context: C,
    /// Language handler of the frame
    pub language_handler: Option<u64>,
    /// Address of the handler data
    pub handler_data: u64,
    /// First scope the handler still has to process
    pub scope_index: u32,
    /// Whether `control_pc` is a return address
    pub control_pc_is_unwound: bool,
}

impl<C: UnwindContext> DispatcherState<C> {
    fn new(context: C, target_ip: u64) -> Self {
        DispatcherState {
            control_pc: context.instruction_pointer(),
            image_base: 0,
            function_entry: None,
            establisher_frame: context.stack_pointer(),
            target_ip,
            context,
            language_handler: None,
            handler_data: 0,
            scope_index: 0,
            control_pc_is_unwound: false,
        }
    }
}

/// What a language handler did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerOutcome<C> {
    /// A raw disposition code, normally an [`ExceptionDisposition`]
    Disposition(u32),
    /// The handler unwound the stack itself; execution continues at this context
    Transfer(C),
}

impl<C> From<ExceptionDisposition> for HandlerOutcome<C> {
    fn from(disposition: ExceptionDisposition) -> Self {
        HandlerOutcome::Disposition(disposition.code())
    }
}

/// A frame-based exception handler.
///
/// Closures with the matching signature implement this trait; register them with
/// [`RoutineTable::register_handler`].
pub trait LanguageHandler<E: UnwindEngine>: Send + Sync {
    /// Handle `record` for the frame at `establisher_frame`.
    ///
    /// During the exception pass `context` is the faulting context and may be modified
    /// before returning [`ExceptionDisposition::ContinueExecution`]. During the unwind pass
    /// it is a copy of the frame's own context.
    fn handle(
        &self,
        record: &mut ExceptionRecord,
        establisher_frame: u64,
        context: &mut E::Context,
        dispatch: &mut DispatcherContext<'_, E>,
    ) -> Result<HandlerOutcome<E::Context>>;
}

impl<E, F> LanguageHandler<E> for F
where
    E: UnwindEngine,
    F: Fn(
            &mut ExceptionRecord,
            u64,
            &mut E::Context,
            &mut DispatcherContext<'_, E>,
        ) -> Result<HandlerOutcome<E::Context>>
        + Send
        + Sync,
{
    fn handle(
        &self,
        record: &mut ExceptionRecord,
        establisher_frame: u64,
        context: &mut E::Context,
        dispatch: &mut DispatcherContext<'_, E>,
    ) -> Result<HandlerOutcome<E::Context>> {
        self(record, establisher_frame, context, dispatch)
    }
}

/// Handler view of a pass in progress.
pub struct DispatcherContext<'a, E: UnwindEngine> {
    state: &'a mut DispatcherState<E::Context>,
    history: &'a mut HistoryTable,
    dispatcher: &'a ExceptionDispatcher<E>,
}

impl<E: UnwindEngine> DispatcherContext<'_, E> {
    /// The dispatcher running the pass.
    pub fn dispatcher(&self) -> &ExceptionDispatcher<E> {
        self.dispatcher
    }

    /// Memory of the address space.
    pub fn memory(&self) -> &dyn MemoryReader {
        self.dispatcher.memory()
    }

    /// Routines available to the handler.
    pub fn routines(&self) -> &RoutineTable<E> {
        &self.dispatcher.routines
    }

    /// Lookup cache shared by the pass.
    pub fn history(&mut self) -> &mut HistoryTable {
        &mut *self.history
    }

    /// Replace the state of the interrupted pass with `state`.
    ///
    /// Used together with [`ExceptionDisposition::CollidedUnwind`].
    pub fn resync(&mut self, state: DispatcherState<E::Context>) {
        *self.state = state;
    }

    /// Start a nested unwind from `context`, sharing this pass's lookup cache.
    ///
    /// # Errors
    /// See [`ExceptionDispatcher::unwind_to`].
    pub fn unwind_to(
        &mut self,
        end_frame: Option<u64>,
        target_ip: u64,
        record: &mut ExceptionRecord,
        retval: u64,
        context: &E::Context,
    ) -> Result<Unwound<E::Context>> {
        self.dispatcher
            .unwind_to(end_frame, target_ip, record, retval, context, &mut *self.history)
    }
}

impl<E: UnwindEngine> Deref for DispatcherContext<'_, E> {
    type Target = DispatcherState<E::Context>;

    fn deref(&self) -> &Self::Target {
        &*self.state
    }
}

impl<E: UnwindEngine> DerefMut for DispatcherContext<'_, E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.state
    }
}

/// How execution continues after a successful exception pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resumption<C> {
    /// A handler resumed the faulting context, possibly modified
    Continue(C),
    /// A handler unwound the stack; execution continues at the unwind target
    Unwound(C),
}

impl<C> Resumption<C> {
    /// The context to resume.
    pub fn context(&self) -> &C {
        match self {
            Resumption::Continue(context) | Resumption::Unwound(context) => context,
        }
    }

    /// Consume into the context to resume.
    pub fn into_context(self) -> C {
        match self {
            Resumption::Continue(context) | Resumption::Unwound(context) => context,
        }
    }
}

/// Result of a completed unwind pass.
#[derive(Clone, Debug)]
pub struct Unwound<C> {
    /// Context positioned at the target, with the return value set
    pub context: C,
    /// Dispatcher state at the last frame processed
    pub state: DispatcherState<C>,
}

/// Identifier of a registered vectored handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VectoredHandlerId(u64);

/// Vectored exception handler, returning a [`filter`] result.
pub type VectoredHandler<C> = Arc<dyn Fn(&mut ExceptionRecord, &mut C) -> i32 + Send + Sync>;

/// Frame-walking exception dispatcher for one thread's stack.
pub struct ExceptionDispatcher<E: UnwindEngine> {
    engine: Arc<E>,
    memory: Arc<dyn MemoryReader + Send + Sync>,
    routines: Arc<RoutineTable<E>>,
    vectored: RwLock<Vec<(VectoredHandlerId, VectoredHandler<E::Context>)>>,
    next_vectored: AtomicU64,
    config: DispatcherConfig,
}

impl<E: UnwindEngine> ExceptionDispatcher<E> {
    /// Create a dispatcher with an empty routine table.
    pub fn new(
        engine: Arc<E>,
        memory: Arc<dyn MemoryReader + Send + Sync>,
        config: DispatcherConfig,
    ) -> Self {
        ExceptionDispatcher {
            engine,
            memory,
            routines: Arc::new(RoutineTable::new()),
            vectored: RwLock::new(Vec::new()),
            next_vectored: AtomicU64::new(1),
            config,
        }
    }

    /// Share `routines` with other dispatchers of the same address space.
    pub fn with_routines(mut self, routines: Arc<RoutineTable<E>>) -> Self {
        self.routines = routines;
        self
    }

    /// The unwind engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The routine table.
    pub fn routines(&self) -> &Arc<RoutineTable<E>> {
        &self.routines
    }

    /// The settings.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Memory of the address space.
    pub fn memory(&self) -> &dyn MemoryReader {
        &*self.memory
    }

    /// Register a vectored handler, ahead of the existing ones if `first` is set.
    pub fn add_vectored_handler<F>(&self, first: bool, handler: F) -> VectoredHandlerId
    where
        F: Fn(&mut ExceptionRecord, &mut E::Context) -> i32 + Send + Sync + 'static,
    {
        let id = VectoredHandlerId(self.next_vectored.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.vectored.write();
        if first {
            handlers.insert(0, (id, Arc::new(handler)));
        } else {
            handlers.push((id, Arc::new(handler)));
        }
        id
    }

    /// Remove a vectored handler. Returns `false` if it was not registered.
    pub fn remove_vectored_handler(&self, id: VectoredHandlerId) -> bool {
        let mut handlers = self.vectored.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Dispatch an exception raised at `context`.
    ///
    /// On the first chance the vectored handlers run, then the frame handlers. A second-chance
    /// exception skips the handlers and is reported unhandled.
    ///
    /// # Errors
    /// Returns [`Error::Unhandled`] if no handler accepted the exception, and the dispatch
    /// failures [`Error::NonContinuable`], [`Error::InvalidDisposition`],
    /// [`Error::InvalidEstablisherFrame`] and [`Error::NoUnwindInfo`]. Use
    /// [`Error::exception_record`] to raise the follow-up exception.
    pub fn raise_exception(
        &self,
        mut record: ExceptionRecord,
        mut context: E::Context,
        first_chance: bool,
    ) -> Result<Resumption<E::Context>> {
        if record.address == 0 {
            record.address = context.instruction_pointer();
        }
        debug!(
            "raise code={:#x} flags={:?} addr={:#x} first_chance={}",
            record.code, record.flags, record.address, first_chance
        );

        if first_chance {
            if self.call_vectored_handlers(&mut record, &mut context) {
                return Ok(Resumption::Continue(context));
            }
            if let Some(resumption) = self.call_stack_handlers(&mut record, &mut context)? {
                return Ok(resumption);
            }
        }

        warn!(
            "unhandled exception {:#x} at {:#x}",
            record.code, record.address
        );
        Err(Error::Unhandled(Box::new(record)))
    }

    /// Unwind from `context` to `end_frame` and resume at `target_ip`.
    ///
    /// Without a `record` a `STATUS_UNWIND` record is synthesized.
    ///
    /// # Errors
    /// See [`ExceptionDispatcher::unwind_to`].
    pub fn unwind(
        &self,
        end_frame: Option<u64>,
        target_ip: u64,
        record: Option<ExceptionRecord>,
        retval: u64,
        context: &E::Context,
    ) -> Result<Unwound<E::Context>> {
        let mut record = record.unwrap_or_else(|| {
            ExceptionRecord::new(status::STATUS_UNWIND).with_address(context.instruction_pointer())
        });
        let mut history = HistoryTable::new();
        self.unwind_to(end_frame, target_ip, &mut record, retval, context, &mut history)
    }

    /// Run the unwind pass.
    ///
    /// Every frame from `context` outwards has its termination handler invoked, up to and
    /// including `end_frame`; `None` unwinds to the stack base. The returned context resumes
    /// at `target_ip` with `retval` in the return register and the end frame's stack pointer.
    /// `STATUS_LONGJUMP` records restore the jump buffer in parameter 0, and
    /// `STATUS_UNWIND_CONSOLIDATE` records call the callback in parameter 0 to pick the
    /// target.
    ///
    /// # Errors
    /// Returns [`Error::InvalidUnwindTarget`] if a frame with a handler lies past `end_frame`
    /// or the walk reaches the stack base without finding it, [`Error::InvalidEstablisherFrame`] for frames outside
    /// the stack, [`Error::InvalidDisposition`] if a termination handler returns anything but
    /// continue-search or collided-unwind, and [`Error::RecursionLimit`] past the frame limit.
    pub fn unwind_to(
        &self,
        end_frame: Option<u64>,
        mut target_ip: u64,
        record: &mut ExceptionRecord,
        retval: u64,
        context: &E::Context,
        history: &mut HistoryTable,
    ) -> Result<Unwound<E::Context>> {
        let bounds = self.config.stack_bounds;
        record.flags |= ExceptionFlags::UNWINDING;
        if end_frame.is_none() {
            record.flags |= ExceptionFlags::EXIT_UNWIND;
        }
        debug!(
            "unwind code={:#x} flags={:?} end_frame={:x?} target_ip={:#x}",
            record.code, record.flags, end_frame, target_ip
        );

        let mut new_context = context.clone();
        let mut state = DispatcherState::new(context.clone(), target_ip);
        let mut frames = 0;
        let mut collided = false;

        let mut context = loop {
            if !collided {
                if frames >= self.config.max_frames {
                    return Err(Error::RecursionLimit(self.config.max_frames));
                }
                state.context = new_context.clone();
                self.virtual_unwind(
                    UnwindFlags::UHANDLER,
                    &mut state,
                    &mut new_context,
                    history,
                    frames == 0,
                )?;
                frames += 1;
            }
            collided = false;

            let frame = state.establisher_frame;
            if frame == 0 {
                break new_context;
            }
            if !bounds.contains(frame) {
                error!(
                    "invalid frame {:#x} ({:#x}-{:#x})",
                    frame, bounds.limit, bounds.base
                );
                record.flags |= ExceptionFlags::STACK_INVALID;
                return Err(Error::InvalidEstablisherFrame {
                    frame,
                    record: Box::new(record.clone()),
                });
            }
            if let Some(handler) = state.language_handler {
                if let Some(end) = end_frame {
                    if frame > end {
                        error!("invalid end frame {:#x}/{:#x}", frame, end);
                        return Err(Error::InvalidUnwindTarget {
                            frame,
                            end_frame: end,
                            record: Box::new(record.clone()),
                        });
                    }
                    if frame == end {
                        record.flags |= ExceptionFlags::TARGET_UNWIND;
                    }
                }

                let mut frame_context = state.context.clone();
                let outcome = self.call_handler(
                    handler,
                    record,
                    frame,
                    &mut frame_context,
                    &mut state,
                    history,
                )?;
                match outcome {
                    HandlerOutcome::Transfer(target) => {
                        return Ok(Unwound {
                            context: target,
                            state,
                        })
                    }
                    HandlerOutcome::Disposition(code) => match ExceptionDisposition::from_repr(code)
                    {
                        Some(ExceptionDisposition::ContinueSearch) => {}
                        Some(ExceptionDisposition::CollidedUnwind) => {
                            trace!("collided unwind, resuming at frame {:#x}", state.establisher_frame);
                            new_context = state.context.clone();
                            self.engine.unwind_one_frame(
                                UnwindFlags::empty(),
                                state.function_entry.as_ref(),
                                &mut new_context,
                                self.memory(),
                            )?;
                            record.flags |= ExceptionFlags::COLLIDED_UNWIND;
                            collided = true;
                            continue;
                        }
                        _ => {
                            return Err(Error::InvalidDisposition {
                                disposition: code,
                                record: Box::new(record.clone()),
                            })
                        }
                    },
                }
                record.flags.remove(ExceptionFlags::COLLIDED_UNWIND);
            }

            if end_frame == Some(state.establisher_frame) {
                break state.context.clone();
            }
            if new_context.stack_pointer() >= bounds.base {
                match end_frame {
                    None => break new_context,
                    Some(end) => {
                        return Err(Error::InvalidUnwindTarget {
                            frame: state.establisher_frame,
                            end_frame: end,
                            record: Box::new(record.clone()),
                        })
                    }
                }
            }
        };

        match (record.code, record.parameters().first().copied()) {
            (status::STATUS_UNWIND_CONSOLIDATE, Some(address)) => {
                let callback = self.routines.consolidate(address)?;
                trace!("calling consolidate callback {:#x}", address);
                target_ip = callback(record, &mut context)?;
            }
            (status::STATUS_LONGJUMP, Some(buffer)) => {
                context.restore_jump_buffer(self.memory(), buffer)?;
            }
            _ => {}
        }
        context.set_return_value(retval);
        context.set_instruction_pointer(target_ip);
        state.target_ip = target_ip;
        Ok(Unwound { context, state })
    }

    /// Unwind to the frame recorded in the jump buffer at `buffer` and resume there.
    ///
    /// A zero `retval` is delivered as 1.
    ///
    /// # Errors
    /// Returns [`Error::MemoryFault`] for an unreadable buffer, plus the errors of
    /// [`ExceptionDispatcher::unwind_to`].
    pub fn longjmp(
        &self,
        buffer: u64,
        retval: u64,
        context: &E::Context,
    ) -> Result<Unwound<E::Context>> {
        let frame = self.memory.read_u64(buffer)?;
        let target = context.jump_buffer_target(self.memory(), buffer)?;
        let record = ExceptionRecord::new(status::STATUS_LONGJUMP)
            .with_address(context.instruction_pointer())
            .with_parameters(&[buffer]);
        let retval = if retval == 0 { 1 } else { retval };
        self.unwind(Some(frame), target, Some(record), retval, context)
    }

    /// Unwind to `end_frame`, then let the consolidation callback registered at `callback`
    /// choose where to resume. `arguments` follow the callback in the record parameters.
    ///
    /// # Errors
    /// Returns [`Error::RoutineNotFound`] if no callback is registered, plus the errors of
    /// [`ExceptionDispatcher::unwind_to`].
    pub fn consolidate(
        &self,
        end_frame: Option<u64>,
        callback: u64,
        arguments: &[u64],
        retval: u64,
        context: &E::Context,
    ) -> Result<Unwound<E::Context>> {
        let mut parameters = Vec::with_capacity(arguments.len() + 1);
        parameters.push(callback);
        parameters.extend_from_slice(arguments);
        let record = ExceptionRecord::new(status::STATUS_UNWIND_CONSOLIDATE)
            .with_address(context.instruction_pointer())
            .with_parameters(&parameters);
        self.unwind(end_frame, 0, Some(record), retval, context)
    }

    fn call_vectored_handlers(&self, record: &mut ExceptionRecord, context: &mut E::Context) -> bool {
        let handlers: Vec<_> = self
            .vectored
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            if handler(record, context) == filter::EXCEPTION_CONTINUE_EXECUTION {
                trace!("vectored handler continued execution");
                return true;
            }
        }
        false
    }

    /// The exception pass. `Ok(None)` means the walk ended without a taker.
    fn call_stack_handlers(
        &self,
        record: &mut ExceptionRecord,
        original: &mut E::Context,
    ) -> Result<Option<Resumption<E::Context>>> {
        let bounds = self.config.stack_bounds;
        let mut history = HistoryTable::new();
        let mut context = original.clone();
        let mut state = DispatcherState::new(context.clone(), 0);
        let mut collided = false;

        for index in 0..self.config.max_frames {
            if !collided {
                self.virtual_unwind(
                    UnwindFlags::EHANDLER,
                    &mut state,
                    &mut context,
                    &mut history,
                    index == 0,
                )?;
                state.context = context.clone();
            }
            collided = false;

            let frame = state.establisher_frame;
            if frame == 0 {
                return Ok(None);
            }
            if !bounds.contains(frame) {
                error!(
                    "invalid frame {:#x} ({:#x}-{:#x})",
                    frame, bounds.limit, bounds.base
                );
                record.flags |= ExceptionFlags::STACK_INVALID;
                return Err(Error::InvalidEstablisherFrame {
                    frame,
                    record: Box::new(record.clone()),
                });
            }

            if let Some(handler) = state.language_handler {
                let outcome =
                    self.call_handler(handler, record, frame, original, &mut state, &mut history)?;
                record.flags &= ExceptionFlags::NONCONTINUABLE;
                match outcome {
                    HandlerOutcome::Transfer(target) => {
                        return Ok(Some(Resumption::Unwound(target)))
                    }
                    HandlerOutcome::Disposition(code) => match ExceptionDisposition::from_repr(code)
                    {
                        Some(ExceptionDisposition::ContinueExecution) => {
                            if record.is_noncontinuable() {
                                return Err(Error::NonContinuable(Box::new(record.clone())));
                            }
                            return Ok(Some(Resumption::Continue(original.clone())));
                        }
                        Some(ExceptionDisposition::ContinueSearch) => {}
                        Some(ExceptionDisposition::NestedException) => {
                            record.flags |= ExceptionFlags::NESTED_CALL;
                        }
                        Some(ExceptionDisposition::CollidedUnwind) => {
                            context = state.context.clone();
                            self.engine.unwind_one_frame(
                                UnwindFlags::empty(),
                                state.function_entry.as_ref(),
                                &mut context,
                                self.memory(),
                            )?;
                            collided = true;
                            continue;
                        }
                        None => {
                            return Err(Error::InvalidDisposition {
                                disposition: code,
                                record: Box::new(record.clone()),
                            })
                        }
                    },
                }
            }

            if context.stack_pointer() >= bounds.base {
                return Ok(None);
            }
        }
        Err(Error::RecursionLimit(self.config.max_frames))
    }

    /// Unwind `context` by one frame and describe the frame in `state`.
    fn virtual_unwind(
        &self,
        kind: UnwindFlags,
        state: &mut DispatcherState<E::Context>,
        context: &mut E::Context,
        history: &mut HistoryTable,
        first_frame: bool,
    ) -> Result<()> {
        state.image_base = 0;
        state.scope_index = 0;
        state.control_pc = context.instruction_pointer();
        state.control_pc_is_unwound = context.unwound_to_call();

        let pc = if state.control_pc_is_unwound {
            state.control_pc.wrapping_sub(4)
        } else {
            state.control_pc
        };
        state.function_entry = self.engine.lookup_function(pc, self.memory(), Some(history));
        match &state.function_entry {
            Some(lookup) => state.image_base = lookup.image_base,
            None if first_frame => debug!("no unwind info for {:#x}, treating as leaf", pc),
            None => return Err(Error::NoUnwindInfo(state.control_pc)),
        }

        let frame = self.engine.unwind_one_frame(
            kind,
            state.function_entry.as_ref(),
            context,
            self.memory(),
        )?;
        state.establisher_frame = frame.establisher_frame;
        state.language_handler = frame.handler;
        state.handler_data = frame.handler_data;
        Ok(())
    }

    fn call_handler(
        &self,
        address: u64,
        record: &mut ExceptionRecord,
        frame: u64,
        context: &mut E::Context,
        state: &mut DispatcherState<E::Context>,
        history: &mut HistoryTable,
    ) -> Result<HandlerOutcome<E::Context>> {
        let handler = self.routines.language_handler(address)?;
        trace!(
            "calling handler {:#x} (rec={:#x}, frame={:#x}, flags={:?})",
            address,
            record.code,
            frame,
            record.flags
        );
        let mut dispatch = DispatcherContext {
            state,
            history,
            dispatcher: self,
        };
        handler.handle(record, frame, context, &mut dispatch)
    }
}
