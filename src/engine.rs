//! Tracing engine: lifecycle, instrumentation requests and buffer delivery.

use crossbeam_channel::{bounded, never};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

use crate::{
    arch::Trampoline,
    buffer::{Chunk, Consumer},
    collector::Collector,
    config::{Flags, Options},
    diag::{Error, Kind, Result},
    patch::{self, CodePatch, Database},
    platform::Platform,
    pool::Pool,
    procedure::Procedure,
    stats::Statistics,
    thunk::{Dispatcher, Handler},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
}

struct Session {
    database: Database,
    dispatcher: Arc<Dispatcher>,
    collector: Option<Collector>,
    autocollect: bool,
    bound: bool,
}

enum State {
    Uninitialized,
    Initialized(Box<Session>),
    ShuttingDown,
}

/// Owner of the patch database and of the data path of one tracing
/// session.
///
/// The state lock is the patch database lock: instrumentation requests,
/// lookups and lifecycle transitions are serialized by it.
pub struct Engine<P: Platform> {
    platform: P,
    state: Mutex<State>,
}

fn not_initialized() -> Error {
    Error::new(Kind::NotInitialized)
}

#[cfg(target_arch = "x86_64")]
fn bind(dispatcher: &Arc<Dispatcher>) -> Result<()> {
    crate::thunk::bind(dispatcher)
}

#[cfg(not(target_arch = "x86_64"))]
fn bind(_dispatcher: &Arc<Dispatcher>) -> Result<()> {
    Err(Error::new(Kind::InvalidArgument).with_detail("no thunks for this architecture"))
}

fn unbind() {
    #[cfg(target_arch = "x86_64")]
    crate::thunk::unbind();
}

impl<P: Platform> Engine<P> {
    #[must_use]
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            state: Mutex::new(State::Uninitialized),
        }
    }

    #[must_use]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        matches!(*self.state.lock(), State::Initialized(_))
    }

    /// Starts a tracing session. `handler` receives the events of every
    /// traced thread; `consumer` receives filled buffers, from the collector
    /// thread under `Flags::AUTOCOLLECT` and at shutdown in any mode.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInitialized` if a session is running (or, for
    /// platforms routing the process-wide thunks, if another engine owns
    /// them), `InvalidArgument` if `options` do not validate, or an `Err` if
    /// the collector thread cannot be started.
    pub fn initialize(
        &self,
        options: &Options,
        handler: impl Handler,
        consumer: impl Fn(&Chunk<'_>) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, State::Uninitialized) {
            return Err(Error::new(Kind::AlreadyInitialized));
        }
        options.validate()?;

        let autocollect = options.autocollect();
        let eager = autocollect
            && !options
                .flags
                .contains(Flags::DISABLE_EAGER_BUFFER_COLLECTION);
        let (wake, woken) = if eager {
            let (wake, woken) = bounded(1);
            (Some(wake), woken)
        } else {
            (None, never())
        };

        let pool = Arc::new(Pool::new(
            options.buffer_count as usize,
            options.buffer_size as usize,
            wake,
        ));
        let consumer: Arc<Consumer> = Arc::new(consumer);
        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(handler),
            Arc::clone(&consumer),
            Arc::clone(&pool),
            options.thread_data_preallocations as usize,
            !options.flags.contains(Flags::DISABLE_LAZY_ALLOCATION),
            self.platform.arch().exit_thunk(),
        ));

        let bound = self.platform.routes_thunks();
        if bound {
            bind(&dispatcher)?;
        }

        let collector = if autocollect {
            match Collector::spawn(pool, consumer, woken, options.collect_interval) {
                Ok(collector) => Some(collector),
                Err(e) => {
                    if bound {
                        unbind();
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        *state = State::Initialized(Box::new(Session {
            database: Database::default(),
            dispatcher,
            collector,
            autocollect,
            bound,
        }));
        info!(
            "Tracing initialized: {} buffers of {} bytes, flags {:?}",
            options.buffer_count, options.buffer_size, options.flags
        );
        Ok(())
    }

    /// Ends the session. Every pending buffer, including the current buffer
    /// of each traced thread, is delivered to the consumer before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if no session is running, `InCallback` when
    /// called from a callback, or `StillPatched` while patches are active.
    pub fn uninitialize(&self) -> Result<()> {
        let session = {
            let mut state = self.state.lock();
            let State::Initialized(session) = &*state else {
                return Err(not_initialized());
            };
            if session.dispatcher.in_callback() {
                return Err(Error::new(Kind::InCallback));
            }
            if !session.database.is_empty() {
                return Err(Error::new(Kind::StillPatched)
                    .with_detail(format!("{} procedure(s)", session.database.len())));
            }

            match std::mem::replace(&mut *state, State::ShuttingDown) {
                State::Initialized(session) => session,
                _ => return Err(not_initialized()),
            }
        };

        if let Some(collector) = session.collector {
            collector.stop();
        }
        let flushed = session.dispatcher.flush();
        if session.bound {
            unbind();
        }
        debug!("Delivered {flushed} buffer(s) at shutdown");

        *self.state.lock() = State::Uninitialized;
        info!("Tracing uninitialized");
        Ok(())
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        match &mut *self.state.lock() {
            State::Initialized(session) => f(session),
            _ => Err(not_initialized()),
        }
    }

    /// Patches or unpatches `procedures` as one all-or-nothing batch.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` or `InvalidArgument` for an empty batch;
    /// otherwise the first failure of the batch, carrying the offending
    /// procedure when there is one. The batch has no effect on error.
    pub fn instrument(&self, action: Action, procedures: &[Procedure]) -> Result<()> {
        if procedures.is_empty() {
            return Err(Error::new(Kind::InvalidArgument).with_detail("empty batch"));
        }

        self.with_session(|session| {
            let result = match action {
                Action::Add => patch::add(&self.platform, &mut session.database, procedures),
                Action::Remove => {
                    patch::remove(&self.platform, &mut session.database, procedures)
                }
            };

            match &result {
                Ok(()) => info!(
                    "{action:?}: {} procedure(s), {} patched",
                    procedures.len(),
                    session.database.len()
                ),
                Err(e) => warn!("{action:?} failed: {e}"),
            }
            result
        })
    }

    /// Removes every active patch in one batch. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, or the error of the remove batch.
    pub fn remove_all(&self) -> Result<usize> {
        self.with_session(|session| {
            let procedures = session.database.procedures();
            if procedures.is_empty() {
                return Ok(0);
            }
            patch::remove(&self.platform, &mut session.database, &procedures)?;
            info!("Removed all {} patch(es)", procedures.len());
            Ok(procedures.len())
        })
    }

    /// Whether `procedure` could be patched, without patching it.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the platform cannot inspect the procedure.
    pub fn check_instrumentability(&self, procedure: Procedure) -> Result<bool> {
        let _database = self.state.lock();
        patch::is_instrumentable(&self.platform, procedure)
    }

    /// The active patch of `procedure`, if any.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if no session is running.
    pub fn lookup(&self, procedure: Procedure) -> Result<Option<CodePatch>> {
        self.with_session(|session| Ok(session.database.lookup(procedure).cloned()))
    }

    /// Delivers one dirty buffer to `callback`, waiting up to `timeout` for
    /// one. A zero timeout never blocks.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, `WrongCollectionMode` under
    /// `Flags::AUTOCOLLECT`, or `Timeout` if no buffer was available.
    pub fn process_buffers(
        &self,
        timeout: Duration,
        callback: impl FnOnce(&Chunk<'_>),
    ) -> Result<()> {
        let pool = self.with_session(|session| {
            if session.autocollect {
                return Err(Error::new(Kind::WrongCollectionMode));
            }
            Ok(Arc::clone(session.dispatcher.pool()))
        })?;

        let buffer = pool
            .pull(timeout)
            .ok_or_else(|| Error::new(Kind::Timeout))?;
        pool.consume(buffer, callback);
        Ok(())
    }

    /// Destroys the calling thread's tracing state. Its current buffer is
    /// handed to the dirty list.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized`, or `InCallback` when called from one of the
    /// thread's callbacks.
    pub fn notify_thread_exit(&self) -> Result<()> {
        self.dispatcher()?.release_current_thread()
    }

    /// # Errors
    ///
    /// Returns `NotInitialized` if no session is running.
    pub fn statistics(&self) -> Result<Statistics> {
        self.with_session(|session| {
            Ok(session.dispatcher.statistics(session.database.len()))
        })
    }

    /// Dispatch core of the running session.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if no session is running.
    pub fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        self.with_session(|session| Ok(Arc::clone(&session.dispatcher)))
    }
}

impl<P: Platform> Drop for Engine<P> {
    fn drop(&mut self) {
        if !self.is_initialized() {
            return;
        }
        if let Err(e) = self.remove_all().and_then(|_| self.uninitialize()) {
            warn!("Failed to shut tracing down: {e}");
        }
    }
}
