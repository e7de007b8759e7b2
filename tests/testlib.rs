#![allow(dead_code)]

use ctor::ctor;
use parking_lot::Mutex;
use std::sync::Arc;

use fbt_rs::{
    buffer::Chunk,
    config::{Flags, Options},
    engine::Engine,
    platform::mock::Simulated,
    procedure::Procedure,
    thunk::{Context, Dispatcher, Event, Handler, UnwindReason},
};

#[ctor]
fn init() {
    let _ = pretty_env_logger::try_init();
}

/// Handler logging every event and writing `record_size` bytes per entry.
#[derive(Default)]
pub struct Recorder {
    pub record_size: usize,
    pub log: Mutex<Vec<String>>,
    pub dropped: Mutex<usize>,
}

impl Recorder {
    pub fn new(record_size: usize) -> Arc<Self> {
        Arc::new(Self {
            record_size,
            ..Self::default()
        })
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn dropped(&self) -> usize {
        *self.dropped.lock()
    }

    pub fn handler(self: &Arc<Self>) -> Recording {
        Recording(Arc::clone(self))
    }
}

/// Handler half of a shared `Recorder`.
pub struct Recording(Arc<Recorder>);

impl Handler for Recording {
    fn on_entry(&self, event: &mut Event<'_>) {
        let procedure = event.procedure();
        if self.0.record_size > 0 {
            match event.buffer(self.0.record_size) {
                Some(buffer) => buffer.fill(0x5a),
                None => *self.0.dropped.lock() += 1,
            }
        }
        self.0.log.lock().push(format!("> {procedure}"));
    }

    fn on_exit(&self, event: &mut Event<'_>) {
        let procedure = event.procedure();
        self.0.log.lock().push(format!("< {procedure}"));
    }

    fn on_unwind(&self, event: &mut Event<'_>, reason: UnwindReason) {
        let procedure = event.procedure();
        self.0.log.lock().push(format!("! {procedure} {reason:?}"));
    }
}

/// Consumer keeping a copy of every delivered buffer.
#[derive(Clone, Default)]
pub struct Sink(Arc<Mutex<Vec<Vec<u8>>>>);

impl Sink {
    pub fn consumer(&self) -> impl Fn(&Chunk<'_>) + Send + Sync + 'static {
        let chunks = Arc::clone(&self.0);
        move |chunk: &Chunk<'_>| chunks.lock().push(chunk.data().to_vec())
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

pub fn simulated_engine(procedures: &[usize]) -> (Engine<Simulated>, Vec<Procedure>) {
    let platform = Simulated::new();
    let procedures = procedures
        .iter()
        .map(|&addr| platform.add_procedure(addr))
        .collect();
    (Engine::new(platform), procedures)
}

pub fn options(buffer_count: u32, buffer_size: u32, flags: Flags) -> Options {
    Options::new(buffer_count, buffer_size, flags)
}

/// Drives one complete call of `procedure` through the dispatcher, as the
/// thunks would. Returns the address the exit thunk would resume at.
pub fn call(dispatcher: &Dispatcher, procedure: Procedure, return_address: usize) -> usize {
    let mut slot = return_address;
    let mut context = Context::new(procedure, &mut slot);
    // SAFETY: `slot` outlives both calls and plays the caller's return slot.
    unsafe {
        dispatcher.enter(&mut context);
        dispatcher.leave(&mut context)
    }
}
