use log::{info, warn};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use fbt_rs::{
    buffer::Chunk,
    config::Options,
    diag::{Kind, Result},
    engine::{Action, Engine},
    jit::Samples,
    platform::linux::Native,
    thunk::{self, Event, Handler, UnwindReason},
};

const ENTRY: u64 = 1;
const EXIT: u64 = 2;
const UNWIND: u64 = 3;
const RECORD_SIZE: usize = 16;

struct Recorder;

fn record(event: &mut Event<'_>, tag: u64) {
    let procedure = event.procedure().address() as u64;
    if let Some(buffer) = event.buffer(RECORD_SIZE) {
        buffer[..8].copy_from_slice(&tag.to_le_bytes());
        buffer[8..].copy_from_slice(&procedure.to_le_bytes());
    }
}

impl Handler for Recorder {
    fn on_entry(&self, event: &mut Event<'_>) {
        record(event, ENTRY);
    }

    fn on_exit(&self, event: &mut Event<'_>) {
        record(event, EXIT);
    }

    fn on_unwind(&self, event: &mut Event<'_>, _reason: UnwindReason) {
        record(event, UNWIND);
    }
}

#[derive(Default)]
struct Tally(Mutex<BTreeMap<u64, [u64; 3]>>);

impl Tally {
    fn add(&self, chunk: &Chunk<'_>) {
        let mut counts = self.0.lock();
        for record in chunk.data().chunks_exact(RECORD_SIZE) {
            let mut word = [0u8; 8];
            word.copy_from_slice(&record[..8]);
            let tag = u64::from_le_bytes(word);
            word.copy_from_slice(&record[8..]);
            let procedure = u64::from_le_bytes(word);

            let entry = counts.entry(procedure).or_default();
            match tag {
                ENTRY => entry[0] += 1,
                EXIT => entry[1] += 1,
                UNWIND => entry[2] += 1,
                _ => warn!("Unknown record tag {tag}"),
            }
        }
    }

    fn print(&self) {
        for (procedure, [entries, exits, unwinds]) in self.0.lock().iter() {
            println!("{procedure:#x}: {entries} entries, {exits} exits, {unwinds} unwinds");
        }
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let options = Options::from_env()?;
    // SAFETY: only routines of `samples` below are ever patched.
    let engine = Engine::new(unsafe { Native::new()? });
    let tally = Arc::new(Tally::default());
    {
        let tally = Arc::clone(&tally);
        engine.initialize(&options, Recorder, move |chunk: &Chunk<'_>| tally.add(chunk))?;
    }

    let samples = Samples::assemble(thunk::entry_thunk())?;
    let mut procedures = Vec::new();
    for procedure in samples.procedures() {
        if engine.check_instrumentability(procedure)? {
            procedures.push(procedure);
        } else {
            warn!("Skipping {procedure}");
        }
    }
    engine.instrument(Action::Add, &procedures)?;
    info!("Instrumented {} procedure(s)", procedures.len());

    let recurse = samples.recurse_fn();
    println!("add(2, 40) = {}", samples.add(2, 40));
    println!("recurse(5) = {}", samples.recurse(5));
    println!("call_twice(recurse, 3) = {}", samples.call_twice(recurse, 3));
    println!("tail_call(recurse, 4) = {}", samples.tail_call(recurse, 4));

    engine.remove_all()?;
    let statistics = engine.statistics()?;

    if !options.autocollect() {
        loop {
            match engine.process_buffers(Duration::ZERO, |chunk| tally.add(chunk)) {
                Ok(()) => {}
                Err(e) if e.kind() == Kind::Timeout => break,
                Err(e) => return Err(e),
            }
        }
    }
    engine.uninitialize()?;

    tally.print();
    match serde_json::to_string_pretty(&statistics) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("Failed to serialize statistics: {e}"),
    }

    Ok(())
}
