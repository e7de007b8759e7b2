use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, error, trace};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{buffer::Consumer, diag::Result, pool::Pool};

/// Background drain of the dirty list in auto-collect mode.
pub struct Collector {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Collector {
    /// Starts the drain loop. It runs whenever a token arrives on `wake`,
    /// and at least every `interval`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the thread cannot be spawned.
    pub fn spawn(
        pool: Arc<Pool>,
        consumer: Arc<Consumer>,
        wake: Receiver<()>,
        interval: Duration,
    ) -> Result<Self> {
        let (stop, stopped) = bounded(1);
        let handle = thread::Builder::new()
            .name("fbt-collector".to_string())
            .spawn(move || run(&pool, &*consumer, &wake, &stopped, interval))?;

        Ok(Self { stop, handle })
    }

    /// Stops the loop after a last drain and waits for it.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            error!("Collector thread panicked");
        }
    }
}

fn run(
    pool: &Pool,
    consumer: &Consumer,
    wake: &Receiver<()>,
    stopped: &Receiver<()>,
    interval: Duration,
) {
    debug!("Collector started");
    loop {
        select! {
            recv(stopped) -> _ => break,
            recv(wake) -> _ => {}
            default(interval) => {}
        }

        let count = pool.collect_all(consumer);
        if count > 0 {
            trace!("Collected {count} buffer(s)");
        }
    }

    let count = pool.collect_all(consumer);
    debug!("Collector stopped after a final drain of {count} buffer(s)");
}
