//! Background spill thread.
//!
//! Full blocks are handed over a zero-capacity channel, so the producer blocks
//! until the worker has finished the previous block and is ready for the
//! next one. After writing a block the worker returns the emptied buffer on a
//! one-slot recycle channel for the producer to reuse.

use crate::error::{Error, Result};
use crate::sort::{SortBlock, SortCodec};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum SpillMsg<B> {
    Spill { block: B, path: PathBuf },
    Done,
}

/// Handle to the thread that sorts and persists spilled blocks.
pub(crate) struct SpillWorker<B> {
    name: String,
    tx: Sender<SpillMsg<B>>,
    recycled: Receiver<B>,
    errors: Arc<Mutex<Vec<Error>>>,
    handle: Option<JoinHandle<()>>,
}

impl<B: SortBlock> SpillWorker<B> {
    /// Start the worker thread for `codec`.
    pub(crate) fn spawn<C>(name: &str, codec: Arc<C>) -> Result<Self>
    where
        C: SortCodec<Block = B>,
    {
        let (tx, rx) = channel::bounded::<SpillMsg<B>>(0);
        let (recycle_tx, recycled) = channel::bounded::<B>(1);
        let errors = Arc::new(Mutex::new(Vec::new()));

        let worker_errors = Arc::clone(&errors);
        let thread_name = format!("{}-spill", name);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(codec, rx, recycle_tx, worker_errors))?;

        Ok(Self { name: name.to_string(), tx, recycled, errors, handle: Some(handle) })
    }

    /// Hand a full block to the worker; blocks while the previous one is in flight.
    ///
    /// Failures captured since the last call are raised here.
    pub(crate) fn submit(&self, block: B, path: PathBuf) -> Result<()> {
        self.check()?;
        self.tx
            .send(SpillMsg::Spill { block, path })
            .map_err(|_| Error::invalid_state(format!("{} spill worker is gone", self.name)))
    }

    /// An emptied block returned by the worker, if one is waiting.
    pub(crate) fn take_recycled(&self) -> Option<B> {
        self.recycled.try_recv().ok()
    }

    /// Raise any failures captured so far.
    pub(crate) fn check(&self) -> Result<()> {
        let errors = std::mem::take(&mut *self.errors.lock());
        match Error::condense(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait for the in-flight block, stop the thread and raise captured failures.
    pub(crate) fn finish(mut self) -> Result<()> {
        self.stop()?;
        self.check()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // A send error means the thread already exited; join reports why.
        let _ = self.tx.send(SpillMsg::Done);
        handle
            .join()
            .map_err(|_| Error::invalid_state(format!("{} spill worker panicked", self.name)))
    }
}

impl<B> Drop for SpillWorker<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(SpillMsg::Done);
            if handle.join().is_err() {
                log::warn!("{} spill worker panicked during shutdown", self.name);
            }
        }
    }
}

fn run<C: SortCodec>(
    codec: Arc<C>,
    rx: Receiver<SpillMsg<C::Block>>,
    recycle: Sender<C::Block>,
    errors: Arc<Mutex<Vec<Error>>>,
) {
    for msg in rx.iter() {
        match msg {
            SpillMsg::Spill { mut block, path } => {
                let items = block.len();
                match codec.write_run(&mut block, &path) {
                    Ok(()) => log::debug!("Spilled {} items to {:?}", items, path),
                    Err(e) => {
                        log::error!("Spill to {:?} failed: {}", path, e);
                        errors.lock().push(e);
                    }
                }
                block.clear();
                let _ = recycle.try_send(block);
            }
            SpillMsg::Done => break,
        }
    }
}
