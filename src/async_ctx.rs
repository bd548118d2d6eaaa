//! Async context (C3, `spec.md` §4.3): a thin owning wrapper around a
//! [`Media`] completion queue. The completion model is single-threaded
//! cooperative — there is no reaper thread; whichever thread owns the
//! context calls [`AsyncContext::poke`] (or [`AsyncContext::wait`]) to
//! advance completions, the same model the legacy "xapp" reaper-thread
//! variant is explicitly rejected in favor of (`spec.md` §9, Open
//! Question 2).
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::MediaError;
use crate::media::{AsyncCtxId, Completion, CompletionToken, MCmdRequest, Media};

/// Suspension granularity for cooperative poke loops (`spec.md` §5:
/// "poke loops (usleep(1))").
const POKE_IDLE_SLEEP: Duration = Duration::from_micros(1);

pub struct AsyncContext {
    id: AsyncCtxId,
    media: Arc<dyn Media>,
    running: AtomicBool,
}

impl AsyncContext {
    pub fn new(media: Arc<dyn Media>, depth: usize) -> Result<Self, MediaError> {
        let id = media.init_context(depth)?;
        Ok(Self {
            id,
            media,
            running: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> AsyncCtxId {
        self.id
    }

    pub fn submit_io(&self, req: MCmdRequest) -> Result<CompletionToken, MediaError> {
        self.media.submit_io(self.id, req)
    }

    /// Drain up to `max` completions, invoking `handler` once per
    /// completion. Returns the number drained.
    pub fn poke_with<F: FnMut(Completion)>(&self, max: usize, mut handler: F) -> usize {
        let batch = self.media.poke(self.id, max);
        let n = batch.len();
        for completion in batch {
            handler(completion);
        }
        n
    }

    pub fn outstanding(&self) -> usize {
        self.media.outstanding(self.id)
    }

    /// Cooperatively poke until `done` reports completion or the
    /// context is stopped, dispatching each drained completion to
    /// `handler` (`spec.md` §9: "expose a wait() that cooperatively
    /// pokes the context").
    pub fn wait<FHandle, FDone>(&self, burst: usize, mut handler: FHandle, done: FDone)
    where
        FHandle: FnMut(Completion),
        FDone: Fn() -> bool,
    {
        while !done() && self.is_running() {
            let drained = self.poke_with(burst, &mut handler);
            if drained == 0 {
                std::thread::sleep(POKE_IDLE_SLEEP);
            }
        }
    }

    /// Request cooperative shutdown: workers observing `is_running`
    /// stop dequeuing new work but must still drain what is in flight.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for AsyncContext {
    fn drop(&mut self) {
        let _ = self.media.term_context(self.id);
    }
}
