use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::table::DataTable;

pub type SharedEngine = Arc<Mutex<Engine>>;

/// An ordered set of engines driven together by the update task.
///
/// The pool owns the `data_remaining` flag set by `send` and cleared by a
/// completed run, the monotonically increasing epoch observers use to detect
/// staleness, and the user-space notification hook fired when any engine's
/// batch carried new values.
pub struct Pool {
    engines: Mutex<Vec<SharedEngine>>,
    data_remaining: AtomicBool,
    epoch: AtomicU64,
    update_delegate: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl Pool {
    pub fn new() -> Self {
        Pool {
            engines: Mutex::new(Vec::new()),
            data_remaining: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            update_delegate: Mutex::new(None),
        }
    }

    /// Initialize `engine`, assign it the next pool id and take ownership.
    pub fn register_engine(&self, mut engine: Engine) -> Result<SharedEngine> {
        engine.init()?;
        let mut engines = self.engines.lock();
        engine.set_id(engines.len());
        let shared = Arc::new(Mutex::new(engine));
        engines.push(Arc::clone(&shared));
        Ok(shared)
    }

    pub fn engines(&self) -> Vec<SharedEngine> {
        self.engines.lock().clone()
    }

    fn engine(&self, engine_id: usize) -> Result<SharedEngine> {
        self.engines
            .lock()
            .get(engine_id)
            .cloned()
            .ok_or(EngineError::UnknownEngine(engine_id))
    }

    /// Queue a batch on an engine's input port and flag work for the next
    /// update-task run.
    pub fn send(&self, engine_id: usize, batch: &DataTable) -> Result<()> {
        self.engine(engine_id)?.lock().send(batch)?;
        self.data_remaining.store(true, Ordering::Release);
        Ok(())
    }

    pub fn has_data_remaining(&self) -> bool {
        self.data_remaining.load(Ordering::Acquire)
    }

    /// Install the hook invoked when a processed batch carried new values.
    pub fn set_update_delegate(&self, delegate: impl Fn() + Send + 'static) {
        *self.update_delegate.lock() = Some(Box::new(delegate));
    }

    pub fn clear_update_delegate(&self) {
        *self.update_delegate.lock() = None;
    }

    pub fn notify_userspace(&self) {
        if let Some(delegate) = &*self.update_delegate.lock() {
            delegate();
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn inc_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether any engine found work during the last run.
    pub fn was_updated(&self) -> bool {
        self.engines.lock().iter().any(|e| e.lock().was_updated())
    }

    /// Names of contexts with pending deltas, across all engines.
    pub fn contexts_last_updated(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for engine in self.engines.lock().iter() {
            names.extend(engine.lock().contexts_last_updated()?);
        }
        Ok(names)
    }

    /// Convenience wrapper around [`UpdateTask::run`].
    pub fn process_all(&self) -> Result<bool> {
        UpdateTask::new(self).run()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}

/// The single entry point driving end-to-end processing of all pending input
/// across the pool's engines.
pub struct UpdateTask<'a> {
    pool: &'a Pool,
}

impl<'a> UpdateTask<'a> {
    pub fn new(pool: &'a Pool) -> Self {
        UpdateTask { pool }
    }

    /// Process every engine in pool order, latch the OR of their
    /// should-notify bits, clear output ports, fire the user-space hook when
    /// warranted and bump the epoch. Returns early with no side effects when
    /// no data is pending.
    pub fn run(&self) -> Result<bool> {
        if !self.pool.has_data_remaining() {
            return Ok(false);
        }
        self.pool.data_remaining.store(true, Ordering::Release);

        let engines = self.pool.engines();
        let mut should_notify = false;
        let mut outcome: Result<()> = Ok(());
        for engine in &engines {
            match engine.lock().process_batch() {
                Ok(notify) => {
                    // Once true, later no-op batches cannot clear it.
                    if !should_notify {
                        should_notify = notify;
                    }
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        for engine in &engines {
            let _ = engine.lock().clear_output_ports();
        }
        self.pool.data_remaining.store(false, Ordering::Release);
        outcome?;

        if should_notify {
            log::debug!("notifying userspace");
            self.pool.notify_userspace();
        } else {
            log::debug!("update was a no-op, not notifying userspace");
        }
        self.pool.inc_epoch();
        Ok(should_notify)
    }
}
