use crate::errors::ExecutorError;
use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, fmt, sync::Arc};

type CancelHook = Box<dyn FnOnce() + Send>;

enum Slot<T> {
    Pending,
    Running,
    Done(Result<T, ExecutorError>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    on_cancel: Mutex<Option<CancelHook>>,
}

/// Asynchronous reference to the result of a single unit of work
///
/// A handle starts out pending, is marked running once its work was handed to a backend and
/// is resolved exactly once. Only pending handles can be cancelled without side effects,
/// running ones forward the cancellation to their backend through a hook.
pub struct Handle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Handle<T> {
    pub(crate) fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending),
                ready: Condvar::new(),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// create an already resolved handle
    pub fn resolved(value: T) -> Self {
        let handle = Self::pending();
        handle.resolve(Ok(value));
        handle
    }

    pub fn failed(error: ExecutorError) -> Self {
        let handle = Self::pending();
        handle.resolve(Err(error));
        handle
    }

    /// second reference to the same slot, used by executors to resolve the handle later on
    pub(crate) fn share(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// mark the handle as running, returns false if it was cancelled (or resolved) before
    pub(crate) fn start(&self) -> bool {
        let mut slot = self.shared.slot.lock();

        match *slot {
            Slot::Pending => {
                *slot = Slot::Running;
                true
            }
            _ => false,
        }
    }

    /// store the result, later calls are ignored
    pub(crate) fn resolve(&self, result: Result<T, ExecutorError>) -> bool {
        let mut slot = self.shared.slot.lock();

        match *slot {
            Slot::Pending | Slot::Running => {
                *slot = Slot::Done(result);
                self.shared.ready.notify_all();
                true
            }
            Slot::Done(_) | Slot::Taken => false,
        }
    }

    pub(crate) fn set_cancel_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.shared.on_cancel.lock() = Some(Box::new(hook));
    }

    /// Cancel the work behind the handle
    ///
    /// Returns true if the work was prevented from starting. For running work the backend
    /// hook (if any) is triggered and the handle resolves once the backend notices.
    pub fn cancel(&self) -> bool {
        {
            let mut slot = self.shared.slot.lock();

            match *slot {
                Slot::Pending => {
                    *slot = Slot::Done(Err(ExecutorError::Cancelled));
                    self.shared.ready.notify_all();

                    return true;
                }
                Slot::Running => {}
                Slot::Done(_) | Slot::Taken => return false,
            }
        }

        // the hook may block on a cluster command, never run it under the slot lock
        let hook = self.shared.on_cancel.lock().take();

        if let Some(hook) = hook {
            hook();
        }

        false
    }

    /// cancel only if the work has not been handed to a backend yet
    pub fn cancel_pending(&self) -> bool {
        let mut slot = self.shared.slot.lock();

        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Done(Err(ExecutorError::Cancelled));
            self.shared.ready.notify_all();
            true
        } else {
            false
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Done(_) | Slot::Taken)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Running)
    }

    /// block until the handle is resolved and take its value
    pub fn wait(self) -> Result<T, ExecutorError> {
        let mut slot = self.shared.slot.lock();

        while matches!(*slot, Slot::Pending | Slot::Running) {
            self.shared.ready.wait(&mut slot);
        }

        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Done(result) => result,
            // only the caller facing handle ever waits, shared copies just resolve
            _ => Err(ExecutorError::Cancelled),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.shared.slot.lock() {
            Slot::Pending => "pending",
            Slot::Running => "running",
            Slot::Done(Ok(_)) => "done",
            Slot::Done(Err(_)) => "failed",
            Slot::Taken => "taken",
        };

        f.debug_struct("Handle").field("state", &state).finish()
    }
}

/// Lazy, ordered sequence of results returned by `map`
///
/// Iterating blocks on each handle in submission order. The first error cancels everything
/// that has not started yet and ends the sequence after yielding the error.
#[derive(Debug)]
pub struct MapResults<T> {
    pending: VecDeque<Handle<T>>,
}

impl<T> MapResults<T> {
    pub(crate) fn new(handles: Vec<Handle<T>>) -> Self {
        Self {
            pending: handles.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn cancel_remaining(&mut self) {
        for handle in self.pending.drain(..) {
            handle.cancel_pending();
        }
    }

    /// Wait for every unit, including the ones still running after a failure
    ///
    /// Units that have not started are cancelled once the first error shows up, that error
    /// is returned after everything else has settled.
    pub fn wait_all(mut self) -> Result<Vec<T>, ExecutorError> {
        let mut values = Vec::with_capacity(self.pending.len());
        let mut first_error = None;

        while let Some(handle) = self.pending.pop_front() {
            match handle.wait() {
                Ok(value) => values.push(value),
                Err(error) if first_error.is_none() => {
                    for handle in &self.pending {
                        handle.cancel_pending();
                    }
                    first_error = Some(error);
                }
                Err(_) => {}
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(values),
        }
    }
}

impl<T> Iterator for MapResults<T> {
    type Item = Result<T, ExecutorError>;

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.pending.pop_front()?;
        let result = handle.wait();

        if result.is_err() {
            self.cancel_remaining();
        }

        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pending.len(), Some(self.pending.len()))
    }
}
