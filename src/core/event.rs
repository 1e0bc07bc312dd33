use parking_lot::{Condvar, Mutex};

/// An auto-reset event. `wait` blocks until another thread calls `set`, then
/// consumes the signal. The flush engine uses one of these to serialize the
/// object-log batches of a single page, since each batch extends serializer
/// state the next batch depends on.
#[derive(Default)]
pub struct AutoResetEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, waking exactly one waiter.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Blocks until the event is signaled, consuming the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }
}
