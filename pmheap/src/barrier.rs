use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct State {
    active: usize,
    done: bool,
}

/// Termination detection for a group of workers sharing a work queue.
///
/// Every worker starts active. A worker that runs dry calls
/// [`Quiescence::idle`] and sleeps until either work shows up or every
/// worker is idle at once, which ends the round for all of them.
#[derive(Debug)]
pub struct Quiescence {
    state: Mutex<State>,
    cvar: Condvar,
}

impl Quiescence {
    pub fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(State {
                active: workers,
                done: false,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Parks the calling worker. Returns `true` when `has_work` reports new
    /// work (the caller is active again), `false` once all workers are idle.
    ///
    /// `has_work` runs with the internal lock held and must not call back
    /// into this primitive.
    pub fn idle(&self, has_work: impl Fn() -> bool) -> bool {
        let mut state = self.state.lock();
        state.active -= 1;
        loop {
            if state.done {
                return false;
            }
            if has_work() {
                state.active += 1;
                return true;
            }
            if state.active == 0 {
                // LAST
                state.done = true;
                self.cvar.notify_all();
                return false;
            }
            self.cvar.wait(&mut state);
        }
    }

    /// Wakes idle workers after new work was published.
    pub fn notify(&self) {
        // taking the lock orders the publish before any sleeper's check
        let _state = self.state.lock();
        self.cvar.notify_all();
    }

    #[cfg(test)]
    fn is_done(&self) -> bool {
        self.state.lock().done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    #[test]
    fn single_worker_terminates_immediately() {
        let q = Quiescence::new(1);
        assert!(!q.idle(|| false));
        assert!(q.is_done());
    }

    #[test]
    fn workers_drain_shared_counter() {
        const WORKERS: usize = 4;
        let queue = Mutex::new((0..1000u64).collect::<Vec<_>>());
        let processed = AtomicUsize::new(0);
        let q = Quiescence::new(WORKERS);

        thread::scope(|s| {
            for _ in 0..WORKERS {
                s.spawn(|| {
                    loop {
                        let item = queue.lock().pop();
                        match item {
                            Some(n) => {
                                // every even item produces one more unit
                                if n % 2 == 0 && n < 1000 {
                                    queue.lock().push(n + 1001);
                                    q.notify();
                                }
                                processed.fetch_add(1, Ordering::Relaxed);
                            }
                            None => {
                                if !q.idle(|| !queue.lock().is_empty()) {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        assert!(q.is_done());
        assert_eq!(processed.load(Ordering::Relaxed), 1500);
    }
}
