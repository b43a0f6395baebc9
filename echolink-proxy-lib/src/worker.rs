//! A generic worker primitive: an async state machine driven by a
//! `tokio::sync::Notify`, reused for the client worker, the three
//! per-slot forwarders, and the registration reporter. Each worker
//! parks until woken with a payload, runs a body future to completion,
//! then returns to idle, the same shape a thread-and-condvar design
//! would have, built on tasks instead of blocking threads.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{ProxyError, Result};

/// Boxed future type every worker body must return. Named so call
/// sites can annotate their closures' return type explicitly and let
/// the compiler perform the `Box<ConcreteFuture> -> Box<dyn Future>`
/// unsize coercion at the `async { .. }` expression itself.
pub type BodyFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Stopped = 0,
    Idle = 1,
    Signaled = 2,
    Busy = 3,
    StoppingAfterWork = 4,
    Stopping = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Stopped,
            1 => State::Idle,
            2 => State::Signaled,
            3 => State::Busy,
            4 => State::StoppingAfterWork,
            _ => State::Stopping,
        }
    }
}

struct Shared<T> {
    state: AtomicU8,
    notify: Notify,
    handoff: Mutex<Option<T>>,
}

impl<T> Shared<T> {
    fn load(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn store(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }
}

/// A live worker: an async task plus the shared handle used to drive
/// it. `T` is the handoff payload type carried by `wake`.
pub struct Worker<T> {
    shared: Arc<Shared<T>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawns a worker whose body runs once per `wake`. `body` receives
    /// the handoff value (`None` for a timer-driven wake or a worker
    /// with no payload) and must resolve before the worker returns to
    /// `Idle`.
    ///
    /// `periodic`, when set, makes an idle wait that exceeds this
    /// duration run the worker once as if signaled; used only by the
    /// registration reporter.
    pub fn spawn<F>(mut body: F, periodic: Option<Duration>) -> Worker<T>
    where
        F: FnMut(Option<T>) -> BodyFuture + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(State::Idle as u8),
            notify: Notify::new(),
            handoff: Mutex::new(None),
        });
        let worker_shared = shared.clone();

        let task = tokio::spawn(async move {
            loop {
                // Wait until there's work to do or a stop was requested.
                // `notified()` must be created before the state check so a
                // transition that lands between the check and the await is
                // never missed (the tokio::sync::Notify safe-wait pattern).
                loop {
                    let notified = worker_shared.notify.notified();
                    tokio::pin!(notified);
                    match worker_shared.load() {
                        State::Signaled | State::Stopping | State::StoppingAfterWork => break,
                        _ => {}
                    }
                    match periodic {
                        Some(interval) => {
                            tokio::select! {
                                _ = &mut notified => {}
                                _ = tokio::time::sleep(interval) => {
                                    let _ = worker_shared.state.compare_exchange(
                                        State::Idle as u8,
                                        State::Signaled as u8,
                                        Ordering::AcqRel,
                                        Ordering::Acquire,
                                    );
                                }
                            }
                        }
                        None => notified.await,
                    }
                }

                match worker_shared.load() {
                    State::Stopping => {
                        worker_shared.store(State::Stopped);
                        worker_shared.notify.notify_waiters();
                        break;
                    }
                    _ => {}
                }

                worker_shared.store(State::Busy);
                let input = worker_shared.handoff.lock().await.take();
                body(input).await;

                let was_stopping =
                    worker_shared.load() == State::StoppingAfterWork;
                if was_stopping {
                    worker_shared.store(State::Stopped);
                    worker_shared.notify.notify_waiters();
                    break;
                }
                worker_shared.store(State::Idle);
                worker_shared.notify.notify_waiters();
            }
        });

        Worker { shared, task: Some(task) }
    }

    /// Idle → Signaled: stores `payload` for the next run and wakes the
    /// task. No-op (but not an error) if the worker is already
    /// `Busy`/`Signaled`; rejected with `ProxyError::Busy` if the
    /// worker is stopping.
    pub async fn wake(&self, payload: T) -> Result<()> {
        match self.shared.load() {
            State::Stopping | State::StoppingAfterWork | State::Stopped => {
                return Err(ProxyError::Busy);
            }
            State::Busy | State::Signaled => return Ok(()),
            State::Idle => {}
        }
        *self.shared.handoff.lock().await = Some(payload);
        self.shared.store(State::Signaled);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Blocks until the worker reaches `Idle`. Returns an error if the
    /// worker has stopped.
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            match self.shared.load() {
                State::Idle => return Ok(()),
                State::Stopped => return Err(ProxyError::Busy),
                _ => notified.await,
            }
        }
    }

    /// Non-blocking idleness check.
    pub fn is_idle(&self) -> bool {
        self.shared.load() == State::Idle
    }

    /// Requests the worker stop. If it's mid-run, waits for the
    /// current run to finish (`StoppingAfterWork`) before joining the
    /// task. Idempotent: safe to call more than once, including after
    /// a prior `join`.
    pub async fn join(&mut self) {
        loop {
            match self.shared.load() {
                State::Idle => {
                    self.shared.store(State::Stopping);
                    self.shared.notify.notify_waiters();
                    break;
                }
                State::Busy | State::Signaled => {
                    self.shared.store(State::StoppingAfterWork);
                    self.shared.notify.notify_waiters();
                    break;
                }
                State::Stopping | State::StoppingAfterWork | State::Stopped => break,
            }
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn wake_runs_body_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let body_counter = counter.clone();
        let worker: Worker<u32> = Worker::spawn(
            move |input| {
                let counter = body_counter.clone();
                Box::pin(async move {
                    if let Some(v) = input {
                        counter.fetch_add(v as usize, Ordering::SeqCst);
                    }
                })
            },
            None,
        );
        worker.wake(5).await.unwrap();
        worker.wait_idle().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        let mut worker = worker;
        worker.join().await;
    }

    #[tokio::test]
    async fn periodic_wake_fires_without_explicit_wake() {
        let counter = Arc::new(AtomicUsize::new(0));
        let body_counter = counter.clone();
        let mut worker: Worker<()> = Worker::spawn(
            move |_| {
                let counter = body_counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            },
            Some(Duration::from_millis(20)),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        worker.join().await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }
}
