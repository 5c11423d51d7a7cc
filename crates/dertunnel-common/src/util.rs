use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Random lowercase hex string of `len` characters
pub fn random_id(len: usize) -> String {
    let mut id = String::with_capacity(len);
    while id.len() < len {
        id.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    id.truncate(len);
    id
}

/// Sleep until `deadline`, or forever when there is none
///
/// Handy as a `select!` branch for optional timers.
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct ThrottleState {
    last_fired: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

/// Rate-limited callback invoker
///
/// Calls `func` at most once per `interval`. Updates arriving faster are
/// coalesced so that only the latest value is delivered when the interval
/// expires. Forced updates are delivered immediately.
pub struct Throttled<T> {
    interval: Duration,
    func: Arc<dyn Fn(T) + Send + Sync>,
    state: Arc<Mutex<ThrottleState>>,
}

impl<T: Send + 'static> Throttled<T> {
    pub fn new(interval: Duration, func: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            interval,
            func: Arc::new(func),
            state: Arc::new(Mutex::new(ThrottleState {
                last_fired: None,
                pending: None,
            })),
        }
    }

    /// Must be called from within a tokio runtime
    pub fn update(&self, value: T, force: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();

        let due = match state.last_fired {
            Some(last) if !force => {
                let next = last + self.interval;
                (now >= next).then_some(now).ok_or(next)
            }
            _ => Ok(now),
        };

        if let Some(pending) = state.pending.take() {
            pending.abort();
        }

        match due {
            Ok(now) => {
                state.last_fired = Some(now);
                drop(state);
                (self.func)(value);
            }
            Err(at) => {
                let func = self.func.clone();
                let shared = self.state.clone();
                state.pending = Some(tokio::spawn(async move {
                    tokio::time::sleep_until(at).await;
                    {
                        let mut state = shared.lock();
                        state.last_fired = Some(Instant::now());
                        state.pending = None;
                    }
                    func(value);
                }));
            }
        }
    }
}

impl<T> Drop for Throttled<T> {
    fn drop(&mut self) {
        if let Some(pending) = self.state.lock().pending.take() {
            pending.abort();
        }
    }
}

/// One-shot completion signal that any number of tasks can await
///
/// The first `resolve` or `reject` wins; later calls are ignored.
pub struct Deferred<T> {
    tx: Arc<watch::Sender<Option<Result<T, String>>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns false if the signal was already settled
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Returns false if the signal was already settled
    pub fn reject(&self, error: impl Into<String>) -> bool {
        self.settle(Err(error.into()))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    fn settle(&self, outcome: Result<T, String>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn wait(&self) -> impl Future<Output = Result<T, String>> + Send + 'static
    where
        T: Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        async move {
            let settled = rx.wait_for(|slot| slot.is_some()).await.map(|slot| slot.clone());
            match settled {
                Ok(Some(outcome)) => outcome,
                Ok(None) | Err(_) => Err("Signal dropped".to_string()),
            }
        }
    }
}
