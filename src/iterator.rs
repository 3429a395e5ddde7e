// src/iterator.rs

//! Pull-based consumption of pushed events.
//!
//! [`PubSubAsyncIterator`] turns the callback delivery of a [`PubSubEngine`]
//! into an async "give me the next value" contract. Two FIFOs meet in the
//! middle:
//!
//! - **values**: events that arrived while nobody was waiting
//! - **pulls**: `next()` calls waiting for an event that has not arrived
//!
//! At most one of them is non-empty at any quiescent moment.
//!
//! ```text
//!   engine ──push(event)──► [ pending pull? ] ──yes──► resolve oldest next()
//!                                   │
//!                                   no
//!                                   ▼
//!                             [values FIFO] ◄──pop── next()
//! ```
//!
//! ## Termination
//!
//! `close()`, `throw()`, and dropping the iterator all tear it down once:
//! listening stops, every subscription is released, waiting `next()` calls
//! resolve to `None` and both FIFOs are cleared. Later calls are no-ops.
//!
//! ## Backpressure
//!
//! There is none. The values FIFO is unbounded, so a producer faster than the
//! consumer grows memory without limit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::join_all;
use futures_util::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::{
    //
    log_debug,
    log_warn,
    Delivery,
    Listener,
    PubSubEngine,
    PubSubError,
    Result,
    SubscribeOptions,
    SubscriptionId,
};

/// Outcome of the initial subscriptions; `None` while they are in flight.
type Readiness = Option<std::result::Result<(), String>>;

struct State<T> {
    values: VecDeque<T>,
    pulls: VecDeque<oneshot::Sender<Option<T>>>,
    listening: bool,
    subscription_ids: Vec<SubscriptionId>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        // ---
        Self {
            state: Mutex::new(State {
                values: VecDeque::new(),
                pulls: VecDeque::new(),
                listening: true,
                subscription_ids: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, mut event: T) {
        // ---
        let mut state = self.lock();
        if !state.listening {
            return;
        }

        // Skip pulls whose caller gave up waiting.
        while let Some(pull) = state.pulls.pop_front() {
            match pull.send(Some(event)) {
                Ok(()) => return,
                Err(Some(returned)) => event = returned,
                Err(None) => return,
            }
        }

        state.values.push_back(event);
    }

    /// Stop listening. Returns the handles to release on the first call only.
    fn stop(&self) -> Option<Vec<SubscriptionId>> {
        // ---
        let mut state = self.lock();
        if !state.listening {
            return None;
        }

        state.listening = false;
        for pull in state.pulls.drain(..) {
            let _ = pull.send(None);
        }
        state.values.clear();

        Some(std::mem::take(&mut state.subscription_ids))
    }

    fn is_listening(&self) -> bool {
        self.lock().listening
    }
}

async fn unsubscribe_all(engine: &dyn PubSubEngine, ids: Vec<SubscriptionId>, queue_name: &str) {
    // ---
    for id in ids {
        if let Err(_err) = engine.unsubscribe(id, queue_name).await {
            log_warn!("iterator failed to unsubscribe id {id}: {_err}");
        }
    }
}

fn push_listener<T>(shared: Weak<Shared<T>>) -> Listener
where
    T: DeserializeOwned + Send + 'static,
{
    // ---
    Arc::new(move |content: &Value, _raw: &Delivery| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match T::deserialize(content) {
            Ok(event) => shared.push(event),
            Err(_err) => {
                log_warn!("iterator dropped an event that does not decode: {_err}");
            }
        }
    })
}

async fn subscribe_all<T>(
    engine: Arc<dyn PubSubEngine>,
    shared: Arc<Shared<T>>,
    triggers: Vec<String>,
    options: SubscribeOptions,
    ready: watch::Sender<Readiness>,
) where
    T: DeserializeOwned + Send + 'static,
{
    // ---
    let queue_name = options.queue_name().to_string();

    let attempts = join_all(triggers.iter().map(|trigger| {
        let listener = push_listener(Arc::downgrade(&shared));
        engine.subscribe_listener(trigger, listener, options.clone())
    }))
    .await;

    let mut ids = Vec::with_capacity(attempts.len());
    let mut failure = None;
    for attempt in attempts {
        match attempt {
            Ok(id) => ids.push(id),
            Err(err) => {
                failure.get_or_insert(err.to_string());
            }
        }
    }

    if let Some(reason) = failure {
        log_warn!("iterator over {triggers:?} failed to subscribe: {reason}");
        shared.stop();
        unsubscribe_all(engine.as_ref(), ids, &queue_name).await;
        ready.send_replace(Some(Err(reason)));
        return;
    }

    // Torn down while subscribing: release straight away.
    let leftover = {
        let mut state = shared.lock();
        if state.listening {
            state.subscription_ids = ids;
            None
        } else {
            Some(ids)
        }
    };
    if let Some(ids) = leftover {
        unsubscribe_all(engine.as_ref(), ids, &queue_name).await;
    }

    log_debug!("iterator subscribed to {triggers:?}");
    ready.send_replace(Some(Ok(())));
}

/// Async iterator over the events of one or more triggers.
///
/// Created by [`PubSub::async_iterator`](crate::PubSub::async_iterator) or
/// directly over any [`PubSubEngine`]. Construction must happen inside a Tokio
/// runtime: the initial subscriptions run on a spawned task.
///
/// Not restartable: once terminated, [`next`](Self::next) keeps returning
/// `Ok(None)`.
pub struct PubSubAsyncIterator<T> {
    shared: Arc<Shared<T>>,
    engine: Arc<dyn PubSubEngine>,
    queue_name: String,
    ready: watch::Receiver<Readiness>,
}

impl<T> PubSubAsyncIterator<T>
where
    T: DeserializeOwned + Send + 'static,
{
    // ---
    /// Start subscribing to every trigger and return immediately.
    pub fn new<I, S>(engine: Arc<dyn PubSubEngine>, triggers: I, options: SubscribeOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // ---
        let triggers: Vec<String> = triggers.into_iter().map(Into::into).collect();
        let shared = Arc::new(Shared::new());
        let (ready_tx, ready_rx) = watch::channel(None);
        let queue_name = options.queue_name().to_string();

        tokio::spawn(subscribe_all(
            Arc::clone(&engine),
            Arc::clone(&shared),
            triggers,
            options,
            ready_tx,
        ));

        Self {
            shared,
            engine,
            queue_name,
            ready: ready_rx,
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `Ok(None)` once the iterator has been terminated.
    ///
    /// # Errors
    ///
    /// [`PubSubError::Transport`] if the initial subscriptions failed.
    pub async fn next(&self) -> Result<Option<T>> {
        // ---
        self.wait_subscribed().await?;

        let pull = {
            let mut state = self.shared.lock();
            if !state.listening {
                None
            } else if let Some(value) = state.values.pop_front() {
                return Ok(Some(value));
            } else {
                let (tx, rx) = oneshot::channel();
                state.pulls.push_back(tx);
                Some(rx)
            }
        };

        match pull {
            Some(rx) => Ok(rx.await.unwrap_or(None)),
            None => {
                self.close().await?;
                Ok(None)
            }
        }
    }

    /// Terminate the iterator. Idempotent.
    ///
    /// Waits for the initial subscriptions, then releases them.
    pub async fn close(&self) -> Result<()> {
        // ---
        if self.wait_subscribed().await.is_err() {
            // Nothing was left subscribed.
            self.shared.stop();
            return Ok(());
        }

        if let Some(ids) = self.shared.stop() {
            log_debug!("iterator releasing {} subscription(s)", ids.len());
            unsubscribe_all(self.engine.as_ref(), ids, &self.queue_name).await;
        }
        Ok(())
    }

    /// Terminate the iterator, then fail with `err`.
    pub async fn throw(&self, err: PubSubError) -> Result<()> {
        // ---
        self.close().await?;
        Err(err)
    }

    /// Whether the iterator still accepts events.
    pub fn is_listening(&self) -> bool {
        self.shared.is_listening()
    }

    /// Consume the iterator as a [`Stream`].
    ///
    /// The stream ends when the iterator is terminated and yields a single
    /// error if the initial subscriptions failed.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send {
        // ---
        stream::unfold(Some(self), |iter| async move {
            let iter = iter?;
            match iter.next().await {
                Ok(Some(value)) => Some((Ok(value), Some(iter))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    async fn wait_subscribed(&self) -> Result<()> {
        // ---
        let mut ready = self.ready.clone();
        let outcome = {
            let current = ready
                .wait_for(Option::is_some)
                .await
                .map_err(|_| PubSubError::Transport("iterator subscription task ended".into()))?;
            current.clone()
        };

        match outcome {
            Some(Err(reason)) => Err(PubSubError::Transport(reason)),
            _ => Ok(()),
        }
    }
}

impl<T> Drop for PubSubAsyncIterator<T> {
    fn drop(&mut self) {
        // ---
        // Handles still in flight are released by the subscribing task once it
        // sees that listening stopped.
        let Some(ids) = self.shared.stop() else {
            return;
        };
        if ids.is_empty() {
            return;
        }

        let engine = Arc::clone(&self.engine);
        let queue_name = self.queue_name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    unsubscribe_all(engine.as_ref(), ids, &queue_name).await;
                });
            }
            Err(_) => {
                log_warn!("iterator dropped outside a runtime; {} subscription(s) leaked", ids.len());
            }
        }
    }
}
