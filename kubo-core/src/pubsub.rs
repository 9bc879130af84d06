//! Publish/subscribe over the engine's pull-only "next message" primitive.
//!
//! The engine only offers a non-blocking try-next per subscription id. [`poll`] is the
//! single wait loop built on it; both consumers use it: [`Subscription::next_message`]
//! (blocking with timeout) and the optional callback worker started by
//! [`Subscription::subscribe_callback`]. Only one of them consumes a subscription at a
//! time. A subscription is `Active` until closed; closed is terminal.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::gateway::{check_status, check_zero};
use crate::wire::{decode_message, decode_string_list, Message};

/// Poll window used by the blocking iterator.
const ITER_WINDOW: Duration = Duration::from_secs(1);

/// Per-session registry of live subscriptions, keyed by topic.
/// All mutation goes through this type.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: Mutex<HashMap<String, Vec<Arc<Inner>>>>,
}

impl SubscriptionRegistry {
    fn insert(&self, sub: Arc<Inner>) {
        self.topics
            .lock()
            .entry(sub.topic.clone())
            .or_default()
            .push(sub);
    }

    /// Remove by id; a topic entry goes away with its last subscription.
    fn remove(&self, id: i64) {
        let mut topics = self.topics.lock();
        topics.retain(|_, subs| {
            subs.retain(|s| s.id != id);
            !subs.is_empty()
        });
    }

    /// Take every subscription out of the registry.
    fn drain(&self) -> Vec<Arc<Inner>> {
        self.topics
            .lock()
            .drain()
            .flat_map(|(_, subs)| subs)
            .collect()
    }

    fn topics(&self) -> Vec<String> {
        let mut t: Vec<String> = self.topics.lock().keys().cloned().collect();
        t.sort();
        t
    }

    fn for_topic(&self, topic: &str) -> Vec<Arc<Inner>> {
        self.topics.lock().get(topic).cloned().unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.topics.lock().values().map(Vec::len).sum()
    }
}

struct Inner {
    id: i64,
    topic: String,
    ctx: Arc<NodeContext>,
    registry: Weak<SubscriptionRegistry>,
    active: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

/// Background delivery thread of one subscription.
struct Worker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Signal stop and wait up to `timeout`. Returns false if the worker was left running.
    fn stop(self, id: i64, timeout: Duration) -> bool {
        let Worker {
            stop_tx,
            done_rx,
            handle,
        } = self;
        drop(stop_tx);
        if handle.thread().id() == thread::current().id() {
            // Stopped from inside its own callback: it exits once the callback returns.
            return true;
        }
        match done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    subscription = id,
                    timeout_ms = timeout.as_millis() as u64,
                    "callback worker did not stop in time; detaching it"
                );
                false
            }
            _ => {
                if handle.join().is_err() {
                    warn!(subscription = id, "callback worker panicked");
                }
                true
            }
        }
    }
}

impl Inner {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// One round trip to the engine. Undecodable envelopes are logged and skipped.
    fn try_next(&self) -> Result<Option<Message>> {
        let Some(json) = self.ctx.engine.pubsub_next_message(self.id)? else {
            return Ok(None);
        };
        if json.is_empty() {
            return Ok(None);
        }
        match decode_message(&json) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                warn!(subscription = self.id, error = %e, "dropping undecodable pubsub message");
                Ok(None)
            }
        }
    }

    fn stop_worker(&self) -> bool {
        let worker = self.worker.lock().take();
        match worker {
            Some(w) => w.stop(self.id, self.ctx.join_timeout),
            None => true,
        }
    }

    fn close(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_worker();
        let code = self.ctx.engine.pubsub_unsubscribe(self.id);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        debug!(subscription = self.id, topic = %self.topic, "unsubscribed");
        check_zero("PubSubUnsubscribe", code?)
    }
}

/// The wait loop: try the engine, otherwise wait one poll interval and retry.
///
/// Returns `None` once `timeout` elapses (`None` waits forever) or the `stop` channel
/// disconnects. At least one attempt is made, and no wait exceeds one poll interval past
/// the deadline.
fn poll(
    inner: &Inner,
    timeout: Option<Duration>,
    stop: Option<&Receiver<()>>,
) -> Result<Option<Message>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if !inner.is_active() {
            return Err(Error::precondition("subscription is no longer active"));
        }
        if let Some(msg) = inner.try_next()? {
            return Ok(Some(msg));
        }
        let mut wait = inner.ctx.poll_interval;
        if let Some(d) = deadline {
            let now = Instant::now();
            if now >= d {
                return Ok(None);
            }
            wait = wait.min(d - now);
        }
        match stop {
            Some(rx) => match rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return Ok(None),
            },
            None => thread::sleep(wait),
        }
    }
}

fn run_worker<F>(inner: Arc<Inner>, mut callback: F, stop_rx: Receiver<()>, done_tx: Sender<()>)
where
    F: FnMut(Message),
{
    let _done = done_tx;
    let window = inner.ctx.callback_window;
    while inner.is_active() {
        match poll(&inner, Some(window), Some(&stop_rx)) {
            Ok(Some(msg)) => {
                if catch_unwind(AssertUnwindSafe(|| callback(msg))).is_err() {
                    error!(subscription = inner.id, "subscription callback panicked");
                }
            }
            Ok(None) => {}
            Err(e) if inner.is_active() => {
                warn!(subscription = inner.id, error = %e, "error polling subscription");
                if !matches!(
                    stop_rx.recv_timeout(inner.ctx.poll_interval),
                    Err(RecvTimeoutError::Timeout)
                ) {
                    break;
                }
            }
            Err(_) => break,
        }
        if matches!(stop_rx.try_recv(), Err(TryRecvError::Disconnected)) {
            break;
        }
    }
    debug!(subscription = inner.id, "callback worker exited");
}

/// A live subscription to one topic. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("topic", &self.inner.topic)
            .field("active", &self.inner.is_active())
            .finish()
    }
}

impl Subscription {
    /// Engine-assigned id, valid until the subscription is closed.
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Wait for the next message. `None` waits indefinitely.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a message. Fails with
    /// `Precondition` while a callback is installed: each message is delivered once, to
    /// exactly one consumer.
    pub fn next_message(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        if self.inner.worker.lock().is_some() {
            return Err(Error::precondition(
                "subscription delivers through a callback; stop it before polling",
            ));
        }
        poll(&self.inner, timeout, None)
    }

    /// Blocking iterator over incoming messages; ends when the subscription closes.
    pub fn messages(&self) -> Messages<'_> {
        Messages { sub: self }
    }

    /// Deliver every message to `callback` on a dedicated background thread.
    ///
    /// While the callback is installed it is the only consumer; [`Self::next_message`]
    /// and [`Self::messages`] are rejected until [`Self::stop_callback`].
    ///
    /// Replaces any callback already installed: the previous worker is stopped (bounded
    /// join) before the new one starts. Panics inside `callback` are logged and delivery
    /// continues.
    pub fn subscribe_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        if !self.inner.is_active() {
            return Err(Error::precondition("subscription is no longer active"));
        }
        let mut slot = self.inner.worker.lock();
        if let Some(old) = slot.take() {
            old.stop(self.inner.id, self.inner.ctx.join_timeout);
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(0);
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name(format!("pubsub-{}", self.inner.id))
            .spawn(move || run_worker(inner, callback, stop_rx, done_tx))?;
        *slot = Some(Worker {
            stop_tx,
            done_rx,
            handle,
        });
        Ok(())
    }

    /// Stop the callback worker, if any, keeping the subscription open.
    /// Returns false if the worker did not stop within the join window.
    pub fn stop_callback(&self) -> bool {
        self.inner.stop_worker()
    }

    /// Close the subscription. Idempotent.
    ///
    /// Stops the callback worker, releases the id in the engine, then deregisters.
    /// An engine failure is reported after local state has been cleaned up.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// Iterator returned by [`Subscription::messages`].
pub struct Messages<'a> {
    sub: &'a Subscription,
}

impl Iterator for Messages<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        while self.sub.is_active() {
            match self.sub.next_message(Some(ITER_WINDOW)) {
                Ok(Some(msg)) => return Some(msg),
                Ok(None) => continue,
                Err(e) => {
                    if self.sub.is_active() {
                        warn!(subscription = self.sub.id(), error = %e, "message iterator stopped");
                    }
                    return None;
                }
            }
        }
        None
    }
}

/// PubSub capability of a node session.
pub struct PubSub {
    ctx: Arc<NodeContext>,
    registry: Arc<SubscriptionRegistry>,
}

impl PubSub {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            registry: Arc::new(SubscriptionRegistry::default()),
        }
    }

    /// Subscribe to `topic`. Several subscriptions per topic are allowed.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ctx.require_pubsub("subscribe to topics")?;
        let id = self
            .ctx
            .engine
            .pubsub_subscribe(&self.ctx.repo, topic)?;
        let id = check_status("PubSubSubscribe", id).map_err(|e| {
            warn!(topic, error = %e, "failed to subscribe");
            e
        })?;
        let inner = Arc::new(Inner {
            id,
            topic: topic.to_string(),
            ctx: self.ctx.clone(),
            registry: Arc::downgrade(&self.registry),
            active: AtomicBool::new(true),
            worker: Mutex::new(None),
        });
        self.registry.insert(inner.clone());
        debug!(subscription = id, topic, "subscribed");
        Ok(Subscription { inner })
    }

    pub fn publish(&self, topic: &str, data: impl AsRef<[u8]>) -> Result<()> {
        self.ctx.require_pubsub("publish to topics")?;
        let code = self
            .ctx
            .engine
            .pubsub_publish(&self.ctx.repo, topic, data.as_ref())?;
        check_zero("PubSubPublish", code)
    }

    /// Peers participating in pubsub, optionally restricted to one topic.
    pub fn peers(&self, topic: Option<&str>) -> Result<Vec<String>> {
        self.ctx.require_pubsub("list pubsub peers")?;
        let json = self
            .ctx
            .engine
            .pubsub_peers(&self.ctx.repo, topic.unwrap_or(""))?;
        Ok(json.map(|j| decode_string_list(&j)).unwrap_or_default())
    }

    /// Topics the engine reports this node subscribed to.
    pub fn topics(&self) -> Result<Vec<String>> {
        self.ctx.require_pubsub("list topics")?;
        let json = self.ctx.engine.pubsub_list_topics(&self.ctx.repo)?;
        Ok(json.map(|j| decode_string_list(&j)).unwrap_or_default())
    }

    /// Live subscriptions for `topic` held by this session.
    pub fn subscriptions(&self, topic: &str) -> Vec<Subscription> {
        self.registry
            .for_topic(topic)
            .into_iter()
            .map(|inner| Subscription { inner })
            .collect()
    }

    /// Topics with at least one live subscription in this session.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Close every tracked subscription, logging individual failures.
    /// Returns the number of subscriptions that failed to close cleanly.
    pub(crate) fn close_all(&self) -> usize {
        let mut failures = 0;
        for inner in self.registry.drain() {
            if let Err(e) = inner.close() {
                warn!(subscription = inner.id, topic = %inner.topic, error = %e, "error closing subscription");
                failures += 1;
            }
        }
        failures
    }
}
