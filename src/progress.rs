//! Per-case progress event bus and the live progress stream.
//!
//! A [`ProgressBus`] buffers every event emitted for one pipeline run and
//! notifies subscribers synchronously, in emission order. Late subscribers
//! are replayed the buffer before they see live events. Buses live in a
//! [`ProgressRegistry`] keyed by case; a case with no bus has no active
//! pipeline.

use crate::models::{CaseId, ProgressEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Returned by a subscriber that can no longer accept events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("progress subscriber disconnected")]
pub struct SubscriberGone;

type Subscriber = Box<dyn Fn(&ProgressEvent) -> Result<(), SubscriberGone> + Send + Sync>;

#[derive(Default)]
struct BusState {
    events: Vec<ProgressEvent>,
    subscribers: Vec<(u64, Subscriber)>,
    next_id: u64,
}

/// Ordered, replayable event channel for one case.
pub struct ProgressBus {
    case_id: CaseId,
    state: Mutex<BusState>,
}

impl ProgressBus {
    pub fn new(case_id: CaseId) -> Arc<Self> {
        Arc::new(Self {
            case_id,
            state: Mutex::new(BusState::default()),
        })
    }

    pub fn case_id(&self) -> CaseId {
        self.case_id
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event and notify every current subscriber.
    ///
    /// A subscriber that errors or panics is dropped; delivery to the others
    /// continues. Subscribers must not call back into the bus.
    pub fn emit(&self, event: ProgressEvent) {
        let mut state = self.lock();
        state.events.push(event.clone());

        let mut dropped = Vec::new();
        for (id, subscriber) in &state.subscribers {
            if !deliver(subscriber, &event) {
                dropped.push(*id);
            }
        }

        if !dropped.is_empty() {
            warn!(
                "Dropping {} failed progress subscribers for case {}",
                dropped.len(),
                self.case_id
            );
            state.subscribers.retain(|(id, _)| !dropped.contains(id));
        }

        debug!(
            "Progress {} {:?} for case {} ({} subscribers)",
            event.stage,
            event.status,
            self.case_id,
            state.subscribers.len()
        );
    }

    /// Every event emitted so far, in order.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.lock().events.clone()
    }

    /// Register a subscriber for future events.
    pub fn on<F>(self: &Arc<Self>, subscriber: F) -> Subscription
    where
        F: Fn(&ProgressEvent) -> Result<(), SubscriberGone> + Send + Sync + 'static,
    {
        let mut state = self.lock();
        self.register(&mut state, Box::new(subscriber))
    }

    /// Replay the buffer through the subscriber, then register it for live
    /// events. Both happen under one lock so no event is missed or reordered.
    pub fn on_with_replay<F>(self: &Arc<Self>, subscriber: F) -> Option<Subscription>
    where
        F: Fn(&ProgressEvent) -> Result<(), SubscriberGone> + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Box::new(subscriber);
        let mut state = self.lock();

        for event in &state.events {
            if !deliver(&subscriber, event) {
                return None;
            }
        }

        Some(self.register(&mut state, subscriber))
    }

    fn register(self: &Arc<Self>, state: &mut BusState, subscriber: Subscriber) -> Subscription {
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push((id, subscriber));

        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|(sid, _)| *sid != id);
    }
}

fn deliver(subscriber: &Subscriber, event: &ProgressEvent) -> bool {
    matches!(
        catch_unwind(AssertUnwindSafe(|| subscriber(event))),
        Ok(Ok(()))
    )
}

/// Cancellation handle returned by [`ProgressBus::on`].
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<ProgressBus>,
    id: u64,
}

impl Subscription {
    /// Stop receiving events. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Process-wide map of active buses.
#[derive(Clone)]
pub struct ProgressRegistry {
    buses: Arc<Mutex<HashMap<CaseId, Arc<ProgressBus>>>>,
    grace_period: Duration,
}

impl ProgressRegistry {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            buses: Arc::new(Mutex::new(HashMap::new())),
            grace_period,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CaseId, Arc<ProgressBus>>> {
        self.buses.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a fresh bus for a new pipeline run, replacing any bus still
    /// lingering in its grace period.
    pub fn open(&self, case_id: CaseId) -> Arc<ProgressBus> {
        let bus = ProgressBus::new(case_id);
        if self.lock().insert(case_id, bus.clone()).is_some() {
            debug!("Replaced lingering progress bus for case {}", case_id);
        }
        bus
    }

    pub fn get(&self, case_id: CaseId) -> Option<Arc<ProgressBus>> {
        self.lock().get(&case_id).cloned()
    }

    /// Remove the bus once the grace period has elapsed, unless a newer run
    /// has replaced it in the meantime.
    pub fn schedule_teardown(&self, bus: &Arc<ProgressBus>) {
        let registry = self.clone();
        let bus = bus.clone();
        let grace = self.grace_period;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut buses = registry.lock();
            let current = buses.get(&bus.case_id()).cloned();
            if let Some(current) = current {
                if Arc::ptr_eq(&current, &bus) {
                    buses.remove(&bus.case_id());
                    debug!("Tore down progress bus for case {}", bus.case_id());
                }
            }
        });
    }

    /// Open a progress stream for a case.
    ///
    /// The stream yields `connected`, then the buffered events, then live
    /// events, and `done` one grace period after the terminal event. With no
    /// active pipeline it yields `connected` and `no_pipeline` and ends.
    pub fn subscribe(&self, case_id: CaseId) -> ProgressStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StreamMessage::Connected { case_id });

        let Some(bus) = self.get(case_id) else {
            let _ = tx.send(StreamMessage::NoPipeline);
            return ProgressStream::new(rx, None);
        };

        let grace = self.grace_period;
        let subscription = bus.on_with_replay(move |event| {
            tx.send(StreamMessage::Progress(event.clone()))
                .map_err(|_| SubscriberGone)?;

            if event.is_terminal() {
                schedule_done(tx.clone(), grace);
            }
            Ok(())
        });

        ProgressStream::new(rx, subscription)
    }
}

fn schedule_done(tx: mpsc::UnboundedSender<StreamMessage>, grace: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(StreamMessage::Done);
            });
        }
        Err(_) => {
            let _ = tx.send(StreamMessage::Done);
        }
    }
}

/// One frame of the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Connected { case_id: CaseId },
    Progress(ProgressEvent),
    Done,
    NoPipeline,
}

impl StreamMessage {
    /// Server-sent-event framing.
    pub fn to_sse(&self) -> String {
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", payload)
    }

    fn closes_stream(&self) -> bool {
        matches!(self, StreamMessage::Done | StreamMessage::NoPipeline)
    }
}

/// Receiving side of a progress subscription.
///
/// Dropping the stream unsubscribes from the bus; the pipeline keeps running.
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    subscription: Option<Subscription>,
    finished: bool,
}

impl ProgressStream {
    fn new(rx: mpsc::UnboundedReceiver<StreamMessage>, subscription: Option<Subscription>) -> Self {
        Self {
            rx,
            subscription,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.rx.close();
    }
}

impl futures::Stream for ProgressStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                if message.closes_stream() {
                    self.finish();
                }
                Poll::Ready(Some(message))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}
