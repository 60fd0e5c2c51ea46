// src/utils/streams.rs: fan-out of progress events to live subscribers

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Start,
    Progress,
    StepStart,
    StepComplete,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub step_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: EventType, message: impl Into<String>, step_name: Option<&str>) -> Self {
        ProgressEvent {
            kind,
            message: message.into(),
            step_name: step_name.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    pub fn start(message: impl Into<String>) -> Self {
        Self::new(EventType::Start, message, None)
    }

    pub fn progress(message: impl Into<String>, step: Option<&str>) -> Self {
        Self::new(EventType::Progress, message, step)
    }

    pub fn step_start(step: &str, label: &str) -> Self {
        Self::new(EventType::StepStart, label, Some(step))
    }

    pub fn step_complete(step: &str, message: impl Into<String>) -> Self {
        Self::new(EventType::StepComplete, message, Some(step))
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::new(EventType::Complete, message, None)
    }

    pub fn error(message: impl Into<String>, step: Option<&str>) -> Self {
        Self::new(EventType::Error, message, step)
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<ProgressEvent>>,
}

/// One listener's ordered event stream. Ends when the broadcaster closes it.
#[derive(Debug)]
pub struct Subscription {
    id: Option<u64>,
    stream: UnboundedReceiverStream<ProgressEvent>,
}

impl Subscription {
    /// `None` for one-shot streams that were never registered.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.stream.next().await
    }
}

impl Stream for Subscription {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

/// Delivers each published event to every registered subscriber, in publish order.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    subscribers: Arc<Mutex<Subscribers>>,
    close_delay: Duration,
}

impl ProgressBroadcaster {
    pub fn new(close_delay: Duration) -> Self {
        ProgressBroadcaster {
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            close_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a listener, queueing `backfill` ahead of any later event.
    ///
    /// # Arguments
    ///
    /// * `backfill` - Synthetic events describing the state at subscription time.
    ///
    /// # Returns
    /// Subscription stream
    pub fn subscribe(&self, backfill: Vec<ProgressEvent>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in backfill {
            let _ = tx.send(event);
        }
        let mut subs = self.lock();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.senders.insert(id, tx);
        debug!("Subscriber {} registered ({} live)", id, subs.senders.len());
        Subscription {
            id: Some(id),
            stream: UnboundedReceiverStream::new(rx),
        }
    }

    /// A stream that yields `events` and ends, without joining the live set.
    pub fn one_shot(events: Vec<ProgressEvent>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let _ = tx.send(event);
        }
        Subscription {
            id: None,
            stream: UnboundedReceiverStream::new(rx),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.lock().senders.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().senders.len()
    }

    /// Sends `event` to every subscriber. Subscribers whose receiver is gone are dropped.
    pub fn publish(&self, event: ProgressEvent) {
        let mut subs = self.lock();
        subs.senders.retain(|id, tx| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Subscriber {} went away; unsubscribing", id);
                false
            }
        });
    }

    /// Publishes the run's final event, then closes the current subscribers after the close delay.
    pub fn publish_terminal(&self, event: ProgressEvent) {
        self.publish(event);
        let ids: Vec<u64> = self.lock().senders.keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        let subscribers = self.subscribers.clone();
        let delay = self.close_delay;
        let close = move || {
            let mut subs = subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for id in &ids {
                subs.senders.remove(id);
            }
            debug!("Closed {} subscribers after terminal event", ids.len());
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    close();
                });
            }
            Err(_) => close(),
        }
    }

    /// Ends every subscriber stream now.
    pub fn close_all(&self) {
        let mut subs = self.lock();
        let closed = subs.senders.len();
        subs.senders.clear();
        if closed > 0 {
            debug!("Closed {} subscribers", closed);
        }
    }
}
