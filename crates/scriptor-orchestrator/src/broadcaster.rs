//! Per-job fan-out of progress events.
//!
//! Each job owns one channel holding the last published event and the live
//! subscriber senders. Subscribing replays the last event first, so a late
//! subscriber always sees the current state. The terminal event closes the
//! channel: every subscriber receives it and then end-of-stream.

use crate::types::{JobId, ProgressEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

#[derive(Default)]
struct Channel {
    last: Option<ProgressEvent>,
    subscribers: Vec<mpsc::UnboundedSender<ProgressEvent>>,
    closed: bool,
}

/// Ordered progress stream for one job. Ends after the terminal event.
pub struct EventStream {
    inner: UnboundedReceiverStream<ProgressEvent>,
}

impl EventStream {
    fn new(rx: mpsc::UnboundedReceiver<ProgressEvent>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Stream for EventStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

/// Fan-out of [`ProgressEvent`]s to any number of subscribers per job.
#[derive(Default)]
pub struct EventBroadcaster {
    channels: Mutex<HashMap<JobId, Channel>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the channel for a job. Idempotent.
    pub fn register(&self, job_id: JobId) {
        self.channels.lock().entry(job_id).or_default();
    }

    /// Deliver `event` to every live subscriber and remember it for replay.
    ///
    /// Events whose sequence number does not advance are dropped. Publishing
    /// on a closed channel is a no-op.
    pub fn publish(&self, event: ProgressEvent) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(event.job_id).or_default();
        if channel.closed {
            tracing::debug!(job_id = %event.job_id, seq = event.seq, "Event after close dropped");
            return;
        }
        if let Some(last) = &channel.last {
            if event.seq <= last.seq {
                tracing::warn!(
                    job_id = %event.job_id,
                    seq = event.seq,
                    last_seq = last.seq,
                    "Out-of-order event dropped"
                );
                return;
            }
        }

        let before = channel.subscribers.len();
        channel
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        if channel.subscribers.len() < before {
            tracing::debug!(
                job_id = %event.job_id,
                dropped = before - channel.subscribers.len(),
                "Disconnected subscribers removed"
            );
        }

        let terminal = event.is_terminal();
        channel.last = Some(event);
        if terminal {
            channel.closed = true;
            // Dropping the senders ends every stream after the terminal event.
            channel.subscribers.clear();
        }
    }

    /// Subscribe to a job's events. `None` if the job was never registered.
    pub fn subscribe(&self, job_id: JobId) -> Option<EventStream> {
        let mut channels = self.channels.lock();
        let channel = channels.get_mut(&job_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(last) = &channel.last {
            let _ = tx.send(last.clone());
        }
        if !channel.closed {
            channel.subscribers.push(tx);
        }
        Some(EventStream::new(rx))
    }

    pub fn last_event(&self, job_id: JobId) -> Option<ProgressEvent> {
        self.channels
            .lock()
            .get(&job_id)
            .and_then(|c| c.last.clone())
    }

    /// Live subscribers of a job. Disconnected ones are pruned on the next publish.
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.channels
            .lock()
            .get(&job_id)
            .map_or(0, |c| c.subscribers.len())
    }

    pub fn is_closed(&self, job_id: JobId) -> bool {
        self.channels.lock().get(&job_id).is_some_and(|c| c.closed)
    }

    /// Forget a job's channel entirely.
    pub fn remove(&self, job_id: JobId) {
        self.channels.lock().remove(&job_id);
    }
}
