// Copyright 2024 The Coder Aggregator Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Turns point-in-time mutations into live watch streams.
//!
//! Mutations enqueue events into a bounded queue. A single dispatcher task
//! drains the queue in order and fans every event out to the subscribers
//! whose filter accepts it. The queue blocks producers when full and never
//! drops events.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Capacity of the event queue between mutations and the dispatcher.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Events buffered per watcher before the dispatcher waits on it.
pub const DEFAULT_WATCHER_BUFFER: usize = 100;

/// A watch event carrying a full snapshot of the object.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(object) | WatchEvent::Modified(object) | WatchEvent::Deleted(object) => object,
        }
    }
}

pub type Filter<K> = Box<dyn Fn(&K) -> bool + Send + Sync>;

struct Subscriber<K> {
    filter: Filter<K>,
    tx: mpsc::Sender<WatchEvent<K>>,
    stop: CancellationToken,
}

struct Subscribers<K> {
    next_id: u64,
    entries: HashMap<u64, Arc<Subscriber<K>>>,
    stopped: bool,
}

struct Fanout<K> {
    subscribers: Mutex<Subscribers<K>>,
}

impl<K: Clone + Send + Sync + 'static> Fanout<K> {
    async fn add(&self, subscriber: Subscriber<K>) -> Result<u64> {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.stopped {
            return Err(Error::unavailable("watch broadcaster is shut down"));
        }

        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.entries.insert(id, Arc::new(subscriber));
        Ok(id)
    }

    async fn remove(&self, id: u64) {
        if let Some(subscriber) = self.subscribers.lock().await.entries.remove(&id) {
            subscriber.stop.cancel();
        }
    }

    async fn distribute(&self, event: WatchEvent<K>) {
        let targets: Vec<(u64, Arc<Subscriber<K>>)> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .entries
                .iter()
                .filter(|(_, subscriber)| (subscriber.filter)(event.object()))
                .map(|(id, subscriber)| (*id, subscriber.clone()))
                .collect()
        };

        for (id, subscriber) in targets {
            let delivered = tokio::select! {
                result = subscriber.tx.send(event.clone()) => result.is_ok(),
                _ = subscriber.stop.cancelled() => false,
            };
            if !delivered {
                self.remove(id).await;
            }
        }
    }

    async fn stop_all(&self) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.stopped = true;
        for (_, subscriber) in subscribers.entries.drain() {
            subscriber.stop.cancel();
        }
    }
}

/// Bounded event queue plus fan-out, owned by one store.
pub struct Broadcaster<K> {
    queue: Mutex<Option<mpsc::Sender<WatchEvent<K>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    fanout: Arc<Fanout<K>>,
    watcher_buffer: usize,
}

impl<K: Clone + Send + Sync + 'static> Broadcaster<K> {
    /// Creates the queue and spawns its dispatcher on the current runtime.
    pub fn new(queue_capacity: usize, watcher_buffer: usize) -> Broadcaster<K> {
        let (tx, mut rx) = mpsc::channel::<WatchEvent<K>>(queue_capacity.max(1));
        let fanout = Arc::new(Fanout {
            subscribers: Mutex::new(Subscribers { next_id: 0, entries: HashMap::new(), stopped: false }),
        });

        let dispatch = fanout.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch.distribute(event).await;
            }
            debug!("Watch event queue closed, dispatcher exiting");
        });

        Broadcaster {
            queue: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            fanout,
            watcher_buffer: watcher_buffer.max(1),
        }
    }

    /// Enqueues an event, waiting while the queue is full.
    pub async fn emit(&self, event: WatchEvent<K>) -> Result<()> {
        let sender = self.queue.lock().await.clone();
        let Some(sender) = sender else {
            return Err(Error::unavailable("watch event queue is closed"));
        };
        sender.send(event).await.map_err(|_| Error::unavailable("watch event queue is closed"))
    }

    /// Registers a filtered subscriber that lives until `cancel` fires, the
    /// timeout elapses, the returned watcher is dropped or the broadcaster
    /// shuts down, whichever comes first.
    pub async fn watch(
        &self,
        filter: Filter<K>,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Watcher<K>> {
        let (tx, rx) = mpsc::channel(self.watcher_buffer);
        let stop = CancellationToken::new();
        let closed = tx.clone();
        let id = self.fanout.add(Subscriber { filter, tx, stop: stop.clone() }).await?;

        let fanout = self.fanout.clone();
        let lifetime = stop.clone();
        tokio::spawn(async move {
            let deadline = async {
                match timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => debug!("Watcher {} cancelled by its caller", id),
                _ = deadline => debug!("Watcher {} reached its timeout", id),
                _ = lifetime.cancelled() => debug!("Watcher {} stopped", id),
                _ = closed.closed() => debug!("Watcher {} dropped by its consumer", id),
            }
            drop(closed);
            fanout.remove(id).await;
        });

        Ok(Watcher { events: ReceiverStream::new(rx), stop })
    }

    /// Closes the queue, waits for the dispatcher to drain it, then stops
    /// every subscriber. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let queue = self.queue.lock().await.take();
        if queue.is_none() {
            return;
        }
        drop(queue);

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            if let Err(err) = dispatcher.await {
                tracing::error!("Watch dispatcher failed: {}", err);
            }
        }

        self.fanout.stop_all().await;
        info!("Watch broadcaster shut down");
    }
}

/// A live stream of filtered watch events.
pub struct Watcher<K> {
    events: ReceiverStream<WatchEvent<K>>,
    stop: CancellationToken,
}

impl<K> Watcher<K> {
    /// Stops the subscription, the stream ends once buffered events are read.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl<K> Stream for Watcher<K> {
    type Item = WatchEvent<K>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl<K> Drop for Watcher<K> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn accept_all() -> Filter<u32> {
        Box::new(|_| true)
    }

    async fn next(watcher: &mut Watcher<u32>) -> Option<WatchEvent<u32>> {
        tokio::time::timeout(Duration::from_secs(5), watcher.next()).await.unwrap()
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let broadcaster = Broadcaster::new(4, 4);
        let mut watcher = broadcaster.watch(accept_all(), CancellationToken::new(), None).await.unwrap();

        for i in 0..10 {
            broadcaster.emit(WatchEvent::Added(i)).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(next(&mut watcher).await, Some(WatchEvent::Added(i)));
        }
    }

    #[tokio::test]
    async fn test_filter_is_applied() {
        let broadcaster = Broadcaster::<u32>::new(4, 4);
        let mut even =
            broadcaster.watch(Box::new(|n: &u32| n % 2 == 0), CancellationToken::new(), None).await.unwrap();

        for i in 1..=4 {
            broadcaster.emit(WatchEvent::Modified(i)).await.unwrap();
        }
        assert_eq!(next(&mut even).await, Some(WatchEvent::Modified(2)));
        assert_eq!(next(&mut even).await, Some(WatchEvent::Modified(4)));
    }

    #[tokio::test]
    async fn test_cancel_ends_the_stream() {
        let broadcaster = Broadcaster::<u32>::new(4, 4);
        let cancel = CancellationToken::new();
        let mut watcher = broadcaster.watch(accept_all(), cancel.clone(), None).await.unwrap();

        cancel.cancel();
        assert_eq!(next(&mut watcher).await, None);
    }

    #[tokio::test]
    async fn test_timeout_ends_the_stream() {
        let broadcaster = Broadcaster::<u32>::new(4, 4);
        let mut watcher = broadcaster
            .watch(accept_all(), CancellationToken::new(), Some(Duration::from_millis(20)))
            .await
            .unwrap();

        assert_eq!(next(&mut watcher).await, None);
    }

    #[tokio::test]
    async fn test_absent_watcher_does_not_block_emit() {
        let broadcaster = Broadcaster::new(16, 1);
        let _idle = broadcaster.watch(accept_all(), CancellationToken::new(), None).await.unwrap();

        // The idle watcher holds one event and stalls the dispatcher, the queue absorbs the rest.
        let emitted = tokio::time::timeout(Duration::from_secs(5), async {
            for i in 0..8 {
                broadcaster.emit(WatchEvent::Added(i)).await.unwrap();
            }
        })
        .await;
        assert!(emitted.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_stops() {
        let broadcaster = Broadcaster::new(8, 8);
        let mut watcher = broadcaster.watch(accept_all(), CancellationToken::new(), None).await.unwrap();

        broadcaster.emit(WatchEvent::Added(1)).await.unwrap();
        broadcaster.emit(WatchEvent::Deleted(1)).await.unwrap();
        broadcaster.shutdown().await;
        broadcaster.shutdown().await;

        assert_eq!(next(&mut watcher).await, Some(WatchEvent::Added(1)));
        assert_eq!(next(&mut watcher).await, Some(WatchEvent::Deleted(1)));
        assert_eq!(next(&mut watcher).await, None);

        assert!(broadcaster.emit(WatchEvent::Added(2)).await.is_err());
        assert!(broadcaster.watch(accept_all(), CancellationToken::new(), None).await.is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let value = serde_json::to_value(WatchEvent::Modified(serde_json::json!({"kind": "CoderWorkspace"}))).unwrap();
        assert_eq!(value, serde_json::json!({"type": "MODIFIED", "object": {"kind": "CoderWorkspace"}}));
    }
}
