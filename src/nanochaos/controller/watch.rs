/*
 * Copyright (C) 2024 The Nanochaos Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Shared watch fan-out over the chaos keyspace: one underlying watch loop
//! per prefix, broadcast to every subscriber, restarted with backoff from
//! the last seen resource version.

use crate::nanochaos::scheduler::{JobResult, ScheduleSpec, Scheduler, ScheduledTaskHandle};
use crate::nanochaos::util::{Keyspace, KeyspaceEvent};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const WATCH_BUFFER_SIZE: usize = 64;
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

pub type ControllerWatchEvent = KeyspaceEvent;

#[derive(Clone)]
pub struct ControllerWatchManager {
    inner: Arc<Inner>,
}

struct Inner {
    keyspace: Keyspace,
    watches: Mutex<HashMap<String, Arc<WatchState>>>,
}

struct WatchState {
    sender: broadcast::Sender<ControllerWatchEvent>,
    subscribers: AtomicUsize,
    shutdown: CancellationToken,
    task: Mutex<Option<ScheduledTaskHandle>>,
    prefix: String,
}

impl WatchState {
    fn new(prefix: String) -> Self {
        let (sender, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            sender,
            subscribers: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            prefix,
        }
    }

    fn start(self: &Arc<Self>, keyspace: Keyspace) {
        let state = Arc::clone(self);
        let scheduler = Scheduler::global();
        let handle = scheduler.schedule(
            ScheduleSpec::Immediate {
                label: "controller.watch-loop",
            },
            move |ctx| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let cancellation = ctx.cancellation_token();
                    let shutdown = state.shutdown.clone();
                    tokio::select! {
                        _ = cancellation.cancelled() => shutdown.cancel(),
                        _ = run_watch_loop(Arc::clone(&state), keyspace) => {}
                    }
                    JobResult::Stop
                })
            },
        );
        *self.task.lock().expect("watch task lock poisoned") = Some(handle);
    }

    fn subscribe(&self) -> broadcast::Receiver<ControllerWatchEvent> {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        self.sender.subscribe()
    }

    fn release(&self) -> bool {
        self.subscribers.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

pub struct ControllerWatchSubscription {
    prefix: String,
    receiver: broadcast::Receiver<ControllerWatchEvent>,
    inner: Arc<Inner>,
    state: Arc<WatchState>,
}

impl ControllerWatchSubscription {
    pub async fn recv(&mut self) -> Option<ControllerWatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ControllerWatchSubscription {
    fn drop(&mut self) {
        if self.state.release() {
            self.state.shutdown.cancel();
            if let Some(handle) = self.state.task.lock().unwrap().take() {
                handle.cancel_and_abort();
            }
            let mut watches = self.inner.watches.lock().unwrap();
            watches.remove(&self.prefix);
        }
    }
}

impl ControllerWatchManager {
    /// The shared manager over the chaos partition.
    pub fn shared() -> Self {
        static INSTANCE: OnceLock<ControllerWatchManager> = OnceLock::new();
        INSTANCE
            .get_or_init(|| ControllerWatchManager::create(Keyspace::new("chaos")))
            .clone()
    }

    fn create(keyspace: Keyspace) -> Self {
        Self {
            inner: Arc::new(Inner {
                keyspace,
                watches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self, prefix: &str) -> ControllerWatchSubscription {
        let normalized = normalize_prefix(prefix);
        let state = self.inner.get_or_create_state(&normalized);
        let receiver = state.subscribe();
        ControllerWatchSubscription {
            prefix: normalized,
            receiver,
            inner: Arc::clone(&self.inner),
            state,
        }
    }

    #[cfg(test)]
    pub fn with_keyspace(keyspace: Keyspace) -> Self {
        Self::create(keyspace)
    }

    #[cfg(test)]
    pub fn active_watches(&self) -> usize {
        self.inner.watches.lock().unwrap().len()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() || !trimmed.starts_with('/') {
        format!("/{}", trimmed.trim_start_matches('/'))
    } else {
        trimmed.to_string()
    }
}

impl Inner {
    fn get_or_create_state(&self, prefix: &str) -> Arc<WatchState> {
        let mut watches = self.watches.lock().expect("watch registry lock poisoned");
        match watches.entry(prefix.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let state = Arc::new(WatchState::new(prefix.to_string()));
                state.start(self.keyspace);
                entry.insert(state.clone());
                state
            }
        }
    }
}

async fn run_watch_loop(state: Arc<WatchState>, keyspace: Keyspace) {
    let mut last_version = 0u64;
    let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);

    loop {
        let mut stream = keyspace.watch(
            &state.prefix,
            if last_version == 0 {
                None
            } else {
                Some(last_version)
            },
        );

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => return,
                event = stream.next() => match event {
                    Some(event) => {
                        backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                        last_version = event.resource_version;
                        let _ = state.sender.send(event);
                    }
                    None => break,
                }
            }
        }

        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        let next = backoff * 2;
        backoff = if next > Duration::from_millis(BACKOFF_MAX_MS) {
            Duration::from_millis(BACKOFF_MAX_MS)
        } else {
            next
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanochaos::test_support::{keyspace_env, keyspace_lock};
    use serial_test::serial;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    #[serial]
    async fn manager_fans_out_events_to_every_subscriber() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();
        let keyspace = Keyspace::new("controller-watch");
        let manager = ControllerWatchManager::with_keyspace(keyspace);

        let mut first = manager.subscribe("/networkchaos");
        let mut second = manager.subscribe("/networkchaos");

        Keyspace::new("controller-watch")
            .put("/networkchaos/default/demo", "value")
            .expect("put demo");

        let event1 = timeout(Duration::from_secs(1), first.recv())
            .await
            .expect("event1 timeout")
            .expect("event1");
        let event2 = timeout(Duration::from_secs(1), second.recv())
            .await
            .expect("event2 timeout")
            .expect("event2");

        assert_eq!(event1.key, "/networkchaos/default/demo");
        assert_eq!(event2.key, "/networkchaos/default/demo");
    }

    #[tokio::test]
    #[serial]
    async fn prefixes_are_isolated() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();
        let manager = ControllerWatchManager::with_keyspace(Keyspace::new("controller-watch-iso"));
        let mut podchaos = manager.subscribe("/podchaos");

        Keyspace::new("controller-watch-iso")
            .put("/timechaos/default/clock", "value")
            .expect("put");

        let result = timeout(Duration::from_millis(200), podchaos.recv()).await;
        assert!(result.is_err(), "podchaos watch must not see timechaos keys");
    }

    #[tokio::test]
    #[serial]
    async fn dropping_subscriptions_cleans_up_watch() {
        let _guard = keyspace_lock().lock();
        let _env = keyspace_env();
        let manager = ControllerWatchManager::with_keyspace(Keyspace::new("controller-watch-drop"));
        let sub_one = manager.subscribe("/podchaos");
        let sub_two = manager.subscribe("/podchaos");

        assert_eq!(manager.active_watches(), 1);

        drop(sub_one);
        assert_eq!(manager.active_watches(), 1);

        drop(sub_two);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.active_watches(), 0);
    }
}
