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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::pod::ObjectMeta;
use super::store::normalize_namespace;

const DEFAULT_EVENT_RETENTION: usize = 1024;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

pub const REASON_CHAOS_INJECTED: &str = "ChaosInjected";
pub const REASON_CHAOS_RECOVERED: &str = "ChaosRecovered";
pub const REASON_CHAOS_INJECT_FAILED: &str = "ChaosInjectFailed";
pub const REASON_CHAOS_RECOVER_FAILED: &str = "ChaosRecoverFailed";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObjectReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Minimal core/v1-style Event emitted on every Apply/Recover start and
/// terminal outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "lastTimestamp", skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
}

struct EventStore {
    records: VecDeque<Event>,
    capacity: usize,
}

impl EventStore {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, event: Event) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(event);
    }
}

pub struct EventRegistry {
    store: RwLock<EventStore>,
    resource_counter: AtomicU64,
}

impl EventRegistry {
    pub fn shared() -> Arc<Self> {
        static INSTANCE: OnceLock<Arc<EventRegistry>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| {
                Arc::new(Self {
                    store: RwLock::new(EventStore::new(DEFAULT_EVENT_RETENTION)),
                    resource_counter: AtomicU64::new(1),
                })
            })
            .clone()
    }

    pub async fn record(&self, mut event: Event) -> Event {
        let resource_version = self.resource_counter.fetch_add(1, Ordering::SeqCst);
        event.metadata.resource_version = Some(resource_version.to_string());
        event.metadata.name = Some(format!("event-{}", resource_version));
        if event.metadata.namespace.is_none() {
            let namespace = event
                .involved_object
                .namespace
                .as_deref()
                .map(|ns| normalize_namespace(Some(ns)))
                .unwrap_or_else(|| "default".to_string());
            event.metadata.namespace = Some(namespace);
        }
        if event.last_timestamp.is_none() {
            event.last_timestamp = Some(Utc::now());
        }
        if event.count.is_none() {
            event.count = Some(1);
        }

        let cloned = event.clone();
        let mut store = self.store.write().await;
        store.push(event);
        cloned
    }

    pub async fn list(&self, namespace: Option<&str>) -> Vec<Event> {
        let namespace = namespace.map(|ns| normalize_namespace(Some(ns)));
        let store = self.store.read().await;
        store
            .records
            .iter()
            .filter(|event| match namespace.as_deref() {
                Some(expected) => {
                    event.metadata.namespace.as_deref().unwrap_or("default") == expected
                }
                None => true,
            })
            .cloned()
            .collect()
    }
}

/// Records an event against a chaos resource the way the per-kind
/// reconcilers do on inject/recover transitions.
pub async fn record_chaos_event(
    kind: &str,
    namespace: &str,
    name: &str,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    let registry = EventRegistry::shared();
    registry
        .record(Event {
            api_version: "v1".to_string(),
            kind: "Event".to_string(),
            metadata: ObjectMeta::default(),
            involved_object: ObjectReference {
                kind: Some(kind.to_string()),
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: None,
            },
            reason: Some(reason.to_string()),
            message: if message.is_empty() {
                None
            } else {
                Some(message.to_string())
            },
            event_type: Some(event_type.to_string()),
            last_timestamp: None,
            count: None,
        })
        .await;
}
