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

use crate::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use crate::nanochaos::chaos::status::ChaosStatus;
use crate::nanochaos::chaos::{CLEAN_FINALIZER_ANNOTATION_KEY, CLEAN_FINALIZER_FORCED, PAUSE_ANNOTATION_KEY};
use crate::nanochaos::k8s::pod::ObjectMeta;
use crate::nanochaos::util::parse_signed_duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::time::Duration;

pub const API_VERSION: &str = "chaos-mesh.org/v1alpha1";

/// Schedule of a chaos experiment: a six-field extended cron expression
/// with `@every <duration>` and `@hourly` shorthand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSpec {
    pub cron: String,
}

/// Implemented by every kind-specific spec. The two-phase reconciler and
/// the selector engine only ever see this surface.
pub trait ChaosSpec:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
    /// Declared kind string, e.g. `NetworkChaos`.
    const KIND: &'static str;

    fn selector(&self) -> &SelectorSpec;
    fn mode(&self) -> PodMode;
    fn value(&self) -> Option<&str>;
    fn duration_text(&self) -> Option<&str>;
    fn scheduler(&self) -> Option<&SchedulerSpec>;

    /// Action recorded on pod records; empty for kinds without an action
    /// enum (time, kernel, stress).
    fn action_name(&self) -> String {
        String::new()
    }
}

/// A declarative chaos experiment: identity, kind-specific spec and the
/// status block owned by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChaosObject<S> {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: ChaosStatus,
}

impl<S: ChaosSpec> ChaosObject<S> {
    pub fn new(metadata: ObjectMeta, spec: S) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: S::KIND.to_string(),
            metadata,
            spec,
            status: ChaosStatus::default(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// `<namespace>/<name>`, the aggregation source tag and finalizer key
    /// format.
    pub fn source_key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.metadata
            .annotations
            .get(PAUSE_ANNOTATION_KEY)
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    pub fn is_forced_cleanup(&self) -> bool {
        self.metadata
            .annotations
            .get(CLEAN_FINALIZER_ANNOTATION_KEY)
            .map(|value| value == CLEAN_FINALIZER_FORCED)
            .unwrap_or(false)
    }

    /// Parses `spec.duration`; `Ok(None)` when the experiment runs until
    /// deletion.
    pub fn get_duration(&self) -> Result<Option<Duration>, Box<dyn Error + Send + Sync>> {
        match self.spec.duration_text() {
            Some(text) => {
                let (_, duration) = parse_signed_duration(text)?;
                Ok(Some(duration))
            }
            None => Ok(None),
        }
    }

    pub fn next_start(&self) -> Option<DateTime<Utc>> {
        self.status.scheduler.next_start
    }

    pub fn set_next_start(&mut self, at: Option<DateTime<Utc>>) {
        self.status.scheduler.next_start = at;
    }

    pub fn next_recover(&self) -> Option<DateTime<Utc>> {
        self.status.scheduler.next_recover
    }

    pub fn set_next_recover(&mut self, at: Option<DateTime<Utc>>) {
        self.status.scheduler.next_recover = at;
    }

    /// Adds a per-target finalizer; duplicates are a no-op so repeated
    /// Apply calls stay idempotent.
    pub fn insert_finalizer(&mut self, key: &str) {
        if !self.metadata.finalizers.iter().any(|entry| entry == key) {
            self.metadata.finalizers.push(key.to_string());
        }
    }

    /// Removes a per-target finalizer once its cleanup succeeded.
    pub fn remove_finalizer(&mut self, key: &str) {
        self.metadata.finalizers.retain(|entry| entry != key);
    }
}
