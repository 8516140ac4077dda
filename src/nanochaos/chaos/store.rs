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

//! Typed accessors for chaos resources and the per-pod aggregates, all in
//! the `chaos` keyspace partition. Status writers go through
//! compare-and-swap; the reconciler observes a monotonically non-decreasing
//! view of any single resource by retrying lost races with a fresh read.

use crate::nanochaos::chaos::object::{ChaosObject, ChaosSpec};
use crate::nanochaos::chaos::podiochaos::PodIoChaos;
use crate::nanochaos::chaos::podnetworkchaos::PodNetworkChaos;
use crate::nanochaos::k8s::store::normalize_namespace;
use crate::nanochaos::util::error::{is_conflict_error, new_error, with_context};
use crate::nanochaos::util::{is_missing_value_error, Keyspace};

use chrono::Utc;
use std::error::Error;

pub const CHAOS_KEYSPACE: Keyspace = Keyspace::new("chaos");
const UPDATE_RETRY_LIMIT: usize = 5;

/// Watch/list prefix for a kind, e.g. `/networkchaos`.
pub fn kind_prefix(kind: &str) -> String {
    format!("/{}", kind.to_lowercase())
}

fn chaos_key(kind: &str, namespace: Option<&str>, name: &str) -> String {
    format!(
        "{}/{}/{}",
        kind_prefix(kind),
        normalize_namespace(namespace),
        name
    )
}

pub fn get_chaos<S: ChaosSpec>(
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<ChaosObject<S>>, Box<dyn Error + Send + Sync>> {
    let key = chaos_key(S::KIND, namespace, name);
    let raw = match CHAOS_KEYSPACE.get(&key) {
        Ok(raw) => raw,
        Err(err) if is_missing_value_error(err.as_ref()) => return Ok(None),
        Err(err) => return Err(with_context(err, format!("Failed to load chaos '{}'", key))),
    };
    let chaos: ChaosObject<S> = serde_json::from_str(&raw)
        .map_err(|err| with_context(err, format!("Failed to deserialize chaos '{}'", key)))?;
    Ok(Some(chaos))
}

pub fn list_chaos<S: ChaosSpec>() -> Result<Vec<ChaosObject<S>>, Box<dyn Error + Send + Sync>> {
    let mut objects = Vec::new();
    for (key, raw, _) in CHAOS_KEYSPACE.list(&kind_prefix(S::KIND))? {
        let chaos: ChaosObject<S> = serde_json::from_str(&raw)
            .map_err(|err| with_context(err, format!("Failed to deserialize chaos '{}'", key)))?;
        objects.push(chaos);
    }
    Ok(objects)
}

/// Creates or replaces a chaos resource. The creation timestamp is stamped
/// on first write.
pub fn put_chaos<S: ChaosSpec>(
    chaos: &mut ChaosObject<S>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    if chaos.metadata.creation_timestamp.is_none() {
        chaos.metadata.creation_timestamp = Some(Utc::now());
    }
    let key = chaos_key(S::KIND, Some(chaos.namespace()), chaos.name());
    let raw = serde_json::to_string(chaos)
        .map_err(|err| with_context(err, format!("Failed to serialize chaos '{}'", key)))?;
    CHAOS_KEYSPACE.put(&key, &raw)?;
    Ok(())
}

/// Read-modify-write with optimistic concurrency; lost races re-read and
/// re-apply the mutation.
pub fn update_chaos_with<S: ChaosSpec, F>(
    namespace: Option<&str>,
    name: &str,
    mut mutate: F,
) -> Result<ChaosObject<S>, Box<dyn Error + Send + Sync>>
where
    F: FnMut(&mut ChaosObject<S>),
{
    let key = chaos_key(S::KIND, namespace, name);
    for _ in 0..UPDATE_RETRY_LIMIT {
        let (raw, version) = CHAOS_KEYSPACE
            .get_versioned(&key)
            .map_err(|err| with_context(err, format!("Failed to load chaos '{}'", key)))?;
        let mut chaos: ChaosObject<S> = serde_json::from_str(&raw)
            .map_err(|err| with_context(err, format!("Failed to deserialize chaos '{}'", key)))?;

        mutate(&mut chaos);

        let updated = serde_json::to_string(&chaos)
            .map_err(|err| with_context(err, format!("Failed to serialize chaos '{}'", key)))?;
        match CHAOS_KEYSPACE.put_if_version(&key, &updated, Some(version)) {
            Ok(_) => return Ok(chaos),
            Err(err) if is_conflict_error(err.as_ref()) => continue,
            Err(err) => return Err(err),
        }
    }

    Err(new_error(format!(
        "version conflict persisted after {} retries updating chaos '{}'",
        UPDATE_RETRY_LIMIT, key
    )))
}

/// Marks a chaos resource deleted the way the cluster manager does: the
/// deletion timestamp is set and reconcilers drive Recover; the object is
/// only removed once its finalizer list drains.
pub fn mark_chaos_deleted<S: ChaosSpec>(
    namespace: Option<&str>,
    name: &str,
) -> Result<ChaosObject<S>, Box<dyn Error + Send + Sync>> {
    update_chaos_with::<S, _>(namespace, name, |chaos| {
        if chaos.metadata.deletion_timestamp.is_none() {
            chaos.metadata.deletion_timestamp = Some(Utc::now());
        }
    })
}

/// Physically removes the object; legal only once finalizers are gone.
pub fn remove_chaos<S: ChaosSpec>(
    namespace: Option<&str>,
    name: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let key = chaos_key(S::KIND, namespace, name);
    CHAOS_KEYSPACE
        .delete(&key)
        .map_err(|err| with_context(err, format!("Failed to delete chaos '{}'", key)))
}

const POD_NETWORK_PREFIX: &str = "/podnetworkchaos";
const POD_IO_PREFIX: &str = "/podiochaos";

fn pod_network_key(namespace: Option<&str>, name: &str) -> String {
    format!(
        "{}/{}/{}",
        POD_NETWORK_PREFIX,
        normalize_namespace(namespace),
        name
    )
}

fn pod_io_key(namespace: Option<&str>, name: &str) -> String {
    format!(
        "{}/{}/{}",
        POD_IO_PREFIX,
        normalize_namespace(namespace),
        name
    )
}

/// Fetches a pod's network aggregate and its version for compare-and-set.
pub fn get_pod_network_chaos(
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<(PodNetworkChaos, u64)>, Box<dyn Error + Send + Sync>> {
    let key = pod_network_key(namespace, name);
    let (raw, version) = match CHAOS_KEYSPACE.get_versioned(&key) {
        Ok(found) => found,
        Err(err) if is_missing_value_error(err.as_ref()) => return Ok(None),
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to load aggregate '{}'", key),
            ))
        }
    };
    let aggregate: PodNetworkChaos = serde_json::from_str(&raw)
        .map_err(|err| with_context(err, format!("Failed to deserialize aggregate '{}'", key)))?;
    Ok(Some((aggregate, version)))
}

/// Single-writer-per-pod commit: the caller passes the version it read
/// (`None` for a fresh aggregate) and retries on conflict.
pub fn put_pod_network_chaos_if_version(
    aggregate: &PodNetworkChaos,
    expected: Option<u64>,
) -> Result<u64, Box<dyn Error + Send + Sync>> {
    let key = pod_network_key(
        aggregate.metadata.namespace.as_deref(),
        aggregate.metadata.name.as_deref().unwrap_or_default(),
    );
    let raw = serde_json::to_string(aggregate)
        .map_err(|err| with_context(err, format!("Failed to serialize aggregate '{}'", key)))?;
    CHAOS_KEYSPACE.put_if_version(&key, &raw, expected)
}

pub fn delete_pod_network_chaos(
    namespace: Option<&str>,
    name: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let key = pod_network_key(namespace, name);
    CHAOS_KEYSPACE
        .delete(&key)
        .map_err(|err| with_context(err, format!("Failed to delete aggregate '{}'", key)))
}

pub fn list_pod_network_chaos() -> Result<Vec<PodNetworkChaos>, Box<dyn Error + Send + Sync>> {
    let mut aggregates = Vec::new();
    for (key, raw, _) in CHAOS_KEYSPACE.list(POD_NETWORK_PREFIX)? {
        let aggregate: PodNetworkChaos = serde_json::from_str(&raw).map_err(|err| {
            with_context(err, format!("Failed to deserialize aggregate '{}'", key))
        })?;
        aggregates.push(aggregate);
    }
    Ok(aggregates)
}

pub fn get_pod_io_chaos(
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<(PodIoChaos, u64)>, Box<dyn Error + Send + Sync>> {
    let key = pod_io_key(namespace, name);
    let (raw, version) = match CHAOS_KEYSPACE.get_versioned(&key) {
        Ok(found) => found,
        Err(err) if is_missing_value_error(err.as_ref()) => return Ok(None),
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to load aggregate '{}'", key),
            ))
        }
    };
    let aggregate: PodIoChaos = serde_json::from_str(&raw)
        .map_err(|err| with_context(err, format!("Failed to deserialize aggregate '{}'", key)))?;
    Ok(Some((aggregate, version)))
}

pub fn put_pod_io_chaos_if_version(
    aggregate: &PodIoChaos,
    expected: Option<u64>,
) -> Result<u64, Box<dyn Error + Send + Sync>> {
    let key = pod_io_key(
        aggregate.metadata.namespace.as_deref(),
        aggregate.metadata.name.as_deref().unwrap_or_default(),
    );
    let raw = serde_json::to_string(aggregate)
        .map_err(|err| with_context(err, format!("Failed to serialize aggregate '{}'", key)))?;
    CHAOS_KEYSPACE.put_if_version(&key, &raw, expected)
}

pub fn delete_pod_io_chaos(
    namespace: Option<&str>,
    name: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let key = pod_io_key(namespace, name);
    CHAOS_KEYSPACE
        .delete(&key)
        .map_err(|err| with_context(err, format!("Failed to delete aggregate '{}'", key)))
}
