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

//! The controller runtime: one worker per chaos kind driving its
//! reconciler from watch events, plus the aggregate watchers that
//! materialize PodNetworkChaos/PodIoChaos onto the node agents and the
//! collector feed. Within a worker, reconciles for the kind run one at a
//! time, so a single resource is never reconciled concurrently; across
//! kinds workers are independent.

use crate::nanochaos::chaos::store::{kind_prefix, CHAOS_KEYSPACE};
use crate::nanochaos::collector;
use crate::nanochaos::controller::router::{InjectorRegistry, KindReconciler};
use crate::nanochaos::controller::watch::ControllerWatchManager;
use crate::nanochaos::controller::ControllerContext;
use crate::nanochaos::injector::iochaos::apply_io_aggregate;
use crate::nanochaos::logger::{log_error, log_info, log_warn};
use crate::nanochaos::network::materialize::apply_aggregate;
use crate::nanochaos::scheduler::{JobResult, ScheduleSpec, Scheduler};
use crate::nanochaos::util::KeyspaceEventType;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "controller-runtime";
const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(10);
const POD_NETWORK_PREFIX: &str = "/podnetworkchaos";
const POD_IO_PREFIX: &str = "/podiochaos";

pub struct ControllerRuntime {
    ctx: Arc<ControllerContext>,
    registry: Arc<InjectorRegistry>,
    shutdown: CancellationToken,
}

impl ControllerRuntime {
    pub fn new(ctx: Arc<ControllerContext>, registry: Arc<InjectorRegistry>) -> Self {
        Self {
            ctx,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs every worker until shutdown. In-flight reconciles finish
    /// before the call returns.
    pub async fn run(&self) -> Result<(), DynError> {
        if let Ok(cleaned) = collector::clean_incomplete_events() {
            if cleaned > 0 {
                log_info(
                    COMPONENT,
                    "closed incomplete collector events from previous run",
                    &[("count", &cleaned.to_string())],
                );
            }
        }

        let mut handles = Vec::new();

        for kind in self.registry.kinds() {
            let reconciler = self
                .registry
                .lookup(kind)
                .expect("registered kind has a reconciler");
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                kind_worker(kind, reconciler, ctx, shutdown).await;
            }));
        }

        {
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                aggregate_worker(POD_NETWORK_PREFIX, ctx, shutdown).await;
            }));
        }
        {
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                aggregate_worker(POD_IO_PREFIX, ctx, shutdown).await;
            }));
        }
        {
            let shutdown = self.shutdown.clone();
            let kinds = self.registry.kinds();
            handles.push(tokio::spawn(async move {
                collector_worker(kinds, shutdown).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Splits a chaos keyspace key `/<kind>/<ns>/<name>` into its coordinates.
fn split_object_key(key: &str) -> Option<(String, String)> {
    let mut parts = key.trim_start_matches('/').splitn(3, '/');
    let _kind = parts.next()?;
    let namespace = parts.next()?.to_string();
    let name = parts.next()?.to_string();
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

async fn kind_worker(
    kind: &'static str,
    reconciler: Arc<dyn KindReconciler>,
    ctx: Arc<ControllerContext>,
    shutdown: CancellationToken,
) {
    let manager = ControllerWatchManager::shared();
    let mut subscription = manager.subscribe(&kind_prefix(kind));
    let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<String>();

    // Cold start: every existing resource gets one reconcile so state
    // interrupted by a restart converges again.
    match CHAOS_KEYSPACE.list(&kind_prefix(kind)) {
        Ok(entries) => {
            for (key, _, _) in entries {
                let _ = requeue_tx.send(key);
            }
        }
        Err(err) => log_warn(
            COMPONENT,
            "failed to list existing resources on boot",
            &[("kind", kind), ("error", &err.to_string())],
        ),
    }

    log_info(COMPONENT, "kind worker started", &[("kind", kind)]);

    loop {
        let key = tokio::select! {
            _ = shutdown.cancelled() => break,
            key = requeue_rx.recv() => match key {
                Some(key) => key,
                None => break,
            },
            event = subscription.recv() => match event {
                Some(event) => event.key,
                None => break,
            },
        };

        let (namespace, name) = match split_object_key(&key) {
            Some(parsed) => parsed,
            None => continue,
        };

        let deadline = ctx.cfg.rpc_timeout;
        let result = tokio::time::timeout(
            deadline,
            reconciler.reconcile(&ctx, &namespace, &name),
        )
        .await;

        match result {
            Ok(Ok(outcome)) => {
                if let Some(delay) = outcome.requeue_after {
                    schedule_requeue(requeue_tx.clone(), key, delay);
                }
            }
            Ok(Err(err)) => {
                log_error(
                    COMPONENT,
                    "reconcile failed",
                    &[("kind", kind), ("key", &key), ("error", &err.to_string())],
                );
                schedule_requeue(requeue_tx.clone(), key, ERROR_REQUEUE_DELAY);
            }
            Err(_) => {
                log_error(
                    COMPONENT,
                    "reconcile deadline exceeded",
                    &[("kind", kind), ("key", &key)],
                );
                schedule_requeue(requeue_tx.clone(), key, ERROR_REQUEUE_DELAY);
            }
        }
    }

    log_info(COMPONENT, "kind worker stopped", &[("kind", kind)]);
}

fn schedule_requeue(tx: mpsc::UnboundedSender<String>, key: String, delay: Duration) {
    Scheduler::global().schedule(
        ScheduleSpec::After {
            label: "controller.requeue",
            delay,
        },
        move |_| {
            let tx = tx.clone();
            let key = key.clone();
            Box::pin(async move {
                let _ = tx.send(key);
                JobResult::Stop
            })
        },
    );
}

/// Watches one aggregate prefix and re-materializes the node state for the
/// owning pod on every change.
async fn aggregate_worker(
    prefix: &'static str,
    ctx: Arc<ControllerContext>,
    shutdown: CancellationToken,
) {
    let manager = ControllerWatchManager::shared();
    let mut subscription = manager.subscribe(prefix);

    log_info(COMPONENT, "aggregate worker started", &[("prefix", prefix)]);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if event.event_type == KeyspaceEventType::Deleted {
            // The pod (and its namespaces) are gone; nothing to push.
            continue;
        }

        let (namespace, name) = match split_object_key(&event.key) {
            Some(parsed) => parsed,
            None => continue,
        };

        let result: Result<(), DynError> = if prefix == POD_NETWORK_PREFIX {
            match event
                .value
                .as_deref()
                .map(serde_json::from_str::<crate::nanochaos::chaos::podnetworkchaos::PodNetworkChaos>)
            {
                Some(Ok(aggregate)) => apply_aggregate(&aggregate, ctx.daemon.as_ref()).await,
                Some(Err(err)) => Err(Box::new(err) as DynError),
                None => Ok(()),
            }
        } else {
            apply_io_aggregate(&namespace, &name, ctx.daemon.as_ref()).await
        };

        if let Err(err) = result {
            log_warn(
                COMPONENT,
                "failed to materialize aggregate",
                &[("key", event.key.as_str()), ("error", &err.to_string())],
            );
        }
    }

    log_info(COMPONENT, "aggregate worker stopped", &[("prefix", prefix)]);
}

/// Feeds every chaos kind's watch events into the collector, one loop per
/// kind.
async fn collector_worker(kinds: Vec<&'static str>, shutdown: CancellationToken) {
    let manager = ControllerWatchManager::shared();
    log_info(COMPONENT, "collector worker started", &[]);

    let mut handles = Vec::new();
    for kind in kinds {
        let mut subscription = manager.subscribe(&kind_prefix(kind));
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => collector::observe(&event),
                        None => break,
                    },
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    log_info(COMPONENT, "collector worker stopped", &[]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_split_into_coordinates() {
        assert_eq!(
            split_object_key("/networkchaos/default/net-demo"),
            Some(("default".to_string(), "net-demo".to_string()))
        );
        assert_eq!(split_object_key("/networkchaos/default"), None);
        assert_eq!(split_object_key("/x//name"), None);
    }
}
