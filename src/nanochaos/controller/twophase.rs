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

//! The generic two-phase experiment reconciler: it drives a chaos resource
//! through Waiting/Running/Paused/Failed/Finished according to its
//! schedule, duration, pause annotation and deletion timestamp. Apply and
//! Recover are idempotent, so a reconcile interrupted anywhere can simply
//! run again.

use crate::nanochaos::chaos::object::{ChaosObject, ChaosSpec};
use crate::nanochaos::chaos::status::ExperimentPhase;
use crate::nanochaos::chaos::store::{get_chaos, remove_chaos, update_chaos_with};
use crate::nanochaos::controller::{ControllerContext, ReconcileOutcome};
use crate::nanochaos::k8s::event::{
    record_chaos_event, EVENT_TYPE_WARNING, REASON_CHAOS_INJECT_FAILED,
};
use crate::nanochaos::logger::{log_error, log_info, log_warn};
use crate::nanochaos::scheduler::next_time;
use crate::nanochaos::util::error::new_error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::error::Error;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "twophase";

/// Per-kind Apply/Recover implementation. Both receive the object mutably
/// to maintain pod records, per-target finalizers and fault instances;
/// the reconciler persists whatever they leave behind, success or failure.
#[async_trait]
pub trait KindInjector<S: ChaosSpec>: Send + Sync {
    async fn apply(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<S>,
    ) -> Result<(), DynError>;

    async fn recover(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<S>,
    ) -> Result<(), DynError>;
}

pub struct TwoPhaseReconciler<S: ChaosSpec> {
    injector: Arc<dyn KindInjector<S>>,
    _spec: PhantomData<fn() -> S>,
}

impl<S: ChaosSpec> TwoPhaseReconciler<S> {
    pub fn new(injector: Arc<dyn KindInjector<S>>) -> Self {
        Self {
            injector,
            _spec: PhantomData,
        }
    }

    pub async fn reconcile(
        &self,
        ctx: &ControllerContext,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, DynError> {
        let now = Utc::now();

        let mut chaos = match get_chaos::<S>(Some(namespace), name)? {
            Some(chaos) => chaos,
            None => return Ok(ReconcileOutcome::done()),
        };
        let before = chaos.clone();

        let outcome = self.step(ctx, &mut chaos, now).await;

        // Persist status and finalizers even when the step failed; phase
        // Failed is user-visible state, not an internal retry artifact.
        if chaos != before {
            let status = chaos.status.clone();
            let finalizers = chaos.metadata.finalizers.clone();
            update_chaos_with::<S, _>(Some(namespace), name, |fresh| {
                fresh.status = status.clone();
                fresh.metadata.finalizers = finalizers.clone();
            })?;
        }

        // A fully recovered, deleted object leaves the store once its
        // per-target checklist has drained.
        if chaos.is_deleted()
            && chaos.metadata.finalizers.is_empty()
            && chaos.status.experiment.phase == ExperimentPhase::Finished
        {
            remove_chaos::<S>(Some(namespace), name)?;
        }

        outcome
    }

    async fn step(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<S>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, DynError> {
        let duration = chaos.get_duration()?;

        if chaos.is_deleted() {
            log_info(
                COMPONENT,
                "removing chaos, recovering targets",
                &[("chaos", &chaos.source_key())],
            );
            self.injector.recover(ctx, chaos).await?;
            chaos.status.experiment.phase = ExperimentPhase::Finished;
            chaos.status.experiment.end_time = Some(now);
            return Ok(ReconcileOutcome::done());
        }

        if chaos.is_paused() {
            if chaos.status.experiment.phase == ExperimentPhase::Running {
                log_info(COMPONENT, "pausing", &[("chaos", &chaos.source_key())]);
                self.injector.recover(ctx, chaos).await?;
                chaos.status.experiment.end_time = Some(now);
                if let Some(start) = chaos.status.experiment.start_time {
                    chaos.status.experiment.duration =
                        Some(format_duration(now - start));
                }
            }
            chaos.status.experiment.phase = ExperimentPhase::Paused;
            return Ok(ReconcileOutcome::done());
        }

        let scheduler = match chaos.spec.scheduler() {
            Some(scheduler) => scheduler.clone(),
            // One-shot: run once and stay Running until deletion (or a
            // pause round-trip, which re-applies here). Failed rounds are
            // retried on the next requeue.
            None => {
                if matches!(
                    chaos.status.experiment.phase,
                    ExperimentPhase::Waiting | ExperimentPhase::Paused | ExperimentPhase::Failed
                ) {
                    self.apply_action(ctx, chaos, duration.unwrap_or_default(), now)
                        .await?;
                }
                return Ok(ReconcileOutcome::done());
            }
        };

        let duration = duration.ok_or_else(|| {
            new_error("scheduler is set but duration is missing; rejected at admission")
        })?;

        if let Some(next_recover) = chaos.next_recover() {
            if next_recover <= now {
                // The round is over; paused experiments were already
                // recovered on the pause transition.
                if chaos.status.experiment.phase != ExperimentPhase::Paused {
                    log_info(COMPONENT, "recovering", &[("chaos", &chaos.source_key())]);
                    self.injector.recover(ctx, chaos).await?;
                }
                chaos.set_next_recover(None);
                chaos.status.experiment.end_time = Some(now);
                chaos.status.experiment.phase = ExperimentPhase::Waiting;
                return Ok(ReconcileOutcome::done());
            }

            if chaos.status.experiment.phase == ExperimentPhase::Paused {
                // Resume mid-round: re-apply with the remaining duration.
                let remaining = (next_recover - now)
                    .to_std()
                    .unwrap_or_else(|_| Duration::from_secs(0));
                log_info(COMPONENT, "resuming", &[("chaos", &chaos.source_key())]);
                self.apply_action(ctx, chaos, remaining, now).await?;
                return Ok(ReconcileOutcome::done());
            }
        }

        let next_start_due = chaos
            .next_start()
            .map(|next_start| next_start <= now)
            .unwrap_or(true);
        if next_start_due {
            let next_start = next_time(&scheduler, now)?;
            let next_recover = now
                + chrono::Duration::from_std(duration)
                    .map_err(|e| new_error(format!("duration out of range: {}", e)))?;

            if next_start < next_recover {
                let err = new_error(format!(
                    "schedule is too tight: next recover {} would land after next start {}",
                    next_recover, next_start
                ));
                log_error(
                    COMPONENT,
                    "recover can never be reached",
                    &[
                        ("chaos", &chaos.source_key()),
                        ("nextRecover", &next_recover.to_rfc3339()),
                        ("nextStart", &next_start.to_rfc3339()),
                    ],
                );
                chaos.status.experiment.phase = ExperimentPhase::Failed;
                chaos.status.experiment.reason = err.to_string();
                return Err(err);
            }

            self.apply_action(ctx, chaos, duration, now).await?;
            chaos.set_next_start(Some(next_start));
            chaos.set_next_recover(Some(next_recover));
            return Ok(ReconcileOutcome::done());
        }

        // Nothing due yet: requeue at the earliest upcoming transition.
        let mut next = chaos.next_start().unwrap_or(now);
        if let Some(next_recover) = chaos.next_recover() {
            if next_recover < next {
                next = next_recover;
            }
        }
        let delay = (next - now).to_std().unwrap_or_else(|_| Duration::from_secs(0));
        Ok(ReconcileOutcome::requeue_after(delay))
    }

    async fn apply_action(
        &self,
        ctx: &ControllerContext,
        chaos: &mut ChaosObject<S>,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), DynError> {
        log_info(
            COMPONENT,
            "performing action",
            &[("chaos", &chaos.source_key())],
        );

        if let Err(err) = self.injector.apply(ctx, chaos).await {
            log_warn(
                COMPONENT,
                "failed to apply chaos action",
                &[("chaos", &chaos.source_key()), ("error", &err.to_string())],
            );
            chaos.status.experiment.phase = ExperimentPhase::Failed;
            chaos.status.experiment.reason = err.to_string();
            record_chaos_event(
                S::KIND,
                chaos.namespace(),
                chaos.name(),
                EVENT_TYPE_WARNING,
                REASON_CHAOS_INJECT_FAILED,
                &err.to_string(),
            )
            .await;
            return Err(err);
        }

        chaos.status.experiment.phase = ExperimentPhase::Running;
        chaos.status.experiment.reason = String::new();
        chaos.status.experiment.start_time = Some(now);
        chaos.status.experiment.end_time = None;
        if !duration.is_zero() {
            chaos.status.experiment.duration =
                Some(humantime::format_duration(duration).to_string());
        }
        Ok(())
    }
}

fn format_duration(delta: chrono::Duration) -> String {
    let std = delta.to_std().unwrap_or_else(|_| Duration::from_secs(0));
    humantime::format_duration(Duration::from_secs(std.as_secs())).to_string()
}
