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

//! Cron-as-iterator schedule computation plus a small task scheduler for
//! immediate/delayed jobs. Reconcilers never own long-lived timers; they
//! compute the next firing time and requeue.

use crate::nanochaos::chaos::object::SchedulerSpec;
use crate::nanochaos::util::error::{new_error, with_context};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures_util::future::FutureExt;
use std::error::Error;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// A parsed chaos schedule: either a fixed interval (`@every 10s`) or a
/// six-field cron expression (`@hourly` and friends included).
#[derive(Clone, Debug)]
pub enum ChaosSchedule {
    Every(Duration),
    Cron(Box<CronSchedule>),
}

impl ChaosSchedule {
    pub fn parse(expression: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(new_error("cron expression must not be empty"));
        }

        if let Some(interval) = trimmed.strip_prefix("@every ") {
            let duration = humantime::parse_duration(interval.trim())
                .map_err(|e| with_context(e, format!("Invalid @every interval '{}'", interval)))?;
            if duration.is_zero() {
                return Err(new_error("@every interval must be greater than zero"));
            }
            return Ok(ChaosSchedule::Every(duration));
        }

        let schedule = CronSchedule::from_str(trimmed, chrono_tz::UTC)
            .map_err(|e| with_context(e, format!("Invalid cron expression '{}'", trimmed)))?;
        Ok(ChaosSchedule::Cron(Box::new(schedule)))
    }

    /// The next firing time strictly after `now`.
    pub fn next_after(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, Box<dyn Error + Send + Sync>> {
        match self {
            ChaosSchedule::Every(interval) => {
                let delta = ChronoDuration::from_std(*interval)
                    .map_err(|e| with_context(e, "@every interval out of range"))?;
                Ok(now + delta)
            }
            ChaosSchedule::Cron(schedule) => schedule
                .next_after(now)
                .ok_or_else(|| new_error("cron schedule has no future firing time")),
        }
    }
}

/// Computes the next firing time for a chaos scheduler spec.
pub fn next_time(
    spec: &SchedulerSpec,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, Box<dyn Error + Send + Sync>> {
    ChaosSchedule::parse(&spec.cron)?.next_after(now)
}

#[derive(Clone)]
pub struct CronSchedule {
    expression: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    pub fn new(expression: Schedule, timezone: Tz) -> Self {
        Self {
            expression,
            timezone,
        }
    }

    pub fn from_str(expression: &str, timezone: Tz) -> Result<Self, cron::error::Error> {
        Schedule::from_str(expression).map(|schedule| Self::new(schedule, timezone))
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz_after = self.timezone.from_utc_datetime(&after.naive_utc());
        self.expression
            .after(&tz_after)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl std::fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression.to_string())
            .field("timezone", &self.timezone)
            .finish()
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    Stop,
    Continue,
}

#[derive(Clone)]
pub struct ScheduleContext {
    task_id: TaskId,
    label: &'static str,
    cancellation: CancellationToken,
}

impl ScheduleContext {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    #[cfg(test)]
    pub fn label(&self) -> &'static str {
        self.label
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(u64);

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    next_id: AtomicU64,
}

#[derive(Clone, Debug)]
pub enum ScheduleSpec {
    Immediate {
        label: &'static str,
    },
    After {
        label: &'static str,
        delay: Duration,
    },
}

type JobFn = dyn Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static;

pub struct ScheduledTaskHandle {
    cancellation: CancellationToken,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn global() -> Scheduler {
        static INSTANCE: OnceLock<Scheduler> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Scheduler {
                inner: Arc::new(SchedulerInner {
                    next_id: AtomicU64::new(1),
                }),
            })
            .clone()
    }

    pub fn schedule<F>(&self, spec: ScheduleSpec, job: F) -> ScheduledTaskHandle
    where
        F: Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static,
    {
        let job = Arc::new(job) as Arc<JobFn>;
        let task_id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancellation = CancellationToken::new();
        let join_handle = self.spawn_for_spec(task_id, &cancellation, spec, job);
        ScheduledTaskHandle {
            cancellation,
            join: Arc::new(Mutex::new(Some(join_handle))),
        }
    }

    fn spawn_for_spec(
        &self,
        task_id: TaskId,
        cancellation: &CancellationToken,
        spec: ScheduleSpec,
        job: Arc<JobFn>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let cancellation = cancellation.clone();

        match spec {
            ScheduleSpec::Immediate { label } => {
                let ctx = ScheduleContext {
                    task_id,
                    label,
                    cancellation: cancellation.clone(),
                };
                tokio::spawn(async move {
                    scheduler.run_job(job, ctx).await;
                })
            }
            ScheduleSpec::After { label, delay } => {
                tokio::spawn(async move {
                    let sleeper = time::sleep(delay);
                    tokio::pin!(sleeper);
                    tokio::select! {
                        _ = cancellation.cancelled() => return,
                        _ = sleeper.as_mut() => {}
                    }

                    if cancellation.is_cancelled() {
                        return;
                    }

                    let ctx = ScheduleContext {
                        task_id,
                        label,
                        cancellation: cancellation.clone(),
                    };
                    let _ = scheduler.run_job(job, ctx).await;
                })
            }
        }
    }

    async fn run_job(&self, job: Arc<JobFn>, ctx: ScheduleContext) -> JobResult {
        if ctx.cancellation.is_cancelled() {
            return JobResult::Stop;
        }

        AssertUnwindSafe((job.clone())(ctx.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                log::error!(
                    "Task {:?} ({}) panicked; stopping task",
                    ctx.task_id,
                    ctx.label
                );
                JobResult::Stop
            })
    }
}

impl ScheduledTaskHandle {
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn abort(&self) {
        if let Some(handle) = self
            .join
            .lock()
            .expect("scheduler join lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    pub fn cancel_and_abort(&self) {
        self.cancel();
        self.abort();
    }

    #[cfg(test)]
    pub async fn join(&self) -> Result<(), tokio::task::JoinError> {
        let maybe_handle = self
            .join
            .lock()
            .expect("scheduler join lock poisoned")
            .take();
        if let Some(handle) = maybe_handle {
            handle.await.map(|_| ())
        } else {
            Ok(())
        }
    }
}
