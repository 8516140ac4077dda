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

use crate::nanochaos::chaos::object::{ChaosObject, ChaosSpec, SchedulerSpec};
use crate::nanochaos::chaos::selector::{PodMode, SelectorSpec};
use crate::nanochaos::chaos::KIND_STRESS_CHAOS;
use crate::nanochaos::util::error::new_error;

use serde::{Deserialize, Serialize};
use std::error::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryStressor {
    /// Worker count applying the stressor.
    pub workers: u32,
    /// Total memory to occupy, e.g. `256MB`; absent means stress-ng's
    /// default per-worker allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Extra raw stress-ng options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CpuStressor {
    pub workers: u32,
    /// Percent load per worker, 0..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Stressors {
    #[serde(rename = "memory", default, skip_serializing_if = "Option::is_none")]
    pub memory_stressor: Option<MemoryStressor>,
    #[serde(rename = "cpu", default, skip_serializing_if = "Option::is_none")]
    pub cpu_stressor: Option<CpuStressor>,
}

impl Stressors {
    /// Normalizes the stressors into a stress-ng argument fragment.
    pub fn normalize(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut args: Vec<String> = Vec::new();

        if let Some(memory) = &self.memory_stressor {
            if memory.workers == 0 {
                return Err(new_error("memory stressor requires at least one worker"));
            }
            args.push(format!("--vm {} --vm-keep", memory.workers));
            if let Some(size) = &memory.size {
                args.push(format!("--vm-bytes {}", size));
            }
            args.extend(memory.options.iter().cloned());
        }

        if let Some(cpu) = &self.cpu_stressor {
            if cpu.workers == 0 {
                return Err(new_error("cpu stressor requires at least one worker"));
            }
            args.push(format!("--cpu {}", cpu.workers));
            if let Some(load) = cpu.load {
                args.push(format!("--cpu-load {}", load));
            }
            args.extend(cpu.options.iter().cloned());
        }

        if args.is_empty() {
            return Err(new_error("at least one stressor should be specified"));
        }

        Ok(args.join(" "))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StressChaosSpec {
    #[serde(default)]
    pub mode: PodMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub selector: SelectorSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stressors: Option<Stressors>,
    /// Raw stress-ng dialect; wins over `stressors` when both are set.
    #[serde(
        rename = "stressngStressors",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub stressng_stressors: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

impl StressChaosSpec {
    /// The stress-ng argument fragment actually executed.
    pub fn effective_stressors(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        if !self.stressng_stressors.is_empty() {
            return Ok(self.stressng_stressors.clone());
        }
        match &self.stressors {
            Some(stressors) => stressors.normalize(),
            None => Err(new_error("at least one stressor should be specified")),
        }
    }
}

impl ChaosSpec for StressChaosSpec {
    const KIND: &'static str = KIND_STRESS_CHAOS;

    fn selector(&self) -> &SelectorSpec {
        &self.selector
    }

    fn mode(&self) -> PodMode {
        self.mode
    }

    fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn duration_text(&self) -> Option<&str> {
        self.duration.as_deref()
    }

    fn scheduler(&self) -> Option<&SchedulerSpec> {
        self.scheduler.as_ref()
    }
}

pub type StressChaos = ChaosObject<StressChaosSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_builds_stress_ng_fragment() {
        let stressors = Stressors {
            memory_stressor: Some(MemoryStressor {
                workers: 4,
                size: Some("256MB".to_string()),
                options: vec![],
            }),
            cpu_stressor: Some(CpuStressor {
                workers: 2,
                load: Some(75),
                options: vec![],
            }),
        };
        let fragment = stressors.normalize().expect("normalize");
        assert_eq!(
            fragment,
            "--vm 4 --vm-keep --vm-bytes 256MB --cpu 2 --cpu-load 75"
        );
    }

    #[test]
    fn raw_stressors_win_over_structured() {
        let spec = StressChaosSpec {
            stressors: Some(Stressors {
                cpu_stressor: Some(CpuStressor {
                    workers: 1,
                    load: None,
                    options: vec![],
                }),
                memory_stressor: None,
            }),
            stressng_stressors: "--io 4 --hdd 2".to_string(),
            ..Default::default()
        };
        assert_eq!(spec.effective_stressors().expect("effective"), "--io 4 --hdd 2");
    }

    #[test]
    fn empty_stressors_are_rejected() {
        assert!(Stressors::default().normalize().is_err());
        assert!(StressChaosSpec::default().effective_stressors().is_err());
    }
}
