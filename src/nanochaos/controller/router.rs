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

//! Dispatch by kind: a registry from kind string to reconciler, resolved
//! at reconcile time. Registration, not inheritance.

use crate::nanochaos::chaos::iochaos::IoChaosSpec;
use crate::nanochaos::chaos::kernelchaos::KernelChaosSpec;
use crate::nanochaos::chaos::networkchaos::NetworkChaosSpec;
use crate::nanochaos::chaos::object::ChaosSpec;
use crate::nanochaos::chaos::podchaos::PodChaosSpec;
use crate::nanochaos::chaos::stresschaos::StressChaosSpec;
use crate::nanochaos::chaos::timechaos::TimeChaosSpec;
use crate::nanochaos::controller::twophase::{KindInjector, TwoPhaseReconciler};
use crate::nanochaos::controller::{ControllerContext, ReconcileOutcome};
use crate::nanochaos::injector::iochaos::IoChaosInjector;
use crate::nanochaos::injector::kernelchaos::KernelChaosInjector;
use crate::nanochaos::injector::networkchaos::NetworkChaosInjector;
use crate::nanochaos::injector::podchaos::PodChaosInjector;
use crate::nanochaos::injector::stresschaos::StressChaosInjector;
use crate::nanochaos::injector::timechaos::TimeChaosInjector;

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

type DynError = Box<dyn Error + Send + Sync>;

/// A reconciler bound to one declared kind.
#[async_trait]
pub trait KindReconciler: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn reconcile(
        &self,
        ctx: &ControllerContext,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, DynError>;
}

struct Registered<S: ChaosSpec> {
    reconciler: TwoPhaseReconciler<S>,
}

#[async_trait]
impl<S: ChaosSpec> KindReconciler for Registered<S> {
    fn kind(&self) -> &'static str {
        S::KIND
    }

    async fn reconcile(
        &self,
        ctx: &ControllerContext,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, DynError> {
        self.reconciler.reconcile(ctx, namespace, name).await
    }
}

#[derive(Default)]
pub struct InjectorRegistry {
    entries: HashMap<&'static str, Arc<dyn KindReconciler>>,
}

impl InjectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the stock injector set: pod, network, time, io, kernel
    /// and stress kinds.
    pub fn with_default_kinds() -> Self {
        let mut registry = Self::new();
        registry.register::<PodChaosSpec>(Arc::new(PodChaosInjector));
        registry.register::<NetworkChaosSpec>(Arc::new(NetworkChaosInjector));
        registry.register::<TimeChaosSpec>(Arc::new(TimeChaosInjector));
        registry.register::<IoChaosSpec>(Arc::new(IoChaosInjector));
        registry.register::<KernelChaosSpec>(Arc::new(KernelChaosInjector));
        registry.register::<StressChaosSpec>(Arc::new(StressChaosInjector));
        registry
    }

    pub fn register<S: ChaosSpec>(&mut self, injector: Arc<dyn KindInjector<S>>) {
        self.entries.insert(
            S::KIND,
            Arc::new(Registered {
                reconciler: TwoPhaseReconciler::new(injector),
            }),
        );
    }

    pub fn lookup(&self, kind: &str) -> Option<Arc<dyn KindReconciler>> {
        self.entries.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.entries.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_the_injector_set() {
        let registry = InjectorRegistry::with_default_kinds();
        assert_eq!(
            registry.kinds(),
            vec![
                "IoChaos",
                "KernelChaos",
                "NetworkChaos",
                "PodChaos",
                "StressChaos",
                "TimeChaos"
            ]
        );
        assert!(registry.lookup("PodChaos").is_some());
        assert!(registry.lookup("DNSChaos").is_none());
    }
}
