//! Shared context for the VerticaDB and sandbox controllers

use std::sync::Arc;

use kube::Client;

use vdb_common::events::{EventPublisher, KubeEventPublisher};

use crate::cache::{InMemoryPasswordCache, InMemoryTimestampCache, PasswordCache, TimestampCache};
use crate::config::ReconcilerConfig;
use crate::dispatcher::{Dispatcher, VclusterDispatcher};
use crate::kube_client::{KubeClient, KubeClientImpl};
use crate::pod_runner::{KubePodRunner, PodRunner};
use crate::podfacts::{ClusterFactGatherer, FactGatherer, PodFacts};
use crate::sandbox_configmap::SandboxConfigMapManager;
use crate::trigger::TriggerSink;

/// Everything a reconcile pass needs besides the object itself
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Administrative operations against the database
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Command execution in pods
    pub runner: Arc<dyn PodRunner>,
    /// Source of pod facts
    pub gatherer: Arc<dyn FactGatherer>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Superuser password cache
    pub passwords: Arc<dyn PasswordCache>,
    /// Last license validation times
    pub timestamps: Arc<dyn TimestampCache>,
    /// Producer side of the sandbox trigger channel
    pub triggers: Arc<dyn TriggerSink>,
    /// Sandbox config map management
    pub configmaps: Arc<SandboxConfigMapManager>,
    /// Operator settings
    pub config: ReconcilerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Fresh main-cluster fact snapshot
    pub fn new_facts(&self) -> PodFacts {
        PodFacts::new(self.gatherer.clone())
    }

    /// Create a context wired entirely to the given client and fakes.
    ///
    /// Dispatcher, runner, gatherer and trigger sink default to mocks with no
    /// expectations; tests swap in what they exercise with the `with_*`
    /// methods.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        use crate::dispatcher::MockDispatcher;
        use crate::pod_runner::MockPodRunner;
        use crate::podfacts::MockFactGatherer;
        use crate::trigger::MockTriggerSink;
        use vdb_common::events::NoopEventPublisher;

        Self {
            configmaps: Arc::new(SandboxConfigMapManager::new(kube.clone())),
            kube,
            dispatcher: Arc::new(MockDispatcher::new()),
            runner: Arc::new(MockPodRunner::new()),
            gatherer: Arc::new(MockFactGatherer::new()),
            events: Arc::new(NoopEventPublisher),
            passwords: Arc::new(InMemoryPasswordCache::new()),
            timestamps: Arc::new(InMemoryTimestampCache::new()),
            triggers: Arc::new(MockTriggerSink::new()),
            config: ReconcilerConfig::default(),
        }
    }

    /// Replace the dispatcher
    #[cfg(test)]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Replace the pod runner
    #[cfg(test)]
    pub fn with_runner(mut self, runner: Arc<dyn PodRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replace the fact gatherer
    #[cfg(test)]
    pub fn with_gatherer(mut self, gatherer: Arc<dyn FactGatherer>) -> Self {
        self.gatherer = gatherer;
        self
    }

    /// Replace the event sink
    #[cfg(test)]
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Replace the password cache
    #[cfg(test)]
    pub fn with_passwords(mut self, passwords: Arc<dyn PasswordCache>) -> Self {
        self.passwords = passwords;
        self
    }

    /// Replace the timestamp cache
    #[cfg(test)]
    pub fn with_timestamps(mut self, timestamps: Arc<dyn TimestampCache>) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Replace the trigger sink
    #[cfg(test)]
    pub fn with_triggers(mut self, triggers: Arc<dyn TriggerSink>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Replace the settings
    #[cfg(test)]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    runner: Option<Arc<dyn PodRunner>>,
    events: Option<Arc<dyn EventPublisher>>,
    passwords: Option<Arc<dyn PasswordCache>>,
    timestamps: Option<Arc<dyn TimestampCache>>,
    config: ReconcilerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            dispatcher: None,
            runner: None,
            events: None,
            passwords: None,
            timestamps: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set operator settings
    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the dispatcher
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Override the pod runner
    pub fn pod_runner(mut self, runner: Arc<dyn PodRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a password cache between controllers
    pub fn password_cache(mut self, cache: Arc<dyn PasswordCache>) -> Self {
        self.passwords = Some(cache);
        self
    }

    /// Share a timestamp cache between controllers
    pub fn timestamp_cache(mut self, cache: Arc<dyn TimestampCache>) -> Self {
        self.timestamps = Some(cache);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube: Arc<dyn KubeClient> = self.kube.unwrap_or_else(|| {
            Arc::new(KubeClientImpl::new(
                self.client.clone(),
                self.config.field_manager.clone(),
            ))
        });
        let runner: Arc<dyn PodRunner> = self
            .runner
            .unwrap_or_else(|| Arc::new(KubePodRunner::new(self.client.clone())));
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(VclusterDispatcher::new(runner.clone())));
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(
                self.client.clone(),
                &self.config.controller_name,
            ))
        });
        let configmaps = Arc::new(SandboxConfigMapManager::new(kube.clone()));

        Context {
            gatherer: Arc::new(ClusterFactGatherer::new(kube.clone(), runner.clone())),
            triggers: configmaps.clone(),
            configmaps,
            kube,
            dispatcher,
            runner,
            events,
            passwords: self
                .passwords
                .unwrap_or_else(|| Arc::new(InMemoryPasswordCache::new())),
            timestamps: self
                .timestamps
                .unwrap_or_else(|| Arc::new(InMemoryTimestampCache::new())),
            config: self.config,
        }
    }
}
