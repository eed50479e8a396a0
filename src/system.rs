//! # Job System
//!
//! Facade composing the client lifecycle, the dispatcher and the dashboard
//! around one shared queue client.

use serde::Serialize;
use std::sync::Arc;

use crate::config::JobSystemConfig;
use crate::dashboard::Dashboard;
use crate::database::{JobStore, PgJobStore};
use crate::error::Result;
use crate::messaging::{QueueClient, SendOptions};
use crate::orchestration::{ClientFactory, ClientManager, Dispatcher, PgBossClientFactory};
use crate::registry::{Handlers, Queue};

pub struct JobSystem {
    manager: ClientManager,
    dispatcher: Dispatcher,
    dashboard: Dashboard,
    schema: String,
}

impl std::fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSystem")
            .field("schema", &self.schema)
            .field("manager", &self.manager)
            .field("queues", self.dispatcher.queues())
            .finish()
    }
}

impl JobSystem {
    /// Build a job system backed by Postgres
    pub fn new(config: JobSystemConfig) -> Result<Self> {
        let schema = config.resolved_schema().to_string();
        let factory = Arc::new(PgBossClientFactory::new(
            config.connection_string.clone(),
            schema.clone(),
            config.client.clone(),
        ));
        let store = Arc::new(PgJobStore::new(config.connection_string.clone(), schema));
        Self::with_backends(config, factory, store)
    }

    /// Build a job system over caller-supplied client factory and storage
    pub fn with_backends(
        config: JobSystemConfig,
        factory: Arc<dyn ClientFactory>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        config.validate()?;

        let on_error = config.error_callback();
        let manager = if config.client.handle_signals {
            ClientManager::with_signal_handlers(factory, on_error)
        } else {
            ClientManager::new(factory, on_error)
        };

        let queues = config.queue_registry().clone();
        let dashboard = Dashboard::new(store.clone(), manager.clone(), queues.names());
        let dispatcher = Dispatcher::new(
            queues,
            config.schedule_list().to_vec(),
            config.clean_orphans,
            manager.clone(),
            store,
        );

        Ok(Self {
            manager,
            dispatcher,
            dashboard,
            schema: config.resolved_schema().to_string(),
        })
    }

    /// Register workers for every configured queue. Safe to call more than
    /// once; only the first successful setup touches the backend.
    pub async fn initialize(&self, handlers: Handlers) -> Result<()> {
        self.dispatcher.initialize(handlers).await
    }

    /// Enqueue a job on a typed queue
    pub async fn send<T: Serialize>(
        &self,
        queue: &Queue<T>,
        data: &T,
        options: Option<SendOptions>,
    ) -> Result<Option<String>> {
        let payload = serde_json::to_value(data)?;
        let client = self.manager.get_client().await?;
        client.send(queue.name(), payload, options).await
    }

    /// The shared queue client, started on first use
    pub async fn client(&self) -> Result<Arc<dyn QueueClient>> {
        self.manager.get_client().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.manager.stop().await
    }

    pub fn dashboard(&self) -> &Dashboard {
        &self.dashboard
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }
}
