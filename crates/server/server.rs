//! Server implementation that runs API and workers concurrently.

use std::future::Future;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use jobq_core::{
    generate_consumer_name, Backend, JobHandler, JobRecordStore, JobqError, QueueKeys, RecordTracking,
    SharedBackend, WorkerPool,
};

use crate::api::{self, AppState};
use crate::config::ServerConfig;

/// The jobq server: the HTTP API plus an optional worker pool sharing one
/// backend and one Job Record store.
pub struct Server<H: JobHandler> {
    config: ServerConfig,
    backend: SharedBackend,
    records: Arc<dyn JobRecordStore>,
    handler: H,
}

impl<H: JobHandler> Server<H> {
    /// Create a new server with the given configuration, backend, record store and handler.
    pub fn new(
        config: ServerConfig,
        backend: impl Backend + 'static,
        records: impl JobRecordStore + 'static,
        handler: H,
    ) -> Self {
        Self {
            config,
            backend: SharedBackend::new(backend),
            records: Arc::new(records),
            handler,
        }
    }

    /// Create a new builder.
    pub fn builder() -> ServerBuilder<H> {
        ServerBuilder::new()
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> jobq_core::Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the API and, when `num_workers > 0`, the worker pool until
    /// `shutdown` resolves.
    pub async fn run_until<S>(self, shutdown: S) -> jobq_core::Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let keys = QueueKeys::new(self.config.queue.clone());
        let app_state = web::Data::new(AppState::new(
            self.backend.clone(),
            keys,
            self.records.clone(),
        ));

        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .configure(api::configure)
        })
        .bind(self.config.api_addr)?
        .disable_signals()
        .run();

        let server_handle = server.handle();
        let api_handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "API server error");
            }
        });

        tracing::info!(addr = %self.config.api_addr, "API server started");

        let result = if self.config.num_workers == 0 {
            shutdown.await;
            Ok(())
        } else {
            let mut worker_config = self.config.worker_config();
            let consumer = worker_config
                .consumer_name
                .clone()
                .unwrap_or_else(generate_consumer_name);
            worker_config.consumer_name = Some(consumer.clone());

            let handler = RecordTracking::new(self.records.clone(), self.handler, consumer);
            let pool = WorkerPool::new(worker_config, handler, self.backend.clone());
            pool.run_until(shutdown).await
        };

        tracing::info!("Shutting down API server...");
        server_handle.stop(true).await;
        let _ = api_handle.await;

        tracing::info!("Server stopped");
        result
    }
}

/// Builder for Server.
pub struct ServerBuilder<H: JobHandler> {
    config: ServerConfig,
    backend: Option<SharedBackend>,
    records: Option<Arc<dyn JobRecordStore>>,
    handler: Option<H>,
}

impl<H: JobHandler> ServerBuilder<H> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            backend: None,
            records: None,
            handler: None,
        }
    }

    /// Set the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the backend.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(SharedBackend::new(backend));
        self
    }

    /// Set the Job Record store.
    pub fn records(mut self, records: impl JobRecordStore + 'static) -> Self {
        self.records = Some(Arc::new(records));
        self
    }

    /// Set the job handler.
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the API bind address.
    pub fn api_addr(mut self, addr: std::net::SocketAddr) -> Self {
        self.config.api_addr = addr;
        self
    }

    /// Set the number of workers.
    pub fn workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Build the server.
    pub fn build(self) -> jobq_core::Result<Server<H>> {
        let backend = self
            .backend
            .ok_or_else(|| JobqError::Config("Backend is required".to_string()))?;
        let records = self
            .records
            .ok_or_else(|| JobqError::Config("Record store is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| JobqError::Config("Handler is required".to_string()))?;

        Ok(Server {
            config: self.config,
            backend,
            records,
            handler,
        })
    }
}

impl<H: JobHandler> Default for ServerBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}
