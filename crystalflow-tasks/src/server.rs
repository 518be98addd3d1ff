//! Server setup and lifecycle management

use crate::activities::{InferenceActivities, LookupActivities};
use crate::api::{AppState, create_router};
use crate::backend::{ComputationBackend, MoleculeLookup, ReferenceBackend, SimulatedPubChem};
use crate::config::Config;
use crate::pools::{PoolSettings, cpu_pool, gpu_pool};
use crate::routing::task_queues;
use anyhow::Result;
use axum::Router;
use crystalflow_core::{JsonCodec, TaskQueueRegistry};
use crystalflow_persistence::InMemoryBackend;
use crystalflow_runtime::WorkflowClient;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// HTTP API and both worker pools over one in-memory engine.
pub struct Server {
    config: Config,
    backend: InMemoryBackend,
    codec: Arc<JsonCodec>,
    routing: Arc<TaskQueueRegistry>,
    inference: Arc<InferenceActivities>,
    lookup: Arc<LookupActivities>,
}

impl Server {
    /// Server using the reference computation backend and simulated lookups.
    pub fn new(config: Config) -> Result<Self> {
        let lookup = Arc::new(SimulatedPubChem::new(config.lookup_latency()));
        Self::with_backends(config, Arc::new(ReferenceBackend::new()), lookup)
    }

    pub fn with_backends(
        config: Config,
        computation: Arc<dyn ComputationBackend>,
        lookup: Arc<dyn MoleculeLookup>,
    ) -> Result<Self> {
        let routing = Arc::new(task_queues()?);
        let inference = Arc::new(InferenceActivities::new(
            computation,
            config.model_root.clone(),
            config.output_root.clone(),
        ));

        Ok(Self {
            backend: InMemoryBackend::new(),
            codec: Arc::new(JsonCodec),
            routing,
            inference,
            lookup: Arc::new(LookupActivities::new(lookup)),
            config,
        })
    }

    /// Engine storage shared by the API and the pools.
    pub fn backend(&self) -> &InMemoryBackend {
        &self.backend
    }

    pub fn client(&self) -> WorkflowClient<InMemoryBackend, JsonCodec> {
        WorkflowClient::new(
            self.backend.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.routing),
        )
        .with_poll_interval(self.config.poll_interval())
    }

    pub fn router(&self) -> Router {
        create_router(AppState::new(self.client(), self.config.result_timeout()))
    }

    /// Start the gpu and cpu pools; they stop once `shutdown` turns true.
    pub fn spawn_pools(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<Result<()>>>> {
        let gpu = gpu_pool(
            self.backend.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.routing),
            Arc::clone(&self.inference),
            &PoolSettings {
                concurrency: self.config.gpu_concurrency,
                poll_interval: self.config.poll_interval(),
            },
        )?;
        let cpu = cpu_pool(
            self.backend.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.routing),
            Arc::clone(&self.lookup),
            &PoolSettings {
                concurrency: self.config.cpu_concurrency,
                poll_interval: self.config.poll_interval(),
            },
        )?;

        Ok(vec![
            tokio::spawn(gpu.start_polling(shutdown.clone())),
            tokio::spawn(cpu.start_polling(shutdown)),
        ])
    }

    /// Run until Ctrl-C or SIGTERM, then drain the pools.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pools = self.spawn_pools(shutdown_rx)?;

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("CrystalFlow listening on {}", addr);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        tracing::info!("CrystalFlow shutting down");
        let _ = shutdown_tx.send(true);
        for pool in pools {
            match pool.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Worker pool failed"),
                Err(e) => tracing::error!(error = %e, "Worker pool panicked"),
            }
        }

        served?;
        Ok(())
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
