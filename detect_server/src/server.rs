use crate::{
    bridge::WorkerPool,
    config::{Config, LimitsConfig},
    routes::api_routes,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub worker_pool: Arc<WorkerPool>,
    pub limits: LimitsConfig,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: SharedState) -> Router {
    let body_limit = state.limits.max_body_bytes();
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let worker_pool = Arc::new(WorkerPool::from_config(&config.worker));
        tracing::info!(
            program = %config.worker.program.display(),
            capacity = worker_pool.capacity(),
            max_queued = config.worker.max_queued,
            "Worker pool ready"
        );

        let app_state = SharedState {
            worker_pool,
            limits: config.limits.clone(),
            metrics,
        };

        let router = router(app_state);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
