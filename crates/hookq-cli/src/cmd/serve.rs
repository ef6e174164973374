use crate::cmd::open_project;
use crate::cmd::worker::spawn_workers;
use anyhow::Context;
use hookq_core::SystemClock;
use hookq_server::AppState;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

pub fn run(root: &Path, port: u16, no_worker: bool) -> anyhow::Result<()> {
    let project = open_project(root)?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind port {port}"))?;
        let actual_port = listener.local_addr()?.port();

        let (tx, rx) = watch::channel(false);
        let workers = if no_worker {
            Vec::new()
        } else {
            spawn_workers(&project, root, project.config.worker.workers, &rx)?
        };

        println!(
            "hookq API → http://localhost:{actual_port}  ({} worker(s))",
            workers.len()
        );

        let state = AppState::new(Arc::clone(&project.store), Arc::new(SystemClock));
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        };
        let served = hookq_server::serve_on(state, listener, shutdown).await;

        let _ = tx.send(true);
        for task in workers {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "worker task failed");
            }
        }
        served
    })
}
