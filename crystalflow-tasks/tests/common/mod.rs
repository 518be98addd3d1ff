#![allow(dead_code)]

use axum::Router;
use clap::Parser;
use crystalflow_tasks::{Config, Server};
use std::path::Path;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn config(model_root: &Path, output_root: &Path, lookup_latency_ms: u64) -> Config {
    Config::try_parse_from([
        "crystalflow".to_string(),
        "--model-root".to_string(),
        model_root.display().to_string(),
        "--output-root".to_string(),
        output_root.display().to_string(),
        "--poll-interval-ms".to_string(),
        "10".to_string(),
        "--result-timeout-secs".to_string(),
        "10".to_string(),
        "--lookup-latency-ms".to_string(),
        lookup_latency_ms.to_string(),
    ])
    .unwrap()
}

/// A server with its pools running.
pub struct Running {
    pub server: Server,
    shutdown: watch::Sender<bool>,
    pools: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Running {
    pub fn start(server: Server) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let pools = server.spawn_pools(rx).unwrap();
        Self {
            server,
            shutdown,
            pools,
        }
    }

    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for pool in self.pools {
            pool.await.unwrap().unwrap();
        }
    }
}

/// Place a checkpoint at `<root>/<relative>`.
pub fn write_model(root: &Path, relative: &str, content: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
