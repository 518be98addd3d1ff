mod common;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::StatusCode;
use axum::routing::get;
use common::{serve, write_model};
use crystalflow_core::ActivityError;
use crystalflow_tasks::activities::InferenceActivities;
use crystalflow_tasks::backend::{ComputationBackend, ReferenceBackend};
use crystalflow_tasks::types::{FetchModel, InferenceJob};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const MODEL: &str = "models/x/ckpt.pt";

/// Backend that records download requests without touching the network.
#[derive(Default)]
struct CountingBackend {
    downloads: AtomicU32,
}

#[async_trait]
impl ComputationBackend for CountingBackend {
    async fn download(&self, _: &str, _: &Path) -> Result<u64, ActivityError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Err(ActivityError::Download("offline".into()))
    }

    async fn evaluate(&self, _: &InferenceJob) -> Result<Vec<String>, ActivityError> {
        Ok(Vec::new())
    }

    async fn persist(&self, _: &Path, _: &[String]) -> Result<Vec<PathBuf>, ActivityError> {
        Ok(Vec::new())
    }
}

/// Names of in-progress download files left in `dir`.
fn leftover_parts(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".part"))
        .collect()
}

fn payload() -> Vec<u8> {
    (0..10_000u32).map(|i| (i % 251) as u8).collect()
}

fn fetch(url: Option<String>) -> FetchModel {
    FetchModel {
        model_path: MODEL.into(),
        model_url: url,
    }
}

#[tokio::test]
async fn present_model_is_a_cache_hit() {
    let root = tempfile::tempdir().unwrap();
    write_model(root.path(), MODEL, b"weights");
    let backend = Arc::new(CountingBackend::default());
    let activities = InferenceActivities::new(backend.clone(), root.path(), root.path());

    let first = activities
        .get_or_download_model(fetch(Some("http://127.0.0.1:1/ckpt.pt".into())))
        .await
        .unwrap();
    let second = activities
        .get_or_download_model(fetch(Some("http://127.0.0.1:1/ckpt.pt".into())))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.size_bytes, 7);
    assert_eq!(backend.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn absent_model_without_url_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(CountingBackend::default());
    let activities = InferenceActivities::new(backend.clone(), root.path(), root.path());

    let err = activities.get_or_download_model(fetch(None)).await.unwrap_err();

    assert!(matches!(err, ActivityError::NotFound(_)));
    assert_eq!(backend.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_success_status_leaves_nothing_on_disk() {
    let base = serve(Router::new().route("/ckpt.pt", get(|| async { StatusCode::NOT_FOUND }))).await;
    let root = tempfile::tempdir().unwrap();
    let activities =
        InferenceActivities::new(Arc::new(ReferenceBackend::new()), root.path(), root.path());

    let err = activities
        .get_or_download_model(fetch(Some(format!("{base}/ckpt.pt"))))
        .await
        .unwrap_err();

    assert!(matches!(err, ActivityError::Download(_)));
    let target = root.path().join(MODEL);
    assert!(!target.exists());
    assert!(leftover_parts(target.parent().unwrap()).is_empty());
}

#[tokio::test]
async fn unreachable_host_is_a_download_error() {
    let root = tempfile::tempdir().unwrap();
    let activities =
        InferenceActivities::new(Arc::new(ReferenceBackend::new()), root.path(), root.path());

    // Port 1 is never served in the test environment.
    let err = activities
        .get_or_download_model(fetch(Some("http://127.0.0.1:1/ckpt.pt".into())))
        .await
        .unwrap_err();

    assert!(matches!(err, ActivityError::Download(_)));
    assert!(!root.path().join(MODEL).exists());
}

#[tokio::test]
async fn download_is_streamed_into_place() {
    let payload = payload();
    let body = payload.clone();
    let base = serve(Router::new().route(
        "/ckpt.pt",
        get(move || {
            let body = body.clone();
            async move { body }
        }),
    ))
    .await;
    let root = tempfile::tempdir().unwrap();
    let activities =
        InferenceActivities::new(Arc::new(ReferenceBackend::new()), root.path(), root.path());

    let descriptor = activities
        .get_or_download_model(fetch(Some(format!("{base}/ckpt.pt"))))
        .await
        .unwrap();

    let target = root.path().join(MODEL);
    assert_eq!(descriptor.size_bytes, payload.len() as u64);
    assert_eq!(descriptor.model_path, target.display().to_string());
    assert_eq!(std::fs::read(&target).unwrap(), payload);
    assert!(leftover_parts(target.parent().unwrap()).is_empty());

    // Present now, so the second call does not need the server.
    let again = activities
        .get_or_download_model(fetch(Some("http://127.0.0.1:1/ckpt.pt".into())))
        .await
        .unwrap();
    assert_eq!(again.size_bytes, descriptor.size_bytes);
}

#[tokio::test]
async fn abandoned_download_leaves_nothing_on_disk() {
    // One chunk, then the body never finishes.
    let base = serve(Router::new().route(
        "/ckpt.pt",
        get(|| async {
            let first = futures::stream::once(async { Ok::<_, std::io::Error>(vec![7u8; 1024]) });
            Body::from_stream(futures::StreamExt::chain(first, futures::stream::pending()))
        }),
    ))
    .await;
    let root = tempfile::tempdir().unwrap();
    let activities =
        InferenceActivities::new(Arc::new(ReferenceBackend::new()), root.path(), root.path());

    let attempt = tokio::time::timeout(
        Duration::from_millis(500),
        activities.get_or_download_model(fetch(Some(format!("{base}/ckpt.pt")))),
    )
    .await;

    assert!(attempt.is_err());
    let target = root.path().join(MODEL);
    assert!(!target.exists());
    assert!(leftover_parts(target.parent().unwrap()).is_empty());
}

#[tokio::test]
async fn concurrent_downloads_of_one_model_both_land_intact() {
    let payload = payload();
    let chunks: Vec<Vec<u8>> = payload.chunks(500).map(<[u8]>::to_vec).collect();
    let base = serve(Router::new().route(
        "/ckpt.pt",
        get(move || {
            let chunks = chunks.clone();
            async move {
                Body::from_stream(futures::StreamExt::then(
                    futures::stream::iter(chunks),
                    |chunk| async move {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        Ok::<_, std::io::Error>(chunk)
                    },
                ))
            }
        }),
    ))
    .await;
    let root = tempfile::tempdir().unwrap();
    let activities =
        InferenceActivities::new(Arc::new(ReferenceBackend::new()), root.path(), root.path());
    let url = format!("{base}/ckpt.pt");

    let (first, second) = tokio::join!(
        activities.get_or_download_model(fetch(Some(url.clone()))),
        activities.get_or_download_model(fetch(Some(url))),
    );

    assert_eq!(first.unwrap().size_bytes, payload.len() as u64);
    assert_eq!(second.unwrap().size_bytes, payload.len() as u64);
    let target = root.path().join(MODEL);
    assert_eq!(std::fs::read(&target).unwrap(), payload);
    assert!(leftover_parts(target.parent().unwrap()).is_empty());
}
