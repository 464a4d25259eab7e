//! Update check, streamed download and install against a local server

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::get;
use futures::StreamExt;

use rdfm_client::Error;
use rdfm_client::installer::Device;
use rdfm_client::security::DeviceKey;
use rdfm_client::server::download::cache_path;
use rdfm_client::server::{DownloadSettings, ServerClient, UpdateInfo, base_metadata, install_update};

mod common;
use common::{MockServer, build_artifact, random_bytes, sha256_hex, single_file_payload, test_device};

fn client(url: &str, dir: &std::path::Path) -> ServerClient {
    let key = DeviceKey::load_or_create(&dir.join("device.pem"), 1024).unwrap();
    ServerClient::new(url, Arc::new(key), None).unwrap()
}

fn settings(retries: u32) -> DownloadSettings {
    DownloadSettings {
        retry_count: retries,
        retry_time: Duration::from_millis(10),
        ..DownloadSettings::default()
    }
}

async fn install(device: Arc<Device>, info: UpdateInfo, settings: DownloadSettings) -> rdfm_client::Result<()> {
    tokio::task::spawn_blocking(move || install_update(&device, &info, settings).map(drop))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_check_and_install() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("etc");
    let device = Arc::new(test_device(dir.path(), "board-a"));
    let server_client = client(&server.url(), dir.path());
    let metadata = base_metadata("board-a", "factory", "02:00:00:00:00:01");

    assert_eq!(server_client.update_check(&metadata).await.unwrap(), None);

    server.offer(build_artifact(
        "config-v2",
        &["board-a"],
        &[single_file_payload(&target, "app.conf", b"level=2\n", true)],
    ));
    let info = server_client.update_check(&metadata).await.unwrap().unwrap();
    assert!(info.uri.ends_with("/artifact"));

    install(Arc::clone(&device), info, settings(0)).await.unwrap();
    assert!(device.update_pending());
    assert_eq!(std::fs::read(target.join("app.conf")).unwrap(), b"level=2\n");

    // token is reused between checks
    assert_eq!(server.auth_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_digest_mismatch_rolls_back() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("etc");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("app.conf"), b"level=1\n").unwrap();
    let device = Arc::new(test_device(dir.path(), "board-a"));

    server.offer(build_artifact(
        "config-v2",
        &["board-a"],
        &[single_file_payload(&target, "app.conf", b"level=2\n", true)],
    ));
    let info = UpdateInfo {
        id: 1,
        created: String::new(),
        sha256: sha256_hex(b"something else"),
        uri: format!("{}/artifact", server.url()),
    };

    let err = install(Arc::clone(&device), info, settings(0)).await.unwrap_err();
    assert!(matches!(err, Error::Checksum { .. }), "{err}");
    assert!(!device.update_pending());
    assert_eq!(std::fs::read(target.join("app.conf")).unwrap(), b"level=1\n");
}

#[tokio::test]
async fn test_digest_mismatch_without_rollback_support_changes_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("etc");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("app.conf"), b"level=1\n").unwrap();
    let device = Arc::new(test_device(dir.path(), "board-a"));
    let provides_before = device.provides().unwrap();

    server.offer(build_artifact(
        "config-v2",
        &["board-a"],
        &[single_file_payload(&target, "app.conf", b"level=2\n", false)],
    ));
    let info = UpdateInfo {
        id: 1,
        created: String::new(),
        sha256: sha256_hex(b"something else"),
        uri: format!("{}/artifact", server.url()),
    };

    let err = install(Arc::clone(&device), info, settings(0)).await.unwrap_err();
    assert!(matches!(err, Error::Checksum { .. }), "{err}");
    assert!(!device.update_pending());
    assert_eq!(device.artifact_name().unwrap(), "factory");
    assert_eq!(device.provides().unwrap(), provides_before);
    assert_eq!(std::fs::read(target.join("app.conf")).unwrap(), b"level=1\n");
    assert!(!target.join(".app.conf.new").exists());
}

/// Artifact host that breaks the first full download off halfway
#[derive(Default)]
struct FlakyHost {
    artifact: Vec<u8>,
    ranges: AtomicBool,
    full_requests: AtomicUsize,
    range_offsets: std::sync::Mutex<Vec<u64>>,
}

impl FlakyHost {
    async fn start(artifact: Vec<u8>, ranges: bool) -> (Arc<Self>, SocketAddr) {
        let host = Arc::new(Self {
            artifact,
            ranges: AtomicBool::new(ranges),
            ..Self::default()
        });
        let router = Router::new()
            .route("/artifact", get(serve))
            .with_state(Arc::clone(&host));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (host, addr)
    }

    fn info(&self, addr: SocketAddr) -> UpdateInfo {
        UpdateInfo {
            id: 2,
            created: String::new(),
            sha256: sha256_hex(&self.artifact),
            uri: format!("http://{addr}/artifact"),
        }
    }
}

async fn serve(State(host): State<Arc<FlakyHost>>, headers: HeaderMap) -> Response {
    let total = host.artifact.len();
    let offset = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());

    match offset {
        Some(offset) if host.ranges.load(Ordering::SeqCst) => {
            host.range_offsets.lock().unwrap().push(offset as u64);
            axum::http::Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, total - offset)
                .header(header::CONTENT_RANGE, format!("bytes {offset}-{}/{total}", total - 1))
                .body(Body::from(host.artifact[offset..].to_vec()))
                .unwrap()
        }
        _ => {
            let first = host.full_requests.fetch_add(1, Ordering::SeqCst) == 0;
            let mut response = axum::http::Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, total);
            if host.ranges.load(Ordering::SeqCst) {
                response = response.header(header::ACCEPT_RANGES, "bytes");
            }
            if !first {
                return response.body(Body::from(host.artifact.clone())).unwrap();
            }
            let half = Bytes::copy_from_slice(&host.artifact[..total / 2]);
            let chunks: Vec<Result<Bytes, std::io::Error>> =
                vec![Ok(half), Err(std::io::Error::other("link dropped"))];
            let stream = futures::stream::iter(chunks).then(|chunk| async move {
                if chunk.is_err() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                chunk
            });
            response.body(Body::from_stream(stream)).unwrap()
        }
    }
}

fn large_artifact(target: &std::path::Path) -> Vec<u8> {
    build_artifact(
        "blob-v1",
        &["board-a"],
        &[single_file_payload(target, "blob.bin", &random_bytes(3, 256 * 1024), true)],
    )
}

#[tokio::test]
async fn test_resumes_broken_download() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("var");
    let artifact = large_artifact(&target);
    let (host, addr) = FlakyHost::start(artifact, true).await;
    let device = Arc::new(test_device(dir.path(), "board-a"));

    install(Arc::clone(&device), host.info(addr), settings(3)).await.unwrap();

    assert!(device.update_pending());
    assert_eq!(host.full_requests.load(Ordering::SeqCst), 1);
    assert_eq!(host.range_offsets.lock().unwrap().len(), 1);
    assert_eq!(std::fs::read(target.join("blob.bin")).unwrap(), random_bytes(3, 256 * 1024));
}

#[tokio::test]
async fn test_cache_survives_incomplete_download() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let target = dir.path().join("var");
    let artifact = large_artifact(&target);
    let (host, addr) = FlakyHost::start(artifact, false).await;
    let device = Arc::new(test_device(dir.path(), "board-a"));
    let info = host.info(addr);

    let cached = DownloadSettings {
        cache_dir: Some(cache_dir.clone()),
        ..settings(3)
    };
    let err = install(Arc::clone(&device), info.clone(), cached.clone()).await.unwrap_err();
    assert!(matches!(err, Error::IncompleteDownload { .. }), "{err}");
    assert!(!device.update_pending());

    let partial = std::fs::metadata(cache_path(&cache_dir, &info.sha256)).unwrap().len();
    assert!(partial > 0);

    host.ranges.store(true, Ordering::SeqCst);
    install(Arc::clone(&device), info.clone(), cached).await.unwrap();
    assert!(device.update_pending());
    assert_eq!(host.range_offsets.lock().unwrap().as_slice(), &[partial]);
    assert!(!cache_path(&cache_dir, &info.sha256).exists());
}
