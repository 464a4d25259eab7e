//! Shared test utilities

#![allow(dead_code)]

pub mod sim;

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use flate2::Compression;
use flate2::write::GzEncoder;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::json;
use sha2::{Digest, Sha256};

use rdfm_client::installer::bootenv::MemoryBootEnv;
use rdfm_client::installer::{Device, Installers, ProvidesDb};

/// Deterministic pseudo-random bytes
#[must_use]
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Hex SHA-256
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Raw SHA-256, as MCUboot reports image hashes
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// One payload of a test artifact
#[derive(Debug, Clone)]
pub struct TestPayload {
    pub payload_type: String,
    pub provides: serde_json::Value,
    pub clears: Option<Vec<String>>,
    pub files: Vec<(String, Vec<u8>)>,
}

/// `single-file` payload placing `content` at `dest_dir/filename`
#[must_use]
pub fn single_file_payload(dest_dir: &Path, filename: &str, content: &[u8], rollback: bool) -> TestPayload {
    TestPayload {
        payload_type: "single-file".to_string(),
        provides: json!({ "rootfs-image.single-file.filename.version": "1" }),
        clears: None,
        files: vec![
            ("dest_dir".to_string(), dest_dir.display().to_string().into_bytes()),
            ("filename".to_string(), filename.as_bytes().to_vec()),
            ("permissions".to_string(), b"640".to_vec()),
            ("rollback_support".to_string(), rollback.to_string().into_bytes()),
            (filename.to_string(), content.to_vec()),
        ],
    }
}

/// `zephyr-image` payload carrying one signed image
#[must_use]
pub fn zephyr_payload(image: &[u8], version: &str) -> TestPayload {
    TestPayload {
        payload_type: "zephyr-image".to_string(),
        provides: json!({
            "zephyr-image.checksum": sha256_hex(image),
            "zephyr-image.version": version,
        }),
        clears: None,
        files: vec![("zephyr.signed.bin".to_string(), image.to_vec())],
    }
}

/// `zephyr-group-image` payload with one image per member
#[must_use]
pub fn group_payload(version: &str, images: &[(&str, Vec<u8>)]) -> TestPayload {
    let mut provides = serde_json::Map::new();
    provides.insert("zephyr-group-image.version".to_string(), json!(version));
    let mut files = Vec::new();
    for (member, image) in images {
        provides.insert(format!("zephyr-group-image.target.{member}"), json!(sha256_hex(image)));
        files.push((format!("{member}.signed.bin"), image.clone()));
    }
    TestPayload {
        payload_type: "zephyr-group-image".to_string(),
        provides: serde_json::Value::Object(provides),
        clears: None,
        files,
    }
}

fn append(builder: &mut tar::Builder<impl Write>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

fn tar_gz(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    for (path, data) in entries {
        append(&mut builder, path, data);
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Version 3 artifact with a manifest and gzip-compressed header and data
#[must_use]
pub fn build_artifact(name: &str, device_types: &[&str], payloads: &[TestPayload]) -> Vec<u8> {
    let version = serde_json::to_vec(&json!({ "format": "mender", "version": 3 })).unwrap();

    let mut header_entries = vec![(
        "header-info".to_string(),
        serde_json::to_vec(&json!({
            "payloads": payloads.iter().map(|p| json!({ "type": p.payload_type })).collect::<Vec<_>>(),
            "artifact_provides": { "artifact_name": name },
            "artifact_depends": { "device_type": device_types },
        }))
        .unwrap(),
    )];
    for (i, payload) in payloads.iter().enumerate() {
        header_entries.push((
            format!("headers/{i:04}/type-info"),
            serde_json::to_vec(&json!({
                "type": payload.payload_type,
                "artifact_provides": payload.provides,
                "clears_artifact_provides": payload.clears,
            }))
            .unwrap(),
        ));
    }
    let header = tar_gz(&header_entries);

    let mut manifest = format!("{}  version\n{}  header.tar.gz\n", sha256_hex(&version), sha256_hex(&header));
    let mut data = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        for (file, content) in &payload.files {
            manifest.push_str(&format!("{}  data/{i:04}/{file}\n", sha256_hex(content)));
        }
        data.push((format!("data/{i:04}.tar.gz"), tar_gz(&payload.files)));
    }

    let mut outer = tar::Builder::new(Vec::new());
    append(&mut outer, "version", &version);
    append(&mut outer, "manifest", manifest.as_bytes());
    append(&mut outer, "header.tar.gz", &header);
    for (path, archive) in &data {
        append(&mut outer, path, archive);
    }
    outer.into_inner().unwrap()
}

/// Device with only the single-file installer, state kept under `dir`
#[must_use]
pub fn test_device(dir: &Path, device_type: &str) -> Device {
    let data_dir = dir.join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(dir.join("artifact_info"), "artifact_name=factory\n").unwrap();
    let db = ProvidesDb::new(&data_dir, dir.join("artifact_info"), dir.join("provides_info"));
    let installers = Installers::standard(None, Arc::new(MemoryBootEnv::default()));
    Device::new(installers, db, data_dir, device_type.to_string())
}

/// Device token with the claims the server issues
#[must_use]
pub fn device_jwt(device_id: &str, expires: i64) -> String {
    let claims = json!({
        "device_id": device_id,
        "created_at": chrono::Utc::now().timestamp(),
        "expires": expires,
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(b"server-secret"),
    )
    .unwrap()
}

/// In-process stand-in for the management server
#[derive(Debug, Default)]
pub struct MockServer {
    pub accepted: AtomicBool,
    pub auth_requests: AtomicUsize,
    pub update_checks: AtomicUsize,
    pub artifact: Mutex<Option<Vec<u8>>>,
    pub checked_metadata: Mutex<Vec<serde_json::Value>>,
    addr: Mutex<Option<SocketAddr>>,
}

impl MockServer {
    /// Serve on a random local port
    pub async fn start() -> Arc<Self> {
        let state = Arc::new(Self::default());
        state.accepted.store(true, Ordering::SeqCst);

        let router = Router::new()
            .route("/api/v1/auth/device", post(auth))
            .route("/api/v1/update/check", post(update_check))
            .route("/artifact", get(artifact))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        *state.addr.lock().unwrap() = Some(listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        state
    }

    /// Base URL
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr.lock().unwrap().unwrap())
    }

    /// Offer `artifact` on the next update checks
    pub fn offer(&self, artifact: Vec<u8>) {
        *self.artifact.lock().unwrap() = Some(artifact);
    }

    /// Stop offering an update
    pub fn withdraw(&self) {
        *self.artifact.lock().unwrap() = None;
    }
}

async fn auth(State(server): State<Arc<MockServer>>, headers: HeaderMap, body: String) -> Response {
    server.auth_requests.fetch_add(1, Ordering::SeqCst);
    if !headers.contains_key("x-rdfm-device-signature") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if !server.accepted.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let request: serde_json::Value = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let device_id = request["metadata"]["rdfm.hardware.macaddr"].as_str().unwrap_or("unknown");
    axum::Json(json!({ "expires": 300, "token": device_jwt(device_id, 300) })).into_response()
}

async fn update_check(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
    axum::Json(metadata): axum::Json<serde_json::Value>,
) -> Response {
    server.update_checks.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer token="));
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    server
        .checked_metadata
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(metadata);

    let offered = server.artifact.lock().unwrap().clone();
    match offered {
        Some(artifact) => axum::Json(json!({
            "id": 1,
            "created": "Mon, 01 Jan 2024 00:00:00 GMT",
            "sha256": sha256_hex(&artifact),
            "uri": format!("{}/artifact", server.url()),
        }))
        .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn artifact(State(server): State<Arc<MockServer>>) -> Response {
    match server.artifact.lock().unwrap().clone() {
        Some(artifact) => artifact.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
