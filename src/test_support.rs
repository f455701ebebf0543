//! In-memory blob server for exercising `ApiClient`/`LocalSide`/`RemoteSide`
//! against real HTTP instead of mocking it away, grounded on the teacher's
//! own `http.rs` test pattern of binding `axum::serve` to `127.0.0.1:0`.
#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::net::TcpListener;

use crate::http::{BlobInfo, DiskUsage};

#[derive(Clone, Default)]
pub struct BlobStore(Arc<Mutex<HashMap<String, Vec<u8>>>>);

impl BlobStore {
    pub fn seed(&self, path: &str, bytes: &[u8]) {
        self.0.lock().unwrap().insert(path.to_string(), bytes.to_vec());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(path).cloned()
    }
}

fn etag_for(bytes: &[u8]) -> String {
    let digest = md5::compute(bytes);
    BASE64.encode(digest.0)
}

async fn get_blob(State(store): State<BlobStore>, AxumPath(path): AxumPath<String>) -> Result<Bytes, StatusCode> {
    store.get(&path).map(Bytes::from).ok_or(StatusCode::NOT_FOUND)
}

async fn put_blob(State(store): State<BlobStore>, AxumPath(path): AxumPath<String>, body: Bytes) -> Json<BlobInfo> {
    let bytes = body.to_vec();
    let info = BlobInfo { path: path.clone(), etag: etag_for(&bytes), size: bytes.len() as u64 };
    store.0.lock().unwrap().insert(path, bytes);
    Json(info)
}

async fn delete_blob(State(store): State<BlobStore>, AxumPath(path): AxumPath<String>) -> StatusCode {
    store.0.lock().unwrap().remove(&path);
    StatusCode::OK
}

async fn list_blobs(State(store): State<BlobStore>, Query(params): Query<HashMap<String, String>>) -> Json<Vec<BlobInfo>> {
    let prefix = params.get("prefix").cloned().unwrap_or_default();
    let items = store
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|(p, _)| p.starts_with(&prefix))
        .map(|(p, b)| BlobInfo { path: p.clone(), etag: etag_for(b), size: b.len() as u64 })
        .collect();
    Json(items)
}

async fn disk_usage() -> Json<DiskUsage> {
    Json(DiskUsage { used_bytes: 0, quota_bytes: None })
}

/// Starts the fake blob store on an OS-assigned port and returns its base
/// URL (`http://127.0.0.1:PORT`, no trailing slash).
pub async fn spawn(store: BlobStore) -> String {
    let app = Router::new()
        .route("/blobs/*path", get(get_blob).put(put_blob).delete(delete_blob))
        .route("/blobs", get(list_blobs))
        .route("/disk-usage", get(disk_usage))
        .with_state(store);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}
