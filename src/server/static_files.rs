//! Bundled browser asset serving with an in-memory gzip cache.
//!
//! Both the session terminal page and the hub dashboard are prebuilt
//! bundles on disk; this serves them with the fixed MIME map and caches
//! gzipped payloads keyed by absolute path.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use flate2::write::GzEncoder;
use flate2::Compression;

/// Environment variable overriding the web bundle root.
pub const WEB_ROOT_ENV: &str = "ITWILLSYNC_WEB_ROOT";

/// Resolve the root directory holding the web bundles: `$ITWILLSYNC_WEB_ROOT`
/// if set, else `web/` beside the executable, else `web/` under the current
/// directory.
pub fn web_root() -> PathBuf {
    if let Ok(dir) = std::env::var(WEB_ROOT_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("web")))
        .unwrap_or_else(|| PathBuf::from("web"))
}

/// Asset root for the per-session terminal page.
pub fn terminal_assets() -> PathBuf {
    web_root().join("terminal")
}

/// Asset root for the hub dashboard.
pub fn dashboard_assets() -> PathBuf {
    web_root().join("dashboard")
}

const COMPRESSIBLE: &[&str] = &["html", "js", "css", "json", "svg"];

/// Serves files under a fixed root, gzipping compressible types on demand
/// and caching the compressed bytes in memory.
pub struct AssetCache {
    root: PathBuf,
    gzip: Mutex<HashMap<PathBuf, Arc<Vec<u8>>>>,
}

impl AssetCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            gzip: Mutex::new(HashMap::new()),
        }
    }

    /// Serve `request_path` (`/`-prefixed). `gzip_ok` reflects the request's
    /// `Accept-Encoding`. Unknown paths and traversal attempts yield 404.
    pub async fn serve(&self, request_path: &str, gzip_ok: bool) -> Response {
        let relative = match sanitize(request_path) {
            Some(p) => p,
            None => return not_found(),
        };
        let path = self.root.join(&relative);

        let mime = mime_guess::from_path(&path).first_or_octet_stream();
        let compressible = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| COMPRESSIBLE.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);

        if gzip_ok && compressible {
            if let Some(cached) = self.cached(&path) {
                return gzip_response(&mime, cached);
            }
        }

        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => return not_found(),
        };

        if gzip_ok && compressible {
            match compress(&content) {
                Ok(compressed) => {
                    let compressed = Arc::new(compressed);
                    if let Ok(mut cache) = self.gzip.lock() {
                        cache.insert(path.clone(), compressed.clone());
                    }
                    return gzip_response(&mime, compressed);
                }
                Err(e) => {
                    tracing::warn!("gzip failed for {}: {}", path.display(), e);
                }
            }
        }

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime.as_ref())
            .body(Body::from(content))
            .unwrap_or_else(|_| not_found())
    }

    fn cached(&self, path: &Path) -> Option<Arc<Vec<u8>>> {
        self.gzip.lock().ok()?.get(path).cloned()
    }
}

/// Normalize a request path to a safe relative path. `/` maps to
/// `index.html`; any parent-dir component rejects the request.
fn sanitize(request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let target = if trimmed.is_empty() { "index.html" } else { trimmed };

    let path = Path::new(target);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(path.to_path_buf())
}

/// Whether a request advertises gzip support.
pub fn accepts_gzip(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false)
}

fn compress(content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    encoder.finish()
}

fn gzip_response(mime: &mime_guess::Mime, payload: Arc<Vec<u8>>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_ENCODING, "gzip")
        .body(Body::from(payload.as_ref().clone()))
        .unwrap_or_else(|_| not_found())
}

fn not_found() -> Response {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not found"))
        .unwrap_or_default()
}
