//! Plain-HTTP side of the single port: `/health` plus the SPA bundle.
//!
//! The SPA is an external collaborator — this handler only needs to get
//! its files onto the wire. Unknown paths fall back to `index.html` so the
//! SPA's client-side router owns the URL space.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::server::WsHub;

/// Largest request head we will buffer before giving up on the client.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

pub async fn serve_http(mut stream: TcpStream, hub: &Arc<WsHub>) -> Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    // Read until the end of the request head. The body, if any, is ignored.
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return respond(&mut stream, 431, "text/plain", b"request head too large").await;
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let mut parts = head.lines().next().unwrap_or("").split_whitespace();
    let method = parts.next().unwrap_or("");
    let raw_path = parts.next().unwrap_or("/");
    let path = raw_path.split('?').next().unwrap_or("/");

    if method != "GET" {
        return respond(&mut stream, 405, "text/plain", b"method not allowed").await;
    }

    if path == "/health" {
        let body = serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": hub.started_at.elapsed().as_secs(),
            "connections": hub.registry.count(),
            "port": hub.config.port,
        })
        .to_string();
        return respond(&mut stream, 200, "application/json", body.as_bytes()).await;
    }

    let Some(static_dir) = hub.config.static_dir.clone() else {
        return respond(&mut stream, 404, "text/plain", b"no static bundle configured").await;
    };

    match resolve_asset(&static_dir, path) {
        Some(file) => {
            let body = tokio::fs::read(&file).await?;
            respond(&mut stream, 200, content_type(&file), &body).await
        }
        None => respond(&mut stream, 404, "text/plain", b"not found").await,
    }
}

/// Map a request path to a file under the bundle directory.
///
/// Traversal components are rejected; missing paths fall back to
/// `index.html` (client-side routing), and `None` only when even the
/// fallback is absent.
fn resolve_asset(static_dir: &Path, request_path: &str) -> Option<PathBuf> {
    let rel = request_path.trim_start_matches('/');
    let candidate = if rel.is_empty() { "index.html" } else { rel };

    let safe = Path::new(candidate)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        let file = static_dir.join(candidate);
        if file.is_file() {
            return Some(file);
        }
        debug!(path = %candidate, "asset not found — falling back to index.html");
    }

    let index = static_dir.join("index.html");
    index.is_file().then_some(index)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript",
        "css" => "text/css",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "ico" => "image/x-icon",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        431 => "Request Header Fields Too Large",
        _ => "Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>").unwrap();
        // Traversal never reaches outside the bundle — it falls back.
        let got = resolve_asset(dir.path(), "/../../etc/passwd").unwrap();
        assert_eq!(got, dir.path().join("index.html"));
    }

    #[test]
    fn resolve_serves_real_assets_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>").unwrap();
        std::fs::write(dir.path().join("app.js"), "js").unwrap();

        assert_eq!(resolve_asset(dir.path(), "/app.js").unwrap(), dir.path().join("app.js"));
        assert_eq!(resolve_asset(dir.path(), "/").unwrap(), dir.path().join("index.html"));
        // Client-side route.
        assert_eq!(
            resolve_asset(dir.path(), "/sessions/42").unwrap(),
            dir.path().join("index.html")
        );
    }

    #[test]
    fn resolve_none_without_index() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_asset(dir.path(), "/missing.js").is_none());
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("a.js")), "text/javascript");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
    }
}
