//! Artifact transfer for download and upload actions.
//!
//! `http://` goes through a plain hyper HTTP/1 connection; `file://` reads
//! and writes the local filesystem, which is what standalone mode and the
//! tests use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{RepError, RepResult};

#[async_trait]
pub trait Transfer: Send + Sync {
    async fn download(&self, url: &str) -> RepResult<Bytes>;
    async fn upload(&self, url: &str, body: Bytes) -> RepResult<()>;
}

pub struct HttpTransfer {
    timeout: Duration,
}

impl HttpTransfer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn request(&self, method: http::Method, url: &str, body: Bytes) -> RepResult<Bytes> {
        let uri: http::Uri = url
            .parse()
            .map_err(|e| RepError::Transfer(format!("{url}: {e}")))?;
        if uri.scheme_str() != Some("http") {
            return Err(RepError::Transfer(format!("{url}: unsupported scheme")));
        }
        let host = uri
            .host()
            .ok_or_else(|| RepError::Transfer(format!("{url}: missing host")))?
            .to_string();
        let address = format!("{host}:{}", uri.port_u16().unwrap_or(80));

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| RepError::Transfer(format!("{url}: {e}")))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| RepError::Transfer(format!("{url}: {e}")))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let path = uri.path_and_query().map_or("/", |p| p.as_str());
            let req = http::Request::builder()
                .method(method)
                .uri(path)
                .header("host", &address)
                .header("user-agent", "cellgrid-rep/0.1")
                .body(Full::new(body))
                .map_err(|e| RepError::Transfer(format!("{url}: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| RepError::Transfer(format!("{url}: {e}")))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(RepError::Transfer(format!("{url}: status {status}")));
            }
            let collected = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| RepError::Transfer(format!("{url}: {e}")))?;
            Ok(collected.to_bytes())
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RepError::Transfer(format!("{url}: timed out"))),
        }
    }
}

impl Default for HttpTransfer {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn download(&self, url: &str) -> RepResult<Bytes> {
        if let Some(path) = url.strip_prefix("file://") {
            let raw = tokio::fs::read(path)
                .await
                .map_err(|e| RepError::Transfer(format!("{url}: {e}")))?;
            return Ok(Bytes::from(raw));
        }
        let body = self.request(http::Method::GET, url, Bytes::new()).await?;
        debug!(%url, bytes = body.len(), "downloaded");
        Ok(body)
    }

    async fn upload(&self, url: &str, body: Bytes) -> RepResult<()> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::write(path, &body)
                .await
                .map_err(|e| RepError::Transfer(format!("{url}: {e}")));
        }
        let len = body.len();
        self.request(http::Method::POST, url, body).await?;
        debug!(%url, bytes = len, "uploaded");
        Ok(())
    }
}

/// Downloads kept in memory by cache key for the life of the cell.
#[derive(Clone, Default)]
pub struct DownloadCache {
    entries: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl DownloadCache {
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn insert(&self, key: &str, content: Bytes) {
        self.entries.write().await.insert(key.to_string(), content);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve one canned HTTP response and hand back the raw request.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn http_download() {
        let (base, server) =
            one_shot_server("HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello")
                .await;
        let body = HttpTransfer::default()
            .download(&format!("{base}/droplet"))
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(server.await.unwrap().starts_with("GET /droplet"));
    }

    #[tokio::test]
    async fn http_error_status_fails() {
        let (base, _server) =
            one_shot_server("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        let err = HttpTransfer::default()
            .download(&format!("{base}/missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn file_urls() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("artifact");
        let url = format!("file://{}", path.display());

        let transfer = HttpTransfer::default();
        transfer.upload(&url, Bytes::from_static(b"bits")).await.unwrap();
        assert_eq!(&transfer.download(&url).await.unwrap()[..], b"bits");
    }

    #[tokio::test]
    async fn unsupported_scheme() {
        assert!(HttpTransfer::default().download("ftp://x/y").await.is_err());
    }

    #[tokio::test]
    async fn cache_holds_entries() {
        let cache = DownloadCache::default();
        assert!(cache.is_empty().await);
        cache.insert("k", Bytes::from_static(b"v")).await;
        assert_eq!(cache.get("k").await.as_deref(), Some(&b"v"[..]));
    }
}
