//! Per-container egress proxy.
//!
//! Local containers share the host network, so their egress rules are
//! enforced at an HTTP proxy that every process is pointed at through the
//! `*_PROXY` variables. `CONNECT` tunnels and absolute-form HTTP requests
//! reach their destination only if a rule allows it; with no rules nothing
//! gets out. Clients that ignore the proxy variables are not filtered.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cellgrid_state::{EgressRule, egress_allowed};

use crate::error::RepResult;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Variables that point a process at its proxy.
pub const PROXY_VARS: [&str; 6] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];

/// The container's own loopback listeners stay reachable.
pub const NO_PROXY: &str = "localhost,127.0.0.1";

pub struct EgressProxy {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl EgressProxy {
    pub async fn start(handle: &str, rules: Vec<EgressRule>) -> RepResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let rules = Arc::new(rules);
        let handle = handle.to_string();
        debug!(%handle, %addr, rules = rules.len(), "egress proxy listening");

        let task = tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(%handle, error = %e, "egress proxy accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let rules = rules.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| proxy(req, rules.clone(), handle.clone()));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .with_upgrades()
                        .await
                    {
                        debug!(error = %e, "egress proxy connection closed");
                    }
                });
            }
        });
        Ok(Self { addr, task })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for EgressProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn proxy(
    req: Request<Incoming>,
    rules: Arc<Vec<EgressRule>>,
    handle: String,
) -> Result<Response<ProxyBody>, Infallible> {
    let Some((host, port)) = target(&req) else {
        return Ok(reply(
            StatusCode::BAD_REQUEST,
            "proxy requests need an absolute target".to_string(),
        ));
    };
    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host.as_str(), port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => return Ok(reply(StatusCode::BAD_GATEWAY, format!("{host}: {e}"))),
    };
    let Some(addr) = addrs
        .into_iter()
        .find(|addr| egress_allowed(&rules, "tcp", *addr))
    else {
        debug!(%handle, %host, port, "egress denied");
        return Ok(reply(
            StatusCode::FORBIDDEN,
            format!("egress to {host}:{port} denied"),
        ));
    };
    let upstream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => return Ok(reply(StatusCode::BAD_GATEWAY, format!("{addr}: {e}"))),
    };

    if req.method() == Method::CONNECT {
        tokio::spawn(tunnel(req, upstream, handle));
        return Ok(Response::new(empty()));
    }
    match forward(req, upstream).await {
        Ok(resp) => Ok(resp),
        Err(e) => Ok(reply(StatusCode::BAD_GATEWAY, format!("{addr}: {e}"))),
    }
}

/// Host and port a proxied request is headed for.
fn target(req: &Request<Incoming>) -> Option<(String, u16)> {
    let uri = req.uri();
    let (host, port) = if req.method() == Method::CONNECT {
        let authority = uri.authority()?;
        (authority.host(), authority.port_u16().unwrap_or(443))
    } else {
        (uri.host()?, uri.port_u16().unwrap_or(80))
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port))
}

async fn tunnel(req: Request<Incoming>, mut upstream: TcpStream, handle: String) {
    match hyper::upgrade::on(req).await {
        Ok(upgraded) => {
            let mut client = TokioIo::new(upgraded);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                debug!(%handle, error = %e, "egress tunnel closed");
            }
        }
        Err(e) => debug!(%handle, error = %e, "egress upgrade failed"),
    }
}

/// Send an absolute-form request on as origin-form.
async fn forward(
    mut req: Request<Incoming>,
    upstream: TcpStream,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let origin_form: Option<http::Uri> = req
        .uri()
        .path_and_query()
        .and_then(|p| p.as_str().parse().ok());
    *req.uri_mut() = origin_form.unwrap_or_else(|| http::Uri::from_static("/"));

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "egress upstream connection closed");
        }
    });
    let resp = sender.send_request(req).await?;
    Ok(resp.map(|body| body.boxed()))
}

fn reply(status: StatusCode, message: String) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from(message))
            .map_err(|never| match never {})
            .boxed(),
    );
    *resp.status_mut() = status;
    resp
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
