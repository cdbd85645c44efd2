//! TLS-terminating listener
//! Certificate choice happens in the handshake (SNI only); HTTP requests
//! decoded afterwards are handed to the proxy handler

use crate::certificate::{server_tls_config, CredentialStore, SniResolver};
use crate::error::{ProxyError, StartupError};
use crate::headers::EdgeHeaders;
use crate::proxy::{ProxyHandler, ProxyRequest, ProxyResponse};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Default ceiling for inbound request bodies (50 MB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Default time allowed for a client to complete the TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time allowed for a client to send a complete request head
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause after a failed accept, e.g. when file descriptors run out
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listener configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub max_body_bytes: usize,
    pub handshake_timeout: Duration,
    pub header_read_timeout: Duration,
    pub edge_headers: EdgeHeaders,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 443,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
            edge_headers: EdgeHeaders::default(),
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    acceptor: TlsAcceptor,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a new proxy server.
    /// The credential store and the handler must share the same route table.
    pub fn new(
        config: ProxyConfig,
        credentials: Arc<CredentialStore>,
        handler: Arc<ProxyHandler>,
    ) -> Result<Self, StartupError> {
        let tls_config = server_tls_config(SniResolver::new(credentials))?;

        Ok(Self {
            config,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            handler,
        })
    }

    /// Bind the configured address and serve forever
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;

        info!("HTTPS reverse proxy running on port {}", self.config.port);
        self.handler.routes().log_routes();

        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    accept_backoff(&e).await;
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// TLS handshake, then HTTP/1.1 on the decrypted stream
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let tls_stream = tokio::time::timeout(self.config.handshake_timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| anyhow!("TLS handshake timed out after {:?}", self.config.handshake_timeout))?
            .map_err(|e| anyhow!("TLS handshake failed: {}", e))?;

        // Only the hostname crosses from the TLS phase into the HTTP phase
        let sni: Option<Arc<str>> = tls_stream.get_ref().1.server_name().map(Arc::from);
        debug!("TLS established with {} (SNI {:?})", remote_addr, sni);

        let io = TokioIo::new(tls_stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.header_read_timeout)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    let sni = sni.clone();
                    async move { server.handle_request(req, remote_addr, sni.as_deref()).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle one decrypted request; never fails
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        sni: Option<&str>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let started = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();

        // Preflights are answered before any other header is added
        let response = match self.config.edge_headers.preflight(req.method(), req.headers()) {
            Some(preflight) => preflight,
            None => {
                let mut response = match self.process_request(req, remote_addr, sni).await {
                    Ok(response) => response,
                    Err(err) => ProxyResponse::from_error(&err),
                };
                self.config.edge_headers.apply(&mut response.headers);
                response
            }
        };

        info!(
            client = %remote_addr.ip(),
            "{} {} {} {} ms",
            method,
            uri,
            response.status.as_u16(),
            started.elapsed().as_millis()
        );

        Ok(response.into_response())
    }

    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        sni: Option<&str>,
    ) -> Result<ProxyResponse, ProxyError> {
        let (parts, body) = req.into_parts();
        let body = read_body(body, self.config.max_body_bytes).await?;

        let request = ProxyRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            remote_addr,
        };

        Ok(self.handler.handle(request, sni).await)
    }
}

/// Log a failed accept and wait before the next one
async fn accept_backoff(err: &std::io::Error) {
    error!("Accept error: {}", err);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Buffer the request body, enforcing the size ceiling
async fn read_body(body: Incoming, limit: usize) -> Result<Bytes, ProxyError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ProxyError::PayloadTooLarge { limit })
        }
        Err(e) => Err(ProxyError::BadRequest {
            details: e.to_string(),
        }),
    }
}
