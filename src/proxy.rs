//! Request forwarding
//! Re-issues decrypted requests against the route's backend and translates
//! the backend response (or the failure) into the response sent to the client

use crate::error::ProxyError;
use crate::routes::{DomainRoute, RouteTable};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION,
    TRANSFER_ENCODING,
};
use hyper::{HeaderMap, Method, Response, StatusCode, Uri};
use reqwest::redirect::Policy;
use serde_json::Value;
use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Settings for the outbound leg
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Skip certificate and hostname verification of backends.
    pub trust_targets_unconditionally: bool,
    /// Total time allowed for one backend exchange, redirects included
    pub timeout: Duration,
    pub max_redirects: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            trust_targets_unconditionally: true,
            timeout: Duration::from_secs(30),
            max_redirects: 5,
        }
    }
}

/// A decrypted inbound request
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path and query as received
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: SocketAddr,
}

/// Response to write back to the client
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn from_error(err: &ProxyError) -> Self {
        let mut headers = HeaderMap::new();

        match err {
            ProxyError::BackendVerbatim {
                content_type,
                location,
                ..
            } => {
                if let Some(content_type) = content_type {
                    headers.insert(CONTENT_TYPE, content_type.clone());
                }
                if let Some(location) = location {
                    headers.insert(LOCATION, location.clone());
                }
            }
            _ => {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                );
            }
        }

        Self {
            status: err.status(),
            headers,
            body: err.body(),
        }
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Stateless forwarder shared by every connection
pub struct ProxyHandler {
    routes: Arc<RouteTable>,
    client: reqwest::Client,
}

impl ProxyHandler {
    pub fn new(routes: Arc<RouteTable>, upstream: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let max_redirects = upstream.max_redirects;

        // Stop (rather than fail) once the limit is hit so the last 3xx is kept
        let redirect = Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(upstream.trust_targets_unconditionally)
            .tls_sni(true)
            .timeout(upstream.timeout)
            .redirect(redirect)
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self { routes, client })
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Route a request by hostname and forward it.
    /// `sni` is the name negotiated during the handshake, used when the
    /// request itself carries no host.
    pub async fn handle(&self, request: ProxyRequest, sni: Option<&str>) -> ProxyResponse {
        let host = request_host(&request, sni);

        let route = match host.as_deref().and_then(|h| self.routes.get(h)) {
            Some(route) => route,
            None => {
                debug!("No route for host {:?}", host);
                return ProxyResponse::from_error(&ProxyError::NotConfigured {
                    host: host.unwrap_or_default(),
                });
            }
        };

        self.forward(request, route).await
    }

    /// Forward to `route.target`; every failure becomes a response
    pub async fn forward(&self, request: ProxyRequest, route: &DomainRoute) -> ProxyResponse {
        let url = backend_url(&route.target, &request.uri);

        match self.exchange(request, url.clone()).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    ProxyError::BackendVerbatim { status, .. } => {
                        warn!(target_url = %url, %status, "Relaying interrupted backend response");
                    }
                    ProxyError::InternalError { code, .. } => {
                        error!(
                            target_url = %url,
                            code = code.unwrap_or("unknown"),
                            error = %err,
                            "Forward request error"
                        );
                    }
                    other => {
                        error!(target_url = %url, error = %other, "Forward request error");
                    }
                }
                ProxyResponse::from_error(&err)
            }
        }
    }

    async fn exchange(&self, request: ProxyRequest, url: Url) -> Result<ProxyResponse, ProxyError> {
        debug!("Forwarding {} {} to {}", request.method, request.uri, url);

        let headers = outbound_headers(&request.headers, request.remote_addr);
        let mut builder = self.client.request(request.method, url).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;
        let status = response.status();

        if is_stopped_redirect(status, response.headers()) {
            let content_type = response.headers().get(CONTENT_TYPE).cloned();
            let location = response.headers().get(LOCATION).cloned();
            let body = response.bytes().await.map_err(|e| classify(&e))?;
            return Err(ProxyError::BackendVerbatim {
                status,
                content_type,
                location,
                body,
            });
        }

        let headers = response_headers(response.headers());
        let body = response.bytes().await.map_err(|e| classify(&e))?;
        let body = translate_body(headers.get(CONTENT_TYPE), body);

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Hostname used for routing: URI authority, then `Host`, then SNI
pub fn request_host(request: &ProxyRequest, sni: Option<&str>) -> Option<String> {
    request
        .uri
        .host()
        .map(str::to_owned)
        .or_else(|| {
            request
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(strip_port)
        })
        .or_else(|| sni.map(str::to_owned))
        .filter(|host| !host.is_empty())
        .map(|host| host.to_ascii_lowercase())
}

fn strip_port(host: &str) -> String {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest).to_string();
    }
    host.split(':').next().unwrap_or(host).to_string()
}

/// The target with its path and query replaced by the inbound ones
pub fn backend_url(target: &Url, uri: &Uri) -> Url {
    let mut url = target.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url
}

/// Inbound headers minus the ones the client recomputes, plus `X-Forwarded-For`
pub fn outbound_headers(inbound: &HeaderMap, remote_addr: SocketAddr) -> HeaderMap {
    let mut headers = inbound.clone();

    for name in [HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING] {
        headers.remove(name);
    }

    if let Ok(value) = HeaderValue::from_str(&remote_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    headers
}

/// Backend headers minus framing headers (`Content-Length` is recomputed)
pub fn response_headers(backend: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(backend.len());

    for (name, value) in backend {
        if name == TRANSFER_ENCODING || name == CONNECTION || name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers
}

/// Re-encode declared JSON; anything else (or JSON that fails to parse) is relayed as-is
pub fn translate_body(content_type: Option<&HeaderValue>, body: Bytes) -> Bytes {
    let is_json = content_type
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    if !is_json {
        return body;
    }

    match serde_json::from_slice::<Value>(&body) {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(_) => body,
        },
        Err(e) => {
            debug!("Backend JSON did not parse, relaying raw bytes: {}", e);
            body
        }
    }
}

fn is_stopped_redirect(status: StatusCode, headers: &HeaderMap) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) && headers.contains_key(LOCATION)
}

/// Map a transport failure to its response category
fn classify(err: &reqwest::Error) -> ProxyError {
    let details = error_chain(err);

    if err.is_timeout() {
        return ProxyError::InternalError {
            details,
            code: Some("ETIMEDOUT"),
        };
    }
    if err.is_redirect() {
        return ProxyError::InternalError {
            details,
            code: Some("ERR_FR_TOO_MANY_REDIRECTS"),
        };
    }

    let mut code = None;
    let mut source: Option<&(dyn StdError + 'static)> = Some(err as &(dyn StdError + 'static));

    while let Some(current) = source {
        if current.is::<rustls::Error>() {
            return ProxyError::SslError { details };
        }

        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return ProxyError::Unavailable { details };
            }
            // tokio-rustls reports handshake failures as io errors wrapping rustls::Error
            if io_err.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
                return ProxyError::SslError { details };
            }
            code = code.or_else(|| io_error_code(io_err.kind()));
        }

        source = current.source();
    }

    ProxyError::InternalError { details, code }
}

fn io_error_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
        io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        io::ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
        _ => None,
    }
}

/// `outer: inner: root` without repeating messages already included by a wrapper
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(current) = source {
        let text = current.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = current.source();
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CredentialSet;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote() -> SocketAddr {
        "203.0.113.7:51234".parse().unwrap()
    }

    fn test_route(host: &str, target: &str) -> DomainRoute {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let key = cert.key_pair.serialize_pem();
        let pem = cert.cert.pem();
        DomainRoute {
            hostname: host.to_string(),
            target: Url::parse(target).unwrap(),
            name: None,
            credential: Arc::new(
                CredentialSet::from_pem(key.as_bytes(), pem.as_bytes(), pem.as_bytes()).unwrap(),
            ),
        }
    }

    fn handler_for(routes: Vec<DomainRoute>) -> ProxyHandler {
        ProxyHandler::new(Arc::new(RouteTable::from_routes(routes)), &UpstreamConfig::default()).unwrap()
    }

    fn get(uri: &str, host: &str) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_str(host).unwrap());
        ProxyRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers,
            body: Bytes::new(),
            remote_addr: remote(),
        }
    }

    fn json_body(response: &ProxyResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn test_backend_url_replaces_path_and_query() {
        let target = Url::parse("https://10.0.0.5:8443/base").unwrap();

        let url = backend_url(&target, &"/api/users?id=1&x=y".parse().unwrap());
        assert_eq!(url.as_str(), "https://10.0.0.5:8443/api/users?id=1&x=y");

        let url = backend_url(&target, &"/".parse().unwrap());
        assert_eq!(url.as_str(), "https://10.0.0.5:8443/");
    }

    #[test]
    fn test_backend_url_keeps_target_authority() {
        let target = Url::parse("https://backend.internal").unwrap();
        let url = backend_url(&target, &"//evil.example.com/steal".parse().unwrap());
        assert_eq!(url.host_str(), Some("backend.internal"));
    }

    #[test]
    fn test_outbound_headers_rewrite() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("api.example.com"));
        inbound.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.9.9.9"));
        inbound.insert("authorization", HeaderValue::from_static("Bearer abc"));
        inbound.append("accept", HeaderValue::from_static("text/html"));
        inbound.append("accept", HeaderValue::from_static("application/json"));

        let outbound = outbound_headers(&inbound, remote());

        assert!(outbound.get(HOST).is_none());
        assert!(outbound.get(CONNECTION).is_none());
        assert!(outbound.get(CONTENT_LENGTH).is_none());
        assert_eq!(outbound.get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
        assert_eq!(outbound.get_all(X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(outbound.get("authorization").unwrap(), "Bearer abc");
        assert_eq!(outbound.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn test_response_headers_filtering() {
        let mut backend = HeaderMap::new();
        backend.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        backend.insert(CONNECTION, HeaderValue::from_static("close"));
        backend.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        backend.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        backend.append("set-cookie", HeaderValue::from_static("a=1"));
        backend.append("set-cookie", HeaderValue::from_static("b=2"));

        let headers = response_headers(&backend);

        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_request_host_resolution() {
        let request = get("/", "API.Example.com:8443");
        assert_eq!(request_host(&request, None).as_deref(), Some("api.example.com"));

        let request = get("/", "[::1]:443");
        assert_eq!(request_host(&request, None).as_deref(), Some("::1"));

        let mut request = get("/", "x");
        request.headers.clear();
        assert_eq!(
            request_host(&request, Some("sni.example.com")).as_deref(),
            Some("sni.example.com")
        );
        assert_eq!(request_host(&request, None), None);

        let mut request = get("https://absolute.example.com/path", "other.example.com");
        request.headers.clear();
        assert_eq!(request_host(&request, None).as_deref(), Some("absolute.example.com"));
    }

    #[test]
    fn test_translate_body() {
        let json_type = HeaderValue::from_static("application/json; charset=utf-8");
        let re_encoded = translate_body(Some(&json_type), Bytes::from_static(b"{ \"a\" : [1, 2] }"));
        assert_eq!(re_encoded, Bytes::from_static(b"{\"a\":[1,2]}"));

        let broken = Bytes::from_static(b"{\"a\": ");
        assert_eq!(translate_body(Some(&json_type), broken.clone()), broken);

        let html = HeaderValue::from_static("text/html");
        let raw = Bytes::from_static(b"{ \"a\" : 1 }");
        assert_eq!(translate_body(Some(&html), raw.clone()), raw);
        assert_eq!(translate_body(None, raw.clone()), raw);
    }

    #[tokio::test]
    async fn test_unconfigured_domain_returns_404_without_outbound_call() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        let handler = handler_for(vec![test_route("api.example.com", &backend.uri())]);
        let response = handler.handle(get("/test", "unknown.example.com"), None).await;

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&response), json!({"error": "Domain not configured"}));
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let backend = MockServer::start().await;
        let original = json!({"zeta": 1, "alpha": [true, null, {"nested": "value"}], "pi": 3.5});
        let pretty = serde_json::to_vec_pretty(&original).unwrap();

        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(pretty, "application/json"))
            .mount(&backend)
            .await;

        let handler = handler_for(vec![test_route("api.example.com", &backend.uri())]);
        let response = handler.handle(get("/data", "api.example.com"), None).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(json_body(&response), original);
        assert_eq!(response.body, Bytes::from(serde_json::to_vec(&original).unwrap()));
    }

    #[tokio::test]
    async fn test_malformed_json_relayed_raw() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{\"truncated\": ", "application/json"))
            .mount(&backend)
            .await;

        let handler = handler_for(vec![test_route("api.example.com", &backend.uri())]);
        let response = handler.handle(get("/", "api.example.com"), None).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"{\"truncated\": "));
    }

    #[tokio::test]
    async fn test_binary_body_byte_exact() {
        let backend = MockServer::start().await;
        let png: Vec<u8> = (0..=255u8).chain([0x89, b'P', b'N', b'G', 0, 0xff]).collect();

        Mock::given(method("GET"))
            .and(path("/logo.png"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(png.clone(), "image/png"))
            .mount(&backend)
            .await;

        let handler = handler_for(vec![test_route("cdn.example.com", &backend.uri())]);
        let response = handler.handle(get("/logo.png", "cdn.example.com"), None).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.as_ref(), png.as_slice());
        assert_eq!(response.headers.get(CONTENT_TYPE).unwrap(), "image/png");
    }

    #[tokio::test]
    async fn test_backend_status_and_headers_preserved() {
        let backend = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(
                ResponseTemplate::new(418)
                    .append_header("set-cookie", "a=1")
                    .append_header("set-cookie", "b=2")
                    .insert_header("x-backend", "teapot")
                    .set_body_string("short and stout"),
            )
            .mount(&backend)
            .await;

        let handler = handler_for(vec![test_route("api.example.com", &backend.uri())]);
        let mut request = get("/pot", "api.example.com");
        request.method = Method::DELETE;
        let response = handler.handle(request, None).await;

        assert_eq!(response.status.as_u16(), 418);
        assert_eq!(response.headers.get("x-backend").unwrap(), "teapot");
        assert_eq!(response.headers.get_all("set-cookie").iter().count(), 2);
        assert!(response.headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(response.body, Bytes::from_static(b"short and stout"));
    }

    #[tokio::test]
    async fn test_request_body_and_headers_forwarded() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&backend)
            .await;

        let handler = handler_for(vec![test_route("api.example.com", &backend.uri())]);
        let mut request = get("/submit?draft=true", "api.example.com");
        request.method = Method::POST;
        request.body = Bytes::from_static(b"payload bytes");
        request.headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        request.headers.insert("x-custom", HeaderValue::from_static("kept"));

        let response = handler.handle(request, None).await;
        assert_eq!(response.status, StatusCode::CREATED);

        let received = backend.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let seen = &received[0];
        assert_eq!(seen.body, b"payload bytes");
        assert_eq!(seen.url.query(), Some("draft=true"));
        assert_eq!(seen.headers.get("x-forwarded-for").unwrap(), "203.0.113.7");
        assert_eq!(seen.headers.get("x-custom").unwrap(), "kept");
        assert_ne!(seen.headers.get("host").unwrap(), "api.example.com");
        assert_ne!(
            seen.headers.get("connection").map(|v| v.as_bytes()),
            Some(b"keep-alive".as_slice())
        );
    }

    #[tokio::test]
    async fn test_connection_refused_maps_to_503() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let handler = handler_for(vec![test_route(
            "api.example.com",
            &format!("http://127.0.0.1:{}", port),
        )]);
        let response = handler.handle(get("/", "api.example.com"), None).await;

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(&response);
        assert_eq!(body["error"], "Target server unavailable");
        assert!(body["details"].is_string());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_500_with_code() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&backend)
            .await;

        let routes = Arc::new(RouteTable::from_routes(vec![test_route(
            "api.example.com",
            &backend.uri(),
        )]));
        let upstream = UpstreamConfig {
            timeout: Duration::from_millis(200),
            ..UpstreamConfig::default()
        };
        let handler = ProxyHandler::new(routes, &upstream).unwrap();
        let response = handler.handle(get("/", "api.example.com"), None).await;

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(&response);
        assert_eq!(body["error"], "Proxy Internal Error");
        assert_eq!(body["code"], "ETIMEDOUT");
    }

    #[tokio::test]
    async fn test_redirects_followed() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
            .mount(&backend)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
            .mount(&backend)
            .await;

        let handler = handler_for(vec![test_route("api.example.com", &backend.uri())]);
        let response = handler.handle(get("/old", "api.example.com"), None).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_redirect_limit_relays_last_response() {
        let backend = MockServer::start().await;
        for hop in 0..8 {
            Mock::given(method("GET"))
                .and(path(format!("/hop/{}", hop)))
                .respond_with(
                    ResponseTemplate::new(302)
                        .insert_header("location", format!("/hop/{}", hop + 1).as_str())
                        .set_body_raw(format!("{{\"hop\": {}", hop), "application/json"),
                )
                .mount(&backend)
                .await;
        }

        let handler = handler_for(vec![test_route("api.example.com", &backend.uri())]);
        let response = handler.handle(get("/hop/0", "api.example.com"), None).await;

        // The original request plus five redirects, then the chain stops
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(response.body, Bytes::from_static(b"{\"hop\": 5"));
        assert_eq!(response.headers.get(LOCATION).unwrap(), "/hop/6");

        let received = backend.received_requests().await.unwrap();
        assert_eq!(received.len(), 6);
    }

    #[tokio::test]
    async fn test_truncated_redirect_body_maps_to_500() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Announces 100 body bytes, sends 7, then closes
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut request = [0u8; 4096];
                    let _ = stream.read(&mut request).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 100\r\n\r\npartial",
                        )
                        .await;
                    let _ = stream.shutdown().await;
                    let mut rest = Vec::new();
                    let _ = stream.read_to_end(&mut rest).await;
                });
            }
        });

        let upstream = UpstreamConfig {
            max_redirects: 0,
            ..UpstreamConfig::default()
        };
        let routes = RouteTable::from_routes(vec![test_route("api.example.com", &format!("http://{}", addr))]);
        let handler = ProxyHandler::new(Arc::new(routes), &upstream).unwrap();

        let response = handler.handle(get("/start", "api.example.com"), None).await;

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(&response)["error"], "Proxy Internal Error");
        assert!(response.headers.get(LOCATION).is_none());
    }
}
