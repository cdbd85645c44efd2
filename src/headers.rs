//! Edge response headers: permissive CORS and the standard security headers

use hyper::header::{
    HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS, CONTENT_SECURITY_POLICY,
    REFERRER_POLICY, STRICT_TRANSPORT_SECURITY, VARY, X_CONTENT_TYPE_OPTIONS,
    X_DNS_PREFETCH_CONTROL, X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use hyper::{HeaderMap, Method, StatusCode};

use crate::proxy::ProxyResponse;

const DEFAULT_CSP: &str = "default-src 'self';base-uri 'self';font-src 'self' https: data:;\
form-action 'self';frame-ancestors 'self';img-src 'self' data:;object-src 'none';\
script-src 'self';script-src-attr 'none';style-src 'self' https: 'unsafe-inline';\
upgrade-insecure-requests";

const SECURITY_HEADERS: [(HeaderName, &str); 12] = [
    (CONTENT_SECURITY_POLICY, DEFAULT_CSP),
    (HeaderName::from_static("cross-origin-opener-policy"), "same-origin"),
    (HeaderName::from_static("cross-origin-resource-policy"), "same-origin"),
    (HeaderName::from_static("origin-agent-cluster"), "?1"),
    (REFERRER_POLICY, "no-referrer"),
    (STRICT_TRANSPORT_SECURITY, "max-age=15552000; includeSubDomains"),
    (X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (X_DNS_PREFETCH_CONTROL, "off"),
    (HeaderName::from_static("x-download-options"), "noopen"),
    (X_FRAME_OPTIONS, "SAMEORIGIN"),
    (HeaderName::from_static("x-permitted-cross-domain-policies"), "none"),
    (X_XSS_PROTECTION, "0"),
];

const PREFLIGHT_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// Headers added to every response leaving the proxy
#[derive(Debug, Clone, Copy)]
pub struct EdgeHeaders {
    pub enabled: bool,
}

impl Default for EdgeHeaders {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl EdgeHeaders {
    /// Local answer for a CORS preflight; `None` when the request must be forwarded
    pub fn preflight(&self, method: &Method, request_headers: &HeaderMap) -> Option<ProxyResponse> {
        if !self.enabled || method != Method::OPTIONS {
            return None;
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(PREFLIGHT_METHODS),
        );
        headers.insert(VARY, HeaderValue::from_static("Access-Control-Request-Headers"));
        if let Some(requested) = request_headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }

        Some(ProxyResponse {
            status: StatusCode::NO_CONTENT,
            headers,
            body: Default::default(),
        })
    }

    /// Fill in edge headers the backend did not set itself
    pub fn apply(&self, headers: &mut HeaderMap) {
        if !self.enabled {
            return;
        }

        headers
            .entry(ACCESS_CONTROL_ALLOW_ORIGIN)
            .or_insert_with(|| HeaderValue::from_static("*"));

        for (name, value) in SECURITY_HEADERS {
            headers
                .entry(name)
                .or_insert_with(|| HeaderValue::from_static(value));
        }
    }
}
