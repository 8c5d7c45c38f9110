use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::config::HttpConfig;
use crate::models::{Denial, SecurityRequest, TokenClaims, Verdict};
use crate::SecurityEngine;

const DEVICE_HEADER: &str = "x-device-id";
const LOCATION_HEADER: &str = "x-client-location";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Traefik and Authelia style first, then nginx `auth_request`.
const FORWARDED_URI_HEADERS: [&str; 2] = ["x-forwarded-uri", "x-original-uri"];
const FORWARDED_METHOD_HEADERS: [&str; 2] = ["x-forwarded-method", "x-original-method"];
/// `x-session-mfa: true` becomes the session attribute `mfa = true`.
const SESSION_HEADER_PREFIX: &str = "x-session-";

/// Which request the pipeline should judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    /// The request itself; the middleware fronts the protected routes.
    Direct,
    /// The request a trusted proxy names in its forwarding headers.
    ForwardAuth,
}

/// Runs the security pipeline in front of a router. Denials end the request;
/// on allow the validated claims, if any, go into the request extensions.
pub async fn security_middleware(
    State(engine): State<Arc<SecurityEngine>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    run_pipeline(&engine, RequestSource::Direct, req, next).await
}

/// [`security_middleware`] for an auth endpoint called by a reverse proxy.
pub async fn forward_auth_middleware(
    State(engine): State<Arc<SecurityEngine>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    run_pipeline(&engine, RequestSource::ForwardAuth, req, next).await
}

async fn run_pipeline(
    engine: &SecurityEngine,
    source: RequestSource,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let request = security_request(&req, &engine.config.http, source);

    match engine.orchestrator.check(&request).await {
        Verdict::Allow { claims, .. } => {
            if let Some(claims) = claims {
                req.extensions_mut().insert(claims);
            }
            Ok(next.run(req).await)
        }
        Verdict::Deny(denial) => Err(denial.into()),
    }
}

/// Build the pipeline input from an HTTP request. Forwarding and session
/// headers count only when the socket peer is a trusted proxy.
pub fn security_request(req: &Request, http: &HttpConfig, source: RequestSource) -> SecurityRequest {
    let headers = req.headers();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let from_proxy = peer.is_some_and(|ip| http.is_trusted(ip));

    let forwarded = match source {
        RequestSource::ForwardAuth if from_proxy => forwarded_target(req),
        _ => None,
    };
    let (resource, action) = forwarded.unwrap_or_else(|| {
        (
            req.uri().path().to_string(),
            action_for(req.method().as_str()),
        )
    });

    let mut request = SecurityRequest::new(client_ip(headers, peer, http), resource, action);
    request.bearer_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    request.user_agent = header_value(headers, header::USER_AGENT.as_str());
    request.device = header_value(headers, DEVICE_HEADER);
    request.location = header_value(headers, LOCATION_HEADER);
    if from_proxy {
        request.session = session_attributes(headers);
    }
    request
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| header_value(headers, name))
}

/// Path and action of the request a forward-auth proxy asks about.
fn forwarded_target(req: &Request) -> Option<(String, String)> {
    let uri = first_header(req.headers(), &FORWARDED_URI_HEADERS)?;
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    if !path.starts_with('/') {
        return None;
    }

    let method = first_header(req.headers(), &FORWARDED_METHOD_HEADERS)
        .unwrap_or_else(|| req.method().as_str().to_string());
    Some((path.to_string(), action_for(&method.trim().to_ascii_uppercase())))
}

fn session_attributes(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(SESSION_HEADER_PREFIX)?;
            let value = value.to_str().ok()?;
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// The socket peer, unless it is a trusted proxy. Then `x-forwarded-for` is
/// walked from the nearest hop back and the first untrusted hop is the client.
fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, http: &HttpConfig) -> IpAddr {
    let Some(peer) = peer else {
        return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    };
    if !http.is_trusted(peer) {
        return peer;
    }

    let hops: Vec<&str> = headers
        .get_all(FORWARDED_FOR_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .collect();

    let mut client = peer;
    for hop in hops.iter().rev() {
        let Ok(ip) = hop.parse::<IpAddr>() else {
            break;
        };
        client = ip;
        if !http.is_trusted(ip) {
            break;
        }
    }
    client
}

fn action_for(method: &str) -> String {
    match method {
        "GET" | "HEAD" => "read".to_string(),
        "POST" => "create".to_string(),
        "PUT" | "PATCH" => "update".to_string(),
        "DELETE" => "delete".to_string(),
        other => other.to_lowercase(),
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        AppError::from(self).into_response()
    }
}

/// Decision endpoint shape: allow is 200 with the score, deny is the error response.
impl IntoResponse for Verdict {
    fn into_response(self) -> Response {
        match self {
            Verdict::Allow {
                claims,
                anomaly_score,
                flagged,
            } => (
                StatusCode::OK,
                Json(serde_json::json!({
                    "allowed": true,
                    "subject": claims.map(|c| c.sub),
                    "anomaly_score": anomaly_score,
                    "flagged": flagged,
                })),
            )
                .into_response(),
            Verdict::Deny(denial) => denial.into_response(),
        }
    }
}

/// Extractor for handlers behind [`security_middleware`] that need a caller.
pub struct Authenticated(pub TokenClaims);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TokenClaims>()
            .cloned()
            .map(Authenticated)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Method;

    const PROXY: &str = "10.0.0.2";

    fn proxies() -> HttpConfig {
        HttpConfig {
            trusted_proxies: vec![PROXY.parse().unwrap()],
        }
    }

    fn from_peer(mut req: Request, peer: &str) -> Request {
        let addr = SocketAddr::new(peer.parse().unwrap(), 40000);
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_request_mapping() {
        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/posts/7?force=true")
            .header(header::AUTHORIZATION, "Bearer abc.def.ghi")
            .header(header::USER_AGENT, "Firefox")
            .header(FORWARDED_FOR_HEADER, "203.0.113.5, 10.0.0.1")
            .header(DEVICE_HEADER, "managed")
            .body(Body::empty())
            .unwrap();
        let req = from_peer(req, PROXY);

        let request = security_request(&req, &proxies(), RequestSource::Direct);
        assert_eq!(request.ip, ip("10.0.0.1"));
        assert_eq!(request.resource, "/posts/7");
        assert_eq!(request.action, "delete");
        assert_eq!(request.bearer_token.as_deref(), Some("abc.def.ghi"));
        assert_eq!(request.user_agent.as_deref(), Some("Firefox"));
        assert_eq!(request.device.as_deref(), Some("managed"));
        assert!(request.location.is_none());
    }

    #[test]
    fn test_missing_peer_falls_back_to_unspecified() {
        let req = Request::builder()
            .uri("/")
            .header(FORWARDED_FOR_HEADER, "203.0.113.5")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            client_ip(req.headers(), None, &proxies()),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn test_forwarded_for_ignored_from_untrusted_peer() {
        let req = Request::builder()
            .uri("/")
            .header(FORWARDED_FOR_HEADER, "203.0.113.5")
            .body(Body::empty())
            .unwrap();
        let req = from_peer(req, "198.51.100.20");

        let request = security_request(&req, &proxies(), RequestSource::Direct);
        assert_eq!(request.ip, ip("198.51.100.20"));
        let request = security_request(&req, &HttpConfig::default(), RequestSource::Direct);
        assert_eq!(request.ip, ip("198.51.100.20"));
    }

    #[test]
    fn test_forwarded_for_walks_back_over_trusted_hops() {
        let http = HttpConfig {
            trusted_proxies: vec![ip(PROXY), ip("10.0.0.3")],
        };
        // A client-supplied first hop is never reached.
        let req = Request::builder()
            .uri("/")
            .header(FORWARDED_FOR_HEADER, "1.2.3.4, 203.0.113.5")
            .header(FORWARDED_FOR_HEADER, "10.0.0.3")
            .body(Body::empty())
            .unwrap();
        let peer = Some(ip(PROXY));
        assert_eq!(client_ip(req.headers(), peer, &http), ip("203.0.113.5"));

        let req = Request::builder()
            .uri("/")
            .header(FORWARDED_FOR_HEADER, "garbage, 10.0.0.3")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(req.headers(), peer, &http), ip("10.0.0.3"));

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(client_ip(req.headers(), peer, &http), ip(PROXY));
    }

    #[test]
    fn test_forward_auth_judges_the_named_request() {
        let req = Request::builder()
            .uri("/auth")
            .header("x-forwarded-uri", "/admin/users?page=2")
            .header("x-forwarded-method", "delete")
            .body(Body::empty())
            .unwrap();
        let req = from_peer(req, PROXY);

        let request = security_request(&req, &proxies(), RequestSource::ForwardAuth);
        assert_eq!(request.resource, "/admin/users");
        assert_eq!(request.action, "delete");

        // The same headers mean nothing to the direct middleware.
        let request = security_request(&req, &proxies(), RequestSource::Direct);
        assert_eq!(request.resource, "/auth");
        assert_eq!(request.action, "read");
    }

    #[test]
    fn test_forward_auth_nginx_headers_and_method_fallback() {
        let req = Request::builder()
            .uri("/auth")
            .header("x-original-uri", "/posts/9")
            .body(Body::empty())
            .unwrap();
        let req = from_peer(req, PROXY);

        let request = security_request(&req, &proxies(), RequestSource::ForwardAuth);
        assert_eq!(request.resource, "/posts/9");
        assert_eq!(request.action, "read");
    }

    #[test]
    fn test_forward_auth_headers_ignored_from_untrusted_peer() {
        let req = Request::builder()
            .uri("/auth")
            .header("x-forwarded-uri", "/posts")
            .body(Body::empty())
            .unwrap();
        let req = from_peer(req, "198.51.100.20");

        let request = security_request(&req, &proxies(), RequestSource::ForwardAuth);
        assert_eq!(request.resource, "/auth");
    }

    #[test]
    fn test_session_attributes_only_from_trusted_proxy() {
        let build = |peer: &str| {
            let req = Request::builder()
                .uri("/reports")
                .header("x-session-mfa", "true")
                .header("x-session-tenant", "acme")
                .header("x-session-", "ignored")
                .body(Body::empty())
                .unwrap();
            from_peer(req, peer)
        };

        let request = security_request(&build(PROXY), &proxies(), RequestSource::Direct);
        assert_eq!(request.session.len(), 2);
        assert_eq!(request.session.get("mfa").map(String::as_str), Some("true"));
        assert_eq!(request.session.get("tenant").map(String::as_str), Some("acme"));

        let request = security_request(&build("198.51.100.20"), &proxies(), RequestSource::Direct);
        assert!(request.session.is_empty());
    }

    #[test]
    fn test_non_bearer_authorization_is_ignored() {
        let req = Request::builder()
            .uri("/")
            .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert!(security_request(&req, &HttpConfig::default(), RequestSource::Direct)
            .bearer_token
            .is_none());
    }
}
