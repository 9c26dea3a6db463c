//! Per-connection request handling: authentication, CONNECT interception,
//! interceptor chain and forwarding.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use secrecy::SecretString;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use super::auth::{self, PROXY_REALM};
use super::tls::LeafCertStore;
use super::upstream::{RequestForm, UpstreamRoute};
use crate::interceptor::Interceptor;
use crate::{Error, Result};

pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// State shared by every connection of one proxy.
pub(crate) struct Shared {
    pub password: SecretString,
    pub interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
    pub route: RwLock<UpstreamRoute>,
    pub leaf_certs: LeafCertStore,
    pub client_tls: Arc<rustls::ClientConfig>,
    pub interceptor_timeout: Duration,
    pub upstream_timeout: Duration,
    pub shutdown: watch::Receiver<bool>,
}

/// Where an intercepted request is going.
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    tls: bool,
}

impl Target {
    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Serve one client connection until it closes or the proxy shuts down.
pub(crate) async fn serve_client(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let mut shutdown = shared.shutdown.clone();
    let service = {
        let shared = Arc::clone(&shared);
        service_fn(move |req| handle(Arc::clone(&shared), req))
    };
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(%peer, error = %e, "client connection ended with error");
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.as_mut().await;
        }
    }
}

async fn handle(
    shared: Arc<Shared>,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    if !auth::is_authorized(req.headers(), &shared.password) {
        debug!(method = %req.method(), uri = %req.uri(), "rejecting unauthenticated proxy request");
        return Ok(proxy_auth_required());
    }

    if req.method() == Method::CONNECT {
        return Ok(handle_connect(shared, req));
    }

    let Some(target) = plain_target(req.uri()) else {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "proxy requests must use an absolute http:// URI",
        ));
    };
    Ok(forward(&shared, req, target).await)
}

fn plain_target(uri: &Uri) -> Option<Target> {
    if uri.scheme_str() != Some("http") {
        return None;
    }
    let host = uri.host()?;
    Some(Target {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port: uri.port_u16().unwrap_or(80),
        tls: false,
    })
}

/// Accept the CONNECT, then terminate TLS on the upgraded stream with a
/// leaf certificate for the requested host.
fn handle_connect(shared: Arc<Shared>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    };
    let target = Target {
        host: authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string(),
        port: authority.port_u16().unwrap_or(443),
        tls: true,
    };

    let server_config = match shared.leaf_certs.server_config_for(&target.host) {
        Ok(config) => config,
        Err(e) => {
            warn!(host = %target.host, error = %e, "failed to issue leaf certificate");
            return text_response(StatusCode::BAD_GATEWAY, "certificate generation failed");
        }
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(u) => u,
            Err(e) => {
                debug!(error = %e, "CONNECT upgrade failed");
                return;
            }
        };
        let tls = match TlsAcceptor::from(server_config)
            .accept(TokioIo::new(upgraded))
            .await
        {
            Ok(tls) => tls,
            Err(e) => {
                debug!(host = %target.host, error = %e, "client TLS handshake failed");
                return;
            }
        };

        let mut shutdown = shared.shutdown.clone();
        let service = {
            let shared = Arc::clone(&shared);
            let target = target.clone();
            service_fn(move |req: Request<Incoming>| {
                let shared = Arc::clone(&shared);
                let target = target.clone();
                async move { Ok::<_, Infallible>(forward(&shared, req, target).await) }
            })
        };
        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(tls), service);
        tokio::pin!(conn);

        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(host = %target.host, error = %e, "intercepted connection ended with error");
                }
            }
            _ = shutdown.changed() => {
                conn.as_mut().graceful_shutdown();
                let _ = conn.as_mut().await;
            }
        }
    });

    Response::new(empty())
}

/// Run interceptors over the request and send it to the origin.
async fn forward(shared: &Shared, req: Request<Incoming>, target: Target) -> Response<ProxyBody> {
    let (mut parts, body) = req.into_parts();

    let absolute = match absolute_uri(&parts.uri, &target) {
        Ok(uri) => uri,
        Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    parts.uri = absolute;

    if let Err(resp) = run_interceptors(shared, &mut parts).await {
        return resp;
    }

    strip_hop_by_hop(&mut parts.headers);
    if let Ok(host) = HeaderValue::from_str(&host_header(&target)) {
        parts.headers.insert(header::HOST, host);
    }

    let route = match shared.route.read() {
        Ok(route) => route.clone(),
        Err(_) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "proxy state poisoned"),
    };

    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let request = Request::from_parts(parts, body);
    let sent = tokio::time::timeout(shared.upstream_timeout, send(shared, &route, &target, request)).await;

    match sent {
        Ok(Ok(mut resp)) => {
            info!(%method, %uri, status = resp.status().as_u16(), "forwarded");
            strip_hop_by_hop(resp.headers_mut());
            resp.map(|b| b.boxed())
        }
        Ok(Err(e)) => {
            warn!(%method, %uri, error = %e, "upstream request failed");
            text_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
        Err(_) => {
            warn!(%method, %uri, "upstream request timed out");
            text_response(StatusCode::GATEWAY_TIMEOUT, "upstream request timed out")
        }
    }
}

async fn run_interceptors(
    shared: &Shared,
    parts: &mut http::request::Parts,
) -> std::result::Result<(), Response<ProxyBody>> {
    let chain: Vec<Arc<dyn Interceptor>> = match shared.interceptors.read() {
        Ok(list) => list.clone(),
        Err(_) => {
            return Err(text_response(StatusCode::INTERNAL_SERVER_ERROR, "proxy state poisoned"))
        }
    };

    for interceptor in chain {
        match tokio::time::timeout(shared.interceptor_timeout, interceptor.intercept(parts)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(interceptor = interceptor.name(), error = %e, "interceptor failed");
                return Err(text_response(StatusCode::BAD_GATEWAY, "request interceptor failed"));
            }
            Err(_) => {
                warn!(interceptor = interceptor.name(), "interceptor timed out");
                return Err(text_response(StatusCode::GATEWAY_TIMEOUT, "request interceptor timed out"));
            }
        }
    }
    Ok(())
}

async fn send(
    shared: &Shared,
    route: &UpstreamRoute,
    target: &Target,
    mut request: Request<Incoming>,
) -> Result<Response<Incoming>> {
    let (io, form) = route.connect(&target.host, target.port, target.tls).await?;

    match form {
        RequestForm::Origin => {
            let origin_form = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .parse::<Uri>()
                .map_err(|e| Error::Proxy(format!("invalid request path: {}", e)))?;
            *request.uri_mut() = origin_form;
        }
        RequestForm::Absolute { proxy_authorization } => {
            if let Some(auth) = proxy_authorization {
                let mut value = HeaderValue::from_str(&auth)
                    .map_err(|_| Error::Upstream("invalid upstream proxy credentials".into()))?;
                value.set_sensitive(true);
                request.headers_mut().insert(header::PROXY_AUTHORIZATION, value);
            }
        }
    }

    if target.tls {
        let name = ServerName::try_from(target.host.clone())
            .map_err(|e| Error::Proxy(format!("invalid server name {}: {}", target.host, e)))?;
        let tls = TlsConnector::from(Arc::clone(&shared.client_tls))
            .connect(name, io)
            .await
            .map_err(|e| Error::io(format!("TLS handshake with {}", target.authority()), e))?;
        exchange(tls, request).await
    } else {
        exchange(io, request).await
    }
}

async fn exchange<S>(io: S, request: Request<Incoming>) -> Result<Response<Incoming>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(io))
        .await
        .map_err(|e| Error::Proxy(format!("upstream handshake failed: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection ended with error");
        }
    });
    sender
        .send_request(request)
        .await
        .map_err(|e| Error::Proxy(format!("upstream request failed: {}", e)))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Absolute URI for the request, so interceptors always see scheme and host.
/// Scheme and authority come from the connection target, never the request
/// line, so the URI host is always the host being dialed.
fn absolute_uri(uri: &Uri, target: &Target) -> Result<Uri> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Uri::builder()
        .scheme(if target.tls { "https" } else { "http" })
        .authority(host_header(target))
        .path_and_query(path)
        .build()
        .map_err(|e| Error::Proxy(format!("invalid request URI: {}", e)))
}

fn host_header(target: &Target) -> String {
    let default_port = if target.tls { 443 } else { 80 };
    if target.port == default_port {
        if target.host.contains(':') {
            format!("[{}]", target.host)
        } else {
            target.host.clone()
        }
    } else {
        target.authority()
    }
}

/// Remove headers that only apply to a single hop, including any named in
/// `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

fn empty() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from(format!("{}\n", message)))
            .map_err(|never| match never {})
            .boxed(),
    );
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn proxy_auth_required() -> Response<ProxyBody> {
    let mut resp = text_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy Authentication Required",
    );
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", PROXY_REALM)) {
        resp.headers_mut().insert(header::PROXY_AUTHENTICATE, value);
    }
    resp
}
