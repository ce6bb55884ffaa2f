//! Listener loops and the shared request handler

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, LOCATION, ORIGIN, UPGRADE};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{AdvertisedAddresses, ListenerKind, ProxyConfig};
use crate::headers::{self, CLOUD_HEADER, FORWARDED_PROTO_HEADER};
use crate::oauth::{self, CallbackRequest, OAuthHandler};
use crate::routes::{core_ui_location, route, Route};
use crate::ProxyError;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const TEST_TOKEN_LEN: usize = 32;

struct ProxyContext {
    target: SocketAddr,
    client: Client<HttpConnector, Incoming>,
    oauth: Arc<dyn OAuthHandler>,
    addresses: watch::Receiver<AdvertisedAddresses>,
    test_token: String,
}

/// Local reverse proxy, not yet bound
pub struct ProxyServer {
    config: ProxyConfig,
    tls: Arc<rustls::ServerConfig>,
    oauth: Arc<dyn OAuthHandler>,
    addresses: watch::Receiver<AdvertisedAddresses>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        tls: Arc<rustls::ServerConfig>,
        oauth: Arc<dyn OAuthHandler>,
        addresses: watch::Receiver<AdvertisedAddresses>,
    ) -> Self {
        Self {
            config,
            tls,
            oauth,
            addresses,
        }
    }

    /// Bind both listeners. Port 0 picks an ephemeral port.
    pub async fn bind(self) -> Result<BoundProxy, ProxyError> {
        let internal = bind_listener(self.config.internal_addr).await?;
        let secure = bind_listener(self.config.secure_addr).await?;

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(usize::MAX)
            .build_http();

        let test_token = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TEST_TOKEN_LEN)
            .map(char::from)
            .collect();

        let bound = BoundProxy {
            internal_addr: internal.local_addr()?,
            secure_addr: secure.local_addr()?,
            internal,
            secure,
            acceptor: TlsAcceptor::from(self.tls),
            ctx: Arc::new(ProxyContext {
                target: self.config.target,
                client,
                oauth: self.oauth,
                addresses: self.addresses,
                test_token,
            }),
        };

        info!(
            "Proxy listening on http://{} (internal) and https://{} (secure), forwarding to {}",
            bound.internal_addr, bound.secure_addr, bound.ctx.target
        );
        Ok(bound)
    }
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        })
}

/// Proxy with both listeners bound
pub struct BoundProxy {
    internal: TcpListener,
    secure: TcpListener,
    internal_addr: SocketAddr,
    secure_addr: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<ProxyContext>,
}

impl BoundProxy {
    pub fn internal_addr(&self) -> SocketAddr {
        self.internal_addr
    }

    pub fn secure_addr(&self) -> SocketAddr {
        self.secure_addr
    }

    /// Token answered on `/testPortForward`, fresh per process start
    pub fn test_token(&self) -> &str {
        &self.ctx.test_token
    }

    /// Serve both listeners until one of them fails
    pub async fn run(self) -> Result<(), ProxyError> {
        let plain = accept_plain(self.internal, self.ctx.clone());
        let tls = accept_tls(self.secure, self.acceptor, self.ctx);

        tokio::select! {
            result = plain => result,
            result = tls => result,
        }
    }
}

async fn accept_plain(listener: TcpListener, ctx: Arc<ProxyContext>) -> Result<(), ProxyError> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, ctx, ListenerKind::Internal).await {
                debug!("Internal connection from {} ended: {}", peer_addr, e);
            }
        });
    }
}

async fn accept_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<ProxyContext>,
) -> Result<(), ProxyError> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept TLS connection: {}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!("TLS handshake failed from {}: {}", peer_addr, e);
                    return;
                }
            };
            if let Err(e) = serve_connection(tls_stream, ctx, ListenerKind::Secure).await {
                debug!("Secure connection from {} ended: {}", peer_addr, e);
            }
        });
    }
}

async fn serve_connection<S>(
    stream: S,
    ctx: Arc<ProxyContext>,
    kind: ListenerKind,
) -> Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(handle(req, ctx, kind).await) }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
}

async fn handle(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    kind: ListenerKind,
) -> Response<ProxyBody> {
    let request_cloud = req.headers().get(CLOUD_HEADER).cloned();
    let origin = req.headers().get(ORIGIN).cloned();
    let addresses = ctx.addresses.borrow().clone();

    let mut response = if is_upgrade(&req) {
        proxy_upgrade(req, &ctx).await
    } else {
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        match route(&path, query.as_deref(), addresses.public_hostname.as_deref()) {
            Route::OAuthCallback => {
                oauth_callback(query.as_deref().unwrap_or(""), &ctx, &addresses).await
            }
            Route::Redirect(location) => redirect(&location),
            Route::Component(target_path) => forward(req, &ctx, Some(target_path)).await,
            Route::TestPortForward => text(StatusCode::OK, ctx.test_token.clone()),
            Route::Proxy => forward(req, &ctx, None).await,
        }
    };

    headers::stamp(response.headers_mut(), kind, request_cloud, &addresses);
    headers::apply_cors(response.headers_mut(), origin.as_ref(), &addresses);
    response
}

fn is_upgrade<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && req.headers().contains_key(UPGRADE)
}

fn target_uri(target: SocketAddr, path_and_query: &str) -> Result<Uri, http::Error> {
    Ok(format!("http://{}{}", target, path_and_query).parse::<Uri>()?)
}

async fn forward(
    req: Request<Incoming>,
    ctx: &ProxyContext,
    fixed_path: Option<&str>,
) -> Response<ProxyBody> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = match fixed_path {
        Some(path) => path.to_string(),
        None => parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
    };

    parts.uri = match target_uri(ctx.target, &path_and_query) {
        Ok(uri) => uri,
        Err(e) => {
            warn!("Rejecting request with unusable path {}: {}", path_and_query, e);
            return text(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };
    parts.headers.insert(
        FORWARDED_PROTO_HEADER,
        HeaderValue::from_static("https"),
    );

    match ctx.client.request(Request::from_parts(parts, body)).await {
        Ok(response) => response.map(|body| body.boxed()),
        Err(e) => {
            warn!("Internal application unreachable at {}: {}", ctx.target, e);
            text(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

/// Forward a protocol upgrade on a dedicated connection and splice the
/// upgraded streams once both sides switch
async fn proxy_upgrade(mut req: Request<Incoming>, ctx: &ProxyContext) -> Response<ProxyBody> {
    let stream = match TcpStream::connect(ctx.target).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Internal application unreachable at {}: {}", ctx.target, e);
            return text(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let (mut sender, conn) =
        match hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream)).await
        {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Upgrade handshake with internal application failed: {}", e);
                return text(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upgraded target connection ended: {}", e);
        }
    });

    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut builder = Request::builder()
        .method(req.method().clone())
        .version(req.version())
        .uri(
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
        );
    for (name, value) in req.headers() {
        builder = builder.header(name, value);
    }
    let outbound = match builder
        .header(FORWARDED_PROTO_HEADER, "https")
        .body(Empty::new())
    {
        Ok(r) => r,
        Err(e) => {
            warn!("Could not build upgrade request: {}", e);
            return text(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let mut response = match sender.send_request(outbound).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Upgrade request to internal application failed: {}", e);
            return text(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return response.map(|body| body.boxed());
    }

    let target_upgrade = hyper::upgrade::on(&mut response);
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, target_upgrade) {
            Ok((client, target)) => {
                let mut client = TokioIo::new(client);
                let mut target = TokioIo::new(target);
                match tokio::io::copy_bidirectional(&mut client, &mut target).await {
                    Ok((up, down)) => debug!("Upgraded stream closed ({} up, {} down)", up, down),
                    Err(e) => debug!("Upgraded stream error: {}", e),
                }
            }
            Err(e) => debug!("Upgrade did not complete: {}", e),
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, empty())
}

async fn oauth_callback(
    query: &str,
    ctx: &ProxyContext,
    addresses: &AdvertisedAddresses,
) -> Response<ProxyBody> {
    let request = match oauth::parse_callback_query(query) {
        Ok(r) => r,
        Err(e) => {
            warn!("{}", e);
            return text(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    match request {
        CallbackRequest::Login { token_info } => {
            if let Err(e) = ctx.oauth.complete_login(&token_info).await {
                error!("Login completion failed: {}", e);
                return text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
            info!("Login completed through OAuth callback");
            redirect(&core_ui_location(addresses.public_hostname.as_deref()))
        }
        CallbackRequest::Device(device) => {
            if let Err(e) = ctx
                .oauth
                .device_callback(&device.device_id, &device.callback_url)
                .await
            {
                error!("OAuth callback for device {} failed: {}", device.device_id, e);
                return text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
            redirect(&device.redirect)
        }
    }
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(body.into())
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

fn redirect(location: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_upgrade() {
        let req = Request::builder()
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade(&req));

        let req = Request::builder()
            .header(CONNECTION, "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade(&req));
    }

    #[test]
    fn test_target_uri() {
        let target: SocketAddr = "127.0.0.1:11080".parse().unwrap();
        assert_eq!(
            target_uri(target, "/endpoint/x?y=1").unwrap().to_string(),
            "http://127.0.0.1:11080/endpoint/x?y=1"
        );
    }

    #[test]
    fn test_redirect_response() {
        let response = redirect("/endpoint/core/public/");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/endpoint/core/public/");
    }
}
