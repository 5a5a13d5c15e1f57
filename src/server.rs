use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::USER_AGENT;
use http::Method;
use http::Request;
use http::Response;
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Body;
use hyper::body::Bytes;
use hyper::body::Frame;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::rt::TokioTimer;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::net::TcpSocket;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::balancer::SharedBalancer;
use crate::metrics;
use crate::result::Error;
use crate::utils;

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub client_max_idle_per_host: usize,
    #[serde(with = "utils::serde_millis")]
    pub server_header_read_timeout: Duration,
    /// Path answered with prometheus metrics instead of being proxied.
    pub metrics_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_owned(),
            client_max_idle_per_host: 32,
            server_header_read_timeout: Duration::from_secs(5),
            metrics_path: None,
        }
    }
}

/// Body of every response we produce: either a relayed upstream body or a
/// short text of our own.
pub type ProxyBody = UnsyncBoxBody<Bytes, Error>;

/// Sends a request to a chosen backend.
pub trait Upstream<B>: Send + Sync + 'static {
    type Body: Body<Data = Bytes> + Send + 'static;

    fn forward(
        &self,
        req: Request<B>,
        address: &str,
    ) -> impl Future<Output = crate::Result<Response<Self::Body>>> + Send;
}

pub struct HttpUpstream {
    client: Client<HttpConnector, Incoming>,
}

impl HttpUpstream {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.client_max_idle_per_host)
            .build_http();

        Self { client }
    }
}

impl Upstream<Incoming> for HttpUpstream {
    type Body = Incoming;

    async fn forward(
        &self,
        mut req: Request<Incoming>,
        address: &str,
    ) -> crate::Result<Response<Incoming>> {
        prepare_request(&mut req, address)?;
        Ok(self.client.request(req).await?)
    }
}

fn prepare_request<B>(req: &mut Request<B>, address: &str) -> crate::Result<()> {
    // add schema and host to uri for hyper client
    let mut uri_parts = req.uri().clone().into_parts();
    uri_parts.scheme = Some(http::uri::Scheme::HTTP);
    uri_parts.authority = Some(http::uri::Authority::from_str(address)?);
    if uri_parts.path_and_query.is_none() {
        uri_parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    *req.uri_mut() = http::uri::Uri::from_parts(uri_parts)?;

    Ok(())
}

/// Counts as one active connection on `address` until dropped.
struct ConnectionGuard {
    balancer: SharedBalancer,
    address: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.balancer.release_server(&self.address);
    }
}

/// Picks a backend for `req` and relays its response.
///
/// The backend is released exactly once: when the relayed body is dropped,
/// or right away if forwarding failed.
pub async fn dispatch<B, U>(
    balancer: &SharedBalancer,
    upstream: &U,
    req: Request<B>,
) -> Response<ProxyBody>
where
    U: Upstream<B>,
    <U::Body as Body>::Error: Into<Error>,
{
    let Some(address) = balancer.next_server() else {
        debug!("no available upstream for {}", req.uri());
        metrics::NO_BACKEND_COUNT.inc();
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
    };
    let guard = ConnectionGuard {
        balancer: balancer.clone(),
        address: address.clone(),
    };

    debug!(
        "request for {} will be proxied to {} ({} active)",
        req.uri(),
        address,
        balancer.lock().pool().connections(&address).unwrap_or_default()
    );

    let start = Instant::now();
    let response = upstream.forward(req, &address).await;
    metrics::UPSTREAM_TIMINGS_SECONDS
        .with_label_values(&[&address])
        .observe(start.elapsed().as_secs_f64());

    match response {
        Err(e) => {
            error!("upstream {address} error: {e}");
            metrics::UPSTREAM_ERRORS_COUNT
                .with_label_values(&[&address])
                .inc();
            drop(guard);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Proxy Error")
        }
        Ok(response) => {
            debug!("upstream {} response {}", address, response.status());
            metrics::UPSTREAM_REQUESTS_COUNT
                .with_label_values(&[&address])
                .inc();

            response.map(|body| {
                body.map_err(Into::<Error>::into)
                    .map_frame(move |frame: Frame<Bytes>| {
                        let _ = &guard;
                        frame
                    })
                    .boxed_unsync()
            })
        }
    }
}

fn text_response(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| -> Error { match never {} })
        .boxed_unsync();

    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

/// One access log line, written once the response body is finished or
/// dropped.
struct AccessLog {
    start: Instant,
    method: Method,
    path: String,
    user_agent: String,
    status: StatusCode,
}

impl AccessLog {
    fn new<B>(req: &Request<B>) -> Self {
        Self {
            start: Instant::now(),
            method: req.method().clone(),
            path: req
                .uri()
                .path_and_query()
                .map_or("/", |p| p.as_str())
                .to_owned(),
            user_agent: req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_owned(),
            status: StatusCode::OK,
        }
    }

    fn log_on_finish(mut self, response: Response<ProxyBody>) -> Response<ProxyBody> {
        self.status = response.status();
        response.map(|body| {
            body.map_frame(move |frame: Frame<Bytes>| {
                let _ = &self;
                frame
            })
            .boxed_unsync()
        })
    }
}

impl Drop for AccessLog {
    fn drop(&mut self) {
        info!(
            method = %self.method,
            path = %self.path,
            status = self.status.as_u16(),
            user_agent = %self.user_agent,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "request processed"
        );
    }
}

pub struct Server<U>(Arc<ServerInner<U>>);

struct ServerInner<U> {
    config: Config,
    upstream: U,
}

impl<U> Server<U>
where
    U: Upstream<Incoming>,
    <U::Body as Body>::Error: Into<Error>,
{
    pub fn new(config: Config, upstream: U) -> Self {
        Server(Arc::new(ServerInner { config, upstream }))
    }

    /// Binds the listening socket so that every worker process can share
    /// the same port.
    pub fn bind(&self) -> crate::Result<TcpListener> {
        let addr: SocketAddr = self.0.config.listen_addr.parse()?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        socket.bind(addr)?;

        Ok(socket.listen(1024)?)
    }

    pub async fn run(&self, listener: TcpListener, balancer: SharedBalancer) -> crate::Result<()> {
        info!("server is listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;

            debug!("got client {addr}");

            let server = self.clone();
            let balancer = balancer.clone();
            tokio::spawn(async move {
                let service = service_fn({
                    |req| {
                        let proxy = server.clone();
                        let balancer = balancer.clone();
                        proxy.serve_request(balancer, req)
                    }
                });

                let io = TokioIo::new(stream);

                let mut http = http1::Builder::new();
                http.timer(TokioTimer::new())
                    .header_read_timeout(Some(server.0.config.server_header_read_timeout));
                let result = http.serve_connection(io, &service).await;
                if let Err(err) = result {
                    error!("error during handling client {addr}: {err:?}");
                }
            });
        }
    }

    async fn serve_request(
        self,
        balancer: SharedBalancer,
        req: Request<Incoming>,
    ) -> crate::Result<Response<ProxyBody>> {
        let access = AccessLog::new(&req);

        let response = match &self.0.config.metrics_path {
            Some(metrics_path) if req.uri().path() == metrics_path.as_str() => self.handle_metrics()?,
            _ => dispatch(&balancer, &self.0.upstream, req).await,
        };

        Ok(access.log_on_finish(response))
    }

    fn handle_metrics(&self) -> crate::Result<Response<ProxyBody>> {
        let data = metrics::gather()?;
        let body = Full::new(Bytes::from(data))
            .map_err(|never| -> Error { match never {} })
            .boxed_unsync();

        let resp = Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body(body)?;

        Ok(resp)
    }
}

impl<U> Clone for Server<U> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
