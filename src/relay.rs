//! Primary-to-secondary hand-off for replies that must leave from the other host.
//!
//! A primary-role process that resolves a request to endpoint 2 or 3 posts a
//! [`RelayEnvelope`] to the secondary's listener at [`RELAY_PATH`]. The secondary
//! answers the client from its own socket at that index.

use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, ServerError};
use crate::handler::BindingHandler;
use crate::message::StunMessage;

pub const RELAY_PATH: &str = "/v1/gostun/pri2sec";
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Client address as observed by the primary.
    pub from: SocketAddr,
    pub message: StunMessage,
    /// Endpoint that must send the reply.
    pub index: usize,
}

/// Blocking HTTP client towards the peer's relay listener.
#[derive(Clone)]
pub struct RelayClient {
    agent: ureq::Agent,
    url: String,
}

impl RelayClient {
    pub fn new(peer: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        RelayClient {
            agent,
            url: format!("http://{peer}{RELAY_PATH}"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts one envelope. Any non-200 answer is a failure.
    pub fn forward(&self, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        let response = self.agent.post(&self.url).send_json(envelope)?;
        match response.status() {
            200 => Ok(()),
            code => Err(RelayError::Status(code)),
        }
    }
}

/// Running relay listener; stops when dropped or on [`RelayListener::shutdown`].
pub struct RelayListener {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RelayListener {
    /// Binds `addr` and serves relay requests on a dedicated thread.
    pub fn start(addr: SocketAddr, handler: Arc<BindingHandler>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .map_err(|source| ServerError::RelayListener { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ServerError::RelayListener { addr, source })?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().clamp(1, 4))
            .thread_name("relay-http")
            .enable_all()
            .build()
            .map_err(|source| ServerError::RelayListener { addr, source })?;

        let (tx, rx) = oneshot::channel::<()>();
        let server = {
            let _guard = runtime.enter();
            let make_svc = make_service_fn(move |_conn| {
                let handler = Arc::clone(&handler);
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| {
                        serve_relay(Arc::clone(&handler), req)
                    }))
                }
            });
            Server::from_tcp(listener)?
                .serve(make_svc)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
        };

        let thread = std::thread::Builder::new()
            .name("relay-listener".into())
            .spawn(move || {
                if let Err(e) = runtime.block_on(server) {
                    error!(error = %e, "relay listener stopped");
                }
            })
            .map_err(ServerError::Spawn)?;

        info!(addr = %bound, path = RELAY_PATH, "relay listener started");
        Ok(RelayListener {
            addr: bound,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_relay(
    handler: Arc<BindingHandler>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST || req.uri().path() != RELAY_PATH {
        return Ok(status(StatusCode::NOT_FOUND, "not found"));
    }
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "cannot read relay body");
            return Ok(status(StatusCode::BAD_REQUEST, "cannot read body"));
        }
    };
    let envelope: RelayEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "malformed relay body");
            return Ok(status(StatusCode::BAD_REQUEST, "malformed relay body"));
        }
    };
    if !handler.owns(envelope.index) {
        warn!(index = envelope.index, role = %handler.role(), "relay for unowned endpoint");
        return Ok(status(StatusCode::BAD_REQUEST, "endpoint not owned"));
    }
    if !envelope.message.is_binding_request() {
        warn!(index = envelope.index, "relayed message is not a binding request");
        return Ok(status(StatusCode::BAD_REQUEST, "not a binding request"));
    }

    debug!(index = envelope.index, from = %envelope.from, "relayed binding request");
    match handler.reply_from(envelope.index, envelope.from, &envelope.message) {
        Ok(()) => Ok(Response::new(Body::empty())),
        Err(e) => {
            error!(index = envelope.index, from = %envelope.from, error = %e, "relayed reply failed");
            Ok(status(StatusCode::INTERNAL_SERVER_ERROR, "reply failed"))
        }
    }
}

fn status(code: StatusCode, text: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = code;
    response
}
