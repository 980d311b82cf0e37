//! The event RPC HTTP server.
//!
//! Two endpoints:
//!
//! | Route         | Purpose                                            |
//! |---------------|----------------------------------------------------|
//! | `POST /rpc`   | Accept a JSON event, enqueue it for local delivery |
//! | `GET /status` | HTML table of block owners and unallocated blocks  |
//!
//! `POST /rpc` answers `{"Success": true}` on success; senders treat any
//! other status as a transient error and retry. There is no
//! authentication — the endpoint is meant for a trusted home network.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::dispatch::Event;
use crate::placement::current_owner;
use crate::store::ReplicatedStore;

#[derive(Clone)]
struct RpcContext {
    in_tx: mpsc::UnboundedSender<Event>,
    store: ReplicatedStore,
    config: Arc<Config>,
}

async fn rpc_handler(
    req: Request<Body>,
    ctx: RpcContext,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::POST && path == "/rpc" {
        let body = hyper::body::to_bytes(req.into_body()).await?;
        return match serde_json::from_slice::<Event>(&body) {
            Ok(event) => {
                debug!(source = %event.source, "Event received");
                if ctx.in_tx.send(event).is_err() {
                    return Ok(plain(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "delivery loop stopped",
                    ));
                }
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"Success": true}"#))
                    .unwrap_or_default())
            }
            Err(e) => Ok(plain(
                StatusCode::BAD_REQUEST,
                &format!("malformed event: {}", e),
            )),
        };
    }

    if method == Method::GET && path == "/status" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Body::from(render_status(&ctx)))
            .unwrap_or_default());
    }

    Ok(plain(StatusCode::NOT_FOUND, "not found"))
}

fn plain(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

/// The informational status page: one row per configured block, plus a
/// list of blocks without an owner.
fn render_status(ctx: &RpcContext) -> String {
    let mut rows = String::new();
    let mut unallocated = Vec::new();

    for name in ctx.config.blocks.keys() {
        match current_owner(&ctx.store, name) {
            Some(owner) => {
                rows.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td></tr>\n",
                    name, owner
                ));
            }
            None => unallocated.push(name.as_str()),
        }
    }

    format!(
        "<html><body>\n<h1>Block owners</h1>\n\
         <table border=\"1\">\n<tr><th>Block</th><th>Owner</th></tr>\n{}</table>\n\
         <h2>Unallocated</h2>\n<p>{}</p>\n</body></html>\n",
        rows,
        if unallocated.is_empty() {
            "none".to_string()
        } else {
            unallocated.join(", ")
        }
    )
}

/// Starts the event RPC server. Runs until the process exits.
pub async fn start_rpc_server(
    addr: String,
    in_tx: mpsc::UnboundedSender<Event>,
    store: ReplicatedStore,
    config: Arc<Config>,
) {
    let socket: SocketAddr = match addr.parse() {
        Ok(socket) => socket,
        Err(e) => {
            error!(addr = %addr, error = %e, "Invalid RPC listen address");
            return;
        }
    };

    let ctx = RpcContext {
        in_tx,
        store,
        config,
    };

    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let ctx = ctx.clone();
                async move { rpc_handler(req, ctx).await }
            }))
        }
    });

    let server = Server::bind(&socket).serve(make_svc);
    info!(addr = %socket, "Event RPC endpoint started — POST /rpc, GET /status");

    if let Err(e) = server.await {
        error!(error = %e, "Event RPC server error");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
