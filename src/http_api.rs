//! HTTP API server for the fleet controller.
//!
//! Follows the teacher's manual routing-by-tuple-match style (method,
//! path segments) rather than pulling in a router crate.

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::controller::{FleetController, MatchRequest};
use crate::error::FleetError;
use crate::models::{MatchPrivacy, MatchRecord, MatchType};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MatchRequestBody {
    match_id: String,
    game_mode: String,
    #[serde(default)]
    tick_rate: Option<u32>,
    #[serde(default)]
    match_type: Option<MatchType>,
}

#[derive(Debug, Serialize)]
struct MatchDescriptor {
    server_ip: String,
    server_port: u16,
    match_id: String,
    game_mode: String,
    tick_rate: u32,
    container_id: String,
}

impl From<&MatchRecord> for MatchDescriptor {
    fn from(record: &MatchRecord) -> Self {
        Self {
            server_ip: record.server_ip.clone(),
            server_port: record.server_port,
            match_id: record.match_id.clone(),
            game_mode: record.game_mode.clone(),
            tick_rate: record.tick_rate,
            container_id: record.container_id.clone(),
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    controller: Arc<FleetController>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &ApiResponse::success("ok")),

        (Method::POST, ["api", "request-public-match"]) => {
            handle_request_match(req, controller, MatchPrivacy::Public).await
        }
        (Method::POST, ["api", "request-private-match"]) => {
            handle_request_match(req, controller, MatchPrivacy::Private).await
        }
        (Method::GET, ["api", "match-details", match_id]) => {
            handle_match_details(match_id, controller).await
        }
        (Method::GET, ["api", "debug", "vms"]) => handle_debug_vms(controller).await,

        _ => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::<()>::error("Not found"),
        ),
    };

    Ok(response)
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap()
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|_| {
            json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::<()>::error("Failed to read body"),
            )
        })?
        .to_bytes();

    serde_json::from_slice(&body_bytes).map_err(|e| {
        json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::<()>::error(format!("Invalid JSON: {e}")),
        )
    })
}

fn error_response(err: FleetError) -> Response<BoxBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &ApiResponse::<()>::error(err.to_string()))
}

async fn handle_request_match(
    req: Request<Incoming>,
    controller: Arc<FleetController>,
    privacy: MatchPrivacy,
) -> Response<BoxBody> {
    let body: MatchRequestBody = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let match_req = MatchRequest {
        match_id: body.match_id,
        game_mode: body.game_mode,
        tick_rate: body.tick_rate,
        match_type: body.match_type,
    };

    match controller.request_match(match_req, privacy).await {
        Ok(record) => json_response(
            StatusCode::OK,
            &ApiResponse::success(MatchDescriptor::from(&record)),
        ),
        Err(e) => error_response(e),
    }
}

async fn handle_match_details(match_id: &str, controller: Arc<FleetController>) -> Response<BoxBody> {
    match controller.match_details(match_id).await {
        Ok(record) => json_response(
            StatusCode::OK,
            &ApiResponse::success(MatchDescriptor::from(&record)),
        ),
        Err(e) => error_response(e),
    }
}

async fn handle_debug_vms(controller: Arc<FleetController>) -> Response<BoxBody> {
    let snapshot = controller.debug_snapshot().await;
    json_response(
        StatusCode::OK,
        &ApiResponse::success(serde_json::json!({
            "protected_vm": snapshot.protected_vm,
            "vm_pool": snapshot.vm_pool,
            "matches": snapshot.matches.iter().map(MatchDescriptor::from).collect::<Vec<_>>(),
        })),
    )
}

pub async fn run_server(addr: SocketAddr, controller: Arc<FleetController>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    eprintln!("fleetctl HTTP API server listening on http://{addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let controller = Arc::clone(&controller);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let controller = Arc::clone(&controller);
                handle_request(req, controller)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("Error serving connection: {err:?}");
            }
        });
    }
}
