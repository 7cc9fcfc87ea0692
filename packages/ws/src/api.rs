//! HTTP surface for the runtime.
//!
//! Mounts three things on the host actix-web server: the upgrade entry
//! point (intended as the app's default service so any route path reaches
//! it), the health endpoint, and the metrics endpoint. This module is the
//! only place that touches `actix_ws` types; everything below it works
//! over the [`ConnectionSink`] trait and [`InboundFrame`] stream.

#![allow(clippy::future_not_send)]

use std::sync::Arc;

use actix_web::{
    http::{header, StatusCode},
    web, HttpRequest, HttpResponse,
};
use actix_ws::{CloseCode, CloseReason, Message};
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::{
    handler::InboundFrame,
    pool::{ConnectionSink, SinkError},
    router::BoxError,
    upgrade::{AdmissionRejection, AdmissionRequest, WsRuntime},
};

/// [`ConnectionSink`] over an actix-ws session.
pub struct SessionSink(actix_ws::Session);

impl SessionSink {
    #[must_use]
    pub fn new(session: actix_ws::Session) -> Self {
        Self(session)
    }
}

#[async_trait]
impl ConnectionSink for SessionSink {
    async fn send_text(&self, data: &str) -> Result<(), SinkError> {
        self.0
            .clone()
            .text(data.to_string())
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), SinkError> {
        self.0
            .clone()
            .binary(bytes::Bytes::copy_from_slice(data))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn ping(&self) -> Result<(), SinkError> {
        self.0.clone().ping(b"").await.map_err(|_| SinkError::Closed)
    }

    async fn pong(&self, payload: &[u8]) -> Result<(), SinkError> {
        self.0.clone().pong(payload).await.map_err(|_| SinkError::Closed)
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), SinkError> {
        self.0
            .clone()
            .close(Some(CloseReason {
                code: CloseCode::from(code),
                description: Some(reason.to_string()),
            }))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

fn to_inbound(message: Message) -> Option<Result<InboundFrame, BoxError>> {
    match message {
        Message::Text(text) => Some(Ok(InboundFrame::Text(text.to_string()))),
        Message::Binary(bytes) => Some(Ok(InboundFrame::Binary(bytes))),
        Message::Ping(bytes) => Some(Ok(InboundFrame::Ping(bytes))),
        Message::Pong(_) => Some(Ok(InboundFrame::Pong)),
        Message::Close(reason) => Some(Ok(InboundFrame::Close(reason.map(|r| {
            (u16::from(r.code), r.description.unwrap_or_default())
        })))),
        Message::Continuation(_) => {
            Some(Err("continuation frames are not supported".into()))
        }
        Message::Nop => None,
    }
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|value| value.to_str().ok())
}

fn is_upgrade_request(req: &HttpRequest) -> bool {
    let connection_upgrade = header_str(req, "connection")
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
    let upgrade_websocket =
        header_str(req, "upgrade").is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

/// The upgrade entry point.
///
/// Register as the app's default service so requests for any route path
/// land here; non-upgrade traffic falls through with 404.
///
/// # Errors
///
/// * If the protocol handshake cannot be initiated on an admitted request
pub async fn websocket(
    req: HttpRequest,
    stream: web::Payload,
    runtime: web::Data<Arc<WsRuntime>>,
) -> actix_web::Result<HttpResponse> {
    let runtime = Arc::clone(runtime.get_ref());

    if !is_upgrade_request(&req) {
        return Ok(HttpResponse::NotFound().finish());
    }

    let path = req.path().to_string();
    let peer = req.peer_addr();
    let admission_request = AdmissionRequest {
        path: &path,
        peer,
        forwarded_for: header_str(&req, "x-forwarded-for"),
        real_ip: header_str(&req, "x-real-ip"),
        origin: header_str(&req, "origin"),
    };

    match runtime.admit(&admission_request).await {
        Ok(admission) => {
            let handle = actix_ws::handle(&req, stream);
            let (response, session, msg_stream) = match handle {
                Ok(parts) => parts,
                Err(err) => {
                    runtime.release_in_flight(peer);
                    return Err(err);
                }
            };

            let sink: Arc<dyn ConnectionSink> = Arc::new(SessionSink::new(session));
            let frames = Box::pin(msg_stream.filter_map(|message| async move {
                match message {
                    Ok(message) => to_inbound(message),
                    Err(err) => Some(Err(Box::new(err) as BoxError)),
                }
            }));

            // Spawn the connection task so the handshake response returns
            // immediately.
            actix_web::rt::spawn(runtime.attach_connection(admission, path, peer, sink, frames));
            Ok(response)
        }

        Err(AdmissionRejection::NotHandled) => Ok(HttpResponse::NotFound().finish()),

        Err(AdmissionRejection::Ignored) => Ok(HttpResponse::BadRequest()
            .insert_header((header::CONNECTION, "close"))
            .finish()),

        Err(AdmissionRejection::Refused { status, reason }) => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Ok(HttpResponse::build(status)
                .insert_header((header::CONNECTION, "close"))
                .body(reason))
        }

        Err(AdmissionRejection::CloseAfterHandshake { code, reason }) => {
            let (response, session, _msg_stream) = actix_ws::handle(&req, stream)?;
            actix_web::rt::spawn(async move {
                let _ = session
                    .close(Some(CloseReason {
                        code: CloseCode::from(code),
                        description: Some(reason),
                    }))
                    .await;
            });
            Ok(response)
        }
    }
}

/// Health endpoint: 200 for healthy/degraded, 503 for unhealthy.
pub async fn health(runtime: web::Data<Arc<WsRuntime>>) -> HttpResponse {
    let (status, payload) = runtime.health_payload();
    let status_code = match status {
        crate::health::HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    HttpResponse::build(status_code)
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .json(payload)
}

/// Metrics endpoint with the detailed runtime breakdown.
pub async fn metrics(runtime: web::Data<Arc<WsRuntime>>) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .json(runtime.metrics_payload())
}

/// Mounts the runtime on an actix-web app: health endpoints at the
/// configured path (when enabled) and the upgrade entry point as the
/// default service.
pub fn configure(config: &mut web::ServiceConfig, runtime: &Arc<WsRuntime>) {
    config.app_data(web::Data::new(Arc::clone(runtime)));

    let health_check = &runtime.config().monitoring.health_check;
    if health_check.enabled {
        let base = health_check.path.trim_end_matches('/').to_string();
        config.route(&format!("{base}/metrics"), web::get().to(metrics));
        config.route(&base, web::get().to(health));
    }

    config.default_service(web::to(websocket));
}
