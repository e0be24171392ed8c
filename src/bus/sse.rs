//! SSE endpoint streaming bus topics to browser tabs.
//!
//! `EventSource` can't set headers, so the subscription token travels as a
//! `?token=` query parameter.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::bus::RealtimeBus;
use crate::error::BusError;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: String,
}

/// Build the router serving `GET /realtime?token=...`.
pub fn router(bus: Arc<RealtimeBus>) -> Router {
    Router::new()
        .route("/realtime", get(stream_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(bus)
}

/// Serve the realtime endpoint until the listener fails.
pub async fn serve(
    bus: Arc<RealtimeBus>,
    addr: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Realtime endpoint listening on {}", addr);
    axum::serve(listener, router(bus)).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn stream_handler(
    State(bus): State<Arc<RealtimeBus>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let subscription = match bus.subscribe(&query.token).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::debug!("Rejected realtime subscription: {}", e);
            return (status_for(&e), e.to_string()).into_response();
        }
    };

    let stream = subscription.map(|msg| {
        Ok::<_, Infallible>(
            Event::default()
                .event(msg.topic)
                .data(msg.payload.to_string()),
        )
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text(""))
        .into_response()
}

fn status_for(err: &BusError) -> StatusCode {
    match err {
        BusError::MalformedToken(_) | BusError::TokenExpired | BusError::NoTopics => {
            StatusCode::UNAUTHORIZED
        }
        BusError::TooManySubscribers(_) => StatusCode::SERVICE_UNAVAILABLE,
        BusError::Broker(_) => StatusCode::BAD_GATEWAY,
    }
}
