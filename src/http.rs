//! HTTP transport adapter: maps query parameters onto core commands and
//! serializes whatever the core answers. Long-poll requests simply await
//! their parked channel here, outside the core lock.

use crate::handlers::{handle_command, Outcome};
use crate::protocol::{Command, MonitorAction, MonitorReply};
use crate::state::AppState;
use crate::types::Choice;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/game", get(game_handler))
        .fallback_service(ServeDir::new("static"))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn game_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(cmd) = parse_command(&params) else {
        return (StatusCode::NOT_FOUND, "-").into_response();
    };

    match handle_command(cmd, &state).await {
        Outcome::Subject(update) => Json(update).into_response(),
        Outcome::Info(info) => Json(info).into_response(),
        Outcome::Monitor(reply) => reply.as_text().into_response(),
        Outcome::ParkedSubject(rx) => match rx.await {
            Ok(update) => Json(update).into_response(),
            // evicted while parked; the client gives up or re-polls
            Err(_) => StatusCode::NO_CONTENT.into_response(),
        },
        Outcome::ParkedMonitor(rx) => match rx.await {
            Ok(reply) => reply.as_text().into_response(),
            Err(_) => MonitorReply::Terminal.as_text().into_response(),
        },
        Outcome::Ack => "+".into_response(),
        Outcome::NotFound => (StatusCode::NOT_FOUND, "-").into_response(),
    }
}

/// Build a typed command from the request's key/value attributes.
pub fn parse_command(params: &HashMap<String, String>) -> Option<Command> {
    let identity = params.get("id").cloned().unwrap_or_default();
    if identity.is_empty() {
        return None;
    }
    let is_monitor = params.contains_key("monitor");
    let cmd = params.get("cmd").map(String::as_str)?;

    if is_monitor {
        return match cmd {
            "request" => Some(Command::MonitorRequest {
                monitor_id: identity,
            }),
            "respond" => Some(Command::MonitorRespond {
                monitor_id: identity,
                response: params.get("m").cloned().unwrap_or_default(),
                action: MonitorAction::parse(params.get("q").map(String::as_str).unwrap_or("")),
                sync: params.contains_key("sync"),
            }),
            _ => None,
        };
    }

    let real_id = params.get("realid").and_then(|s| s.parse().ok());
    match cmd {
        "pend" => Some(Command::Pend { identity, real_id }),
        "submit" => {
            let choice = Choice::parse(params.get("choice")?)?;
            Some(Command::Submit {
                identity,
                real_id,
                choice,
            })
        }
        "client_info" => Some(Command::ClientInfo),
        "alive" => Some(Command::Alive { identity }),
        "leave" => Some(Command::Leave { identity }),
        "graph_info" => Some(Command::GraphInfo { identity, real_id }),
        _ => None,
    }
}
