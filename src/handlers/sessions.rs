//! Live session endpoints.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /api/v1/sessions
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let max_sessions = state.get_config().performance.max_concurrent_sessions;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": state.sessions.list(),
        "summary": state.sessions.summary(max_sessions)
    })))
}

/// GET /api/v1/sessions/{session_id}, including the playback queue.
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let handle = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("No live session {}", session_id)))?;

    // The scheduler is gone once the session starts closing
    let playback = match handle.playback().await {
        Ok(snapshot) => json!({
            "queued_frames": snapshot.active,
            "muted": snapshot.muted,
            "flush_epoch": snapshot.epoch,
            "scheduled_frames": snapshot.scheduled,
            "completed_frames": snapshot.completed,
            "flushed_frames": snapshot.flushed,
            "cursor_ms": snapshot.cursor.map(|c| c.as_millis() as u64)
        }),
        Err(_) => serde_json::Value::Null,
    };

    Ok(HttpResponse::Ok().json(json!({
        "session": handle.info(),
        "playback": playback
    })))
}

/// DELETE /api/v1/sessions/{session_id}
///
/// Asks the session to stop; teardown (recording, close frames) happens in
/// the session task, so the response does not wait for it.
pub async fn stop_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let handle = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("No live session {}", session_id)))?;

    handle.request_stop();
    tracing::info!(session_id = %session_id, "Stop requested over HTTP");

    Ok(HttpResponse::Accepted().json(json!({
        "status": "stopping",
        "session_id": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::test::{call_and_read_body_json, call_service, init_service, TestRequest};
    use actix_web::App;

    #[actix_web::test]
    async fn test_empty_listing() {
        let app = init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/sessions", web::get().to(list_sessions)),
        )
        .await;
        let req = TestRequest::get().uri("/sessions").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["sessions"].as_array().map(Vec::len), Some(0));
        assert_eq!(body["summary"]["total_sessions"], 0);
        assert_eq!(body["summary"]["max_sessions"], 10);
    }

    #[actix_web::test]
    async fn test_unknown_session_is_not_found() {
        let app = init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/sessions/{session_id}", web::get().to(get_session))
                .route("/sessions/{session_id}", web::delete().to(stop_session)),
        )
        .await;

        let req = TestRequest::delete().uri("/sessions/nope").to_request();
        assert_eq!(call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = TestRequest::get().uri("/sessions/nope").to_request();
        assert_eq!(call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
