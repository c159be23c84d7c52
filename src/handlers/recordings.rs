//! Recording download endpoints.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /api/v1/recordings, newest first.
pub async fn list_recordings(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "recordings": state.recordings.list()
    })))
}

/// GET /api/v1/recordings/{session_id} returns the WAV file.
pub async fn download_recording(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let artifact = state
        .recordings
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("No recording for session {}", session_id)))?;

    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(format!(
                "conversation-{}.wav",
                artifact.session_id
            ))],
        })
        .body(artifact.wav.as_ref().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::{AudioFrame, FrameSource};
    use crate::audio::mixer::{self, RecordingTrack};
    use crate::recordings::RecordingArtifact;
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::test::{call_and_read_body_json, call_service, init_service, read_body, TestRequest};
    use actix_web::App;

    #[actix_web::test]
    async fn test_download_and_list() {
        let state = test_state();
        let mut user = RecordingTrack::default();
        user.push(AudioFrame::new(FrameSource::User, 0, 24_000, vec![100; 240]));
        let mixdown = mixer::mixdown(&user, &RecordingTrack::default(), 24_000);
        state
            .recordings
            .insert(RecordingArtifact::from_mixdown("abc", mixdown));

        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/recordings", web::get().to(list_recordings))
                .route("/recordings/{session_id}", web::get().to(download_recording)),
        )
        .await;

        let req = TestRequest::get().uri("/recordings/abc").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("audio/wav")
        );
        let body = read_body(resp).await;
        assert_eq!(&body[..4], b"RIFF");
        assert_eq!(body.len(), 44 + 240 * 2);

        let req = TestRequest::get().uri("/recordings").to_request();
        let listing: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(listing["recordings"][0]["session_id"], "abc");
        assert_eq!(listing["recordings"][0]["url"], "/api/v1/recordings/abc");

        let req = TestRequest::get().uri("/recordings/missing").to_request();
        assert_eq!(call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
