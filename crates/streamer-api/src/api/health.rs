use actix_web::{HttpResponse, get, web};

use crate::state::AppState;

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "streamer-api",
        "authenticated_users": state.sessions.authenticated_count(),
        "cached_stream_urls": state.urls.len(),
        "governor_permits": state.governor.available_permits(),
    }))
}
