//! User library (favorites) endpoints.

use actix_web::{HttpResponse, get, web};
use serde::Deserialize;

use crate::errors::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LibraryQuery {
    pub user_id: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

#[get("/library/songs")]
pub async fn library_songs(
    state: web::Data<AppState>,
    query: web::Query<LibraryQuery>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit;
    let songs = state
        .sessions
        .run_with_refresh(&query.user_id, |session| async move {
            session.client.library_tracks(limit).await
        })
        .await?;
    Ok(HttpResponse::Ok().json(songs))
}

#[get("/library/albums")]
pub async fn library_albums(
    state: web::Data<AppState>,
    query: web::Query<LibraryQuery>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit;
    let albums = state
        .sessions
        .run_with_refresh(&query.user_id, |session| async move {
            session.client.library_albums(limit).await
        })
        .await?;
    Ok(HttpResponse::Ok().json(albums))
}
