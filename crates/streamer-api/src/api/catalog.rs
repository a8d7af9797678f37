//! Album / artist / track metadata passthrough.

use actix_web::{HttpResponse, get, web};

use crate::errors::ApiError;
use crate::state::AppState;

use super::auth::UserQuery;

#[get("/album/{id}")]
pub async fn get_album(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<UserQuery>,
) -> Result<HttpResponse, ApiError> {
    let album_id = path.into_inner();
    let album = state
        .sessions
        .run_with_refresh(&query.user_id, |session| {
            let album_id = album_id.clone();
            async move { session.client.get_album(&album_id).await }
        })
        .await?;
    Ok(HttpResponse::Ok().json(album))
}

#[get("/artist/{id}")]
pub async fn get_artist(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<UserQuery>,
) -> Result<HttpResponse, ApiError> {
    let artist_id = path.into_inner();
    let artist = state
        .sessions
        .run_with_refresh(&query.user_id, |session| {
            let artist_id = artist_id.clone();
            async move { session.client.get_artist(&artist_id).await }
        })
        .await?;
    Ok(HttpResponse::Ok().json(artist))
}

#[get("/song/{id}")]
pub async fn get_song(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<UserQuery>,
) -> Result<HttpResponse, ApiError> {
    let track_id = path.into_inner();
    let track = state
        .sessions
        .run_with_refresh(&query.user_id, |session| {
            let track_id = track_id.clone();
            async move { session.client.get_track(&track_id).await }
        })
        .await?;
    Ok(HttpResponse::Ok().json(track))
}
