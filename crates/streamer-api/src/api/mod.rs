//! HTTP surface of the streamer sidecar.

pub(crate) mod auth;
pub(crate) mod catalog;
pub(crate) mod downloads;
pub(crate) mod health;
pub(crate) mod library;
pub(crate) mod search;
pub(crate) mod stream;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health::health)
        .service(auth::auth_device)
        .service(auth::auth_token)
        .service(auth::auth_refresh)
        .service(auth::auth_session)
        .service(auth::user_auth_status)
        .service(auth::user_auth_restore)
        .service(auth::user_auth_clear)
        .service(search::search)
        .service(search::user_search)
        .service(search::user_search_batch)
        .service(catalog::get_album)
        .service(catalog::get_artist)
        .service(catalog::get_song)
        .service(stream::user_stream_info)
        .service(stream::user_stream)
        .service(stream::proxy)
        .service(downloads::download_track)
        .service(downloads::download_album)
        .service(library::library_songs)
        .service(library::library_albums);
}
