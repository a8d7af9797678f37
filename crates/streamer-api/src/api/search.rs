//! Catalog search endpoints.
//!
//! `/search` is the public path with the per-user TV-context fallback: once
//! the native client context is rejected with an invalid-argument error, the
//! user sticks to the fallback context until logout or credential restore.
//! `/user/search/batch` fans queries out under the request governor.

use actix_web::{HttpResponse, post, web};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::provider::ClientContext;
use crate::search_cache::SearchCache;
use crate::state::AppState;

use super::auth::UserQuery;

const DEFAULT_SEARCH_LIMIT: usize = 20;
const DEFAULT_BATCH_LIMIT: usize = 5;

#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct BatchSearchQuery {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct BatchSearchRequest {
    pub queries: Vec<BatchSearchQuery>,
}

async fn search_with_fallback(
    state: &AppState,
    user_id: &str,
    query: &str,
    limit: usize,
) -> Result<Value, ApiError> {
    let context = if state.sessions.uses_fallback(user_id) {
        ClientContext::Tv
    } else {
        ClientContext::Native
    };

    let run = |ctx: ClientContext| {
        state.sessions.run_with_refresh(user_id, move |session| {
            let query = query.to_string();
            async move { session.client.search_with(&query, limit, ctx).await }
        })
    };

    match run(context).await {
        Ok(results) => Ok(results),
        Err(ApiError::BadRequest(message)) if context == ClientContext::Native => {
            // Known invalid-argument rejection of the native context: flip
            // this user to the fallback context and retry once.
            warn!(user_id, message = %message, "Native search context rejected; switching to fallback");
            state.sessions.set_fallback(user_id);
            run(ClientContext::Tv).await
        }
        Err(e) => Err(e),
    }
}

#[post("/search")]
pub async fn search(
    state: web::Data<AppState>,
    query: web::Query<UserQuery>,
    body: web::Json<SearchRequest>,
) -> Result<HttpResponse, ApiError> {
    let limit = body.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    let cache_key = SearchCache::key(&query.user_id, &body.query, limit);

    if let Some(cached) = state.searches.get(&cache_key) {
        debug!(query = %body.query, "Search cache hit");
        return Ok(HttpResponse::Ok().json(cached.as_ref()));
    }

    let results = search_with_fallback(&state, &query.user_id, &body.query, limit).await?;
    let cached = state.searches.insert(cache_key, results);
    Ok(HttpResponse::Ok().json(cached.as_ref()))
}

#[post("/user/search")]
pub async fn user_search(
    state: web::Data<AppState>,
    query: web::Query<UserQuery>,
    body: web::Json<SearchRequest>,
) -> Result<HttpResponse, ApiError> {
    let limit = body.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    let results = state
        .sessions
        .run_with_refresh(&query.user_id, |session| {
            let q = body.query.clone();
            async move { session.client.search(&q, limit).await }
        })
        .await?;
    Ok(HttpResponse::Ok().json(results))
}

/// Batch search with controlled concurrency: each query takes a governor
/// slot (bounded parallelism + randomized inter-request delay) instead of
/// firing all at once.
#[post("/user/search/batch")]
pub async fn user_search_batch(
    state: web::Data<AppState>,
    query: web::Query<UserQuery>,
    body: web::Json<BatchSearchRequest>,
) -> Result<HttpResponse, ApiError> {
    // Fail fast when the user has no session at all.
    let _ = state.sessions.get(&query.user_id)?;

    debug!(
        user_id = %query.user_id,
        queries = body.queries.len(),
        "Batch search"
    );

    let futures = body.queries.iter().map(|q| {
        let state = state.clone();
        let user_id = query.user_id.clone();
        let text = q.query.clone();
        let limit = q.limit.unwrap_or(DEFAULT_BATCH_LIMIT);
        async move {
            let _slot = state.governor.acquire_batch_slot().await;
            let outcome = state
                .sessions
                .run_with_refresh(&user_id, |session| {
                    let text = text.clone();
                    async move {
                        session
                            .client
                            .search(&text, limit)
                            .await
                    }
                })
                .await;
            match outcome {
                Ok(results) => serde_json::json!({
                    "query": text,
                    "results": results,
                    "error": Value::Null,
                }),
                Err(e) => {
                    warn!(query = %text, error = %e, "Batch search query failed");
                    serde_json::json!({
                        "query": text,
                        "results": Value::Null,
                        "error": e.to_string(),
                    })
                }
            }
        }
    });

    let results: Vec<Value> = futures_util::future::join_all(futures).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "results": results })))
}
