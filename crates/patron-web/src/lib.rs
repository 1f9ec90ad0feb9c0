//! JSON read surface over the reconciled sponsor store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use patron_storage::SponsorStore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};

pub const CRATE_NAME: &str = "patron-web";

const CACHE_TTL: Duration = Duration::from_secs(5);

/// Uniform `{ec, em, data}` response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub ec: u16,
    pub em: String,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SponsorListData {
    pub total_count: i64,
    pub total_page: i64,
    pub list: Vec<SponsorListItem>,
}

/// Public projection of a sponsor row; internal columns stay internal.
#[derive(Debug, Clone, Serialize)]
pub struct SponsorListItem {
    pub name: String,
    pub avatar: Option<String>,
    pub all_sum_amount: String,
    pub last_pay_time: Option<i64>,
}

#[derive(Clone)]
struct CacheEntry {
    payload: Envelope<SponsorListData>,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct AppState {
    store: SponsorStore,
    cache: Arc<Mutex<HashMap<(i64, i64), CacheEntry>>>,
}

impl AppState {
    pub fn new(store: SponsorStore) -> Self {
        Self {
            store,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sponsor", get(sponsor_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    store: SponsorStore,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "http server listening");
    axum::serve(listener, app(AppState::new(store)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Raw query strings so malformed values get our envelope instead of the
/// extractor's default rejection.
#[derive(Debug, Default, Deserialize)]
struct SponsorQuery {
    page: Option<String>,
    per_page: Option<String>,
}

async fn sponsor_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SponsorQuery>,
) -> Response {
    let page = match parse_page(query.page.as_deref()) {
        Ok(page) => page,
        Err(message) => return bad_request(message),
    };
    let per_page = match parse_per_page(query.per_page.as_deref()) {
        Ok(per_page) => per_page,
        Err(message) => return bad_request(message),
    };

    let cache_key = (page, per_page);
    {
        let mut cache = state.cache.lock().await;
        if let Some(entry) = cache.get(&cache_key) {
            if entry.expires_at > Instant::now() {
                return (StatusCode::OK, Json(entry.payload.clone())).into_response();
            }
            cache.remove(&cache_key);
        }
    }

    let rows = match state.store.find_page(page, per_page).await {
        Ok(rows) => rows,
        Err(err) => {
            error!(%err, "sponsor page query failed");
            return internal_error();
        }
    };
    let total = match state.store.count().await {
        Ok(total) => total,
        Err(err) => {
            error!(%err, "sponsor count query failed");
            return internal_error();
        }
    };

    let payload = Envelope {
        ec: 200,
        em: String::new(),
        data: Some(SponsorListData {
            total_count: total,
            total_page: total_pages(total, per_page),
            list: rows
                .into_iter()
                .map(|row| SponsorListItem {
                    name: row.name,
                    avatar: row.avatar,
                    all_sum_amount: row.all_sum_amount,
                    last_pay_time: row.last_pay_time,
                })
                .collect(),
        }),
    };

    state.cache.lock().await.insert(
        cache_key,
        CacheEntry {
            payload: payload.clone(),
            expires_at: Instant::now() + CACHE_TTL,
        },
    );
    (StatusCode::OK, Json(payload)).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "timestamp": Utc::now().timestamp(),
        }))
        .into_response(),
        Err(err) => {
            error!(%err, "database health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "error",
                    "message": "database unreachable",
                })),
            )
                .into_response()
        }
    }
}

fn parse_page(raw: Option<&str>) -> Result<i64, &'static str> {
    match raw {
        None => Ok(1),
        Some(raw) => match raw.parse::<i64>() {
            Ok(page) if page >= 1 => Ok(page),
            _ => Err("page must be an integer greater than 0"),
        },
    }
}

fn parse_per_page(raw: Option<&str>) -> Result<i64, &'static str> {
    match raw {
        None => Ok(20),
        Some(raw) => match raw.parse::<i64>() {
            Ok(per_page) if (1..=100).contains(&per_page) => Ok(per_page),
            _ => Err("per_page must be an integer between 1 and 100"),
        },
    }
}

fn total_pages(total: i64, per_page: i64) -> i64 {
    if total % per_page == 0 {
        total / per_page
    } else {
        total / per_page + 1
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(Envelope::<SponsorListData> {
            ec: 400,
            em: message.to_string(),
            data: None,
        }),
    )
        .into_response()
}

fn internal_error() -> Response {
    // Generic message only; no internal detail crosses the wire.
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Envelope::<SponsorListData> {
            ec: 500,
            em: "internal server error".to_string(),
            data: None,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use patron_core::NewSponsor;
    use tower::ServiceExt;

    fn sponsor(user_id: &str, name: &str, last_pay: i64) -> NewSponsor {
        NewSponsor {
            user_id: user_id.to_string(),
            name: name.to_string(),
            avatar: None,
            all_sum_amount: "5.00".to_string(),
            create_time: last_pay,
            first_pay_time: Some(last_pay),
            last_pay_time: Some(last_pay),
        }
    }

    async fn seeded_store() -> SponsorStore {
        let store = SponsorStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store");
        store.setup_schema().await.expect("schema");
        store
            .upsert(&sponsor("u1", "Alice", 100))
            .await
            .expect("seed u1");
        store
            .upsert(&sponsor("u2", "Bob", 300))
            .await
            .expect("seed u2");
        store
            .upsert(&sponsor("u3", "Carol", 200))
            .await
            .expect("seed u3");
        store
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn sponsor_list_is_enveloped_and_ordered() {
        let app = app(AppState::new(seeded_store().await));
        let (status, json) = get_json(app, "/sponsor").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ec"], 200);
        assert_eq!(json["data"]["total_count"], 3);
        assert_eq!(json["data"]["total_page"], 1);

        let list = json["data"]["list"].as_array().unwrap();
        let names: Vec<_> = list.iter().map(|item| item["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["Bob", "Carol", "Alice"]);

        // Only the public projection crosses the wire.
        assert!(list[0].get("user_id").is_none());
        assert!(list[0].get("updated_at").is_none());
    }

    #[tokio::test]
    async fn pagination_slices_the_listing() {
        let app = app(AppState::new(seeded_store().await));
        let (status, json) = get_json(app, "/sponsor?page=2&per_page=1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["total_page"], 3);
        let list = json["data"]["list"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "Carol");
    }

    #[tokio::test]
    async fn malformed_params_get_descriptive_envelopes() {
        let store = seeded_store().await;
        for uri in ["/sponsor?page=0", "/sponsor?page=abc"] {
            let app = app(AppState::new(store.clone()));
            let (status, json) = get_json(app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["ec"], 400);
            assert_eq!(json["em"], "page must be an integer greater than 0");
            assert!(json["data"].is_null());
        }

        for uri in ["/sponsor?per_page=0", "/sponsor?per_page=101"] {
            let app = app(AppState::new(store.clone()));
            let (status, json) = get_json(app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["ec"], 400);
            assert_eq!(json["em"], "per_page must be an integer between 1 and 100");
        }
    }

    #[tokio::test]
    async fn extreme_page_numbers_yield_an_empty_listing() {
        let app = app(AppState::new(seeded_store().await));
        let (status, json) =
            get_json(app, "/sponsor?page=9223372036854775807&per_page=100").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ec"], 200);
        assert!(json["data"]["list"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn responses_are_cached_briefly() {
        let store = seeded_store().await;
        let state = AppState::new(store.clone());

        let (_, first) = get_json(app(state.clone()), "/sponsor").await;
        assert_eq!(first["data"]["total_count"], 3);

        // A write after the first request is not visible within the TTL.
        store
            .upsert(&sponsor("u4", "Dave", 400))
            .await
            .expect("late write");
        let (_, second) = get_json(app(state), "/sponsor").await;
        assert_eq!(second["data"]["total_count"], 3);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(AppState::new(seeded_store().await));
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }
}
