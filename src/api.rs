use axum::{
    extract::{Json, Path, Query, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::auth::Auth;
use crate::config::Config;
use crate::db::Db;
use crate::error::Result;
use crate::import::{self, ImportPreview};
use crate::models::{
    BookshelfEntry, Card, DifficultyRange, Outcome, Page, PublicDeck, StudyMetadata, User,
    UserProfile,
};
use crate::study::{SessionFilter, SessionState, SessionStats, StudyService};

const DEFAULT_PAGE_SIZE: u32 = 9;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
    pub auth: Auth,
    pub study: Arc<StudyService<Db>>,
    pub config: Arc<Config>,
}

pub fn app_router(state: ApiState) -> Router {
    let assets = ServeDir::new(&state.config.assets_dir);

    Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/library", get(public_library))
        .route("/api/library/:deck_id/activate", post(activate_deck))
        .route("/api/bookshelf", get(bookshelf))
        .route("/api/bookshelf/favorites", get(favorites))
        .route("/api/bookshelf/:active_id/favorite", post(toggle_favorite))
        .route("/api/bookshelf/:active_id", delete(remove_from_bookshelf))
        .route("/api/study/:active_id/metadata", get(study_metadata))
        .route("/api/study/start", post(start_session))
        .route("/api/study/next_batch", get(next_batch))
        .route("/api/study/submit", post(submit_answer))
        .route("/api/study/session", get(session_snapshot))
        .route("/api/study/finish", post(finish_session))
        .route("/api/import/preview", post(import_preview))
        .route("/api/import", post(import_deck))
        .nest_service("/assets", assets)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- Auth ---

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    user: User,
}

async fn login(State(state): State<ApiState>, Json(profile): Json<UserProfile>) -> Result<Json<LoginResponse>> {
    let (token, user) = state.auth.login(profile).await?;
    Ok(Json(LoginResponse { token, user }))
}

/// Logging out also ends the user's study session. A user has one live login
/// at a time, so no other device is still holding that session.
async fn logout(State(state): State<ApiState>, headers: HeaderMap) -> Result<Json<bool>> {
    let user_id = state.auth.logout(&headers).await?;
    state.study.store().remove(user_id).await;
    Ok(Json(true))
}

// --- Library & bookshelf ---

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

impl PageQuery {
    fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let page_size = self
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        (page, page_size)
    }
}

async fn public_library(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<PublicDeck>>> {
    let user_id = state.auth.authenticate(&headers).await?;
    let (page, page_size) = query.resolve();
    Ok(Json(state.db.list_public_decks(user_id, page, page_size).await?))
}

#[derive(Serialize)]
struct ActivateResponse {
    active_id: i64,
}

async fn activate_deck(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(deck_id): Path<i64>,
) -> Result<Json<ActivateResponse>> {
    let user_id = state.auth.authenticate(&headers).await?;
    let active_id = state.db.activate_deck(user_id, deck_id).await?;
    Ok(Json(ActivateResponse { active_id }))
}

async fn bookshelf(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<BookshelfEntry>>> {
    let user_id = state.auth.authenticate(&headers).await?;
    let (page, page_size) = query.resolve();
    Ok(Json(state.db.bookshelf(user_id, page, page_size).await?))
}

async fn favorites(State(state): State<ApiState>, headers: HeaderMap) -> Result<Json<Vec<BookshelfEntry>>> {
    let user_id = state.auth.authenticate(&headers).await?;
    Ok(Json(state.db.favorites(user_id).await?))
}

async fn toggle_favorite(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(active_id): Path<i64>,
) -> Result<Json<bool>> {
    let user_id = state.auth.authenticate(&headers).await?;
    Ok(Json(state.db.toggle_favorite(user_id, active_id).await?))
}

async fn remove_from_bookshelf(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(active_id): Path<i64>,
) -> Result<Json<bool>> {
    let user_id = state.auth.authenticate(&headers).await?;
    state.db.remove_from_bookshelf(user_id, active_id).await?;
    Ok(Json(true))
}

// --- Study ---

async fn study_metadata(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(active_id): Path<i64>,
) -> Result<Json<StudyMetadata>> {
    let user_id = state.auth.authenticate(&headers).await?;
    Ok(Json(state.db.study_metadata(user_id, active_id).await?))
}

fn default_shuffle() -> bool {
    true
}

#[derive(Deserialize)]
struct StartRequest {
    active_deck_id: i64,
    #[serde(default)]
    difficulty: DifficultyRange,
    #[serde(default)]
    tag_ids: Option<Vec<i64>>,
    #[serde(default = "default_shuffle")]
    shuffle: bool,
}

#[derive(Serialize)]
struct StartResponse {
    total: usize,
}

async fn start_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<StartRequest>,
) -> Result<Json<StartResponse>> {
    let user_id = state.auth.authenticate(&headers).await?;
    let filter = SessionFilter {
        difficulty: payload.difficulty,
        tag_ids: payload.tag_ids,
        shuffle: payload.shuffle,
    };
    let total = state
        .study
        .initialize_session(user_id, payload.active_deck_id, filter)
        .await?;
    Ok(Json(StartResponse { total }))
}

#[derive(Deserialize)]
struct BatchQuery {
    batch_size: Option<usize>,
}

async fn next_batch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<BatchQuery>,
) -> Result<Json<Vec<Card>>> {
    let user_id = state.auth.authenticate(&headers).await?;
    let batch_size = state.config.batch_size(query.batch_size);
    Ok(Json(state.study.get_next_batch(user_id, batch_size).await))
}

#[derive(Deserialize)]
struct SubmitRequest {
    card_id: i64,
    result: Outcome,
}

#[derive(Serialize)]
struct SubmitResponse {
    accepted: bool,
    stats: Option<SessionStats>,
}

async fn submit_answer(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>> {
    let user_id = state.auth.authenticate(&headers).await?;
    let stats = state
        .study
        .update_session_state(user_id, payload.card_id, payload.result)
        .await;
    Ok(Json(SubmitResponse {
        accepted: stats.is_some(),
        stats,
    }))
}

async fn session_snapshot(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Option<SessionState>>> {
    let user_id = state.auth.authenticate(&headers).await?;
    Ok(Json(state.study.session_snapshot(user_id).await))
}

async fn finish_session(State(state): State<ApiState>, headers: HeaderMap) -> Result<Json<bool>> {
    let user_id = state.auth.authenticate(&headers).await?;
    Ok(Json(state.study.finalize_session(user_id).await))
}

// --- Import ---

async fn import_preview(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ImportPreview>> {
    state.auth.authenticate(&headers).await?;
    Ok(Json(import::parse_and_preview(&body)?))
}

#[derive(Serialize)]
struct ImportResponse {
    deck_id: i64,
    title: String,
}

async fn import_deck(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ImportResponse>> {
    let user_id = state.auth.authenticate(&headers).await?;
    let preview = import::parse_and_preview(&body)?;
    let (deck_id, title) = state.db.save_import(user_id, &preview.deck).await?;
    Ok(Json(ImportResponse { deck_id, title }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::SessionStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn test_router() -> Router {
        let db = Db::in_memory().await.unwrap();
        let state = ApiState {
            db: db.clone(),
            auth: Auth::new(db.clone(), Vec::new()),
            study: Arc::new(StudyService::new(db, SessionStore::new())),
            config: Arc::new(Config::default()),
        };
        app_router(state)
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn login(app: &Router) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/api/login",
            None,
            Some(json!({"email": "student@example.com", "name": "Student"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_requires_token() {
        let app = test_router().await;
        let (status, _) = call(&app, "GET", "/api/study/next_batch", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_full_study_flow() {
        let app = test_router().await;
        let token = login(&app).await;
        let token = Some(token.as_str());

        let deck = json!({
            "title": "Verbs",
            "is_public": true,
            "cards": [
                {"front_content": "go", "back_content": "ir", "base_difficulty": 1, "tags": ["motion"]},
                {"front_content": "eat", "back_content": "comer", "base_difficulty": 3},
                {"front_content": "be", "back_content": "ser", "base_difficulty": 5, "tags": ["motion"]}
            ]
        });
        let (status, imported) = call(&app, "POST", "/api/import", token, Some(deck)).await;
        assert_eq!(status, StatusCode::OK);
        let deck_id = imported["deck_id"].as_i64().unwrap();

        let (_, library) = call(&app, "GET", "/api/library", token, None).await;
        assert_eq!(library["total"], 1);
        assert_eq!(library["items"][0]["card_count"], 3);

        let (_, activated) = call(&app, "POST", &format!("/api/library/{}/activate", deck_id), token, None).await;
        let active_id = activated["active_id"].as_i64().unwrap();

        let (_, meta) = call(&app, "GET", &format!("/api/study/{}/metadata", active_id), token, None).await;
        assert_eq!(meta["tags"][0]["name"], "motion");

        let (status, started) = call(
            &app,
            "POST",
            "/api/study/start",
            token,
            Some(json!({"active_deck_id": active_id, "difficulty": {"min": 1, "max": 4}, "shuffle": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["total"], 2);

        let (_, batch) = call(&app, "GET", "/api/study/next_batch?batch_size=5", token, None).await;
        let batch = batch.as_array().unwrap().clone();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0]["front_content"], "go");

        let first = batch[0]["id"].as_i64().unwrap();
        let (_, submitted) = call(
            &app,
            "POST",
            "/api/study/submit",
            token,
            Some(json!({"card_id": first, "result": "MISS"})),
        )
        .await;
        assert_eq!(submitted["accepted"], true);
        assert_eq!(submitted["stats"]["wrong"], 1);

        let (_, again) = call(&app, "GET", "/api/study/next_batch", token, None).await;
        assert_eq!(again[0]["id"].as_i64().unwrap(), first);

        let (_, session) = call(&app, "GET", "/api/study/session", token, None).await;
        assert_eq!(session["queue"].as_array().unwrap().len(), 3);
        assert_eq!(session["initial_count"], 2);

        let (_, finished) = call(&app, "POST", "/api/study/finish", token, None).await;
        assert_eq!(finished, true);
        let (_, session) = call(&app, "GET", "/api/study/session", token, None).await;
        assert!(session.is_null());

        let (_, shelf) = call(&app, "GET", "/api/bookshelf", token, None).await;
        assert_eq!(shelf["items"][0]["total_sessions_played"], 1);
    }

    #[tokio::test]
    async fn test_start_with_no_matches_is_unprocessable() {
        let app = test_router().await;
        let token = login(&app).await;
        let token = Some(token.as_str());

        let deck = json!({"title": "Easy", "cards": [{"front_content": "a", "back_content": "b", "base_difficulty": 1}]});
        let (_, imported) = call(&app, "POST", "/api/import", token, Some(deck)).await;
        let deck_id = imported["deck_id"].as_i64().unwrap();
        let (_, activated) = call(&app, "POST", &format!("/api/library/{}/activate", deck_id), token, None).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/study/start",
            token,
            Some(json!({"active_deck_id": activated["active_id"], "difficulty": {"min": 4, "max": 5}})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "no cards match your filters");

        let (status, _) = call(&app, "POST", "/api/study/start", token, Some(json!({"active_deck_id": 999}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_import_preview_rejects_bad_payload() {
        let app = test_router().await;
        let token = login(&app).await;

        let (status, body) = call(&app, "POST", "/api/import/preview", Some(&token), Some(json!({"title": "x", "cards": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("at least one card"));
    }

    #[tokio::test]
    async fn test_logout_clears_study_session() {
        let app = test_router().await;
        let token = login(&app).await;

        let deck = json!({"title": "One", "cards": [{"front_content": "a", "back_content": "b"}]});
        let (_, imported) = call(&app, "POST", "/api/import", Some(&token), Some(deck)).await;
        let uri = format!("/api/library/{}/activate", imported["deck_id"]);
        let (_, activated) = call(&app, "POST", &uri, Some(&token), None).await;
        let (status, _) = call(
            &app,
            "POST",
            "/api/study/start",
            Some(&token),
            Some(json!({"active_deck_id": activated["active_id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&app, "POST", "/api/logout", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", "/api/study/session", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = login(&app).await;
        let (_, session) = call(&app, "GET", "/api/study/session", Some(&token), None).await;
        assert!(session.is_null());
    }

    #[tokio::test]
    async fn test_second_login_takes_over_the_session() {
        let app = test_router().await;
        let laptop = login(&app).await;

        let deck = json!({"title": "One", "cards": [{"front_content": "a", "back_content": "b"}]});
        let (_, imported) = call(&app, "POST", "/api/import", Some(&laptop), Some(deck)).await;
        let uri = format!("/api/library/{}/activate", imported["deck_id"]);
        let (_, activated) = call(&app, "POST", &uri, Some(&laptop), None).await;
        call(
            &app,
            "POST",
            "/api/study/start",
            Some(&laptop),
            Some(json!({"active_deck_id": activated["active_id"]})),
        )
        .await;

        let phone = login(&app).await;
        let (status, _) = call(&app, "GET", "/api/study/session", Some(&laptop), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // The session belongs to the user, so the new login picks it up.
        let (status, session) = call(&app, "GET", "/api/study/session", Some(&phone), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["initial_count"], 1);
    }
}
