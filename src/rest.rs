//! REST API layer using Axum.
//!
//! Public routes serve registration, login, token refresh and read-only
//! collection views. Everything that mutates data or is scoped to the caller
//! sits behind [`require_auth`], which verifies the bearer token and puts the
//! caller's [`Identity`] into the request extensions.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::accounts::{Accounts, ProfileUpdate, Registration};
use crate::auth::{bearer_token, Identity, TokenCodec, TokenPair};
use crate::authz::authorize_mutation;
use crate::error::{AuthError, StorageError};
use crate::models::{
    Action, ActionCounts, ActionId, ActionType, Collection, CollectionId, CollectionPatch, NewAction,
    NewCollection, User,
};
use crate::storage::Storage;

const MIN_PASSWORD_LEN: usize = 6;
const DEFAULT_PAGE_SIZE: i64 = 10;
const MAX_PAGE_SIZE: i64 = 100;

/// Shared app state for REST handlers (Arc-wrapped for concurrency)
pub struct AppState {
    storage: Storage,
    accounts: Accounts,
    tokens: Arc<TokenCodec>,
}

impl AppState {
    pub fn new(storage: Storage, tokens: Arc<TokenCodec>) -> Self {
        Self {
            accounts: Accounts::new(storage.clone(), tokens.clone()),
            storage,
            tokens,
        }
    }

    /// Overrides the bcrypt work factor for new passwords.
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.accounts = self.accounts.with_hash_cost(cost);
        self
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Auth(err) if !err.is_client_error() => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Auth(err) => match err {
                AuthError::EmailAlreadyExists => StatusCode::CONFLICT,
                AuthError::ResourceNotFound => StatusCode::NOT_FOUND,
                AuthError::NotOwner => StatusCode::FORBIDDEN,
                AuthError::SecretTooLong { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::UNAUTHORIZED,
            },
            ApiError::Storage(_) | ApiError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SuccessResponse {
    pub message: String,
}

impl SuccessResponse {
    fn new(message: &str) -> Json<Self> {
        Json(Self {
            message: message.to_string(),
        })
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_at: pair.access_expires_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: u64,
    pub name: String,
    pub surname: String,
    pub email: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub phone: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub image_url: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            surname: user.surname,
            email: user.email,
            phone: user.phone,
            image_url: user.image_url,
            description: user.description,
            created_at: user.created_at,
        }
    }
}

/// What anyone may see about a user.
#[derive(Serialize, Deserialize, Debug)]
pub struct PublicUserResponse {
    pub id: u64,
    pub name: String,
    pub surname: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UpdateProfileRequest {
    pub name: String,
    pub surname: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ActionRequest {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub order: u32,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_url: String,
    /// Cards created together with the collection
    #[serde(default)]
    pub actions: Vec<ActionRequest>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ActionResponse {
    pub id: u64,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub order: u32,
}

impl From<Action> for ActionResponse {
    fn from(action: Action) -> Self {
        Self {
            id: action.id.0,
            text: action.text,
            kind: action.kind.as_str().to_string(),
            order: action.order,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CollectionResponse {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub user_id: u64,
    pub play_count: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub actions: Option<Vec<ActionResponse>>,
    pub created_at: DateTime<Utc>,
}

impl CollectionResponse {
    fn with_actions(collection: Collection, actions: Vec<Action>) -> Self {
        let mut response = Self::from(collection);
        response.actions = Some(actions.into_iter().map(ActionResponse::from).collect());
        response
    }
}

impl From<Collection> for CollectionResponse {
    fn from(collection: Collection) -> Self {
        Self {
            id: collection.id.0,
            name: collection.name,
            description: collection.description,
            image_url: collection.image_url,
            user_id: collection.user_id,
            play_count: collection.play_count,
            actions: None,
            created_at: collection.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ItemsResponse<T> {
    pub items: Vec<T>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PaginationResponse<T> {
    pub total: usize,
    pub page: usize,
    pub size: usize,
    pub items: Vec<T>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PlayCountResponse {
    pub play_count: u64,
}

#[derive(Deserialize, Debug, Default)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
pub struct TrendingQuery {
    pub limit: Option<i64>,
}

/// Out-of-range paging falls back to page 1 / size 10.
fn page_bounds(query: &PageQuery) -> (usize, usize) {
    let page = query.page.filter(|p| *p >= 1).unwrap_or(1);
    let size = query
        .size
        .filter(|s| (1..=MAX_PAGE_SIZE).contains(s))
        .unwrap_or(DEFAULT_PAGE_SIZE);
    (page as usize, size as usize)
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn require_text(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

fn require_email(email: &str) -> Result<(), ApiError> {
    if !is_valid_email(email) {
        return Err(ApiError::Validation("email is not valid".to_string()));
    }
    Ok(())
}

fn require_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn parse_action(request: ActionRequest) -> Result<NewAction, ApiError> {
    require_text("text", &request.text)?;
    let kind = ActionType::parse(&request.kind)
        .ok_or_else(|| ApiError::Validation(format!("invalid action type: {}", request.kind)))?;
    Ok(NewAction {
        text: request.text,
        kind,
        order: request.order,
    })
}

/// Verifies `Authorization: Bearer <token>` and attaches the caller's
/// identity. Requests without a valid token never reach the handler.
async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = bearer_token(auth_header)?;
    let identity = state.tokens.authenticate(token)?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// Create Axum router with the public and the authenticated endpoints
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let auth_routes = Router::new()
        .route("/user/profile", get(get_profile_handler).put(update_profile_handler))
        .route("/user/collections", get(user_collections_handler))
        .route("/collections", post(create_collection_handler))
        .route(
            "/collections/:id",
            put(update_collection_handler).delete(delete_collection_handler),
        )
        .route("/collections/:id/actions", post(add_action_handler))
        .route("/actions/:id", delete(remove_action_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/collections", get(list_collections_handler))
        .route("/collections/trending", get(trending_handler))
        .route("/collections/:id", get(get_collection_handler))
        .route("/collections/:id/actions", get(get_actions_handler))
        .route("/collections/:id/stats", get(stats_handler))
        .route("/collections/:id/play", post(play_handler))
        .route("/users/:id", get(public_user_handler));

    Router::new()
        .route("/ping", get(ping_handler))
        .nest("/api", public_routes.merge(auth_routes))
        .with_state(state)
}

async fn ping_handler() -> Json<SuccessResponse> {
    SuccessResponse::new("pong")
}

// --- Auth ---

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), ApiError> {
    require_text("name", &payload.name)?;
    require_text("surname", &payload.surname)?;
    require_email(&payload.email)?;
    require_password(&payload.password)?;

    let registration = Registration {
        name: payload.name,
        surname: payload.surname,
        email: payload.email,
        password: payload.password,
        phone: payload.phone,
    };
    let accounts = state.accounts.clone();
    let (_, pair) = tokio::task::spawn_blocking(move || accounts.register(registration)).await??;
    Ok((StatusCode::CREATED, Json(pair.into())))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    require_email(&payload.email)?;
    require_text("password", &payload.password)?;

    let accounts = state.accounts.clone();
    let (_, pair) =
        tokio::task::spawn_blocking(move || accounts.login(&payload.email, &payload.password)).await??;
    Ok(Json(pair.into()))
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RefreshTokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    require_text("refreshToken", &payload.refresh_token)?;
    let (_, pair) = state.accounts.refresh(&payload.refresh_token)?;
    Ok(Json(pair.into()))
}

// --- Users ---

async fn public_user_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<PublicUserResponse>, ApiError> {
    let user = state.storage.find_user_by_id(id)?.ok_or(ApiError::NotFound("user"))?;
    Ok(Json(PublicUserResponse {
        id: user.id,
        name: user.name,
        surname: user.surname,
    }))
}

async fn get_profile_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<UserResponse>, ApiError> {
    Ok(Json(state.accounts.profile(&identity)?.into()))
}

async fn update_profile_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    require_text("name", &payload.name)?;
    require_text("surname", &payload.surname)?;
    require_email(&payload.email)?;
    if let Some(password) = payload.password.as_deref() {
        require_password(password)?;
    }

    let update = ProfileUpdate {
        name: payload.name,
        surname: payload.surname,
        email: payload.email,
        phone: payload.phone,
        description: payload.description,
        password: payload.password,
    };
    let accounts = state.accounts.clone();
    tokio::task::spawn_blocking(move || accounts.update_profile(&identity, update)).await??;
    Ok(SuccessResponse::new("Profile updated successfully"))
}

// --- Collections ---

async fn list_collections_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<PaginationResponse<CollectionResponse>>, ApiError> {
    let (page, size) = page_bounds(&query);
    let listed = state.storage.list_collections(page, size)?;
    Ok(Json(PaginationResponse {
        total: listed.total,
        page: listed.page,
        size: listed.size,
        items: listed.items.into_iter().map(CollectionResponse::from).collect(),
    }))
}

async fn trending_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrendingQuery>,
) -> Result<Json<ItemsResponse<CollectionResponse>>, ApiError> {
    let limit = query
        .limit
        .filter(|l| (1..=MAX_PAGE_SIZE).contains(l))
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let items = state.storage.trending_collections(limit as usize)?;
    Ok(Json(ItemsResponse {
        items: items.into_iter().map(CollectionResponse::from).collect(),
    }))
}

async fn user_collections_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ItemsResponse<CollectionResponse>>, ApiError> {
    let items = state.storage.collections_by_user(identity.user_id())?;
    Ok(Json(ItemsResponse {
        items: items.into_iter().map(CollectionResponse::from).collect(),
    }))
}

async fn get_collection_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<CollectionResponse>, ApiError> {
    let id = CollectionId(id);
    let collection = state.storage.find_collection(id)?.ok_or(ApiError::NotFound("collection"))?;
    let actions = state.storage.actions_of(id)?;
    Ok(Json(CollectionResponse::with_actions(collection, actions)))
}

async fn create_collection_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<CollectionRequest>,
) -> Result<(StatusCode, Json<CollectionResponse>), ApiError> {
    require_text("name", &payload.name)?;
    let actions = payload
        .actions
        .into_iter()
        .map(parse_action)
        .collect::<Result<Vec<_>, _>>()?;
    let new = NewCollection {
        name: payload.name,
        description: payload.description,
        image_url: payload.image_url,
    };

    // The owner always comes from the verified identity.
    let (collection, actions) = state
        .storage
        .create_collection_with_actions(identity.user_id(), new, actions)?;
    info!(collection_id = collection.id.0, user_id = identity.user_id(), "collection created");
    Ok((
        StatusCode::CREATED,
        Json(CollectionResponse::with_actions(collection, actions)),
    ))
}

async fn update_collection_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
    Json(payload): Json<CollectionRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    require_text("name", &payload.name)?;
    let grant = authorize_mutation(&state.storage, CollectionId(id), &identity).await?;
    state
        .storage
        .update_collection(
            &grant,
            CollectionPatch {
                name: payload.name,
                description: payload.description,
                image_url: payload.image_url,
            },
        )?
        .ok_or(ApiError::NotFound("collection"))?;
    Ok(SuccessResponse::new("Collection updated successfully"))
}

async fn delete_collection_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let grant = authorize_mutation(&state.storage, CollectionId(id), &identity).await?;
    if !state.storage.delete_collection(&grant)? {
        return Err(ApiError::NotFound("collection"));
    }
    info!(collection_id = id, user_id = identity.user_id(), "collection deleted");
    Ok(SuccessResponse::new("Collection deleted successfully"))
}

async fn play_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<PlayCountResponse>, ApiError> {
    let play_count = state
        .storage
        .increment_play_count(CollectionId(id))?
        .ok_or(ApiError::NotFound("collection"))?;
    Ok(Json(PlayCountResponse { play_count }))
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<ActionCounts>, ApiError> {
    let id = CollectionId(id);
    state.storage.find_collection(id)?.ok_or(ApiError::NotFound("collection"))?;
    Ok(Json(state.storage.action_counts(id)?))
}

// --- Actions (cards) ---

async fn get_actions_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<ItemsResponse<ActionResponse>>, ApiError> {
    let id = CollectionId(id);
    state.storage.find_collection(id)?.ok_or(ApiError::NotFound("collection"))?;
    let items = state.storage.actions_of(id)?;
    Ok(Json(ItemsResponse {
        items: items.into_iter().map(ActionResponse::from).collect(),
    }))
}

async fn add_action_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
    Json(payload): Json<ActionRequest>,
) -> Result<(StatusCode, Json<ActionResponse>), ApiError> {
    let new = parse_action(payload)?;
    let grant = authorize_mutation(&state.storage, CollectionId(id), &identity).await?;
    let action = state
        .storage
        .add_action(&grant, new)?
        .ok_or(ApiError::NotFound("collection"))?;
    Ok((StatusCode::CREATED, Json(action.into())))
}

async fn remove_action_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let grant = authorize_mutation(&state.storage, ActionId(id), &identity).await?;
    if !state.storage.remove_action(&grant)? {
        return Err(ApiError::NotFound("action"));
    }
    Ok(SuccessResponse::new("Action removed successfully"))
}
