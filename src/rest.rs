//! REST API layer using Axum.
//!
//! Public routes: `/ping`, `/login`. Everything else sits behind the
//! auth gate ([`crate::auth::require_auth`]) and reads the caller from
//! the `Identity` extension. All routes are mounted under `/api/v1`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::{header, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{require_auth, Identity};
use crate::config::AppConfig;
use crate::error::{ApiError, ErrorDetail};
use crate::ledger::{TicketLedger, VisitRequest};
use crate::models::{Course, Customer, Record, Store, Ticket, User, UserView, Visit};
use crate::password::PasswordHasher;
use crate::storage::Storage;
use crate::token::{Role, SessionSubject, TokenIssuer, TokenValidator};

pub const MIN_PASSWORD_LEN: usize = 4;
pub const MAX_PASSWORD_LEN: usize = 128;
const SEARCH_LIMIT: usize = 10;
/// Largest error body the detail middleware will rewrite.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Shared app state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    storage: Storage,
    hasher: PasswordHasher,
    issuer: TokenIssuer,
    validator: TokenValidator,
    ledger: Arc<TicketLedger>,
    /// Verified against when the email is unknown, so both login failures cost the same.
    dummy_hash: Arc<str>,
    debug: bool,
}

impl AppState {
    pub fn new(storage: Storage, config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let hasher = PasswordHasher::new(config.hash_params);
        let dummy_hash = hasher.hash("salon-api-login-placeholder")?;
        Ok(Self {
            ledger: Arc::new(TicketLedger::new(storage.clone())),
            issuer: TokenIssuer::from_config(config)?,
            validator: TokenValidator::from_config(config),
            hasher,
            dummy_hash: dummy_hash.into(),
            debug: config.debug,
            storage,
        })
    }

    pub fn hasher(&self) -> PasswordHasher {
        self.hasher
    }
}

/// JSON body extractor whose rejection is an [`ApiError::Input`].
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| ApiError::Input(rejection.body_text()))?;
        Ok(Self(value))
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(12 * 60 * 60))
}

/// Create the Axum router.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/signup", post(signup_handler))
        .route("/users", get(list_users_handler))
        .route("/users/:id", put(update_user_handler))
        .route("/stores", get(list_stores_handler))
        .route("/store/:id", put(update_store_handler))
        .route("/customers", get(list_customers_handler))
        .route("/customer-registration", post(customer_registration_handler))
        .route("/customer/:id", put(update_customer_handler))
        .route("/customer-search", get(customer_search_handler))
        .route("/courses", get(list_courses_handler))
        .route("/course-registration", post(course_registration_handler))
        .route(
            "/course/:id",
            put(update_course_handler).delete(delete_course_handler),
        )
        .route("/tickets", get(list_tickets_handler))
        .route("/visits", get(list_visits_handler))
        .route("/visit-registration", post(visit_registration_handler))
        .route_layer(middleware::from_fn_with_state(
            state.validator.clone(),
            require_auth,
        ));

    let api = Router::new()
        .route("/ping", get(ping_handler))
        .route("/login", post(login_handler))
        .merge(protected);

    Router::new()
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(state.debug, error_detail))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

/// Log the internal detail of every error response; in debug mode also
/// add it to the JSON body as `details`.
async fn error_detail(State(debug): State<bool>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let response = next.run(req).await;

    let Some(ErrorDetail(detail)) = response.extensions().get::<ErrorDetail>().cloned() else {
        return response;
    };
    let status = response.status();
    if status.is_server_error() {
        error!(%method, %path, %status, %detail, "request failed");
    } else {
        warn!(%method, %path, %status, %detail, "request rejected");
    }
    if !debug {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let mut json = match axum::body::to_bytes(body, ERROR_BODY_LIMIT).await {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null),
        Err(_) => Value::Null,
    };
    if let Value::Object(map) = &mut json {
        map.insert("details".to_string(), Value::String(detail));
    }
    parts.headers.remove(header::CONTENT_LENGTH);
    let body = serde_json::to_vec(&json).unwrap_or_default();
    Response::from_parts(parts, Body::from(body))
}

#[derive(Serialize, Debug)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

fn require_text(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        Err(ApiError::Input(format!("{field} is required")))
    } else {
        Ok(())
    }
}

fn check_password_policy(password: &str) -> Result<(), ApiError> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        return Err(ApiError::Input(format!(
            "password must be {MIN_PASSWORD_LEN}-{MAX_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Hash off the async workers; Argon2 is deliberately slow.
async fn hash_blocking(hasher: PasswordHasher, password: String) -> Result<String, ApiError> {
    Ok(tokio::task::spawn_blocking(move || hasher.hash(&password)).await??)
}

async fn ping_handler() -> Json<Value> {
    Json(serde_json::json!({ "message": "pong" }))
}

// --- Login ---

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LoginUser {
    pub name: String,
    pub role: Role,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub message: String,
    pub token: String,
    pub user: LoginUser,
}

async fn login_handler(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    require_text("email", &payload.email)?;
    require_text("password", &payload.password)?;

    let user = state.storage.find_user_by_email(&payload.email)?;
    let encoded = match &user {
        Some(user) => user.password_hash.clone(),
        None => state.dummy_hash.to_string(),
    };

    let hasher = state.hasher;
    let password = payload.password.clone();
    let verified = tokio::task::spawn_blocking(move || hasher.verify(&password, &encoded)).await?;
    let matched = match verified {
        Ok(matched) => matched,
        Err(e) => {
            error!(error = %e, "stored password hash could not be parsed");
            false
        }
    };

    // Unknown email and wrong password end in the same error.
    let Some(mut user) = user.filter(|_| matched) else {
        return Err(ApiError::InvalidCredentials);
    };

    // Outdated hashes are upgraded before the token is issued; a failed
    // upgrade fails the login.
    if state.hasher.needs_rehash(&user.password_hash) {
        user.password_hash = hash_blocking(state.hasher, payload.password).await?;
        state.storage.update(&mut user)?;
        info!(user_id = user.record.id, "password hash upgraded");
    }

    let store_name = state
        .storage
        .find_by_id::<Store>(user.store_id)?
        .map(|store| store.name)
        .unwrap_or_default();

    let token = state.issuer.issue(&SessionSubject {
        user_id: user.record.id,
        name: user.name.clone(),
        role: user.role,
        store_id: user.store_id,
        store_name,
    })?;

    info!(user_id = user.record.id, role = %user.role, "login succeeded");
    Ok(Json(LoginResponse {
        message: "login succeeded".to_string(),
        token,
        user: LoginUser {
            name: user.name,
            role: user.role,
        },
    }))
}

// --- Staff accounts ---

#[derive(Deserialize)]
pub struct SignUpRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub store_id: u64,
}

#[derive(Serialize, Debug)]
pub struct SignUpResponse {
    pub message: String,
    pub user: UserView,
}

async fn signup_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ValidJson(payload): ValidJson<SignUpRequest>,
) -> Result<Json<SignUpResponse>, ApiError> {
    identity.require_privileged()?;
    identity.require_store(payload.store_id)?;
    if payload.role == Role::Admin && identity.role != Role::Admin {
        return Err(ApiError::Forbidden);
    }
    require_text("name", &payload.name)?;
    require_text("email", &payload.email)?;
    check_password_policy(&payload.password)?;
    if state.storage.find_by_id::<Store>(payload.store_id)?.is_none() {
        return Err(ApiError::NotFound(format!("store {}", payload.store_id)));
    }

    let password_hash = hash_blocking(state.hasher, payload.password).await?;
    let user = state.storage.create_user(User {
        record: Record::default(),
        name: payload.name,
        email: payload.email,
        password_hash,
        role: payload.role,
        store_id: payload.store_id,
    })?;

    info!(user_id = user.record.id, created_by = identity.user_id, "staff account created");
    Ok(Json(SignUpResponse {
        message: "registered".to_string(),
        user: UserView::from(&user),
    }))
}

async fn list_users_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<UserView>>, ApiError> {
    identity.require_privileged()?;
    let users = state
        .storage
        .list_where(|u: &User| visible_to(&identity, u.store_id))?;
    Ok(Json(users.iter().map(UserView::from).collect()))
}

#[derive(Deserialize)]
pub struct UserUpdateRequest {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub store_id: u64,
    /// New password; absent or empty keeps the current one.
    #[serde(default)]
    pub password: Option<String>,
}

/// Privileged callers edit accounts in their store; anyone may edit
/// their own name, email and password.
async fn update_user_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
    ValidJson(payload): ValidJson<UserUpdateRequest>,
) -> Result<Json<UserView>, ApiError> {
    let mut user = state
        .storage
        .find_by_id::<User>(id)?
        .ok_or_else(|| ApiError::NotFound(format!("user {id}")))?;

    if identity.user_id != id {
        identity.require_privileged()?;
        identity.require_store(user.store_id)?;
    }
    if identity.role != Role::Admin {
        // Only admins grant the admin role or edit another admin.
        let promotes = payload.role == Role::Admin && user.role != Role::Admin;
        let touches_admin = user.role == Role::Admin && identity.user_id != id;
        let moves_self = !identity.role.is_privileged()
            && (payload.role != user.role || payload.store_id != user.store_id);
        if promotes || touches_admin || moves_self {
            return Err(ApiError::Forbidden);
        }
    }
    identity.require_store(payload.store_id)?;
    require_text("name", &payload.name)?;
    require_text("email", &payload.email)?;
    if state.storage.find_by_id::<Store>(payload.store_id)?.is_none() {
        return Err(ApiError::NotFound(format!("store {}", payload.store_id)));
    }

    if let Some(password) = payload.password.filter(|p| !p.is_empty()) {
        check_password_policy(&password)?;
        user.password_hash = hash_blocking(state.hasher, password).await?;
        info!(user_id = id, changed_by = identity.user_id, "password changed");
    }
    user.name = payload.name;
    user.email = payload.email;
    user.role = payload.role;
    user.store_id = payload.store_id;
    state.storage.update_user(&mut user)?;

    Ok(Json(UserView::from(&user)))
}

// --- Stores ---

#[derive(Serialize, Deserialize, Debug)]
pub struct StoreSummary {
    pub id: u64,
    pub name: String,
}

async fn list_stores_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<StoreSummary>>, ApiError> {
    let stores = state
        .storage
        .list::<Store>()?
        .into_iter()
        .map(|s| StoreSummary {
            id: s.record.id,
            name: s.name,
        })
        .collect();
    Ok(Json(stores))
}

#[derive(Deserialize)]
pub struct StoreUpdateRequest {
    pub name: String,
}

async fn update_store_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
    ValidJson(payload): ValidJson<StoreUpdateRequest>,
) -> Result<Json<StoreSummary>, ApiError> {
    identity.require_privileged()?;
    identity.require_store(id)?;
    require_text("name", &payload.name)?;
    let mut store = state
        .storage
        .find_by_id::<Store>(id)?
        .ok_or_else(|| ApiError::NotFound(format!("store {id}")))?;

    store.name = payload.name;
    state.storage.update(&mut store)?;
    Ok(Json(StoreSummary {
        id: store.record.id,
        name: store.name,
    }))
}

/// Admins see every store's rows; others see their own store only.
fn visible_to(identity: &Identity, store_id: u64) -> bool {
    identity.role == Role::Admin || identity.store_id == store_id
}

// --- Customers ---

/// Body of both customer registration and customer update.
#[derive(Deserialize)]
pub struct CustomerRequest {
    pub last_name: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name_kana: String,
    #[serde(default)]
    pub first_name_kana: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub pref_name: String,
    #[serde(default)]
    pub address1: String,
    #[serde(default)]
    pub address2: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub birth_date: Option<chrono::NaiveDate>,
    #[serde(default)]
    pub phone: String,
    pub store_id: u64,
}

impl CustomerRequest {
    fn validate(&self, identity: &Identity) -> Result<(), ApiError> {
        identity.require_store(self.store_id)?;
        require_text("last_name", &self.last_name)?;
        require_text("first_name", &self.first_name)
    }

    fn into_customer(self, record: Record) -> Customer {
        Customer {
            record,
            last_name: self.last_name,
            first_name: self.first_name,
            last_name_kana: self.last_name_kana,
            first_name_kana: self.first_name_kana,
            zip_code: self.zip_code,
            pref_name: self.pref_name,
            address1: self.address1,
            address2: self.address2,
            sex: self.sex,
            birth_date: self.birth_date,
            phone: self.phone,
            store_id: self.store_id,
        }
    }
}

async fn customer_registration_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ValidJson(payload): ValidJson<CustomerRequest>,
) -> Result<Json<Customer>, ApiError> {
    payload.validate(&identity)?;
    let customer = state
        .storage
        .create(payload.into_customer(Record::default()))?;
    Ok(Json(customer))
}

async fn update_customer_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
    ValidJson(payload): ValidJson<CustomerRequest>,
) -> Result<Json<Customer>, ApiError> {
    let current = state
        .storage
        .find_by_id::<Customer>(id)?
        .ok_or_else(|| ApiError::NotFound(format!("customer {id}")))?;
    identity.require_store(current.store_id)?;
    payload.validate(&identity)?;

    let mut customer = payload.into_customer(current.record);
    state.storage.update(&mut customer)?;
    Ok(Json(customer))
}

async fn list_customers_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Customer>>, ApiError> {
    let customers = state
        .storage
        .list_where(|c: &Customer| visible_to(&identity, c.store_id))?;
    Ok(Json(customers))
}

#[derive(Deserialize)]
pub struct CustomerSearchParams {
    #[serde(default)]
    pub last_name_kana: String,
}

async fn customer_search_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<CustomerSearchParams>,
) -> Result<Json<Vec<Customer>>, ApiError> {
    let needle = params.last_name_kana.trim();
    if needle.is_empty() {
        return Ok(Json(vec![]));
    }
    let mut hits = state.storage.list_where(|c: &Customer| {
        visible_to(&identity, c.store_id) && c.last_name_kana.contains(needle)
    })?;
    hits.truncate(SEARCH_LIMIT);
    Ok(Json(hits))
}

// --- Courses ---

#[derive(Deserialize)]
pub struct CourseRequest {
    pub name: String,
    pub price: i64,
    pub total_count: u32,
    pub store_id: u64,
}

impl CourseRequest {
    fn validate(&self, identity: &Identity) -> Result<(), ApiError> {
        identity.require_privileged()?;
        identity.require_store(self.store_id)?;
        require_text("name", &self.name)?;
        if self.total_count == 0 {
            return Err(ApiError::Input("total_count must be at least 1".to_string()));
        }
        if self.price < 0 {
            return Err(ApiError::Input("price must not be negative".to_string()));
        }
        Ok(())
    }

    fn into_course(self, record: Record) -> Course {
        Course {
            record,
            name: self.name,
            price: self.price,
            total_count: self.total_count,
            store_id: self.store_id,
        }
    }
}

async fn course_registration_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ValidJson(payload): ValidJson<CourseRequest>,
) -> Result<Json<Course>, ApiError> {
    payload.validate(&identity)?;
    let course = state.storage.create(payload.into_course(Record::default()))?;
    Ok(Json(course))
}

/// Open tickets keep the total they were opened with.
async fn update_course_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
    ValidJson(payload): ValidJson<CourseRequest>,
) -> Result<Json<Course>, ApiError> {
    let current = state
        .storage
        .find_by_id::<Course>(id)?
        .ok_or_else(|| ApiError::NotFound(format!("course {id}")))?;
    identity.require_store(current.store_id)?;
    payload.validate(&identity)?;

    let mut course = payload.into_course(current.record);
    state.storage.update(&mut course)?;
    Ok(Json(course))
}

async fn list_courses_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Course>>, ApiError> {
    let courses = state
        .storage
        .list_where(|c: &Course| visible_to(&identity, c.store_id))?;
    Ok(Json(courses))
}

async fn delete_course_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
) -> Result<Json<MessageResponse>, ApiError> {
    identity.require_privileged()?;
    let course = state
        .storage
        .find_by_id::<Course>(id)?
        .ok_or_else(|| ApiError::NotFound(format!("course {id}")))?;
    identity.require_store(course.store_id)?;

    state.storage.soft_delete::<Course>(id)?;
    info!(course_id = id, deleted_by = identity.user_id, "course deleted");
    Ok(Json(MessageResponse {
        success: true,
        message: format!("course {id} deleted"),
    }))
}

// --- Tickets and visits ---

#[derive(Deserialize)]
pub struct TicketListParams {
    pub customer_id: Option<u64>,
}

async fn list_tickets_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<TicketListParams>,
) -> Result<Json<Vec<Ticket>>, ApiError> {
    let tickets = state.storage.list_where(|t: &Ticket| {
        visible_to(&identity, t.store_id)
            && params.customer_id.map_or(true, |id| t.customer_id == id)
    })?;
    Ok(Json(tickets))
}

async fn list_visits_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Visit>>, ApiError> {
    let visits = state
        .storage
        .list_where(|v: &Visit| visible_to(&identity, v.store_id))?;
    Ok(Json(visits))
}

#[derive(Deserialize)]
pub struct VisitRegistrationRequest {
    pub customer_id: u64,
    pub course_id: u64,
    pub store_id: u64,
    pub ticket_id: Option<u64>,
    #[serde(default)]
    pub memo: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct VisitRegistrationResponse {
    pub message: String,
    pub visit: Visit,
    pub ticket: Ticket,
    pub sequence: u32,
}

async fn visit_registration_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ValidJson(payload): ValidJson<VisitRegistrationRequest>,
) -> Result<Json<VisitRegistrationResponse>, ApiError> {
    identity.require_store(payload.store_id)?;
    // The customer (and, inside the ledger, the course) must belong to the
    // store the visit is booked in; rows of other stores read as absent.
    let customer = state
        .storage
        .find_by_id::<Customer>(payload.customer_id)?
        .filter(|c| c.store_id == payload.store_id);
    if customer.is_none() {
        return Err(ApiError::NotFound(format!("customer {}", payload.customer_id)));
    }

    let consumption = state
        .ledger
        .consume_visit(VisitRequest {
            customer_id: payload.customer_id,
            course_id: payload.course_id,
            store_id: payload.store_id,
            ticket_id: payload.ticket_id,
            memo: payload.memo,
        })
        .await?;

    Ok(Json(VisitRegistrationResponse {
        message: "registered".to_string(),
        visit: consumption.visit,
        ticket: consumption.ticket,
        sequence: consumption.sequence,
    }))
}
