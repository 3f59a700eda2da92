use std::{env, sync::Arc, time::Duration};

use axum::{
    extract::{Form, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use regex::Regex;
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::pages;
use crate::types::{
    AgentChatRequest, Chat, ChatListActionForm, ChatMessage, ChatSummary, CurrentUser, LoginForm,
    MedicalContextOption, MedicalProfile, NewChatForm, NewMedicalProfile, NewMessageForm,
    OnboardingForm, RegisterForm,
};

const SESSION_COOKIE: &str = "session_token";
const SESSION_TTL_DAYS: i64 = 30;
const AGENT_FAILED_WARNING: &str = "Agent response failed, but your message was saved";

pub struct AppState {
    pub db: PgPool,
    pub agent_client: reqwest::Client,
    pub agent_chat_url: String,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn valid_email(value: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "carechat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn parse_json_text(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or(Value::Null)
}

fn parse_string_list(value: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(value).unwrap_or_default()
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        pair.trim()
            .strip_prefix(SESSION_COOKIE)?
            .strip_prefix('=')
            .map(|token| token.trim().to_string())
    })
}

fn session_cookie_value(token: &str, max_age_secs: i64) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}")
}

fn with_session_cookie(mut response: Response, token: &str, max_age_secs: i64) -> Response {
    if let Ok(value) = HeaderValue::from_str(&session_cookie_value(token, max_age_secs)) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

async fn issue_session_token(state: &Arc<AppState>, user_id: &str) -> Option<String> {
    let token = Uuid::new_v4().to_string();
    let now = Utc::now();
    let expires_at = (now + ChronoDuration::days(SESSION_TTL_DAYS)).to_rfc3339();
    let ok = sqlx::query(
        "INSERT INTO session_tokens (token, user_id, created_at, expires_at) VALUES ($1,$2,$3,$4)",
    )
    .bind(&token)
    .bind(user_id)
    .bind(now.to_rfc3339())
    .bind(expires_at)
    .execute(&state.db)
    .await
    .is_ok();
    if ok {
        Some(token)
    } else {
        None
    }
}

async fn auth_user_from_headers(state: &Arc<AppState>, headers: &HeaderMap) -> Option<CurrentUser> {
    let token = session_cookie(headers)?;
    let row = sqlx::query(
        "SELECT u.id, u.email, u.full_name \
         FROM session_tokens t \
         JOIN users u ON u.id = t.user_id \
         WHERE t.token = $1 AND t.expires_at > $2",
    )
    .bind(&token)
    .bind(now_iso())
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;
    Some(CurrentUser {
        id: row.get("id"),
        email: row.get("email"),
        full_name: row.get("full_name"),
    })
}

async fn require_user(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<CurrentUser, AppError> {
    auth_user_from_headers(state, headers)
        .await
        .ok_or_else(|| AppError::Unauthorized("Unauthorized".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateOutcome {
    Allow,
    RedirectLogin,
    RedirectOnboarding,
}

/// Routing rule for gated pages. Public paths pass untouched; everything
/// else needs a session, and a session without a medical profile is sent to
/// onboarding (except on the onboarding page itself).
fn gate_outcome(path: &str, authenticated: bool, has_profile: bool) -> GateOutcome {
    let exempt = ["/landing", "/login", "/register"];
    if exempt.iter().any(|prefix| path.starts_with(prefix)) {
        return GateOutcome::Allow;
    }
    if !authenticated {
        return GateOutcome::RedirectLogin;
    }
    if path == "/onboarding" {
        return GateOutcome::Allow;
    }
    if !has_profile {
        return GateOutcome::RedirectOnboarding;
    }
    GateOutcome::Allow
}

/// Resolves the current user and profile for a page request. A profile
/// lookup failure counts as "no profile" so the user lands on onboarding
/// instead of an error page.
async fn gate_page(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    path: &str,
) -> Result<(CurrentUser, Option<MedicalProfile>), Redirect> {
    let user = auth_user_from_headers(state, headers).await;
    let profile = match &user {
        Some(user) => load_profile(&state.db, &user.id).await,
        None => None,
    };
    match gate_outcome(path, user.is_some(), profile.is_some()) {
        GateOutcome::Allow => match user {
            Some(user) => Ok((user, profile)),
            None => Err(Redirect::temporary("/login")),
        },
        GateOutcome::RedirectLogin => Err(Redirect::temporary("/login")),
        GateOutcome::RedirectOnboarding => Err(Redirect::temporary("/onboarding")),
    }
}

fn parse_profile_row(row: sqlx::postgres::PgRow) -> MedicalProfile {
    let first_name: String = row.get("first_name");
    let last_name: String = row.get("last_name");
    MedicalProfile {
        id: row.get("id"),
        user_id: row.get("user_id"),
        full_name: full_name(&first_name, &last_name),
        first_name,
        last_name,
        dob: row.get("dob"),
        gender: row.get("gender"),
        height: row.get("height"),
        weight: row.get("weight"),
        medical_history: parse_string_list(&row.get::<String, _>("medical_history")),
        allergies: parse_string_list(&row.get::<String, _>("allergies")),
        medications: parse_string_list(&row.get::<String, _>("medications")),
        created_at: row.get("created_at"),
    }
}

fn full_name(first_name: &str, last_name: &str) -> String {
    format!("{} {}", first_name.trim(), last_name.trim())
        .trim()
        .to_string()
}

async fn load_profile(db: &PgPool, user_id: &str) -> Option<MedicalProfile> {
    let row = sqlx::query(
        "SELECT id, user_id, first_name, last_name, dob, gender, height, weight, \
                medical_history, allergies, medications, created_at \
         FROM user_medical_data WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await
    .ok()
    .flatten()?;
    Some(parse_profile_row(row))
}

async fn load_medical_context(
    db: &PgPool,
    context_id: &str,
    user_id: &str,
) -> Option<MedicalProfile> {
    let row = sqlx::query(
        "SELECT id, user_id, first_name, last_name, dob, gender, height, weight, \
                medical_history, allergies, medications, created_at \
         FROM user_medical_data WHERE id = $1 AND user_id = $2",
    )
    .bind(context_id)
    .bind(user_id)
    .fetch_optional(db)
    .await
    .ok()
    .flatten()?;
    Some(parse_profile_row(row))
}

fn parse_list_field(raw: &str) -> Result<Vec<String>, ()> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Vec<String>>(trimmed).map_err(|_| ())
}

/// Truncates to calendar-date precision and rejects impossible dates.
fn normalize_dob(raw: &str) -> Option<String> {
    let date_part = raw.split('T').next().unwrap_or("").trim();
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    Some(date_part.to_string())
}

fn parse_onboarding_form(
    user_id: &str,
    form: &OnboardingForm,
) -> Result<NewMedicalProfile, String> {
    let medical_history = parse_list_field(&form.medical_history)
        .map_err(|_| "Invalid JSON data in form submission".to_string())?;
    let allergies = parse_list_field(&form.allergies)
        .map_err(|_| "Invalid JSON data in form submission".to_string())?;
    let medications = parse_list_field(&form.medications)
        .map_err(|_| "Invalid JSON data in form submission".to_string())?;

    let first_name = form.first_name.trim();
    let last_name = form.last_name.trim();
    let gender = form.gender.trim();
    if first_name.is_empty() || last_name.is_empty() || form.dob.trim().is_empty() || gender.is_empty()
    {
        return Err("Required fields are missing".to_string());
    }

    let dob = normalize_dob(&form.dob).ok_or_else(|| "Invalid date format".to_string())?;

    Ok(NewMedicalProfile {
        user_id: user_id.to_string(),
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        dob,
        gender: gender.to_string(),
        height: form.height.trim().parse::<i32>().ok(),
        weight: form.weight.trim().parse::<i32>().ok(),
        medical_history,
        allergies,
        medications,
    })
}

async fn insert_profile(db: &PgPool, profile: &NewMedicalProfile) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO user_medical_data \
         (id, user_id, first_name, last_name, dob, gender, height, weight, \
          medical_history, allergies, medications, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&profile.user_id)
    .bind(&profile.first_name)
    .bind(&profile.last_name)
    .bind(&profile.dob)
    .bind(&profile.gender)
    .bind(profile.height)
    .bind(profile.weight)
    .bind(serde_json::to_string(&profile.medical_history).unwrap_or_else(|_| "[]".to_string()))
    .bind(serde_json::to_string(&profile.allergies).unwrap_or_else(|_| "[]".to_string()))
    .bind(serde_json::to_string(&profile.medications).unwrap_or_else(|_| "[]".to_string()))
    .bind(now_iso())
    .execute(db)
    .await?;
    Ok(())
}

fn context_option_title(id: &str, full_name: &str) -> String {
    if full_name.trim().is_empty() {
        format!("Medical Record {}", id.chars().take(8).collect::<String>())
    } else {
        full_name.trim().to_string()
    }
}

async fn list_medical_contexts(db: &PgPool, user_id: &str) -> Vec<MedicalContextOption> {
    let rows = match sqlx::query(
        "SELECT id, first_name, last_name FROM user_medical_data \
         WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(db)
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            error!("failed to fetch medical contexts: {err}");
            return Vec::new();
        }
    };
    rows.into_iter()
        .map(|row| {
            let id: String = row.get("id");
            let name = full_name(&row.get::<String, _>("first_name"), &row.get::<String, _>("last_name"));
            MedicalContextOption {
                title: context_option_title(&id, &name),
                id,
            }
        })
        .collect()
}

fn parse_chat_row(row: sqlx::postgres::PgRow) -> Chat {
    Chat {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        medical_context_id: row.get("medical_context_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_message_row(row: sqlx::postgres::PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        sender_id: row.get("sender_id"),
        content: row.get("content"),
        responses: row
            .get::<Option<String>, _>("responses")
            .map(|raw| parse_json_text(&raw))
            .filter(|value| !value.is_null()),
        created_at: row.get("created_at"),
    }
}

/// Ownership-scoped lookup. A missing row and a row owned by someone else
/// are indistinguishable to the caller.
async fn fetch_owned_chat(db: &PgPool, chat_id: &str, user_id: &str) -> Option<Chat> {
    let row = sqlx::query(
        "SELECT id, user_id, title, medical_context_id, created_at, updated_at \
         FROM chats WHERE id = $1 AND user_id = $2",
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_optional(db)
    .await
    .ok()
    .flatten()?;
    Some(parse_chat_row(row))
}

async fn latest_message_content(db: &PgPool, chat_id: &str) -> String {
    sqlx::query_scalar::<_, String>(
        "SELECT content FROM messages WHERE chat_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(chat_id)
    .fetch_optional(db)
    .await
    .ok()
    .flatten()
    .unwrap_or_default()
}

async fn list_chat_summaries(db: &PgPool, user_id: &str) -> Vec<ChatSummary> {
    let rows = match sqlx::query(
        "SELECT id, title, updated_at, medical_context_id FROM chats \
         WHERE user_id = $1 ORDER BY updated_at DESC",
    )
    .bind(user_id)
    .fetch_all(db)
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            error!("failed to fetch chats: {err}");
            return Vec::new();
        }
    };
    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get("id");
        let last_message = latest_message_content(db, &id).await;
        summaries.push(ChatSummary {
            title: row.get("title"),
            updated_at: row.get("updated_at"),
            medical_context_id: row.get("medical_context_id"),
            last_message,
            id,
        });
    }
    summaries
}

async fn list_chat_messages(db: &PgPool, chat_id: &str) -> Vec<ChatMessage> {
    match sqlx::query(
        "SELECT id, chat_id, sender_id, content, responses, created_at \
         FROM messages WHERE chat_id = $1 ORDER BY created_at ASC",
    )
    .bind(chat_id)
    .fetch_all(db)
    .await
    {
        Ok(rows) => rows.into_iter().map(parse_message_row).collect(),
        Err(err) => {
            error!("failed to fetch messages for chat {chat_id}: {err}");
            Vec::new()
        }
    }
}

fn new_chat_title(raw: &str) -> Result<String, AppError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(AppError::Validation("Title is required".to_string()));
    }
    Ok(title.to_string())
}

async fn insert_chat(
    db: &PgPool,
    user_id: &str,
    title: &str,
    medical_context_id: &str,
) -> Result<Chat, AppError> {
    let title = new_chat_title(title)?;
    let medical_context_id = {
        let trimmed = medical_context_id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    };
    let now = now_iso();
    let chat = Chat {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        title,
        medical_context_id,
        created_at: now.clone(),
        updated_at: now,
    };
    sqlx::query(
        "INSERT INTO chats (id, user_id, title, medical_context_id, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(&chat.id)
    .bind(&chat.user_id)
    .bind(&chat.title)
    .bind(&chat.medical_context_id)
    .bind(&chat.created_at)
    .bind(&chat.updated_at)
    .execute(db)
    .await
    .map_err(|err| AppError::Internal {
        message: "Failed to create chat".to_string(),
        details: err.to_string(),
    })?;
    Ok(chat)
}

async fn insert_message(
    db: &PgPool,
    chat_id: &str,
    sender_id: &str,
    content: &str,
) -> Result<ChatMessage, AppError> {
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.trim().to_string(),
        responses: None,
        created_at: now_iso(),
    };
    sqlx::query(
        "INSERT INTO messages (id, chat_id, sender_id, content, created_at) \
         VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(&message.sender_id)
    .bind(&message.content)
    .bind(&message.created_at)
    .execute(db)
    .await
    .map_err(|err| AppError::Internal {
        message: "Failed to create message".to_string(),
        details: err.to_string(),
    })?;
    Ok(message)
}

/// Best-effort bump of the conversation's modification time.
async fn touch_chat(db: &PgPool, chat_id: &str) {
    if let Err(err) = sqlx::query("UPDATE chats SET updated_at = $1 WHERE id = $2")
        .bind(now_iso())
        .bind(chat_id)
        .execute(db)
        .await
    {
        warn!("failed to touch chat {chat_id}: {err}");
    }
}

fn extract_agent_reply(payload: &Value) -> Option<String> {
    let reply = payload.get("reply")?.as_str()?.trim();
    if reply.is_empty() {
        return None;
    }
    Some(reply.to_string())
}

async fn request_agent_reply(
    state: &Arc<AppState>,
    request: &AgentChatRequest,
) -> Result<String, String> {
    let response = state
        .agent_client
        .post(&state.agent_chat_url)
        .json(request)
        .send()
        .await
        .map_err(|err| format!("agent request failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("agent returned {status}: {body}"));
    }
    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| format!("agent parse failed: {err}"))?;
    extract_agent_reply(&payload).ok_or_else(|| "agent response had empty reply".to_string())
}

async fn health() -> &'static str {
    "OK"
}

async fn get_landing() -> Response {
    match pages::landing_page() {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_login_page() -> Response {
    match pages::login_page() {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_register_page() -> Response {
    match pages::register_page() {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_login(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Response {
    let email = normalize_email(&form.email);
    if email.is_empty() || form.password.is_empty() {
        return AppError::Validation("Email and password are required.".to_string())
            .into_response();
    }

    let row = sqlx::query("SELECT id, password_hash FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(row) = row else {
        return AppError::Unauthorized("Invalid email or password".to_string()).into_response();
    };
    let user_id: String = row.get("id");
    let password_hash: String = row.get("password_hash");
    if !verify(&form.password, &password_hash).unwrap_or(false) {
        return AppError::Unauthorized("Invalid email or password".to_string()).into_response();
    }

    let _ = sqlx::query("UPDATE users SET last_login_at = $1 WHERE id = $2")
        .bind(now_iso())
        .bind(&user_id)
        .execute(&state.db)
        .await;

    let Some(token) = issue_session_token(&state, &user_id).await else {
        return AppError::Internal {
            message: "Failed to create session".to_string(),
            details: "session token insert failed".to_string(),
        }
        .into_response();
    };

    info!("user {user_id} signed in");
    with_session_cookie(
        Redirect::to("/").into_response(),
        &token,
        SESSION_TTL_DAYS * 24 * 60 * 60,
    )
}

async fn post_register(
    State(state): State<Arc<AppState>>,
    Form(form): Form<RegisterForm>,
) -> Response {
    if form.email.trim().is_empty() || form.password.is_empty() || form.confirm_password.is_empty()
    {
        return AppError::Validation("All fields are required.".to_string()).into_response();
    }
    if form.password != form.confirm_password {
        return AppError::Validation("Passwords do not match.".to_string()).into_response();
    }
    let email = normalize_email(&form.email);
    if !valid_email(&email) {
        return AppError::Validation("Invalid email address.".to_string()).into_response();
    }
    if form.password.trim().len() < 6 {
        return AppError::Validation("Password must be at least 6 characters.".to_string())
            .into_response();
    }

    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE email = $1")
        .bind(&email)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0)
        > 0;
    if exists {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Email already registered" })),
        )
            .into_response();
    }

    let password_hash = match hash(&form.password, DEFAULT_COST) {
        Ok(value) => value,
        Err(err) => {
            return AppError::Internal {
                message: "Unable to hash password".to_string(),
                details: err.to_string(),
            }
            .into_response();
        }
    };

    let now = now_iso();
    let inserted = sqlx::query(
        "INSERT INTO users (id, email, password_hash, full_name, created_at, updated_at, last_login_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&email)
    .bind(&password_hash)
    .bind("")
    .bind(&now)
    .bind(&now)
    .bind("")
    .execute(&state.db)
    .await;
    if let Err(err) = inserted {
        return AppError::Internal {
            message: "Failed to create account".to_string(),
            details: err.to_string(),
        }
        .into_response();
    }

    Redirect::to("/login").into_response()
}

async fn post_logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = session_cookie(&headers) {
        if let Err(err) = sqlx::query("DELETE FROM session_tokens WHERE token = $1")
            .bind(&token)
            .execute(&state.db)
            .await
        {
            error!("logout failed: {err}");
            return AppError::Internal {
                message: "Logout failed".to_string(),
                details: err.to_string(),
            }
            .into_response();
        }
    }
    with_session_cookie(Json(json!({ "success": true })).into_response(), "", 0)
}

async fn get_home(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (user, profile) = match gate_page(&state, &headers, "/").await {
        Ok(resolved) => resolved,
        Err(redirect) => return redirect.into_response(),
    };
    let Some(profile) = profile else {
        return Redirect::temporary("/onboarding").into_response();
    };
    match pages::home_page(&user, &profile) {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_onboarding(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(user) = auth_user_from_headers(&state, &headers).await else {
        return Redirect::temporary("/login").into_response();
    };
    if load_profile(&state.db, &user.id).await.is_some() {
        return Redirect::temporary("/").into_response();
    }
    match pages::onboarding_page(&user) {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_onboarding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<OnboardingForm>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    let profile = match parse_onboarding_form(&user.id, &form) {
        Ok(profile) => profile,
        Err(message) => return AppError::Validation(message).into_response(),
    };

    if let Err(err) = insert_profile(&state.db, &profile).await {
        error!("failed to create medical profile for {}: {err}", user.id);
        return AppError::Internal {
            message: "Failed to create medical profile".to_string(),
            details: err.to_string(),
        }
        .into_response();
    }

    info!("medical profile created for user {}", user.id);
    Json(json!({ "success": true, "redirect": "/" })).into_response()
}

async fn get_chats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (user, _) = match gate_page(&state, &headers, "/chats").await {
        Ok(resolved) => resolved,
        Err(redirect) => return redirect.into_response(),
    };
    let chats = list_chat_summaries(&state.db, &user.id).await;
    match pages::chats_page(&user, &chats) {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_chat_list_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<ChatListActionForm>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    match form.action.as_str() {
        "createChat" => {
            match insert_chat(&state.db, &user.id, &form.title, &form.medical_context_id).await {
                Ok(chat) => Json(json!({ "success": true, "chat": chat })).into_response(),
                Err(err) => err.into_response(),
            }
        }
        "createMessage" => {
            if form.chat_id.trim().is_empty() || form.content.trim().is_empty() {
                return AppError::Validation("Chat ID and content are required".to_string())
                    .into_response();
            }
            if fetch_owned_chat(&state.db, &form.chat_id, &user.id)
                .await
                .is_none()
            {
                return AppError::Forbidden("Chat not found or access denied".to_string())
                    .into_response();
            }
            let message = match insert_message(&state.db, &form.chat_id, &user.id, &form.content)
                .await
            {
                Ok(message) => message,
                Err(err) => return err.into_response(),
            };
            touch_chat(&state.db, &form.chat_id).await;
            Json(json!({ "success": true, "message": message })).into_response()
        }
        other => AppError::Validation(format!("Unknown action: {other}")).into_response(),
    }
}

async fn get_new_chat(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (user, _) = match gate_page(&state, &headers, "/chats/new").await {
        Ok(resolved) => resolved,
        Err(redirect) => return redirect.into_response(),
    };
    let contexts = list_medical_contexts(&state.db, &user.id).await;
    match pages::new_chat_page(&user, &contexts) {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_new_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<NewChatForm>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    match insert_chat(&state.db, &user.id, &form.title, &form.medical_context_id).await {
        Ok(chat) => Redirect::to(&format!("/chats/{}", chat.id)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_chat_detail(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let path = format!("/chats/{chat_id}");
    let (user, _) = match gate_page(&state, &headers, &path).await {
        Ok(resolved) => resolved,
        Err(redirect) => return redirect.into_response(),
    };

    let Some(chat) = fetch_owned_chat(&state.db, &chat_id, &user.id).await else {
        return AppError::NotFound("Chat not found".to_string()).into_response();
    };

    let medical_context = match &chat.medical_context_id {
        Some(context_id) => load_medical_context(&state.db, context_id, &user.id).await,
        None => None,
    };

    let messages = list_chat_messages(&state.db, &chat_id).await;
    match pages::chat_page(&user, &chat, &messages, medical_context.as_ref()) {
        Ok(html) => html.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_chat_message(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<NewMessageForm>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    if form.content.trim().is_empty() {
        return AppError::Validation("Message content is required".to_string()).into_response();
    }

    // Re-verified at the write path; a stale or forged chat id is a
    // Forbidden here, not a NotFound.
    if fetch_owned_chat(&state.db, &chat_id, &user.id).await.is_none() {
        return AppError::Forbidden("Chat not found or access denied".to_string()).into_response();
    }

    let message = match insert_message(&state.db, &chat_id, &user.id, &form.content).await {
        Ok(message) => message,
        Err(err) => return err.into_response(),
    };

    touch_chat(&state.db, &chat_id).await;

    let request = AgentChatRequest {
        chat_id: chat_id.clone(),
        sender_id: user.id.clone(),
        message: message.content.clone(),
        user_message_id: message.id.clone(),
    };
    match request_agent_reply(&state, &request).await {
        Ok(reply) => {
            Json(json!({ "success": true, "message": message, "agentReply": reply }))
                .into_response()
        }
        Err(err) => {
            warn!("agent call failed for chat {chat_id}: {err}");
            Json(json!({ "success": true, "message": message, "warning": AGENT_FAILED_WARNING }))
                .into_response()
        }
    }
}

pub async fn run() {
    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let agent_chat_url =
        env::var("AGENT_CHAT_URL").unwrap_or_else(|_| "http://localhost:8000/chat".to_string());
    let agent_timeout_secs = env::var("AGENT_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(30);

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let agent_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(agent_timeout_secs))
        .build()
        .expect("failed to build agent http client");

    let state = Arc::new(AppState {
        db,
        agent_client,
        agent_chat_url,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/", get(get_home))
        .route("/landing", get(get_landing))
        .route("/login", get(get_login_page).post(post_login))
        .route("/register", get(get_register_page).post(post_register))
        .route("/auth/logout", post(post_logout))
        .route("/onboarding", get(get_onboarding).post(post_onboarding))
        .route("/chats", get(get_chats).post(post_chat_list_action))
        .route("/chats/new", get(get_new_chat).post(post_new_chat))
        .route("/chats/{chat_id}", get(get_chat_detail).post(post_chat_message))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("carechat server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onboarding_form() -> OnboardingForm {
        OnboardingForm {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            dob: "1990-12-10".to_string(),
            gender: "female".to_string(),
            height: "170".to_string(),
            weight: "60".to_string(),
            medical_history: r#"["asthma"]"#.to_string(),
            allergies: r#"["penicillin"]"#.to_string(),
            medications: "[]".to_string(),
        }
    }

    #[test]
    fn gate_allows_exempt_paths_without_session() {
        assert_eq!(gate_outcome("/landing", false, false), GateOutcome::Allow);
        assert_eq!(gate_outcome("/login", false, false), GateOutcome::Allow);
        assert_eq!(gate_outcome("/register", false, false), GateOutcome::Allow);
    }

    #[test]
    fn gate_redirects_unauthenticated_to_login() {
        assert_eq!(gate_outcome("/", false, false), GateOutcome::RedirectLogin);
        assert_eq!(
            gate_outcome("/chats", false, false),
            GateOutcome::RedirectLogin
        );
        assert_eq!(
            gate_outcome("/onboarding", false, false),
            GateOutcome::RedirectLogin
        );
    }

    #[test]
    fn gate_sends_profileless_users_to_onboarding() {
        assert_eq!(
            gate_outcome("/", true, false),
            GateOutcome::RedirectOnboarding
        );
        assert_eq!(
            gate_outcome("/chats", true, false),
            GateOutcome::RedirectOnboarding
        );
        assert_eq!(
            gate_outcome("/chats/abc", true, false),
            GateOutcome::RedirectOnboarding
        );
        // The onboarding page itself must stay reachable.
        assert_eq!(gate_outcome("/onboarding", true, false), GateOutcome::Allow);
    }

    #[test]
    fn gate_allows_complete_profiles_everywhere() {
        assert_eq!(gate_outcome("/", true, true), GateOutcome::Allow);
        assert_eq!(gate_outcome("/chats", true, true), GateOutcome::Allow);
        assert_eq!(gate_outcome("/onboarding", true, true), GateOutcome::Allow);
    }

    #[test]
    fn list_field_parsing() {
        assert_eq!(parse_list_field(""), Ok(Vec::new()));
        assert_eq!(parse_list_field("  "), Ok(Vec::new()));
        assert_eq!(
            parse_list_field(r#"["a","b"]"#),
            Ok(vec!["a".to_string(), "b".to_string()])
        );
        assert!(parse_list_field("not json").is_err());
        assert!(parse_list_field(r#"{"a":1}"#).is_err());
    }

    #[test]
    fn dob_normalization() {
        assert_eq!(
            normalize_dob("1990-12-10T00:00:00"),
            Some("1990-12-10".to_string())
        );
        assert_eq!(normalize_dob("1990-12-10"), Some("1990-12-10".to_string()));
        assert_eq!(normalize_dob("1990-02-30"), None);
        assert_eq!(normalize_dob("tomorrow"), None);
        assert_eq!(normalize_dob(""), None);
    }

    #[test]
    fn onboarding_form_parses_when_complete() {
        let parsed = parse_onboarding_form("user-1", &onboarding_form()).unwrap();
        assert_eq!(parsed.user_id, "user-1");
        assert_eq!(parsed.dob, "1990-12-10");
        assert_eq!(parsed.height, Some(170));
        assert_eq!(parsed.medical_history, vec!["asthma".to_string()]);
        assert_eq!(parsed.allergies, vec!["penicillin".to_string()]);
        assert!(parsed.medications.is_empty());
    }

    #[test]
    fn onboarding_form_requires_gender() {
        let mut form = onboarding_form();
        form.gender = String::new();
        assert_eq!(
            parse_onboarding_form("user-1", &form),
            Err("Required fields are missing".to_string())
        );
    }

    #[test]
    fn onboarding_form_rejects_malformed_allergies() {
        let mut form = onboarding_form();
        form.allergies = "penicillin".to_string();
        assert_eq!(
            parse_onboarding_form("user-1", &form),
            Err("Invalid JSON data in form submission".to_string())
        );
    }

    #[test]
    fn onboarding_form_rejects_invalid_date() {
        let mut form = onboarding_form();
        form.dob = "1990-13-01".to_string();
        assert_eq!(
            parse_onboarding_form("user-1", &form),
            Err("Invalid date format".to_string())
        );
    }

    #[test]
    fn onboarding_form_degrades_unparsable_numbers() {
        let mut form = onboarding_form();
        form.height = "tall".to_string();
        form.weight = String::new();
        let parsed = parse_onboarding_form("user-1", &form).unwrap();
        assert_eq!(parsed.height, None);
        assert_eq!(parsed.weight, None);
    }

    #[test]
    fn chat_title_validation() {
        assert_eq!(
            new_chat_title("   "),
            Err(AppError::Validation("Title is required".to_string()))
        );
        assert_eq!(new_chat_title("  Sore throat  ").unwrap(), "Sore throat");
    }

    #[test]
    fn session_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session_token=abc-123; lang=en"),
        );
        assert_eq!(session_cookie(&headers), Some("abc-123".to_string()));

        let mut missing = HeaderMap::new();
        missing.insert(header::COOKIE, HeaderValue::from_static("theme=dark"));
        assert_eq!(session_cookie(&missing), None);
        assert_eq!(session_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn session_cookie_attributes() {
        let value = session_cookie_value("abc", 3600);
        assert!(value.starts_with("session_token=abc"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.contains("Max-Age=3600"));
    }

    #[test]
    fn email_helpers() {
        assert_eq!(normalize_email("  Ada@Example.COM "), "ada@example.com");
        assert!(valid_email("ada@example.com"));
        assert!(!valid_email("ada@example"));
        assert!(!valid_email("not an email"));
    }

    #[test]
    fn agent_reply_extraction() {
        assert_eq!(
            extract_agent_reply(&json!({ "reply": "Take rest." })),
            Some("Take rest.".to_string())
        );
        assert_eq!(extract_agent_reply(&json!({ "reply": "  " })), None);
        assert_eq!(extract_agent_reply(&json!({ "reply": 42 })), None);
        assert_eq!(extract_agent_reply(&json!({})), None);
    }

    #[test]
    fn context_titles_fall_back_to_record_id() {
        assert_eq!(
            context_option_title("0123456789ab", "Ada Lovelace"),
            "Ada Lovelace"
        );
        assert_eq!(
            context_option_title("0123456789ab", "  "),
            "Medical Record 01234567"
        );
    }

    #[test]
    fn full_name_trims_parts() {
        assert_eq!(full_name("Ada", "Lovelace"), "Ada Lovelace");
        assert_eq!(full_name("Ada", ""), "Ada");
        assert_eq!(full_name("", ""), "");
    }
}
