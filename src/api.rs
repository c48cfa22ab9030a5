use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::MutexGuard;
use tracing::{error, info};

use crate::{
    app_state::{AppState, BusyGuard, Status},
    models::UploadedFile,
    session::{ProcessSummary, Session, SessionError},
};

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

type ApiError = (StatusCode, Json<serde_json::Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct AskPayload {
    question: String,
}

#[derive(Serialize)]
pub struct AskResponse {
    question: String,
    answer: String,
}

#[derive(Serialize)]
pub struct FileInfo {
    name: String,
    content_type: String,
}

#[derive(Serialize)]
pub struct ChatMessage {
    role: &'static str,
    content: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route(
            "/api/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/files", get(files_handler))
        .route("/api/process", post(process_handler))
        .route("/api/ask", post(ask_handler))
        .route("/api/history", get(history_handler))
        .route("/api/status", get(status_handler))
        .route("/api/reset", post(reset_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Utilidades de error y estado ---

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn session_error(err: SessionError) -> ApiError {
    let status = match err {
        SessionError::NotReady | SessionError::Busy => StatusCode::CONFLICT,
        SessionError::NoFiles | SessionError::EmptyQuestion => StatusCode::BAD_REQUEST,
        SessionError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, format!("{err:#}"))
}

/// La sesión sólo atiende una acción a la vez; si está ocupada se responde 409.
fn lock_session(state: &AppState) -> Result<MutexGuard<'_, Session>, ApiError> {
    state
        .session
        .try_lock()
        .map_err(|_| session_error(SessionError::Busy))
}

fn file_infos(names: Vec<String>) -> Vec<FileInfo> {
    names
        .into_iter()
        .map(|name| FileInfo {
            content_type: mime_guess::from_path(&name)
                .first_or_octet_stream()
                .to_string(),
            name,
        })
        .collect()
}

// --- Handlers ---

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<FileInfo>>, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Formulario inválido: {e}")))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field.bytes().await.map_err(|e| {
            api_error(StatusCode::BAD_REQUEST, format!("Error leyendo '{name}': {e}"))
        })?;
        files.push(UploadedFile::new(name, data.to_vec()));
    }

    if files.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No se recibió ningún fichero."));
    }

    let mut session = lock_session(&state)?;
    let names = session.upload(files);
    Ok(Json(file_infos(names)))
}

#[axum::debug_handler]
async fn files_handler(State(state): State<AppState>) -> Result<Json<Vec<FileInfo>>, ApiError> {
    let session = lock_session(&state)?;
    Ok(Json(file_infos(session.file_names())))
}

#[axum::debug_handler]
async fn process_handler(
    State(state): State<AppState>,
) -> Result<Json<ProcessSummary>, ApiError> {
    let mut session = lock_session(&state)?;
    let busy = BusyGuard::start(&state.status, "Procesando documentos...");

    let result = session.process().await;
    match result {
        Ok(summary) => {
            busy.finish(format!("¡Procesado completado! {summary}"));
            Ok(Json(summary))
        }
        Err(err) => {
            error!("Error en el procesado: {err:#}");
            busy.finish(format!("Error en el procesado: {err}"));
            Err(session_error(err))
        }
    }
}

#[axum::debug_handler]
async fn ask_handler(
    State(state): State<AppState>,
    Json(payload): Json<AskPayload>,
) -> Result<Json<AskResponse>, ApiError> {
    let mut session = lock_session(&state)?;
    let busy = BusyGuard::start(&state.status, "Pensando...");

    let result = session.ask(&payload.question).await;
    busy.finish("Listo.");

    match result {
        Ok(turn) => Ok(Json(AskResponse {
            question: turn.question,
            answer: turn.answer,
        })),
        Err(err) => Err(session_error(err)),
    }
}

#[axum::debug_handler]
async fn history_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let session = lock_session(&state)?;
    let messages = session
        .history()
        .iter()
        .flat_map(|turn| {
            [
                ChatMessage { role: "user", content: turn.question.clone() },
                ChatMessage { role: "assistant", content: turn.answer.clone() },
            ]
        })
        .collect();
    Ok(Json(messages))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

#[axum::debug_handler]
async fn reset_handler(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    let mut session = lock_session(&state)?;
    session.reset();
    BusyGuard::start(&state.status, "Reiniciando...").finish("Sesión reiniciada.");
    Ok(StatusCode::OK)
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}
