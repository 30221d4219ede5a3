use std::path::Path as FsPath;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::Config;
use crate::db::models::FileRecord;
use crate::db::timestamp;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::state::AppState;

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_SLACK: usize = 16 * 1024;

pub fn router(config: &Config) -> Router<AppState> {
    Router::new()
        .route("/file", post(upload))
        .route("/file/{token}", get(download))
        .layer(DefaultBodyLimit::max(
            config.storage.max_upload_bytes + MULTIPART_SLACK,
        ))
}

/// Lowercased extension with its leading dot, or empty when the name has
/// none or it is not plain alphanumeric.
fn extension_of(name: &str) -> String {
    FsPath::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Final path component, without quotes so it fits a header value.
fn display_name(name: &str) -> String {
    FsPath::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .chars()
        .filter(|c| *c != '"' && !c.is_control())
        .collect()
}

async fn upload(
    State(state): State<AppState>,
    user: CurrentUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<Value>)> {
    let max = state.config.storage.max_upload_bytes;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid upload: {}", e.body_text())))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = display_name(field.file_name().unwrap_or("file"));
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Invalid upload: {}", e.body_text())))?;
        if data.len() > max {
            return Err(AppError::BadRequest(format!(
                "File too large, the limit is {} bytes",
                max
            )));
        }

        let token = Uuid::now_v7().simple().to_string();
        let extension = extension_of(&name);
        let path = state
            .config
            .uploads_path()
            .join(format!("{}{}", token, extension));
        tokio::fs::write(&path, &data).await?;

        let conn = state.db.get()?;
        conn.execute(
            "INSERT INTO files (token, name, extension, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![token, name, extension, timestamp(Utc::now())],
        )?;

        tracing::info!(%token, user_id = user.id, bytes = data.len(), "File uploaded");
        return Ok((StatusCode::CREATED, Json(json!({ "token": token }))));
    }

    Err(AppError::BadRequest("Missing multipart field \"file\"".into()))
}

async fn download(State(state): State<AppState>, Path(token): Path<String>) -> AppResult<Response> {
    let record = {
        let conn = state.db.get()?;
        conn.query_row(
            "SELECT token, name, extension, created_at FROM files WHERE token = ?1",
            params![token],
            |row| {
                Ok(FileRecord {
                    token: row.get(0)?,
                    name: row.get(1)?,
                    extension: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or(AppError::NotFound)?
    };

    let path = state
        .config
        .uploads_path()
        .join(format!("{}{}", record.token, record.extension));
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(token = %record.token, "File row without bytes on disk");
            return Err(AppError::NotFound);
        }
        Err(e) => return Err(e.into()),
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.as_ref().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", record.name),
            ),
        ],
        data,
    )
        .into_response())
}
