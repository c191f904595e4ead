//! Upload-and-spawn: accept a findings CSV, persist it under a fresh run
//! directory, and launch the engine as a detached background process.

use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::ingest;
use crate::model::{BootstrapMarker, BootstrapStatus, RunMode};

use super::routes::AppState;

/// Upload size cap, also enforced by the router's body limit.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_ROWS: usize = 5000;
const DEFAULT_WAVE_SIZE: usize = 5;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub run_id: String,
    pub status: &'static str,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// `POST /runs` — multipart form with a `file` field plus optional
/// `wave_size` (1-100) and `mode` (`mock`|`live`|`hybrid`).
pub async fn upload_run(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let mut file: Option<Vec<u8>> = None;
    let mut csv_filename: Option<String> = None;
    let mut wave_size = DEFAULT_WAVE_SIZE;
    let mut mode = RunMode::Mock;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(format!("Malformed multipart body: {e}")),
        };
        match field.name().unwrap_or("") {
            "file" => {
                csv_filename = field.file_name().map(str::to_owned);
                match field.bytes().await {
                    Ok(bytes) if bytes.len() <= MAX_UPLOAD_BYTES => file = Some(bytes.to_vec()),
                    Ok(_) => return bad_request("CSV exceeds the 10 MB upload limit"),
                    Err(e) => return bad_request(format!("Could not read upload: {e}")),
                }
            }
            "wave_size" => {
                let raw = field.text().await.unwrap_or_default();
                match raw.trim().parse::<usize>() {
                    Ok(n) if (1..=100).contains(&n) => wave_size = n,
                    _ => return bad_request("wave_size must be an integer between 1 and 100"),
                }
            }
            "mode" => {
                let raw = field.text().await.unwrap_or_default();
                match raw.trim().parse::<RunMode>() {
                    Ok(parsed) => mode = parsed,
                    Err(e) => return bad_request(e),
                }
            }
            other => {
                tracing::debug!("Ignoring unknown upload field '{other}'");
            }
        }
    }

    let Some(file) = file else {
        return bad_request("Missing 'file' field in multipart upload");
    };

    // Cheap row-count pass before full ingest.
    let row_count = csv::Reader::from_reader(file.as_slice())
        .into_records()
        .count();
    if row_count == 0 {
        return bad_request("CSV contains no data rows");
    }
    if row_count > MAX_ROWS {
        return bad_request(format!("CSV exceeds the {MAX_ROWS} row limit"));
    }

    // Column validation up front so the 400 names the missing column.
    let findings = match ingest::ingest_findings(file.as_slice()) {
        Ok(findings) => findings,
        Err(e) => return bad_request(e.to_string()),
    };
    if findings.is_empty() {
        return bad_request("CSV contains no valid findings");
    }

    let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let run_dir = state.store.run_dir(&run_id);
    if let Err(e) = std::fs::create_dir_all(&run_dir) {
        return storage_error(format!("Could not create run directory: {e}"));
    }
    if let Err(e) = std::fs::write(run_dir.join("findings.csv"), &file) {
        return storage_error(format!("Could not persist findings CSV: {e}"));
    }
    if let Err(e) = state.store.write_bootstrap(&BootstrapMarker {
        status: BootstrapStatus::Starting,
        started_at: Utc::now(),
        run_id: run_id.clone(),
        pid: None,
        error: None,
    }) {
        return storage_error(format!("Could not write bootstrap marker: {e:#}"));
    }

    if state.spawn_engine {
        match spawn_engine_process(&state, &run_id, wave_size, mode, csv_filename.as_deref()) {
            Ok(pid) => {
                tracing::info!("Spawned engine for run {} (pid {})", run_id, pid);
                if let Err(e) = state.store.write_pid(&run_id, pid) {
                    tracing::warn!("Could not record engine pid: {e:#}");
                }
            }
            Err(e) => {
                let _ = state.store.write_bootstrap(&BootstrapMarker {
                    status: BootstrapStatus::FailedToSpawn,
                    started_at: Utc::now(),
                    run_id: run_id.clone(),
                    pid: None,
                    error: Some(e.to_string()),
                });
                return storage_error(format!("Could not spawn run engine: {e}"));
            }
        }
    }

    (
        StatusCode::CREATED,
        Json(UploadResponse {
            run_id,
            status: "started",
        }),
    )
        .into_response()
}

fn storage_error(message: String) -> Response {
    tracing::error!("{message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Launch `remfleet run` detached: no inherited stdio, fire and forget.
/// The child re-reads env config and updates the bootstrap marker itself.
fn spawn_engine_process(
    state: &AppState,
    run_id: &str,
    wave_size: usize,
    mode: RunMode,
    csv_filename: Option<&str>,
) -> std::io::Result<u32> {
    let exe = std::env::current_exe()?;
    let csv_path = state.store.run_dir(run_id).join("findings.csv");

    let mut command = std::process::Command::new(exe);
    command
        .arg("run")
        .arg(csv_path)
        .arg("--run-id")
        .arg(run_id)
        .arg("--mode")
        .arg(mode.as_str())
        .arg("--wave-size")
        .arg(wave_size.to_string());
    if let Some(name) = csv_filename {
        command.arg("--csv-filename").arg(name);
    }
    let child = command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    Ok(child.id())
}
