// HTTP request handlers for API endpoints

use actix_web::{web, HttpResponse, Result};
use std::time::Instant;
use uuid::Uuid;

use crate::api::models::*;
use crate::api::server::AppState;
use crate::database_ops::catalog::CatalogPatch;
use crate::database_ops::catalog_import::{ImportError, ImportSession};

fn import_error_response(err: &ImportError) -> HttpResponse {
    match err {
        ImportError::InvalidState { .. } => {
            HttpResponse::Conflict().json(ApiResponse::<()>::error(err.to_string()))
        }
        ImportError::BulkInsert(_) | ImportError::Catalog(_) => {
            HttpResponse::BadGateway().json(ApiResponse::<()>::error(err.to_string()))
        }
    }
}

fn store_error_response(context: &str, err: &anyhow::Error) -> HttpResponse {
    tracing::error!(error = %err, "{context}");
    HttpResponse::BadGateway().json(ApiResponse::<()>::error(format!("{context}: {err}")))
}

/// Health check endpoint
pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let db_status = match &state.db {
        Some(db) if db.ping().await => "connected",
        Some(_) => "disconnected",
        None => "not configured",
    };

    let response = ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        database: db_status.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
    });
    Ok(HttpResponse::Ok().json(response))
}

/// Active exchange rates, refreshed through the tier chain when stale
pub async fn get_rates(state: web::Data<AppState>) -> Result<HttpResponse> {
    let rates = state.exchange.resolve_rates().await;
    Ok(HttpResponse::Ok().json(ApiResponse::success(rates)))
}

pub async fn convert_amount(
    state: web::Data<AppState>,
    query: web::Query<ConvertQuery>,
) -> Result<HttpResponse> {
    if !query.amount.is_finite() {
        return Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error("amount must be a number")));
    }
    let rates = state.exchange.resolve_rates().await;
    let amount = rates.convert(query.amount, query.from, query.to);
    Ok(HttpResponse::Ok().json(ApiResponse::success(ConvertResponse {
        amount,
        currency: query.to,
        formatted: state.exchange.format(amount, query.to),
    })))
}

/// Parse an uploaded CSV into a preview session; nothing is written until commit
pub async fn preview_import(state: web::Data<AppState>, body: String) -> Result<HttpResponse> {
    let started = Instant::now();
    let existing = match state.catalog.get_all().await {
        Ok(existing) => existing,
        Err(e) => return Ok(store_error_response("loading catalog failed", &e)),
    };

    let mut session = ImportSession::new();
    let result = match session.load(&body, &existing) {
        Ok(result) => result,
        Err(e) => return Ok(import_error_response(&e)),
    };
    let session_id = Uuid::new_v4();
    let state_name = session.state().name();
    tracing::info!(
        %session_id,
        accepted = result.accepted.len(),
        errors = result.errors.len(),
        duplicates = result.duplicates.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "import preview"
    );
    // rejected files keep their session too, until their state is read once or it expires
    state.sessions().insert(session_id, session);

    let mut builder = if result.is_rejected() {
        HttpResponse::UnprocessableEntity()
    } else {
        HttpResponse::Ok()
    };
    Ok(builder.json(ApiResponse::success(ImportPreviewResponse {
        session_id,
        state: state_name,
        result,
    })))
}

pub async fn get_import(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let session_id = path.into_inner();
    let import_state = state.sessions().read_state(&session_id);
    match import_state {
        Some(import_state) => Ok(HttpResponse::Ok().json(ApiResponse::success(import_state))),
        None => Ok(HttpResponse::NotFound().json(ApiResponse::<()>::error("unknown import session"))),
    }
}

/// Explicit confirmation of a previewed import
pub async fn commit_import(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let session_id = path.into_inner();
    // taken out of the map so the lock is not held across the commit
    let Some(mut session) = state.sessions().remove(&session_id) else {
        return Ok(HttpResponse::NotFound().json(ApiResponse::<()>::error("unknown import session")));
    };

    let outcome = session
        .confirm(state.catalog.as_ref(), state.images.as_ref())
        .await;
    state.sessions().insert(session_id, session);

    match outcome {
        Ok(summary) => Ok(HttpResponse::Ok().json(ApiResponse::success(ImportCommitResponse {
            session_id,
            summary,
        }))),
        Err(e) => Ok(import_error_response(&e)),
    }
}

pub async fn discard_import(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let session_id = path.into_inner();
    match state.sessions().remove(&session_id) {
        Some(_) => Ok(HttpResponse::NoContent().finish()),
        None => Ok(HttpResponse::NotFound().json(ApiResponse::<()>::error("unknown import session"))),
    }
}

pub async fn update_product(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    patch: web::Json<CatalogPatch>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    if patch.is_empty() {
        return Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error("no fields to update")));
    }
    let patch = match patch.into_inner().validated() {
        Ok(patch) => patch,
        Err(msg) => return Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error(msg))),
    };
    match state.catalog.update(id, &patch).await {
        Ok(true) => Ok(HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "id": id })))),
        Ok(false) => Ok(HttpResponse::NotFound().json(ApiResponse::<()>::error("unknown product"))),
        Err(e) => Ok(store_error_response("updating product failed", &e)),
    }
}

pub async fn delete_product(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<DeleteQuery>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    let outcome = if query.hard {
        state.catalog.hard_delete(id).await
    } else {
        state.catalog.delete(id).await
    };
    tracing::info!(product = %id, hard = query.hard, "product delete requested");
    match outcome {
        Ok(true) => Ok(HttpResponse::NoContent().finish()),
        Ok(false) => Ok(HttpResponse::NotFound().json(ApiResponse::<()>::error("unknown product"))),
        Err(e) => Ok(store_error_response("deleting product failed", &e)),
    }
}
