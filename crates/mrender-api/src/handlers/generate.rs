//! Code generation handler.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::services::detect_scene_names;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct GenerateRequest {
    #[validate(length(max = 4000, message = "description is too long"))]
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub code: String,
    /// Scene classes found in the generated code, in source order
    pub scene_names: Vec<String>,
}

/// `POST /api/generate`
pub async fn generate_code(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    request
        .validate()
        .map_err(|e| ApiError::validation(e.to_string()))?;

    let description = request.description.trim();
    if description.is_empty() {
        return Err(ApiError::bad_request("description must not be empty"));
    }

    let generator = state
        .codegen
        .as_ref()
        .ok_or(ApiError::GenerationNotConfigured)?;

    let code = match generator.generate(description).await {
        Ok(code) => code,
        Err(e) => {
            metrics::record_generation("failed");
            return Err(e);
        }
    };
    metrics::record_generation("succeeded");

    let scene_names = detect_scene_names(&code);
    Ok(Json(GenerateResponse { code, scene_names }))
}
