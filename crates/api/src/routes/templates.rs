//! Email template management

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use dunning_billing::{EmailTemplate, NewEmailTemplate, TemplateType, TemplateUpdate};
use serde::Deserialize;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub template_type: TemplateType,
    pub subject: String,
    pub body: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn list_templates(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<EmailTemplate>>> {
    Ok(Json(state.dunning.templates.list(auth_user.user_id).await?))
}

pub async fn create_template(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<CreateTemplateRequest>,
) -> ApiResult<(StatusCode, Json<EmailTemplate>)> {
    let template = state
        .dunning
        .templates
        .create(NewEmailTemplate {
            user_id: auth_user.user_id,
            template_type: request.template_type,
            subject: request.subject,
            body: request.body,
            enabled: request.enabled,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn update_template(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(update): Json<TemplateUpdate>,
) -> ApiResult<Json<EmailTemplate>> {
    let template = state
        .dunning
        .templates
        .update(auth_user.user_id, id, update)
        .await?;
    Ok(Json(template))
}
