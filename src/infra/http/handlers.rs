use axum::{
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};

use crate::application::compile::OutputKind;

use super::{body::RenderInput, error::ApiError, state::AppState};

pub async fn render_html(
    State(state): State<AppState>,
    input: RenderInput,
) -> Result<Response, ApiError> {
    render(&state, input, OutputKind::HtmlFragment).await
}

pub async fn render_pdf(
    State(state): State<AppState>,
    input: RenderInput,
) -> Result<Response, ApiError> {
    render(&state, input, OutputKind::Pdf).await
}

pub async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn render(
    state: &AppState,
    input: RenderInput,
    output: OutputKind,
) -> Result<Response, ApiError> {
    let artifact = state
        .pipeline()
        .submit(input.content, input.images, output)
        .await?;

    Ok(([(CONTENT_TYPE, artifact.content_type)], artifact.bytes).into_response())
}
