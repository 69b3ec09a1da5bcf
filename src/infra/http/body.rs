//! Request body extraction: a multipart form with `content` and `images`
//! fields, or any other body taken verbatim as the document source.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Request, multipart::MultipartError},
    http::{StatusCode, header::CONTENT_TYPE},
};
use serde::Deserialize;

use super::error::{ApiError, messages};

const SOURCE: &str = "infra::http::body";
const CONTENT_FIELD: &str = "content";
const IMAGES_FIELD: &str = "images";

/// Document source plus `name → url` asset references.
#[derive(Debug, Default)]
pub struct RenderInput {
    pub content: String,
    pub images: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    url: String,
}

impl<S> FromRequest<S> for RenderInput
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        if is_multipart(&request) {
            let multipart = Multipart::from_request(request, state)
                .await
                .map_err(|rejection| {
                    ApiError::bad_request(SOURCE, messages::INVALID_FORM)
                        .with_diagnostic(rejection.body_text())
                })?;
            return from_multipart(multipart).await;
        }

        let body = Bytes::from_request(request, state)
            .await
            .map_err(|rejection| {
                let error = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    ApiError::new(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        SOURCE,
                        messages::BODY_TOO_LARGE,
                    )
                } else {
                    ApiError::bad_request(SOURCE, messages::BODY_READ_FAILED)
                };
                error.with_diagnostic(rejection.body_text())
            })?;
        if body.is_empty() {
            return Err(ApiError::bad_request(SOURCE, messages::EMPTY_BODY));
        }

        let content = String::from_utf8(body.to_vec()).map_err(|err| {
            ApiError::bad_request(SOURCE, messages::INVALID_BODY_ENCODING)
                .with_diagnostic(err.to_string())
        })?;

        Ok(Self {
            content,
            images: BTreeMap::new(),
        })
    }
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data")
        })
}

async fn from_multipart(mut multipart: Multipart) -> Result<RenderInput, ApiError> {
    let mut content = None;
    let mut images = None;

    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(CONTENT_FIELD) => content = Some(field.text().await.map_err(form_error)?),
            Some(IMAGES_FIELD) => images = Some(field.text().await.map_err(form_error)?),
            _ => {}
        }
    }

    let images = match images.as_deref().map(str::trim) {
        None | Some("") => BTreeMap::new(),
        Some(raw) => parse_images(raw)?,
    };

    Ok(RenderInput {
        content: content.unwrap_or_default(),
        images,
    })
}

fn parse_images(raw: &str) -> Result<BTreeMap<String, String>, ApiError> {
    let parsed: BTreeMap<String, ImageRef> = serde_json::from_str(raw).map_err(|err| {
        ApiError::bad_request(SOURCE, messages::INVALID_IMAGES_JSON)
            .with_diagnostic(err.to_string())
    })?;
    Ok(parsed
        .into_iter()
        .map(|(name, image)| (name, image.url))
        .collect())
}

fn form_error(err: MultipartError) -> ApiError {
    let error = if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            SOURCE,
            messages::BODY_TOO_LARGE,
        )
    } else {
        ApiError::bad_request(SOURCE, messages::INVALID_FORM)
    };
    error.with_diagnostic(err.body_text())
}
