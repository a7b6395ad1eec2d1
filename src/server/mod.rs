//! The user-facing web server: an upload form and a prediction route that
//! runs the shared `Predictor` on the uploaded image

use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use anyhow::anyhow;
use std::collections::HashMap;

pub mod routes;
pub mod templates;

/// Register every route on an actix `App`. The caller provides the
/// `web::Data<Predictor>`
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(routes::index).service(routes::predict);
}

/// Largest accepted image upload in bytes. Falls back to
/// `config::MAX_UPLOAD_BYTES` when not registered as app data
#[derive(Debug, Clone, Copy)]
pub struct UploadLimit(pub usize);

#[derive(Debug)]
pub struct WebError {
    err: anyhow::Error,
    status: StatusCode,
}

impl WebError {
    pub fn too_large(limit: usize) -> Self {
        WebError {
            err: anyhow!("upload exceeds the {limit} byte limit"),
            status: StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl std::fmt::Display for WebError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.err)
    }
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        let err = HashMap::from([("errors", vec![self.to_string()])]);

        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(err)
    }

    fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for WebError {
    fn from(err: anyhow::Error) -> WebError {
        WebError {
            err,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<image::ImageError> for WebError {
    fn from(err: image::ImageError) -> Self {
        WebError {
            err: anyhow!(err),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<actix_multipart::MultipartError> for WebError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        WebError {
            err: anyhow!("malformed multipart body: {err}"),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<actix_web::error::BlockingError> for WebError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        WebError {
            err: anyhow!(err),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
