use super::templates::{self, ResultPage};
use super::{UploadLimit, WebError};
use crate::config::{MAX_UPLOAD_BYTES, NO_IMAGE_MESSAGE};
use crate::model::Predictor;
use actix_multipart::{Multipart, MultipartError};
use actix_web::http::header::ContentType;
use actix_web::{get, post, web, HttpResponse};
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageOutputFormat};
use std::io::Cursor;
use std::time::Instant;
use tokio_stream::StreamExt;
use tracing::*;

type Result<T> = std::result::Result<T, WebError>;

/// Name of the file field in the upload form
const IMAGE_FIELD: &str = "image";

/// The upload form
#[get("/")]
pub async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(templates::index())
}

#[post("/predict")]
#[tracing::instrument(skip_all)]
pub async fn predict(
    payload: Multipart,
    state: web::Data<Predictor>,
    limit: Option<web::Data<UploadLimit>>,
) -> Result<HttpResponse> {
    let start = Instant::now();

    let limit = limit.map_or(MAX_UPLOAD_BYTES, |l| l.0);
    let upload = read_upload(payload, limit).await?;

    if upload.is_empty() {
        info!("prediction request without an image");
        return Ok(HttpResponse::Ok()
            .content_type(ContentType::plaintext())
            .body(NO_IMAGE_MESSAGE));
    }

    let image = image::load_from_memory(&upload)?;

    // Run the forward pass off the I/O workers
    let (image, prediction) = {
        let predictor = state.clone();
        web::block(move || {
            let prediction = predictor.predict(&image);
            (image, prediction)
        })
        .await?
    };
    let prediction = prediction?;

    let png_base64 = general_purpose::STANDARD.encode(encode_png(&image)?);
    let elapsed_secs = start.elapsed().as_secs_f64();

    info!(
        "predicted class {} (score {:.4}) in {:.3}s",
        prediction.index, prediction.score, elapsed_secs
    );

    let page = ResultPage {
        png_base64: &png_base64,
        prediction: &prediction,
        elapsed_secs,
    };

    Ok(HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(page.render()))
}

/// Pull the bytes of the `image` file part, skipping anything else. A body
/// that is not multipart at all, or a plain text `image` field, counts as no
/// upload
async fn read_upload(mut payload: Multipart, limit: usize) -> Result<Vec<u8>> {
    let mut upload = Vec::new();
    let mut first = true;

    while let Some(field) = payload.next().await {
        let mut field = match field {
            Ok(field) => field,
            Err(
                MultipartError::NoContentType
                | MultipartError::ParseContentType
                | MultipartError::Boundary
                | MultipartError::Incomplete,
            ) if first => {
                debug!("request body is not a multipart form");
                return Ok(upload);
            }
            Err(e) => return Err(e.into()),
        };
        first = false;

        let disposition = field.content_disposition();
        if disposition.get_name() != Some(IMAGE_FIELD) || disposition.get_filename().is_none() {
            continue;
        }
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if upload.len() + chunk.len() > limit {
                return Err(WebError::too_large(limit));
            }
            upload.extend_from_slice(&chunk);
        }
        break;
    }

    Ok(upload)
}

/// Re-encode an upload as PNG for the result page
fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut cursor = Cursor::new(&mut data);

    match image {
        // PNG has no float samples
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            DynamicImage::ImageRgba16(image.to_rgba16())
                .write_to(&mut cursor, ImageOutputFormat::Png)?
        }
        _ => image.write_to(&mut cursor, ImageOutputFormat::Png)?,
    }

    Ok(data)
}
