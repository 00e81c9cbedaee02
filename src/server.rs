use std::collections::HashMap;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Multipart};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::CONFIG;
use crate::llm::{self, ImageFile};
use crate::llm::media::detect_mime_type;

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Relay surface. The browser never sees the Gemini key; it posts the
/// binary inputs here and gets JSON back.
pub fn router() -> Router {
    Router::new()
        .route("/api/generate-yaml", post(generate_yaml))
        .route(
            "/api/generate-character-sheet",
            post(generate_character_sheet),
        )
        .route("/api/generate-new-image", post(generate_new_image))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

pub async fn run() -> Result<()> {
    let addr = format!("{}:{}", CONFIG.host, CONFIG.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Relay listening on http://{addr}");
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to install shutdown handler: {err}");
        return;
    }
    info!("Shutdown signal received");
}

fn cors_layer() -> CorsLayer {
    let origins: Vec<HeaderValue> = CONFIG
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Everything a handler pulls out of a multipart form: text fields by
/// name, file fields decoded into `ImageFile`s.
#[derive(Default)]
struct FormData {
    files: HashMap<String, ImageFile>,
    fields: HashMap<String, String>,
}

impl FormData {
    fn file(&self, name: &str) -> Option<&ImageFile> {
        self.files.get(name)
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

async fn collect_form(multipart: &mut Multipart) -> Result<FormData> {
    let mut form = FormData::default();
    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        if file_name.is_some() || content_type.as_deref().is_some_and(|ct| ct.starts_with("image/")) {
            let bytes = field.bytes().await?.to_vec();
            let mime_type = content_type
                .filter(|ct| ct != "application/octet-stream")
                .or_else(|| detect_mime_type(&bytes))
                .unwrap_or_else(|| "application/octet-stream".to_string());
            form.files
                .insert(name, ImageFile::new(bytes, mime_type, file_name));
        } else {
            form.fields.insert(name, field.text().await?);
        }
    }
    Ok(form)
}

async fn generate_yaml(mut multipart: Multipart) -> Response {
    let form = match collect_form(&mut multipart).await {
        Ok(form) => form,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let (Some(image), Some(prompt)) = (form.file("image"), form.text("prompt")) else {
        return error_body(StatusCode::BAD_REQUEST, "Image file and prompt are required");
    };

    match llm::generate_yaml_prompt(image, prompt).await {
        Ok(yaml) => Json(json!({ "yamlPrompt": yaml })).into_response(),
        Err(err) => {
            error!("YAML generation failed: {err:#}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn generate_character_sheet(mut multipart: Multipart) -> Response {
    let form = match collect_form(&mut multipart).await {
        Ok(form) => form,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let (Some(image), Some(yaml_prompt)) = (form.file("image"), form.text("yamlPrompt")) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            "Image file and YAML prompt are required",
        );
    };

    match llm::generate_character_sheet(image, yaml_prompt).await {
        Ok(sheet) => Json(json!({ "characterSheet": sheet })).into_response(),
        Err(err) => {
            error!("Character sheet generation failed: {err:#}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn generate_new_image(mut multipart: Multipart) -> Response {
    let form = match collect_form(&mut multipart).await {
        Ok(form) => form,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let (Some(sheet), Some(prompt)) = (form.file("characterSheet"), form.text("prompt")) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            "Character sheet file and prompt are required",
        );
    };
    let composition = form.file("compositionImage");

    match llm::generate_new_image(sheet, prompt, composition).await {
        Ok(output) => {
            Json(json!({ "image": output.image, "text": output.text })).into_response()
        }
        Err(err) => {
            error!("New image generation failed: {err:#}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
