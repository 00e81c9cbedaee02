use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{
    CONFIG, CHARACTER_SHEET_INSTRUCTION, VARIANT_COMPOSITION_CLAUSE, VARIANT_INSTRUCTION_HEADER,
};
use crate::llm::media::ImageFile;
use crate::utils::http::get_http_client;
use crate::utils::timing::log_llm_timing;

/// Final-stage result: the model is free to answer with an image, text, or
/// both. Callers decide whether a missing image is an error.
#[derive(Debug, Clone, Default)]
pub struct GeneratedOutput {
    pub image: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

const GEMINI_MAX_RETRY_ATTEMPTS: usize = 2;
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;
const GEMINI_REQUEST_TIMEOUT_SECS: u64 = 90;

/// Worst-case wall time for one logical generation call: every attempt
/// gets the full per-request timeout, with a backoff sleep before each
/// retry. Relay clients must wait at least this long.
pub(crate) fn total_request_budget() -> Duration {
    let attempts = GEMINI_MAX_RETRY_ATTEMPTS as u64;
    let backoff_ms: u64 = (1..GEMINI_MAX_RETRY_ATTEMPTS as u64)
        .map(|attempt| GEMINI_RETRY_BASE_DELAY_MS * attempt)
        .sum();
    Duration::from_secs(attempts * GEMINI_REQUEST_TIMEOUT_SECS) + Duration::from_millis(backoff_ms)
}

fn redact_gemini_api_key(text: &str) -> String {
    let key = CONFIG.gemini_api_key.trim();
    if key.is_empty() {
        return text.to_string();
    }
    text.replace(key, "[redacted]")
}

fn gemini_should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn gemini_should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn build_safety_settings() -> Vec<Value> {
    let profile = CONFIG.gemini_safety_settings.as_str();
    let threshold = match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        "permissive" => "OFF",
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}', using permissive defaults.",
                profile
            );
            "OFF"
        }
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": threshold }),
    ]
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_gemini_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| {
            if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                json!({ "text": truncate_for_log(text, 200) })
            } else if let Some(inline_data) = part.get("inlineData") {
                let mime_type = inline_data
                    .get("mimeType")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                let data_len = inline_data
                    .get("data")
                    .and_then(|value| value.as_str())
                    .map(|value| value.len())
                    .unwrap_or(0);
                json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
            } else {
                json!({ "unknownPart": true })
            }
        })
        .collect()
}

fn summarize_gemini_payload(payload: &Value) -> Value {
    let mut summary = Map::new();

    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        let mut summarized_contents = Vec::new();
        for content in contents {
            let role = content
                .get("role")
                .and_then(|value| value.as_str())
                .unwrap_or("user");
            let parts = content
                .get("parts")
                .and_then(|value| value.as_array())
                .map(|parts| summarize_gemini_parts(parts))
                .unwrap_or_default();
            summarized_contents.push(json!({ "role": role, "parts": parts }));
        }
        summary.insert("contents".to_string(), Value::Array(summarized_contents));
    }

    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }

    if let Some(safety) = payload
        .get("safetySettings")
        .and_then(|value| value.as_array())
    {
        summary.insert("safetySettingsCount".to_string(), json!(safety.len()));
    }

    Value::Object(summary)
}

fn summarize_gemini_response(response: &GeminiResponse) -> Value {
    let mut text_parts = 0usize;
    let mut image_parts = 0usize;
    let mut text_preview = None;

    let candidates = response.candidates.as_deref().unwrap_or(&[]);
    for candidate in candidates {
        if let Some(content) = &candidate.content {
            if let Some(parts) = &content.parts {
                for part in parts {
                    match part {
                        GeminiPart::Text { text } => {
                            text_parts += 1;
                            if text_preview.is_none() && !text.trim().is_empty() {
                                text_preview = Some(truncate_for_log(text, 200));
                            }
                        }
                        GeminiPart::InlineData { inline_data } => {
                            if inline_data.mime_type.starts_with("image/") {
                                image_parts += 1;
                            }
                        }
                    }
                }
            }
        }
    }

    json!({
        "candidates": response.candidates.as_ref().map(|candidates| candidates.len()).unwrap_or(0),
        "textParts": text_parts,
        "imageParts": image_parts,
        "textPreview": text_preview
    })
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn normalize_image_mime_type(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        _ => lowered,
    }
}

fn inline_image_part(image: &ImageFile) -> Value {
    let mime_type = normalize_image_mime_type(&image.mime_type);
    let encoded = general_purpose::STANDARD.encode(&image.bytes);
    json!({
        "inlineData": {
            "mimeType": mime_type,
            "data": encoded
        }
    })
}

/// Instruction text for the variant stage. The sheet-fidelity clause is
/// always present; the second-image clause only when a composition
/// reference accompanies the request.
pub(crate) fn variant_instruction(prompt: &str, has_composition: bool) -> String {
    let mut text = VARIANT_INSTRUCTION_HEADER.to_string();
    if has_composition {
        text.push_str(VARIANT_COMPOSITION_CLAUSE);
    }
    text.push_str(&format!(
        "- The **text prompt** provides specific instructions. Follow these instructions: \"{prompt}\""
    ));
    text
}

pub(crate) fn build_variant_parts(
    character_sheet: &ImageFile,
    prompt: &str,
    composition: Option<&ImageFile>,
) -> Vec<Value> {
    let mut parts = vec![inline_image_part(character_sheet)];
    if let Some(composition) = composition {
        parts.push(inline_image_part(composition));
    }
    parts.push(json!({ "text": variant_instruction(prompt, composition.is_some()) }));
    parts
}

static YAML_FENCE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```(?:yaml)?[ \t]*\n").expect("valid regex"));
static YAML_FENCE_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n?```[ \t]*$").expect("valid regex"));

/// The model is asked not to emit markdown fences but does anyway at
/// times; tolerate both shapes.
pub(crate) fn strip_yaml_fences(text: &str) -> String {
    let trimmed = text.trim();
    let without_open = YAML_FENCE_OPEN.replace(trimmed, "");
    let without_close = YAML_FENCE_CLOSE.replace(&without_open, "");
    without_close.trim().to_string()
}

fn extract_text_from_response(response: &GeminiResponse) -> String {
    let mut text_parts = Vec::new();
    for candidate in response.candidates.as_deref().unwrap_or(&[]) {
        if let Some(content) = &candidate.content {
            if let Some(parts) = &content.parts {
                for part in parts {
                    if let GeminiPart::Text { text } = part {
                        if !text.trim().is_empty() {
                            text_parts.push(text.clone());
                        }
                    }
                }
            }
        }
    }
    text_parts.join("\n")
}

/// First inline image of the response as a data URL; the base64 payload is
/// passed through untouched.
fn extract_image_data_url(response: &GeminiResponse) -> Option<String> {
    for candidate in response.candidates.as_deref().unwrap_or(&[]) {
        if let Some(content) = &candidate.content {
            if let Some(parts) = &content.parts {
                for part in parts {
                    if let GeminiPart::InlineData { inline_data } = part {
                        if inline_data.mime_type.starts_with("image/") {
                            return Some(format!(
                                "data:{};base64,{}",
                                inline_data.mime_type, inline_data.data
                            ));
                        }
                    }
                }
            }
        }
    }
    None
}

async fn call_gemini_api(model: &str, payload: Value) -> Result<GeminiResponse> {
    let client = get_http_client();
    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
        model, CONFIG.gemini_api_key
    );

    if tracing::enabled!(tracing::Level::DEBUG) {
        let payload_summary = summarize_gemini_payload(&payload);
        debug!(target: "llm.gemini", model = model, payload = %payload_summary);
    }

    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let response = match client
            .post(&url)
            .timeout(Duration::from_secs(GEMINI_REQUEST_TIMEOUT_SECS))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err_text = redact_gemini_api_key(&err.to_string());
                let should_retry =
                    gemini_should_retry_error(&err) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                warn!(
                    "Gemini request failed to send: {} (timeout={}, connect={}, retrying={})",
                    err_text,
                    err.is_timeout(),
                    err.is_connect(),
                    should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                return Err(anyhow!("Gemini request failed: {}", err_text));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let (message, body_summary) = summarize_error_body(&body);
            let should_retry =
                gemini_should_retry_status(status) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
            warn!(
                "Gemini API error: status={}, body={}, retrying={}",
                status, body_summary, should_retry
            );
            if should_retry {
                tokio::time::sleep(gemini_retry_delay(attempt)).await;
                continue;
            }
            let detail = message.unwrap_or(body_summary);
            return Err(anyhow!(
                "Gemini request failed with status {}: {}",
                status,
                detail
            ));
        }

        let value = response.json::<GeminiResponse>().await?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            let response_summary = summarize_gemini_response(&value);
            debug!(target: "llm.gemini", model = model, response = %response_summary);
        }
        return Ok(value);
    }
}

/// Stage 2: describe the uploaded character as a YAML generation prompt.
pub async fn generate_yaml_prompt(image: &ImageFile, prompt: &str) -> Result<String> {
    let parts = vec![inline_image_part(image), json!({ "text": prompt })];
    let payload = json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "temperature": CONFIG.gemini_temperature,
            "topK": CONFIG.gemini_top_k,
            "topP": CONFIG.gemini_top_p,
            "maxOutputTokens": CONFIG.gemini_max_output_tokens,
        },
        "safetySettings": build_safety_settings(),
    });

    let model = &CONFIG.gemini_text_model;
    log_llm_timing("gemini", model, "generate_yaml_prompt", || async {
        let response = call_gemini_api(model, payload).await?;
        let text = extract_text_from_response(&response);
        if text.trim().is_empty() {
            return Err(anyhow!("API did not return any text. Please try again."));
        }
        Ok(strip_yaml_fences(&text))
    })
    .await
}

/// Stage 3: render the three-view reference sheet, returned as a data URL.
pub async fn generate_character_sheet(image: &ImageFile, yaml_prompt: &str) -> Result<String> {
    let instruction = format!("{CHARACTER_SHEET_INSTRUCTION}{yaml_prompt}");
    let parts = vec![inline_image_part(image), json!({ "text": instruction })];
    let payload = json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "responseModalities": ["IMAGE", "TEXT"]
        },
        "safetySettings": build_safety_settings(),
    });

    let model = &CONFIG.gemini_image_model;
    log_llm_timing("gemini", model, "generate_character_sheet", || async {
        let response = call_gemini_api(model, payload).await?;
        match extract_image_data_url(&response) {
            Some(url) => Ok(url),
            None => {
                let mut fallback =
                    "Character sheet generation failed. The model did not return an image."
                        .to_string();
                let text = extract_text_from_response(&response);
                if !text.trim().is_empty() {
                    fallback.push_str(&format!(
                        " The AI returned text instead: \"{}\"",
                        text.trim()
                    ));
                }
                Err(anyhow!(fallback))
            }
        }
    })
    .await
}

/// Stage 4: draw the character in a new pose or composition. A missing
/// image is reported through `GeneratedOutput`, not as an error, so the
/// caller can surface the model's text as the explanation.
pub async fn generate_new_image(
    character_sheet: &ImageFile,
    prompt: &str,
    composition: Option<&ImageFile>,
) -> Result<GeneratedOutput> {
    let parts = build_variant_parts(character_sheet, prompt, composition);
    let payload = json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "responseModalities": ["IMAGE", "TEXT"]
        },
        "safetySettings": build_safety_settings(),
    });

    let model = &CONFIG.gemini_image_model;
    log_llm_timing("gemini", model, "generate_new_image", || async {
        let response = call_gemini_api(model, payload).await?;
        let image = extract_image_data_url(&response);
        let text = extract_text_from_response(&response);
        let text = if text.trim().is_empty() { None } else { Some(text) };

        if image.is_none() {
            let fallback = text.clone().unwrap_or_else(|| {
                "No image was generated. The model might have refused the prompt for safety reasons."
                    .to_string()
            });
            return Ok(GeneratedOutput {
                image: None,
                text: Some(fallback),
            });
        }

        Ok(GeneratedOutput { image, text })
    })
    .await
}
