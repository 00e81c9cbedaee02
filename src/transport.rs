use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::config::{Transport, CONFIG};
use crate::llm;
use crate::llm::media::ImageFile;
use crate::llm::GeneratedOutput;
use crate::utils::http::get_http_client;

/// The three generation operations the workflow needs. One implementation
/// talks to Gemini in-process, the other goes through the relay so the API
/// key can stay on another machine.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn generate_yaml_prompt(&self, image: &ImageFile, prompt: &str) -> Result<String>;

    async fn generate_character_sheet(
        &self,
        image: &ImageFile,
        yaml_prompt: &str,
    ) -> Result<String>;

    async fn generate_new_image(
        &self,
        character_sheet: &ImageFile,
        prompt: &str,
        composition: Option<&ImageFile>,
    ) -> Result<GeneratedOutput>;
}

#[async_trait]
impl<T: GenerativeBackend + ?Sized> GenerativeBackend for Box<T> {
    async fn generate_yaml_prompt(&self, image: &ImageFile, prompt: &str) -> Result<String> {
        (**self).generate_yaml_prompt(image, prompt).await
    }

    async fn generate_character_sheet(
        &self,
        image: &ImageFile,
        yaml_prompt: &str,
    ) -> Result<String> {
        (**self).generate_character_sheet(image, yaml_prompt).await
    }

    async fn generate_new_image(
        &self,
        character_sheet: &ImageFile,
        prompt: &str,
        composition: Option<&ImageFile>,
    ) -> Result<GeneratedOutput> {
        (**self)
            .generate_new_image(character_sheet, prompt, composition)
            .await
    }
}

pub fn backend_from_config() -> Box<dyn GenerativeBackend> {
    match CONFIG.transport {
        Transport::Direct => Box::new(DirectBackend),
        Transport::Relay => Box::new(RelayBackend::new(CONFIG.relay_base_url.clone())),
    }
}

/// In-process calls against the Gemini API.
pub struct DirectBackend;

#[async_trait]
impl GenerativeBackend for DirectBackend {
    async fn generate_yaml_prompt(&self, image: &ImageFile, prompt: &str) -> Result<String> {
        llm::generate_yaml_prompt(image, prompt).await
    }

    async fn generate_character_sheet(
        &self,
        image: &ImageFile,
        yaml_prompt: &str,
    ) -> Result<String> {
        llm::generate_character_sheet(image, yaml_prompt).await
    }

    async fn generate_new_image(
        &self,
        character_sheet: &ImageFile,
        prompt: &str,
        composition: Option<&ImageFile>,
    ) -> Result<GeneratedOutput> {
        llm::generate_new_image(character_sheet, prompt, composition).await
    }
}

#[derive(Debug, Deserialize)]
struct RelayErrorBody {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelayYamlResponse {
    #[serde(rename = "yamlPrompt")]
    yaml_prompt: String,
}

#[derive(Debug, Deserialize)]
struct RelaySheetResponse {
    #[serde(rename = "characterSheet")]
    character_sheet: String,
}

#[derive(Debug, Deserialize)]
struct RelayNewImageResponse {
    image: Option<String>,
    text: Option<String>,
}

/// Headroom on top of the Gemini budget for relay-side overhead
/// (multipart parsing, response marshalling).
const RELAY_TIMEOUT_MARGIN_SECS: u64 = 30;

/// How long a relay request may run. The relay holds the connection open
/// for the whole Gemini call, so the shared client timeout is far too
/// short for generation traffic.
fn relay_request_timeout() -> Duration {
    crate::llm::gemini::total_request_budget() + Duration::from_secs(RELAY_TIMEOUT_MARGIN_SECS)
}

/// Client side of the relay deployment: multipart POSTs against the
/// `/api/generate-*` endpoints.
pub struct RelayBackend {
    base_url: String,
}

impl RelayBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn image_part(image: &ImageFile, default_name: &str) -> Result<Part> {
        Part::bytes(image.bytes.clone())
            .file_name(image.file_name_or(default_name))
            .mime_str(&image.mime_type)
            .with_context(|| format!("Invalid MIME type '{}'", image.mime_type))
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(&self, route: &str, form: Form) -> Result<T> {
        let url = format!("{}{}", self.base_url, route);
        let response = get_http_client()
            .post(&url)
            .timeout(relay_request_timeout())
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Relay request to {route} failed"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<RelayErrorBody>(&body)
                .ok()
                .and_then(|parsed| parsed.error)
                .unwrap_or_else(|| format!("Relay returned status {status}"));
            return Err(anyhow!(message));
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl GenerativeBackend for RelayBackend {
    async fn generate_yaml_prompt(&self, image: &ImageFile, prompt: &str) -> Result<String> {
        let form = Form::new()
            .part("image", Self::image_part(image, "reference.png")?)
            .text("prompt", prompt.to_string());
        let response: RelayYamlResponse = self.post_form("/api/generate-yaml", form).await?;
        Ok(response.yaml_prompt)
    }

    async fn generate_character_sheet(
        &self,
        image: &ImageFile,
        yaml_prompt: &str,
    ) -> Result<String> {
        let form = Form::new()
            .part("image", Self::image_part(image, "reference.png")?)
            .text("yamlPrompt", yaml_prompt.to_string());
        let response: RelaySheetResponse =
            self.post_form("/api/generate-character-sheet", form).await?;
        Ok(response.character_sheet)
    }

    async fn generate_new_image(
        &self,
        character_sheet: &ImageFile,
        prompt: &str,
        composition: Option<&ImageFile>,
    ) -> Result<GeneratedOutput> {
        let mut form = Form::new()
            .part(
                "characterSheet",
                Self::image_part(character_sheet, "character-sheet.png")?,
            )
            .text("prompt", prompt.to_string());
        if let Some(composition) = composition {
            form = form.part(
                "compositionImage",
                Self::image_part(composition, "composition.png")?,
            );
        }

        let response: RelayNewImageResponse =
            self.post_form("/api/generate-new-image", form).await?;
        Ok(GeneratedOutput {
            image: response.image,
            text: response.text,
        })
    }
}
