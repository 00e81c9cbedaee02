use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

/// An image payload as sent to the generation backend. The workflow keeps
/// these in memory only; persisted snapshots carry preview URLs instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: Option<String>,
}

impl ImageFile {
    pub fn new(bytes: Vec<u8>, mime_type: String, file_name: Option<String>) -> Self {
        Self {
            bytes,
            mime_type,
            file_name,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read image file {}", path.display()))?;
        let mime_type = detect_mime_type(&bytes).unwrap_or_else(|| "image/png".to_string());
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string());
        Ok(Self::new(bytes, mime_type, file_name))
    }

    /// Rebuilds a binary payload from a `data:<mime>;base64,<payload>` URL,
    /// the inverse of [`ImageFile::to_data_url`]. Used to re-submit a stored
    /// character sheet to the backend.
    pub fn from_data_url(data_url: &str, file_name: &str) -> Result<Self> {
        let (mime_type, bytes) = decode_data_url(data_url)?;
        Ok(Self::new(bytes, mime_type, Some(file_name.to_string())))
    }

    pub fn to_data_url(&self) -> String {
        let encoded = general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{}", self.mime_type, encoded)
    }

    pub fn file_name_or(&self, default: &str) -> String {
        self.file_name
            .clone()
            .unwrap_or_else(|| default.to_string())
    }
}

pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>)> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("Not a data URL"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("Malformed data URL: missing payload"))?;

    let mut header_parts = header.split(';');
    let mime_type = header_parts.next().unwrap_or_default().to_string();
    if !header_parts.any(|part| part == "base64") {
        return Err(anyhow!("Unsupported data URL encoding (expected base64)"));
    }
    if mime_type.is_empty() {
        return Err(anyhow!("Malformed data URL: missing MIME type"));
    }

    let bytes = general_purpose::STANDARD
        .decode(payload)
        .context("Failed to decode base64 payload of data URL")?;
    Ok((mime_type, bytes))
}

/// Picks a file extension for writing a decoded image to disk.
pub fn extension_for_mime(mime_type: &str) -> &str {
    match mime_type.split('/').nth(1).unwrap_or("png") {
        "jpeg" => "jpg",
        other => {
            if other.is_empty() {
                "png"
            } else {
                other
            }
        }
    }
}
