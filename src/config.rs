use std::env;
use std::path::PathBuf;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

/// Which backend the workflow talks to: the Gemini API directly, or a
/// relay process that holds the API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Direct,
    Relay,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub gemini_api_key: String,
    pub gemini_text_model: String,
    pub gemini_image_model: String,
    pub gemini_temperature: f32,
    pub gemini_top_k: i32,
    pub gemini_top_p: f32,
    pub gemini_max_output_tokens: i32,
    pub gemini_safety_settings: String,
    pub http_timeout_secs: u64,
    pub transport: Transport,
    pub relay_base_url: String,
    pub snapshot_path: PathBuf,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_csv(name: &str, default: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn normalize_transport(value: String) -> Transport {
    let trimmed = value.trim().to_lowercase();
    match trimmed.as_str() {
        "" | "direct" => Transport::Direct,
        "relay" => Transport::Relay,
        _ => {
            warn!("Unknown TRANSPORT value '{}'; defaulting to direct.", value);
            Transport::Direct
        }
    }
}

fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

fn normalize_base_url(value: String) -> String {
    value.trim().trim_end_matches('/').to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            host: env_string("HOST", "127.0.0.1"),
            port: env_u16("PORT", 8787),
            allowed_origins: env_csv(
                "ALLOWED_ORIGINS",
                "http://localhost:5173,http://localhost:3000",
            ),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_text_model: env_string("GEMINI_TEXT_MODEL", "gemini-2.5-flash"),
            gemini_image_model: env_string(
                "GEMINI_IMAGE_MODEL",
                "gemini-2.5-flash-image-preview",
            ),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.7),
            gemini_top_k: env_i32("GEMINI_TOP_K", 40),
            gemini_top_p: env_f32("GEMINI_TOP_P", 0.95),
            gemini_max_output_tokens: env_i32("GEMINI_MAX_OUTPUT_TOKENS", 2048),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            http_timeout_secs: env_u64("HTTP_TIMEOUT_SECONDS", 30),
            transport: normalize_transport(env_string("TRANSPORT", "direct")),
            relay_base_url: normalize_base_url(env_string(
                "RELAY_BASE_URL",
                "http://localhost:8787",
            )),
            snapshot_path: PathBuf::from(env_string(
                "SNAPSHOT_PATH",
                "character_sheet_data.json",
            )),
        })
    }
}

/// Prompt asking the text model to describe the uploaded character as a
/// YAML generation prompt. The model is told to replace the placeholder
/// values with what it reads from the image.
pub const YAML_GENERATION_PROMPT: &str = r#"あなたは「キャラクター設定資料プロンプト生成アシスタント」です。
ユーザーがキャラクターの参考画像をアップロードしたら、その画像の内容を解析し、
**キャラクターの外見や服装、特徴を忠実に反映したyaml形式の画像生成プロンプト** を作成してください。

**特に、`style`と`color_mode`は、参照画像のスタイルを忠実に反映させてください。例えば、参照画像がカラーのアニメ塗りであれば `style: "Japanese Anime, full color"` と `color_mode: "full_color"` に設定し、白黒の線画であれば `style: "Japanese Anime, clean lineart, monochrome"` と `color_mode: "black_and_white"` に設定してください。**

出力するyamlは、以下の構造に従うこと：

```yaml
metadata:
  ai_model: "ImageGeneration"
  prompt_type: "Character Reference Sheet"
  style: "<画像から読み取ったスタイル（例：Japanese Anime, full color）>"
  color_mode: "<画像から読み取ったカラースタイル（例：full_color）>"
  aspect_ratio: "3:4"

instructions: |-
  入力されたキャラクターを基にリファレンスシートを生成してください。
  キャラクターの外見や服装、髪型、耳の有無などは参照画像を忠実に再現すること。
  出力構成は以下とする：
  1. キャラクターの正面・背面・側面の全身立ち絵
  2. バストアップの表情差分（3〜4種類）
  3. 必要に応じて頭部や耳のディテールカット

  背景は白。余計な装飾は不要。
  線はクリーンで均一にし、設定資料のように整理する。

layout_constraints: |-
  - 上段：表情差分（横に並べる）
  - 中段：全身立ち絵（正面・背面・側面を横に並べる）
  - 下段：必要なら耳や髪の詳細カット

character_attributes:
  gender: "<画像から読み取った性別>"
  hairstyle: "<画像から読み取った髪型>"
  clothing: "<画像から読み取った服装>"
  accessories: "<画像から読み取った特徴（例：動物耳、しっぽ、帽子など）>"
  expression_variants:
    - "neutral"
    - "happy"
    - "smile"
    - "other (画像から推定)"

input_reference:
  referenced_image_ids:
    - "<アップロードされた画像のID>"
```

提供された画像を分析し、上記のYAMLコンテンツのみを生成してください。出力に ```yaml マーカーを含めないでください。 "<画像から読み取った性別>" のようなプレースホルダー値を画像の分析結果に置き換えてください。 'referenced_image_ids' には、 "user_uploaded_image_1" のようなプレースホルダーを使用してください。"#;

/// Instruction prefix for the character sheet stage; the generated YAML is
/// appended below the trailing `---`.
pub const CHARACTER_SHEET_INSTRUCTION: &str = r#"From the provided character image, generate a character reference sheet. This sheet will be used as the definitive reference for all future images of this character, so it must be a faithful and accurate reproduction.
The output image must contain:
1.  A full-body front view.
2.  A full-body back view.
3.  A full-body side view.
The style, coloring, and line art must be consistent with the provided reference image and the style defined in the YAML below. The background must be plain white.
The following YAML contains a detailed analysis of the character to assist you:
---
"#;

pub const VARIANT_INSTRUCTION_HEADER: &str = r#"You will be given one or two images and a text prompt.
- The **first image** is the definitive character reference sheet. The character's appearance, clothing, style, and coloring **must** be perfectly consistent with this first image.
"#;

pub const VARIANT_COMPOSITION_CLAUSE: &str = "- The **second image** is a reference for the pose and composition. Recreate the pose and composition from the second image, but draw the character from the first image.\n";
