use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use tracing::info;

mod config;
mod llm;
mod persistence;
mod server;
mod transport;
mod utils;
mod workflow;

use config::CONFIG;
use llm::media::{decode_data_url, extension_for_mime};
use llm::ImageFile;
use persistence::SnapshotStore;
use transport::backend_from_config;
use utils::logging::init_logging;
use workflow::Workflow;

fn generate_usage() -> &'static str {
    "Usage: cargo run -- generate --image <path> [--pose <text>] [--composition <path>] [--out-dir <dir>] [--skip-variant]"
}

struct GenerateArgs {
    image: PathBuf,
    pose: Option<String>,
    composition: Option<PathBuf>,
    out_dir: PathBuf,
    skip_variant: bool,
}

fn parse_generate_args(args: &[String]) -> Result<Option<GenerateArgs>> {
    if args.get(1).map(|value| value.as_str()) != Some("generate") {
        return Ok(None);
    }

    let mut image: Option<PathBuf> = None;
    let mut pose: Option<String> = None;
    let mut composition: Option<PathBuf> = None;
    let mut out_dir = PathBuf::from("out");
    let mut skip_variant = false;

    let mut index = 2;
    while index < args.len() {
        match args[index].as_str() {
            "--image" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --image"))?;
                image = Some(PathBuf::from(value));
            }
            "--pose" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --pose"))?;
                pose = Some(value.clone());
            }
            "--composition" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --composition"))?;
                composition = Some(PathBuf::from(value));
            }
            "--out-dir" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --out-dir"))?;
                out_dir = PathBuf::from(value);
            }
            "--skip-variant" => skip_variant = true,
            other => {
                return Err(anyhow!("Unknown argument: {other}\n{}", generate_usage()));
            }
        }
        index += 1;
    }

    let image = image.ok_or_else(|| anyhow!("--image is required\n{}", generate_usage()))?;
    Ok(Some(GenerateArgs {
        image,
        pose,
        composition,
        out_dir,
        skip_variant,
    }))
}

/// The relay handlers always call Gemini in-process, so `serve` needs the
/// key regardless of the configured transport.
fn ensure_api_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(anyhow!("GEMINI_API_KEY is required to run the relay"));
    }
    Ok(())
}

async fn run_generate(args: GenerateArgs) -> Result<()> {
    let workflow = Workflow::new(
        backend_from_config(),
        SnapshotStore::new(CONFIG.snapshot_path.clone()),
    );

    let reference = ImageFile::from_path(&args.image)
        .with_context(|| format!("Failed to read {}", args.image.display()))?;
    workflow.upload_reference_image(reference);

    if let Some(path) = &args.composition {
        let composition = ImageFile::from_path(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        workflow.upload_composition_image(composition);
    }
    if let Some(pose) = args.pose {
        workflow.set_pose_prompt(pose);
    }

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create {}", args.out_dir.display()))?;

    info!("Generating character description");
    workflow.generate_description().await?;
    let yaml = workflow
        .generated_yaml()
        .ok_or_else(|| anyhow!("No description available after generation"))?;
    let yaml_path = args.out_dir.join("character.yaml");
    std::fs::write(&yaml_path, &yaml)?;
    info!("Wrote {}", yaml_path.display());

    info!("Generating character sheet");
    workflow.generate_sheet().await?;
    let sheet_url = workflow
        .character_sheet()
        .ok_or_else(|| anyhow!("No character sheet available after generation"))?;
    write_data_url(&args.out_dir, "character-sheet", &sheet_url)?;

    if !args.skip_variant {
        info!("Generating pose variant");
        workflow.generate_variant().await?;
        if let Some(generated) = workflow.generated_image() {
            write_data_url(&args.out_dir, "new-image", &generated.url)?;
            if let Some(text) = generated.text {
                info!("Model note: {text}");
            }
        }
    }

    Ok(())
}

fn write_data_url(dir: &Path, stem: &str, data_url: &str) -> Result<PathBuf> {
    let (mime_type, bytes) = decode_data_url(data_url)?;
    let path = dir.join(format!("{stem}.{}", extension_for_mime(&mime_type)));
    std::fs::write(&path, bytes)?;
    info!("Wrote {}", path.display());
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let _logging_guards = init_logging();

    let args: Vec<String> = std::env::args().collect();
    if let Some(generate_args) = parse_generate_args(&args)? {
        return run_generate(generate_args).await;
    }
    if let Some(subcommand) = args.get(1) {
        if subcommand != "serve" {
            return Err(anyhow!(
                "Unknown subcommand: {subcommand} (expected serve or generate)"
            ));
        }
    }

    ensure_api_key(&CONFIG.gemini_api_key)?;

    info!("Starting character sheet studio relay");
    server::run().await
}
