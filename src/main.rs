use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use tricare_imaging::config::{self, ImagingSettings};
use tricare_imaging::pipeline::classifier::ClassifierService;
use tricare_imaging::pipeline::fallback::OllamaVisionExplainer;
use tricare_imaging::pipeline::orchestrator::{AnalysisOptions, ImagingPipelineOrchestrator};
use tricare_imaging::pipeline::types::{ImageModality, RawImageInput};

/// Preliminary, non-diagnostic pre-screen of one medical image.
#[derive(Parser, Debug)]
#[command(name = "tricare-prescreen", version, about)]
struct Args {
    /// Image file (PNG, JPEG, TIFF, BMP or DICOM).
    #[arg(required_unless_present = "formats")]
    file: Option<PathBuf>,
    /// Imaging modality: xray, ct or mri.
    #[arg(long, default_value = "xray")]
    modality: ImageModality,
    /// Body part shown, e.g. "chest". Selects CT window presets.
    #[arg(long)]
    body_part: Option<String>,
    /// Also ask the vision model for a narrative next to a local result.
    #[arg(long, default_value_t = false)]
    narrative: bool,
    /// Generate a heatmap for low-confidence results whatever the label.
    #[arg(long, default_value_t = false)]
    explain_regardless: bool,
    /// Classifier artifact directory. Overrides TRICARE_MODEL_DIR.
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Print accepted formats and modality routing, then exit.
    #[arg(long, default_value_t = false)]
    formats: bool,
}

fn main() -> ExitCode {
    tricare_imaging::init_tracing();
    let args = Args::parse();

    let mut settings = match ImagingSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(dir) = args.model_dir.clone() {
        settings.model_dir = dir;
    }
    tracing::info!(
        version = config::APP_VERSION,
        model_dir = %settings.model_dir.display(),
        fallback = %settings.fallback_model,
        "{} starting",
        config::APP_NAME
    );

    let fallback = match OllamaVisionExplainer::new(
        &settings.fallback_url,
        &settings.fallback_model,
        settings.fallback_timeout_secs,
    ) {
        Ok(fallback) => fallback,
        Err(e) => {
            eprintln!("Failed to initialise fallback explainer: {e}");
            return ExitCode::FAILURE;
        }
    };
    let classifier = Arc::new(ClassifierService::new(settings.model_dir.clone()));
    let pipeline = ImagingPipelineOrchestrator::new(classifier, Arc::new(fallback), &settings);

    if args.formats {
        return print_json(&pipeline.supported_formats());
    }

    let Some(path) = args.file else {
        eprintln!("No image file given");
        return ExitCode::from(2);
    };
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Cannot read {}: {e}", path.display());
            return ExitCode::from(2);
        }
    };

    let mut input = RawImageInput::new(bytes, args.modality);
    if let Some(part) = args.body_part {
        input = input.with_body_part(part);
    }
    let options = AnalysisOptions {
        explain_regardless: args.explain_regardless,
        narrative: args.narrative,
    };

    match pipeline.analyze(&input, options) {
        Ok(outcome) => print_json(&outcome),
        Err(e) => {
            eprintln!("{}", e.public_message());
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize output: {e}");
            ExitCode::FAILURE
        }
    }
}
