//! `DiffEdit` CLI - Edit images by swapping what one prompt describes for another.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use diffedit::image::INPAINTED_IMAGE_FILE;
use diffedit::model::{Device, ModelCache, DEFAULT_INPAINT_REPO};
use diffedit::pipeline::{DEFAULT_ITERATIONS, DEFAULT_SEED};
use diffedit::{Config, DiffEdit, Stage};

/// Mask and inpaint image regions with Stable Diffusion.
#[derive(Parser, Debug)]
#[command(name = "diffedit")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Execution device: best, cpu, cuda, cuda:N or coreml.
    #[arg(long, global = true, default_value = "best", value_name = "DEVICE")]
    device: String,

    /// Number of noise schedule steps used for mask generation.
    #[arg(long, global = true, default_value = "20", value_name = "INT")]
    steps: usize,

    /// Directory holding downloaded models. Defaults to the user cache directory.
    #[arg(long, global = true, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Repository URL the inpainting `UNet` is downloaded from.
    #[arg(long, global = true, default_value = DEFAULT_INPAINT_REPO, value_name = "URL")]
    inpaint_repo: String,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the edit mask and write the mask artifacts to the workdir.
    Mask(MaskArgs),

    /// Inpaint an image using the mask previously saved in the workdir.
    Inpaint(InpaintArgs),

    /// Compute the mask, then inpaint with it.
    Demo(MaskArgs),
}

#[derive(Args, Debug)]
struct MaskArgs {
    /// Input image path.
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Prompt describing what is in the image now.
    #[arg(long, value_name = "PROMPT")]
    remove: String,

    /// Prompt describing what should replace it.
    #[arg(long, value_name = "PROMPT")]
    add: String,

    /// Number of noise draws averaged into the mask.
    #[arg(short, long, default_value_t = DEFAULT_ITERATIONS, value_name = "INT")]
    iterations: usize,

    /// Mask threshold (0.0-1.0). Lower values give larger masks.
    #[arg(short, long, default_value = "0.5", value_name = "FLOAT")]
    threshold: f32,

    /// Random seed for reproducibility.
    #[arg(long, default_value_t = DEFAULT_SEED, value_name = "INT")]
    seed: u64,

    /// Directory for the mask and output images.
    #[arg(short, long, default_value = "workdir", value_name = "DIR")]
    workdir: PathBuf,
}

#[derive(Args, Debug)]
struct InpaintArgs {
    /// Input image path.
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Prompt describing what should fill the masked region.
    #[arg(long, value_name = "PROMPT")]
    add: String,

    /// Classifier-free guidance scale.
    #[arg(short, long, default_value = "7.5", value_name = "FLOAT")]
    guidance: f32,

    /// Random seed for reproducibility.
    #[arg(long, default_value_t = DEFAULT_SEED, value_name = "INT")]
    seed: u64,

    /// Directory holding the saved mask; the result is written here too.
    #[arg(short, long, default_value = "workdir", value_name = "DIR")]
    workdir: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("diffedit={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(&cli) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = Config {
        num_steps: cli.steps,
        ..Config::default()
    };

    match &cli.command {
        Command::Mask(args) => {
            config.mask_threshold = args.threshold;
            let mut diffedit = load(cli, config, Stage::Mask)?;

            let masks = diffedit
                .create_mask(&args.image, &args.remove, &args.add, args.iterations, args.seed)
                .context("Failed to create mask")?;

            diffedit
                .save_mask(&masks, &args.image, &args.workdir)
                .context("Failed to save mask")?;
            println!("Saved mask to {}", args.workdir.display());
        }
        Command::Inpaint(args) => {
            config.guidance_scale = args.guidance;
            let mut diffedit = load(cli, config, Stage::Inpaint)?;

            let masks = diffedit
                .load_mask(&args.workdir)
                .context("Failed to load mask; run `diffedit mask` first")?;
            let inpainted = diffedit
                .inpaint_mask_with_prompt(&args.image, &masks.mask, &args.add, args.seed)
                .context("Failed to inpaint image")?;
            report(&diffedit.save_inpainted_image(&inpainted, &args.workdir)?);
        }
        Command::Demo(args) => {
            config.mask_threshold = args.threshold;
            let mut diffedit = load(cli, config, Stage::Full)?;

            diffedit
                .demo(&args.image, &args.remove, &args.add, args.iterations, args.seed, &args.workdir)
                .context("Failed to run demo")?;
            report(&args.workdir.join(INPAINTED_IMAGE_FILE));
        }
    }

    Ok(())
}

fn load(cli: &Cli, config: Config, stage: Stage) -> Result<DiffEdit> {
    config.validate().context("Invalid configuration")?;

    let device = Device::resolve(&cli.device).context("Failed to select device")?;
    let cache = match &cli.model_dir {
        Some(dir) => ModelCache::with_dir(dir, device),
        None => ModelCache::new(device),
    }
    .context("Failed to open model cache")?
    .with_inpaint_repo(&cli.inpaint_repo);

    DiffEdit::from_pretrained(config, &cache, stage).context("Failed to initialize pipeline")
}

fn report(path: &Path) {
    println!("Saved inpainted image to {}", path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_takes_one_add_prompt() {
        let cli = Cli::try_parse_from([
            "diffedit", "mask", "dog.jpg", "--remove", "dog", "--add", "cat",
        ])
        .unwrap();
        match cli.command {
            Command::Mask(args) => {
                assert_eq!(args.add, "cat");
                assert_eq!(args.seed, DEFAULT_SEED);
                assert_eq!(args.iterations, DEFAULT_ITERATIONS);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.inpaint_repo, DEFAULT_INPAINT_REPO);

        let repeated = Cli::try_parse_from([
            "diffedit", "mask", "dog.jpg", "--remove", "dog", "--add", "cat", "--add", "fox",
        ]);
        assert!(repeated.is_err());
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "diffedit",
            "inpaint",
            "dog.jpg",
            "--add",
            "cat",
            "--device",
            "cpu",
            "--inpaint-repo",
            "https://example.org/inpaint",
        ])
        .unwrap();
        assert_eq!(cli.device, "cpu");
        assert_eq!(cli.inpaint_repo, "https://example.org/inpaint");
        assert!(matches!(cli.command, Command::Inpaint(_)));
    }
}
