#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use polylogit::config::PipelineConfig;
use polylogit::data::{load_grid_tsv, load_training_tsv, write_summary_tsv};
use polylogit::pipeline::{FittedModel, fit_with, prepare_observations};
use polylogit::sampler::{CancellationToken, SamplerObserver};

#[derive(Args)]
pub struct FitArgs {
    /// Path to training TSV file with time,latitude,longitude,label columns
    pub training_data: PathBuf,

    /// Pipeline configuration (.toml); defaults are used when omitted
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Where to write the fitted model
    #[arg(long, default_value = "model.toml")]
    pub model_out: PathBuf,

    /// Override the sampler seed from the configuration
    #[arg(long)]
    pub seed: Option<u64>,

    /// Stop sampling after this many seconds and keep the completed prefix (Ctrl-C does the same)
    #[arg(long, value_name = "SECONDS")]
    pub timeout_secs: Option<f64>,

    /// Prediction grid TSV with time,latitude,longitude columns
    #[arg(long, value_name = "PATH")]
    pub grid: Option<PathBuf>,

    /// Where to write the predictive summary for --grid
    #[arg(long, default_value = "summary.tsv", requires = "grid")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Prediction grid TSV with time,latitude,longitude columns
    pub grid: PathBuf,

    /// Path to fitted model file (.toml)
    #[arg(long)]
    pub model: PathBuf,

    /// Where to write the predictive summary
    #[arg(long, default_value = "summary.tsv")]
    pub out: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "polylogit",
    about = "Bayesian multinomial-logit regression over a polynomial basis",
    long_about = "Fits a softmax regression with a Gaussian prior by adaptive Metropolis \
                 sampling and reports posterior-predictive class probabilities over a grid."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model from labelled observations
    #[command(about = "Sample the posterior (outputs: model.toml, optional summary.tsv)")]
    Fit(FitArgs),

    /// Apply a fitted model to a prediction grid
    #[command(about = "Posterior-predictive summary over a grid (outputs: summary.tsv)")]
    Predict(PredictArgs),

    /// Print the default configuration
    #[command(about = "Print the default pipeline configuration as TOML")]
    Config,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Config) => print_default_config(),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.sampler.seed = Some(seed);
    }

    println!("Loading training data from: {}", args.training_data.display());
    let table = load_training_tsv(&args.training_data)?;
    let (scaling, observations) = prepare_observations(&table, config.model.num_classes)?;
    println!(
        "Loaded {} observations over {} classes",
        observations.len(),
        observations.num_classes()
    );

    let cancel = match args.timeout_secs {
        Some(secs) => {
            let budget = Duration::try_from_secs_f64(secs)
                .map_err(|e| format!("Invalid --timeout-secs {secs}: {e}"))?;
            CancellationToken::with_deadline(Instant::now() + budget)
        }
        None => CancellationToken::new(),
    };
    let interrupt = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || interrupt.cancel()) {
        eprintln!("Warning: could not install Ctrl-C handler: {e}");
    }

    let mut progress = SamplingProgress::default();
    let fitted =
        fit_with(&config, &observations, &cancel, &mut progress)?.with_scaling(scaling);
    if fitted.cancelled {
        println!("Sampling stopped early; keeping the completed iterations.");
    }
    println!(
        "Retained {} posterior samples (acceptance rate {:.3})",
        fitted.samples.len(),
        fitted.acceptance_rate
    );

    fitted.save(&args.model_out)?;
    println!("Model saved to: {}", args.model_out.display());

    if let Some(grid_path) = &args.grid {
        write_predictions(&fitted, grid_path, &args.out)?;
    }
    Ok(())
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model.display());
    let fitted = FittedModel::load(&args.model)?;
    write_predictions(&fitted, &args.grid, &args.out)
}

fn write_predictions(
    fitted: &FittedModel,
    grid_path: &Path,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let grid = load_grid_tsv(grid_path)?;
    let summary = fitted.predict_table(&grid)?;
    write_summary_tsv(out, &grid, &summary)?;
    println!("Predictive summary for {} points saved to: {}", grid.len(), out.display());
    Ok(())
}

fn print_default_config() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", PipelineConfig::default().to_toml_string()?);
    Ok(())
}

/// Progress bar over sampler iterations, with the running acceptance rate.
#[derive(Default)]
struct SamplingProgress {
    bar: Option<ProgressBar>,
    accepted: usize,
}

impl SamplerObserver for SamplingProgress {
    fn on_start(&mut self, total_iterations: usize) {
        self.accepted = 0;
        self.bar = Some(create_progress_bar(total_iterations as u64, "sampling"));
    }

    fn on_iteration(&mut self, iteration: usize, accepted: bool) {
        if accepted {
            self.accepted += 1;
        }
        if let Some(bar) = &self.bar {
            bar.inc(1);
            if (iteration + 1) % 500 == 0 {
                let rate = self.accepted as f64 / (iteration + 1) as f64;
                bar.set_message(format!("acceptance {rate:.3}"));
            }
        }
    }

    fn on_finish(&mut self, completed_iterations: usize, accepted: usize) {
        if let Some(bar) = self.bar.take() {
            let rate = if completed_iterations == 0 {
                0.0
            } else {
                accepted as f64 / completed_iterations as f64
            };
            bar.finish_with_message(format!("done, acceptance {rate:.3}"));
        }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}
