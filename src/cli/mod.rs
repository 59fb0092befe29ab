use crate::data::DataPaths;
use crate::training::StackingConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// drugtox: stacked drug-toxicity classification
#[derive(Parser, Debug)]
#[command(name = "drugtox")]
#[command(about = "Two-level stacked classification of drug toxicity")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train level-1 classifiers over every feature set and seed
    Level1(CommonArgs),

    /// Train level-2 meta-classifiers from level-1 artifacts
    Level2(SelectionArgs),

    /// Predict toxicity of clinical-trial drugs from level-1 artifacts
    PredictTrials(PredictArgs),

    /// Run level 1, level 2 and trial prediction in one process
    Run(SelectionArgs),

    /// Average a summary log over seeds
    Average(AverageArgs),

    /// Write feature-selection reports
    SelectFeatures(CommonArgs),
}

/// Arguments shared by the pipeline subcommands
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Directory holding the label and feature tables
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Output directory for artifacts
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Label column used as the endpoint
    #[arg(short, long)]
    pub endpoint: Option<usize>,

    /// Seed of the split the model search runs on
    #[arg(long)]
    pub seed: Option<u64>,

    /// Fraction of the smaller class used for training
    #[arg(long)]
    pub train_fraction: Option<f64>,

    /// Number of resampling seeds
    #[arg(long)]
    pub n_seeds: Option<u64>,

    /// Write artifacts to the output directory
    #[arg(short, long)]
    pub write: bool,

    /// Hide progress bars
    #[arg(long)]
    pub no_progress: bool,
}

impl CommonArgs {
    /// Configuration file (or defaults) with flag overrides applied
    pub fn to_config(&self) -> crate::error::Result<StackingConfig> {
        let mut config = match &self.config {
            Some(path) => StackingConfig::from_file(path)?,
            None => StackingConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data = DataPaths::in_dir(dir);
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(fraction) = self.train_fraction {
            config.train_fraction = fraction;
        }
        if let Some(n) = self.n_seeds {
            config.n_seeds = n;
        }
        config.write |= self.write;
        config.progress &= !self.no_progress;
        config.validate()?;
        Ok(config)
    }
}

/// Pipeline arguments with a level-2 selection
#[derive(Args, Debug, Clone)]
pub struct SelectionArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Level-1 outputs to stack, e.g. `sages-gridsk,fp-centroid`;
    /// defaults to the best classifier per feature set
    #[arg(long = "use", value_delimiter = ',')]
    pub selection: Vec<String>,
}

impl SelectionArgs {
    pub fn to_config(&self) -> crate::error::Result<StackingConfig> {
        let mut config = self.common.to_config()?;
        if !self.selection.is_empty() {
            config.selection = self.selection.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Trial-prediction arguments
#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Registry label of the meta-classifier
    #[arg(short, long)]
    pub meta_classifier: Option<String>,
}

/// Averaging arguments
#[derive(Args, Debug, Clone)]
pub struct AverageArgs {
    /// Summary log to average
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Output file
    #[arg(short, long, required = true)]
    pub output: PathBuf,

    /// Summary layout: 1 or 2
    #[arg(short, long, default_value = "1")]
    pub level: String,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity; `RUST_LOG` takes precedence
pub fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level1_args() {
        let cli = Cli::parse_from(["drugtox", "level1", "-d", "data", "-e", "2", "--write"]);

        match cli.command {
            Commands::Level1(args) => {
                let config = args.to_config().unwrap();
                assert_eq!(config.endpoint, 2);
                assert!(config.write);
                assert_eq!(config.data.labels, PathBuf::from("data/tox_labels.csv"));
                assert_eq!(config.n_seeds, 10);
            }
            _ => panic!("Expected Level1 command"),
        }
    }

    #[test]
    fn test_selection_args() {
        let cli = Cli::parse_from([
            "drugtox",
            "run",
            "--use",
            "sages-gridsk,fp-centroid",
            "--n-seeds",
            "3",
        ]);

        match cli.command {
            Commands::Run(args) => {
                let config = args.to_config().unwrap();
                assert_eq!(config.selection_keys().unwrap().len(), 2);
                assert_eq!(config.n_seeds, 3);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = Cli::parse_from(["drugtox", "level1", "--train-fraction", "1.5"]);
        match cli.command {
            Commands::Level1(args) => assert!(args.to_config().is_err()),
            _ => panic!("Expected Level1 command"),
        }
    }

    #[test]
    fn test_average_args() {
        let cli = Cli::parse_from([
            "drugtox", "average", "-i", "in.csv", "-o", "out.csv", "-l", "2",
        ]);
        match cli.command {
            Commands::Average(args) => {
                assert_eq!(args.input, PathBuf::from("in.csv"));
                assert_eq!(args.level, "2");
            }
            _ => panic!("Expected Average command"),
        }
    }
}
