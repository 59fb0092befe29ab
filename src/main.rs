use anyhow::{Context, Result};
use drugtox::aggregate::{self, AveragePredictor, SummaryLevel};
use drugtox::cli::{
    parse_args, setup_logging, AverageArgs, CommonArgs, Commands, PredictArgs, SelectionArgs,
};
use drugtox::data::feature_selection::run_feature_selection;
use drugtox::data::loader::{LabelTable, TrialCohort};
use drugtox::data::preprocessing::report_imbalance;
use drugtox::data::FeatureStore;
use drugtox::predict::TrialPredictor;
use drugtox::training::artifacts::{self, ArtifactWriter};
use drugtox::training::level1::Level1Trainer;
use drugtox::training::level2::{Level2Trainer, MetaDataset};
use drugtox::training::{OutputKey, StackingConfig};
use drugtox::utils::validation;
use tracing::{error, info, warn};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", drugtox::info());

    let result = match cli.command {
        Commands::Level1(args) => run_level1(args),
        Commands::Level2(args) => run_level2(args),
        Commands::PredictTrials(args) => run_predict_trials(args),
        Commands::Run(args) => run_pipeline(args),
        Commands::Average(args) => run_average(args),
        Commands::SelectFeatures(args) => run_select_features(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_inputs(config: &StackingConfig) -> Result<(LabelTable, FeatureStore)> {
    validation::exists(&config.data.labels, "Label table")?;
    for (kind, path) in &config.data.features {
        validation::exists(path, &format!("Feature table {}", kind))?;
    }
    let labels = LabelTable::load(&config.data.labels)
        .with_context(|| format!("Failed to load labels from {:?}", config.data.labels))?;
    let store = FeatureStore::load(&config.data).context("Failed to load feature tables")?;
    report_imbalance(&labels, config.endpoint)?;
    Ok((labels, store))
}

fn writer_for(config: &StackingConfig) -> Result<Option<ArtifactWriter>> {
    if !config.write {
        return Ok(None);
    }
    drugtox::utils::ensure_dir(&config.output_dir)?;
    let writer = ArtifactWriter::new(&config.output_dir)
        .with_context(|| format!("Failed to prepare output directory {:?}", config.output_dir))?;
    info!("Writing artifacts to {:?}", config.output_dir);
    Ok(Some(writer))
}

fn write_average(
    writer: Option<&ArtifactWriter>,
    summary: &str,
    output: &str,
    level: SummaryLevel,
) -> Result<()> {
    if let Some(writer) = writer {
        aggregate::average_file(&writer.path(summary), &writer.path(output), level)
            .with_context(|| format!("Failed to average {}", summary))?;
    }
    Ok(())
}

/// Configured selection, or the best classifier per feature set read from
/// the level-1 summary in the output directory
fn selection_from_files(config: &StackingConfig) -> Result<Vec<OutputKey>> {
    let configured = config.selection_keys()?;
    if !configured.is_empty() {
        return Ok(configured);
    }
    let path = config.output_dir.join(artifacts::LEVEL1_SUMMARY);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("No selection given and no level-1 summary at {:?}", path))?;
    let rows = aggregate::parse_summary(&text, SummaryLevel::Level1)?;
    let keys = aggregate::best_per_feature_set(&rows)
        .iter()
        .map(|s| s.parse())
        .collect::<drugtox::Result<Vec<OutputKey>>>()?;
    info!("Selected level-1 outputs from summary: {}", describe(&keys));
    Ok(keys)
}

fn describe(keys: &[OutputKey]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn run_level1(args: CommonArgs) -> Result<()> {
    let config = args.to_config()?;
    let (labels, store) = load_inputs(&config)?;
    let writer = writer_for(&config)?;

    let mut trainer = Level1Trainer::new(&config, &labels, &store);
    if let Some(w) = &writer {
        trainer = trainer.with_writer(w);
    }
    let output = trainer.run().context("Level-1 training failed")?;

    for key in output.best_per_feature_set() {
        info!(
            "Best for {}: {} (mean accuracy {:.4})",
            key.feature_set,
            key.classifier,
            output.mean_accuracy(&key).unwrap_or_default()
        );
    }
    write_average(
        writer.as_ref(),
        artifacts::LEVEL1_SUMMARY,
        artifacts::LEVEL1_AVERAGE,
        SummaryLevel::Level1,
    )
}

fn run_level2(args: SelectionArgs) -> Result<()> {
    let config = args.to_config()?;
    let selection = selection_from_files(&config)?;
    let seeds: Vec<u64> = config.seeds().collect();
    let meta = MetaDataset::load_level1_files(&config.output_dir, &selection, &seeds)
        .context("Failed to assemble level-2 data from level-1 artifacts")?;
    let writer = writer_for(&config)?;

    let mut trainer = Level2Trainer::new(&config);
    if let Some(w) = &writer {
        trainer = trainer.with_writer(w);
    }
    trainer.run(&meta).context("Level-2 training failed")?;

    AveragePredictor::new(config.average_threshold, config.average_polarity)
        .run(&meta, writer.as_ref())?;
    write_average(
        writer.as_ref(),
        artifacts::LEVEL2_SUMMARY,
        artifacts::LEVEL2_AVERAGE,
        SummaryLevel::Level2,
    )
}

fn run_predict_trials(args: PredictArgs) -> Result<()> {
    let mut config = args.selection.to_config()?;
    if let Some(label) = args.meta_classifier {
        config.meta_classifier = label;
    }
    let (labels, store) = load_inputs(&config)?;
    let trials = TrialCohort::load(&config.data.trials).context("Failed to load trial tables")?;
    let selection = selection_from_files(&config)?;
    let seeds: Vec<u64> = config.seeds().collect();
    let meta = MetaDataset::load_level1_files(&config.output_dir, &selection, &seeds)
        .context("Failed to assemble level-2 data from level-1 artifacts")?;
    let writer = writer_for(&config)?;

    let first = meta.first().context("No level-2 data")?;
    let architecture = Level2Trainer::new(&config).search(&config.meta_classifier, first)?;

    let mut predictor = TrialPredictor::new(&config, &labels, &store, &trials);
    if let Some(w) = &writer {
        predictor = predictor.with_writer(w);
    }
    let trial_l1 = predictor.level1(&selection, None)?;
    let table = predictor.level2(&trial_l1, &meta, architecture.as_ref())?;
    log_votes(&table);
    Ok(())
}

fn run_pipeline(args: SelectionArgs) -> Result<()> {
    let config = args.to_config()?;
    let (labels, store) = load_inputs(&config)?;
    let writer = writer_for(&config)?;

    let mut level1 = Level1Trainer::new(&config, &labels, &store);
    if let Some(w) = &writer {
        level1 = level1.with_writer(w);
    }
    let level1 = level1.run().context("Level-1 training failed")?;
    write_average(
        writer.as_ref(),
        artifacts::LEVEL1_SUMMARY,
        artifacts::LEVEL1_AVERAGE,
        SummaryLevel::Level1,
    )?;

    let selection = level1.resolve_selection(&config.selection_keys()?);
    info!("Stacking {}", describe(&selection));
    let meta = MetaDataset::all_from_level1(&level1, &selection)?;

    let mut level2 = Level2Trainer::new(&config);
    if let Some(w) = &writer {
        level2 = level2.with_writer(w);
    }
    let level2_output = level2.run(&meta).context("Level-2 training failed")?;
    AveragePredictor::new(config.average_threshold, config.average_polarity)
        .run(&meta, writer.as_ref())?;
    write_average(
        writer.as_ref(),
        artifacts::LEVEL2_SUMMARY,
        artifacts::LEVEL2_AVERAGE,
        SummaryLevel::Level2,
    )?;

    if !config.data.trials.values().all(|p| p.exists()) {
        warn!("Trial tables not found, skipping trial prediction");
        return Ok(());
    }
    let trials = TrialCohort::load(&config.data.trials).context("Failed to load trial tables")?;
    let searched;
    let architecture = match level2_output.architecture(&config.meta_classifier) {
        Some(a) => a,
        None => {
            searched = level2.search(&config.meta_classifier, &meta[0])?;
            searched.as_ref()
        }
    };

    let mut predictor = TrialPredictor::new(&config, &labels, &store, &trials);
    if let Some(w) = &writer {
        predictor = predictor.with_writer(w);
    }
    let trial_l1 = predictor.level1(&selection, Some(&level1))?;
    let table = predictor.level2(&trial_l1, &meta, architecture)?;
    log_votes(&table);
    Ok(())
}

fn log_votes(table: &drugtox::predict::TrialPredictionTable) {
    for vote in table.votes() {
        info!(
            "{}: mean score {:.4}, {}/{} seeds positive, call {}",
            vote.drug, vote.mean_score, vote.positive_votes, vote.seeds, vote.call
        );
    }
}

fn run_average(args: AverageArgs) -> Result<()> {
    validation::exists(&args.input, "Summary log")?;
    let level: SummaryLevel = args.level.parse()?;
    let rows = aggregate::average_file(&args.input, &args.output, level)
        .with_context(|| format!("Failed to average {:?}", args.input))?;
    for row in rows {
        info!("{} over {} rows: accuracy {:.4}", row.group, row.count, row.metrics.accuracy);
    }
    Ok(())
}

fn run_select_features(args: CommonArgs) -> Result<()> {
    let config = args.to_config()?;
    let (labels, store) = load_inputs(&config)?;
    drugtox::utils::ensure_dir(&config.output_dir)?;
    let writer = ArtifactWriter::new(&config.output_dir)?;
    let lines = run_feature_selection(&config, &labels, &store, &writer)?;
    info!("Appended {} feature-selection lines under {:?}", lines, config.output_dir);
    Ok(())
}
