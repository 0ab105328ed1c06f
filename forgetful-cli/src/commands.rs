//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use forgetful_ml::{ForgetModel, PipelineConfig, TrainingBackend, default_device, load_config};
use std::path::Path;

type Pipeline = ForgetModel<TrainingBackend>;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path).map_err(|e| anyhow::anyhow!("Configuration error: {e}"))?;

    match command {
        Commands::Train => handle_train(config),
        Commands::Prune { factor, weights } => handle_prune(config, factor, weights.as_deref()),
        Commands::Export { weights, factor } => handle_export(config, &weights, factor),
        Commands::Predict { weights, json } => handle_predict(config, &weights, json),
        Commands::Evaluate { weights } => handle_evaluate(config, &weights),
        Commands::Summary => handle_summary(config),
        Commands::Config { action } => handle_config(action, &config),
    }
}

fn pipeline(config: PipelineConfig) -> anyhow::Result<Pipeline> {
    Ok(ForgetModel::new(config, default_device())?)
}

fn handle_train(config: PipelineConfig) -> anyhow::Result<()> {
    let mut model = pipeline(config)?;
    model.load_data()?;
    model.build()?;
    let (loss, val_loss) = model.train()?;

    println!("{:>5}  {:>10}  {:>10}", "epoch", "loss", "val_loss");
    for (epoch, (l, v)) in loss.iter().zip(&val_loss).enumerate() {
        println!("{:>5}  {l:>10.4}  {v:>10.4}", epoch + 1);
    }
    println!(
        "Weights saved to {}",
        model.config().train.baseline_path.display()
    );
    Ok(())
}

fn handle_prune(config: PipelineConfig, factor: f64, weights: Option<&Path>) -> anyhow::Result<()> {
    let mut model = pipeline(config)?;
    model.load_data()?;
    model.build()?;
    if let Some(weights) = weights {
        model.load(weights)?;
    }
    let report = model.prune(factor)?;

    println!("Sparsity:        {:.3}", report.sparsity);
    println!("Epochs:          {}", report.history.epochs_completed);
    println!("Pruned weights:  {}", report.record.display());
    println!("Mobile artifact: {}", report.artifact.display());
    Ok(())
}

fn handle_export(config: PipelineConfig, weights: &Path, factor: f64) -> anyhow::Result<()> {
    let mut model = pipeline(config)?;
    model.build()?;
    model.load_pruned(weights, factor)?;
    let artifact = model.export_mobile()?;
    println!("Mobile artifact: {}", artifact.display());
    Ok(())
}

fn handle_predict(config: PipelineConfig, weights: &Path, json: bool) -> anyhow::Result<()> {
    let mut model = pipeline(config)?;
    model.load_data()?;
    model.build()?;
    model.load(weights)?;

    for prediction in model.predict()? {
        if json {
            println!("{}", serde_json::to_string(prediction)?);
        } else {
            println!(
                "{}\t{}\t{:.3}",
                prediction.path,
                prediction.predicted,
                prediction.confidence()
            );
        }
    }
    Ok(())
}

fn handle_evaluate(config: PipelineConfig, weights: &Path) -> anyhow::Result<()> {
    let mut model = pipeline(config)?;
    model.load_data()?;
    model.build()?;
    model.load(weights)?;
    let metrics = model.evaluate()?;

    println!("Samples:   {}", metrics.samples);
    println!("Accuracy:  {:.4}", metrics.accuracy);
    println!("Precision: {:.4}", metrics.precision);
    println!("Recall:    {:.4}", metrics.recall);
    println!("F1:        {:.4}", metrics.f1_score);
    println!("Confusion: {:?}", metrics.confusion_matrix);
    Ok(())
}

fn handle_summary(config: PipelineConfig) -> anyhow::Result<()> {
    let mut model = pipeline(config)?;
    model.build()?;
    let layers = model.layers()?;

    println!(
        "{:>4}  {:<28} {:<22} {:>8} {:>10}  trainable",
        "#", "name", "kind", "units", "params"
    );
    for layer in &layers {
        println!(
            "{:>4}  {:<28} {:<22} {:>8} {:>10}  {}",
            layer.index,
            layer.name,
            layer.kind.to_string(),
            layer.units,
            layer.params,
            layer.trainable
        );
    }
    let total: usize = layers.iter().map(|l| l.params).sum();
    let frozen = layers.iter().filter(|l| !l.trainable).count();
    println!("Layers: {}  frozen: {frozen}  params: {total}", layers.len());
    Ok(())
}

fn handle_config(action: ConfigAction, config: &PipelineConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            std::fs::write(&path, PipelineConfig::default().to_toml()?)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
    }
}
