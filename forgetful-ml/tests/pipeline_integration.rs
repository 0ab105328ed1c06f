//! End-to-end tests for `ForgetModel` on a small synthetic CelebA layout.
//!
//! The backbone is shrunk with `channel_divisor` so a full build, train,
//! prune and export cycle runs on the CPU backend in seconds.

use std::path::Path;

use forgetful_ml::config::Granularity;
use forgetful_ml::{
    ForgetError, ForgetModel, LayerKind, MobileModel, PipelineConfig, TrainingBackend,
    default_device,
};
use image::{Rgb, RgbImage};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

type Pipeline = ForgetModel<TrainingBackend>;

/// Write 18 images plus attribute and partition tables, six rows per partition.
fn write_celeba(dir: &Path) {
    let images = dir.join("img_align_celeba");
    std::fs::create_dir_all(&images).unwrap();

    let mut attrs = String::from("image_id,Bald,Blond_Hair\n");
    let mut parts = String::from("image_id,partition\n");
    for i in 0..18u32 {
        let id = format!("{i:06}.png");
        let blond = i % 2 == 0;
        let shade = if blond { 220 } else { 40 };
        RgbImage::from_fn(80, 90, |x, y| Rgb([shade, ((x + y + i) % 255) as u8, 128]))
            .save(images.join(&id))
            .unwrap();
        attrs.push_str(&format!("{id},-1,{}\n", if blond { 1 } else { -1 }));
        parts.push_str(&format!("{id},{}\n", i % 3));
    }
    std::fs::write(dir.join("list_attr_celeba.csv"), attrs).unwrap();
    std::fs::write(dir.join("list_eval_partition.csv"), parts).unwrap();
}

fn small_config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.data.data_folder = dir.to_path_buf();
    config.data.images_folder = dir.join("img_align_celeba");
    config.data.img_height = 75;
    config.data.img_width = 75;
    config.data.training_samples = 4;
    config.data.validation_samples = 2;
    config.data.test_samples = 2;
    config.train.batch_size = 2;
    config.train.epochs = 1;
    config.train.checkpoint_path = dir.join("checkpoints").join("best");
    config.train.baseline_path = dir.join("baseline");
    config.model.channel_divisor = 16;
    config.model.dense1_units = 16;
    config.model.dense2_units = 8;
    config.prune.log_dir = Some(dir.join("prune_logs"));
    config.export.output_dir = Some(dir.join("export"));
    config
}

fn pipeline(dir: &Path) -> Pipeline {
    write_celeba(dir);
    ForgetModel::new(small_config(dir), default_device()).unwrap()
}

/// Autodiff graphs of the backbone outgrow the default test-thread stack.
fn with_large_stack(test: impl FnOnce() + Send + 'static) {
    std::thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(test)
        .unwrap()
        .join()
        .unwrap();
}

fn values<const D: usize>(tensor: burn::tensor::Tensor<TrainingBackend, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec().unwrap()
}

#[test]
fn default_config_steps_per_epoch() {
    let model = Pipeline::new(PipelineConfig::default(), default_device()).unwrap();
    assert_eq!(model.steps_per_epoch(), 156);
}

#[test]
fn rejects_invalid_config() {
    let mut config = PipelineConfig::default();
    config.data.img_height = 32;
    let result = Pipeline::new(config, default_device());
    assert!(matches!(result, Err(ForgetError::Config(_))));
}

#[test]
fn build_freezes_leading_layers() {
    let dir = TempDir::new().unwrap();
    let mut model = pipeline(dir.path());
    model.build().unwrap();

    let layers = model.layers().unwrap();
    assert!(layers[..52].iter().all(|l| !l.trainable));
    assert!(layers[52..].iter().all(|l| l.trainable));

    let output = layers.last().unwrap();
    assert_eq!(output.kind, LayerKind::Dense);
    assert_eq!(output.units, 2);
    assert_eq!(output.activation, Some("softmax"));
}

#[test]
fn operations_require_prerequisites() {
    let dir = TempDir::new().unwrap();
    let mut model = pipeline(dir.path());

    assert!(matches!(model.train(), Err(ForgetError::Model(_))));
    assert!(matches!(model.layers(), Err(ForgetError::Model(_))));
    assert!(matches!(model.serialize_mobile(), Err(ForgetError::Model(_))));

    model.build().unwrap();
    assert!(matches!(model.train(), Err(ForgetError::Dataset(_))));
    assert!(matches!(model.predict(), Err(ForgetError::Dataset(_))));
    assert!(matches!(model.prune(0.5), Err(ForgetError::Dataset(_))));
}

#[test]
fn missing_images_folder_is_reported() {
    let dir = TempDir::new().unwrap();
    let mut model = Pipeline::new(small_config(dir.path()), default_device()).unwrap();
    assert!(matches!(model.load_data(), Err(ForgetError::NotFound(_))));
}

#[test]
fn load_data_draws_balanced_splits() {
    let dir = TempDir::new().unwrap();
    let mut model = pipeline(dir.path());
    model.load_data().unwrap();

    let data = model.data().unwrap();
    assert_eq!(data.sizes(), (4, 2, 2));
    assert_eq!(data.train.class_distribution(2), vec![2, 2]);
}

#[test]
fn train_then_reload_and_predict() {
    with_large_stack(|| {
        let dir = TempDir::new().unwrap();
        let mut model = pipeline(dir.path());
        model.load_data().unwrap();
        model.build().unwrap();

        let (loss, val_loss) = model.train().unwrap();
        assert_eq!(loss.len(), 1);
        assert_eq!(val_loss.len(), 1);
        assert!(loss[0].is_finite());
        assert_eq!(model.history().unwrap().epochs_completed, 1);
        assert!(dir.path().join("baseline.mpk").exists());
        assert!(dir.path().join("baseline.json").exists());

        let mut reloaded = pipeline(dir.path());
        reloaded.load_data().unwrap();
        reloaded.build().unwrap();
        reloaded.load(&dir.path().join("baseline")).unwrap();

        let predictions = reloaded.predict().unwrap();
        assert_eq!(predictions.len(), 2);
        for prediction in predictions {
            let total: f32 = prediction.probabilities.iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
            assert!(prediction.predicted < 2);
        }

        let metrics = reloaded.evaluate().unwrap();
        assert_eq!(metrics.samples, 2);
        assert!((0.0..=1.0).contains(&metrics.accuracy));
    });
}

#[test]
fn train_leaves_frozen_layers_untouched() {
    with_large_stack(|| {
        let dir = TempDir::new().unwrap();
        let mut model = pipeline(dir.path());
        model.load_data().unwrap();
        model.build().unwrap();

        let before = model.model().unwrap();
        let stem = &before.convs()[0];
        assert!(stem.bn_frozen);
        let stem_weight = values(stem.conv.weight.val());
        let stem_mean = values(stem.bn.running_mean.value());
        let stem_var = values(stem.bn.running_var.value());
        let before_convs = before.convs();
        let last = before_convs.last().unwrap();
        assert!(!last.bn_frozen);
        let last_mean = values(last.bn.running_mean.value());

        model.train().unwrap();

        let after = model.model().unwrap();
        let stem = &after.convs()[0];
        assert_eq!(values(stem.conv.weight.val()), stem_weight);
        assert_eq!(values(stem.bn.running_mean.value()), stem_mean);
        assert_eq!(values(stem.bn.running_var.value()), stem_var);
        let after_convs = after.convs();
        let last = after_convs.last().unwrap();
        assert_ne!(values(last.bn.running_mean.value()), last_mean);
    });
}

#[test]
fn load_rejects_missing_weights() {
    let dir = TempDir::new().unwrap();
    let mut model = pipeline(dir.path());
    model.build().unwrap();
    let result = model.load(&dir.path().join("nope"));
    assert!(matches!(result, Err(ForgetError::NotFound(_))));
}

#[test]
fn prune_exports_sparse_mobile_model() {
    with_large_stack(|| {
        let dir = TempDir::new().unwrap();
        let mut model = pipeline(dir.path());
        model.load_data().unwrap();
        model.build().unwrap();

        let report = model.prune(0.5).unwrap();
        assert!((report.sparsity - 0.5).abs() < 0.02, "sparsity {}", report.sparsity);
        assert!(report.record.exists());
        assert!(report.artifact.starts_with(dir.path().join("export")));
        assert!(dir.path().join("prune_logs").join("sparsity.jsonl").exists());

        let bytes = model.serialize_mobile().unwrap();
        assert!(!bytes.is_empty());
        let mobile = MobileModel::from_bytes(&bytes).unwrap();
        assert_eq!(mobile.granularity, Granularity::PerChannel.to_string());
        assert!(mobile.sparsity >= 0.45);
        assert!(mobile.weight_count() > 0);

        // Reload the stripped record and export it again.
        let mut exporter = pipeline(dir.path());
        exporter.build().unwrap();
        exporter.load_pruned(&report.record, 0.5).unwrap();
        let artifact = exporter.export_mobile().unwrap();
        let reloaded = MobileModel::from_file(&artifact).unwrap();
        assert_eq!(reloaded.weight_count(), mobile.weight_count());
        assert!(reloaded.sparsity >= 0.45);
    });
}
