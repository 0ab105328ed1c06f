//! CelebA loader: attribute + partition tables into class-balanced splits.

use std::collections::HashMap;
use std::path::Path;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use super::dataset::{ImageDataset, Sample};
use super::{DataSource, DataSplits};
use crate::config::PipelineConfig;
use crate::error::ForgetError;

/// Partition ids used by `list_eval_partition.csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Train = 0,
    Validation = 1,
    Test = 2,
}

impl Partition {
    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Train),
            1 => Some(Self::Validation),
            2 => Some(Self::Test),
            _ => None,
        }
    }
}

/// Loads CelebA images labelled by one binary attribute.
#[derive(Debug, Clone, Default)]
pub struct CelebaDataLoader;

impl CelebaDataLoader {
    pub fn new() -> Self {
        Self
    }
}

impl DataSource for CelebaDataLoader {
    fn load_data(&self, config: &PipelineConfig) -> Result<DataSplits, ForgetError> {
        let data = &config.data;
        if !data.images_folder.is_dir() {
            return Err(ForgetError::not_found(format!(
                "images folder {}",
                data.images_folder.display()
            )));
        }

        let labels = read_attribute(&data.attributes_path(), &data.target_attribute)?;
        let partitions = read_partitions(&data.partition_path())?;

        // partition -> label -> image ids, in table order
        let mut grouped: HashMap<Partition, [Vec<String>; 2]> = HashMap::new();
        for (image_id, partition) in partitions {
            let Some(&label) = labels.get(&image_id) else {
                continue;
            };
            grouped.entry(partition).or_default()[label].push(image_id);
        }

        let seed = config.train.seed;
        let mut split = |partition: Partition, count: usize| {
            let classes = grouped.remove(&partition).unwrap_or_default();
            let samples = balanced_sample(classes, count, seed + partition as u64)
                .into_iter()
                .map(|(id, label)| Sample::new(data.images_folder.join(id), label))
                .collect::<Vec<_>>();
            tracing::info!(
                partition = ?partition,
                requested = count,
                drawn = samples.len(),
                "Partition sampled"
            );
            ImageDataset::new(samples, data.img_height, data.img_width)
        };

        let train = split(Partition::Train, data.training_samples);
        let validation = split(Partition::Validation, data.validation_samples);
        let test = split(Partition::Test, data.test_samples);

        Ok(DataSplits {
            train,
            validation,
            test,
        })
    }
}

/// Map image id -> class (1 when the attribute is set, else 0).
pub fn read_attribute(path: &Path, attribute: &str) -> Result<HashMap<String, usize>, ForgetError> {
    let mut reader = csv::Reader::from_path(path)?;
    let column = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == attribute)
        .ok_or_else(|| {
            ForgetError::dataset(format!("attribute {attribute} not in {}", path.display()))
        })?;

    let mut labels = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let (Some(id), Some(value)) = (record.get(0), record.get(column)) else {
            continue;
        };
        let value: i32 = value.trim().parse().map_err(|_| {
            ForgetError::dataset(format!("bad {attribute} value {value:?} for {id}"))
        })?;
        labels.insert(id.trim().to_string(), usize::from(value == 1));
    }
    Ok(labels)
}

/// Image ids with their partition, in table order.
pub fn read_partitions(path: &Path) -> Result<Vec<(String, Partition)>, ForgetError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let (Some(id), Some(partition)) = (record.get(0), record.get(1)) else {
            continue;
        };
        let partition = partition
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(Partition::from_id)
            .ok_or_else(|| ForgetError::dataset(format!("bad partition {partition:?} for {id}")))?;
        rows.push((id.trim().to_string(), partition));
    }
    Ok(rows)
}

/// Draw `count` samples split evenly between the two classes, then shuffle them.
///
/// A class with too few rows contributes everything it has.
pub fn balanced_sample(classes: [Vec<String>; 2], count: usize, seed: u64) -> Vec<(String, usize)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let wanted = [count / 2, count - count / 2];

    let mut drawn = Vec::with_capacity(count);
    for (label, mut ids) in classes.into_iter().enumerate() {
        if ids.len() < wanted[label] {
            tracing::warn!(
                label,
                available = ids.len(),
                wanted = wanted[label],
                "Not enough samples for class"
            );
        }
        ids.shuffle(&mut rng);
        drawn.extend(ids.into_iter().take(wanted[label]).map(|id| (id, label)));
    }
    drawn.shuffle(&mut rng);
    drawn
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::data::dataset::Dataset;
    use tempfile::TempDir;

    fn write_tables(dir: &Path, rows: usize) {
        let mut attrs = String::from("image_id,Bald,Blond_Hair\n");
        let mut parts = String::from("image_id,partition\n");
        // Labels alternate inside every partition.
        for i in 0..rows {
            let blond = if i % 2 == 0 { 1 } else { -1 };
            attrs.push_str(&format!("{i:06}.jpg,-1,{blond}\n"));
            parts.push_str(&format!("{i:06}.jpg,{}\n", i % 3));
        }
        std::fs::write(dir.join("list_attr_celeba.csv"), attrs).unwrap();
        std::fs::write(dir.join("list_eval_partition.csv"), parts).unwrap();
    }

    fn config_for(dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.data.data_folder = dir.to_path_buf();
        config.data.images_folder = dir.to_path_buf();
        config.data.training_samples = 10;
        config.data.validation_samples = 6;
        config.data.test_samples = 4;
        config
    }

    #[test]
    fn test_read_attribute() {
        let dir = TempDir::new().unwrap();
        write_tables(dir.path(), 6);
        let table = dir.path().join("list_attr_celeba.csv");
        let labels = read_attribute(&table, "Blond_Hair").unwrap();
        assert_eq!(labels.len(), 6);
        assert_eq!(labels["000000.jpg"], 1);
        assert_eq!(labels["000001.jpg"], 0);
    }

    #[test]
    fn test_missing_attribute_column() {
        let dir = TempDir::new().unwrap();
        write_tables(dir.path(), 3);
        let err = read_attribute(&dir.path().join("list_attr_celeba.csv"), "Eyeglasses");
        assert!(matches!(err, Err(ForgetError::Dataset(_))));
    }

    #[test]
    fn test_balanced_sample() {
        let positives: Vec<String> = (0..20).map(|i| format!("p{i}")).collect();
        let negatives: Vec<String> = (0..20).map(|i| format!("n{i}")).collect();
        let drawn = balanced_sample([negatives, positives], 10, 1);
        assert_eq!(drawn.len(), 10);
        assert_eq!(drawn.iter().filter(|(_, l)| *l == 1).count(), 5);
    }

    #[test]
    fn test_balanced_sample_short_class() {
        let drawn = balanced_sample([vec!["n0".into(); 10], vec!["p0".into(); 2]], 8, 1);
        assert_eq!(drawn.iter().filter(|(_, l)| *l == 1).count(), 2);
        assert_eq!(drawn.iter().filter(|(_, l)| *l == 0).count(), 4);
    }

    #[test]
    fn test_loader_splits() {
        let dir = TempDir::new().unwrap();
        write_tables(dir.path(), 300);
        let splits = CelebaDataLoader::new().load_data(&config_for(dir.path())).unwrap();
        assert_eq!(splits.sizes(), (10, 6, 4));
        assert_eq!(splits.train.class_distribution(2), vec![5, 5]);
        assert_eq!(splits.validation.class_distribution(2), vec![3, 3]);
        assert_eq!(splits.test.class_distribution(2), vec![2, 2]);
        // Every training sample comes from partition 0.
        for sample in splits.train.samples() {
            let name = sample.path.file_name().unwrap().to_string_lossy();
            let id: usize = name.trim_end_matches(".jpg").parse().unwrap();
            assert_eq!(id % 3, 0);
        }
    }

    #[test]
    fn test_loader_missing_images_folder() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path());
        config.data.images_folder = dir.path().join("nope");
        assert!(matches!(
            CelebaDataLoader::new().load_data(&config),
            Err(ForgetError::NotFound(_))
        ));
    }
}
