//! The int8 mobile artifact.
//!
//! A safetensors container holding, per conv (batch-norm folded) and dense
//! layer, an `I8` weight tensor, its `F32` scales and an `F32` bias. The
//! header metadata carries the format tag, the architecture as JSON, the
//! weight sparsity and the quantization granularity.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};

use super::fold::{fold_conv, tensor_values};
use super::quantize::{QuantizedTensor, quantize};
use crate::config::Granularity;
use crate::error::ForgetError;
use crate::model::{ClassifierConfig, ImageClassifier};
use crate::persistence::write_atomic;
use crate::pruning::sparsity_of;

pub const FORMAT: &str = "forgetful-mobile";
pub const FORMAT_VERSION: &str = "1";
pub const EXTENSION: &str = "fdlite";

/// One weighted op of the exported network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileOp {
    pub name: String,
    pub index: usize,
    pub op: OpKind,
    /// Present for convolutions.
    pub stride: Option<usize>,
    pub padding: Option<[usize; 2]>,
    pub activation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Conv2d,
    Dense,
}

/// Architecture stored in the artifact header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileArchitecture {
    pub name: String,
    pub num_classes: usize,
    pub channel_divisor: usize,
    pub dense1_units: usize,
    pub dense2_units: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub ops: Vec<MobileOp>,
}

/// Export knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportOptions {
    pub granularity: Granularity,
    pub input_height: usize,
    pub input_width: usize,
}

struct OwnedTensor {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

fn push_layer(out: &mut Vec<OwnedTensor>, name: &str, weight: &QuantizedTensor, bias: &[f32]) {
    out.push(OwnedTensor {
        name: format!("{name}.weight"),
        dtype: Dtype::I8,
        shape: weight.shape.clone(),
        bytes: bytemuck::cast_slice(&weight.values).to_vec(),
    });
    out.push(OwnedTensor {
        name: format!("{name}.scale"),
        dtype: Dtype::F32,
        shape: vec![weight.scales.len()],
        bytes: f32_bytes(&weight.scales),
    });
    out.push(OwnedTensor {
        name: format!("{name}.bias"),
        dtype: Dtype::F32,
        shape: vec![bias.len()],
        bytes: f32_bytes(bias),
    });
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Fold, quantize and serialize a classifier. Never returns empty bytes.
pub fn serialize<B: Backend>(
    model: &ImageClassifier<B>,
    config: &ClassifierConfig,
    options: &ExportOptions,
) -> Result<Vec<u8>, ForgetError> {
    let names: HashMap<usize, String> = model
        .layers()
        .into_iter()
        .map(|layer| (layer.index, layer.name))
        .collect();
    let name_of = |index: usize| {
        names
            .get(&index)
            .cloned()
            .ok_or_else(|| ForgetError::export(format!("no layer with index {index}")))
    };

    let mut tensors = Vec::new();
    let mut ops = Vec::new();
    let (mut zeros, mut total) = (0.0, 0usize);

    for conv in model.convs() {
        let folded = fold_conv(conv)?;
        let name = name_of(folded.index)?;
        zeros += sparsity_of(&folded.weight) * folded.weight.len() as f64;
        total += folded.weight.len();

        let weight = quantize(&folded.weight, &folded.shape, options.granularity);
        push_layer(&mut tensors, &name, &weight, &folded.bias);
        ops.push(MobileOp {
            name,
            index: folded.index,
            op: OpKind::Conv2d,
            stride: Some(folded.stride),
            padding: Some(folded.padding),
            activation: "relu".to_string(),
        });
    }

    let output_index = model.head.output_index;
    for (index, dense) in model.denses() {
        let name = name_of(index)?;
        let kernel = tensor_values(dense.weight.val())?;
        let shape = dense.weight.val().dims();
        let bias = match &dense.bias {
            Some(bias) => tensor_values(bias.val())?,
            None => vec![0.0; shape[1]],
        };
        zeros += sparsity_of(&kernel) * kernel.len() as f64;
        total += kernel.len();

        // Dense kernels are `[in, out]`; a single scale keeps the layout simple.
        let weight = quantize(&kernel, &shape, Granularity::PerTensor);
        push_layer(&mut tensors, &name, &weight, &bias);
        let activation = if index == output_index { "softmax" } else { "relu" };
        ops.push(MobileOp {
            name,
            index,
            op: OpKind::Dense,
            stride: None,
            padding: None,
            activation: activation.to_string(),
        });
    }

    let architecture = MobileArchitecture {
        name: "inception_v3".to_string(),
        num_classes: config.num_classes,
        channel_divisor: config.channel_divisor,
        dense1_units: config.dense1_units,
        dense2_units: config.dense2_units,
        input_height: options.input_height,
        input_width: options.input_width,
        ops,
    };
    let sparsity = if total == 0 { 0.0 } else { zeros / total as f64 };

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), FORMAT.to_string());
    metadata.insert("version".to_string(), FORMAT_VERSION.to_string());
    metadata.insert("architecture".to_string(), serde_json::to_string(&architecture)?);
    metadata.insert("sparsity".to_string(), format!("{sparsity:.6}"));
    metadata.insert("granularity".to_string(), options.granularity.to_string());

    let views = tensors
        .iter()
        .map(|t| Ok((t.name.as_str(), TensorView::new(t.dtype, t.shape.clone(), &t.bytes)?)))
        .collect::<Result<Vec<_>, ForgetError>>()?;
    let bytes = safetensors::serialize(views, Some(metadata))?;

    if bytes.is_empty() {
        return Err(ForgetError::export("serialized artifact is empty"));
    }
    tracing::info!(
        tensors = tensors.len(),
        bytes = bytes.len(),
        sparsity,
        granularity = %options.granularity,
        "Mobile artifact serialized"
    );
    Ok(bytes)
}

/// Write artifact bytes to `dir/<stem>.fdlite`, or a fresh temp file.
pub fn write_artifact(
    bytes: &[u8],
    dir: Option<&Path>,
    stem: &str,
) -> Result<PathBuf, ForgetError> {
    let path = match dir {
        Some(dir) => {
            let path = dir.join(format!("{stem}.{EXTENSION}"));
            write_atomic(&path, bytes)?;
            path
        }
        None => {
            let file = tempfile::Builder::new()
                .prefix(&format!("{stem}-"))
                .suffix(&format!(".{EXTENSION}"))
                .tempfile()?;
            std::fs::write(file.path(), bytes)?;
            let (_, path) = file.keep().map_err(|e| ForgetError::Io(e.error))?;
            path
        }
    };
    tracing::info!(path = %path.display(), bytes = bytes.len(), "Saved mobile model");
    Ok(path)
}

/// A parsed mobile artifact.
#[derive(Debug, Clone)]
pub struct MobileModel {
    pub architecture: MobileArchitecture,
    pub granularity: String,
    /// Weight sparsity recorded at export time.
    pub sparsity: f64,
    pub weights: BTreeMap<String, QuantizedTensor>,
    pub biases: BTreeMap<String, Vec<f32>>,
    pub size_bytes: usize,
}

impl MobileModel {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ForgetError> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| ForgetError::export("artifact has no metadata"))?;
        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| ForgetError::export(format!("artifact metadata lacks {key:?}")))
        };

        let format = field("format")?;
        if format != FORMAT {
            return Err(ForgetError::export(format!("unknown artifact format {format:?}")));
        }
        let architecture: MobileArchitecture = serde_json::from_str(field("architecture")?)?;
        let sparsity = field("sparsity")?
            .parse()
            .map_err(|_| ForgetError::export("invalid sparsity in metadata"))?;
        let granularity = field("granularity")?.clone();

        let tensors = SafeTensors::deserialize(bytes)?;
        let mut weights = BTreeMap::new();
        let mut biases = BTreeMap::new();
        for op in &architecture.ops {
            let weight = tensors.tensor(&format!("{}.weight", op.name))?;
            if weight.dtype() != Dtype::I8 {
                return Err(ForgetError::export(format!("{} weights are not int8", op.name)));
            }
            let scale = tensors.tensor(&format!("{}.scale", op.name))?;
            let bias = tensors.tensor(&format!("{}.bias", op.name))?;

            weights.insert(
                op.name.clone(),
                QuantizedTensor {
                    values: bytemuck::cast_slice::<u8, i8>(weight.data()).to_vec(),
                    scales: f32_values(scale.data()),
                    shape: weight.shape().to_vec(),
                },
            );
            biases.insert(op.name.clone(), f32_values(bias.data()));
        }

        Ok(Self {
            architecture,
            granularity,
            sparsity,
            weights,
            biases,
            size_bytes: bytes.len(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ForgetError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Number of stored weights (biases excluded).
    pub fn weight_count(&self) -> usize {
        self.weights.values().map(|w| w.values.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn options() -> ExportOptions {
        ExportOptions {
            granularity: Granularity::PerChannel,
            input_height: 75,
            input_width: 75,
        }
    }

    fn exported() -> (Vec<u8>, ImageClassifier<TestBackend>) {
        let config = ClassifierConfig::new()
            .with_channel_divisor(32)
            .with_dense1_units(8)
            .with_dense2_units(4);
        let model: ImageClassifier<TestBackend> = config.init(&Default::default());
        (serialize(&model, &config, &options()).unwrap(), model)
    }

    #[test]
    fn test_roundtrip_structure() {
        let (bytes, model) = exported();
        assert!(!bytes.is_empty());

        let mobile = MobileModel::from_bytes(&bytes).unwrap();
        assert_eq!(mobile.architecture.ops.len(), 94 + 3);
        assert_eq!(mobile.weights.len(), 97);
        assert_eq!(mobile.granularity, "per_channel");
        assert_eq!(mobile.architecture.input_height, 75);

        let last = mobile.architecture.ops.last().unwrap();
        assert_eq!(last.op, OpKind::Dense);
        assert_eq!(last.activation, "softmax");
        assert_eq!(mobile.biases[&last.name].len(), 2);

        let dense_weights: usize = model
            .denses()
            .iter()
            .map(|(_, d)| d.weight.val().dims().iter().product::<usize>())
            .sum();
        let conv_weights: usize = model
            .convs()
            .iter()
            .map(|c| c.kernel_dims().iter().product::<usize>())
            .sum();
        assert_eq!(mobile.weight_count(), dense_weights + conv_weights);
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        assert!(MobileModel::from_bytes(b"not a container").is_err());
    }

    #[test]
    fn test_write_artifact() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(b"abc", Some(dir.path()), "pruned").unwrap();
        assert_eq!(path, dir.path().join("pruned.fdlite"));
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");

        let temp = write_artifact(b"xyz", None, "pruned").unwrap();
        assert_eq!(temp.extension().and_then(|e| e.to_str()), Some("fdlite"));
        std::fs::remove_file(temp).unwrap();
    }
}
