//! Keras-style layer enumeration.
//!
//! Every layer of the classifier gets a consecutive index in the order Keras
//! lists `model.layers`: sequential parts in construction order, and inside
//! each multi-branch block the layers farthest from the block output first,
//! ties broken by branch order. Freezing and the layer summary both work off
//! these indices.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Kind of a layer in the flat enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    Conv2d,
    BatchNorm,
    Activation,
    MaxPool,
    AvgPool,
    Concatenate,
    GlobalAvgPool,
    Dense,
    Dropout,
}

impl LayerKind {
    /// Base name used when numbering layers.
    pub fn base_name(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Conv2d => "conv2d",
            Self::BatchNorm => "batch_normalization",
            Self::Activation => "activation",
            Self::MaxPool => "max_pooling2d",
            Self::AvgPool => "average_pooling2d",
            Self::Concatenate => "concatenate",
            Self::GlobalAvgPool => "global_average_pooling2d",
            Self::Dense => "dense",
            Self::Dropout => "dropout",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_name())
    }
}

/// One row of the layer summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerInfo {
    pub index: usize,
    pub name: String,
    pub kind: LayerKind,
    pub trainable: bool,
    /// Parameter count (batch-norm counts its moving statistics too).
    pub params: usize,
    /// Output channels or units.
    pub units: usize,
    pub activation: Option<&'static str>,
}

/// A layer as reported by a module, before naming.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    pub index: usize,
    pub kind: LayerKind,
    pub params: usize,
    pub units: usize,
    pub activation: Option<&'static str>,
    /// Fixed name, used for the named concatenations (`mixed0`, ...).
    pub name: Option<String>,
}

impl LayerEntry {
    pub fn new(index: usize, kind: LayerKind, units: usize) -> Self {
        Self {
            index,
            kind,
            params: 0,
            units,
            activation: None,
            name: None,
        }
    }

    pub fn with_params(mut self, params: usize) -> Self {
        self.params = params;
        self
    }

    pub fn with_activation(mut self, activation: &'static str) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Hands out consecutive layer indices during construction.
#[derive(Debug, Default)]
pub struct LayerCounter {
    next: usize,
}

impl LayerCounter {
    /// A counter that has already assigned index 0 to the input layer.
    pub fn after_input() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> usize {
        let index = self.next;
        self.next += 1;
        index
    }

    /// Reserve `n` consecutive indices and return the first.
    pub fn reserve(&mut self, n: usize) -> usize {
        let first = self.next;
        self.next += n;
        first
    }

    pub fn count(&self) -> usize {
        self.next
    }
}

/// Layers of one multi-branch block, numbered by distance to the block output.
///
/// Register layers branch by branch, in the order the branches are
/// concatenated. `depth` is the number of layers between a layer and the
/// block output, so the concatenation itself sits at depth 0.
#[derive(Debug, Default)]
pub struct BlockLayout {
    depths: Vec<usize>,
}

impl BlockLayout {
    /// Register one layer and return its slot.
    pub fn add(&mut self, depth: usize) -> usize {
        self.depths.push(depth);
        self.depths.len() - 1
    }

    /// Register conv, batch-norm and activation, the activation at `depth`.
    pub fn add_conv(&mut self, depth: usize) -> [usize; 3] {
        [self.add(depth + 2), self.add(depth + 1), self.add(depth)]
    }

    /// Assign indices from `counter`; the result maps slot to layer index.
    pub fn number(self, counter: &mut LayerCounter) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.depths.len()).collect();
        order.sort_by_key(|&slot| (Reverse(self.depths[slot]), slot));
        let mut indices = vec![0; order.len()];
        for slot in order {
            indices[slot] = counter.next();
        }
        indices
    }
}

/// Sort entries by index and name them Keras-style (`conv2d`, `conv2d_1`, ...).
pub fn name_layers(mut entries: Vec<LayerEntry>, frozen_layers: usize) -> Vec<LayerInfo> {
    entries.sort_by_key(|e| e.index);
    let mut ordinals: HashMap<LayerKind, usize> = HashMap::new();

    entries
        .into_iter()
        .map(|entry| {
            let name = match entry.name {
                Some(name) => name,
                None => {
                    let ordinal = ordinals.entry(entry.kind).or_insert(0);
                    let name = match *ordinal {
                        0 => entry.kind.base_name().to_string(),
                        n => format!("{}_{n}", entry.kind.base_name()),
                    };
                    *ordinal += 1;
                    name
                }
            };
            LayerInfo {
                index: entry.index,
                name,
                kind: entry.kind,
                trainable: entry.index >= frozen_layers,
                params: entry.params,
                units: entry.units,
                activation: entry.activation,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let mut counter = LayerCounter::after_input();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.reserve(3), 2);
        assert_eq!(counter.next(), 5);
        assert_eq!(counter.count(), 6);
    }

    #[test]
    fn test_block_layout_deepest_first() {
        let mut counter = LayerCounter::after_input();
        let mut layout = BlockLayout::default();
        let short = layout.add_conv(1);
        let long_1 = layout.add_conv(4);
        let long_2 = layout.add_conv(1);
        let concat = layout.add(0);
        let indices = layout.number(&mut counter);

        let at = |slots: [usize; 3]| slots.map(|s| indices[s]);
        assert_eq!(at(long_1), [1, 2, 3]);
        // Depth ties go to the earlier branch.
        assert_eq!(at(short), [4, 6, 8]);
        assert_eq!(at(long_2), [5, 7, 9]);
        assert_eq!(indices[concat], 10);
        assert_eq!(counter.count(), 11);
    }

    #[test]
    fn test_name_layers() {
        let entries = vec![
            LayerEntry::new(2, LayerKind::Conv2d, 8),
            LayerEntry::new(0, LayerKind::Input, 3),
            LayerEntry::new(1, LayerKind::Conv2d, 8),
            LayerEntry::new(3, LayerKind::Concatenate, 16).with_name("mixed0"),
        ];
        let layers = name_layers(entries, 2);
        let names: Vec<_> = layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["input", "conv2d", "conv2d_1", "mixed0"]);
        assert!(!layers[1].trainable);
        assert!(layers[2].trainable);
    }
}
