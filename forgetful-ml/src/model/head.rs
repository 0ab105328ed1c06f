//! Classification head on top of the backbone features.

use burn::{
    module::Module,
    nn::{
        Dropout, DropoutConfig, Linear, LinearConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    },
    tensor::{Tensor, activation::relu, backend::Backend},
};

use super::layers::{LayerCounter, LayerEntry, LayerKind};

/// Global average pooling, two ReLU dense layers with dropout, class logits.
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    pub dense1: Linear<B>,
    dropout: Dropout,
    pub dense2: Linear<B>,
    pub output: Linear<B>,
    pool_index: usize,
    pub dense1_index: usize,
    dropout_index: usize,
    pub dense2_index: usize,
    pub output_index: usize,
}

impl<B: Backend> ClassificationHead<B> {
    pub fn new(
        in_features: usize,
        dense1_units: usize,
        dense2_units: usize,
        dropout: f64,
        num_classes: usize,
        counter: &mut LayerCounter,
        device: &B::Device,
    ) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            pool_index: counter.next(),
            dense1: LinearConfig::new(in_features, dense1_units).init(device),
            dense1_index: counter.next(),
            dropout: DropoutConfig::new(dropout).init(),
            dropout_index: counter.next(),
            dense2: LinearConfig::new(dense1_units, dense2_units).init(device),
            dense2_index: counter.next(),
            output: LinearConfig::new(dense2_units, num_classes).init(device),
            output_index: counter.next(),
        }
    }

    /// Class logits `[N, num_classes]`; softmax is applied by the caller.
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, _, _] = features.dims();
        let x = self.pool.forward(features).reshape([batch, channels]);
        let x = relu(self.dense1.forward(x));
        let x = self.dropout.forward(x);
        let x = relu(self.dense2.forward(x));
        self.output.forward(x)
    }

    /// Dense layers with their layer indices.
    pub fn denses(&self) -> [(usize, &Linear<B>); 3] {
        [
            (self.dense1_index, &self.dense1),
            (self.dense2_index, &self.dense2),
            (self.output_index, &self.output),
        ]
    }

    pub fn map_denses<F>(mut self, f: &mut F) -> Self
    where
        F: FnMut(usize, Linear<B>) -> Linear<B>,
    {
        self.dense1 = f(self.dense1_index, self.dense1);
        self.dense2 = f(self.dense2_index, self.dense2);
        self.output = f(self.output_index, self.output);
        self
    }

    pub fn layers(&self, out: &mut Vec<LayerEntry>) {
        let in_features = self.dense1.weight.val().dims()[0];
        out.push(LayerEntry::new(self.pool_index, LayerKind::GlobalAvgPool, in_features));
        for (index, dense) in self.denses() {
            let [inputs, units] = dense.weight.val().dims();
            let activation = if index == self.output_index { "softmax" } else { "relu" };
            out.push(
                LayerEntry::new(index, LayerKind::Dense, units)
                    .with_params(inputs * units + units)
                    .with_activation(activation),
            );
        }
        let dense1_units = self.dense1.weight.val().dims()[1];
        out.push(LayerEntry::new(self.dropout_index, LayerKind::Dropout, dense1_units));
    }

    pub fn freeze(self, frozen_layers: usize) -> Self {
        self.map_denses(&mut |index, dense| {
            if index < frozen_layers {
                dense.no_grad()
            } else {
                dense
            }
        })
    }
}
