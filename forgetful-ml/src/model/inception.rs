//! InceptionV3 feature extractor.
//!
//! Same topology as the Keras application without its top: a five-conv stem
//! followed by the `mixed0`..`mixed10` blocks. Widths are divided by
//! `channel_divisor`, which keeps the graph intact while shrinking it for
//! tests and quick experiments.

use burn::{
    module::Module,
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    },
    tensor::{Tensor, activation::relu, backend::Backend},
};

use super::layers::{BlockLayout, LayerCounter, LayerEntry, LayerKind};

/// Batch-norm epsilon of every backbone layer.
pub const BN_EPSILON: f64 = 1e-3;

/// Scale a reference width, never below one channel.
pub fn scaled(width: usize, divisor: usize) -> usize {
    (width / divisor.max(1)).max(1)
}

/// Three consecutive indices for a conv in a sequential section.
fn sequential(counter: &mut LayerCounter) -> [usize; 3] {
    let first = counter.reserve(3);
    [first, first + 1, first + 2]
}

/// Convolution without bias, batch-norm (eps 1e-3) and ReLU.
///
/// Counts as three layers: conv at `conv_index`, bn at `bn_index` and the
/// activation at `act_index`. A frozen batch-norm normalizes with its moving
/// statistics and leaves them untouched, in training as in inference.
#[derive(Module, Debug)]
pub struct BasicConv2d<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub conv_index: usize,
    pub bn_index: usize,
    pub act_index: usize,
    pub bn_frozen: bool,
    pub stride: usize,
    pub pad_h: usize,
    pub pad_w: usize,
}

impl<B: Backend> BasicConv2d<B> {
    /// `padding` of `None` means Keras "same" for stride one, `Some([0, 0])` is "valid".
    /// `indices` are the conv, batch-norm and activation layer indices.
    pub fn new(
        channels: [usize; 2],
        kernel: [usize; 2],
        stride: usize,
        padding: Option<[usize; 2]>,
        indices: [usize; 3],
        device: &B::Device,
    ) -> Self {
        let [pad_h, pad_w] = padding.unwrap_or([kernel[0] / 2, kernel[1] / 2]);
        let conv = Conv2dConfig::new(channels, kernel)
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(pad_h, pad_w))
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(channels[1])
            .with_epsilon(BN_EPSILON)
            .with_momentum(0.01)
            .init(device);

        let [conv_index, bn_index, act_index] = indices;
        Self {
            conv,
            bn,
            conv_index,
            bn_index,
            act_index,
            bn_frozen: false,
            stride,
            pad_h,
            pad_w,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = if self.bn_frozen {
            self.normalize_frozen(x)
        } else {
            self.bn.forward(x)
        };
        relu(x)
    }

    fn normalize_frozen(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = x.device();
        let shape = [1, x.dims()[1], 1, 1];
        let mean = self.bn.running_mean.value().to_device(&device).reshape(shape);
        let var = self.bn.running_var.value().to_device(&device).reshape(shape);
        let gamma = self.bn.gamma.val().reshape(shape);
        let beta = self.bn.beta.val().reshape(shape);
        x.sub(mean)
            .div(var.add_scalar(self.bn.epsilon).sqrt())
            .mul(gamma)
            .add(beta)
    }

    /// Kernel shape `[out, in, kh, kw]`.
    pub fn kernel_dims(&self) -> [usize; 4] {
        self.conv.weight.val().dims()
    }

    pub fn out_channels(&self) -> usize {
        self.kernel_dims()[0]
    }

    pub fn layers(&self, out: &mut Vec<LayerEntry>) {
        let [filters, inputs, kh, kw] = self.kernel_dims();
        out.push(
            LayerEntry::new(self.conv_index, LayerKind::Conv2d, filters)
                .with_params(filters * inputs * kh * kw),
        );
        out.push(
            LayerEntry::new(self.bn_index, LayerKind::BatchNorm, filters)
                .with_params(4 * filters),
        );
        out.push(
            LayerEntry::new(self.act_index, LayerKind::Activation, filters)
                .with_activation("relu"),
        );
    }

    /// Stop gradients for the parts indexed below `frozen_layers`.
    pub fn freeze(mut self, frozen_layers: usize) -> Self {
        if self.conv_index < frozen_layers {
            self.conv = self.conv.no_grad();
        }
        if self.bn_index < frozen_layers {
            self.bn = self.bn.no_grad();
            self.bn_frozen = true;
        }
        self
    }
}

/// Walk helpers over the convolutions of a block, in construction order.
macro_rules! conv_walk {
    ($block:ident { $($conv:ident),+ $(,)? }) => {
        impl<B: Backend> $block<B> {
            pub fn convs(&self) -> Vec<&BasicConv2d<B>> {
                vec![$(&self.$conv),+]
            }

            pub fn map_convs<F>(mut self, f: &mut F) -> Self
            where
                F: FnMut(BasicConv2d<B>) -> BasicConv2d<B>,
            {
                $(self.$conv = f(self.$conv);)+
                self
            }
        }
    };
}

fn avg_pool_same() -> AvgPool2d {
    AvgPool2dConfig::new([3, 3])
        .with_strides([1, 1])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_count_include_pad(false)
        .init()
}

fn max_pool_valid() -> MaxPool2d {
    MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init()
}

const VALID: Option<[usize; 2]> = Some([0, 0]);

/// `mixed0`..`mixed2`: 1x1, 5x5, double 3x3 and pooled branches.
#[derive(Module, Debug)]
pub struct InceptionA<B: Backend> {
    branch1x1: BasicConv2d<B>,
    branch5x5_1: BasicConv2d<B>,
    branch5x5_2: BasicConv2d<B>,
    branch3x3dbl_1: BasicConv2d<B>,
    branch3x3dbl_2: BasicConv2d<B>,
    branch3x3dbl_3: BasicConv2d<B>,
    pool: AvgPool2d,
    branch_pool: BasicConv2d<B>,
    mixed: usize,
    in_channels: usize,
    out_channels: usize,
    pool_index: usize,
    concat_index: usize,
}

conv_walk!(InceptionA {
    branch1x1,
    branch5x5_1,
    branch5x5_2,
    branch3x3dbl_1,
    branch3x3dbl_2,
    branch3x3dbl_3,
    branch_pool,
});

impl<B: Backend> InceptionA<B> {
    pub fn new(
        in_channels: usize,
        pool_features: usize,
        mixed: usize,
        divisor: usize,
        counter: &mut LayerCounter,
        device: &B::Device,
    ) -> Self {
        let mut layout = BlockLayout::default();
        let b1 = layout.add_conv(1);
        let b5 = [layout.add_conv(4), layout.add_conv(1)];
        let bd = [layout.add_conv(7), layout.add_conv(4), layout.add_conv(1)];
        let pool = layout.add(4);
        let bp = layout.add_conv(1);
        let concat = layout.add(0);
        let idx = layout.number(counter);
        let at = |slots: [usize; 3]| slots.map(|slot| idx[slot]);

        let s = |w| scaled(w, divisor);
        let conv = |c, k, slots| BasicConv2d::<B>::new(c, k, 1, None, at(slots), device);
        let branch1x1 = conv([in_channels, s(64)], [1, 1], b1);
        let branch5x5_1 = conv([in_channels, s(48)], [1, 1], b5[0]);
        let branch5x5_2 = conv([s(48), s(64)], [5, 5], b5[1]);
        let branch3x3dbl_1 = conv([in_channels, s(64)], [1, 1], bd[0]);
        let branch3x3dbl_2 = conv([s(64), s(96)], [3, 3], bd[1]);
        let branch3x3dbl_3 = conv([s(96), s(96)], [3, 3], bd[2]);
        let branch_pool = conv([in_channels, s(pool_features)], [1, 1], bp);
        let (pool_index, concat_index) = (idx[pool], idx[concat]);

        Self {
            branch1x1,
            branch5x5_1,
            branch5x5_2,
            branch3x3dbl_1,
            branch3x3dbl_2,
            branch3x3dbl_3,
            pool: avg_pool_same(),
            branch_pool,
            mixed,
            in_channels,
            out_channels: s(64) + s(64) + s(96) + s(pool_features),
            pool_index,
            concat_index,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b1 = self.branch1x1.forward(x.clone());
        let b5 = self.branch5x5_2.forward(self.branch5x5_1.forward(x.clone()));
        let b3 = self.branch3x3dbl_1.forward(x.clone());
        let b3 = self.branch3x3dbl_3.forward(self.branch3x3dbl_2.forward(b3));
        let bp = self.branch_pool.forward(self.pool.forward(x));
        Tensor::cat(vec![b1, b5, b3, bp], 1)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn layers(&self, out: &mut Vec<LayerEntry>) {
        self.convs().into_iter().for_each(|c| c.layers(out));
        out.push(LayerEntry::new(self.pool_index, LayerKind::AvgPool, self.in_channels));
        out.push(
            LayerEntry::new(self.concat_index, LayerKind::Concatenate, self.out_channels)
                .with_name(format!("mixed{}", self.mixed)),
        );
    }
}

/// `mixed3`: grid reduction from 35x35 to 17x17 in the full-size network.
#[derive(Module, Debug)]
pub struct InceptionB<B: Backend> {
    branch3x3: BasicConv2d<B>,
    branch3x3dbl_1: BasicConv2d<B>,
    branch3x3dbl_2: BasicConv2d<B>,
    branch3x3dbl_3: BasicConv2d<B>,
    pool: MaxPool2d,
    mixed: usize,
    in_channels: usize,
    out_channels: usize,
    pool_index: usize,
    concat_index: usize,
}

conv_walk!(InceptionB {
    branch3x3,
    branch3x3dbl_1,
    branch3x3dbl_2,
    branch3x3dbl_3,
});

impl<B: Backend> InceptionB<B> {
    pub fn new(
        in_channels: usize,
        mixed: usize,
        divisor: usize,
        counter: &mut LayerCounter,
        device: &B::Device,
    ) -> Self {
        let mut layout = BlockLayout::default();
        let b3 = layout.add_conv(1);
        let bd = [layout.add_conv(7), layout.add_conv(4), layout.add_conv(1)];
        let pool = layout.add(1);
        let concat = layout.add(0);
        let idx = layout.number(counter);
        let at = |slots: [usize; 3]| slots.map(|slot| idx[slot]);

        let s = |w| scaled(w, divisor);
        let branch3x3 = BasicConv2d::new([in_channels, s(384)], [3, 3], 2, VALID, at(b3), device);
        let branch3x3dbl_1 =
            BasicConv2d::new([in_channels, s(64)], [1, 1], 1, None, at(bd[0]), device);
        let branch3x3dbl_2 = BasicConv2d::new([s(64), s(96)], [3, 3], 1, None, at(bd[1]), device);
        let branch3x3dbl_3 = BasicConv2d::new([s(96), s(96)], [3, 3], 2, VALID, at(bd[2]), device);
        let (pool_index, concat_index) = (idx[pool], idx[concat]);

        Self {
            branch3x3,
            branch3x3dbl_1,
            branch3x3dbl_2,
            branch3x3dbl_3,
            pool: max_pool_valid(),
            mixed,
            in_channels,
            out_channels: s(384) + s(96) + in_channels,
            pool_index,
            concat_index,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b3 = self.branch3x3.forward(x.clone());
        let bd = self.branch3x3dbl_1.forward(x.clone());
        let bd = self.branch3x3dbl_3.forward(self.branch3x3dbl_2.forward(bd));
        let bp = self.pool.forward(x);
        Tensor::cat(vec![b3, bd, bp], 1)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn layers(&self, out: &mut Vec<LayerEntry>) {
        self.convs().into_iter().for_each(|c| c.layers(out));
        out.push(LayerEntry::new(self.pool_index, LayerKind::MaxPool, self.in_channels));
        out.push(
            LayerEntry::new(self.concat_index, LayerKind::Concatenate, self.out_channels)
                .with_name(format!("mixed{}", self.mixed)),
        );
    }
}

/// `mixed4`..`mixed7`: factorized 7x7 convolutions.
#[derive(Module, Debug)]
pub struct InceptionC<B: Backend> {
    branch1x1: BasicConv2d<B>,
    branch7x7_1: BasicConv2d<B>,
    branch7x7_2: BasicConv2d<B>,
    branch7x7_3: BasicConv2d<B>,
    branch7x7dbl_1: BasicConv2d<B>,
    branch7x7dbl_2: BasicConv2d<B>,
    branch7x7dbl_3: BasicConv2d<B>,
    branch7x7dbl_4: BasicConv2d<B>,
    branch7x7dbl_5: BasicConv2d<B>,
    pool: AvgPool2d,
    branch_pool: BasicConv2d<B>,
    mixed: usize,
    in_channels: usize,
    out_channels: usize,
    pool_index: usize,
    concat_index: usize,
}

conv_walk!(InceptionC {
    branch1x1,
    branch7x7_1,
    branch7x7_2,
    branch7x7_3,
    branch7x7dbl_1,
    branch7x7dbl_2,
    branch7x7dbl_3,
    branch7x7dbl_4,
    branch7x7dbl_5,
    branch_pool,
});

impl<B: Backend> InceptionC<B> {
    /// `channels_7x7` is the width inside the 7x7 towers (128, 160 or 192).
    pub fn new(
        in_channels: usize,
        channels_7x7: usize,
        mixed: usize,
        divisor: usize,
        counter: &mut LayerCounter,
        device: &B::Device,
    ) -> Self {
        let mut layout = BlockLayout::default();
        let b1 = layout.add_conv(1);
        let b7 = [layout.add_conv(7), layout.add_conv(4), layout.add_conv(1)];
        let bd = [13, 10, 7, 4, 1].map(|depth| layout.add_conv(depth));
        let pool = layout.add(4);
        let bp = layout.add_conv(1);
        let concat = layout.add(0);
        let idx = layout.number(counter);
        let at = |slots: [usize; 3]| slots.map(|slot| idx[slot]);

        let s = |w| scaled(w, divisor);
        let c7 = s(channels_7x7);
        let conv = |c, k, slots| BasicConv2d::<B>::new(c, k, 1, None, at(slots), device);
        let branch1x1 = conv([in_channels, s(192)], [1, 1], b1);

        let branch7x7_1 = conv([in_channels, c7], [1, 1], b7[0]);
        let branch7x7_2 = conv([c7, c7], [1, 7], b7[1]);
        let branch7x7_3 = conv([c7, s(192)], [7, 1], b7[2]);

        let branch7x7dbl_1 = conv([in_channels, c7], [1, 1], bd[0]);
        let branch7x7dbl_2 = conv([c7, c7], [7, 1], bd[1]);
        let branch7x7dbl_3 = conv([c7, c7], [1, 7], bd[2]);
        let branch7x7dbl_4 = conv([c7, c7], [7, 1], bd[3]);
        let branch7x7dbl_5 = conv([c7, s(192)], [1, 7], bd[4]);

        let branch_pool = conv([in_channels, s(192)], [1, 1], bp);
        let (pool_index, concat_index) = (idx[pool], idx[concat]);

        Self {
            branch1x1,
            branch7x7_1,
            branch7x7_2,
            branch7x7_3,
            branch7x7dbl_1,
            branch7x7dbl_2,
            branch7x7dbl_3,
            branch7x7dbl_4,
            branch7x7dbl_5,
            pool: avg_pool_same(),
            branch_pool,
            mixed,
            in_channels,
            out_channels: 4 * s(192),
            pool_index,
            concat_index,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b1 = self.branch1x1.forward(x.clone());

        let b7 = self.branch7x7_1.forward(x.clone());
        let b7 = self.branch7x7_3.forward(self.branch7x7_2.forward(b7));

        let bd = self.branch7x7dbl_1.forward(x.clone());
        let bd = self.branch7x7dbl_2.forward(bd);
        let bd = self.branch7x7dbl_3.forward(bd);
        let bd = self.branch7x7dbl_5.forward(self.branch7x7dbl_4.forward(bd));

        let bp = self.branch_pool.forward(self.pool.forward(x));
        Tensor::cat(vec![b1, b7, bd, bp], 1)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn layers(&self, out: &mut Vec<LayerEntry>) {
        self.convs().into_iter().for_each(|c| c.layers(out));
        out.push(LayerEntry::new(self.pool_index, LayerKind::AvgPool, self.in_channels));
        out.push(
            LayerEntry::new(self.concat_index, LayerKind::Concatenate, self.out_channels)
                .with_name(format!("mixed{}", self.mixed)),
        );
    }
}

/// `mixed8`: grid reduction from 17x17 to 8x8 in the full-size network.
#[derive(Module, Debug)]
pub struct InceptionD<B: Backend> {
    branch3x3_1: BasicConv2d<B>,
    branch3x3_2: BasicConv2d<B>,
    branch7x7x3_1: BasicConv2d<B>,
    branch7x7x3_2: BasicConv2d<B>,
    branch7x7x3_3: BasicConv2d<B>,
    branch7x7x3_4: BasicConv2d<B>,
    pool: MaxPool2d,
    mixed: usize,
    in_channels: usize,
    out_channels: usize,
    pool_index: usize,
    concat_index: usize,
}

conv_walk!(InceptionD {
    branch3x3_1,
    branch3x3_2,
    branch7x7x3_1,
    branch7x7x3_2,
    branch7x7x3_3,
    branch7x7x3_4,
});

impl<B: Backend> InceptionD<B> {
    pub fn new(
        in_channels: usize,
        mixed: usize,
        divisor: usize,
        counter: &mut LayerCounter,
        device: &B::Device,
    ) -> Self {
        let mut layout = BlockLayout::default();
        let b3 = [layout.add_conv(4), layout.add_conv(1)];
        let b7 = [10, 7, 4, 1].map(|depth| layout.add_conv(depth));
        let pool = layout.add(1);
        let concat = layout.add(0);
        let idx = layout.number(counter);
        let at = |slots: [usize; 3]| slots.map(|slot| idx[slot]);

        let s = |w| scaled(w, divisor);
        let conv = |c, k, slots| BasicConv2d::<B>::new(c, k, 1, None, at(slots), device);
        let reduce = |c, slots| BasicConv2d::<B>::new(c, [3, 3], 2, VALID, at(slots), device);
        let branch3x3_1 = conv([in_channels, s(192)], [1, 1], b3[0]);
        let branch3x3_2 = reduce([s(192), s(320)], b3[1]);

        let branch7x7x3_1 = conv([in_channels, s(192)], [1, 1], b7[0]);
        let branch7x7x3_2 = conv([s(192), s(192)], [1, 7], b7[1]);
        let branch7x7x3_3 = conv([s(192), s(192)], [7, 1], b7[2]);
        let branch7x7x3_4 = reduce([s(192), s(192)], b7[3]);

        let (pool_index, concat_index) = (idx[pool], idx[concat]);

        Self {
            branch3x3_1,
            branch3x3_2,
            branch7x7x3_1,
            branch7x7x3_2,
            branch7x7x3_3,
            branch7x7x3_4,
            pool: max_pool_valid(),
            mixed,
            in_channels,
            out_channels: s(320) + s(192) + in_channels,
            pool_index,
            concat_index,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b3 = self.branch3x3_1.forward(x.clone());
        let b3 = self.branch3x3_2.forward(b3);

        let b7 = self.branch7x7x3_1.forward(x.clone());
        let b7 = self.branch7x7x3_2.forward(b7);
        let b7 = self.branch7x7x3_4.forward(self.branch7x7x3_3.forward(b7));

        let bp = self.pool.forward(x);
        Tensor::cat(vec![b3, b7, bp], 1)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn layers(&self, out: &mut Vec<LayerEntry>) {
        self.convs().into_iter().for_each(|c| c.layers(out));
        out.push(LayerEntry::new(self.pool_index, LayerKind::MaxPool, self.in_channels));
        out.push(
            LayerEntry::new(self.concat_index, LayerKind::Concatenate, self.out_channels)
                .with_name(format!("mixed{}", self.mixed)),
        );
    }
}

/// `mixed9`, `mixed10`: expanded filter banks with split 1x3 / 3x1 outputs.
#[derive(Module, Debug)]
pub struct InceptionE<B: Backend> {
    branch1x1: BasicConv2d<B>,
    branch3x3_1: BasicConv2d<B>,
    branch3x3_2a: BasicConv2d<B>,
    branch3x3_2b: BasicConv2d<B>,
    branch3x3dbl_1: BasicConv2d<B>,
    branch3x3dbl_2: BasicConv2d<B>,
    branch3x3dbl_3a: BasicConv2d<B>,
    branch3x3dbl_3b: BasicConv2d<B>,
    pool: AvgPool2d,
    branch_pool: BasicConv2d<B>,
    mixed: usize,
    in_channels: usize,
    out_channels: usize,
    split_concat_index: usize,
    dbl_concat_index: usize,
    pool_index: usize,
    concat_index: usize,
}

conv_walk!(InceptionE {
    branch1x1,
    branch3x3_1,
    branch3x3_2a,
    branch3x3_2b,
    branch3x3dbl_1,
    branch3x3dbl_2,
    branch3x3dbl_3a,
    branch3x3dbl_3b,
    branch_pool,
});

impl<B: Backend> InceptionE<B> {
    pub fn new(
        in_channels: usize,
        mixed: usize,
        divisor: usize,
        counter: &mut LayerCounter,
        device: &B::Device,
    ) -> Self {
        let mut layout = BlockLayout::default();
        let b1 = layout.add_conv(1);
        let b3 = [layout.add_conv(5), layout.add_conv(2), layout.add_conv(2)];
        let split_concat = layout.add(1);
        let bd = [8, 5, 2, 2].map(|depth| layout.add_conv(depth));
        let dbl_concat = layout.add(1);
        let pool = layout.add(4);
        let bp = layout.add_conv(1);
        let concat = layout.add(0);
        let idx = layout.number(counter);
        let at = |slots: [usize; 3]| slots.map(|slot| idx[slot]);

        let s = |w| scaled(w, divisor);
        let conv = |c, k, slots| BasicConv2d::<B>::new(c, k, 1, None, at(slots), device);
        let branch1x1 = conv([in_channels, s(320)], [1, 1], b1);

        let branch3x3_1 = conv([in_channels, s(384)], [1, 1], b3[0]);
        let branch3x3_2a = conv([s(384), s(384)], [1, 3], b3[1]);
        let branch3x3_2b = conv([s(384), s(384)], [3, 1], b3[2]);

        let branch3x3dbl_1 = conv([in_channels, s(448)], [1, 1], bd[0]);
        let branch3x3dbl_2 = conv([s(448), s(384)], [3, 3], bd[1]);
        let branch3x3dbl_3a = conv([s(384), s(384)], [1, 3], bd[2]);
        let branch3x3dbl_3b = conv([s(384), s(384)], [3, 1], bd[3]);

        let branch_pool = conv([in_channels, s(192)], [1, 1], bp);
        let (split_concat_index, dbl_concat_index) = (idx[split_concat], idx[dbl_concat]);
        let (pool_index, concat_index) = (idx[pool], idx[concat]);

        Self {
            branch1x1,
            branch3x3_1,
            branch3x3_2a,
            branch3x3_2b,
            branch3x3dbl_1,
            branch3x3dbl_2,
            branch3x3dbl_3a,
            branch3x3dbl_3b,
            pool: avg_pool_same(),
            branch_pool,
            mixed,
            in_channels,
            out_channels: s(320) + 4 * s(384) + s(192),
            split_concat_index,
            dbl_concat_index,
            pool_index,
            concat_index,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let b1 = self.branch1x1.forward(x.clone());

        let b3 = self.branch3x3_1.forward(x.clone());
        let b3 = Tensor::cat(
            vec![
                self.branch3x3_2a.forward(b3.clone()),
                self.branch3x3_2b.forward(b3),
            ],
            1,
        );

        let bd = self.branch3x3dbl_1.forward(x.clone());
        let bd = self.branch3x3dbl_2.forward(bd);
        let bd = Tensor::cat(
            vec![
                self.branch3x3dbl_3a.forward(bd.clone()),
                self.branch3x3dbl_3b.forward(bd),
            ],
            1,
        );

        let bp = self.branch_pool.forward(self.pool.forward(x));
        Tensor::cat(vec![b1, b3, bd, bp], 1)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn layers(&self, out: &mut Vec<LayerEntry>) {
        self.convs().into_iter().for_each(|c| c.layers(out));
        let split = self.branch3x3_2a.out_channels() + self.branch3x3_2b.out_channels();
        out.push(
            LayerEntry::new(self.split_concat_index, LayerKind::Concatenate, split)
                .with_name(format!("mixed{}_0", self.mixed)),
        );
        let dbl = self.branch3x3dbl_3a.out_channels() + self.branch3x3dbl_3b.out_channels();
        out.push(
            LayerEntry::new(self.dbl_concat_index, LayerKind::Concatenate, dbl)
                .with_name(format!("mixed{}_1", self.mixed)),
        );
        out.push(LayerEntry::new(self.pool_index, LayerKind::AvgPool, self.in_channels));
        out.push(
            LayerEntry::new(self.concat_index, LayerKind::Concatenate, self.out_channels)
                .with_name(format!("mixed{}", self.mixed)),
        );
    }
}

/// The InceptionV3 backbone without classification top.
#[derive(Module, Debug)]
pub struct InceptionV3<B: Backend> {
    conv_1a: BasicConv2d<B>,
    conv_2a: BasicConv2d<B>,
    conv_2b: BasicConv2d<B>,
    pool_1: MaxPool2d,
    conv_3b: BasicConv2d<B>,
    conv_4a: BasicConv2d<B>,
    pool_2: MaxPool2d,
    mixed0: InceptionA<B>,
    mixed1: InceptionA<B>,
    mixed2: InceptionA<B>,
    mixed3: InceptionB<B>,
    mixed4: InceptionC<B>,
    mixed5: InceptionC<B>,
    mixed6: InceptionC<B>,
    mixed7: InceptionC<B>,
    mixed8: InceptionD<B>,
    mixed9: InceptionE<B>,
    mixed10: InceptionE<B>,
    pool_1_index: usize,
    pool_2_index: usize,
}

impl<B: Backend> InceptionV3<B> {
    /// Build the backbone; `counter` must already have consumed the input index.
    pub fn new(divisor: usize, counter: &mut LayerCounter, device: &B::Device) -> Self {
        let s = |w| scaled(w, divisor);
        let conv_1a = BasicConv2d::new([3, s(32)], [3, 3], 2, VALID, sequential(counter), device);
        let conv_2a =
            BasicConv2d::new([s(32), s(32)], [3, 3], 1, VALID, sequential(counter), device);
        let conv_2b =
            BasicConv2d::new([s(32), s(64)], [3, 3], 1, None, sequential(counter), device);
        let pool_1_index = counter.next();
        let conv_3b =
            BasicConv2d::new([s(64), s(80)], [1, 1], 1, VALID, sequential(counter), device);
        let conv_4a =
            BasicConv2d::new([s(80), s(192)], [3, 3], 1, VALID, sequential(counter), device);
        let pool_2_index = counter.next();

        let mixed0 = InceptionA::new(s(192), 32, 0, divisor, counter, device);
        let mixed1 = InceptionA::new(mixed0.out_channels(), 64, 1, divisor, counter, device);
        let mixed2 = InceptionA::new(mixed1.out_channels(), 64, 2, divisor, counter, device);
        let mixed3 = InceptionB::new(mixed2.out_channels(), 3, divisor, counter, device);
        let mixed4 = InceptionC::new(mixed3.out_channels(), 128, 4, divisor, counter, device);
        let mixed5 = InceptionC::new(mixed4.out_channels(), 160, 5, divisor, counter, device);
        let mixed6 = InceptionC::new(mixed5.out_channels(), 160, 6, divisor, counter, device);
        let mixed7 = InceptionC::new(mixed6.out_channels(), 192, 7, divisor, counter, device);
        let mixed8 = InceptionD::new(mixed7.out_channels(), 8, divisor, counter, device);
        let mixed9 = InceptionE::new(mixed8.out_channels(), 9, divisor, counter, device);
        let mixed10 = InceptionE::new(mixed9.out_channels(), 10, divisor, counter, device);

        Self {
            conv_1a,
            conv_2a,
            conv_2b,
            pool_1: max_pool_valid(),
            conv_3b,
            conv_4a,
            pool_2: max_pool_valid(),
            mixed0,
            mixed1,
            mixed2,
            mixed3,
            mixed4,
            mixed5,
            mixed6,
            mixed7,
            mixed8,
            mixed9,
            mixed10,
            pool_1_index,
            pool_2_index,
        }
    }

    /// Feature maps `[N, C, h, w]` for images `[N, 3, H, W]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv_1a.forward(x);
        let x = self.conv_2a.forward(x);
        let x = self.pool_1.forward(self.conv_2b.forward(x));
        let x = self.conv_3b.forward(x);
        let x = self.pool_2.forward(self.conv_4a.forward(x));

        let x = self.mixed0.forward(x);
        let x = self.mixed1.forward(x);
        let x = self.mixed2.forward(x);
        let x = self.mixed3.forward(x);
        let x = self.mixed4.forward(x);
        let x = self.mixed5.forward(x);
        let x = self.mixed6.forward(x);
        let x = self.mixed7.forward(x);
        let x = self.mixed8.forward(x);
        let x = self.mixed9.forward(x);
        self.mixed10.forward(x)
    }

    pub fn out_channels(&self) -> usize {
        self.mixed10.out_channels()
    }

    /// Every convolution, stem first.
    pub fn convs(&self) -> Vec<&BasicConv2d<B>> {
        let mut convs = vec![
            &self.conv_1a,
            &self.conv_2a,
            &self.conv_2b,
            &self.conv_3b,
            &self.conv_4a,
        ];
        convs.extend(self.mixed0.convs());
        convs.extend(self.mixed1.convs());
        convs.extend(self.mixed2.convs());
        convs.extend(self.mixed3.convs());
        convs.extend(self.mixed4.convs());
        convs.extend(self.mixed5.convs());
        convs.extend(self.mixed6.convs());
        convs.extend(self.mixed7.convs());
        convs.extend(self.mixed8.convs());
        convs.extend(self.mixed9.convs());
        convs.extend(self.mixed10.convs());
        convs
    }

    pub fn map_convs<F>(mut self, f: &mut F) -> Self
    where
        F: FnMut(BasicConv2d<B>) -> BasicConv2d<B>,
    {
        self.conv_1a = f(self.conv_1a);
        self.conv_2a = f(self.conv_2a);
        self.conv_2b = f(self.conv_2b);
        self.conv_3b = f(self.conv_3b);
        self.conv_4a = f(self.conv_4a);
        self.mixed0 = self.mixed0.map_convs(f);
        self.mixed1 = self.mixed1.map_convs(f);
        self.mixed2 = self.mixed2.map_convs(f);
        self.mixed3 = self.mixed3.map_convs(f);
        self.mixed4 = self.mixed4.map_convs(f);
        self.mixed5 = self.mixed5.map_convs(f);
        self.mixed6 = self.mixed6.map_convs(f);
        self.mixed7 = self.mixed7.map_convs(f);
        self.mixed8 = self.mixed8.map_convs(f);
        self.mixed9 = self.mixed9.map_convs(f);
        self.mixed10 = self.mixed10.map_convs(f);
        self
    }

    pub fn layers(&self, out: &mut Vec<LayerEntry>) {
        for conv in [&self.conv_1a, &self.conv_2a, &self.conv_2b] {
            conv.layers(out);
        }
        let pool_1 = self.conv_2b.out_channels();
        out.push(LayerEntry::new(self.pool_1_index, LayerKind::MaxPool, pool_1));
        self.conv_3b.layers(out);
        self.conv_4a.layers(out);
        let pool_2 = self.conv_4a.out_channels();
        out.push(LayerEntry::new(self.pool_2_index, LayerKind::MaxPool, pool_2));

        self.mixed0.layers(out);
        self.mixed1.layers(out);
        self.mixed2.layers(out);
        self.mixed3.layers(out);
        self.mixed4.layers(out);
        self.mixed5.layers(out);
        self.mixed6.layers(out);
        self.mixed7.layers(out);
        self.mixed8.layers(out);
        self.mixed9.layers(out);
        self.mixed10.layers(out);
    }

    pub fn freeze(self, frozen_layers: usize) -> Self {
        self.map_convs(&mut |conv| conv.freeze(frozen_layers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn backbone(divisor: usize) -> (InceptionV3<TestBackend>, LayerCounter) {
        let mut counter = LayerCounter::after_input();
        let model = InceptionV3::new(divisor, &mut counter, &Default::default());
        (model, counter)
    }

    #[test]
    fn test_full_width_channels() {
        assert_eq!(scaled(384, 1), 384);
        assert_eq!(scaled(32, 64), 1);
        let (model, _) = backbone(1);
        assert_eq!(model.mixed0.out_channels(), 256);
        assert_eq!(model.mixed2.out_channels(), 288);
        assert_eq!(model.mixed3.out_channels(), 768);
        assert_eq!(model.mixed7.out_channels(), 768);
        assert_eq!(model.mixed8.out_channels(), 1280);
        assert_eq!(model.out_channels(), 2048);
        assert_eq!(model.convs().len(), 94);
    }

    #[test]
    fn test_layer_indices_are_contiguous() {
        let (model, counter) = backbone(16);
        let mut entries = Vec::new();
        model.layers(&mut entries);
        let mut indices: Vec<usize> = entries.iter().map(|e| e.index).collect();
        indices.sort_unstable();
        let expected: Vec<usize> = (1..counter.count()).collect();
        assert_eq!(indices, expected);
        // Stem is 18 layers, mixed0 adds 23 more.
        assert_eq!(model.mixed0.concat_index, 40);
    }

    #[test]
    fn test_block_layers_deepest_first() {
        let (model, _) = backbone(16);
        let mixed1 = &model.mixed1;
        assert_eq!(mixed1.branch3x3dbl_1.conv_index, 41);
        assert_eq!(mixed1.branch5x5_1.conv_index, 44);
        assert_eq!(mixed1.pool_index, 50);
        assert_eq!(mixed1.branch1x1.conv_index, 51);
        assert_eq!(mixed1.branch5x5_2.conv_index, 52);
        assert_eq!(mixed1.branch1x1.bn_index, 55);
        assert_eq!(mixed1.concat_index, 63);
        assert_eq!(model.mixed2.concat_index, 86);
        assert_eq!(model.mixed3.concat_index, 100);
    }

    #[test]
    fn test_frozen_batch_norm_keeps_statistics() {
        type Train = Autodiff<TestBackend>;
        let device = Default::default();
        let input =
            Tensor::<Train, 4>::random([2, 2, 5, 5], Distribution::Normal(3.0, 1.0), &device);
        let conv = || BasicConv2d::<Train>::new([2, 4], [3, 3], 1, None, [1, 2, 3], &device);

        let frozen = conv().freeze(10);
        assert!(frozen.bn_frozen);
        frozen.forward(input.clone());
        let mean: Vec<f32> = frozen.bn.running_mean.value().into_data().to_vec().unwrap();
        assert_eq!(mean, vec![0.0; 4]);

        let trainable = conv().freeze(2);
        assert!(!trainable.bn_frozen);
        trainable.forward(input);
        let mean: Vec<f32> = trainable.bn.running_mean.value().into_data().to_vec().unwrap();
        assert!(mean.iter().any(|m| *m != 0.0));
    }

    #[test]
    fn test_frozen_batch_norm_matches_inference() {
        let device = Default::default();
        let conv = BasicConv2d::<TestBackend>::new([2, 4], [1, 1], 1, None, [1, 2, 3], &device);
        let input = Tensor::<TestBackend, 4>::random([1, 2, 3, 3], Distribution::Default, &device);
        let expected: Vec<f32> = conv.forward(input.clone()).into_data().to_vec().unwrap();
        let actual: Vec<f32> = conv.freeze(3).forward(input).into_data().to_vec().unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_minimum_input() {
        let (model, _) = backbone(16);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 75, 75], &Default::default());
        let features = model.forward(x);
        assert_eq!(features.dims(), [1, model.out_channels(), 1, 1]);
    }
}
