use candle_core::{Device, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig};

use crate::{
    cfg::{DarknetConfig, Section},
    decode::ROW_GEOMETRY_COLS,
    error::DetectError,
    weights::WeightsReader,
};

const BATCH_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Activation {
    Linear,
    Leaky,
    Mish,
    Logistic,
    Relu,
    Swish,
}

impl Activation {
    fn parse(name: &str) -> Result<Self, DetectError> {
        Ok(match name {
            "linear" => Activation::Linear,
            "leaky" => Activation::Leaky,
            "mish" => Activation::Mish,
            "logistic" => Activation::Logistic,
            "relu" => Activation::Relu,
            "swish" => Activation::Swish,
            _ => {
                return Err(DetectError::InvalidConfig(format!(
                    "unsupported activation: {name}"
                )));
            }
        })
    }

    fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Linear => Ok(xs.clone()),
            Activation::Leaky => xs.maximum(&(xs * 0.1)?),
            // x * tanh(softplus(x))
            Activation::Mish => xs.mul(&(xs.exp()? + 1.0)?.log()?.tanh()?),
            Activation::Logistic => candle_nn::ops::sigmoid(xs),
            Activation::Relu => xs.relu(),
            Activation::Swish => xs.silu(),
        }
    }
}

/// A `[yolo]` detection head.
#[derive(Debug, Clone)]
pub(crate) struct YoloHead {
    /// Anchors used by this head, in network input pixels.
    anchors: Vec<(f32, f32)>,
    classes: usize,
    scale_x_y: f32,
}

fn sigmoid(v: f32) -> f32 {
    1. / (1. + (-v).exp())
}

impl YoloHead {
    fn from_section(section: &Section) -> Result<Self, DetectError> {
        let classes = section.get::<usize>("classes")?;
        let all: Vec<f32> = section.get_list("anchors")?;
        if all.len() % 2 != 0 {
            return Err(DetectError::InvalidConfig(format!(
                "[yolo] at line {} has an odd number of anchor values",
                section.line
            )));
        }
        let all: Vec<(f32, f32)> = all.chunks_exact(2).map(|c| (c[0], c[1])).collect();
        let mut mask: Vec<usize> = section.get_list("mask")?;
        if mask.is_empty() {
            mask = (0..section.get_or("num", all.len())?).collect();
        }
        let anchors = mask
            .iter()
            .map(|&m| {
                all.get(m).copied().ok_or_else(|| {
                    DetectError::InvalidConfig(format!(
                        "[yolo] at line {}: mask index {m} out of {} anchors",
                        section.line,
                        all.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            anchors,
            classes,
            scale_x_y: section.get_or("scale_x_y", 1.0)?,
        })
    }

    fn channels(&self) -> usize {
        self.anchors.len() * (ROW_GEOMETRY_COLS + self.classes)
    }

    /// Decode the raw head activations into `[rows, 5 + classes]`.
    ///
    /// Rows are ordered by cell row, cell column, then anchor. Geometry is
    /// normalized: centers by the grid size, sizes by the network input size.
    pub(crate) fn decode(
        &self,
        xs: &Tensor,
        input_width: usize,
        input_height: usize,
    ) -> Result<Tensor, DetectError> {
        let (batch, channels, grid_h, grid_w) = xs.dims4()?;
        if batch != 1 || channels != self.channels() {
            return Err(DetectError::InvalidTensorShape(format!(
                "yolo head expects [1, {}, h, w], got {:?}",
                self.channels(),
                xs.dims()
            )));
        }
        let num_anchors = self.anchors.len();
        let attrs = ROW_GEOMETRY_COLS + self.classes;
        let rows = xs
            .reshape((num_anchors, attrs, grid_h, grid_w))?
            .permute((2, 3, 0, 1))?
            .contiguous()?
            .reshape((grid_h * grid_w * num_anchors, attrs))?
            .to_vec2::<f32>()?;

        let s = self.scale_x_y;
        let mut data = Vec::with_capacity(rows.len() * attrs);
        for (index, row) in rows.iter().enumerate() {
            let anchor = index % num_anchors;
            let col = (index / num_anchors) % grid_w;
            let cell_row = index / (num_anchors * grid_w);
            let (anchor_w, anchor_h) = self.anchors[anchor];

            let objectness = sigmoid(row[4]);
            data.push((col as f32 + sigmoid(row[0]) * s - (s - 1.) / 2.) / grid_w as f32);
            data.push((cell_row as f32 + sigmoid(row[1]) * s - (s - 1.) / 2.) / grid_h as f32);
            data.push(row[2].exp() * anchor_w / input_width as f32);
            data.push(row[3].exp() * anchor_h / input_height as f32);
            data.push(objectness);
            data.extend(row[ROW_GEOMETRY_COLS..].iter().map(|&c| objectness * sigmoid(c)));
        }

        Ok(Tensor::from_vec(data, (rows.len(), attrs), &Device::Cpu)?)
    }
}

enum Layer {
    Convolutional {
        conv: Conv2d,
        bn: Option<BatchNorm>,
        activation: Activation,
    },
    MaxPool {
        size: usize,
        stride: usize,
        padding: usize,
    },
    Upsample {
        stride: usize,
    },
    Route {
        layers: Vec<usize>,
        groups: usize,
        group_id: usize,
    },
    Shortcut {
        from: usize,
        activation: Activation,
    },
    Yolo(YoloHead),
}

/// Darknet pooling: `padding` split as `padding / 2` before and the rest
/// after, padded cells never win the max.
fn max_pool(
    xs: &Tensor,
    size: usize,
    stride: usize,
    padding: usize,
) -> candle_core::Result<Tensor> {
    let before = padding / 2;
    let after = padding - before;
    let xs = if padding > 0 {
        xs.pad_with_same(2, before, after)?
            .pad_with_same(3, before, after)?
    } else {
        xs.clone()
    };
    xs.max_pool2d_with_stride(size, stride)
}

/// Read a size-like option that must be at least 1.
fn positive(section: &Section, key: &str, default: usize) -> Result<usize, DetectError> {
    let value: usize = section.get_or(key, default)?;
    if value == 0 {
        return Err(DetectError::InvalidConfig(format!(
            "[{}] at line {}: `{key}` must be positive",
            section.kind, section.line
        )));
    }
    Ok(value)
}

/// Resolve a relative (negative) or absolute layer reference.
fn resolve_index(current: usize, offset: i64, line: usize) -> Result<usize, DetectError> {
    let index = if offset < 0 {
        current as i64 + offset
    } else {
        offset
    };
    if index < 0 || index >= current as i64 {
        return Err(DetectError::InvalidConfig(format!(
            "layer reference {offset} at line {line} is out of range"
        )));
    }
    Ok(index as usize)
}

/// A Darknet network built on candle.
pub struct Darknet {
    layers: Vec<Layer>,
    channels: usize,
}

impl Darknet {
    /// Build the network from a parsed config, consuming the weights in order.
    pub fn new(
        config: &DarknetConfig,
        weights: &mut WeightsReader,
        device: &Device,
    ) -> Result<Self, DetectError> {
        let channels = config.net.get_or("channels", 3)?;
        let mut layers = Vec::with_capacity(config.layers.len());
        // output channels of every built layer
        let mut outputs: Vec<usize> = Vec::with_capacity(config.layers.len());

        for (index, section) in config.layers.iter().enumerate() {
            let prev = outputs.last().copied().unwrap_or(channels);
            let (layer, out_channels) = match section.kind.as_str() {
                "convolutional" => {
                    let filters: usize = section.get("filters")?;
                    if filters == 0 {
                        return Err(DetectError::InvalidConfig(format!(
                            "[convolutional] at line {}: `filters` must be positive",
                            section.line
                        )));
                    }
                    let size = positive(section, "size", 1)?;
                    let stride = positive(section, "stride", 1)?;
                    let groups: usize = section.get_or("groups", 1)?;
                    let padding = if section.get_or::<usize>("pad", 0)? != 0 {
                        size / 2
                    } else {
                        section.get_or("padding", 0)?
                    };
                    let batch_normalize = section.get_or::<usize>("batch_normalize", 0)? != 0;
                    let activation =
                        Activation::parse(section.raw("activation").unwrap_or("logistic"))?;
                    if groups == 0 || prev % groups != 0 {
                        return Err(DetectError::InvalidConfig(format!(
                            "[convolutional] at line {}: {prev} channels not divisible by {groups}",
                            section.line
                        )));
                    }

                    let biases = weights.take(filters, device)?;
                    let bn = if batch_normalize {
                        let scales = weights.take(filters, device)?;
                        let mean = weights.take(filters, device)?;
                        let var = weights.take(filters, device)?;
                        let bn = BatchNorm::new(
                            filters,
                            mean,
                            var,
                            scales,
                            biases.clone(),
                            BATCH_NORM_EPS,
                        )?;
                        Some(bn)
                    } else {
                        None
                    };
                    let kernel = weights.take((filters, prev / groups, size, size), device)?;
                    let conv_config = Conv2dConfig {
                        padding,
                        stride,
                        groups,
                        ..Default::default()
                    };
                    let conv_bias = if bn.is_some() { None } else { Some(biases) };
                    let conv = Conv2d::new(kernel, conv_bias, conv_config);
                    (
                        Layer::Convolutional {
                            conv,
                            bn,
                            activation,
                        },
                        filters,
                    )
                }
                "maxpool" => {
                    let size = positive(section, "size", 1)?;
                    let stride = positive(section, "stride", 1)?;
                    let padding: usize = section.get_or("padding", size.saturating_sub(1))?;
                    (
                        Layer::MaxPool {
                            size,
                            stride,
                            padding,
                        },
                        prev,
                    )
                }
                "upsample" => (
                    Layer::Upsample {
                        stride: positive(section, "stride", 2)?,
                    },
                    prev,
                ),
                "route" => {
                    let refs: Vec<i64> = section.get_list("layers")?;
                    if refs.is_empty() {
                        return Err(DetectError::InvalidConfig(format!(
                            "[route] at line {} has no layers",
                            section.line
                        )));
                    }
                    let route = refs
                        .iter()
                        .map(|&r| resolve_index(index, r, section.line))
                        .collect::<Result<Vec<_>, _>>()?;
                    let groups: usize = section.get_or("groups", 1)?;
                    let group_id: usize = section.get_or("group_id", 0)?;
                    if groups == 0 || group_id >= groups {
                        return Err(DetectError::InvalidConfig(format!(
                            "[route] at line {}: group_id {group_id} out of {groups} groups",
                            section.line
                        )));
                    }
                    let total: usize = route.iter().map(|&r| outputs[r]).sum();
                    (
                        Layer::Route {
                            layers: route,
                            groups,
                            group_id,
                        },
                        total / groups,
                    )
                }
                "shortcut" => {
                    let from = resolve_index(index, section.get("from")?, section.line)?;
                    let activation =
                        Activation::parse(section.raw("activation").unwrap_or("linear"))?;
                    (Layer::Shortcut { from, activation }, prev)
                }
                "yolo" => {
                    let head = YoloHead::from_section(section)?;
                    if head.channels() != prev {
                        return Err(DetectError::InvalidConfig(format!(
                            "[yolo] at line {} expects {} input channels, got {prev}",
                            section.line,
                            head.channels()
                        )));
                    }
                    (Layer::Yolo(head), prev)
                }
                other => {
                    return Err(DetectError::InvalidConfig(format!(
                        "unsupported layer [{other}] at line {}",
                        section.line
                    )));
                }
            };
            layers.push(layer);
            outputs.push(out_channels);
        }

        if weights.remaining() > 0 {
            tracing::warn!(
                remaining = weights.remaining(),
                "weights file has more values than the config uses"
            );
        }

        Ok(Self { layers, channels })
    }

    /// Number of input channels expected by the network.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of `[yolo]` heads, i.e. of tensors returned by `forward`.
    pub fn num_heads(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| matches!(l, Layer::Yolo(_)))
            .count()
    }

    /// Largest class count over the heads.
    pub fn num_classes(&self) -> usize {
        self.layers
            .iter()
            .filter_map(|l| match l {
                Layer::Yolo(head) => Some(head.classes),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Run the network on a `[1, channels, h, w]` blob.
    ///
    /// Returns one decoded `[rows, 5 + classes]` tensor per `[yolo]` head.
    pub fn forward(&self, xs: &Tensor) -> Result<Vec<Tensor>, DetectError> {
        let (_, _, input_height, input_width) = xs.dims4()?;
        let mut cache: Vec<Tensor> = Vec::with_capacity(self.layers.len());
        let mut outputs = Vec::new();
        let mut xs = xs.clone();

        for layer in self.layers.iter() {
            let ys = match layer {
                Layer::Convolutional {
                    conv,
                    bn,
                    activation,
                } => {
                    let ys = conv.forward(&xs)?;
                    let ys = match bn {
                        Some(bn) => bn.forward_t(&ys, false)?,
                        None => ys,
                    };
                    activation.apply(&ys)?
                }
                Layer::MaxPool {
                    size,
                    stride,
                    padding,
                } => max_pool(&xs, *size, *stride, *padding)?,
                Layer::Upsample { stride } => {
                    let (_, _, h, w) = xs.dims4()?;
                    xs.upsample_nearest2d(h * stride, w * stride)?
                }
                Layer::Route {
                    layers,
                    groups,
                    group_id,
                } => {
                    let parts = layers
                        .iter()
                        .map(|&i| {
                            let t = &cache[i];
                            if *groups > 1 {
                                let c = t.dim(1)? / groups;
                                t.narrow(1, group_id * c, c)
                            } else {
                                Ok(t.clone())
                            }
                        })
                        .collect::<candle_core::Result<Vec<_>>>()?;
                    Tensor::cat(&parts, 1)?
                }
                Layer::Shortcut { from, activation } => {
                    activation.apply(&(&xs + &cache[*from])?)?
                }
                Layer::Yolo(head) => {
                    outputs.push(head.decode(&xs, input_width, input_height)?);
                    xs.clone()
                }
            };
            cache.push(ys.clone());
            xs = ys;
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::weights_bytes;
    use candle_core::DType;

    const TINY_CFG: &str = "
[net]
width=32
height=32
channels=3

[convolutional]
batch_normalize=1
filters=4
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
filters=7
size=1
stride=1
activation=linear

[yolo]
mask=0
anchors=10,14
classes=2
num=1
";

    // conv bn: 4 * 4 + 4 * 3 * 3 * 3, conv: 7 + 7 * 4
    const TINY_WEIGHTS: usize = 124 + 35;

    #[test]
    fn test_tiny_forward() -> Result<(), Box<dyn std::error::Error>> {
        let cfg: DarknetConfig = TINY_CFG.parse()?;
        let bytes = weights_bytes((0, 2, 0), &vec![0.0; TINY_WEIGHTS]);
        let mut weights = WeightsReader::from_bytes(&bytes)?;
        let net = Darknet::new(&cfg, &mut weights, &Device::Cpu)?;
        assert_eq!(weights.remaining(), 0);
        assert_eq!(net.num_heads(), 1);
        assert_eq!(net.num_classes(), 2);

        let xs = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu)?;
        let outputs = net.forward(&xs)?;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].dims(), &[16 * 16, 7]);

        // all-zero activations: sigmoid 0.5, exp 1
        let rows = outputs[0].to_vec2::<f32>()?;
        let expected = [0.5 / 16., 0.5 / 16., 10. / 32., 14. / 32., 0.5, 0.25, 0.25];
        for (got, want) in rows[0].iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
        // second row is the next cell column
        assert!((rows[1][0] - 1.5 / 16.).abs() < 1e-6);
        assert!((rows[16][1] - 1.5 / 16.).abs() < 1e-6);
        Ok(())
    }

    const ROUTE_CFG: &str = "
[net]
channels=3

[convolutional]
filters=4
size=1
activation=leaky

[convolutional]
filters=4
size=1
activation=mish

[shortcut]
from=-2
activation=linear

[route]
layers=-1,-3

[upsample]
stride=2

[convolutional]
filters=7
size=1
activation=linear

[yolo]
mask=0
anchors=10,14,20,28
classes=2
num=2
";

    #[test]
    fn test_route_and_shortcut() -> Result<(), Box<dyn std::error::Error>> {
        let cfg: DarknetConfig = ROUTE_CFG.parse()?;
        // 4 + 4 * 3, 4 + 4 * 4, 7 + 7 * 8
        let bytes = weights_bytes((0, 2, 0), &vec![0.0; 16 + 20 + 63]);
        let mut weights = WeightsReader::from_bytes(&bytes)?;
        let net = Darknet::new(&cfg, &mut weights, &Device::Cpu)?;
        assert_eq!(weights.remaining(), 0);

        let xs = Tensor::ones((1, 3, 8, 8), DType::F32, &Device::Cpu)?;
        let outputs = net.forward(&xs)?;
        assert_eq!(outputs[0].dims(), &[16 * 16, 7]);
        Ok(())
    }

    #[test]
    fn test_short_weights() -> Result<(), Box<dyn std::error::Error>> {
        let cfg: DarknetConfig = TINY_CFG.parse()?;
        let bytes = weights_bytes((0, 2, 0), &vec![0.0; TINY_WEIGHTS - 1]);
        let mut weights = WeightsReader::from_bytes(&bytes)?;
        assert!(matches!(
            Darknet::new(&cfg, &mut weights, &Device::Cpu),
            Err(DetectError::InvalidWeights(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unsupported_layer() -> Result<(), Box<dyn std::error::Error>> {
        let cfg: DarknetConfig = "[net]\n[dropout]\nprobability=.5\n".parse()?;
        let mut weights = WeightsReader::from_bytes(&weights_bytes((0, 2, 0), &[]))?;
        assert!(matches!(
            Darknet::new(&cfg, &mut weights, &Device::Cpu),
            Err(DetectError::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_zero_stride() -> Result<(), Box<dyn std::error::Error>> {
        for cfg in [
            "[net]\n[maxpool]\nsize=2\nstride=0\n",
            "[net]\n[maxpool]\nsize=0\nstride=1\n",
            "[net]\n[convolutional]\nfilters=1\nsize=1\nstride=0\n",
            "[net]\n[convolutional]\nfilters=1\nsize=0\n",
            "[net]\n[upsample]\nstride=0\n",
        ] {
            let cfg: DarknetConfig = cfg.parse()?;
            // enough values for a 1-filter 1x1 conv
            let mut weights = WeightsReader::from_bytes(&weights_bytes((0, 2, 0), &[0.0; 4]))?;
            assert!(matches!(
                Darknet::new(&cfg, &mut weights, &Device::Cpu),
                Err(DetectError::InvalidConfig(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_max_pool_padding() -> Result<(), Box<dyn std::error::Error>> {
        let xs = Tensor::from_vec(vec![1f32, 2., 3., 4.], (1, 1, 2, 2), &Device::Cpu)?;
        let ys = max_pool(&xs, 2, 1, 1)?;
        assert_eq!(ys.dims(), &[1, 1, 2, 2]);
        assert_eq!(ys.flatten_all()?.to_vec1::<f32>()?, vec![4., 4., 4., 4.]);

        let xs = Tensor::zeros((1, 2, 6, 6), DType::F32, &Device::Cpu)?;
        assert_eq!(max_pool(&xs, 2, 2, 1)?.dims(), &[1, 2, 3, 3]);
        assert_eq!(max_pool(&xs, 5, 1, 4)?.dims(), &[1, 2, 6, 6]);
        Ok(())
    }
}
