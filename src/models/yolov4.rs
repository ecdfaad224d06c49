// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv4 后处理模块
// 几何参数与 ONNX model zoo 的 yolov4.onnx 一致
//
// 输入 [1, 416, 416, 3] NHWC, RGB, 取值 [0, 1]
// 输出 3 个检测头 [1, G, G, 3, 85], G = 52 / 26 / 13, stride = 8 / 16 / 32

use tracing::trace;

use super::{ChannelOrder, InputShape, ModelType, Postprocessor, TensorLayout, Tensor, ValueRange};
use crate::detection::{Bbox, Candidate};
use crate::error::{DetectorError, Result};

/// YOLOv4 配置
#[derive(Debug, Clone, PartialEq)]
pub struct YOLOv4Config {
    pub num_classes: usize,
    pub num_anchors: usize,
    pub input_width: u32,
    pub input_height: u32,
    pub strides: Vec<f32>,
    /// 每层 num_anchors 个 (w, h), 按 layer * num_anchors * 2 + anchor * 2 展开
    pub anchors: Vec<f32>,
    pub xyscale: Vec<f32>,
}

impl Default for YOLOv4Config {
    fn default() -> Self {
        Self {
            num_classes: 80, // COCO
            num_anchors: 3,
            input_width: 416,
            input_height: 416,
            strides: vec![8.0, 16.0, 32.0],
            anchors: vec![
                12., 16., 19., 36., 40., 28., // stride 8
                36., 75., 76., 55., 72., 146., // stride 16
                142., 110., 192., 243., 459., 401., // stride 32
            ],
            xyscale: vec![1.2, 1.1, 1.05],
        }
    }
}

impl YOLOv4Config {
    pub fn features_per_anchor(&self) -> usize {
        5 + self.num_classes
    }

    pub fn num_layers(&self) -> usize {
        self.strides.len()
    }

    /// 第 `layer` 层的网格边长
    pub fn grid_size(&self, layer: usize) -> usize {
        (self.input_width as f32 / self.strides[layer]).round() as usize
    }

    /// 检查各参数数组长度与检测层数一致, 保证解码时的索引都在范围内
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> {
            Err(DetectorError::ModelLoad(format!("YOLOv4: {reason}")))
        };
        let layers = self.num_layers();

        if self.num_classes == 0 || self.num_anchors == 0 {
            return invalid(format!(
                "num_classes ({}) and num_anchors ({}) must be positive",
                self.num_classes, self.num_anchors
            ));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return invalid(format!(
                "input size {}x{} is empty",
                self.input_width, self.input_height
            ));
        }
        if layers == 0 || self.strides.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return invalid(format!("strides {:?} must be positive", self.strides));
        }
        if self.xyscale.len() != layers {
            return invalid(format!(
                "{} xyscale values for {} layers",
                self.xyscale.len(),
                layers
            ));
        }
        if self.anchors.len() != layers * self.num_anchors * 2 {
            return invalid(format!(
                "{} anchor values, expected {} ({} layers x {} anchors x 2)",
                self.anchors.len(),
                layers * self.num_anchors * 2,
                layers,
                self.num_anchors
            ));
        }
        if let Some(layer) = (0..layers).find(|&l| self.grid_size(l) == 0) {
            return invalid(format!("stride {} leaves an empty grid", self.strides[layer]));
        }
        Ok(())
    }

    fn anchor(&self, layer: usize, anchor: usize) -> (f32, f32) {
        let i = (layer * self.num_anchors + anchor) * 2;
        (self.anchors[i], self.anchors[i + 1])
    }
}

#[inline]
fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// YOLOv4 后处理器
#[derive(Debug, Clone)]
pub struct YOLOv4Postprocessor {
    config: YOLOv4Config,
}

impl Default for YOLOv4Postprocessor {
    fn default() -> Self {
        Self {
            config: YOLOv4Config::default(),
        }
    }
}

impl YOLOv4Postprocessor {
    pub fn new(config: YOLOv4Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &YOLOv4Config {
        &self.config
    }

    fn expected(&self) -> String {
        let shapes: Vec<String> = self
            .output_shapes()
            .iter()
            .map(|s| format!("{s:?}"))
            .collect();
        shapes.join(" | ")
    }

    /// 按网格边长找到输出张量对应的检测层
    fn match_layer(&self, output: &Tensor, used: &[bool]) -> Result<usize> {
        let shape = output.shape();
        let mismatch = || DetectorError::ShapeMismatch {
            expected: self.expected(),
            actual: shape.to_vec(),
        };

        if shape.len() != 5
            || shape[0] != 1
            || shape[1] != shape[2]
            || shape[3] != self.config.num_anchors
            || shape[4] != self.config.features_per_anchor()
        {
            return Err(mismatch());
        }

        (0..self.config.num_layers())
            .find(|&layer| !used[layer] && self.config.grid_size(layer) == shape[1])
            .ok_or_else(mismatch)
    }

    /// 解码单个检测头
    ///
    /// 每个 anchor 的特征布局: [tx, ty, tw, th, obj, cls_0 .. cls_{C-1}],
    /// obj 与类别分数已经是概率
    fn decode_layer(
        &self,
        output: &Tensor,
        layer: usize,
        score_threshold: f32,
        candidates: &mut Vec<Candidate>,
    ) {
        let grid = output.shape()[1];
        let num_anchors = self.config.num_anchors;
        let features = self.config.features_per_anchor();
        let stride = self.config.strides[layer];
        let scale = self.config.xyscale[layer];

        let data = output.as_standard_layout();
        let Some(data) = data.as_slice() else {
            return;
        };

        for (i, pred) in data.chunks_exact(features).enumerate() {
            let anchor = i % num_anchors;
            let col = (i / num_anchors) % grid;
            let row = i / (num_anchors * grid);

            // 最大类别概率, 并列时取较小的类别号
            let mut class_id = 0;
            let mut class_prob = pred[5];
            for (k, &p) in pred[5..].iter().enumerate().skip(1) {
                if p > class_prob {
                    class_id = k;
                    class_prob = p;
                }
            }

            let confidence = pred[4] * class_prob;
            if !confidence.is_finite() || confidence < score_threshold {
                continue;
            }

            let (anchor_w, anchor_h) = self.config.anchor(layer, anchor);
            let cx = ((sigmoid(pred[0]) * scale) - 0.5 * (scale - 1.0) + col as f32) * stride;
            let cy = ((sigmoid(pred[1]) * scale) - 0.5 * (scale - 1.0) + row as f32) * stride;
            let w = pred[2].exp() * anchor_w;
            let h = pred[3].exp() * anchor_h;

            let bbox = Bbox::from_cxcywh(cx, cy, w, h);
            if !bbox.is_valid() {
                continue;
            }

            candidates.push(Candidate::new(bbox, class_id, confidence.clamp(0.0, 1.0)));
        }
    }
}

impl Postprocessor for YOLOv4Postprocessor {
    fn model_type(&self) -> ModelType {
        ModelType::YOLOv4
    }

    fn input_shape(&self) -> InputShape {
        InputShape {
            width: self.config.input_width,
            height: self.config.input_height,
            order: ChannelOrder::Rgb,
            layout: TensorLayout::Nhwc,
            range: ValueRange::Unit,
        }
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn output_shapes(&self) -> Vec<Vec<usize>> {
        (0..self.config.num_layers())
            .map(|layer| {
                let g = self.config.grid_size(layer);
                vec![
                    1,
                    g,
                    g,
                    self.config.num_anchors,
                    self.config.features_per_anchor(),
                ]
            })
            .collect()
    }

    fn decode(&self, outputs: &[Tensor], score_threshold: f32) -> Result<Vec<Candidate>> {
        if outputs.len() != self.config.num_layers() {
            return Err(DetectorError::ShapeMismatch {
                expected: format!("{} output tensors", self.config.num_layers()),
                actual: vec![outputs.len()],
            });
        }

        // 先核对全部形状, 再解码
        let mut used = vec![false; self.config.num_layers()];
        let mut layers = Vec::with_capacity(outputs.len());
        for output in outputs {
            let layer = self.match_layer(output, &used)?;
            used[layer] = true;
            layers.push(layer);
        }

        let mut candidates = Vec::new();
        for (output, layer) in outputs.iter().zip(layers) {
            self.decode_layer(output, layer, score_threshold, &mut candidates);
        }
        trace!("YOLOv4 解码得到 {} 个候选框", candidates.len());
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn empty_outputs(post: &YOLOv4Postprocessor) -> Vec<Tensor> {
        post.output_shapes()
            .iter()
            .map(|s| Array::zeros(IxDyn(s)))
            .collect()
    }

    /// 在指定检测头的某个 cell/anchor 写入 obj 与类别概率 (其余 logits 为 0)
    fn set_cell(
        output: &mut Tensor,
        row: usize,
        col: usize,
        anchor: usize,
        obj: f32,
        class_id: usize,
        prob: f32,
    ) {
        output[[0, row, col, anchor, 4].as_slice()] = obj;
        output[[0, row, col, anchor, 5 + class_id].as_slice()] = prob;
    }

    #[test]
    fn test_default_geometry() {
        let post = YOLOv4Postprocessor::default();
        assert_eq!(
            post.output_shapes(),
            vec![
                vec![1, 52, 52, 3, 85],
                vec![1, 26, 26, 3, 85],
                vec![1, 13, 13, 3, 85]
            ]
        );
        assert_eq!(post.config().anchor(2, 0), (142., 110.));
        assert_eq!(post.config().anchor(0, 2), (40., 28.));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(YOLOv4Postprocessor::new(YOLOv4Config::default()).is_ok());

        let broken = [
            YOLOv4Config {
                num_classes: 0,
                ..YOLOv4Config::default()
            },
            YOLOv4Config {
                xyscale: vec![1.2, 1.1],
                ..YOLOv4Config::default()
            },
            YOLOv4Config {
                anchors: vec![12., 16., 19., 36.],
                ..YOLOv4Config::default()
            },
            YOLOv4Config {
                strides: vec![8.0, 0.0, 32.0],
                ..YOLOv4Config::default()
            },
            YOLOv4Config {
                strides: vec![1000.0, 16.0, 32.0],
                ..YOLOv4Config::default()
            },
        ];
        for config in broken {
            assert!(matches!(
                YOLOv4Postprocessor::new(config),
                Err(DetectorError::ModelLoad(_))
            ));
        }

        // 两层检测头的自定义几何
        let two_heads = YOLOv4Config {
            num_classes: 2,
            strides: vec![16.0, 32.0],
            anchors: vec![10., 14., 23., 27., 37., 58., 81., 82., 135., 169., 344., 319.],
            xyscale: vec![1.05, 1.05],
            ..YOLOv4Config::default()
        };
        let post = YOLOv4Postprocessor::new(two_heads).unwrap();
        assert_eq!(
            post.output_shapes(),
            vec![vec![1, 26, 26, 3, 7], vec![1, 13, 13, 3, 7]]
        );
        assert!(post.decode(&empty_outputs(&post), 0.25).unwrap().is_empty());
    }

    #[test]
    fn test_decode_single_box() {
        let post = YOLOv4Postprocessor::default();
        let mut outputs = empty_outputs(&post);
        set_cell(&mut outputs[2], 6, 6, 0, 0.9, 17, 0.8);

        let candidates = post.decode(&outputs, 0.25).unwrap();
        assert_eq!(candidates.len(), 1);
        let c = candidates[0];
        assert_eq!(c.class_id, 17);
        assert!((c.confidence - 0.72).abs() < 1e-6);
        // σ(0) = 0.5 → cx = (0.5 * 1.05 - 0.025 + 6) * 32 = 208
        let (cx, cy) = c.bbox.cxcy();
        assert!((cx - 208.0).abs() < 1e-3);
        assert!((cy - 208.0).abs() < 1e-3);
        assert!((c.bbox.width() - 142.0).abs() < 1e-3);
        assert!((c.bbox.height() - 110.0).abs() < 1e-3);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let post = YOLOv4Postprocessor::default();
        let mut outputs = empty_outputs(&post);
        set_cell(&mut outputs[0], 10, 20, 1, 1.0, 3, 0.5);

        assert_eq!(post.decode(&outputs, 0.5).unwrap().len(), 1);
        assert!(post.decode(&outputs, 0.5001).unwrap().is_empty());
    }

    #[test]
    fn test_heads_matched_by_grid_size() {
        let post = YOLOv4Postprocessor::default();
        let mut outputs = empty_outputs(&post);
        set_cell(&mut outputs[2], 0, 0, 0, 1.0, 0, 1.0);
        // 检测头顺序颠倒时结果不变
        let forward = post.decode(&outputs, 0.5).unwrap();
        outputs.reverse();
        let reversed = post.decode(&outputs, 0.5).unwrap();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_shape_mismatch() {
        let post = YOLOv4Postprocessor::default();
        let mut outputs = empty_outputs(&post);
        outputs[1] = Array::zeros(IxDyn(&[1, 26, 26, 3, 84]));
        assert!(matches!(
            post.decode(&outputs, 0.25),
            Err(DetectorError::ShapeMismatch { actual, .. }) if actual == vec![1, 26, 26, 3, 84]
        ));

        let outputs = empty_outputs(&post);
        assert!(matches!(
            post.decode(&outputs[..2], 0.25),
            Err(DetectorError::ShapeMismatch { .. })
        ));

        // 同一网格出现两次
        let mut outputs = empty_outputs(&post);
        outputs[0] = outputs[1].clone();
        assert!(post.decode(&outputs, 0.25).is_err());
    }

    #[test]
    fn test_non_finite_skipped() {
        let post = YOLOv4Postprocessor::default();
        let mut outputs = empty_outputs(&post);
        set_cell(&mut outputs[1], 3, 3, 0, 1.0, 0, 1.0);
        outputs[1][[0, 3, 3, 0, 2].as_slice()] = f32::INFINITY;
        set_cell(&mut outputs[1], 4, 4, 0, f32::NAN, 0, 1.0);
        assert!(post.decode(&outputs, 0.1).unwrap().is_empty());
    }
}
