// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测模型族: 输入几何 + 输出解码
///
/// # 架构说明
///
/// 每个模型族只实现 [`Postprocessor`]:
/// - 声明输入张量几何 ([`InputShape`]: 尺寸, 通道顺序, 布局, 数值范围)
/// - 声明期望的输出张量形状
/// - 把原始输出张量解码成候选框 (输入张量坐标系)
///
/// 模型加载和推理由 `ort_backend` 处理, 预处理由 `preprocess` 处理,
/// NMS 与坐标还原由 `detection::Detector` 处理.
///
/// ## 流程
/// ```text
/// 视频帧 → preprocess (letterbox) → 张量
///        ↓
///    Engine::run
///        ↓
///  原始输出 → Postprocessor::decode → 候选框 → NMS → 坐标还原
/// ```
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{Array, IxDyn};
use serde::{Deserialize, Serialize};

use crate::detection::Candidate;
use crate::error::{DetectorError, Result};

pub mod yolov4;

pub use yolov4::{YOLOv4Config, YOLOv4Postprocessor};

/// 推理张量
pub type Tensor = Array<f32, IxDyn>;

/// 支持的检测模型族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ModelType {
    /// YOLOv4 (ONNX model zoo, COCO 80 类, 三个检测头)
    #[default]
    #[serde(rename = "yolov4")]
    YOLOv4,
}

impl ModelType {
    pub fn nick(&self) -> &'static str {
        match self {
            Self::YOLOv4 => "yolov4",
        }
    }

    /// 创建该模型族的后处理器
    pub fn postprocessor(&self) -> Arc<dyn Postprocessor> {
        match self {
            Self::YOLOv4 => Arc::new(YOLOv4Postprocessor::default()),
        }
    }
}

impl FromStr for ModelType {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "yolov4" => Ok(Self::YOLOv4),
            other => Err(DetectorError::config(
                "detection-model",
                format!("unsupported model `{other}`"),
            )),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}

/// 张量内存布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// [N, H, W, C]
    Nhwc,
    /// [N, C, H, W]
    Nchw,
}

/// 模型期望的通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// 像素归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRange {
    /// v / 255, 取值 [0, 1]
    Unit,
    /// 原始 0..=255
    Byte,
}

impl ValueRange {
    #[inline]
    pub fn normalize(&self, v: u8) -> f32 {
        match self {
            Self::Unit => v as f32 / 255.0,
            Self::Byte => v as f32,
        }
    }
}

/// 模型输入张量几何
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub width: u32,
    pub height: u32,
    pub order: ChannelOrder,
    pub layout: TensorLayout,
    pub range: ValueRange,
}

impl InputShape {
    pub const CHANNELS: usize = 3;

    /// 批大小固定为 1 的张量维度
    pub fn dims(&self) -> [usize; 4] {
        let (w, h, c) = (self.width as usize, self.height as usize, Self::CHANNELS);
        match self.layout {
            TensorLayout::Nhwc => [1, h, w, c],
            TensorLayout::Nchw => [1, c, h, w],
        }
    }
}

/// 模型族后处理接口
pub trait Postprocessor: Send + Sync {
    fn model_type(&self) -> ModelType;

    fn input_shape(&self) -> InputShape;

    fn num_classes(&self) -> usize;

    /// 期望的输出张量形状 (批大小为 1)
    fn output_shapes(&self) -> Vec<Vec<usize>>;

    /// 原始输出 → 候选框 (输入张量坐标系)
    ///
    /// 只保留 `confidence >= score_threshold` 的候选框; 输出张量形状与
    /// 几何不符时返回 `ShapeMismatch`.
    fn decode(&self, outputs: &[Tensor], score_threshold: f32) -> Result<Vec<Candidate>>;
}

impl fmt::Debug for dyn Postprocessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Postprocessor")
            .field("model", &self.model_type())
            .field("input", &self.input_shape())
            .field("classes", &self.num_classes())
            .finish()
    }
}
