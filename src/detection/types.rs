// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测系统数据结构定义

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};

// ========== 检测框 ==========

/// 轴对齐边界框 (xmin, ymin, width, height)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bbox {
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
        }
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn from_cxcywh(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self::new(cx - width * 0.5, cy - height * 0.5, width, height)
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn cxcy(&self) -> (f32, f32) {
        (self.xmin + self.width / 2., self.ymin + self.height / 2.)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// 面积为正且坐标有限
    pub fn is_valid(&self) -> bool {
        let area = self.area();
        self.xmin.is_finite() && self.ymin.is_finite() && area.is_finite() && area > 0.
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// 交并比; 两框并集为空时返回 0
    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}

/// NMS 之前的候选框 (解码后位于张量空间, 还原后位于帧空间)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: Bbox,
    pub class_id: usize,
    pub confidence: f32,
}

impl Candidate {
    pub fn new(bbox: Bbox, class_id: usize, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            confidence,
        }
    }
}

/// 最终检测结果, 坐标位于原始帧像素空间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: Bbox,
}

/// 附加在输出帧上的检测结果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionMeta {
    pub detections: Vec<Detection>,
    pub inference_ms: f64,
}

impl DetectionMeta {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// 按置信度从高到低排序后的视图
    pub fn sorted_by_score(&self) -> Vec<&Detection> {
        let mut sorted: Vec<_> = self.detections.iter().collect();
        sorted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        sorted
    }
}

// ========== 视频帧 ==========

/// 原始视频像素格式 (交错存储, 每通道 8 bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb,
    Bgr,
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgb | Self::Bgr => 3,
            Self::Rgba | Self::Bgra => 4,
        }
    }

    /// R, G, B 三个通道在像素内的字节偏移
    pub fn rgb_offsets(&self) -> [usize; 3] {
        match self {
            Self::Rgb | Self::Rgba => [0, 1, 2],
            Self::Bgr | Self::Bgra => [2, 1, 0],
        }
    }
}

/// 协商好的视频格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl VideoInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// 紧密排列时一行的字节数
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

/// 原始视频帧, 由外部流水线持有; 检测元件只在一次处理调用内借用它
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    info: VideoInfo,
    stride: usize,
    pts: Option<Duration>,
    meta: Option<DetectionMeta>,
}

impl Frame {
    /// 紧密排列的帧 (stride = width × bpp)
    pub fn new(info: VideoInfo, data: Vec<u8>, pts: Option<Duration>) -> Result<Self> {
        let stride = info.row_bytes();
        Self::with_stride(info, stride, data, pts)
    }

    /// 带行跨度的帧 (行尾可能有对齐填充)
    pub fn with_stride(
        info: VideoInfo,
        stride: usize,
        data: Vec<u8>,
        pts: Option<Duration>,
    ) -> Result<Self> {
        if info.width == 0 || info.height == 0 {
            return Err(DetectorError::InvalidFrame(format!(
                "empty frame {}x{}",
                info.width, info.height
            )));
        }
        if stride < info.row_bytes() {
            return Err(DetectorError::InvalidFrame(format!(
                "stride {} smaller than row size {}",
                stride,
                info.row_bytes()
            )));
        }
        let required = stride * (info.height as usize - 1) + info.row_bytes();
        if data.len() < required {
            return Err(DetectorError::InvalidFrame(format!(
                "buffer holds {} bytes, {}x{} {:?} needs {}",
                data.len(),
                info.width,
                info.height,
                info.format,
                required
            )));
        }
        Ok(Self {
            data,
            info,
            stride,
            pts,
            meta: None,
        })
    }

    pub fn info(&self) -> VideoInfo {
        self.info
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn format(&self) -> PixelFormat {
        self.info.format
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pts(&self) -> Option<Duration> {
        self.pts
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 一行的有效像素字节 (不含对齐填充)
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.info.row_bytes()]
    }

    pub fn detections(&self) -> Option<&DetectionMeta> {
        self.meta.as_ref()
    }

    pub fn attach_detections(&mut self, meta: DetectionMeta) {
        self.meta = Some(meta);
    }

    pub fn take_detections(&mut self) -> Option<DetectionMeta> {
        self.meta.take()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
