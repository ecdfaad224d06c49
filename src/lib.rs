// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! ONNX Runtime 目标检测元件
//!
//! 原始视频帧进, 同一帧出, 附带检测框, 类别与置信度.
//!
//! ```text
//! Frame → preprocess (letterbox) → Engine::run → Postprocessor::decode
//!       → non_max_suppression → Letterbox::to_frame → DetectionMeta
//! ```
//!
//! ```no_run
//! use ort_detector::{Detector, DetectorConfig, Frame, PixelFormat, VideoInfo};
//!
//! # fn main() -> ort_detector::Result<()> {
//! ort_detector::logging::init();
//!
//! let mut config = DetectorConfig::default();
//! config.set_model_file("models/yolov4.onnx")?;
//! config.set_label_file("models/coco.names")?;
//!
//! let detector = Detector::new(config);
//! detector.configure()?;
//!
//! let info = VideoInfo::new(640, 480, PixelFormat::Bgr);
//! let mut frame = Frame::new(info, vec![0; 640 * 480 * 3], None)?;
//! detector.process(&mut frame)?;
//! if let Some(meta) = frame.detections() {
//!     for det in &meta.detections {
//!         println!("{}: {:.2} {:?}", det.label, det.confidence, det.bbox);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config; // 元件属性
pub mod detection; // 检测元件与数据结构
pub mod error;
pub mod logging;
pub mod model_store; // 模型与标签加载
pub mod models; // 模型族几何与解码
pub mod nms;
pub mod ort_backend; // 推理后端
pub mod overlay; // 检测结果叠加绘制
pub mod preprocess;

pub use crate::config::{
    DetectorConfig, ExecutionProvider, ExecutionSettings, OptimizationLevel, Property, Reconfigure,
};
pub use crate::detection::{
    Bbox, Candidate, Detection, DetectionMeta, Detector, DetectorEvent, DetectorStats,
    ElementState, Frame, FrameOutcome, PixelFormat, VideoInfo,
};
pub use crate::error::{DetectorError, Result};
pub use crate::model_store::ModelConfig;
pub use crate::models::{ModelType, Postprocessor, Tensor};
pub use crate::nms::non_max_suppression;
pub use crate::ort_backend::{Engine, EngineFactory, OrtBackend, OrtConfig, OrtEP, OrtEngineFactory};
pub use crate::preprocess::Letterbox;
