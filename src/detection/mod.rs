// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测系统 (Detection System)
///
/// - types:    视频帧, 候选框, 检测结果
/// - detector: 检测元件状态机 (逐帧推理 + 属性热更新)
pub mod detector;
pub mod types;

pub use detector::{Detector, DetectorEvent, DetectorStats, ElementState, FrameOutcome};
pub use types::{Bbox, Candidate, Detection, DetectionMeta, Frame, PixelFormat, VideoInfo};
