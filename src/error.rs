// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测元件错误类型

use thiserror::Error;

/// 检测元件错误
///
/// - 配置类错误 (`Config`, `ModelLoad`, `BackendInit`) 同步返回给设置属性的调用方
/// - 单帧错误 (`Inference`, `ShapeMismatch`, `InvalidFrame`) 可恢复, 帧原样转发
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("invalid value for `{property}`: {reason}")]
    Config {
        property: &'static str,
        reason: String,
    },

    #[error("model load error: {0}")]
    ModelLoad(String),

    #[error("backend init error: {0}")]
    BackendInit(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("tensor shape mismatch: expected {expected}, got {actual:?}")]
    ShapeMismatch { expected: String, actual: Vec<usize> },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("element has been torn down")]
    TornDown,
}

impl DetectorError {
    pub fn config(property: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            property,
            reason: reason.into(),
        }
    }

    /// 单帧可恢复错误: 该帧不加标注直接转发, 流水线继续
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Inference(_) | Self::ShapeMismatch { .. } | Self::InvalidFrame(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(DetectorError::Inference("oom".into()).is_recoverable());
        assert!(DetectorError::ShapeMismatch {
            expected: "[1, 13, 13, 3, 85]".into(),
            actual: vec![1, 2, 3],
        }
        .is_recoverable());
        assert!(!DetectorError::ModelLoad("missing".into()).is_recoverable());
        assert!(!DetectorError::config("score-threshold", "out of range").is_recoverable());
        assert!(!DetectorError::TornDown.is_recoverable());
    }

    #[test]
    fn test_display() {
        let e = DetectorError::config("nms-threshold", "must be within [0, 1], got 1.5");
        assert_eq!(
            e.to_string(),
            "invalid value for `nms-threshold`: must be within [0, 1], got 1.5"
        );
    }
}
