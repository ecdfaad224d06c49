// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测元件配置 (属性集合)
//
// 每个属性都有类型化的 setter, 提交前先校验; 校验失败时保留旧值.
// 也可以通过 JSON 文件加载/保存整套配置.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DetectorError, Result};
use crate::models::ModelType;

/// 默认置信度阈值 (YOLOv4 参考后处理使用 0.25)
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
/// 默认 NMS IoU 阈值 (YOLOv4 参考后处理使用 0.213)
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.213;

/// ONNX Runtime 图优化级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizationLevel {
    DisableAll,
    Basic,
    #[default]
    Extended,
    All,
}

impl OptimizationLevel {
    pub fn nick(&self) -> &'static str {
        match self {
            Self::DisableAll => "disable-all",
            Self::Basic => "basic",
            Self::Extended => "extended",
            Self::All => "all",
        }
    }
}

impl FromStr for OptimizationLevel {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "disable-all" => Ok(Self::DisableAll),
            "basic" | "enable-basic" => Ok(Self::Basic),
            "extended" | "enable-extended" => Ok(Self::Extended),
            "all" | "enable-all" => Ok(Self::All),
            other => Err(DetectorError::config(
                "optimization-level",
                format!("unknown level `{other}`"),
            )),
        }
    }
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}

/// 推理后端 (execution provider)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
}

impl ExecutionProvider {
    pub fn nick(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }
}

impl FromStr for ExecutionProvider {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu-cuda" => Ok(Self::Cuda),
            other => Err(DetectorError::config(
                "execution-provider",
                format!("unknown provider `{other}`"),
            )),
        }
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}

/// 推理会话参数, 任何变化都会重建会话
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionSettings {
    pub provider: ExecutionProvider,
    pub device_id: i32,
    pub optimization_level: OptimizationLevel,
    pub intra_threads: Option<usize>,
}

/// 单个属性的新值
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    ModelFile(PathBuf),
    LabelFile(PathBuf),
    ScoreThreshold(f32),
    NmsThreshold(f32),
    DeviceId(i32),
    OptimizationLevel(OptimizationLevel),
    ExecutionProvider(ExecutionProvider),
    DetectionModel(ModelType),
    IntraThreads(Option<usize>),
    DrawOverlay(bool),
    OverlayFont(Option<PathBuf>),
}

/// 属性变化对元件造成的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reconfigure {
    /// 只影响逐帧参数 (阈值, 叠加开关)
    None,
    /// 叠加字体需要重新加载
    Overlay,
    /// ExecutionSettings 变化: 用同一个 ModelConfig 重建会话
    Session,
    /// ModelConfig 变化: 重新加载模型和标签, 再重建会话
    Model,
}

impl Property {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModelFile(_) => "model-file",
            Self::LabelFile(_) => "label-file",
            Self::ScoreThreshold(_) => "score-threshold",
            Self::NmsThreshold(_) => "nms-threshold",
            Self::DeviceId(_) => "device-id",
            Self::OptimizationLevel(_) => "optimization-level",
            Self::ExecutionProvider(_) => "execution-provider",
            Self::DetectionModel(_) => "detection-model",
            Self::IntraThreads(_) => "intra-threads",
            Self::DrawOverlay(_) => "draw-overlay",
            Self::OverlayFont(_) => "overlay-font",
        }
    }

    /// 按属性名解析字符串值 (供宿主框架的属性表使用)
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        let float = |property: &'static str| -> Result<f32> {
            value
                .trim()
                .parse::<f32>()
                .map_err(|e| DetectorError::config(property, e.to_string()))
        };
        let optional_path = || {
            let v = value.trim();
            if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            }
        };

        let property = match name {
            "model-file" => Self::ModelFile(PathBuf::from(value.trim())),
            "label-file" => Self::LabelFile(PathBuf::from(value.trim())),
            "score-threshold" => Self::ScoreThreshold(float("score-threshold")?),
            "nms-threshold" => Self::NmsThreshold(float("nms-threshold")?),
            "device-id" => Self::DeviceId(
                value
                    .trim()
                    .parse::<i32>()
                    .map_err(|e| DetectorError::config("device-id", e.to_string()))?,
            ),
            "optimization-level" => Self::OptimizationLevel(value.parse()?),
            "execution-provider" => Self::ExecutionProvider(value.parse()?),
            "detection-model" => Self::DetectionModel(value.parse()?),
            "intra-threads" => Self::IntraThreads(match value.trim() {
                "" | "auto" => None,
                v => Some(
                    v.parse::<usize>()
                        .map_err(|e| DetectorError::config("intra-threads", e.to_string()))?,
                ),
            }),
            "draw-overlay" => Self::DrawOverlay(
                value
                    .trim()
                    .parse::<bool>()
                    .map_err(|e| DetectorError::config("draw-overlay", e.to_string()))?,
            ),
            "overlay-font" => Self::OverlayFont(optional_path()),
            other => {
                return Err(DetectorError::Config {
                    property: "unknown",
                    reason: format!("no property named `{other}`"),
                })
            }
        };
        property.validate()?;
        Ok(property)
    }

    /// 校验取值范围, 不修改任何状态
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ModelFile(path) | Self::LabelFile(path) => check_regular_file(self.name(), path),
            Self::OverlayFont(Some(path)) => check_regular_file(self.name(), path),
            Self::ScoreThreshold(v) | Self::NmsThreshold(v) => {
                if v.is_finite() && (0.0..=1.0).contains(v) {
                    Ok(())
                } else {
                    Err(DetectorError::config(
                        self.name(),
                        format!("must be within [0, 1], got {v}"),
                    ))
                }
            }
            Self::DeviceId(id) if *id < 0 => Err(DetectorError::config(
                self.name(),
                format!("must be non-negative, got {id}"),
            )),
            Self::IntraThreads(Some(0)) => Err(DetectorError::config(
                self.name(),
                "must be at least 1 (omit for the runtime default)",
            )),
            _ => Ok(()),
        }
    }

    pub fn reconfigure(&self) -> Reconfigure {
        match self {
            Self::ModelFile(_) | Self::LabelFile(_) | Self::DetectionModel(_) => Reconfigure::Model,
            Self::DeviceId(_)
            | Self::OptimizationLevel(_)
            | Self::ExecutionProvider(_)
            | Self::IntraThreads(_) => Reconfigure::Session,
            Self::OverlayFont(_) => Reconfigure::Overlay,
            Self::ScoreThreshold(_) | Self::NmsThreshold(_) | Self::DrawOverlay(_) => {
                Reconfigure::None
            }
        }
    }
}

fn check_regular_file(property: &'static str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(DetectorError::config(
            property,
            format!("file '{}' not found", path.display()),
        ))
    }
}

/// 检测元件的全部属性
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DetectorConfig {
    model_file: Option<PathBuf>,
    label_file: Option<PathBuf>,
    score_threshold: f32,
    nms_threshold: f32,
    device_id: i32,
    optimization_level: OptimizationLevel,
    execution_provider: ExecutionProvider,
    detection_model: ModelType,
    intra_threads: Option<usize>,
    draw_overlay: bool,
    overlay_font: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_file: None,
            label_file: None,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            device_id: 0,
            optimization_level: OptimizationLevel::default(),
            execution_provider: ExecutionProvider::default(),
            detection_model: ModelType::default(),
            intra_threads: None,
            draw_overlay: false,
            overlay_font: None,
        }
    }
}

impl DetectorConfig {
    /// 从JSON文件加载配置, 每个字段都会重新校验
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            DetectorError::config("config-file", format!("{}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            DetectorError::config("config-file", format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        info!("配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DetectorError::config("config-file", e.to_string()))?;
        fs::write(path, json).map_err(|e| {
            DetectorError::config("config-file", format!("{}: {e}", path.display()))
        })?;
        debug!("配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for property in self.properties() {
            property.validate()?;
        }
        Ok(())
    }

    fn properties(&self) -> Vec<Property> {
        let mut props = vec![
            Property::ScoreThreshold(self.score_threshold),
            Property::NmsThreshold(self.nms_threshold),
            Property::DeviceId(self.device_id),
            Property::OptimizationLevel(self.optimization_level),
            Property::ExecutionProvider(self.execution_provider),
            Property::DetectionModel(self.detection_model),
            Property::IntraThreads(self.intra_threads),
            Property::DrawOverlay(self.draw_overlay),
            Property::OverlayFont(self.overlay_font.clone()),
        ];
        if let Some(path) = &self.model_file {
            props.push(Property::ModelFile(path.clone()));
        }
        if let Some(path) = &self.label_file {
            props.push(Property::LabelFile(path.clone()));
        }
        props
    }

    /// 校验并提交一个属性, 返回它对元件的影响
    ///
    /// 新值与旧值相同时返回 `Reconfigure::None`.
    pub fn apply(&mut self, property: Property) -> Result<Reconfigure> {
        property.validate()?;
        let effect = property.reconfigure();
        let changed = match property {
            Property::ModelFile(v) => replace(&mut self.model_file, Some(v)),
            Property::LabelFile(v) => replace(&mut self.label_file, Some(v)),
            Property::ScoreThreshold(v) => replace(&mut self.score_threshold, v),
            Property::NmsThreshold(v) => replace(&mut self.nms_threshold, v),
            Property::DeviceId(v) => replace(&mut self.device_id, v),
            Property::OptimizationLevel(v) => replace(&mut self.optimization_level, v),
            Property::ExecutionProvider(v) => replace(&mut self.execution_provider, v),
            Property::DetectionModel(v) => replace(&mut self.detection_model, v),
            Property::IntraThreads(v) => replace(&mut self.intra_threads, v),
            Property::DrawOverlay(v) => replace(&mut self.draw_overlay, v),
            Property::OverlayFont(v) => replace(&mut self.overlay_font, v),
        };
        Ok(if changed { effect } else { Reconfigure::None })
    }

    pub fn set_model_file(&mut self, path: impl Into<PathBuf>) -> Result<Reconfigure> {
        self.apply(Property::ModelFile(path.into()))
    }

    pub fn set_label_file(&mut self, path: impl Into<PathBuf>) -> Result<Reconfigure> {
        self.apply(Property::LabelFile(path.into()))
    }

    pub fn set_score_threshold(&mut self, value: f32) -> Result<Reconfigure> {
        self.apply(Property::ScoreThreshold(value))
    }

    pub fn set_nms_threshold(&mut self, value: f32) -> Result<Reconfigure> {
        self.apply(Property::NmsThreshold(value))
    }

    pub fn set_device_id(&mut self, value: i32) -> Result<Reconfigure> {
        self.apply(Property::DeviceId(value))
    }

    pub fn set_optimization_level(&mut self, value: OptimizationLevel) -> Result<Reconfigure> {
        self.apply(Property::OptimizationLevel(value))
    }

    pub fn set_execution_provider(&mut self, value: ExecutionProvider) -> Result<Reconfigure> {
        self.apply(Property::ExecutionProvider(value))
    }

    pub fn set_detection_model(&mut self, value: ModelType) -> Result<Reconfigure> {
        self.apply(Property::DetectionModel(value))
    }

    /// `None` 表示使用运行时默认线程数
    pub fn set_intra_threads(&mut self, value: Option<usize>) -> Result<Reconfigure> {
        self.apply(Property::IntraThreads(value))
    }

    pub fn set_draw_overlay(&mut self, value: bool) -> Result<Reconfigure> {
        self.apply(Property::DrawOverlay(value))
    }

    pub fn set_overlay_font(&mut self, path: Option<PathBuf>) -> Result<Reconfigure> {
        self.apply(Property::OverlayFont(path))
    }

    pub fn model_file(&self) -> Option<&Path> {
        self.model_file.as_deref()
    }

    pub fn label_file(&self) -> Option<&Path> {
        self.label_file.as_deref()
    }

    pub fn score_threshold(&self) -> f32 {
        self.score_threshold
    }

    pub fn nms_threshold(&self) -> f32 {
        self.nms_threshold
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn optimization_level(&self) -> OptimizationLevel {
        self.optimization_level
    }

    pub fn execution_provider(&self) -> ExecutionProvider {
        self.execution_provider
    }

    pub fn detection_model(&self) -> ModelType {
        self.detection_model
    }

    pub fn intra_threads(&self) -> Option<usize> {
        self.intra_threads
    }

    pub fn draw_overlay(&self) -> bool {
        self.draw_overlay
    }

    pub fn overlay_font(&self) -> Option<&Path> {
        self.overlay_font.as_deref()
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            provider: self.execution_provider,
            device_id: self.device_id,
            optimization_level: self.optimization_level,
            intra_threads: self.intra_threads,
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.score_threshold(), 0.25);
        assert_eq!(config.nms_threshold(), 0.213);
        assert_eq!(config.detection_model(), ModelType::YOLOv4);
        let settings = config.execution_settings();
        assert_eq!(settings.provider, ExecutionProvider::Cpu);
        assert_eq!(settings.optimization_level, OptimizationLevel::Extended);
        assert_eq!(settings.device_id, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_out_of_range_keeps_previous_value() {
        let mut config = DetectorConfig::default();
        config.set_score_threshold(0.6).unwrap();
        let err = config.set_score_threshold(1.5).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::Config {
                property: "score-threshold",
                ..
            }
        ));
        assert_eq!(config.score_threshold(), 0.6);
        assert!(config.set_nms_threshold(f32::NAN).is_err());
        assert!(config.set_nms_threshold(-0.01).is_err());
        assert_eq!(config.nms_threshold(), DEFAULT_NMS_THRESHOLD);
    }

    #[test]
    fn test_missing_model_file_rejected() {
        let mut config = DetectorConfig::default();
        let err = config
            .set_model_file("/definitely/not/here/yolov4.onnx")
            .unwrap_err();
        assert!(matches!(err, DetectorError::Config { property: "model-file", .. }));
        assert!(config.model_file().is_none());
    }

    #[test]
    fn test_reconfigure_effects() {
        let mut config = DetectorConfig::default();
        assert_eq!(config.set_score_threshold(0.4).unwrap(), Reconfigure::None);
        assert_eq!(
            config.set_optimization_level(OptimizationLevel::All).unwrap(),
            Reconfigure::Session
        );
        // 相同的值不触发重建
        assert_eq!(
            config.set_optimization_level(OptimizationLevel::All).unwrap(),
            Reconfigure::None
        );
        assert_eq!(
            config.set_execution_provider(ExecutionProvider::Cuda).unwrap(),
            Reconfigure::Session
        );
        assert!(config.set_device_id(-1).is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(config.set_label_file(file.path()).unwrap(), Reconfigure::Model);
    }

    #[test]
    fn test_typed_accessors() {
        let mut config = DetectorConfig::default();
        assert_eq!(config.intra_threads(), None);

        config.set_device_id(1).unwrap();
        config.set_optimization_level(OptimizationLevel::Basic).unwrap();
        config.set_execution_provider(ExecutionProvider::Cuda).unwrap();
        assert_eq!(config.set_intra_threads(Some(4)).unwrap(), Reconfigure::Session);
        assert_eq!(config.set_draw_overlay(true).unwrap(), Reconfigure::None);
        assert!(config.set_intra_threads(Some(0)).is_err());

        assert_eq!(config.device_id(), 1);
        assert_eq!(config.optimization_level(), OptimizationLevel::Basic);
        assert_eq!(config.execution_provider(), ExecutionProvider::Cuda);
        assert_eq!(config.intra_threads(), Some(4));
        assert!(config.draw_overlay());

        let font = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            config.set_overlay_font(Some(font.path().to_path_buf())).unwrap(),
            Reconfigure::Overlay
        );
        assert_eq!(config.overlay_font(), Some(font.path()));
        assert!(config
            .set_overlay_font(Some(PathBuf::from("/nonexistent/font.ttf")))
            .is_err());
        assert_eq!(config.overlay_font(), Some(font.path()));
        config.set_overlay_font(None).unwrap();
        assert_eq!(config.overlay_font(), None);
    }

    #[test]
    fn test_parse_by_name() {
        assert_eq!(
            Property::parse("optimization-level", "enable-basic").unwrap(),
            Property::OptimizationLevel(OptimizationLevel::Basic)
        );
        assert_eq!(
            Property::parse("execution-provider", "gpu-cuda").unwrap(),
            Property::ExecutionProvider(ExecutionProvider::Cuda)
        );
        assert_eq!(
            Property::parse("detection-model", "yolov4").unwrap(),
            Property::DetectionModel(ModelType::YOLOv4)
        );
        assert_eq!(
            Property::parse("nms-threshold", " 0.45 ").unwrap(),
            Property::NmsThreshold(0.45)
        );
        assert_eq!(
            Property::parse("intra-threads", "auto").unwrap(),
            Property::IntraThreads(None)
        );
        assert!(Property::parse("intra-threads", "0").is_err());
        assert!(Property::parse("score-threshold", "abc").is_err());
        assert!(Property::parse("silent", "true").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detector.json");

        let mut config = DetectorConfig::default();
        config.set_score_threshold(0.5).unwrap();
        config.set_optimization_level(OptimizationLevel::All).unwrap();
        config.save(&path).unwrap();

        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"score-threshold\": 0.5"));
        assert!(json.contains("\"optimization-level\": \"all\""));

        let loaded = DetectorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{ "nms-threshold": 3.0 }"#).unwrap();
        assert!(matches!(
            DetectorConfig::load(&path),
            Err(DetectorError::Config {
                property: "nms-threshold",
                ..
            })
        ));
    }
}
