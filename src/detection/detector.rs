// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测元件 (Detector)
//! 职责: 视频帧 → 预处理 → 推理 → 解码 → 坐标还原 → NMS → 附加检测结果
//!
//! 状态机: Unconfigured → Configuring → Ready ⇄ Processing → TornDown
//!
//! - 帧由宿主线程逐个送入 [`Detector::process`], 元件不创建工作线程
//! - 属性可以从其他线程设置: Ready 时同步生效, Processing 时排队到帧边界
//! - 当前模型/会话以 `Arc` 快照给正在处理的帧, 替换或拆除不会打断它

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::types::{Candidate, Detection, DetectionMeta, Frame, VideoInfo};
use crate::config::{DetectorConfig, ExecutionSettings, Property, Reconfigure};
use crate::error::{DetectorError, Result};
use crate::model_store::ModelConfig;
use crate::nms::non_max_suppression;
use crate::ort_backend::{build_engine, Engine, EngineFactory, OrtEngineFactory};
use crate::overlay::Overlay;
use crate::preprocess;

/// 事件队列容量, 队列满时丢弃新事件
const EVENT_QUEUE_CAPACITY: usize = 64;

/// 元件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElementState {
    Unconfigured,
    Configuring,
    Ready,
    Processing,
    TornDown,
}

/// 单帧处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// 检测结果已附加到帧上 (可能为空列表)
    Annotated { detections: usize },
    /// 元件未配置, 帧原样转发
    PassThrough,
    /// 本帧处理失败, 帧原样转发
    Unannotated(DetectorError),
}

/// 元件事件 (供宿主观察)
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    Configured {
        model: String,
        settings: ExecutionSettings,
    },
    Renegotiated {
        from: Option<VideoInfo>,
        to: VideoInfo,
    },
    FrameFailed {
        pts: Option<Duration>,
        error: DetectorError,
    },
    /// 排队的属性在帧边界应用失败
    PropertyRejected {
        property: &'static str,
        error: DetectorError,
    },
}

/// 统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DetectorStats {
    pub processed: u64,
    pub annotated: u64,
    pub passthrough: u64,
    pub failed: u64,
    pub sessions_built: u64,
    pub last_preprocess_ms: f64,
    pub last_inference_ms: f64,
    pub last_postprocess_ms: f64,
}

/// 已配置好的模型 + 会话
struct ActiveModel {
    model: Arc<ModelConfig>,
    settings: ExecutionSettings,
    engine: Mutex<Box<dyn Engine>>,
}

struct Inner {
    state: ElementState,
    config: DetectorConfig,
    video: Option<VideoInfo>,
    overlay: Arc<Overlay>,
    pending: Vec<Property>,
    // 懒配置失败后不再逐帧重试, 直到属性发生变化
    configure_failed: bool,
    stats: DetectorStats,
}

/// 每帧从配置中取出的参数快照
struct FrameParams {
    score_threshold: f32,
    nms_threshold: f32,
    overlay: Option<Arc<Overlay>>,
}

struct Timings {
    preprocess_ms: f64,
    inference_ms: f64,
    postprocess_ms: f64,
}

enum Begin {
    Run(Arc<ActiveModel>, FrameParams),
    Skip(FrameOutcome),
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

pub struct Detector {
    inner: Mutex<Inner>,
    active: RwLock<Option<Arc<ActiveModel>>>,
    factory: Arc<dyn EngineFactory>,
    events_tx: Sender<DetectorEvent>,
    events_rx: Receiver<DetectorEvent>,
}

impl Detector {
    /// 使用 ONNX Runtime 后端
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_factory(config, Arc::new(OrtEngineFactory))
    }

    /// 使用自定义推理后端
    pub fn with_factory(config: DetectorConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_QUEUE_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                state: ElementState::Unconfigured,
                config,
                video: None,
                overlay: Arc::new(Overlay::boxes_only()),
                pending: Vec::new(),
                configure_failed: false,
                stats: DetectorStats::default(),
            }),
            active: RwLock::new(None),
            factory,
            events_tx,
            events_rx,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_snapshot(&self) -> Option<Arc<ActiveModel>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap_active(&self, active: Option<Arc<ActiveModel>>) -> Option<Arc<ActiveModel>> {
        let mut slot = self.active.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, active)
    }

    fn emit(&self, event: DetectorEvent) {
        if let Err(TrySendError::Full(event)) = self.events_tx.try_send(event) {
            trace!("事件队列已满, 丢弃事件: {:?}", event);
        }
    }

    // ========== 查询 ==========

    pub fn state(&self) -> ElementState {
        self.lock_inner().state
    }

    pub fn config(&self) -> DetectorConfig {
        self.lock_inner().config.clone()
    }

    pub fn video_info(&self) -> Option<VideoInfo> {
        self.lock_inner().video
    }

    pub fn stats(&self) -> DetectorStats {
        self.lock_inner().stats
    }

    /// 事件接收端 (可克隆给多个观察者, 每个事件只会被取走一次)
    pub fn events(&self) -> Receiver<DetectorEvent> {
        self.events_rx.clone()
    }

    /// 当前模型的类别标签
    pub fn labels(&self) -> Option<Vec<String>> {
        self.active_snapshot()
            .map(|active| active.model.labels().to_vec())
    }

    // ========== 生命周期 ==========

    /// 加载模型并创建推理会话
    ///
    /// 已经就绪时直接返回; 失败时保持 Unconfigured 并返回错误
    pub fn configure(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        match inner.state {
            ElementState::TornDown => Err(DetectorError::TornDown),
            ElementState::Unconfigured => {
                let result = self.configure_locked(&mut inner);
                inner.configure_failed = result.is_err();
                result
            }
            _ => Ok(()),
        }
    }

    fn configure_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.config.model_file().is_none() || inner.config.label_file().is_none() {
            return Err(DetectorError::config(
                "model-file",
                "model-file and label-file must both be set before configuring",
            ));
        }

        inner.state = ElementState::Configuring;
        let loaded = Overlay::load(inner.config.overlay_font())
            .and_then(|overlay| Ok((overlay, self.build_active(&inner.config, None)?)));

        match loaded {
            Ok((overlay, active)) => {
                inner.overlay = Arc::new(overlay);
                inner.stats.sessions_built += 1;
                self.install(active);
                inner.state = ElementState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("配置失败: {}", e);
                inner.state = ElementState::Unconfigured;
                Err(e)
            }
        }
    }

    /// 构建新的模型 + 会话; `reuse` 为 Some 时只重建会话
    fn build_active(
        &self,
        config: &DetectorConfig,
        reuse: Option<Arc<ModelConfig>>,
    ) -> Result<Arc<ActiveModel>> {
        let model = match reuse {
            Some(model) => model,
            None => {
                let (Some(model_file), Some(label_file)) =
                    (config.model_file(), config.label_file())
                else {
                    return Err(DetectorError::config("model-file", "model-file is not set"));
                };
                Arc::new(ModelConfig::load(
                    model_file,
                    label_file,
                    config.detection_model(),
                )?)
            }
        };
        let settings = config.execution_settings();
        let engine = build_engine(self.factory.as_ref(), &model, &settings)?;
        Ok(Arc::new(ActiveModel {
            model,
            settings,
            engine: Mutex::new(engine),
        }))
    }

    fn install(&self, active: Arc<ActiveModel>) {
        let event = DetectorEvent::Configured {
            model: active.model.model_path().display().to_string(),
            settings: active.settings,
        };
        info!(
            "检测元件已就绪: {} ({}, {} 类, ep={}, opt={})",
            active.model.model_path().display(),
            active.model.family(),
            active.model.num_classes(),
            active.settings.provider,
            active.settings.optimization_level
        );
        // 旧会话在最后一个持有它的帧结束后释放
        drop(self.swap_active(Some(active)));
        self.emit(event);
    }

    /// 拆除: 释放模型与会话, 之后所有调用返回 `TornDown`
    ///
    /// 正在推理的帧持有自己的快照, 会正常完成
    pub fn teardown(&self) {
        let mut inner = self.lock_inner();
        if inner.state == ElementState::TornDown {
            return;
        }
        inner.state = ElementState::TornDown;
        inner.pending.clear();
        drop(self.swap_active(None));
        info!("检测元件已拆除");
    }

    /// 协商视频格式
    pub fn negotiate(&self, info: VideoInfo) -> Result<()> {
        if info.width == 0 || info.height == 0 {
            return Err(DetectorError::InvalidFrame(format!(
                "cannot negotiate empty frame {}x{}",
                info.width, info.height
            )));
        }
        let mut inner = self.lock_inner();
        if inner.state == ElementState::TornDown {
            return Err(DetectorError::TornDown);
        }
        self.renegotiate(&mut inner, info);
        Ok(())
    }

    fn renegotiate(&self, inner: &mut Inner, info: VideoInfo) {
        if inner.video == Some(info) {
            return;
        }
        let from = inner.video.replace(info);
        info!(
            "视频格式协商: {}x{} {:?}",
            info.width, info.height, info.format
        );
        self.emit(DetectorEvent::Renegotiated { from, to: info });
    }

    // ========== 属性 ==========

    /// 设置一个属性
    ///
    /// - 取值非法: 返回 `Config`, 旧值保留
    /// - Ready: 同步生效, 必要时重建会话; 重建失败时回滚属性并保留旧会话
    /// - Processing: 排队, 在当前帧结束时应用
    pub fn set_property(&self, property: Property) -> Result<()> {
        property.validate()?;
        let mut inner = self.lock_inner();
        match inner.state {
            ElementState::TornDown => Err(DetectorError::TornDown),
            ElementState::Processing => {
                debug!("帧处理中, 属性 `{}` 排队到帧边界", property.name());
                inner.pending.push(property);
                Ok(())
            }
            ElementState::Ready => self.apply_ready(&mut inner, property),
            ElementState::Unconfigured | ElementState::Configuring => {
                inner.config.apply(property)?;
                inner.configure_failed = false;
                Ok(())
            }
        }
    }

    /// 按属性名和字符串值设置 (例如 `"nms-threshold"`, `"0.45"`)
    pub fn set_property_by_name(&self, name: &str, value: &str) -> Result<()> {
        self.set_property(Property::parse(name, value)?)
    }

    fn apply_ready(&self, inner: &mut Inner, property: Property) -> Result<()> {
        let name = property.name();
        let previous = inner.config.clone();
        let effect = inner.config.apply(property)?;

        let result = match effect {
            Reconfigure::None => Ok(()),
            Reconfigure::Overlay => Overlay::load(inner.config.overlay_font()).map(|overlay| {
                inner.overlay = Arc::new(overlay);
            }),
            Reconfigure::Session | Reconfigure::Model => {
                inner.state = ElementState::Configuring;
                let reuse = match effect {
                    Reconfigure::Session => self.active_snapshot().map(|a| a.model.clone()),
                    _ => None,
                };
                let rebuilt = self.build_active(&inner.config, reuse);
                inner.state = ElementState::Ready;
                rebuilt.map(|active| {
                    inner.stats.sessions_built += 1;
                    self.install(active);
                })
            }
        };

        if let Err(e) = &result {
            warn!("属性 `{}` 应用失败, 保留原配置: {}", name, e);
            inner.config = previous;
        } else {
            debug!("属性 `{}` 已应用 ({:?})", name, effect);
        }
        result
    }

    // ========== 逐帧处理 ==========

    /// 处理一帧: 原地附加检测结果 (以及可选的叠加绘制)
    ///
    /// 单帧失败不会返回 `Err`, 而是 `FrameOutcome::Unannotated` 并发出
    /// `FrameFailed` 事件; 只有拆除后调用才返回 `Err(TornDown)`.
    pub fn process(&self, frame: &mut Frame) -> Result<FrameOutcome> {
        let (active, params) = match self.begin_frame(frame)? {
            Begin::Run(active, params) => (active, params),
            Begin::Skip(outcome) => return Ok(outcome),
        };

        let result = Self::detect(&active, frame, &params);
        drop(active);

        let outcome = match result {
            Ok((detections, timings)) => {
                if let Some(overlay) = &params.overlay {
                    overlay.draw(frame, &detections);
                }
                let count = detections.len();
                frame.attach_detections(DetectionMeta {
                    detections,
                    inference_ms: timings.inference_ms,
                });
                self.end_frame(|stats| {
                    stats.annotated += 1;
                    stats.last_preprocess_ms = timings.preprocess_ms;
                    stats.last_inference_ms = timings.inference_ms;
                    stats.last_postprocess_ms = timings.postprocess_ms;
                });
                FrameOutcome::Annotated { detections: count }
            }
            Err(error) => {
                warn!("帧处理失败, 原样转发: {}", error);
                self.emit(DetectorEvent::FrameFailed {
                    pts: frame.pts(),
                    error: error.clone(),
                });
                self.end_frame(|stats| stats.failed += 1);
                FrameOutcome::Unannotated(error)
            }
        };
        Ok(outcome)
    }

    fn begin_frame(&self, frame: &Frame) -> Result<Begin> {
        let mut inner = self.lock_inner();
        if inner.state == ElementState::TornDown {
            return Err(DetectorError::TornDown);
        }
        inner.stats.processed += 1;

        if inner.state == ElementState::Unconfigured {
            let files_set =
                inner.config.model_file().is_some() && inner.config.label_file().is_some();
            if !files_set || inner.configure_failed {
                inner.stats.passthrough += 1;
                return Ok(Begin::Skip(FrameOutcome::PassThrough));
            }
            debug!("首帧触发懒配置");
            if let Err(error) = self.configure_locked(&mut inner) {
                inner.configure_failed = true;
                inner.stats.failed += 1;
                self.emit(DetectorEvent::FrameFailed {
                    pts: frame.pts(),
                    error: error.clone(),
                });
                return Ok(Begin::Skip(FrameOutcome::Unannotated(error)));
            }
        }

        self.renegotiate(&mut inner, frame.info());

        let Some(active) = self.active_snapshot() else {
            inner.stats.passthrough += 1;
            return Ok(Begin::Skip(FrameOutcome::PassThrough));
        };
        let params = FrameParams {
            score_threshold: inner.config.score_threshold(),
            nms_threshold: inner.config.nms_threshold(),
            overlay: inner
                .config
                .draw_overlay()
                .then(|| inner.overlay.clone()),
        };
        inner.state = ElementState::Processing;
        Ok(Begin::Run(active, params))
    }

    /// 帧边界: 恢复 Ready 并应用排队的属性
    fn end_frame(&self, update: impl FnOnce(&mut DetectorStats)) {
        let mut inner = self.lock_inner();
        update(&mut inner.stats);
        if inner.state != ElementState::Processing {
            return;
        }
        inner.state = ElementState::Ready;

        let pending = std::mem::take(&mut inner.pending);
        for property in pending {
            let name = property.name();
            if let Err(error) = self.apply_ready(&mut inner, property) {
                self.emit(DetectorEvent::PropertyRejected {
                    property: name,
                    error,
                });
            }
        }
    }

    /// 预处理 → 推理 → 解码 → 坐标还原 → NMS (不持有元件锁)
    fn detect(
        active: &ActiveModel,
        frame: &Frame,
        params: &FrameParams,
    ) -> Result<(Vec<Detection>, Timings)> {
        let model = &active.model;

        let t = Instant::now();
        let (xs, letterbox) = preprocess::prepare(frame, &model.input_shape())?;
        let preprocess_ms = ms(t.elapsed());

        let t = Instant::now();
        let ys = {
            let mut engine = active.engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.run(&xs)?
        };
        let inference_ms = ms(t.elapsed());

        let t = Instant::now();
        let candidates = model.postprocessor().decode(&ys, params.score_threshold)?;
        // NMS 在裁剪后的帧坐标上进行, 保证输出框之间的 IoU 约束
        let in_frame: Vec<Candidate> = candidates
            .iter()
            .map(|c| Candidate::new(letterbox.to_frame(&c.bbox), c.class_id, c.confidence))
            .filter(|c| c.bbox.is_valid())
            .collect();
        let detections: Vec<Detection> = non_max_suppression(&in_frame, params.nms_threshold)
            .into_iter()
            .filter_map(|c| {
                let label = model.label(c.class_id)?;
                Some(Detection {
                    class_id: c.class_id,
                    label: label.to_string(),
                    confidence: c.confidence,
                    bbox: c.bbox,
                })
            })
            .collect();
        let postprocess_ms = ms(t.elapsed());

        debug!(
            "检测: {} 个候选, {} 个结果 | 预处理 {:.1}ms | 推理 {:.1}ms | 后处理 {:.1}ms",
            candidates.len(),
            detections.len(),
            preprocess_ms,
            inference_ms,
            postprocess_ms
        );

        Ok((
            detections,
            Timings {
                preprocess_ms,
                inference_ms,
                postprocess_ms,
            },
        ))
    }
}
