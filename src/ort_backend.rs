// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
//
// Engine 是推理会话的抽象, EngineFactory 负责按 ModelConfig + ExecutionSettings
// 构建会话. 生产环境使用 OrtEngineFactory, 测试可以注入自己的工厂.

use std::fmt;

use ndarray::{Array, IxDyn};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider as _};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::{debug, info, warn};

use crate::config::{ExecutionProvider, ExecutionSettings, OptimizationLevel};
use crate::error::{DetectorError, Result};
use crate::model_store::ModelConfig;
use crate::models::Tensor;

/// 推理会话
pub trait Engine: Send {
    /// 输入张量维度 (动态维度为 -1)
    fn input_dims(&self) -> &[i64];

    /// 各输出张量维度 (动态维度为 -1)
    fn output_dims(&self) -> &[Vec<i64>];

    /// 执行一次前向推理
    fn run(&mut self, xs: &Tensor) -> Result<Vec<Tensor>>;
}

/// 推理会话工厂
pub trait EngineFactory: Send + Sync {
    fn build(&self, model: &ModelConfig, settings: &ExecutionSettings) -> Result<Box<dyn Engine>>;
}

/// 构建会话并检查模型几何与模型族/标签是否一致
pub fn build_engine(
    factory: &dyn EngineFactory,
    model: &ModelConfig,
    settings: &ExecutionSettings,
) -> Result<Box<dyn Engine>> {
    let engine = factory.build(model, settings)?;
    validate_geometry(engine.as_ref(), model)?;
    Ok(engine)
}

fn dim_matches(actual: i64, expected: usize) -> bool {
    actual < 0 || actual as usize == expected
}

fn validate_geometry(engine: &dyn Engine, model: &ModelConfig) -> Result<()> {
    let post = model.postprocessor();
    let family = post.model_type();

    let expected_input = model.input_shape().dims();
    let input = engine.input_dims();
    if input.len() != expected_input.len()
        || !input
            .iter()
            .zip(expected_input.iter())
            .all(|(&a, &e)| dim_matches(a, e))
    {
        return Err(DetectorError::ModelLoad(format!(
            "model input {input:?} does not match {family} input {expected_input:?}"
        )));
    }

    let expected_outputs = post.output_shapes();
    let outputs = engine.output_dims();
    if outputs.len() != expected_outputs.len() {
        return Err(DetectorError::ModelLoad(format!(
            "model has {} outputs, {family} expects {}",
            outputs.len(),
            expected_outputs.len()
        )));
    }

    let num_classes = model.num_classes();
    for dims in outputs {
        let Some(&features) = dims.last() else {
            return Err(DetectorError::ModelLoad("model output has no dimensions".into()));
        };
        if features >= 0 && features as usize != 5 + num_classes {
            return Err(DetectorError::ModelLoad(format!(
                "model output {dims:?} has {} classes, label file has {num_classes}",
                features - 5
            )));
        }
        let rank_ok = expected_outputs.iter().any(|e| {
            e.len() == dims.len() && dims.iter().zip(e.iter()).all(|(&a, &x)| dim_matches(a, x))
        });
        if !rank_ok {
            return Err(DetectorError::ModelLoad(format!(
                "model output {dims:?} does not match any {family} output {expected_outputs:?}"
            )));
        }
    }
    Ok(())
}

// ========== ONNX Runtime 实现 ==========

/// ONNX Runtime 执行设备
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
}

impl fmt::Display for OrtEP {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CPU => f.write_str("CPU"),
            Self::CUDA(id) => write!(f, "CUDA:{id}"),
        }
    }
}

/// 会话构建参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrtConfig {
    pub ep: OrtEP,
    pub optimization_level: OptimizationLevel,
    pub intra_threads: Option<usize>,
}

impl From<&ExecutionSettings> for OrtConfig {
    fn from(settings: &ExecutionSettings) -> Self {
        let ep = match settings.provider {
            ExecutionProvider::Cpu => OrtEP::CPU,
            ExecutionProvider::Cuda => OrtEP::CUDA(settings.device_id),
        };
        Self {
            ep,
            optimization_level: settings.optimization_level,
            intra_threads: settings.intra_threads,
        }
    }
}

fn graph_level(level: OptimizationLevel) -> GraphOptimizationLevel {
    match level {
        OptimizationLevel::DisableAll => GraphOptimizationLevel::Disable,
        OptimizationLevel::Basic => GraphOptimizationLevel::Level1,
        OptimizationLevel::Extended => GraphOptimizationLevel::Level2,
        OptimizationLevel::All => GraphOptimizationLevel::Level3,
    }
}

fn backend_err(e: impl fmt::Display) -> DetectorError {
    DetectorError::BackendInit(e.to_string())
}

fn inference_err(e: impl fmt::Display) -> DetectorError {
    DetectorError::Inference(e.to_string())
}

/// ONNX Runtime 推理会话
pub struct OrtBackend {
    session: Session,
    input_name: String,
    input_dims: Vec<i64>,
    output_names: Vec<String>,
    output_dims: Vec<Vec<i64>>,
}

impl OrtBackend {
    pub fn build(model_bytes: &[u8], config: OrtConfig) -> Result<Self> {
        let mut builder = Session::builder()
            .map_err(backend_err)?
            .with_optimization_level(graph_level(config.optimization_level))
            .map_err(backend_err)?;

        if let Some(n) = config.intra_threads {
            builder = builder.with_intra_threads(n).map_err(backend_err)?;
        }

        if let OrtEP::CUDA(device_id) = config.ep {
            let cuda = CUDAExecutionProvider::default().with_device_id(device_id);
            if !cuda.is_available().unwrap_or(false) {
                return Err(DetectorError::BackendInit(format!(
                    "CUDA execution provider is not available (device {device_id})"
                )));
            }
            builder = builder
                .with_execution_providers([cuda.build().error_on_failure()])
                .map_err(backend_err)?;
        }

        let session = builder
            .commit_from_memory(model_bytes)
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;

        if session.inputs.len() != 1 {
            return Err(DetectorError::ModelLoad(format!(
                "model must have exactly one input, found {}",
                session.inputs.len()
            )));
        }
        let input = &session.inputs[0];
        let input_name = input.name.clone();
        let mut input_dims = tensor_dims(&input.input_type, &input_name)?;
        // 动态批大小固定为 1
        if input_dims.first() == Some(&-1) {
            debug!("输入 `{}` 的批大小是动态的, 固定为 1", input_name);
            input_dims[0] = 1;
        }

        let mut output_names = Vec::with_capacity(session.outputs.len());
        let mut output_dims = Vec::with_capacity(session.outputs.len());
        for output in &session.outputs {
            output_dims.push(tensor_dims(&output.output_type, &output.name)?);
            output_names.push(output.name.clone());
        }

        info!(
            "ONNX Runtime 会话已创建: ep={}, opt={}, input `{}` {:?}, outputs {:?}",
            config.ep, config.optimization_level, input_name, input_dims, output_dims
        );

        Ok(Self {
            session,
            input_name,
            input_dims,
            output_names,
            output_dims,
        })
    }
}

fn tensor_dims(ty: &ort::value::ValueType, name: &str) -> Result<Vec<i64>> {
    ty.tensor_shape()
        .map(|shape| shape.iter().copied().collect())
        .ok_or_else(|| DetectorError::ModelLoad(format!("`{name}` is not a tensor")))
}

impl Engine for OrtBackend {
    fn input_dims(&self) -> &[i64] {
        &self.input_dims
    }

    fn output_dims(&self) -> &[Vec<i64>] {
        &self.output_dims
    }

    fn run(&mut self, xs: &Tensor) -> Result<Vec<Tensor>> {
        let input = xs.as_standard_layout();
        let tensor = TensorRef::from_array_view(&input).map_err(inference_err)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(inference_err)?;

        let mut ys = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = outputs
                .get(name.as_str())
                .ok_or_else(|| DetectorError::Inference(format!("output `{name}` not found")))?;
            let (shape, data) = value.try_extract_tensor::<f32>().map_err(inference_err)?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            let y = Array::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(inference_err)?;
            ys.push(y);
        }
        Ok(ys)
    }
}

/// 基于 ONNX Runtime 的会话工厂
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtEngineFactory;

impl EngineFactory for OrtEngineFactory {
    fn build(&self, model: &ModelConfig, settings: &ExecutionSettings) -> Result<Box<dyn Engine>> {
        let config = OrtConfig::from(settings);
        match OrtBackend::build(model.model_bytes(), config) {
            Ok(backend) => Ok(Box::new(backend)),
            Err(e) => {
                warn!("创建推理会话失败 ({}): {}", config.ep, e);
                Err(e)
            }
        }
    }
}
