// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 模型与标签加载
//
// 负责把 model-file / label-file 读进内存并校验, 产出不可变的 ModelConfig.
// ModelConfig 一旦构建就不会被修改, 正在处理的帧通过 Arc 持有它.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{DetectorError, Result};
use crate::models::{InputShape, ModelType, Postprocessor};

/// 已加载的模型 + 标签
#[derive(Clone)]
pub struct ModelConfig {
    model_path: PathBuf,
    label_path: PathBuf,
    family: ModelType,
    model_bytes: Arc<[u8]>,
    labels: Arc<[String]>,
    postprocessor: Arc<dyn Postprocessor>,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("model_path", &self.model_path)
            .field("label_path", &self.label_path)
            .field("family", &self.family)
            .field("model_bytes", &self.model_bytes.len())
            .field("labels", &self.labels.len())
            .finish()
    }
}

impl ModelConfig {
    /// 读取模型与标签文件
    ///
    /// 校验失败 (文件缺失, 扩展名不对, 标签数量与模型族不符) 返回 `ModelLoad`
    pub fn load(
        model_path: impl AsRef<Path>,
        label_path: impl AsRef<Path>,
        family: ModelType,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let label_path = label_path.as_ref();
        let postprocessor = family.postprocessor();

        let model_bytes = read_model(model_path)?;
        let labels = load_labels(label_path, postprocessor.num_classes())?;

        info!(
            "模型已加载: {} ({} bytes, {}), {} 个类别",
            model_path.display(),
            model_bytes.len(),
            family,
            labels.len()
        );

        Ok(Self {
            model_path: model_path.to_path_buf(),
            label_path: label_path.to_path_buf(),
            family,
            model_bytes: model_bytes.into(),
            labels: labels.into(),
            postprocessor,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn label_path(&self) -> &Path {
        &self.label_path
    }

    pub fn family(&self) -> ModelType {
        self.family
    }

    pub fn model_bytes(&self) -> &[u8] {
        &self.model_bytes
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, class_id: usize) -> Option<&str> {
        self.labels.get(class_id).map(String::as_str)
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn input_shape(&self) -> InputShape {
        self.postprocessor.input_shape()
    }

    pub fn postprocessor(&self) -> &dyn Postprocessor {
        self.postprocessor.as_ref()
    }
}

fn read_model(path: &Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(DetectorError::ModelLoad(format!(
            "model file '{}' not found",
            path.display()
        )));
    }
    let is_onnx = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("onnx"));
    if !is_onnx {
        return Err(DetectorError::ModelLoad(format!(
            "model file '{}' is not an .onnx file",
            path.display()
        )));
    }
    let bytes = fs::read(path)
        .map_err(|e| DetectorError::ModelLoad(format!("{}: {e}", path.display())))?;
    if bytes.is_empty() {
        return Err(DetectorError::ModelLoad(format!(
            "model file '{}' is empty",
            path.display()
        )));
    }
    Ok(bytes)
}

/// 读取标签文件: 每行一个类别名, 行号即类别号
///
/// 行尾空白被去掉; 文件末尾的空行被忽略, 中间的空行视为格式错误.
/// 标签数量必须等于 `expected`.
pub fn load_labels(path: impl AsRef<Path>, expected: usize) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| DetectorError::ModelLoad(format!("label file {}: {e}", path.display())))?;

    let mut labels: Vec<String> = text.lines().map(|l| l.trim_end().to_string()).collect();
    while labels.last().is_some_and(|l| l.is_empty()) {
        labels.pop();
    }

    if let Some(line) = labels.iter().position(|l| l.is_empty()) {
        return Err(DetectorError::ModelLoad(format!(
            "malformed label file {}: empty label on line {}",
            path.display(),
            line + 1
        )));
    }
    if labels.len() != expected {
        return Err(DetectorError::ModelLoad(format!(
            "label file {} has {} labels, model expects {}",
            path.display(),
            labels.len(),
            expected
        )));
    }

    debug!("标签已加载: {} ({} 个)", path.display(), labels.len());
    Ok(labels)
}
