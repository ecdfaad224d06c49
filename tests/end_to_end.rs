// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测元件端到端测试 (合成 YOLOv4 输出, 不需要真实模型)

use std::path::PathBuf;
use std::sync::Arc;

use ndarray::{Array, IxDyn};
use ort_detector::{
    non_max_suppression, Detector, DetectorConfig, DetectorError, Engine, EngineFactory,
    ExecutionSettings, Frame, FrameOutcome, ModelConfig, ModelType, PixelFormat, Property, Tensor,
    VideoInfo,
};

/// 一个 anchor 上的原始输出: (层, 行, 列, anchor, 类别, obj, 类别概率, tx, ty, tw, th)
#[derive(Clone, Copy)]
struct Cell {
    layer: usize,
    row: usize,
    col: usize,
    anchor: usize,
    class_id: usize,
    obj: f32,
    prob: f32,
    txywh: [f32; 4],
}

impl Cell {
    fn new(layer: usize, row: usize, col: usize, class_id: usize, obj: f32, prob: f32) -> Self {
        Self {
            layer,
            row,
            col,
            anchor: 0,
            class_id,
            obj,
            prob,
            txywh: [0.0; 4],
        }
    }
}

const GRIDS: [usize; 3] = [52, 26, 13];

fn yolov4_outputs(cells: &[Cell]) -> Vec<Tensor> {
    let mut outputs: Vec<Tensor> = GRIDS
        .iter()
        .map(|&g| Array::zeros(IxDyn(&[1, g, g, 3, 85])))
        .collect();
    for c in cells {
        let out = &mut outputs[c.layer];
        let at = |k: usize| [0, c.row, c.col, c.anchor, k];
        for (k, v) in c.txywh.iter().enumerate() {
            out[at(k).as_slice()] = *v;
        }
        out[at(4).as_slice()] = c.obj;
        out[at(5 + c.class_id).as_slice()] = c.prob;
    }
    outputs
}

struct SyntheticEngine {
    output_dims: Vec<Vec<i64>>,
    outputs: Vec<Tensor>,
}

impl Engine for SyntheticEngine {
    fn input_dims(&self) -> &[i64] {
        &[1, 416, 416, 3]
    }

    fn output_dims(&self) -> &[Vec<i64>] {
        &self.output_dims
    }

    fn run(&mut self, xs: &Tensor) -> ort_detector::Result<Vec<Tensor>> {
        assert_eq!(xs.shape(), &[1, 416, 416, 3]);
        Ok(self.outputs.clone())
    }
}

struct SyntheticFactory(Vec<Cell>);

impl EngineFactory for SyntheticFactory {
    fn build(
        &self,
        _model: &ModelConfig,
        _settings: &ExecutionSettings,
    ) -> ort_detector::Result<Box<dyn Engine>> {
        Ok(Box::new(SyntheticEngine {
            output_dims: GRIDS
                .iter()
                .map(|&g| vec![-1, g as i64, g as i64, 3, 85])
                .collect(),
            outputs: yolov4_outputs(&self.0),
        }))
    }
}

struct Assets {
    _dir: tempfile::TempDir,
    model: PathBuf,
    labels: PathBuf,
}

fn assets() -> anyhow::Result<Assets> {
    let dir = tempfile::tempdir()?;
    let model = dir.path().join("yolov4.onnx");
    let labels = dir.path().join("coco.names");
    std::fs::write(&model, b"synthetic")?;
    let mut names = vec!["person".to_string(), "bicycle".to_string(), "car".to_string()];
    names.extend((3..80).map(|i| format!("class{i}")));
    std::fs::write(&labels, names.join("\n") + "\n")?;
    Ok(Assets {
        _dir: dir,
        model,
        labels,
    })
}

fn detector(assets: &Assets, cells: Vec<Cell>) -> anyhow::Result<Detector> {
    let mut config = DetectorConfig::default();
    config.set_model_file(&assets.model)?;
    config.set_label_file(&assets.labels)?;
    let detector = Detector::with_factory(config, Arc::new(SyntheticFactory(cells)));
    detector.configure()?;
    Ok(detector)
}

fn grey_frame(width: u32, height: u32) -> anyhow::Result<Frame> {
    let info = VideoInfo::new(width, height, PixelFormat::Bgr);
    Ok(Frame::new(info, vec![114; (width * height * 3) as usize], None)?)
}

#[test]
fn test_single_object_640x640_within_one_pixel() -> anyhow::Result<()> {
    let assets = assets()?;
    // 13x13 检测头, 第 6 行第 6 列, anchor (142, 110): 张量坐标中心 (208, 208)
    let detector = detector(&assets, vec![Cell::new(2, 6, 6, 0, 0.95, 0.9)])?;

    let mut frame = grey_frame(640, 640)?;
    let outcome = detector.process(&mut frame)?;
    assert_eq!(outcome, FrameOutcome::Annotated { detections: 1 });

    let meta = frame.detections().expect("detections attached");
    assert_eq!(meta.len(), 1);
    let det = &meta.detections[0];
    assert_eq!(det.class_id, 0);
    assert_eq!(det.label, "person");
    assert!((det.confidence - 0.855).abs() < 1e-5);

    // 缩放比 416 / 640 = 0.65, 无填充
    let scale = 416.0 / 640.0;
    let expected = [
        (208.0 - 71.0) / scale,
        (208.0 - 55.0) / scale,
        142.0 / scale,
        110.0 / scale,
    ];
    let actual = [
        det.bbox.xmin(),
        det.bbox.ymin(),
        det.bbox.width(),
        det.bbox.height(),
    ];
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() <= 1.0, "{actual:?} vs {expected:?}");
    }
    Ok(())
}

#[test]
fn test_letterbox_padding_removed_from_coordinates() -> anyhow::Result<()> {
    let assets = assets()?;
    let detector = detector(&assets, vec![Cell::new(2, 6, 6, 2, 1.0, 0.8)])?;

    // 640x480 → 416x312, 上下各填充 52
    let mut frame = grey_frame(640, 480)?;
    detector.process(&mut frame)?;
    let det = &frame.detections().expect("detections attached").detections[0];
    assert_eq!(det.label, "car");

    let (cx, cy) = det.bbox.cxcy();
    assert!((cx - 320.0).abs() <= 1.0);
    assert!((cy - 240.0).abs() <= 1.0);
    assert!(det.bbox.xmin() >= 0.0 && det.bbox.ymin() >= 0.0);
    assert!(det.bbox.xmax() <= 640.0 && det.bbox.ymax() <= 480.0);
    Ok(())
}

#[test]
fn test_decode_and_nms_round_trip() -> anyhow::Result<()> {
    let assets = assets()?;
    let cells = vec![
        Cell::new(2, 6, 6, 0, 0.9, 0.9),
        // 同一目标在 anchor 2 (459, 401) 上的重复预测, 缩放回 142x110
        Cell {
            anchor: 2,
            txywh: [0.0, 0.0, (142.0f32 / 459.0).ln(), (110.0f32 / 401.0).ln()],
            ..Cell::new(2, 6, 6, 0, 0.8, 0.9)
        },
        // 同位置不同类别不互相抑制
        Cell {
            anchor: 1,
            ..Cell::new(2, 6, 6, 1, 0.9, 0.7)
        },
        // 远处的另一个 person
        Cell::new(1, 3, 20, 0, 0.7, 0.9),
        // 低于阈值
        Cell::new(0, 40, 40, 0, 0.2, 0.9),
    ];

    let detector = detector(&assets, cells.clone())?;
    let mut frame = grey_frame(416, 416)?;
    detector.process(&mut frame)?;
    let meta = frame.detections().expect("detections attached");

    let mut labels: Vec<&str> = meta.detections.iter().map(|d| d.label.as_str()).collect();
    labels.sort_unstable();
    assert_eq!(labels, vec!["bicycle", "person", "person"]);

    // 按置信度降序
    let scores: Vec<f32> = meta.detections.iter().map(|d| d.confidence).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));

    // 直接解码 + NMS 得到相同数量, 再次 NMS 不改变结果
    let postprocessor = ModelType::YOLOv4.postprocessor();
    let candidates = postprocessor.decode(&yolov4_outputs(&cells), 0.25)?;
    assert_eq!(candidates.len(), 4);
    let once = non_max_suppression(&candidates, 0.213);
    assert_eq!(once.len(), 3);
    assert_eq!(non_max_suppression(&once, 0.213), once);
    Ok(())
}

#[test]
fn test_nms_applies_to_clipped_boxes() -> anyhow::Result<()> {
    let assets = assets()?;
    let cells = vec![
        // 张量坐标 x ∈ [-184, 216], 裁剪到帧后为 [0, 216]
        Cell {
            txywh: [0.0, 0.0, (400.0f32 / 142.0).ln(), 0.0],
            ..Cell::new(2, 6, 0, 0, 0.9, 0.9)
        },
        // x ∈ [12, 212], 完全位于帧内
        Cell {
            txywh: [0.0, 0.0, (200.0f32 / 142.0).ln(), 0.0],
            ..Cell::new(2, 6, 3, 0, 0.8, 0.9)
        },
    ];

    // 裁剪前 IoU = 200 / 400 = 0.5, 裁剪后 IoU = 200 / 216
    let candidates = ModelType::YOLOv4
        .postprocessor()
        .decode(&yolov4_outputs(&cells), 0.25)?;
    assert_eq!(candidates.len(), 2);
    assert!(candidates[0].bbox.iou(&candidates[1].bbox) < 0.6);

    let detector = detector(&assets, cells)?;
    detector.set_property(Property::NmsThreshold(0.6))?;
    let mut frame = grey_frame(416, 416)?;
    assert_eq!(
        detector.process(&mut frame)?,
        FrameOutcome::Annotated { detections: 1 }
    );

    let detections = &frame.detections().expect("detections attached").detections;
    for (i, a) in detections.iter().enumerate() {
        for b in &detections[i + 1..] {
            if a.class_id == b.class_id {
                assert!(a.bbox.iou(&b.bbox) < 0.6, "{a:?} overlaps {b:?}");
            }
        }
    }
    let kept = &detections[0];
    assert!((kept.confidence - 0.81).abs() < 1e-5);
    assert!(kept.bbox.xmin().abs() < 1e-3);
    assert!((kept.bbox.xmax() - 216.0).abs() < 1e-3);
    Ok(())
}

#[test]
fn test_score_threshold_is_inclusive() -> anyhow::Result<()> {
    let assets = assets()?;
    let detector = detector(&assets, vec![Cell::new(2, 6, 6, 0, 1.0, 0.5)])?;

    detector.set_property(Property::ScoreThreshold(0.5))?;
    let mut frame = grey_frame(416, 416)?;
    assert_eq!(
        detector.process(&mut frame)?,
        FrameOutcome::Annotated { detections: 1 }
    );

    detector.set_property(Property::ScoreThreshold(0.5001))?;
    let mut frame = grey_frame(416, 416)?;
    assert_eq!(
        detector.process(&mut frame)?,
        FrameOutcome::Annotated { detections: 0 }
    );
    assert!(frame.detections().expect("empty meta attached").is_empty());
    Ok(())
}

#[test]
fn test_teardown_releases_model() -> anyhow::Result<()> {
    let assets = assets()?;
    let detector = detector(&assets, vec![])?;
    detector.teardown();
    let mut frame = grey_frame(32, 32)?;
    assert_eq!(detector.process(&mut frame), Err(DetectorError::TornDown));
    assert!(detector.labels().is_none());
    Ok(())
}
