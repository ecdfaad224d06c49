// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 按类别的非极大值抑制

use std::collections::BTreeMap;

use crate::detection::Candidate;

/// 对候选框做按类别的贪心 NMS
///
/// - 每个类别内按置信度从高到低处理, 置信度相同时输入顺序靠前者优先
/// - 与任一已保留的同类框 IoU >= `iou_threshold` 的框被抑制
/// - 不同类别之间互不影响
///
/// 返回的保留框按置信度从高到低排列 (同分保持输入顺序).
pub fn non_max_suppression(candidates: &[Candidate], iou_threshold: f32) -> Vec<Candidate> {
    let mut by_class: BTreeMap<usize, Vec<(usize, &Candidate)>> = BTreeMap::new();
    for (index, c) in candidates.iter().enumerate() {
        by_class.entry(c.class_id).or_default().push((index, c));
    }

    let mut kept: Vec<(usize, &Candidate)> = Vec::new();
    for (_, mut xs) in by_class {
        // 稳定排序: 同分时保留输入顺序
        xs.sort_by(|(_, a), (_, b)| b.confidence.total_cmp(&a.confidence));

        let start = kept.len();
        for (index, c) in xs {
            let suppressed = kept[start..]
                .iter()
                .any(|(_, k)| k.bbox.iou(&c.bbox) >= iou_threshold);
            if !suppressed {
                kept.push((index, c));
            }
        }
    }

    kept.sort_by(|(ia, a), (ib, b)| b.confidence.total_cmp(&a.confidence).then(ia.cmp(ib)));
    kept.into_iter().map(|(_, c)| *c).collect()
}
