// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod backend; // 推理后端接口
pub mod config; // 配置参数
pub mod detection; // 融合检测系统
pub mod models; // 模型适配器
pub mod utils; // 图像预处理

#[cfg(feature = "ort-backend")]
pub mod ort_backend;

pub use crate::backend::{InferenceBackend, TensorLayout};
pub use crate::config::{Args, PipelineConfig};
pub use crate::detection::{
    AssociationEngine, BoundingBox, Detection, DetectionResult, FrameSummary, FrameWorker,
    GearDetection, HandrailStatus, Keypoint, KeypointType, Orchestrator, PersonDetection, Point,
    ViolationMode,
};
pub use crate::models::{
    HeatmapFrame, HelmetDetector, ModelKind, PoseDetector, SequenceBuffer, SequenceScores,
    StairSafetyClassifier,
};
#[cfg(feature = "ort-backend")]
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};

/// 非极大值抑制
///
/// 按置信度降序排序 (稳定排序, 同分保持原顺序), 依次保留与所有已保留检测的
/// IoU 都不超过 `iou_threshold` 的检测
pub fn non_max_suppression<T: Detection>(xs: &mut Vec<T>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].bbox().iou(xs[index].bbox());
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}
