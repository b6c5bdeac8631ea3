// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 人体姿态估计
// 包含: 预处理、推理、关键点解码、人体框修正、头部框、热力图

use anyhow::{ensure, Result};
use image::DynamicImage;
use log::{debug, warn};
use ndarray::{Array2, ArrayView2, Axis};

use crate::backend::image_to_tensor;
use crate::config::PoseConfig;
use crate::models::stair_safety::HEATMAP_CHANNELS;
use crate::utils::{Letterbox, LetterboxTransform};
use crate::{
    non_max_suppression, BoundingBox, HeatmapFrame, InferenceBackend, Keypoint, KeypointType,
    PersonDetection, Point, TensorLayout,
};

// ========== 输出张量布局 [1, 56, N] ==========

/// 输出行数: 4 (框) + 1 (置信度) + 17 × 3 (关键点)
pub const POSE_OUTPUT_ROWS: usize = 56;

/// 检测框角点 x1, y1, x2, y2 (归一化)
const BOX_ROWS: [usize; 4] = [0, 1, 2, 3];
/// 人员置信度
const CONF_ROW: usize = 4;

/// 每个关键点的 (x, y, conf) 所在行, 按 `KeypointType` 序号排列
const KEYPOINT_ROWS: [[usize; 3]; KeypointType::COUNT] = [
    [5, 6, 7],    // nose
    [8, 9, 10],   // left_eye
    [11, 12, 13], // right_eye
    [14, 15, 16], // left_ear
    [17, 18, 19], // right_ear
    [20, 21, 22], // left_shoulder
    [23, 24, 25], // right_shoulder
    [26, 27, 28], // left_elbow
    [29, 30, 31], // right_elbow
    [32, 33, 34], // left_wrist
    [35, 36, 37], // right_wrist
    [38, 39, 40], // left_hip
    [41, 42, 43], // right_hip
    [44, 45, 46], // left_knee
    [47, 48, 49], // right_knee
    [50, 51, 52], // left_ankle
    [53, 54, 55], // right_ankle
];

// 人体框修正参数
const TARGET_ASPECT: f32 = 2.0; // 高:宽
const MAX_ASPECT: f32 = 3.0;
const BODY_PADDING: f32 = 0.2;

// 头部框扩展比例
const HEAD_PADDING_X: f32 = 1.0;
const HEAD_PADDING_Y: f32 = 0.8;

/// 姿态检测器
pub struct PoseDetector {
    backend: Box<dyn InferenceBackend>,
    config: PoseConfig,
    layout: TensorLayout,
    /// 最近一帧的原始输出 [56, N]
    last_output: Option<Array2<f32>>,
}

impl PoseDetector {
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        config: PoseConfig,
        layout: TensorLayout,
    ) -> Result<Self> {
        ensure!(config.input_size > 0, "Pose input size must be positive");
        Ok(Self {
            backend,
            config,
            layout,
            last_output: None,
        })
    }

    /// 从 ONNX 模型文件加载
    #[cfg(feature = "ort-backend")]
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
        ep: crate::OrtEP,
        config: PoseConfig,
        layout: TensorLayout,
    ) -> Result<Self> {
        let engine = crate::OrtBackend::build(crate::OrtConfig {
            f: path.as_ref().to_path_buf(),
            ep,
        })?;
        log::info!(
            "✅ 姿态模型已加载: {} ({}x{}, {:?})",
            path.as_ref().display(),
            config.input_size,
            config.input_size,
            layout
        );
        Self::new(Box::new(engine), config, layout)
    }

    pub fn config(&self) -> &PoseConfig {
        &self.config
    }

    /// 检测单帧中的人员
    ///
    /// 推理失败时记录日志并返回空结果, 同时清空最近一帧输出
    pub fn detect(&mut self, image: &DynamicImage) -> Vec<PersonDetection> {
        match self.try_detect(image) {
            Ok(persons) => persons,
            Err(e) => {
                self.last_output = None;
                warn!("⚠️ 姿态推理失败 ({}): {e:#}", self.backend.name());
                Vec::new()
            }
        }
    }

    fn try_detect(&mut self, image: &DynamicImage) -> Result<Vec<PersonDetection>> {
        let letterbox = Letterbox::new(image, self.config.input_size)?;
        let xs = image_to_tensor(&letterbox.canvas, self.layout);
        let ys = self.backend.run(xs)?;

        let shape = ys.shape().to_vec();
        ensure!(
            shape.len() == 3 && shape[0] == 1 && shape[1] == POSE_OUTPUT_ROWS,
            "Unexpected pose output shape {shape:?}, expected [1, {POSE_OUTPUT_ROWS}, N]"
        );
        let output = ys
            .index_axis_move(Axis(0), 0)
            .into_dimensionality::<ndarray::Ix2>()?;

        let mut persons = self.decode(
            output.view(),
            &letterbox.transform,
            image.width() as f32,
            image.height() as f32,
        );
        self.last_output = Some(output);

        debug!("Found {} people before NMS", persons.len());
        non_max_suppression(&mut persons, self.config.iou);
        debug!("Found {} people after NMS", persons.len());

        Ok(persons)
    }

    /// 解码 [56, N] 输出 (不含 NMS)
    pub fn decode(
        &self,
        output: ArrayView2<f32>,
        transform: &LetterboxTransform,
        image_width: f32,
        image_height: f32,
    ) -> Vec<PersonDetection> {
        let kpt_conf = self.config.kpt_conf;
        let mut persons = Vec::new();

        for candidate in output.axis_iter(Axis(1)) {
            let confidence = candidate[CONF_ROW];
            if confidence.is_nan() || confidence <= self.config.conf {
                continue;
            }

            let keypoints: Vec<Keypoint> = KeypointType::ALL
                .iter()
                .map(|&kind| {
                    let [rx, ry, rc] = KEYPOINT_ROWS[kind.id()];
                    let (x, y) = transform.to_original(candidate[rx], candidate[ry]);
                    Keypoint {
                        position: Point::new(x, y),
                        confidence: candidate[rc],
                        kind,
                    }
                })
                .collect();

            let visible = keypoints.iter().filter(|k| k.confidence > kpt_conf).count();
            if visible < self.config.min_keypoints {
                continue;
            }

            let [x1, y1, x2, y2] = BOX_ROWS.map(|r| candidate[r]);
            let raw_box = transform.box_to_original(x1, y1, x2, y2);
            let bounding_box =
                improved_bounding_box(&keypoints, kpt_conf, image_width, image_height)
                    .unwrap_or(raw_box);
            let head_bounding_box =
                head_bounding_box(&keypoints, kpt_conf, image_width, image_height);

            persons.push(PersonDetection {
                bounding_box,
                confidence,
                keypoints,
                head_bounding_box,
                has_protective_gear: false,
                holds_handrail: false,
            });
        }

        persons
    }

    /// 最近一帧的原始输出 [56, N]
    pub fn last_heatmap(&self) -> Option<&Array2<f32>> {
        self.last_output.as_ref()
    }

    /// 由最近一帧中置信度最高的候选生成高斯热力图
    ///
    /// 没有置信度大于 0 的候选时返回 None
    pub fn last_heatmap_flattened(&self) -> Option<HeatmapFrame> {
        let output = self.last_output.as_ref()?;

        let mut best: Option<(usize, f32)> = None;
        for (i, &conf) in output.row(CONF_ROW).iter().enumerate() {
            if conf > best.map_or(0., |(_, c)| c) {
                best = Some((i, conf));
            }
        }
        let (index, conf) = best?;

        let candidate = output.column(index);
        let mut keypoints = [[0f32; 3]; HEATMAP_CHANNELS];
        for (kpt, rows) in keypoints.iter_mut().zip(KEYPOINT_ROWS.iter()) {
            *kpt = rows.map(|r| candidate[r]);
        }
        let frame = HeatmapFrame::render(&keypoints);

        let (min, max, mean) = frame.stats();
        debug!(
            "热力图: 候选 #{index} (conf {conf:.3}), min={min:.4}, max={max:.4}, mean={mean:.6}"
        );
        Some(frame)
    }
}

/// 可见关键点的 (min_x, min_y, max_x, max_y)
fn keypoint_bounds<'a>(
    keypoints: impl Iterator<Item = &'a Keypoint>,
) -> Option<(f32, f32, f32, f32)> {
    keypoints.fold(None, |acc, k| {
        let (x, y) = (k.position.x, k.position.y);
        Some(match acc {
            None => (x, y, x, y),
            Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
        })
    })
}

/// 根据可见关键点修正人体框
///
/// 高宽比小于 2 时按宽度拉高到 2:1, 大于 3 时按高度收窄到 2:1,
/// 再按修正前的宽高各扩展 20%, 最后裁剪到图像范围
fn improved_bounding_box(
    keypoints: &[Keypoint],
    threshold: f32,
    image_width: f32,
    image_height: f32,
) -> Option<BoundingBox> {
    let (mut min_x, mut min_y, mut max_x, mut max_y) =
        keypoint_bounds(keypoints.iter().filter(|k| k.confidence > threshold))?;

    let width = max_x - min_x;
    let height = max_y - min_y;
    let center_x = (min_x + max_x) / 2.;
    let center_y = (min_y + max_y) / 2.;

    let aspect = height / width;
    if aspect < TARGET_ASPECT {
        let new_height = width * TARGET_ASPECT;
        min_y = center_y - new_height / 2.;
        max_y = center_y + new_height / 2.;
    } else if aspect > MAX_ASPECT {
        let new_width = height / TARGET_ASPECT;
        min_x = center_x - new_width / 2.;
        max_x = center_x + new_width / 2.;
    }

    let padding_x = width * BODY_PADDING;
    let padding_y = height * BODY_PADDING;

    Some(BoundingBox::new(
        (min_x - padding_x).max(0.),
        (min_y - padding_y).max(0.),
        (max_x + padding_x).min(image_width),
        (max_y + padding_y).min(image_height),
    ))
}

/// 由 5 个头部关键点计算头部框, 没有可见头部关键点时返回 None
fn head_bounding_box(
    keypoints: &[Keypoint],
    threshold: f32,
    image_width: f32,
    image_height: f32,
) -> Option<BoundingBox> {
    let (min_x, mut min_y, max_x, mut max_y) = keypoint_bounds(
        keypoints
            .iter()
            .filter(|k| k.kind.is_head() && k.confidence > threshold),
    )?;

    let width = max_x - min_x;
    let height = max_y - min_y;
    let padding_x = width * HEAD_PADDING_X;
    let padding_y = height * HEAD_PADDING_Y;

    // 宽大于高时按宽度补成正方形
    if height < width {
        let center_y = (min_y + max_y) / 2.;
        min_y = center_y - width / 2.;
        max_y = center_y + width / 2.;
    }

    Some(BoundingBox::new(
        (min_x - padding_x).max(0.),
        (min_y - padding_y).max(0.),
        (max_x + padding_x).min(image_width),
        (max_y + padding_y).min(image_height),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{FailingBackend, FixedBackend};
    use ndarray::{Array, Array3};

    const SIZE: u32 = 64;

    fn config() -> PoseConfig {
        PoseConfig {
            input_size: SIZE,
            ..Default::default()
        }
    }

    /// 在第 i 列写入一个候选, 坐标以像素给出 (图像与输入同尺寸, 变换为恒等)
    fn put_candidate(
        out: &mut Array3<f32>,
        i: usize,
        conf: f32,
        kpts: &[(KeypointType, f32, f32, f32)],
    ) {
        let s = SIZE as f32;
        out[[0, 0, i]] = 0.1;
        out[[0, 1, i]] = 0.1;
        out[[0, 2, i]] = 0.9;
        out[[0, 3, i]] = 0.9;
        out[[0, CONF_ROW, i]] = conf;
        for &(kind, x, y, c) in kpts {
            let [rx, ry, rc] = KEYPOINT_ROWS[kind.id()];
            out[[0, rx, i]] = x / s;
            out[[0, ry, i]] = y / s;
            out[[0, rc, i]] = c;
        }
    }

    fn body() -> Vec<(KeypointType, f32, f32, f32)> {
        vec![
            (KeypointType::LeftShoulder, 20., 10., 0.9),
            (KeypointType::RightShoulder, 30., 10., 0.9),
            (KeypointType::LeftAnkle, 20., 50., 0.8),
            (KeypointType::RightAnkle, 30., 50., 0.8),
        ]
    }

    fn detector(output: Array3<f32>) -> PoseDetector {
        let backend = FixedBackend::new(output.into_dyn());
        PoseDetector::new(Box::new(backend), config(), TensorLayout::Nhwc).unwrap()
    }

    fn frame() -> DynamicImage {
        DynamicImage::new_rgb8(SIZE, SIZE)
    }

    #[test]
    fn test_keypoint_rows_table() {
        for (k, rows) in KEYPOINT_ROWS.iter().enumerate() {
            assert_eq!(*rows, [5 + k * 3, 6 + k * 3, 7 + k * 3]);
        }
        assert_eq!(KEYPOINT_ROWS[KeypointType::COUNT - 1][2], POSE_OUTPUT_ROWS - 1);
    }

    #[test]
    fn test_rejects_too_few_keypoints() {
        let mut out = Array::zeros((1, POSE_OUTPUT_ROWS, 3));
        // 只有 2 个可见关键点
        put_candidate(&mut out, 0, 0.9, &body()[..2]);
        // 置信度不够
        put_candidate(&mut out, 1, 0.2, &body());
        let mut det = detector(out);
        assert!(det.detect(&frame()).is_empty());
        assert!(det.last_heatmap().is_some());
    }

    #[test]
    fn test_improved_box_and_no_head() {
        let mut out = Array::zeros((1, POSE_OUTPUT_ROWS, 2));
        put_candidate(&mut out, 0, 0.9, &body());
        let persons = detector(out).detect(&frame());
        assert_eq!(persons.len(), 1);

        let p = &persons[0];
        assert_eq!(p.keypoints.len(), KeypointType::COUNT);
        assert_eq!(p.keypoint(KeypointType::LeftAnkle).unwrap().position, Point::new(20., 50.));
        // 宽 10 高 40 → 收窄为宽 20, 再按原宽高扩展 (2, 8)
        assert_eq!(p.bounding_box, BoundingBox::new(13., 2., 37., 58.));
        assert!(p.head_bounding_box.is_none());
        assert!(!p.has_protective_gear);
    }

    #[test]
    fn test_head_box() {
        let mut kpts = body();
        kpts.push((KeypointType::Nose, 30., 20., 0.9));
        kpts.push((KeypointType::LeftEye, 28., 19., 0.9));
        kpts.push((KeypointType::RightEye, 32., 19., 0.9));
        let mut out = Array::zeros((1, POSE_OUTPUT_ROWS, 1));
        put_candidate(&mut out, 0, 0.9, &kpts);
        let persons = detector(out).detect(&frame());

        let head = persons[0].head_bounding_box.unwrap();
        // 宽 4 高 1: 先按宽补成正方形 (17.5..21.5), 再扩展 (4, 0.8)
        assert!((head.left() - 24.).abs() < 1e-4);
        assert!((head.right() - 36.).abs() < 1e-4);
        assert!((head.top() - 16.7).abs() < 1e-4);
        assert!((head.bottom() - 22.3).abs() < 1e-4);
    }

    #[test]
    fn test_nms_merges_duplicates() {
        let mut out = Array::zeros((1, POSE_OUTPUT_ROWS, 3));
        put_candidate(&mut out, 0, 0.6, &body());
        put_candidate(&mut out, 1, 0.9, &body());
        let persons = detector(out).detect(&frame());
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].confidence, 0.9);
    }

    #[test]
    fn test_nan_confidence_rejected() {
        let mut out = Array::zeros((1, POSE_OUTPUT_ROWS, 2));
        put_candidate(&mut out, 0, 0.9, &body());
        put_candidate(&mut out, 1, f32::NAN, &body());
        let persons = detector(out).detect(&frame());
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].confidence, 0.9);
    }

    #[test]
    fn test_backend_failure_is_empty() {
        let mut det =
            PoseDetector::new(Box::new(FailingBackend), config(), TensorLayout::Nhwc).unwrap();
        assert!(det.detect(&frame()).is_empty());
        assert!(det.last_heatmap().is_none());
        assert!(det.last_heatmap_flattened().is_none());
    }

    #[test]
    fn test_wrong_output_shape_is_empty() {
        let mut det = detector(Array::zeros((1, 5, 4)));
        assert!(det.detect(&frame()).is_empty());
        assert!(det.last_heatmap().is_none());
    }

    #[test]
    fn test_heatmap_uses_best_candidate() {
        let mut out = Array::zeros((1, POSE_OUTPUT_ROWS, 3));
        put_candidate(&mut out, 0, 0.3, &[(KeypointType::Nose, 8., 8., 1.0)]);
        // 最高置信度候选, 鼻子在归一化 (0.5, 0.5)
        put_candidate(&mut out, 2, 0.8, &[(KeypointType::Nose, 32., 32., 1.0)]);
        let mut det = detector(out);
        det.detect(&frame());

        let heatmap = det.last_heatmap_flattened().unwrap();
        assert!((heatmap.get(32, 24, 0).unwrap() - 1.0).abs() < 1e-6);
        assert!(heatmap.get(8, 6, 0).unwrap() < 1e-3);
    }

    #[test]
    fn test_heatmap_none_without_candidates() {
        let mut det = detector(Array::zeros((1, POSE_OUTPUT_ROWS, 4)));
        assert!(det.detect(&frame()).is_empty());
        assert!(det.last_heatmap().is_some());
        assert!(det.last_heatmap_flattened().is_none());
    }

    #[test]
    fn test_improved_box_widens_flat_pose() {
        let kpts: Vec<Keypoint> = [(0., 10.), (20., 12.)]
            .iter()
            .zip([KeypointType::LeftWrist, KeypointType::RightWrist])
            .map(|(&(x, y), kind)| Keypoint {
                position: Point::new(x + 10., y),
                confidence: 0.9,
                kind,
            })
            .collect();
        // 宽 20 高 2 → 拉高到 40, 再扩展 (4, 0.4), 顶部裁剪到 0
        let b = improved_bounding_box(&kpts, 0.2, 100., 100.).unwrap();
        assert_eq!(b.left(), 6.);
        assert_eq!(b.right(), 34.);
        assert_eq!(b.top(), 0.);
        assert!((b.bottom() - 31.4).abs() < 1e-4);
        assert!(improved_bounding_box(&kpts, 0.95, 100., 100.).is_none());
    }
}
