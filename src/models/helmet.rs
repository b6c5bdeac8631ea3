// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 安全帽检测
// 包含: 预处理、推理、输出转置与解码、尺寸过滤、NMS

use anyhow::{ensure, Result};
use image::DynamicImage;
use log::{debug, warn};
use ndarray::{ArrayView2, Axis, Ix2};

use crate::backend::image_to_tensor;
use crate::config::HelmetConfig;
use crate::utils::{Letterbox, LetterboxTransform};
use crate::{non_max_suppression, GearDetection, InferenceBackend, TensorLayout};

/// 输出行数: cx, cy, w, h, conf
pub const HELMET_OUTPUT_ROWS: usize = 5;

/// 安全帽检测器
pub struct HelmetDetector {
    backend: Box<dyn InferenceBackend>,
    config: HelmetConfig,
    layout: TensorLayout,
}

impl HelmetDetector {
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        config: HelmetConfig,
        layout: TensorLayout,
    ) -> Result<Self> {
        ensure!(config.input_size > 0, "Helmet input size must be positive");
        Ok(Self {
            backend,
            config,
            layout,
        })
    }

    /// 从 ONNX 模型文件加载
    #[cfg(feature = "ort-backend")]
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
        ep: crate::OrtEP,
        config: HelmetConfig,
        layout: TensorLayout,
    ) -> Result<Self> {
        let engine = crate::OrtBackend::build(crate::OrtConfig {
            f: path.as_ref().to_path_buf(),
            ep,
        })?;
        log::info!(
            "✅ 安全帽模型已加载: {} ({}x{}, {:?})",
            path.as_ref().display(),
            config.input_size,
            config.input_size,
            layout
        );
        Self::new(Box::new(engine), config, layout)
    }

    pub fn config(&self) -> &HelmetConfig {
        &self.config
    }

    /// 检测单帧中的安全帽, 推理失败时返回空结果
    pub fn detect(&mut self, image: &DynamicImage) -> Vec<GearDetection> {
        match self.try_detect(image) {
            Ok(gear) => gear,
            Err(e) => {
                warn!("⚠️ 安全帽推理失败 ({}): {e:#}", self.backend.name());
                Vec::new()
            }
        }
    }

    fn try_detect(&mut self, image: &DynamicImage) -> Result<Vec<GearDetection>> {
        let letterbox = Letterbox::new(image, self.config.input_size)?;
        let xs = image_to_tensor(&letterbox.canvas, self.layout);
        let ys = self.backend.run(xs)?;

        let shape = ys.shape().to_vec();
        ensure!(
            shape.len() == 3 && shape[0] == 1 && shape[1] == HELMET_OUTPUT_ROWS,
            "Unexpected helmet output shape {shape:?}, expected [1, {HELMET_OUTPUT_ROWS}, M]"
        );
        let output = ys.index_axis_move(Axis(0), 0).into_dimensionality::<Ix2>()?;

        // [5, M] → [M, 5]
        let mut gear = self.decode(
            output.t(),
            &letterbox.transform,
            image.width() as f32,
            image.height() as f32,
        );

        debug!("Found {} helmets before NMS", gear.len());
        non_max_suppression(&mut gear, self.config.iou);
        debug!("Found {} helmets after NMS", gear.len());

        Ok(gear)
    }

    /// 解码 [M, 5] 的候选 (不含 NMS)
    ///
    /// 任一角点坐标大于 1 时认为该行是模型输入像素坐标, 先除以输入边长再还原。
    /// 这是按数值大小猜测的, 归一化坐标恰好略超出 1 的框会被误判。
    pub fn decode(
        &self,
        rows: ArrayView2<f32>,
        transform: &LetterboxTransform,
        image_width: f32,
        image_height: f32,
    ) -> Vec<GearDetection> {
        let size = self.config.input_size as f32;
        let min_size = self.config.min_box_size;
        let mut gear = Vec::new();

        for row in rows.axis_iter(Axis(0)) {
            let confidence = row[4];
            if confidence.is_nan() || confidence <= self.config.conf {
                continue;
            }

            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let mut corners = [cx - w / 2., cy - h / 2., cx + w / 2., cy + h / 2.];
            if corners.iter().any(|&v| v > 1.) {
                corners = corners.map(|v| v / size);
            }

            let [x1, y1, x2, y2] = corners;
            let bounding_box = transform
                .box_to_original(x1, y1, x2, y2)
                .clamp_to(image_width, image_height);
            if bounding_box.width() > min_size && bounding_box.height() > min_size {
                gear.push(GearDetection {
                    bounding_box,
                    confidence,
                    is_associated: false,
                });
            }
        }

        gear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{FailingBackend, FixedBackend};
    use crate::BoundingBox;
    use ndarray::{Array, Array3};

    const SIZE: u32 = 64;

    fn config() -> HelmetConfig {
        HelmetConfig {
            input_size: SIZE,
            ..Default::default()
        }
    }

    /// 按 [1, 5, M] 排布写入候选 (cx, cy, w, h, conf)
    fn output(rows: &[[f32; 5]]) -> Array3<f32> {
        let mut out = Array::zeros((1, HELMET_OUTPUT_ROWS, rows.len()));
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                out[[0, j, i]] = *v;
            }
        }
        out
    }

    fn detect(rows: &[[f32; 5]], width: u32, height: u32) -> Vec<GearDetection> {
        let backend = FixedBackend::new(output(rows).into_dyn());
        let mut det = HelmetDetector::new(Box::new(backend), config(), TensorLayout::Nhwc).unwrap();
        det.detect(&DynamicImage::new_rgb8(width, height))
    }

    #[test]
    fn test_normalized_and_pixel_rows_agree() {
        let normalized = detect(&[[0.5, 0.5, 0.25, 0.25, 0.9]], SIZE, SIZE);
        let pixels = detect(&[[32., 32., 16., 16., 0.9]], SIZE, SIZE);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].bounding_box, BoundingBox::new(24., 24., 40., 40.));
        assert_eq!(pixels[0].bounding_box, normalized[0].bounding_box);
        assert!(!normalized[0].is_associated);
    }

    #[test]
    fn test_inverse_letterbox() {
        // 128x64 → 64: ratio 0.5, 上下各 16 像素黑边
        let gear = detect(&[[0.25, 0.5, 0.25, 0.25, 0.9]], 128, 64);
        assert_eq!(gear[0].bounding_box, BoundingBox::new(16., 16., 48., 48.));
    }

    #[test]
    fn test_filters() {
        let gear = detect(
            &[
                [0.5, 0.5, 0.25, 0.25, 0.25],     // 置信度不超过阈值
                [0.5, 0.5, 4. / 64., 0.25, 0.9],   // 宽 4 像素
                [0.25, 0.25, 5. / 64., 0.25, 0.9], // 宽正好 5 像素
                [0.8, 0.8, 6. / 64., 0.25, 0.9],   // 保留
            ],
            SIZE,
            SIZE,
        );
        assert_eq!(gear.len(), 1);
        assert!((gear[0].bounding_box.width() - 6.).abs() < 1e-4);
    }

    #[test]
    fn test_nan_confidence_rejected() {
        let gear = detect(
            &[[0.5, 0.5, 0.25, 0.25, 0.9], [0.5, 0.51, 0.25, 0.25, f32::NAN]],
            SIZE,
            SIZE,
        );
        assert_eq!(gear.len(), 1);
        assert_eq!(gear[0].confidence, 0.9);
    }

    #[test]
    fn test_clamped_to_image() {
        let gear = detect(&[[0.0, 0.5, 0.5, 0.25, 0.9]], SIZE, SIZE);
        assert_eq!(gear[0].bounding_box.left(), 0.);
        assert_eq!(gear[0].bounding_box.right(), 16.);
    }

    #[test]
    fn test_nms_merges_duplicates() {
        let gear = detect(
            &[
                [0.5, 0.5, 0.25, 0.25, 0.6],
                [0.5, 0.51, 0.25, 0.25, 0.8],
                [0.1, 0.1, 0.15, 0.15, 0.7],
            ],
            SIZE,
            SIZE,
        );
        let confs: Vec<f32> = gear.iter().map(|g| g.confidence).collect();
        assert_eq!(confs, vec![0.8, 0.7]);
    }

    #[test]
    fn test_failures_are_empty() {
        let mut det =
            HelmetDetector::new(Box::new(FailingBackend), config(), TensorLayout::Nchw).unwrap();
        assert!(det.detect(&DynamicImage::new_rgb8(SIZE, SIZE)).is_empty());

        let backend = FixedBackend::new(Array::zeros((1, 56, 3)).into_dyn());
        let mut det = HelmetDetector::new(Box::new(backend), config(), TensorLayout::Nhwc).unwrap();
        assert!(det.detect(&DynamicImage::new_rgb8(SIZE, SIZE)).is_empty());
    }
}
