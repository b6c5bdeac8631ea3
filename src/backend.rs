//! 推理后端接口
//!
//! 三个模型 (姿态/安全帽/楼梯安全序列) 都被当作黑盒: 输入一个 f32 张量, 输出一个 f32 张量。
//! 形状约定由各适配器负责:
//!
//! ```text
//! 姿态模型:   [1, S, S, 3] → [1, 56, N]
//! 安全帽模型: [1, S, S, 3] → [1, 5, M]
//! 序列模型:   [1, 6, 64, 48, 17] → [1, 2]
//! ```
//!
//! `run` 需要 `&mut self`: 同一个后端实例同一时刻只允许一个调用者。
//! 资源在 `Drop` 时释放。
use anyhow::Result;
use image::RgbImage;
use ndarray::{Array, ArrayD};
use serde::{Deserialize, Serialize};

pub trait InferenceBackend: Send {
    /// 前向推理
    fn run(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// 后端名称 (用于日志)
    fn name(&self) -> &str {
        "backend"
    }
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn run(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        (**self).run(input)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// 图像输入张量排布
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// [1, H, W, 3] (移动端模型)
    #[default]
    Nhwc,
    /// [1, 3, H, W] (ONNX 导出的 YOLO 模型)
    Nchw,
}

/// RGB 图像 → 归一化到 [0, 1] 的输入张量
pub fn image_to_tensor(img: &RgbImage, layout: TensorLayout) -> ArrayD<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut ys = match layout {
        TensorLayout::Nhwc => Array::zeros((1, h, w, 3)).into_dyn(),
        TensorLayout::Nchw => Array::zeros((1, 3, h, w)).into_dyn(),
    };
    for (x, y, rgb) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        for (c, v) in rgb.0.iter().enumerate() {
            let v = *v as f32 / 255.0;
            match layout {
                TensorLayout::Nhwc => ys[[0, y, x, c]] = v,
                TensorLayout::Nchw => ys[[0, c, y, x]] = v,
            }
        }
    }
    ys
}
