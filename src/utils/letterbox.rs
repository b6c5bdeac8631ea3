/// Letterbox 预处理
///
/// 等比缩放到 S×S 正方形画布, 空白处填黑, 并记录还原坐标所需的缩放比例与偏移:
///
/// ```text
/// ratio  = min(S / w, S / h)
/// offset = ((S - w*ratio) / 2, (S - h*ratio) / 2)
/// 原图坐标 = (模型坐标 * S - offset) / ratio      (模型坐标已归一化到 [0, 1])
/// ```
use anyhow::{bail, Result};
use fast_image_resize as fr;
use image::{imageops, DynamicImage, RgbImage};

use crate::BoundingBox;

/// 坐标变换参数 (不含像素数据)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    pub size: u32,
    pub ratio: f32,
    pub x_offset: f32,
    pub y_offset: f32,
}

impl LetterboxTransform {
    /// 根据原图尺寸计算变换参数
    ///
    /// 偏移取实际粘贴位置 (整数像素), 保证逆变换与画布内容严格一致
    pub fn new(width: u32, height: u32, size: u32) -> Result<Self> {
        if width == 0 || height == 0 || size == 0 {
            bail!("Invalid letterbox geometry: {width}x{height} -> {size}");
        }
        let (ratio, w_new, h_new) = scale_wh(width, height, size);
        Ok(Self {
            size,
            ratio,
            x_offset: ((size - w_new) / 2) as f32,
            y_offset: ((size - h_new) / 2) as f32,
        })
    }

    /// 归一化模型坐标 → 原图坐标
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let s = self.size as f32;
        (
            (x * s - self.x_offset) / self.ratio,
            (y * s - self.y_offset) / self.ratio,
        )
    }

    /// 原图坐标 → 归一化模型坐标
    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        let s = self.size as f32;
        (
            (x * self.ratio + self.x_offset) / s,
            (y * self.ratio + self.y_offset) / s,
        )
    }

    /// 归一化角点 (x1, y1, x2, y2) → 原图检测框
    pub fn box_to_original(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        let (l, t) = self.to_original(x1, y1);
        let (r, b) = self.to_original(x2, y2);
        BoundingBox::new(l, t, r, b)
    }

    /// 原图检测框 → 归一化角点
    pub fn box_to_model(&self, bbox: &BoundingBox) -> [f32; 4] {
        let (x1, y1) = self.to_model(bbox.left(), bbox.top());
        let (x2, y2) = self.to_model(bbox.right(), bbox.bottom());
        [x1, y1, x2, y2]
    }
}

/// Letterbox 结果: 画布 + 变换参数
pub struct Letterbox {
    pub canvas: RgbImage,
    pub transform: LetterboxTransform,
}

impl Letterbox {
    pub fn new(image: &DynamicImage, size: u32) -> Result<Self> {
        let transform = LetterboxTransform::new(image.width(), image.height(), size)?;
        let (_, w_new, h_new) = scale_wh(image.width(), image.height(), size);

        // 缩放 (fast_image_resize, 双线性)
        let src = image.to_rgb8();
        let src_image = fr::images::Image::from_vec_u8(
            src.width(),
            src.height(),
            src.into_raw(),
            fr::PixelType::U8x3,
        )?;
        let mut dst_image = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x3);
        let mut resizer = fr::Resizer::new();
        resizer.resize(
            &src_image,
            &mut dst_image,
            &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )?;
        let resized = match RgbImage::from_raw(w_new, h_new, dst_image.into_vec()) {
            Some(img) => img,
            None => bail!("Failed to build resized image {w_new}x{h_new}"),
        };

        // 黑色画布 + 居中粘贴
        let mut canvas = RgbImage::new(size, size);
        imageops::replace(
            &mut canvas,
            &resized,
            transform.x_offset as i64,
            transform.y_offset as i64,
        );

        Ok(Self { canvas, transform })
    }
}

/// 缩放后尺寸 (截断取整, 至少 1 像素)
fn scale_wh(width: u32, height: u32, size: u32) -> (f32, u32, u32) {
    let r = (size as f32 / width as f32).min(size as f32 / height as f32);
    let w_new = ((width as f32 * r) as u32).clamp(1, size);
    let h_new = ((height as f32 * r) as u32).clamp(1, size);
    (r, w_new, h_new)
}

/// 按相机旋转角度校正帧方向 (0/90/180/270, 顺时针)
pub fn orient_frame(image: DynamicImage, rotation_degrees: i32) -> Result<DynamicImage> {
    match rotation_degrees.rem_euclid(360) {
        0 => Ok(image),
        90 => Ok(image.rotate90()),
        180 => Ok(image.rotate180()),
        270 => Ok(image.rotate270()),
        other => bail!("Unsupported frame rotation: {other} degrees"),
    }
}
