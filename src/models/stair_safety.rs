// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 楼梯扶手序列分类
// 包含: 热力图帧、定长帧序列、序列模型推理、safe/unsafe 判定

use std::collections::VecDeque;

use anyhow::{bail, ensure, Result};
use log::{debug, warn};
use ndarray::{Array, ArrayD};
use serde::{Deserialize, Serialize};

use crate::config::StairSafetyConfig;
use crate::{HandrailStatus, InferenceBackend, KeypointType};

/// 热力图高度
pub const HEATMAP_HEIGHT: usize = 64;
/// 热力图宽度
pub const HEATMAP_WIDTH: usize = 48;
/// 热力图通道数 (每个关键点一个通道)
pub const HEATMAP_CHANNELS: usize = KeypointType::COUNT;
/// 单帧热力图展平后的长度
pub const HEATMAP_LEN: usize = HEATMAP_HEIGHT * HEATMAP_WIDTH * HEATMAP_CHANNELS;
/// 高斯核标准差 (热力图像素)
pub const HEATMAP_SIGMA: f32 = 1.0;
/// 序列模型要求的帧数
pub const SEQUENCE_LENGTH: usize = 6;

/// safe / unsafe 绝对阈值
pub const DEFAULT_SAFETY_THRESHOLD: f32 = 0.8;
/// safe 领先 unsafe 的最小差值
pub const DEFAULT_MARGIN: f32 = 0.2;

// ========== 热力图 ==========

/// 单帧关键点热力图, 展平的 [H=64, W=48, K=17] (通道在最内层)
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapFrame {
    data: Vec<f32>,
}

impl HeatmapFrame {
    pub fn from_vec(data: Vec<f32>) -> Result<Self> {
        ensure!(
            data.len() == HEATMAP_LEN,
            "Heatmap size mismatch: got {}, expected {}",
            data.len(),
            HEATMAP_LEN
        );
        Ok(Self { data })
    }

    /// 由一组关键点 (归一化 x, 归一化 y, 置信度) 渲染高斯热力图
    ///
    /// 每个通道以关键点位置为中心 (`x * W`, `y * H`), 峰值等于该关键点的置信度:
    ///
    /// ```text
    /// v(h, w, k) = conf_k * exp(-((w - x_k*W)^2 + (h - y_k*H)^2) / (2σ^2))
    /// ```
    pub fn render(keypoints: &[[f32; 3]; HEATMAP_CHANNELS]) -> Self {
        let two_sigma_sq = 2. * HEATMAP_SIGMA * HEATMAP_SIGMA;
        let mut data = Vec::with_capacity(HEATMAP_LEN);
        for h in 0..HEATMAP_HEIGHT {
            for w in 0..HEATMAP_WIDTH {
                for [x, y, conf] in keypoints.iter() {
                    let dx = w as f32 - x * HEATMAP_WIDTH as f32;
                    let dy = h as f32 - y * HEATMAP_HEIGHT as f32;
                    data.push(conf * (-(dx * dx + dy * dy) / two_sigma_sq).exp());
                }
            }
        }
        Self { data }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, h: usize, w: usize, k: usize) -> Option<f32> {
        if h >= HEATMAP_HEIGHT || w >= HEATMAP_WIDTH || k >= HEATMAP_CHANNELS {
            return None;
        }
        self.data
            .get((h * HEATMAP_WIDTH + w) * HEATMAP_CHANNELS + k)
            .copied()
    }

    /// (min, max, mean)
    pub fn stats(&self) -> (f32, f32, f32) {
        let (min, max, sum) = self.data.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY, 0f32),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
        );
        (min, max, sum / self.data.len() as f32)
    }
}

// ========== 帧序列 ==========

/// 定长 FIFO 帧序列, 长度永远不超过容量, 满了之后新帧挤掉最旧的帧
#[derive(Debug, Clone)]
pub struct SequenceBuffer {
    frames: VecDeque<HeatmapFrame>,
    capacity: usize,
}

impl SequenceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// 追加一帧, 返回被挤出的最旧帧
    pub fn push(&mut self, frame: HeatmapFrame) -> Option<HeatmapFrame> {
        self.frames.push_back(frame);
        if self.frames.len() > self.capacity {
            self.frames.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 恰好等于容量
    pub fn is_full(&self) -> bool {
        self.frames.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// 从旧到新
    pub fn frames(&self) -> impl Iterator<Item = &HeatmapFrame> {
        self.frames.iter()
    }

    /// 拼接为序列模型输入 [1, T, 64, 48, 17]
    pub fn to_tensor(&self) -> Result<ArrayD<f32>> {
        if !self.is_full() {
            bail!(
                "Sequence not ready: {}/{} frames",
                self.frames.len(),
                self.capacity
            );
        }
        let mut flat = Vec::with_capacity(self.capacity * HEATMAP_LEN);
        for frame in self.frames.iter() {
            flat.extend_from_slice(frame.as_slice());
        }
        let ys = Array::from_shape_vec(
            (
                1,
                self.capacity,
                HEATMAP_HEIGHT,
                HEATMAP_WIDTH,
                HEATMAP_CHANNELS,
            ),
            flat,
        )?;
        Ok(ys.into_dyn())
    }
}

// ========== 分类 ==========

/// 序列模型输出
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SequenceScores {
    pub safe_score: f32,
    pub unsafe_score: f32,
}

impl SequenceScores {
    pub fn new(safe_score: f32, unsafe_score: f32) -> Self {
        Self {
            safe_score,
            unsafe_score,
        }
    }
}

/// 默认阈值 (0.8) 与差值 (0.2) 下的扶手判定
///
/// 1. safe > 0.8 → Safe
/// 2. unsafe > 0.8 → Unsafe
/// 3. safe > unsafe + 0.2 → Safe
/// 4. 其余 → Unsafe
pub fn decide(safe_score: f32, unsafe_score: f32) -> HandrailStatus {
    decide_with(
        SequenceScores::new(safe_score, unsafe_score),
        DEFAULT_SAFETY_THRESHOLD,
        DEFAULT_MARGIN,
    )
}

fn decide_with(scores: SequenceScores, threshold: f32, margin: f32) -> HandrailStatus {
    if scores.safe_score > threshold {
        HandrailStatus::Safe
    } else if scores.unsafe_score > threshold {
        HandrailStatus::Unsafe
    } else if scores.safe_score > scores.unsafe_score + margin {
        HandrailStatus::Safe
    } else {
        HandrailStatus::Unsafe
    }
}

/// 楼梯扶手序列分类器: 持有序列模型后端和帧序列
pub struct StairSafetyClassifier {
    backend: Box<dyn InferenceBackend>,
    buffer: SequenceBuffer,
    config: StairSafetyConfig,
}

impl StairSafetyClassifier {
    pub fn new(backend: Box<dyn InferenceBackend>, config: StairSafetyConfig) -> Result<Self> {
        ensure!(
            config.sequence_length > 0,
            "Sequence length must be positive"
        );
        Ok(Self {
            buffer: SequenceBuffer::new(config.sequence_length),
            backend,
            config,
        })
    }

    /// 从 ONNX 模型文件加载
    #[cfg(feature = "ort-backend")]
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
        ep: crate::OrtEP,
        config: StairSafetyConfig,
    ) -> Result<Self> {
        let engine = crate::OrtBackend::build(crate::OrtConfig {
            f: path.as_ref().to_path_buf(),
            ep,
        })?;
        log::info!(
            "✅ 序列模型已加载: {} (序列长度 {})",
            path.as_ref().display(),
            config.sequence_length
        );
        Self::new(Box::new(engine), config)
    }

    pub fn add_frame(&mut self, frame: HeatmapFrame) {
        if self.buffer.push(frame).is_some() {
            debug!("序列已满, 丢弃最旧一帧");
        }
        debug!(
            "序列长度: {}/{}",
            self.buffer.len(),
            self.buffer.capacity()
        );
    }

    pub fn has_sufficient_data(&self) -> bool {
        self.buffer.is_full()
    }

    pub fn buffer(&self) -> &SequenceBuffer {
        &self.buffer
    }

    /// 运行序列模型, 失败 (或数据不足) 时返回 (0, 0)
    pub fn classify(&mut self) -> SequenceScores {
        if !self.has_sufficient_data() {
            warn!(
                "⚠️ 序列数据不足 ({}/{}), 跳过分类",
                self.buffer.len(),
                self.buffer.capacity()
            );
            return SequenceScores::default();
        }
        match self.try_classify() {
            Ok(scores) => {
                debug!(
                    "楼梯安全分数: safe={:.3}, unsafe={:.3}",
                    scores.safe_score, scores.unsafe_score
                );
                scores
            }
            Err(e) => {
                log::error!("❌ 序列模型推理失败: {e:#}");
                SequenceScores::default()
            }
        }
    }

    fn try_classify(&mut self) -> Result<SequenceScores> {
        let xs = self.buffer.to_tensor()?;
        let ys = self.backend.run(xs)?;
        let mut values = ys.iter().copied();
        match (values.next(), values.next()) {
            (Some(safe_score), Some(unsafe_score)) => {
                Ok(SequenceScores::new(safe_score, unsafe_score))
            }
            _ => bail!("Unexpected sequence output shape {:?}", ys.shape()),
        }
    }

    /// 使用配置中的阈值与差值判定
    pub fn decide(&self, scores: SequenceScores) -> HandrailStatus {
        let status = decide_with(
            scores,
            self.config.safety_threshold,
            self.config.margin,
        );
        debug!(
            "扶手判定: safe={:.3}, unsafe={:.3}, threshold={} → {:?}",
            scores.safe_score, scores.unsafe_score, self.config.safety_threshold, status
        );
        status
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
