//! 配置参数
//!
//! `PipelineConfig` 保存各模型的阈值与模型路径 (可从 JSON 文件加载, 缺省字段取默认值),
//! `Args` 是命令行参数, 命令行显式给出的值覆盖配置文件。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::models::stair_safety::{DEFAULT_MARGIN, DEFAULT_SAFETY_THRESHOLD, SEQUENCE_LENGTH};
use crate::models::ModelKind;
use crate::{TensorLayout, ViolationMode};

/// 姿态模型参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    pub input_size: u32,
    /// 人员置信度阈值
    pub conf: f32,
    /// 关键点可见阈值
    pub kpt_conf: f32,
    /// 至少需要的可见关键点数
    pub min_keypoints: usize,
    pub iou: f32,
}

impl Default for PoseConfig {
    fn default() -> Self {
        let kind = ModelKind::Pose;
        Self {
            input_size: kind.default_input_size().unwrap_or_default(),
            conf: kind.default_conf_threshold().unwrap_or_default(),
            kpt_conf: 0.2,
            min_keypoints: 3,
            iou: kind.default_iou_threshold(),
        }
    }
}

/// 安全帽模型参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelmetConfig {
    pub input_size: u32,
    pub conf: f32,
    pub iou: f32,
    /// 过滤宽或高不超过该值 (像素) 的框
    pub min_box_size: f32,
}

impl Default for HelmetConfig {
    fn default() -> Self {
        let kind = ModelKind::Helmet;
        Self {
            input_size: kind.default_input_size().unwrap_or_default(),
            conf: kind.default_conf_threshold().unwrap_or_default(),
            iou: kind.default_iou_threshold(),
            min_box_size: 5.0,
        }
    }
}

/// 头部-安全帽关联参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    pub iou_threshold: f32,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self { iou_threshold: 0.25 }
    }
}

/// 楼梯安全序列分类参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StairSafetyConfig {
    pub sequence_length: usize,
    /// 绝对阈值 (safe / unsafe 任一超过即判定)
    pub safety_threshold: f32,
    /// 都未超过阈值时, safe 领先 unsafe 的最小差值
    pub margin: f32,
}

impl Default for StairSafetyConfig {
    fn default() -> Self {
        Self {
            sequence_length: SEQUENCE_LENGTH,
            safety_threshold: DEFAULT_SAFETY_THRESHOLD,
            margin: DEFAULT_MARGIN,
        }
    }
}

/// 模型文件路径
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub pose: PathBuf,
    pub helmet: PathBuf,
    pub stair_safety: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            pose: PathBuf::from(ModelKind::Pose.default_model_file()),
            helmet: PathBuf::from(ModelKind::Helmet.default_model_file()),
            stair_safety: PathBuf::from(ModelKind::StairSafety.default_model_file()),
        }
    }
}

/// 流水线完整配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pose: PoseConfig,
    pub helmet: HelmetConfig,
    pub association: AssociationConfig,
    pub stair_safety: StairSafetyConfig,
    pub models: ModelPaths,
    pub layout: TensorLayout,
    pub initial_mode: ViolationMode,
}

impl PipelineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// 命令行参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "安全违规检测 - 安全帽 / 扶手", long_about = None)]
pub struct Args {
    /// 待检测图片 (按顺序作为连续帧处理)
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    /// JSON 配置文件
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 姿态模型
    #[arg(long)]
    pub pose_model: Option<PathBuf>,

    /// 安全帽模型
    #[arg(long)]
    pub helmet_model: Option<PathBuf>,

    /// 楼梯安全序列模型
    #[arg(long)]
    pub stair_model: Option<PathBuf>,

    /// 检测模式: helmet 或 handrail
    #[arg(short, long)]
    pub mode: Option<ViolationMode>,

    /// 输入张量排布
    #[arg(long, value_enum)]
    pub layout: Option<TensorLayout>,

    /// 相机旋转角度 (0/90/180/270)
    #[arg(long, default_value_t = 0)]
    pub rotation: i32,

    /// device id
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// using TensorRT EP
    #[arg(long)]
    pub trt: bool,

    /// using CUDA EP
    #[arg(long)]
    pub cuda: bool,
}

impl Args {
    /// 合并配置文件与命令行参数
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(p) = &self.pose_model {
            config.models.pose = p.clone();
        }
        if let Some(p) = &self.helmet_model {
            config.models.helmet = p.clone();
        }
        if let Some(p) = &self.stair_model {
            config.models.stair_safety = p.clone();
        }
        if let Some(mode) = self.mode {
            config.initial_mode = mode;
        }
        if let Some(layout) = self.layout {
            config.layout = layout;
        }
        Ok(config)
    }
}
