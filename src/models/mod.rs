// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 模型适配器
///
/// # 架构说明
///
/// 三个模型都只通过 `InferenceBackend` 交互 (输入张量 → 输出张量), 各适配器负责
/// 自己的预处理和输出解码, 输出类型各不相同:
///
/// - **PoseDetector**: 姿态模型 → `Vec<PersonDetection>` + 最近一次的原始输出 (用于生成热力图)
///   - 文件: `pose.rs`
/// - **HelmetDetector**: 安全帽模型 → `Vec<GearDetection>`
///   - 文件: `helmet.rs`
/// - **StairSafetyClassifier**: 热力图序列 → (safe, unsafe) 分数
///   - 文件: `stair_safety.rs`
///
/// ```text
/// 原始图片 → Letterbox → 输入张量 → backend.run → 原始输出 → decode → NMS → 检测结果
/// ```
// 各模型的具体实现
pub mod helmet; // 安全帽检测
pub mod pose; // 姿态估计 + 热力图
pub mod stair_safety; // 楼梯扶手序列分类

// Re-exports
pub use helmet::HelmetDetector;
pub use pose::PoseDetector;
pub use stair_safety::{
    decide, HeatmapFrame, SequenceBuffer, SequenceScores, StairSafetyClassifier,
};

/// 模型类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// 人体姿态 (17 关键点)
    Pose,
    /// 安全帽检测
    Helmet,
    /// 楼梯扶手序列分类
    StairSafety,
}

impl ModelKind {
    /// 模型输入边长, 序列模型没有图像输入
    pub fn default_input_size(&self) -> Option<u32> {
        match self {
            ModelKind::Pose => Some(640),
            ModelKind::Helmet => Some(416),
            ModelKind::StairSafety => None,
        }
    }

    /// 获取模型推荐的检测置信度阈值, 序列模型不输出检测框
    pub fn default_conf_threshold(&self) -> Option<f32> {
        match self {
            ModelKind::Pose | ModelKind::Helmet => Some(0.25),
            ModelKind::StairSafety => None,
        }
    }

    /// 获取模型推荐的IOU阈值
    pub fn default_iou_threshold(&self) -> f32 {
        0.45
    }

    /// 默认模型文件
    pub fn default_model_file(&self) -> &'static str {
        match self {
            ModelKind::Pose => "models/yolov11n_pose.onnx",
            ModelKind::Helmet => "models/helmet_detection.onnx",
            ModelKind::StairSafety => "models/stair_safety_detection.onnx",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Pose => write!(f, "pose"),
            ModelKind::Helmet => write!(f, "helmet"),
            ModelKind::StairSafety => write!(f, "stair-safety"),
        }
    }
}
