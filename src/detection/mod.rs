/// 融合检测系统 (Detection System)
///
/// 每帧由调度器驱动三个模型并融合结果
/// - Association:  头部-安全帽关联
/// - Orchestrator: 按检测模式调度, 输出 DetectionResult
/// - Worker:       独立工作线程, 单帧在途, 忙时丢帧
pub mod association;
pub mod orchestrator;
pub mod types;
pub mod worker;

pub use association::{AssociationEngine, GearMatch};
pub use orchestrator::Orchestrator;
pub use types::{
    BoundingBox, Detection, DetectionResult, FrameSummary, GearDetection, HandrailStatus,
    Keypoint, KeypointType, PersonDetection, Point, ViolationMode,
};
pub use worker::{FrameWorker, WorkerCommand};
