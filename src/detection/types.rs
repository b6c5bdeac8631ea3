//! 安全检测数据结构定义
//! Data structures for the safety detection pipeline

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ========== 几何 ==========

/// 检测框 (原图像素坐标, left/top/right/bottom)
///
/// 构造时保证 `right >= left`, `bottom >= top`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right: right.max(left),
            bottom: bottom.max(top),
        }
    }

    /// 中心点格式 (cx, cy, w, h) → 角点格式
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2., cy - h / 2., cx + w / 2., cy + h / 2.)
    }

    pub fn left(&self) -> f32 {
        self.left
    }

    pub fn top(&self) -> f32 {
        self.top
    }

    pub fn right(&self) -> f32 {
        self.right
    }

    pub fn bottom(&self) -> f32 {
        self.bottom
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.left + self.right) / 2.,
            (self.top + self.bottom) / 2.,
        )
    }

    /// 裁剪到图像范围 [0, width] × [0, height]
    pub fn clamp_to(&self, width: f32, height: f32) -> Self {
        Self::new(
            self.left.max(0.),
            self.top.max(0.),
            self.right.min(width),
            self.bottom.min(height),
        )
    }

    pub fn intersection_area(&self, another: &BoundingBox) -> f32 {
        let w = (self.right.min(another.right) - self.left.max(another.left)).max(0.);
        let h = (self.bottom.min(another.bottom) - self.top.max(another.top)).max(0.);
        w * h
    }

    pub fn union_area(&self, another: &BoundingBox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// 交并比, 并集面积 <= 0 (退化框) 时返回 0
    pub fn iou(&self, another: &BoundingBox) -> f32 {
        let union = self.union_area(another);
        if union <= 0. {
            return 0.;
        }
        (self.intersection_area(another) / union).clamp(0., 1.)
    }

    /// 宽松重叠判断: 只要两个轴上都没有完全分离即为重叠 (贴边也算)
    pub fn overlaps(&self, another: &BoundingBox) -> bool {
        !(self.right < another.left
            || self.left > another.right
            || self.bottom < another.top
            || self.top > another.bottom)
    }
}

/// 二维点 (原图像素坐标)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

// ========== 关键点 ==========

/// COCO 17 关键点
///
/// 枚举值即模型输出中的关键点序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypointType {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

/// 名称 → 关键点类型
static KEYPOINT_NAMES: phf::Map<&'static str, KeypointType> = phf::phf_map! {
    "nose" => KeypointType::Nose,
    "left_eye" => KeypointType::LeftEye,
    "right_eye" => KeypointType::RightEye,
    "left_ear" => KeypointType::LeftEar,
    "right_ear" => KeypointType::RightEar,
    "left_shoulder" => KeypointType::LeftShoulder,
    "right_shoulder" => KeypointType::RightShoulder,
    "left_elbow" => KeypointType::LeftElbow,
    "right_elbow" => KeypointType::RightElbow,
    "left_wrist" => KeypointType::LeftWrist,
    "right_wrist" => KeypointType::RightWrist,
    "left_hip" => KeypointType::LeftHip,
    "right_hip" => KeypointType::RightHip,
    "left_knee" => KeypointType::LeftKnee,
    "right_knee" => KeypointType::RightKnee,
    "left_ankle" => KeypointType::LeftAnkle,
    "right_ankle" => KeypointType::RightAnkle,
};

impl KeypointType {
    pub const COUNT: usize = 17;

    /// 按序号排列的全部关键点
    pub const ALL: [KeypointType; 17] = [
        KeypointType::Nose,
        KeypointType::LeftEye,
        KeypointType::RightEye,
        KeypointType::LeftEar,
        KeypointType::RightEar,
        KeypointType::LeftShoulder,
        KeypointType::RightShoulder,
        KeypointType::LeftElbow,
        KeypointType::RightElbow,
        KeypointType::LeftWrist,
        KeypointType::RightWrist,
        KeypointType::LeftHip,
        KeypointType::RightHip,
        KeypointType::LeftKnee,
        KeypointType::RightKnee,
        KeypointType::LeftAnkle,
        KeypointType::RightAnkle,
    ];

    /// 头部关键点 (用于计算头部区域)
    pub const HEAD_KEYPOINTS: [KeypointType; 5] = [
        KeypointType::Nose,
        KeypointType::LeftEye,
        KeypointType::RightEye,
        KeypointType::LeftEar,
        KeypointType::RightEar,
    ];

    /// 骨架连线 (仅供渲染使用)
    pub const POSE_PAIRS: [(KeypointType, KeypointType); 16] = [
        // 面部
        (KeypointType::Nose, KeypointType::LeftEye),
        (KeypointType::Nose, KeypointType::RightEye),
        (KeypointType::LeftEye, KeypointType::LeftEar),
        (KeypointType::RightEye, KeypointType::RightEar),
        // 手臂
        (KeypointType::LeftShoulder, KeypointType::RightShoulder),
        (KeypointType::LeftShoulder, KeypointType::LeftElbow),
        (KeypointType::LeftElbow, KeypointType::LeftWrist),
        (KeypointType::RightShoulder, KeypointType::RightElbow),
        (KeypointType::RightElbow, KeypointType::RightWrist),
        // 躯干
        (KeypointType::LeftShoulder, KeypointType::LeftHip),
        (KeypointType::RightShoulder, KeypointType::RightHip),
        (KeypointType::LeftHip, KeypointType::RightHip),
        // 腿
        (KeypointType::LeftHip, KeypointType::LeftKnee),
        (KeypointType::LeftKnee, KeypointType::LeftAnkle),
        (KeypointType::RightHip, KeypointType::RightKnee),
        (KeypointType::RightKnee, KeypointType::RightAnkle),
    ];

    pub fn id(self) -> usize {
        self as usize
    }

    pub fn from_id(id: usize) -> Option<Self> {
        Self::ALL.get(id).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        KEYPOINT_NAMES.get(name).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            KeypointType::Nose => "nose",
            KeypointType::LeftEye => "left_eye",
            KeypointType::RightEye => "right_eye",
            KeypointType::LeftEar => "left_ear",
            KeypointType::RightEar => "right_ear",
            KeypointType::LeftShoulder => "left_shoulder",
            KeypointType::RightShoulder => "right_shoulder",
            KeypointType::LeftElbow => "left_elbow",
            KeypointType::RightElbow => "right_elbow",
            KeypointType::LeftWrist => "left_wrist",
            KeypointType::RightWrist => "right_wrist",
            KeypointType::LeftHip => "left_hip",
            KeypointType::RightHip => "right_hip",
            KeypointType::LeftKnee => "left_knee",
            KeypointType::RightKnee => "right_knee",
            KeypointType::LeftAnkle => "left_ankle",
            KeypointType::RightAnkle => "right_ankle",
        }
    }

    pub fn is_head(self) -> bool {
        Self::HEAD_KEYPOINTS.contains(&self)
    }
}

/// 姿态关键点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub position: Point,
    pub confidence: f32,
    pub kind: KeypointType,
}

// ========== 检测结果 ==========

/// 可参与 NMS 的检测 (带检测框和置信度)
pub trait Detection {
    fn bbox(&self) -> &BoundingBox;
    fn confidence(&self) -> f32;
}

/// 人员检测 (姿态模型输出, 再由关联/时序分类补充标注)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonDetection {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    /// 按 `KeypointType` 序号排列的 17 个关键点
    pub keypoints: Vec<Keypoint>,
    pub head_bounding_box: Option<BoundingBox>,
    pub has_protective_gear: bool,
    pub holds_handrail: bool,
}

impl PersonDetection {
    pub fn keypoint(&self, kind: KeypointType) -> Option<&Keypoint> {
        self.keypoints.get(kind.id())
    }
}

impl Detection for PersonDetection {
    fn bbox(&self) -> &BoundingBox {
        &self.bounding_box
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// 安全帽检测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GearDetection {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    /// 是否已关联到某个人的头部
    pub is_associated: bool,
}

impl Detection for GearDetection {
    fn bbox(&self) -> &BoundingBox {
        &self.bounding_box
    }

    fn confidence(&self) -> f32 {
        self.confidence
    }
}

// ========== 枚举类型 ==========

/// 违规检测模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationMode {
    /// 未佩戴安全帽
    #[default]
    Helmet,
    /// 上下楼梯未扶扶手
    Handrail,
}

impl ViolationMode {
    pub fn display_name(&self) -> &'static str {
        match self {
            ViolationMode::Helmet => "Failure to wear a safety helmet",
            ViolationMode::Handrail => "Failure to hold the handrail on stairs",
        }
    }
}

impl fmt::Display for ViolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationMode::Helmet => write!(f, "helmet"),
            ViolationMode::Handrail => write!(f, "handrail"),
        }
    }
}

impl FromStr for ViolationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "helmet" => Ok(ViolationMode::Helmet),
            "handrail" | "stairs" => Ok(ViolationMode::Handrail),
            other => bail!("Unknown violation mode: {other}"),
        }
    }
}

/// 扶手使用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandrailStatus {
    Safe,
    Unsafe,
    /// 序列数据不足 (或当前不是扶手模式)
    #[default]
    Unknown,
}

/// 单帧统计 (供持久化层记录)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameSummary {
    pub person_count: usize,
    pub with_gear: usize,
    pub without_gear: usize,
    pub unassociated_gear: usize,
}

/// 单帧融合结果 (检测模块 → 渲染/持久化)
///
/// 构造后只读, 下游拿到的是快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    person_detections: Vec<PersonDetection>,
    gear_detections: Vec<GearDetection>,
    holds_handrail_overall: bool,
    handrail_safe_score: f32,
    handrail_unsafe_score: f32,
    handrail_status: HandrailStatus,
    mode: ViolationMode,
    processing_time_ms: f64,
    image_width: u32,
    image_height: u32,
    timestamp: DateTime<Utc>,
}

impl DetectionResult {
    /// 安全帽模式结果
    pub(crate) fn helmet(
        person_detections: Vec<PersonDetection>,
        gear_detections: Vec<GearDetection>,
        processing_time_ms: f64,
        (image_width, image_height): (u32, u32),
    ) -> Self {
        Self {
            person_detections,
            gear_detections,
            holds_handrail_overall: false,
            handrail_safe_score: 0.,
            handrail_unsafe_score: 0.,
            handrail_status: HandrailStatus::Unknown,
            mode: ViolationMode::Helmet,
            processing_time_ms,
            image_width,
            image_height,
            timestamp: Utc::now(),
        }
    }

    /// 扶手模式结果
    pub(crate) fn handrail(
        person_detections: Vec<PersonDetection>,
        (safe_score, unsafe_score): (f32, f32),
        handrail_status: HandrailStatus,
        processing_time_ms: f64,
        (image_width, image_height): (u32, u32),
    ) -> Self {
        Self {
            person_detections,
            gear_detections: Vec::new(),
            holds_handrail_overall: handrail_status == HandrailStatus::Safe,
            handrail_safe_score: safe_score,
            handrail_unsafe_score: unsafe_score,
            handrail_status,
            mode: ViolationMode::Handrail,
            processing_time_ms,
            image_width,
            image_height,
            timestamp: Utc::now(),
        }
    }

    pub fn person_detections(&self) -> &[PersonDetection] {
        &self.person_detections
    }

    pub fn gear_detections(&self) -> &[GearDetection] {
        &self.gear_detections
    }

    pub fn holds_handrail_overall(&self) -> bool {
        self.holds_handrail_overall
    }

    pub fn handrail_safe_score(&self) -> f32 {
        self.handrail_safe_score
    }

    pub fn handrail_unsafe_score(&self) -> f32 {
        self.handrail_unsafe_score
    }

    pub fn handrail_status(&self) -> HandrailStatus {
        self.handrail_status
    }

    pub fn mode(&self) -> ViolationMode {
        self.mode
    }

    pub fn processing_time_ms(&self) -> f64 {
        self.processing_time_ms
    }

    pub fn image_width(&self) -> u32 {
        self.image_width
    }

    pub fn image_height(&self) -> u32 {
        self.image_height
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn summary(&self) -> FrameSummary {
        let with_gear = self
            .person_detections
            .iter()
            .filter(|p| p.has_protective_gear)
            .count();
        FrameSummary {
            person_count: self.person_detections.len(),
            with_gear,
            without_gear: self.person_detections.len() - with_gear,
            unassociated_gear: self
                .gear_detections
                .iter()
                .filter(|g| !g.is_associated)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_box(rng: &mut impl Rng) -> BoundingBox {
        let l = rng.gen_range(0.0..500.0);
        let t = rng.gen_range(0.0..500.0);
        BoundingBox::new(
            l,
            t,
            l + rng.gen_range(0.0..200.0),
            t + rng.gen_range(0.0..200.0),
        )
    }

    #[test]
    fn test_new_clamps_inverted_corners() {
        let b = BoundingBox::new(10., 20., 5., 15.);
        assert_eq!(b.right(), 10.);
        assert_eq!(b.bottom(), 20.);
        assert_eq!(b.area(), 0.);
    }

    #[test]
    fn test_iou_symmetric_and_bounded() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let a = random_box(&mut rng);
            let b = random_box(&mut rng);
            let ab = a.iou(&b);
            let ba = b.iou(&a);
            assert!((ab - ba).abs() < 1e-6, "iou not symmetric: {ab} vs {ba}");
            assert!((0.0..=1.0).contains(&ab));
        }
    }

    #[test]
    fn test_iou_self_is_one() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let a = random_box(&mut rng);
            if a.area() > 0. {
                assert!((a.iou(&a) - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_iou_disjoint_and_degenerate() {
        let a = BoundingBox::new(0., 0., 10., 10.);
        let b = BoundingBox::new(20., 20., 30., 30.);
        assert_eq!(a.iou(&b), 0.);

        let p = BoundingBox::new(5., 5., 5., 5.);
        assert_eq!(p.iou(&p), 0.);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = BoundingBox::new(0., 0., 10., 10.);
        let b = BoundingBox::new(5., 0., 15., 10.);
        // 交 50, 并 150
        assert!((a.iou(&b) - 1. / 3.).abs() < 1e-6);
    }

    #[test]
    fn test_overlaps() {
        let a = BoundingBox::new(0., 0., 10., 10.);
        assert!(a.overlaps(&BoundingBox::new(10., 10., 20., 20.)));
        assert!(a.overlaps(&BoundingBox::new(4., 4., 4., 4.)));
        assert!(!a.overlaps(&BoundingBox::new(10.5, 0., 20., 10.)));
        assert!(!a.overlaps(&BoundingBox::new(0., -20., 10., -0.5)));
    }

    #[test]
    fn test_keypoint_ids_and_names() {
        for (i, kind) in KeypointType::ALL.iter().enumerate() {
            assert_eq!(kind.id(), i);
            assert_eq!(KeypointType::from_id(i), Some(*kind));
            assert_eq!(KeypointType::from_name(kind.name()), Some(*kind));
        }
        assert_eq!(KeypointType::from_id(17), None);
        assert_eq!(KeypointType::from_name("tail"), None);
        assert!(KeypointType::Nose.is_head());
        assert!(!KeypointType::LeftWrist.is_head());
    }

    #[test]
    fn test_violation_mode_parse() {
        assert_eq!("helmet".parse::<ViolationMode>().unwrap(), ViolationMode::Helmet);
        assert_eq!(" Handrail ".parse::<ViolationMode>().unwrap(), ViolationMode::Handrail);
        assert!("smoking".parse::<ViolationMode>().is_err());
        assert_eq!(ViolationMode::Handrail.to_string(), "handrail");
    }

    #[test]
    fn test_summary_counts() {
        let person = |gear| PersonDetection {
            bounding_box: BoundingBox::new(0., 0., 10., 20.),
            confidence: 0.9,
            keypoints: Vec::new(),
            head_bounding_box: None,
            has_protective_gear: gear,
            holds_handrail: false,
        };
        let gear = |assoc| GearDetection {
            bounding_box: BoundingBox::new(0., 0., 5., 5.),
            confidence: 0.8,
            is_associated: assoc,
        };
        let result = DetectionResult::helmet(
            vec![person(true), person(false), person(false)],
            vec![gear(true), gear(false)],
            1.0,
            (640, 480),
        );
        let s = result.summary();
        assert_eq!(s.person_count, 3);
        assert_eq!(s.with_gear, 1);
        assert_eq!(s.without_gear, 2);
        assert_eq!(s.unassociated_gear, 1);
        assert_eq!(result.handrail_status(), HandrailStatus::Unknown);
    }
}
