/// 检测调度器
///
/// 持有三个模型适配器、关联引擎和当前检测模式, 每帧按模式输出一个 `DetectionResult`:
///
/// ```text
/// Helmet:   姿态 + 安全帽 → 头部关联 → has_protective_gear
/// Handrail: 姿态 → 热力图入序列 → (序列满) 分类 + 判定 → holds_handrail
/// ```
///
/// 模式只由调用方切换, 任何一次模式变化都会清空热力图序列。
use std::time::Instant;

use anyhow::Result;
use image::DynamicImage;
use log::{debug, info};

use crate::config::PipelineConfig;
use crate::models::{HelmetDetector, PoseDetector, StairSafetyClassifier};
use crate::{
    AssociationEngine, DetectionResult, HandrailStatus, InferenceBackend, SequenceScores,
    ViolationMode,
};

pub struct Orchestrator {
    pose: PoseDetector,
    helmet: HelmetDetector,
    stair_safety: StairSafetyClassifier,
    association: AssociationEngine,
    mode: ViolationMode,
}

impl Orchestrator {
    pub fn new(
        pose: PoseDetector,
        helmet: HelmetDetector,
        stair_safety: StairSafetyClassifier,
        association: AssociationEngine,
        mode: ViolationMode,
    ) -> Self {
        Self {
            pose,
            helmet,
            stair_safety,
            association,
            mode,
        }
    }

    /// 由三个已构建的后端和配置组装
    pub fn from_backends(
        config: &PipelineConfig,
        pose: Box<dyn InferenceBackend>,
        helmet: Box<dyn InferenceBackend>,
        stair_safety: Box<dyn InferenceBackend>,
    ) -> Result<Self> {
        Ok(Self::new(
            PoseDetector::new(pose, config.pose.clone(), config.layout)?,
            HelmetDetector::new(helmet, config.helmet.clone(), config.layout)?,
            StairSafetyClassifier::new(stair_safety, config.stair_safety.clone())?,
            AssociationEngine::new(config.association.clone()),
            config.initial_mode,
        ))
    }

    /// 按配置加载三个 ONNX 模型, 任何一个加载失败都直接返回错误
    #[cfg(feature = "ort-backend")]
    pub fn from_config(config: &PipelineConfig, ep: crate::OrtEP) -> Result<Self> {
        use anyhow::Context;

        let models = &config.models;
        let pose = PoseDetector::from_file(
            &models.pose,
            ep,
            config.pose.clone(),
            config.layout,
        )
        .with_context(|| format!("Failed to load pose model {}", models.pose.display()))?;
        let helmet = HelmetDetector::from_file(
            &models.helmet,
            ep,
            config.helmet.clone(),
            config.layout,
        )
        .with_context(|| format!("Failed to load helmet model {}", models.helmet.display()))?;
        let stair_safety =
            StairSafetyClassifier::from_file(&models.stair_safety, ep, config.stair_safety.clone())
                .with_context(|| {
                    format!(
                        "Failed to load stair safety model {}",
                        models.stair_safety.display()
                    )
                })?;

        Ok(Self::new(
            pose,
            helmet,
            stair_safety,
            AssociationEngine::new(config.association.clone()),
            config.initial_mode,
        ))
    }

    pub fn mode(&self) -> ViolationMode {
        self.mode
    }

    /// 切换检测模式, 模式不变时什么也不做
    pub fn set_mode(&mut self, mode: ViolationMode) {
        if mode == self.mode {
            return;
        }
        info!("🔄 检测模式: {} → {}", self.mode, mode);
        self.stair_safety.reset();
        self.mode = mode;
    }

    /// 清空扶手序列 (会话边界)
    pub fn reset(&mut self) {
        self.stair_safety.reset();
    }

    pub fn has_sufficient_data(&self) -> bool {
        self.stair_safety.has_sufficient_data()
    }

    pub fn sequence_len(&self) -> usize {
        self.stair_safety.buffer().len()
    }

    /// 以指定模式处理一帧
    pub fn process_frame(&mut self, image: &DynamicImage, mode: ViolationMode) -> DetectionResult {
        self.set_mode(mode);
        self.process(image)
    }

    /// 以当前模式处理一帧
    pub fn process(&mut self, image: &DynamicImage) -> DetectionResult {
        let t = Instant::now();
        let size = (image.width(), image.height());

        match self.mode {
            ViolationMode::Helmet => {
                let mut persons = self.pose.detect(image);
                let mut gear = self.helmet.detect(image);
                debug!("Found {} people and {} helmets", persons.len(), gear.len());

                self.association.annotate(&mut persons, &mut gear);
                DetectionResult::helmet(persons, gear, elapsed_ms(t), size)
            }
            ViolationMode::Handrail => {
                let mut persons = self.pose.detect(image);
                if let Some(frame) = self.pose.last_heatmap_flattened() {
                    self.stair_safety.add_frame(frame);
                }

                let (scores, status) = if self.stair_safety.has_sufficient_data() {
                    let scores = self.stair_safety.classify();
                    (scores, self.stair_safety.decide(scores))
                } else {
                    // 序列未满: 收集数据中
                    (SequenceScores::default(), HandrailStatus::Unknown)
                };

                let holds = status == HandrailStatus::Safe;
                for person in persons.iter_mut() {
                    person.holds_handrail = holds;
                }
                DetectionResult::handrail(
                    persons,
                    (scores.safe_score, scores.unsafe_score),
                    status,
                    elapsed_ms(t),
                    size,
                )
            }
        }
    }
}

fn elapsed_ms(t: Instant) -> f64 {
    t.elapsed().as_secs_f64() * 1000.
}
