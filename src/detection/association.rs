/// 头部-安全帽关联
///
/// 对每个人的头部框, 在安全帽检测中找 IoU 最大的一个:
///
/// ```text
/// has_gear = max_iou > 阈值 (0.25) || overlaps(头部框, 最佳安全帽框)
/// ```
///
/// IoU 为主要依据; 头部框与安全帽框尺度差异很大时 IoU 偏低, 用宽松的重叠判断兜底。
/// 匹配成功的安全帽标记为 `is_associated`, 剩下的就是 "画面中有但没人戴" 的安全帽。
use log::debug;

use crate::config::AssociationConfig;
use crate::{BoundingBox, GearDetection, PersonDetection};

/// 单个头部框的关联结果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GearMatch {
    pub has_gear: bool,
    /// 匹配成功时为安全帽下标
    pub matched_index: Option<usize>,
    /// 最佳候选的 IoU
    pub iou: f32,
}

#[derive(Debug, Clone)]
pub struct AssociationEngine {
    iou_threshold: f32,
}

impl Default for AssociationEngine {
    fn default() -> Self {
        Self::new(AssociationConfig::default())
    }
}

impl AssociationEngine {
    pub fn new(config: AssociationConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
        }
    }

    /// 头部框与安全帽列表关联, 列表为空时不匹配
    pub fn associate(&self, head: &BoundingBox, gear: &[GearDetection]) -> GearMatch {
        // IoU 最大者, 相同时取靠前的
        let mut best: Option<(usize, f32)> = None;
        for (i, g) in gear.iter().enumerate() {
            let iou = head.iou(&g.bounding_box);
            if best.map_or(true, |(_, max_iou)| iou > max_iou) {
                best = Some((i, iou));
            }
        }

        let Some((index, iou)) = best else {
            return GearMatch::default();
        };
        let has_gear = iou > self.iou_threshold || head.overlaps(&gear[index].bounding_box);
        GearMatch {
            has_gear,
            matched_index: has_gear.then_some(index),
            iou,
        }
    }

    /// 标注每个人是否佩戴安全帽, 并标记被关联的安全帽
    ///
    /// 没有头部框的人不参与关联, 视为未佩戴
    pub fn annotate(&self, persons: &mut [PersonDetection], gear: &mut [GearDetection]) {
        for (n, person) in persons.iter_mut().enumerate() {
            let Some(head) = person.head_bounding_box else {
                person.has_protective_gear = false;
                debug!("人员 #{n}: 无头部框, 跳过关联");
                continue;
            };

            let m = self.associate(&head, gear);
            person.has_protective_gear = m.has_gear;
            if let Some(i) = m.matched_index {
                gear[i].is_associated = true;
            }
            debug!(
                "人员 #{n}: has_gear={}, best_iou={:.3}, matched={:?}",
                m.has_gear, m.iou, m.matched_index
            );
        }
    }
}
