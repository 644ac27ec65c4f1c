//! 双光谱融合规则
//!
//! 两路都开启时要求两路同时发现入侵者, 只开一路时以该路为准,
//! 两路都关闭时永不触发。

use std::collections::BTreeSet;

use crate::detection::{Detection, Modality};

/// 是否存在被跟踪类别且置信度高于阈值的目标
pub fn has_intruder(detections: &[Detection], tracked: &BTreeSet<String>, sensitivity: f32) -> bool {
    detections
        .iter()
        .any(|d| d.score > sensitivity && tracked.contains(&d.label))
}

/// 单路读数: `None` 表示该路已关闭
pub type Reading = Option<bool>;

/// 合并两路的入侵判断
pub fn combined_trigger(optical: Reading, thermal: Reading) -> bool {
    match (optical, thermal) {
        (Some(o), Some(t)) => o && t,
        (Some(o), None) => o,
        (None, Some(t)) => t,
        (None, None) => false,
    }
}

/// 需要高亮边框的画面
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Highlight {
    pub optical: bool,
    pub thermal: bool,
}

impl Highlight {
    /// 与报警相同的合取规则: 只有参与触发的画面才会高亮
    pub fn from_readings(optical: Reading, thermal: Reading) -> Self {
        let fired = combined_trigger(optical, thermal);
        Self {
            optical: fired && optical.is_some(),
            thermal: fired && thermal.is_some(),
        }
    }

    pub fn get(&self, modality: Modality) -> bool {
        match modality {
            Modality::Optical => self.optical,
            Modality::Thermal => self.thermal,
        }
    }

    pub fn any(&self) -> bool {
        self.optical || self.thermal
    }
}

/// 平均置信度, 没有检测结果时为0
pub fn mean_score(detections: &[Detection]) -> f32 {
    if detections.is_empty() {
        return 0.0;
    }
    detections.iter().map(|d| d.score).sum::<f32>() / detections.len() as f32
}

/// 至少一路有把握的概率: 1 - (1-p光学)(1-p热成像)
pub fn combined_confidence(optical: f32, thermal: f32) -> f32 {
    let po = optical.clamp(0.0, 1.0);
    let pt = thermal.clamp(0.0, 1.0);
    1.0 - (1.0 - po) * (1.0 - pt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    fn det(label: &str, score: f32) -> Detection {
        Detection::new(BBox::new(0.0, 0.0, 10.0, 10.0), label, score)
    }

    fn tracked(labels: &[&str]) -> BTreeSet<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_has_intruder_requires_label_and_score() {
        let people = tracked(&["person"]);
        assert!(has_intruder(&[det("person", 0.9)], &people, 0.5));
        assert!(!has_intruder(&[det("person", 0.5)], &people, 0.5));
        assert!(!has_intruder(&[det("car", 0.99)], &people, 0.5));
        assert!(!has_intruder(&[], &people, 0.0));
        assert!(!has_intruder(&[det("person", 0.9)], &tracked(&[]), 0.5));
    }

    #[test]
    fn test_conjunctive_trigger() {
        // 只开光学
        assert!(combined_trigger(Some(true), None));
        assert!(!combined_trigger(Some(false), None));
        // 两路都开: 必须同时发现
        assert!(!combined_trigger(Some(false), Some(true)));
        assert!(!combined_trigger(Some(true), Some(false)));
        assert!(combined_trigger(Some(true), Some(true)));
        // 只开热成像
        assert!(combined_trigger(None, Some(true)));
        // 都关闭
        assert!(!combined_trigger(None, None));
    }

    #[test]
    fn test_highlight_follows_trigger() {
        assert_eq!(
            Highlight::from_readings(Some(true), Some(true)),
            Highlight { optical: true, thermal: true }
        );
        assert_eq!(Highlight::from_readings(Some(true), Some(false)), Highlight::default());
        let only_thermal = Highlight::from_readings(None, Some(true));
        assert!(only_thermal.get(Modality::Thermal));
        assert!(!only_thermal.get(Modality::Optical));
    }

    #[test]
    fn test_confidence_readout() {
        let optical = [det("person", 0.9), det("car", 0.7)];
        let thermal = [det("person", 0.6)];
        let combined = combined_confidence(mean_score(&optical), mean_score(&thermal));
        assert!((combined - 0.92).abs() < 1e-5);
        assert_eq!(mean_score(&[]), 0.0);
        assert_eq!(combined_confidence(0.0, 0.0), 0.0);
    }
}
