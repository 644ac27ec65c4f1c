/// 检测系统数据结构定义
/// Data structures for the detection system
use std::collections::BTreeMap;
use std::fmt;

use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ========== 枚举类型 ==========

/// 成像通道: 可见光 / 热成像
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Optical,
    Thermal,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Optical, Modality::Thermal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Optical => "optical",
            Modality::Thermal => "thermal",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ========== 数据结构 ==========

/// 检测框, 像素坐标 (左上角 + 宽高)
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// 由 (x1, y1, x2, y2) 构造
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x, b.y, b.w, b.h]
    }
}

/// 单个检测结果, 每轮检测重新生成, 发布后只读
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub label: String,
    pub score: f32, // 0.0 - 1.0
}

impl Detection {
    pub fn new(bbox: BBox, label: impl Into<String>, score: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            score: score.clamp(0.0, 1.0),
        }
    }

    /// 由模型类别ID构造, 标签表中没有的类别返回 None (忽略)
    pub fn from_class(bbox: BBox, class_id: u32, score: f32, labels: &LabelTable) -> Option<Self> {
        labels
            .label_for(class_id)
            .map(|label| Self::new(bbox, label, score))
    }
}

// ========== 标签表 ==========

/// COCO类别ID → 显示标签 (只保留需要关注的类别)
static COCO_LABELS: phf::Map<u32, &'static str> = phf_map! {
    0u32 => "person",
    1u32 => "bicycle",
    2u32 => "car",
    3u32 => "motorcycle",
    16u32 => "dog",
};

/// 类别ID与标签的对照表, 启动时校验
#[derive(Clone, Debug, PartialEq)]
pub struct LabelTable {
    entries: BTreeMap<u32, String>,
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::coco()
    }
}

impl LabelTable {
    pub fn coco() -> Self {
        Self {
            entries: COCO_LABELS
                .entries()
                .map(|(id, label)| (*id, label.to_string()))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, class_id: u32, label: impl Into<String>) -> Self {
        self.entries.insert(class_id, label.into());
        self
    }

    pub fn label_for(&self, class_id: u32) -> Option<&str> {
        self.entries.get(&class_id).map(String::as_str)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.values().any(|l| l == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }

    /// 校验一组标签全部在表中
    pub fn validate<'a>(&self, labels: impl IntoIterator<Item = &'a str>) -> Result<(), ConfigError> {
        for label in labels {
            if !self.contains(label) {
                return Err(ConfigError::UnknownLabel(label.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_table() {
        let table = LabelTable::coco();
        assert_eq!(table.label_for(0), Some("person"));
        assert_eq!(table.label_for(16), Some("dog"));
        assert_eq!(table.label_for(5), None);
        assert!(table.validate(["person", "car"]).is_ok());
        assert!(matches!(
            table.validate(["person", "giraffe"]),
            Err(ConfigError::UnknownLabel(l)) if l == "giraffe"
        ));
    }

    #[test]
    fn test_unmapped_class_is_ignored() {
        let table = LabelTable::coco();
        let bbox = BBox::from_xyxy(10.0, 20.0, 30.0, 60.0);
        assert_eq!(bbox, BBox::new(10.0, 20.0, 20.0, 40.0));
        assert!(Detection::from_class(bbox, 42, 0.9, &table).is_none());
        let det = Detection::from_class(bbox, 2, 0.7, &table).unwrap();
        assert_eq!(det.label, "car");
    }

    #[test]
    fn test_detection_json_shape() {
        let det: Detection =
            serde_json::from_str(r#"{"bbox":[1,2,3,4],"label":"person","score":0.9}"#).unwrap();
        assert_eq!(det.bbox, BBox::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(det.label, "person");
        assert_eq!(Modality::Thermal.to_string(), "thermal");
    }
}
