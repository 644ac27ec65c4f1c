//! 检测器接口 (Detector boundary)
//!
//! 模型本身不在本系统内: 任何能把一帧图像变成 (检测框, 标签, 置信度)
//! 列表的实现都可以接入检测线程。

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::types::Detection;
use crate::error::DetectionError;
use crate::input::Frame;

/// 目标检测器: 一帧图像 → 检测结果列表
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError>;

    fn name(&self) -> &str {
        "detector"
    }
}

impl<D: ObjectDetector + ?Sized> ObjectDetector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        (**self).detect(frame)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// 不产生任何结果的检测器 (未接入模型时使用)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl ObjectDetector for NullDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// 脚本检测器: 按调用顺序回放预先录制的检测结果
///
/// 与文件回放源配合, 可以离线复现一次报警过程
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptedDetector {
    passes: Vec<Vec<Detection>>,
    #[serde(default)]
    repeat: bool,
    #[serde(skip)]
    cursor: usize,
}

impl ScriptedDetector {
    pub fn new(passes: Vec<Vec<Detection>>) -> Self {
        Self {
            passes,
            repeat: false,
            cursor: 0,
        }
    }

    pub fn repeating(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// 从JSON文件加载: {"passes": [[{"bbox":[x,y,w,h],"label":"person","score":0.9}], []], "repeat": false}
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("读取检测脚本失败: {}", path.display()))?;
        let script: Self = serde_json::from_str(&json)
            .with_context(|| format!("解析检测脚本失败: {}", path.display()))?;
        Ok(script)
    }

    /// 已执行的检测次数
    pub fn calls(&self) -> usize {
        self.cursor
    }
}

impl ObjectDetector for ScriptedDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let index = self.cursor;
        self.cursor += 1;

        if self.passes.is_empty() {
            return Ok(Vec::new());
        }
        let pass = if self.repeat {
            self.passes.get(index % self.passes.len())
        } else {
            self.passes.get(index)
        };
        Ok(pass.cloned().unwrap_or_default())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
