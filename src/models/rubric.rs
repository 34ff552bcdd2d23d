//! 评分细则
//!
//! 每个评估题目有一份细则配置：自动/人工两部分各自的设置，以及共用的细则项列表

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::RubricItemId;

/// 细则项作用于哪一部分得分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RubricType {
    Auto,
    Manual,
}

impl RubricType {
    pub fn label(&self) -> &'static str {
        match self {
            RubricType::Auto => "auto",
            RubricType::Manual => "manual",
        }
    }
}

/// 起始分
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingPoints {
    /// 从 0 开始加分（正向评分）
    #[default]
    Zero,
    /// 从满分开始扣分（负向评分）
    Max,
    Custom(f64),
}

impl StartingPoints {
    /// 解析为具体分值
    pub fn resolve(&self, max_points: f64) -> f64 {
        match self {
            StartingPoints::Zero => 0.0,
            StartingPoints::Max => max_points,
            StartingPoints::Custom(points) => *points,
        }
    }
}

/// 某一部分（自动/人工）的细则设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricSettings {
    pub use_rubric: bool,
    pub starting_points: StartingPoints,
    /// 细则计算结果的下限
    pub min_points: f64,
    /// 允许超过满分的额外分
    pub max_extra_points: f64,
}

impl Default for RubricSettings {
    fn default() -> Self {
        Self {
            use_rubric: false,
            starting_points: StartingPoints::Zero,
            min_points: 0.0,
            max_extra_points: 0.0,
        }
    }
}

/// 细则项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricItem {
    pub id: RubricItemId,
    pub rubric_type: RubricType,
    /// 显示顺序，同时决定排序
    pub order: i64,
    /// 带符号的分值
    pub points: f64,
    pub description: String,
    pub explanation: Option<String>,
    pub grader_note: Option<String>,
    pub always_show_to_students: bool,
}

/// 一个评估题目的细则配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RubricConfig {
    pub auto: RubricSettings,
    pub manual: RubricSettings,
    /// 按 `order` 排序
    pub items: Vec<RubricItem>,
}

impl RubricConfig {
    pub fn settings(&self, rubric_type: RubricType) -> &RubricSettings {
        match rubric_type {
            RubricType::Auto => &self.auto,
            RubricType::Manual => &self.manual,
        }
    }

    pub fn settings_mut(&mut self, rubric_type: RubricType) -> &mut RubricSettings {
        match rubric_type {
            RubricType::Auto => &mut self.auto,
            RubricType::Manual => &mut self.manual,
        }
    }

    pub fn item(&self, id: RubricItemId) -> Option<&RubricItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn items_of(&self, rubric_type: RubricType) -> impl Iterator<Item = &RubricItem> {
        self.items
            .iter()
            .filter(move |item| item.rubric_type == rubric_type)
    }
}

/// 表单提交的细则项
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RubricItemInput {
    #[serde(default)]
    pub order: i64,
    pub points: Option<f64>,
    #[serde(default)]
    pub short_text: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub grader_note: Option<String>,
    #[serde(default)]
    pub always_show_to_students: bool,
}

impl RubricItemInput {
    /// 简短描述：优先使用 `short_text`
    pub fn label(&self) -> Option<&str> {
        self.short_text
            .as_deref()
            .or(self.description.as_deref())
            .map(str::trim)
    }

    /// 详细说明：同时提供了 `short_text` 时 `description` 作为说明
    pub fn detail(&self) -> Option<String> {
        match (&self.short_text, &self.description, &self.explanation) {
            (_, _, Some(explanation)) => Some(explanation.clone()),
            (Some(_), Some(description), None) => Some(description.clone()),
            _ => None,
        }
    }
}

/// 细则设置更新表单
///
/// `rubric_item` 的键为已有细则项 ID 时更新该项，否则新建；
/// 该部分已有但未出现在表单中的细则项被删除
#[derive(Debug, Clone, Deserialize)]
pub struct RubricSettingsUpdate {
    #[serde(default = "default_rubric_type")]
    pub rubric_type: RubricType,
    #[serde(alias = "use_rubrics")]
    pub use_rubric: bool,
    #[serde(default)]
    pub starting_points: StartingPoints,
    #[serde(default)]
    pub min_points: f64,
    #[serde(default)]
    pub max_extra_points: f64,
    #[serde(default)]
    pub rubric_item: BTreeMap<String, RubricItemInput>,
}

fn default_rubric_type() -> RubricType {
    RubricType::Manual
}

/// 评分时选中的细则项
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RubricSelection {
    pub item_id: RubricItemId,
    /// 部分给分比例，缺省为 1
    #[serde(default)]
    pub score: Option<f64>,
}

impl RubricSelection {
    pub fn full(item_id: RubricItemId) -> Self {
        Self {
            item_id,
            score: None,
        }
    }
}

/// 已应用到实例题目的细则项
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AppliedRubricItem {
    pub item_id: RubricItemId,
    pub score: f64,
}

/// 实例题目上某一部分的细则评分记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricGrading {
    pub rubric_type: RubricType,
    pub items: Vec<AppliedRubricItem>,
    pub adjust_points: f64,
    /// 最近一次按细则计算出的分数
    pub computed_points: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starting_points_resolve() {
        assert_eq!(StartingPoints::Zero.resolve(6.0), 0.0);
        assert_eq!(StartingPoints::Max.resolve(6.0), 6.0);
        assert_eq!(StartingPoints::Custom(2.5).resolve(6.0), 2.5);
    }

    #[test]
    fn test_settings_update_deserialize() {
        let payload = serde_json::json!({
            "use_rubrics": true,
            "starting_points": "max",
            "min_points": -0.3,
            "rubric_item": {
                "12": { "order": 2, "points": -1.0, "short_text": "Off by one", "description": "Loop bound" },
                "new1": { "order": 1, "points": 0.5, "description": "Clean code" }
            }
        });
        let update: RubricSettingsUpdate = serde_json::from_value(payload).unwrap();
        assert!(update.use_rubric);
        assert_eq!(update.rubric_type, RubricType::Manual);
        assert_eq!(update.starting_points, StartingPoints::Max);
        assert_eq!(update.rubric_item.len(), 2);

        let existing = &update.rubric_item["12"];
        assert_eq!(existing.label(), Some("Off by one"));
        assert_eq!(existing.detail().as_deref(), Some("Loop bound"));

        let added = &update.rubric_item["new1"];
        assert_eq!(added.label(), Some("Clean code"));
        assert_eq!(added.detail(), None);
    }

    #[test]
    fn test_custom_starting_points_deserialize() {
        let sp: StartingPoints = serde_json::from_str(r#"{"custom": 4.0}"#).unwrap();
        assert_eq!(sp, StartingPoints::Custom(4.0));
    }
}
