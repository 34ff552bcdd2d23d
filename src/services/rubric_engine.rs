//! 评分细则引擎 - 业务能力层
//!
//! `raw = 起始分 + 调整分 + Σ 选中细则项分值 × 给分比例`，
//! 细则启用时截断到 `[min_points, 满分 + max_extra_points]`，结果保留两位小数。
//! 所有校验都在写入之前完成，校验失败时原配置保持不变。

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RubricError;
use crate::models::{
    AppliedRubricItem, AssessmentQuestion, InstanceQuestion, RubricConfig, RubricGrading,
    RubricItem, RubricItemId, RubricSelection, RubricSettings, RubricSettingsUpdate, RubricType,
};
use crate::utils::{perc_to_points, points_to_perc, round2};

/// 细则描述的最大长度（字符）
pub const MAX_DESCRIPTION_LEN: usize = 100;

/// 细则评分时附加的调整
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adjustment {
    #[default]
    None,
    Points(f64),
    /// 相对该部分满分的百分比
    Percentage(f64),
}

impl Adjustment {
    pub fn to_points(self, max_points: f64) -> Result<f64, RubricError> {
        let value = match self {
            Adjustment::None => 0.0,
            Adjustment::Points(points) => points,
            Adjustment::Percentage(perc) => {
                if !perc.is_finite() {
                    return Err(RubricError::InvalidAdjustment { value: perc });
                }
                perc_to_points(perc, max_points)
            }
        };
        if !value.is_finite() {
            return Err(RubricError::InvalidAdjustment { value });
        }
        Ok(value)
    }
}

/// 实例题目的得分明细
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointsBreakdown {
    pub auto_points: f64,
    pub auto_perc: f64,
    pub manual_points: f64,
    pub manual_perc: f64,
    pub points: f64,
    pub score_perc: f64,
}

impl PointsBreakdown {
    pub fn of(iq: &InstanceQuestion, question: &AssessmentQuestion) -> Self {
        Self {
            auto_points: round2(iq.auto_points),
            auto_perc: points_to_perc(iq.auto_points, question.max_auto_points),
            manual_points: round2(iq.manual_points),
            manual_perc: points_to_perc(iq.manual_points, question.max_manual_points),
            points: round2(iq.points),
            score_perc: points_to_perc(iq.points, question.max_points()),
        }
    }
}

/// 某一部分的满分
pub fn max_points_for(question: &AssessmentQuestion, rubric_type: RubricType) -> f64 {
    match rubric_type {
        RubricType::Auto => question.max_auto_points,
        RubricType::Manual => question.max_manual_points,
    }
}

/// 校验细则设置更新
pub fn validate_update(
    update: &RubricSettingsUpdate,
    question: &AssessmentQuestion,
) -> Result<(), RubricError> {
    if !update.use_rubric {
        return Ok(());
    }
    if update.rubric_item.is_empty() {
        return Err(RubricError::NoItems);
    }

    for item in update.rubric_item.values() {
        let description = item.label().unwrap_or_default();
        if description.is_empty() {
            return Err(RubricError::MissingDescription { order: item.order });
        }
        let len = description.chars().count();
        if len > MAX_DESCRIPTION_LEN {
            return Err(RubricError::DescriptionTooLong {
                order: item.order,
                len,
            });
        }
        if !item.points.map(f64::is_finite).unwrap_or(false) {
            return Err(RubricError::InvalidItemPoints { order: item.order });
        }
    }

    let max_points = max_points_for(question, update.rubric_type) + update.max_extra_points;
    if !max_points.is_finite() || !update.min_points.is_finite() || max_points <= update.min_points {
        return Err(RubricError::NoPointRange {
            min_points: update.min_points,
            max_points,
        });
    }
    Ok(())
}

/// 应用细则设置更新，返回新的配置
///
/// 表单键是该部分已有细则项的 ID 时保留该 ID，否则用 `next_id` 分配新 ID
pub fn apply_update(
    current: &RubricConfig,
    update: &RubricSettingsUpdate,
    question: &AssessmentQuestion,
    mut next_id: impl FnMut() -> RubricItemId,
) -> Result<RubricConfig, RubricError> {
    validate_update(update, question)?;

    let rubric_type = update.rubric_type;
    let mut config = current.clone();
    *config.settings_mut(rubric_type) = RubricSettings {
        use_rubric: update.use_rubric,
        starting_points: update.starting_points,
        min_points: update.min_points,
        max_extra_points: update.max_extra_points,
    };

    config.items.retain(|item| item.rubric_type != rubric_type);
    if update.use_rubric {
        for (key, input) in &update.rubric_item {
            let id = key
                .parse::<RubricItemId>()
                .ok()
                .filter(|id| {
                    current
                        .item(*id)
                        .map(|item| item.rubric_type == rubric_type)
                        .unwrap_or(false)
                })
                .unwrap_or_else(&mut next_id);
            config.items.push(RubricItem {
                id,
                rubric_type,
                order: input.order,
                points: input.points.unwrap_or_default(),
                description: input.label().unwrap_or_default().to_string(),
                explanation: input.detail(),
                grader_note: input.grader_note.clone(),
                always_show_to_students: input.always_show_to_students,
            });
        }
    }
    config.items.sort_by_key(|item| (item.order, item.id));

    debug!(
        "题目 {} 的{}细则更新: 启用 {}, {} 个细则项",
        question.qid,
        rubric_type.label(),
        update.use_rubric,
        config.items_of(rubric_type).count()
    );
    Ok(config)
}

/// 计算细则分数
pub fn computed_points(
    settings: &RubricSettings,
    items: &[RubricItem],
    applied: &[AppliedRubricItem],
    adjust_points: f64,
    max_points: f64,
) -> f64 {
    let selected: f64 = applied
        .iter()
        .filter_map(|a| {
            items
                .iter()
                .find(|item| item.id == a.item_id)
                .map(|item| item.points * a.score)
        })
        .sum();
    let raw = settings.starting_points.resolve(max_points) + adjust_points + selected;
    let upper = max_points + settings.max_extra_points;
    round2(raw.max(settings.min_points).min(upper))
}

/// 按选中的细则项为一道题评分
pub fn grade(
    config: &RubricConfig,
    rubric_type: RubricType,
    selections: &[RubricSelection],
    adjustment: Adjustment,
    question: &AssessmentQuestion,
) -> Result<RubricGrading, RubricError> {
    let max_points = max_points_for(question, rubric_type);

    let mut applied = Vec::with_capacity(selections.len());
    for selection in selections {
        let item = config.item(selection.item_id).ok_or(RubricError::UnknownItem {
            item_id: selection.item_id,
        })?;
        if item.rubric_type != rubric_type {
            return Err(RubricError::WrongItemType {
                item_id: selection.item_id,
            });
        }
        let score = selection.score.unwrap_or(1.0);
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(RubricError::InvalidItemScore {
                item_id: selection.item_id,
                score,
            });
        }
        applied.push(AppliedRubricItem {
            item_id: selection.item_id,
            score,
        });
    }

    let adjust_points = adjustment.to_points(max_points)?;
    let computed = computed_points(
        config.settings(rubric_type),
        &config.items,
        &applied,
        adjust_points,
        max_points,
    );

    Ok(RubricGrading {
        rubric_type,
        items: applied,
        adjust_points,
        computed_points: computed,
    })
}

/// 细则配置变化后重新计算已有的细则评分
///
/// 已删除的细则项被丢弃；该部分不再使用细则时返回 None
pub fn recompute(
    config: &RubricConfig,
    grading: &RubricGrading,
    question: &AssessmentQuestion,
) -> Option<RubricGrading> {
    let settings = config.settings(grading.rubric_type);
    if !settings.use_rubric {
        return None;
    }

    let items: Vec<AppliedRubricItem> = grading
        .items
        .iter()
        .filter(|a| {
            config
                .item(a.item_id)
                .map(|item| item.rubric_type == grading.rubric_type)
                .unwrap_or(false)
        })
        .copied()
        .collect();
    let computed = computed_points(
        settings,
        &config.items,
        &items,
        grading.adjust_points,
        max_points_for(question, grading.rubric_type),
    );

    Some(RubricGrading {
        rubric_type: grading.rubric_type,
        items,
        adjust_points: grading.adjust_points,
        computed_points: computed,
    })
}
