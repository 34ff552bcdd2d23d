//! 分区汇总 - 业务能力层
//!
//! 根据实例题目得分快照计算评估实例总分：
//! 分区内求和（可只取最高的 N 题）→ 分区上限截断 → 分区求和 → 评估满分截断

use std::collections::BTreeMap;

use crate::models::{Assessment, AssessmentInstance, AssessmentQuestionId, Zone};

/// 单个分区的汇总结果
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneTotal {
    pub title: String,
    /// 截断前的分区得分
    pub raw_points: f64,
    /// 计入总分的分区得分
    pub points: f64,
    pub max_points: f64,
}

/// 评估实例的汇总结果
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub zones: Vec<ZoneTotal>,
    pub points: f64,
    pub score_perc: f64,
    pub max_points: f64,
}

fn zone_total(zone: &Zone, question_points: &BTreeMap<AssessmentQuestionId, f64>) -> ZoneTotal {
    let mut points: Vec<f64> = zone
        .questions
        .iter()
        .map(|q| question_points.get(&q.id).copied().unwrap_or(0.0))
        .collect();
    points.sort_by(|a, b| b.total_cmp(a));

    let counted = zone.best_questions.unwrap_or(points.len());
    let raw_points: f64 = points.iter().take(counted).sum();
    let capped = match zone.max_points {
        Some(max) => raw_points.min(max),
        None => raw_points,
    };

    ZoneTotal {
        title: zone.title.clone(),
        raw_points,
        points: capped,
        max_points: zone.cap(),
    }
}

/// 按分区汇总题目得分
pub fn aggregate(
    assessment: &Assessment,
    question_points: &BTreeMap<AssessmentQuestionId, f64>,
) -> AggregateResult {
    let zones: Vec<ZoneTotal> = assessment
        .zones
        .iter()
        .map(|zone| zone_total(zone, question_points))
        .collect();

    let max_points = assessment.max_points();
    let points = zones
        .iter()
        .map(|z| z.points)
        .sum::<f64>()
        .clamp(0.0, max_points.max(0.0));

    AggregateResult {
        zones,
        points,
        score_perc: perc(points, max_points),
        max_points,
    }
}

/// 重新计算评估实例的总分
///
/// 存在教师覆盖总分时以覆盖值为准（同样截断到 [0, 满分]）
pub fn apply_to_instance(assessment: &Assessment, instance: &mut AssessmentInstance) -> AggregateResult {
    let mut result = aggregate(assessment, &instance.question_points);
    if let Some(points) = instance.points_override {
        result.points = points.clamp(0.0, result.max_points.max(0.0));
        result.score_perc = perc(result.points, result.max_points);
    }

    instance.points = result.points;
    instance.score_perc = result.score_perc;
    instance.max_points = result.max_points;
    instance.modified_at = chrono::Utc::now();
    result
}

fn perc(points: f64, max_points: f64) -> f64 {
    if max_points > 0.0 {
        100.0 * points / max_points
    } else {
        0.0
    }
}
