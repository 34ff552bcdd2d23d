//! 教师手动改分 - 业务能力层
//!
//! 把 score_perc / points / manual_* / auto_* 等字段解析为新的自动分与人工分。
//! 设置总分或总百分比时，人工分 = 新总分 − 自动分。

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::GradingError;
use crate::models::AssessmentQuestion;

/// 一次改分请求，字段均为绝对值
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScoreUpdate {
    #[serde(default)]
    pub score_perc: Option<f64>,
    #[serde(default)]
    pub points: Option<f64>,
    #[serde(default)]
    pub manual_score_perc: Option<f64>,
    #[serde(default)]
    pub manual_points: Option<f64>,
    #[serde(default)]
    pub auto_score_perc: Option<f64>,
    #[serde(default)]
    pub auto_points: Option<f64>,
    #[serde(default)]
    pub feedback: Option<JsonValue>,
}

impl ScoreUpdate {
    /// 没有任何分数字段
    pub fn is_empty(&self) -> bool {
        self.score_perc.is_none()
            && self.points.is_none()
            && self.manual_score_perc.is_none()
            && self.manual_points.is_none()
            && self.auto_score_perc.is_none()
            && self.auto_points.is_none()
    }

    /// 是否会改动人工分
    pub fn touches_manual(&self) -> bool {
        self.score_perc.is_some()
            || self.points.is_some()
            || self.manual_score_perc.is_some()
            || self.manual_points.is_some()
    }

    pub fn touches_auto(&self) -> bool {
        self.auto_score_perc.is_some() || self.auto_points.is_some()
    }

    fn check_finite(&self) -> Result<(), GradingError> {
        let fields = [
            ("score_perc", self.score_perc),
            ("points", self.points),
            ("manual_score_perc", self.manual_score_perc),
            ("manual_points", self.manual_points),
            ("auto_score_perc", self.auto_score_perc),
            ("auto_points", self.auto_points),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                if !value.is_finite() {
                    return Err(GradingError::InvalidScore { field, value });
                }
            }
        }
        Ok(())
    }
}

/// 解析后的得分
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedScore {
    pub auto_points: f64,
    pub manual_points: f64,
}

/// 教师直接设置评估实例总分
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentOverride {
    Points(f64),
    ScorePerc(f64),
    /// 撤销覆盖，恢复按分区汇总
    Clear,
}

impl AssessmentOverride {
    /// 换算为覆盖总分；`Clear` 返回 None
    pub fn to_points(self, max_points: f64) -> Result<Option<f64>, GradingError> {
        match self {
            AssessmentOverride::Points(points) if points.is_finite() => Ok(Some(points)),
            AssessmentOverride::Points(value) => Err(GradingError::InvalidScore {
                field: "points",
                value,
            }),
            AssessmentOverride::ScorePerc(perc) if perc.is_finite() => {
                Ok(Some(perc * max_points / 100.0))
            }
            AssessmentOverride::ScorePerc(value) => Err(GradingError::InvalidScore {
                field: "score_perc",
                value,
            }),
            AssessmentOverride::Clear => Ok(None),
        }
    }
}

fn conflict(first: &'static str, second: &'static str) -> GradingError {
    GradingError::ConflictingScores { first, second }
}

/// 根据当前得分解析改分请求
pub fn resolve(
    update: &ScoreUpdate,
    current_auto: f64,
    current_manual: f64,
    question: &AssessmentQuestion,
) -> Result<ResolvedScore, GradingError> {
    update.check_finite()?;

    let auto_points = if let Some(perc) = update.auto_score_perc {
        if update.auto_points.is_some() {
            return Err(conflict("auto_score_perc", "auto_points"));
        }
        if update.score_perc.is_some() {
            return Err(conflict("auto_score_perc", "score_perc"));
        }
        perc * question.max_auto_points / 100.0
    } else if let Some(points) = update.auto_points {
        if update.points.is_some() {
            return Err(conflict("auto_points", "points"));
        }
        points
    } else {
        current_auto
    };

    let manual_points = if let Some(perc) = update.manual_score_perc {
        if update.manual_points.is_some() {
            return Err(conflict("manual_score_perc", "manual_points"));
        }
        if update.score_perc.is_some() {
            return Err(conflict("manual_score_perc", "score_perc"));
        }
        perc * question.max_manual_points / 100.0
    } else if let Some(points) = update.manual_points {
        if update.points.is_some() {
            return Err(conflict("manual_points", "points"));
        }
        points
    } else if let Some(perc) = update.score_perc {
        if update.points.is_some() {
            return Err(conflict("score_perc", "points"));
        }
        perc * question.max_points() / 100.0 - auto_points
    } else if let Some(points) = update.points {
        points - auto_points
    } else {
        current_manual
    };

    Ok(ResolvedScore {
        auto_points,
        manual_points,
    })
}
