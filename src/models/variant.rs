//! 变体与提交

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::{InstanceQuestionId, SubmissionId, VariantId};

/// 提交动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionAction {
    /// 只保存答案，不评分
    Save,
    /// 保存并评分
    Grade,
}

/// 一次提交
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub variant_id: VariantId,
    pub submitted_answer: JsonValue,
    pub action: SubmissionAction,
    /// 答案格式是否可评分
    pub gradable: bool,
    /// 得分比例 [0, 1]，未评分时为 None
    pub score: Option<f64>,
    pub correct: Option<bool>,
    pub feedback: JsonValue,
    /// 所在变体损坏后随之标记
    pub broken: bool,
    pub submitted_at: DateTime<Utc>,
    pub graded_at: Option<DateTime<Utc>>,
    pub regraded_at: Option<DateTime<Utc>>,
    /// 重新评分前的得分
    pub previous_score: Option<f64>,
}

impl Submission {
    pub fn new(
        id: SubmissionId,
        variant_id: VariantId,
        submitted_answer: JsonValue,
        action: SubmissionAction,
    ) -> Self {
        Self {
            id,
            variant_id,
            submitted_answer,
            action,
            gradable: true,
            score: None,
            correct: None,
            feedback: JsonValue::Null,
            broken: false,
            submitted_at: Utc::now(),
            graded_at: None,
            regraded_at: None,
            previous_score: None,
        }
    }

    /// 是否参与计分：已评分、可评分且未损坏
    pub fn counts_toward_points(&self) -> bool {
        self.graded_at.is_some() && self.gradable && !self.broken && self.score.is_some()
    }

    /// 已保存但从未评分
    pub fn is_pending(&self) -> bool {
        self.graded_at.is_none() && self.gradable && !self.broken
    }

    /// 记录评分结果，得分被夹到 [0, 1]
    pub fn record_score(&mut self, score: f64, feedback: JsonValue) {
        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
        self.gradable = true;
        self.score = Some(score);
        self.correct = Some(score >= 1.0);
        self.feedback = feedback;
        self.graded_at = Some(Utc::now());
    }

    /// 记录为不可评分
    pub fn record_not_gradable(&mut self, reason: &str) {
        self.gradable = false;
        self.score = None;
        self.correct = None;
        self.feedback = serde_json::json!({ "format_error": reason });
        self.graded_at = Some(Utc::now());
    }
}

/// 题目的一个具体变体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub instance_question_id: InstanceQuestionId,
    /// 在实例题目中的序号（从1开始）
    pub number: u32,
    pub seed: u64,
    pub params: JsonValue,
    pub true_answer: JsonValue,
    pub broken: bool,
    pub created_at: DateTime<Utc>,
    pub submissions: Vec<Submission>,
}

impl Variant {
    pub fn submission(&self, id: SubmissionId) -> Option<&Submission> {
        self.submissions.iter().find(|s| s.id == id)
    }

    pub fn submission_mut(&mut self, id: SubmissionId) -> Option<&mut Submission> {
        self.submissions.iter_mut().find(|s| s.id == id)
    }

    /// 标记变体及其所有提交为损坏
    pub fn mark_broken(&mut self) {
        self.broken = true;
        for submission in &mut self.submissions {
            submission.broken = true;
        }
    }

    /// 最后一次提交
    pub fn last_submission(&self) -> Option<&Submission> {
        self.submissions.last()
    }

    /// 得分最高的计分提交
    pub fn best_submission(&self) -> Option<&Submission> {
        self.submissions
            .iter()
            .filter(|s| s.counts_toward_points())
            .max_by(|a, b| {
                a.score
                    .unwrap_or(0.0)
                    .total_cmp(&b.score.unwrap_or(0.0))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_score_clamps() {
        let mut sub = Submission::new(1, 1, json!("a"), SubmissionAction::Grade);
        sub.record_score(1.7, JsonValue::Null);
        assert_eq!(sub.score, Some(1.0));
        assert_eq!(sub.correct, Some(true));
        assert!(sub.counts_toward_points());

        sub.record_score(-0.2, JsonValue::Null);
        assert_eq!(sub.score, Some(0.0));
        assert_eq!(sub.correct, Some(false));
    }

    #[test]
    fn test_not_gradable_does_not_count() {
        let mut sub = Submission::new(1, 1, json!("???"), SubmissionAction::Grade);
        sub.record_not_gradable("无法解析");
        assert!(!sub.gradable);
        assert!(!sub.counts_toward_points());
        assert!(!sub.is_pending());
    }

    #[test]
    fn test_mark_broken_propagates() {
        let mut variant = Variant {
            id: 5,
            instance_question_id: 1,
            number: 1,
            seed: 0,
            params: JsonValue::Null,
            true_answer: json!(42),
            broken: false,
            created_at: Utc::now(),
            submissions: vec![Submission::new(7, 5, json!(1), SubmissionAction::Save)],
        };
        variant.mark_broken();
        assert!(variant.broken);
        assert!(variant.submissions.iter().all(|s| s.broken));
    }
}
