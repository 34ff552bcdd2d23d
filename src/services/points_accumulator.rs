//! 得分累加器 - 业务能力层
//!
//! 把一次评分的得分比例换算成实例题目自动分的增量。
//!
//! - 新变体上的第一次评分：`Δ = s · V`，整份计入
//! - 同一变体上的重试：只计提升部分 `Δ = max(0, s − v) · V`，`v` 取历史最高
//! - 不支持重试的题目：同一变体上第一次评分之后 `Δ = 0`
//!
//! `V` 由重试策略决定：作业题为 `current_value`，考试题为 `points_list[k]`。
//! 这里只改自动分，人工分由人工评分单独设置。

use tracing::debug;

use crate::models::{
    Assessment, AssessmentQuestion, InstanceQuestion, QuestionStatus, RetryPolicy,
    SubmissionAction,
};

/// 一次评分对实例题目的影响
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeApplication {
    /// 本次得分比例（已夹到 [0, 1]）
    pub score: f64,
    /// 本次评分的分值 V
    pub award_value: f64,
    /// 实际计入的增量（受 max_auto_points 截断后）
    pub delta: f64,
    /// 是否为新变体上的第一次评分
    pub fresh: bool,
}

/// 得分累加器
pub struct PointsAccumulator<'a> {
    question: &'a AssessmentQuestion,
    policy: RetryPolicy,
}

impl<'a> PointsAccumulator<'a> {
    pub fn new(assessment: &'a Assessment, question: &'a AssessmentQuestion) -> Self {
        Self {
            question,
            policy: assessment.retry_policy(question),
        }
    }

    /// 下一次评分的分值 V
    pub fn award_value(&self, iq: &InstanceQuestion) -> f64 {
        match &self.policy {
            RetryPolicy::Homework { .. } => iq.current_value,
            RetryPolicy::PointsList(list) => list
                .get(iq.number_attempts as usize)
                .or(list.last())
                .copied()
                .unwrap_or(0.0),
            RetryPolicy::SingleAttempt => self.question.max_auto_points,
        }
    }

    /// 把一次评分计入实例题目
    pub fn apply_grade(&self, iq: &mut InstanceQuestion, score: f64) -> GradeApplication {
        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
        let award_value = self.award_value(iq);
        let fresh = iq.retry_baseline.is_none();
        let baseline = iq.retry_baseline.unwrap_or(0.0);

        let raw_delta = match (&self.policy, fresh) {
            (_, true) => score * award_value,
            (RetryPolicy::SingleAttempt, false) => 0.0,
            (_, false) => (score - baseline).max(0.0) * award_value,
        };

        iq.retry_baseline = Some(baseline.max(score));
        iq.number_attempts += 1;
        iq.last_submission_score = Some(score);
        iq.highest_submission_score = Some(iq.highest_submission_score.unwrap_or(0.0).max(score));

        let before = iq.auto_points;
        let auto_points = (iq.auto_points + raw_delta).min(self.question.max_auto_points);
        iq.set_points(auto_points, iq.manual_points, self.question.max_points());
        let delta = iq.auto_points - before;

        if let RetryPolicy::Homework {
            init_points,
            constant_value: false,
        } = self.policy
        {
            if score >= 1.0 {
                iq.current_value = (iq.current_value + init_points).min(self.question.max_auto_points);
            }
        }

        iq.status = self.status_after(iq, score);
        if let RetryPolicy::PointsList(list) = &self.policy {
            let exhausted = iq.number_attempts as usize >= list.len();
            let solved = score >= 1.0 && self.question.max_manual_points == 0.0;
            if exhausted || solved {
                iq.open = false;
            }
        }

        debug!(
            "题目 {} 实例题目 #{}: 得分 {:.4}, 分值 {}, 增量 {:.4}{}",
            self.question.qid,
            iq.id,
            score,
            award_value,
            delta,
            if fresh { " (新变体)" } else { "" }
        );

        GradeApplication {
            score,
            award_value,
            delta,
            fresh,
        }
    }

    /// 申请新变体：只重置重试基线，不减少已得分
    pub fn start_new_variant(&self, iq: &mut InstanceQuestion) {
        iq.retry_baseline = None;
    }

    /// 按保存的提交从头重新累加自动分
    ///
    /// 损坏的变体与提交、不可评分的提交都不计入。人工分保持不变
    pub fn replay(&self, iq: &mut InstanceQuestion) {
        let scores_by_variant: Vec<Vec<f64>> = iq
            .variants
            .iter()
            .map(|variant| {
                variant
                    .submissions
                    .iter()
                    .filter(|s| !variant.broken && s.counts_toward_points())
                    .filter_map(|s| s.score)
                    .collect()
            })
            .collect();

        iq.current_value = self.question.initial_value();
        iq.retry_baseline = None;
        iq.number_attempts = 0;
        iq.highest_submission_score = None;
        iq.last_submission_score = None;
        iq.open = true;
        iq.status = QuestionStatus::Unanswered;
        iq.set_points(0.0, iq.manual_points, self.question.max_points());

        for scores in scores_by_variant {
            iq.retry_baseline = None;
            for score in scores {
                self.apply_grade(iq, score);
            }
        }

        if let Some(status) = status_from_last_submission(iq) {
            iq.status = status;
        }
    }

    fn status_after(&self, iq: &InstanceQuestion, score: f64) -> QuestionStatus {
        if score >= 1.0 {
            if iq.auto_points >= self.question.max_auto_points && self.question.max_manual_points == 0.0 {
                QuestionStatus::Complete
            } else {
                QuestionStatus::Correct
            }
        } else {
            QuestionStatus::Incorrect
        }
    }
}

/// 最后一次提交不是有效评分时的状态
fn status_from_last_submission(iq: &InstanceQuestion) -> Option<QuestionStatus> {
    let last = iq.last_submission()?;
    if last.broken {
        return None;
    }
    if last.graded_at.is_some() && !last.gradable {
        return Some(QuestionStatus::Invalid);
    }
    if last.action == SubmissionAction::Save && last.graded_at.is_none() && iq.number_attempts == 0 {
        return Some(QuestionStatus::Saved);
    }
    None
}
