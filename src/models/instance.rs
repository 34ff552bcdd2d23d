//! 评估实例与实例题目
//!
//! 一个学生对一个评估的作答记录，以及其中每道题的得分状态

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    AssessmentId, AssessmentInstanceId, AssessmentQuestionId, InstanceQuestionId, RubricGrading,
    RubricType, SubmissionId, Variant, VariantId,
};
use crate::models::Submission;

/// 实例题目的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionStatus {
    Unanswered,
    Saved,
    Correct,
    Incorrect,
    /// 自动评分部分已拿满且没有人工评分部分
    Complete,
    /// 最近一次提交不可评分
    Invalid,
}

impl QuestionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            QuestionStatus::Unanswered => "unanswered",
            QuestionStatus::Saved => "saved",
            QuestionStatus::Correct => "correct",
            QuestionStatus::Incorrect => "incorrect",
            QuestionStatus::Complete => "complete",
            QuestionStatus::Invalid => "invalid",
        }
    }
}

/// 实例题目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceQuestion {
    pub id: InstanceQuestionId,
    pub assessment_instance_id: AssessmentInstanceId,
    pub assessment_question_id: AssessmentQuestionId,
    /// 在评估中的序号（从1开始）
    pub number: usize,
    pub points: f64,
    pub auto_points: f64,
    pub manual_points: f64,
    pub score_perc: f64,
    pub status: QuestionStatus,
    /// 关闭后不再接受评分
    pub open: bool,
    /// 作业题当前变体的分值
    pub current_value: f64,
    /// 当前变体上已计分的最高得分；None 表示变体是新的
    pub retry_baseline: Option<f64>,
    pub number_attempts: u32,
    pub highest_submission_score: Option<f64>,
    pub last_submission_score: Option<f64>,
    pub variants: Vec<Variant>,
    pub auto_rubric_grading: Option<RubricGrading>,
    pub manual_rubric_grading: Option<RubricGrading>,
    pub modified_at: DateTime<Utc>,
}

impl InstanceQuestion {
    pub fn new(
        id: InstanceQuestionId,
        assessment_instance_id: AssessmentInstanceId,
        assessment_question_id: AssessmentQuestionId,
        number: usize,
        initial_value: f64,
    ) -> Self {
        Self {
            id,
            assessment_instance_id,
            assessment_question_id,
            number,
            points: 0.0,
            auto_points: 0.0,
            manual_points: 0.0,
            score_perc: 0.0,
            status: QuestionStatus::Unanswered,
            open: true,
            current_value: initial_value,
            retry_baseline: None,
            number_attempts: 0,
            highest_submission_score: None,
            last_submission_score: None,
            variants: Vec::new(),
            auto_rubric_grading: None,
            manual_rubric_grading: None,
            modified_at: Utc::now(),
        }
    }

    /// 当前打开的变体（最后创建的那个）
    pub fn current_variant(&self) -> Option<&Variant> {
        self.variants.last()
    }

    pub fn variant(&self, id: VariantId) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    pub fn variant_mut(&mut self, id: VariantId) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == id)
    }

    pub fn is_current_variant(&self, id: VariantId) -> bool {
        self.current_variant().map(|v| v.id) == Some(id)
    }

    pub fn submission(&self, id: SubmissionId) -> Option<&Submission> {
        self.variants.iter().find_map(|v| v.submission(id))
    }

    /// 按时间顺序遍历所有提交
    pub fn submissions(&self) -> impl Iterator<Item = &Submission> {
        self.variants.iter().flat_map(|v| v.submissions.iter())
    }

    /// 最后一次提交
    pub fn last_submission(&self) -> Option<&Submission> {
        self.submissions().max_by_key(|s| (s.submitted_at, s.id))
    }

    pub fn rubric_grading(&self, rubric_type: RubricType) -> Option<&RubricGrading> {
        match rubric_type {
            RubricType::Auto => self.auto_rubric_grading.as_ref(),
            RubricType::Manual => self.manual_rubric_grading.as_ref(),
        }
    }

    pub fn set_rubric_grading(&mut self, rubric_type: RubricType, grading: Option<RubricGrading>) {
        match rubric_type {
            RubricType::Auto => self.auto_rubric_grading = grading,
            RubricType::Manual => self.manual_rubric_grading = grading,
        }
    }

    /// 写入自动/人工得分并维持 `points = auto + manual` 与 `0 ≤ points ≤ max`
    pub fn set_points(&mut self, auto_points: f64, manual_points: f64, max_points: f64) {
        let max_points = max_points.max(0.0);
        self.auto_points = auto_points.clamp(0.0, max_points);
        self.manual_points = manual_points.clamp(-self.auto_points, max_points - self.auto_points);
        self.points = self.auto_points + self.manual_points;
        self.score_perc = if max_points > 0.0 {
            100.0 * self.points / max_points
        } else {
            0.0
        };
        self.modified_at = Utc::now();
    }
}

/// 评估实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentInstance {
    pub id: AssessmentInstanceId,
    pub assessment_id: AssessmentId,
    pub uid: String,
    pub username: String,
    /// 同一学生的第几次作答
    pub number: u32,
    pub points: f64,
    pub score_perc: f64,
    pub max_points: f64,
    /// 教师直接设置的总分，存在时取代分区汇总
    pub points_override: Option<f64>,
    /// 各题得分快照，汇总时不需要锁住实例题目
    pub question_points: BTreeMap<AssessmentQuestionId, f64>,
    pub instance_question_ids: Vec<InstanceQuestionId>,
    pub open: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl AssessmentInstance {
    pub fn new(
        id: AssessmentInstanceId,
        assessment_id: AssessmentId,
        uid: impl Into<String>,
        username: impl Into<String>,
        number: u32,
        max_points: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            assessment_id,
            uid: uid.into(),
            username: username.into(),
            number,
            points: 0.0,
            score_perc: 0.0,
            max_points,
            points_override: None,
            question_points: BTreeMap::new(),
            instance_question_ids: Vec::new(),
            open: true,
            created_at: now,
            modified_at: now,
        }
    }
}
