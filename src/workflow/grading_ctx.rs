//! 评分上下文
//!
//! 封装"我正在给哪个评估实例的哪道题评分"这一信息

use std::fmt::Display;

use crate::models::{AssessmentId, AssessmentInstanceId, InstanceQuestionId};

/// 评分上下文
///
/// 每次评分请求创建一次，之后只读
#[derive(Debug, Clone)]
pub struct GradingCtx {
    /// 评估ID
    pub assessment_id: AssessmentId,

    /// 评估实例ID
    pub assessment_instance_id: AssessmentInstanceId,

    /// 实例题目ID
    pub instance_question_id: InstanceQuestionId,

    /// 发起操作的用户（学生 uid 或教师账号）
    pub user: String,
}

impl GradingCtx {
    /// 创建新的评分上下文
    pub fn new(
        assessment_id: AssessmentId,
        assessment_instance_id: AssessmentInstanceId,
        instance_question_id: InstanceQuestionId,
        user: impl Into<String>,
    ) -> Self {
        Self {
            assessment_id,
            assessment_instance_id,
            instance_question_id,
            user: user.into(),
        }
    }

    /// 换一个操作者
    pub fn acting_as(&self, user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..self.clone()
        }
    }
}

impl Display for GradingCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[评估 #{} 实例 #{} 题目 #{} 操作者 {}]",
            self.assessment_id, self.assessment_instance_id, self.instance_question_id, self.user
        )
    }
}
