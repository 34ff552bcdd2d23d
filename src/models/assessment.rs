//! 评估定义：评估 → 分区 → 评估题目
//!
//! 评估发布后不可变，分值上限、分区上限和重试策略都在这里声明

use serde::{Deserialize, Serialize};

use super::{AssessmentId, AssessmentQuestionId};

/// 评估类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssessmentType {
    /// 作业：允许无限次重试和申请新变体
    Homework,
    /// 考试：按 `points_list` 逐次递减分值
    Exam,
}

/// 题目的重试策略
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// 作业题：每个变体的分值为 `current_value`
    Homework {
        init_points: f64,
        constant_value: bool,
    },
    /// 考试题：第 k 次评分的分值为 `points_list[k]`
    PointsList(Vec<f64>),
    /// 不支持重试：同一变体只有第一次评分计分
    SingleAttempt,
}

/// 评估题目：把一道题以指定分值绑定到评估上
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentQuestion {
    #[serde(default)]
    pub id: AssessmentQuestionId,
    /// 题目标识
    pub qid: String,
    /// 自动评分部分的满分
    #[serde(default, alias = "auto_points")]
    pub max_auto_points: f64,
    /// 人工评分部分的满分
    #[serde(default, alias = "manual_points")]
    pub max_manual_points: f64,
    /// 作业题每个变体的初始分值，缺省为 `max_auto_points`
    #[serde(default)]
    pub init_points: Option<f64>,
    /// 考试题逐次递减的分值列表
    #[serde(default)]
    pub points_list: Option<Vec<f64>>,
    /// 供内置变体生成器使用的标准答案
    #[serde(default)]
    pub true_answer: serde_json::Value,
}

impl AssessmentQuestion {
    /// 创建只有自动评分部分的题目
    pub fn new(qid: impl Into<String>, max_auto_points: f64) -> Self {
        Self {
            id: 0,
            qid: qid.into(),
            max_auto_points,
            max_manual_points: 0.0,
            init_points: None,
            points_list: None,
            true_answer: serde_json::Value::Null,
        }
    }

    pub fn with_manual_points(mut self, max_manual_points: f64) -> Self {
        self.max_manual_points = max_manual_points;
        self
    }

    pub fn with_init_points(mut self, init_points: f64) -> Self {
        self.init_points = Some(init_points);
        self
    }

    pub fn with_points_list(mut self, points_list: Vec<f64>) -> Self {
        self.points_list = Some(points_list);
        self
    }

    pub fn with_true_answer(mut self, true_answer: serde_json::Value) -> Self {
        self.true_answer = true_answer;
        self
    }

    /// 题目满分（自动 + 人工）
    pub fn max_points(&self) -> f64 {
        self.max_auto_points + self.max_manual_points
    }

    /// 作业题每个变体的初始分值
    pub fn initial_value(&self) -> f64 {
        self.init_points
            .unwrap_or(self.max_auto_points)
            .min(self.max_auto_points)
    }
}

/// 分区：一组有序的评估题目，可以设置分区上限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub title: String,
    /// 分区得分上限
    #[serde(default)]
    pub max_points: Option<f64>,
    /// 只计入得分最高的 N 道题
    #[serde(default)]
    pub best_questions: Option<usize>,
    #[serde(default)]
    pub questions: Vec<AssessmentQuestion>,
}

impl Zone {
    pub fn new(title: impl Into<String>, questions: Vec<AssessmentQuestion>) -> Self {
        Self {
            title: title.into(),
            max_points: None,
            best_questions: None,
            questions,
        }
    }

    pub fn with_max_points(mut self, max_points: f64) -> Self {
        self.max_points = Some(max_points);
        self
    }

    pub fn with_best_questions(mut self, best_questions: usize) -> Self {
        self.best_questions = Some(best_questions);
        self
    }

    /// 分区能贡献的最高分
    pub fn cap(&self) -> f64 {
        let mut maxima: Vec<f64> = self.questions.iter().map(|q| q.max_points()).collect();
        maxima.sort_by(|a, b| b.total_cmp(a));
        let counted = self.best_questions.unwrap_or(maxima.len());
        let sum: f64 = maxima.iter().take(counted).sum();
        match self.max_points {
            Some(max) => sum.min(max),
            None => sum,
        }
    }
}

/// 评估
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(default)]
    pub id: AssessmentId,
    /// 评估标识（如 "HW1"）
    pub tid: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub assessment_type: AssessmentType,
    /// 声明的评估满分；缺省时按分区上限求和
    #[serde(default)]
    pub max_points: Option<f64>,
    /// 作业题答对后分值是否保持不变
    #[serde(default)]
    pub constant_question_value: bool,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

impl Assessment {
    pub fn new(tid: impl Into<String>, assessment_type: AssessmentType, zones: Vec<Zone>) -> Self {
        Self {
            id: 0,
            tid: tid.into(),
            title: String::new(),
            assessment_type,
            max_points: None,
            constant_question_value: false,
            zones,
        }
    }

    pub fn with_max_points(mut self, max_points: f64) -> Self {
        self.max_points = Some(max_points);
        self
    }

    pub fn with_constant_question_value(mut self, constant: bool) -> Self {
        self.constant_question_value = constant;
        self
    }

    /// 评估满分
    pub fn max_points(&self) -> f64 {
        self.max_points
            .unwrap_or_else(|| self.zones.iter().map(Zone::cap).sum())
    }

    /// 按顺序遍历所有评估题目
    pub fn questions(&self) -> impl Iterator<Item = &AssessmentQuestion> {
        self.zones.iter().flat_map(|z| z.questions.iter())
    }

    pub fn question(&self, id: AssessmentQuestionId) -> Option<&AssessmentQuestion> {
        self.questions().find(|q| q.id == id)
    }

    pub fn question_by_qid(&self, qid: &str) -> Option<&AssessmentQuestion> {
        self.questions().find(|q| q.qid == qid)
    }

    /// 解析题目的重试策略
    pub fn retry_policy(&self, question: &AssessmentQuestion) -> RetryPolicy {
        match self.assessment_type {
            AssessmentType::Homework => RetryPolicy::Homework {
                init_points: question.initial_value(),
                constant_value: self.constant_question_value,
            },
            AssessmentType::Exam => match &question.points_list {
                Some(list) if list.len() > 1 => RetryPolicy::PointsList(list.clone()),
                _ => RetryPolicy::SingleAttempt,
            },
        }
    }

    /// 用于展示和文件名的标签
    pub fn label(&self) -> &str {
        &self.tid
    }
}
