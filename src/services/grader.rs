//! 评分器与变体生成器 - 业务能力层
//!
//! 真正的题型判分/出题代码由外部提供，这里只定义接口和两个内置实现

use serde_json::{json, Value as JsonValue};

use crate::error::GraderError;
use crate::models::{AssessmentQuestion, Variant};
use crate::utils::approx_eq;

/// 一次判分的结果
#[derive(Debug, Clone, PartialEq)]
pub enum GradeOutcome {
    /// 已评分，score ∈ [0, 1]
    Graded { score: f64, feedback: JsonValue },
    /// 答案格式错误，无法评分
    NotGradable { reason: String },
}

/// 评分器
pub trait Grader: Send + Sync {
    fn grade(&self, variant: &Variant, submitted_answer: &JsonValue) -> Result<GradeOutcome, GraderError>;
}

/// 生成的变体内容
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedVariant {
    pub params: JsonValue,
    pub true_answer: JsonValue,
}

/// 变体生成器
pub trait VariantGenerator: Send + Sync {
    fn generate(&self, question: &AssessmentQuestion, seed: u64) -> Result<GeneratedVariant, GraderError>;
}

/// 与标准答案逐项比较的评分器
///
/// - 标准答案为数组时按匹配的元素比例给部分分
/// - 数值按 1e-6 的容差比较
/// - 提交为 null 或类型不符时视为不可评分
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchGrader;

impl ExactMatchGrader {
    fn matches(expected: &JsonValue, actual: &JsonValue) -> bool {
        match (expected, actual) {
            (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => approx_eq(a, b),
                _ => false,
            },
            (JsonValue::String(a), JsonValue::String(b)) => a.trim() == b.trim(),
            _ => expected == actual,
        }
    }
}

impl Grader for ExactMatchGrader {
    fn grade(&self, variant: &Variant, submitted_answer: &JsonValue) -> Result<GradeOutcome, GraderError> {
        if submitted_answer.is_null() {
            return Ok(GradeOutcome::NotGradable {
                reason: "答案为空".to_string(),
            });
        }

        match (&variant.true_answer, submitted_answer) {
            (JsonValue::Array(expected), JsonValue::Array(actual)) => {
                if expected.is_empty() {
                    return Err(GraderError::Crashed("标准答案为空数组".to_string()));
                }
                let correct = expected
                    .iter()
                    .zip(actual.iter())
                    .filter(|(e, a)| Self::matches(e, a))
                    .count();
                let score = correct as f64 / expected.len() as f64;
                Ok(GradeOutcome::Graded {
                    score,
                    feedback: json!({ "correct_parts": correct, "total_parts": expected.len() }),
                })
            }
            (JsonValue::Array(_), _) => Ok(GradeOutcome::NotGradable {
                reason: "答案应为数组".to_string(),
            }),
            (JsonValue::Number(_), actual) if !actual.is_number() => Ok(GradeOutcome::NotGradable {
                reason: format!("无法解析为数值: {}", actual),
            }),
            (expected, actual) => {
                let score = if Self::matches(expected, actual) { 1.0 } else { 0.0 };
                Ok(GradeOutcome::Graded {
                    score,
                    feedback: JsonValue::Null,
                })
            }
        }
    }
}

/// 直接使用题目定义中的标准答案生成变体
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticVariantGenerator;

impl VariantGenerator for StaticVariantGenerator {
    fn generate(&self, question: &AssessmentQuestion, seed: u64) -> Result<GeneratedVariant, GraderError> {
        Ok(GeneratedVariant {
            params: json!({ "qid": question.qid, "seed": seed }),
            true_answer: question.true_answer.clone(),
        })
    }
}
