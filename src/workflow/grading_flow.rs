//! 评分流程 - 流程层
//!
//! 核心职责：定义"一次评分"的完整处理流程
//!
//! 流程顺序：
//! 1. 锁住实例题目，校验变体与题目状态
//! 2. 调用评分器 → 得分累加器
//! 3. 锁住评估实例，更新该题的得分快照并按分区重新汇总
//!
//! 人工改分、细则评分、重新评分都走同样的"实例题目 → 评估实例"两步

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppResult, GraderError, GradingError, StoreError};
use crate::infrastructure::Gradebook;
use crate::models::{
    Assessment, AssessmentId, AssessmentInstanceId, AssessmentQuestion, AssessmentQuestionId,
    AssessmentType, InstanceQuestion, InstanceQuestionId, QuestionStatus, RubricSelection,
    RubricSettingsUpdate, RubricType, Submission, SubmissionAction, SubmissionId, Variant,
    VariantId,
};
use crate::services::csv_export::InstanceRecord;
use crate::services::grader::{GradeOutcome, Grader, VariantGenerator};
use crate::services::points_accumulator::{GradeApplication, PointsAccumulator};
use crate::services::rubric_engine::{self, Adjustment, PointsBreakdown};
use crate::services::score_override::{self, AssessmentOverride, ScoreUpdate};
use crate::services::zone_aggregator::{self, AggregateResult};
use crate::utils::approx_eq;
use crate::workflow::grading_ctx::GradingCtx;

/// 一次提交的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// 只保存了答案
    Saved,
    /// 已评分并计入得分
    Graded(GradeApplication),
    /// 答案格式无效，不计分
    NotGradable { reason: String },
}

/// 提交结果
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitResult {
    pub submission_id: SubmissionId,
    pub outcome: SubmitOutcome,
    /// 实例题目当前得分
    pub question_points: f64,
    /// 评估实例当前总分
    pub instance_points: f64,
}

/// 单道实例题目的重新评分报告
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegradeReport {
    pub instance_question_id: InstanceQuestionId,
    /// 重新判分的提交数
    pub regraded: usize,
    /// 得分发生变化的提交数
    pub changed: usize,
    /// 判分时崩溃而被标记损坏的变体数
    pub broken_variants: usize,
    pub points_before: f64,
    pub points_after: f64,
}

impl RegradeReport {
    pub fn summary(&self) -> String {
        format!(
            "实例题目 #{}: 重新评分 {} 次提交, {} 次得分变化, {} 个变体损坏, 得分 {} → {}",
            self.instance_question_id,
            self.regraded,
            self.changed,
            self.broken_variants,
            self.points_before,
            self.points_after
        )
    }
}

/// 判分器调用结果（临时故障已在内部重试）
enum GradeAttempt {
    Outcome(GradeOutcome),
    Crashed(String),
}

/// 评分流程
///
/// - 编排提交 → 判分 → 累加 → 汇总
/// - 决定加锁顺序（实例题目 → 评估实例）
/// - 只依赖业务能力（services）和成绩簿
pub struct GradingFlow {
    gradebook: Arc<Gradebook>,
    grader: Arc<dyn Grader>,
    generator: Arc<dyn VariantGenerator>,
    config: Config,
}

impl GradingFlow {
    /// 创建新的评分流程
    pub fn new(
        gradebook: Arc<Gradebook>,
        grader: Arc<dyn Grader>,
        generator: Arc<dyn VariantGenerator>,
        config: &Config,
    ) -> Self {
        Self {
            gradebook,
            grader,
            generator,
            config: config.clone(),
        }
    }

    pub fn gradebook(&self) -> &Arc<Gradebook> {
        &self.gradebook
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========== 学生操作 ==========

    /// 学生开始一次评估，返回新评估实例的 ID
    pub async fn start_assessment_instance(
        &self,
        assessment_id: AssessmentId,
        uid: &str,
        username: &str,
    ) -> AppResult<AssessmentInstanceId> {
        let ai_id = self
            .gradebook
            .create_assessment_instance(assessment_id, uid, username)
            .await?;
        info!("[评估 #{} 学生 {}] 📝 开始作答, 实例 #{}", assessment_id, uid, ai_id);
        Ok(ai_id)
    }

    /// 为实例题目构建评分上下文
    pub async fn context(&self, instance_question_id: InstanceQuestionId, user: &str) -> AppResult<GradingCtx> {
        let key = self.gradebook.question_key(instance_question_id).await?;
        let instance_key = self.gradebook.instance_key(key.assessment_instance_id).await?;
        Ok(GradingCtx::new(
            instance_key.assessment_id,
            key.assessment_instance_id,
            instance_question_id,
            user,
        ))
    }

    /// 按题目 qid 构建评分上下文
    pub async fn context_for_qid(
        &self,
        assessment_instance_id: AssessmentInstanceId,
        qid: &str,
        user: &str,
    ) -> AppResult<GradingCtx> {
        let instance_key = self.gradebook.instance_key(assessment_instance_id).await?;
        let assessment = self.gradebook.assessment(instance_key.assessment_id).await?;
        let aq = assessment
            .question_by_qid(qid)
            .ok_or_else(|| StoreError::QuestionNotFound(qid.to_string()))?;
        let iq_id = self
            .gradebook
            .find_instance_question(assessment_instance_id, aq.id)
            .await
            .ok_or_else(|| StoreError::QuestionNotFound(qid.to_string()))?;
        Ok(GradingCtx::new(
            instance_key.assessment_id,
            assessment_instance_id,
            iq_id,
            user,
        ))
    }

    /// 当前可作答的变体；没有或已损坏时生成新变体
    pub async fn open_variant(&self, ctx: &GradingCtx) -> AppResult<Variant> {
        let assessment = self.gradebook.assessment(ctx.assessment_id).await?;
        let iq = self.gradebook.instance_question(ctx.instance_question_id).await?;
        let mut iq = iq.lock().await;
        if let Some(variant) = iq.current_variant().filter(|v| !v.broken) {
            return Ok(variant.clone());
        }
        let aq = question(&assessment, iq.assessment_question_id)?;
        self.new_variant(&assessment, aq, &mut iq, ctx).await
    }

    /// 申请新变体（只有作业允许；当前变体损坏时考试也允许）
    pub async fn request_new_variant(&self, ctx: &GradingCtx) -> AppResult<Variant> {
        let assessment = self.gradebook.assessment(ctx.assessment_id).await?;
        let iq = self.gradebook.instance_question(ctx.instance_question_id).await?;
        let mut iq = iq.lock().await;

        let current_usable = iq.current_variant().map(|v| !v.broken).unwrap_or(false);
        if assessment.assessment_type == AssessmentType::Exam && current_usable {
            return Err(GradingError::NewVariantNotAllowed {
                instance_question_id: iq.id,
            }
            .into());
        }
        if !iq.open {
            return Err(GradingError::QuestionClosed {
                instance_question_id: iq.id,
            }
            .into());
        }

        let aq = question(&assessment, iq.assessment_question_id)?;
        self.new_variant(&assessment, aq, &mut iq, ctx).await
    }

    async fn new_variant(
        &self,
        assessment: &Assessment,
        aq: &AssessmentQuestion,
        iq: &mut InstanceQuestion,
        ctx: &GradingCtx,
    ) -> AppResult<Variant> {
        let variant_id = self.gradebook.next_id();
        let seed = iq.id * 1_000 + iq.variants.len() as u64 + 1;
        let mut variant = Variant {
            id: variant_id,
            instance_question_id: iq.id,
            number: iq.variants.len() as u32 + 1,
            seed,
            params: JsonValue::Null,
            true_answer: JsonValue::Null,
            broken: false,
            created_at: Utc::now(),
            submissions: Vec::new(),
        };

        let generated = match self.generator.generate(aq, seed) {
            Ok(generated) => generated,
            Err(GraderError::Transient(message)) => {
                return Err(GradingError::GraderUnavailable { attempts: 1, message }.into());
            }
            Err(GraderError::Crashed(message)) => {
                warn!("{} ⚠️ 生成变体失败: {}", ctx, message);
                variant.broken = true;
                iq.variants.push(variant);
                return Err(GradingError::BrokenVariant { variant_id, message }.into());
            }
        };

        variant.params = generated.params;
        variant.true_answer = generated.true_answer;
        iq.variants.push(variant.clone());
        PointsAccumulator::new(assessment, aq).start_new_variant(iq);

        debug!("{} 新变体 #{} (第 {} 个)", ctx, variant_id, variant.number);
        Ok(variant)
    }

    /// 提交答案
    ///
    /// `Save` 只保存；`Grade` 调用评分器并累加得分。
    /// 答案不可评分时返回 `NotGradable` 结果而不是错误
    pub async fn submit(
        &self,
        ctx: &GradingCtx,
        variant_id: VariantId,
        submitted_answer: JsonValue,
        action: SubmissionAction,
    ) -> AppResult<SubmitResult> {
        let assessment = self.gradebook.assessment(ctx.assessment_id).await?;
        let iq = self.gradebook.instance_question(ctx.instance_question_id).await?;
        let mut iq = iq.lock().await;
        let aq = question(&assessment, iq.assessment_question_id)?;

        let variant = iq
            .variant(variant_id)
            .ok_or(StoreError::VariantNotFound(variant_id))?;
        if variant.broken {
            return Err(GradingError::BrokenVariant {
                variant_id,
                message: "变体已标记为损坏".to_string(),
            }
            .into());
        }
        if !iq.is_current_variant(variant_id) {
            return Err(GradingError::VariantNotCurrent { variant_id }.into());
        }
        if !iq.open {
            return Err(GradingError::QuestionClosed {
                instance_question_id: iq.id,
            }
            .into());
        }

        let submission_id = self.gradebook.next_id();
        let submission = Submission::new(submission_id, variant_id, submitted_answer, action);

        if action == SubmissionAction::Save {
            push_submission(&mut iq, variant_id, submission);
            if iq.number_attempts == 0 {
                iq.status = QuestionStatus::Saved;
            }
            self.gradebook.register_submission(submission_id, iq.id).await;
            info!("{} 💾 已保存提交 #{}", ctx, submission_id);
            let instance = self.instance_points(iq.assessment_instance_id).await?;
            return Ok(SubmitResult {
                submission_id,
                outcome: SubmitOutcome::Saved,
                question_points: iq.points,
                instance_points: instance,
            });
        }

        let attempt = {
            let variant = iq
                .variant(variant_id)
                .ok_or(StoreError::VariantNotFound(variant_id))?;
            self.call_grader(variant, &submission.submitted_answer, 1).await
        };
        push_submission(&mut iq, variant_id, submission);
        self.gradebook.register_submission(submission_id, iq.id).await;

        let attempt = match attempt {
            Ok(attempt) => attempt,
            Err(e) => {
                // 评分器暂时不可用：提交保持待评分状态
                warn!("{} ⚠️ 提交 #{} 暂未评分: {}", ctx, submission_id, e);
                if iq.number_attempts == 0 {
                    iq.status = QuestionStatus::Saved;
                }
                return Err(e);
            }
        };

        let accumulator = PointsAccumulator::new(&assessment, aq);
        let outcome = match attempt {
            GradeAttempt::Outcome(outcome) => {
                apply_outcome(&accumulator, &mut iq, variant_id, submission_id, outcome)?
            }
            GradeAttempt::Crashed(message) => {
                warn!("{} ❌ 评分器崩溃, 变体 #{} 标记为损坏: {}", ctx, variant_id, message);
                let err = break_variant(&accumulator, &mut iq, variant_id, message);
                self.refresh_instance(&assessment, &iq).await?;
                return Err(err.into());
            }
        };

        let aggregate = self.refresh_instance(&assessment, &iq).await?;
        match &outcome {
            SubmitOutcome::Graded(applied) => info!(
                "{} ✓ 提交 #{} 评分完成: 得分 {:.2}, 增量 {:.2}, 题目 {:.2}/{}, 总分 {:.2}/{}",
                ctx,
                submission_id,
                applied.score,
                applied.delta,
                iq.points,
                aq.max_points(),
                aggregate.points,
                aggregate.max_points
            ),
            SubmitOutcome::NotGradable { reason } => {
                info!("{} ⚠️ 提交 #{} 无法评分: {}", ctx, submission_id, reason)
            }
            SubmitOutcome::Saved => {}
        }

        Ok(SubmitResult {
            submission_id,
            outcome,
            question_points: iq.points,
            instance_points: aggregate.points,
        })
    }

    /// 为实例题目最后一次待评分的提交评分
    ///
    /// 没有待评分提交时返回 None
    pub async fn grade_pending(&self, instance_question_id: InstanceQuestionId) -> AppResult<Option<SubmitOutcome>> {
        let ctx = self.context(instance_question_id, "system").await?;
        let assessment = self.gradebook.assessment(ctx.assessment_id).await?;
        let iq = self.gradebook.instance_question(instance_question_id).await?;
        let mut iq = iq.lock().await;
        let aq = question(&assessment, iq.assessment_question_id)?;

        let Some(pending) = iq.last_submission().filter(|s| s.is_pending()) else {
            return Ok(None);
        };
        let (submission_id, variant_id) = (pending.id, pending.variant_id);
        if !iq.open || !iq.is_current_variant(variant_id) {
            debug!("{} 待评分提交 #{} 已失效, 跳过", ctx, submission_id);
            return Ok(None);
        }

        let attempt = {
            let variant = iq
                .variant(variant_id)
                .ok_or(StoreError::VariantNotFound(variant_id))?;
            let answer = &variant
                .submission(submission_id)
                .ok_or(StoreError::SubmissionNotFound(submission_id))?
                .submitted_answer;
            self.call_grader(variant, answer, self.config.regrade_max_retries.max(1))
                .await?
        };

        let accumulator = PointsAccumulator::new(&assessment, aq);
        let outcome = match attempt {
            GradeAttempt::Outcome(outcome) => {
                apply_outcome(&accumulator, &mut iq, variant_id, submission_id, outcome)?
            }
            GradeAttempt::Crashed(message) => {
                warn!("{} ❌ 评分器崩溃, 变体 #{} 标记为损坏: {}", ctx, variant_id, message);
                let err = break_variant(&accumulator, &mut iq, variant_id, message);
                self.refresh_instance(&assessment, &iq).await?;
                return Err(err.into());
            }
        };
        self.refresh_instance(&assessment, &iq).await?;
        debug!("{} 待评分提交 #{} 已评分", ctx, submission_id);
        Ok(Some(outcome))
    }

    /// 为评估实例的所有待评分提交评分，返回评分的数量
    pub async fn grade_assessment_instance(&self, assessment_instance_id: AssessmentInstanceId) -> AppResult<usize> {
        let mut graded = 0;
        for iq_id in self.gradebook.instance_question_ids(assessment_instance_id).await {
            if self.grade_pending(iq_id).await?.is_some() {
                graded += 1;
            }
        }
        Ok(graded)
    }

    // ========== 教师操作 ==========

    /// 教师直接设置实例题目得分
    pub async fn update_instance_question_score(
        &self,
        ctx: &GradingCtx,
        update: &ScoreUpdate,
    ) -> AppResult<PointsBreakdown> {
        let assessment = self.gradebook.assessment(ctx.assessment_id).await?;
        let iq = self.gradebook.instance_question(ctx.instance_question_id).await?;
        let mut iq = iq.lock().await;
        let aq = question(&assessment, iq.assessment_question_id)?;

        let resolved = score_override::resolve(update, iq.auto_points, iq.manual_points, aq)?;
        iq.set_points(resolved.auto_points, resolved.manual_points, aq.max_points());
        if update.touches_manual() {
            iq.set_rubric_grading(RubricType::Manual, None);
        }
        if update.touches_auto() {
            iq.set_rubric_grading(RubricType::Auto, None);
        }
        if let Some(feedback) = &update.feedback {
            attach_feedback(&mut iq, feedback);
        }

        self.refresh_instance(&assessment, &iq).await?;
        let breakdown = PointsBreakdown::of(&iq, aq);
        info!(
            "{} ✏️ 人工改分: 自动 {} + 人工 {} = {}",
            ctx, breakdown.auto_points, breakdown.manual_points, breakdown.points
        );
        Ok(breakdown)
    }

    /// 按评分细则为实例题目的某一部分评分
    pub async fn apply_rubric_grading(
        &self,
        ctx: &GradingCtx,
        rubric_type: RubricType,
        selections: &[RubricSelection],
        adjustment: Adjustment,
    ) -> AppResult<PointsBreakdown> {
        let assessment = self.gradebook.assessment(ctx.assessment_id).await?;
        let key = self.gradebook.question_key(ctx.instance_question_id).await?;
        let aq = question(&assessment, key.assessment_question_id)?;
        let config = self.gradebook.rubric(aq.id).await;
        if !config.settings(rubric_type).use_rubric {
            return Err(GradingError::RubricNotInUse {
                instance_question_id: ctx.instance_question_id,
            }
            .into());
        }
        let grading = rubric_engine::grade(&config, rubric_type, selections, adjustment, aq)?;

        let iq = self.gradebook.instance_question(ctx.instance_question_id).await?;
        let mut iq = iq.lock().await;
        apply_rubric_points(&mut iq, aq, rubric_type, grading.computed_points);
        iq.set_rubric_grading(rubric_type, Some(grading));

        self.refresh_instance(&assessment, &iq).await?;
        let breakdown = PointsBreakdown::of(&iq, aq);
        info!(
            "{} 📋 {}细则评分: {} 项, 总分 {}",
            ctx,
            rubric_type.label(),
            selections.len(),
            breakdown.points
        );
        Ok(breakdown)
    }

    /// 更新题目的评分细则，并重新计算所有已按细则评分的实例题目
    pub async fn update_rubric_settings(
        &self,
        assessment_id: AssessmentId,
        assessment_question_id: AssessmentQuestionId,
        update: &RubricSettingsUpdate,
    ) -> AppResult<Vec<(InstanceQuestionId, PointsBreakdown)>> {
        let assessment = self.gradebook.assessment(assessment_id).await?;
        let aq = question(&assessment, assessment_question_id)?;
        let current = self.gradebook.rubric(aq.id).await;
        let config = rubric_engine::apply_update(&current, update, aq, || self.gradebook.next_id())?;
        self.gradebook.set_rubric(aq.id, config.clone()).await;

        let rubric_type = update.rubric_type;
        let mut recomputed = Vec::new();
        for ai_id in self.gradebook.assessment_instance_ids(assessment_id).await {
            let Some(iq_id) = self.gradebook.find_instance_question(ai_id, aq.id).await else {
                continue;
            };
            let iq = self.gradebook.instance_question(iq_id).await?;
            let mut iq = iq.lock().await;
            let Some(grading) = iq.rubric_grading(rubric_type).cloned() else {
                continue;
            };

            match rubric_engine::recompute(&config, &grading, aq) {
                Some(updated) => {
                    apply_rubric_points(&mut iq, aq, rubric_type, updated.computed_points);
                    iq.set_rubric_grading(rubric_type, Some(updated));
                }
                None => iq.set_rubric_grading(rubric_type, None),
            }
            self.refresh_instance(&assessment, &iq).await?;
            recomputed.push((iq_id, PointsBreakdown::of(&iq, aq)));
        }

        info!(
            "[评估 #{} 题目 {}] 📋 {}细则已更新, 重新计算 {} 道实例题目",
            assessment_id,
            aq.qid,
            rubric_type.label(),
            recomputed.len()
        );
        Ok(recomputed)
    }

    /// 教师直接设置评估实例总分；`Clear` 恢复按分区汇总
    ///
    /// 设置只在下一次评分、重新评分或细则重算之前有效
    pub async fn override_assessment_instance(
        &self,
        assessment_instance_id: AssessmentInstanceId,
        score: AssessmentOverride,
        user: &str,
    ) -> AppResult<AggregateResult> {
        let key = self.gradebook.instance_key(assessment_instance_id).await?;
        let assessment = self.gradebook.assessment(key.assessment_id).await?;
        let instance = self.gradebook.assessment_instance(assessment_instance_id).await?;
        let mut instance = instance.lock().await;

        instance.points_override = score.to_points(assessment.max_points())?;
        let result = zone_aggregator::apply_to_instance(&assessment, &mut instance);
        info!(
            "[评估 #{} 实例 #{} 操作者 {}] ✏️ 总分设置为 {:.2}/{}",
            assessment.id, assessment_instance_id, user, result.points, result.max_points
        );
        Ok(result)
    }

    // ========== 重新评分 ==========

    /// 重新评分一道实例题目
    ///
    /// 先对所有已评分提交重新判分，全部成功后才写入，再按新得分重放累加。
    /// 评分器持续临时故障时返回错误且不改动任何数据
    pub async fn regrade_instance_question(&self, instance_question_id: InstanceQuestionId) -> AppResult<RegradeReport> {
        let ctx = self.context(instance_question_id, "regrade").await?;
        let assessment = self.gradebook.assessment(ctx.assessment_id).await?;
        let iq = self.gradebook.instance_question(instance_question_id).await?;
        let mut iq = iq.lock().await;
        let aq = question(&assessment, iq.assessment_question_id)?;

        let mut report = RegradeReport {
            instance_question_id,
            points_before: iq.points,
            ..Default::default()
        };

        // 第一阶段：只判分
        let max_attempts = self.config.regrade_max_retries.max(1);
        let mut results = Vec::new();
        for variant in iq.variants.iter().filter(|v| !v.broken) {
            for submission in variant
                .submissions
                .iter()
                .filter(|s| s.graded_at.is_some() && !s.broken)
            {
                let attempt = self
                    .call_grader(variant, &submission.submitted_answer, max_attempts)
                    .await?;
                results.push((variant.id, submission.id, attempt));
            }
        }

        // 第二阶段：写入
        let now = Utc::now();
        for (variant_id, submission_id, attempt) in results {
            match attempt {
                GradeAttempt::Crashed(message) => {
                    if let Some(variant) = iq.variant_mut(variant_id).filter(|v| !v.broken) {
                        variant.mark_broken();
                        report.broken_variants += 1;
                        warn!("{} ❌ 重新评分时变体 #{} 损坏: {}", ctx, variant_id, message);
                    }
                }
                GradeAttempt::Outcome(outcome) => {
                    let Some(submission) = iq
                        .variant_mut(variant_id)
                        .filter(|v| !v.broken)
                        .and_then(|v| v.submission_mut(submission_id))
                    else {
                        continue;
                    };
                    let previous = submission.score;
                    submission.previous_score = previous;
                    match outcome {
                        GradeOutcome::Graded { score, feedback } => submission.record_score(score, feedback),
                        GradeOutcome::NotGradable { reason } => submission.record_not_gradable(&reason),
                    }
                    submission.regraded_at = Some(now);
                    report.regraded += 1;
                    let changed = match (previous, submission.score) {
                        (Some(a), Some(b)) => !approx_eq(a, b),
                        (a, b) => a.is_some() != b.is_some(),
                    };
                    if changed {
                        report.changed += 1;
                    }
                }
            }
        }

        PointsAccumulator::new(&assessment, aq).replay(&mut iq);
        report.points_after = iq.points;
        self.refresh_instance(&assessment, &iq).await?;

        debug!("{} {}", ctx, report.summary());
        Ok(report)
    }

    // ========== 导出 ==========

    /// 评估所有实例的只读快照（按实例创建顺序）
    pub async fn instance_records(&self, assessment_id: AssessmentId) -> AppResult<Vec<InstanceRecord>> {
        let assessment = self.gradebook.assessment(assessment_id).await?;
        let mut records = Vec::new();
        for ai_id in self.gradebook.assessment_instance_ids(assessment_id).await {
            // 先复制评估实例再逐个锁实例题目，不同时持有两把锁
            let instance = self.gradebook.assessment_instance(ai_id).await?.lock().await.clone();
            let mut questions = Vec::with_capacity(instance.instance_question_ids.len());
            for iq_id in &instance.instance_question_ids {
                let iq = self.gradebook.instance_question(*iq_id).await?;
                let iq = iq.lock().await.clone();
                questions.push(iq);
            }
            questions.sort_by_key(|iq| iq.number);
            records.push(InstanceRecord {
                assessment: assessment.clone(),
                instance,
                questions,
            });
        }
        Ok(records)
    }

    // ========== 内部 ==========

    async fn call_grader(
        &self,
        variant: &Variant,
        submitted_answer: &JsonValue,
        max_attempts: u32,
    ) -> AppResult<GradeAttempt> {
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.grader.grade(variant, submitted_answer) {
                Ok(outcome) => return Ok(GradeAttempt::Outcome(outcome)),
                Err(GraderError::Crashed(message)) => return Ok(GradeAttempt::Crashed(message)),
                Err(GraderError::Transient(message)) => {
                    debug!(
                        "变体 #{} 评分器临时故障 (第 {}/{} 次): {}",
                        variant.id, attempt, max_attempts, message
                    );
                    last_error = message;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.poll_interval() * attempt).await;
                    }
                }
            }
        }
        Err(GradingError::GraderUnavailable {
            attempts: max_attempts,
            message: last_error,
        }
        .into())
    }

    /// 更新评估实例中该题的得分快照并重新汇总（调用方持有实例题目锁）
    ///
    /// 教师设置的总分只保留到下一次得分变化
    async fn refresh_instance(&self, assessment: &Assessment, iq: &InstanceQuestion) -> AppResult<AggregateResult> {
        let instance = self
            .gradebook
            .assessment_instance(iq.assessment_instance_id)
            .await?;
        let mut instance = instance.lock().await;
        if let Some(previous) = instance.points_override.take() {
            debug!(
                "[评估实例 #{}] 题目得分变化, 取消总分设置 {:.2}",
                instance.id, previous
            );
        }
        instance
            .question_points
            .insert(iq.assessment_question_id, iq.points);
        Ok(zone_aggregator::apply_to_instance(assessment, &mut instance))
    }

    async fn instance_points(&self, assessment_instance_id: AssessmentInstanceId) -> AppResult<f64> {
        let instance = self.gradebook.assessment_instance(assessment_instance_id).await?;
        let points = instance.lock().await.points;
        Ok(points)
    }
}

fn question(assessment: &Assessment, id: AssessmentQuestionId) -> AppResult<&AssessmentQuestion> {
    assessment
        .question(id)
        .ok_or_else(|| StoreError::QuestionNotFound(format!("#{}", id)).into())
}

fn push_submission(iq: &mut InstanceQuestion, variant_id: VariantId, submission: Submission) {
    if let Some(variant) = iq.variant_mut(variant_id) {
        variant.submissions.push(submission);
    }
    iq.modified_at = Utc::now();
}

fn apply_outcome(
    accumulator: &PointsAccumulator<'_>,
    iq: &mut InstanceQuestion,
    variant_id: VariantId,
    submission_id: SubmissionId,
    outcome: GradeOutcome,
) -> AppResult<SubmitOutcome> {
    let submission = iq
        .variant_mut(variant_id)
        .and_then(|v| v.submission_mut(submission_id))
        .ok_or(StoreError::SubmissionNotFound(submission_id))?;

    match outcome {
        GradeOutcome::Graded { score, feedback } => {
            submission.record_score(score, feedback);
            let score = submission.score.unwrap_or(0.0);
            Ok(SubmitOutcome::Graded(accumulator.apply_grade(iq, score)))
        }
        GradeOutcome::NotGradable { reason } => {
            submission.record_not_gradable(&reason);
            iq.status = QuestionStatus::Invalid;
            Ok(SubmitOutcome::NotGradable { reason })
        }
    }
}

/// 标记变体损坏并立即重放，损坏变体上的得分不再计入
fn break_variant(
    accumulator: &PointsAccumulator<'_>,
    iq: &mut InstanceQuestion,
    variant_id: VariantId,
    message: String,
) -> GradingError {
    if let Some(variant) = iq.variant_mut(variant_id) {
        variant.mark_broken();
    }
    accumulator.replay(iq);
    GradingError::BrokenVariant { variant_id, message }
}

fn apply_rubric_points(iq: &mut InstanceQuestion, aq: &AssessmentQuestion, rubric_type: RubricType, points: f64) {
    match rubric_type {
        RubricType::Auto => iq.set_points(points, iq.manual_points, aq.max_points()),
        RubricType::Manual => iq.set_points(iq.auto_points, points, aq.max_points()),
    }
}

/// 把教师反馈合并到最后一次提交上
fn attach_feedback(iq: &mut InstanceQuestion, feedback: &JsonValue) {
    let Some(last_id) = iq.last_submission().map(|s| s.id) else {
        return;
    };
    let Some(submission) = iq.variants.iter_mut().find_map(|v| v.submission_mut(last_id)) else {
        return;
    };
    match (&mut submission.feedback, feedback) {
        (JsonValue::Object(existing), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                existing.insert(key.clone(), value.clone());
            }
        }
        (target, _) => *target = feedback.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::{RubricItemInput, StartingPoints, Zone};
    use crate::services::grader::{ExactMatchGrader, StaticVariantGenerator};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    /// 按预设序列返回结果的评分器
    struct ScriptedGrader {
        script: StdMutex<Vec<Result<GradeOutcome, GraderError>>>,
    }

    impl ScriptedGrader {
        fn new(mut script: Vec<Result<GradeOutcome, GraderError>>) -> Self {
            script.reverse();
            Self {
                script: StdMutex::new(script),
            }
        }
    }

    impl Grader for ScriptedGrader {
        fn grade(&self, _variant: &Variant, _answer: &JsonValue) -> Result<GradeOutcome, GraderError> {
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(GraderError::Transient("脚本已用完".into())))
        }
    }

    fn graded(score: f64) -> Result<GradeOutcome, GraderError> {
        Ok(GradeOutcome::Graded {
            score,
            feedback: JsonValue::Null,
        })
    }

    fn test_config() -> Config {
        Config {
            poll_interval_ms: 1,
            regrade_max_retries: 2,
            ..Config::default()
        }
    }

    async fn setup(assessment: Assessment, grader: Arc<dyn Grader>) -> (GradingFlow, GradingCtx) {
        let gradebook = Arc::new(Gradebook::new());
        let assessment = gradebook.insert_assessment(assessment).await.unwrap();
        let flow = GradingFlow::new(gradebook, grader, Arc::new(StaticVariantGenerator), &test_config());
        let ai_id = flow
            .start_assessment_instance(assessment.id, "alice", "Alice")
            .await
            .unwrap();
        let qid = assessment.zones[0].questions[0].qid.clone();
        let ctx = flow.context_for_qid(ai_id, &qid, "alice").await.unwrap();
        (flow, ctx)
    }

    fn homework(question: AssessmentQuestion) -> Assessment {
        Assessment::new("HW1", AssessmentType::Homework, vec![Zone::new("z", vec![question])])
    }

    async fn points(flow: &GradingFlow, ctx: &GradingCtx) -> (f64, f64) {
        let iq = flow.gradebook().instance_question(ctx.instance_question_id).await.unwrap();
        let iq_points = iq.lock().await.points;
        let ai = flow.gradebook().assessment_instance(ctx.assessment_instance_id).await.unwrap();
        let ai_points = ai.lock().await.points;
        (iq_points, ai_points)
    }

    #[tokio::test]
    async fn test_save_then_grade() {
        let question = AssessmentQuestion::new("addNumbers", 10.0).with_true_answer(json!(5));
        let (flow, ctx) = setup(homework(question), Arc::new(ExactMatchGrader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();

        let saved = flow
            .submit(&ctx, variant.id, json!(4), SubmissionAction::Save)
            .await
            .unwrap();
        assert_eq!(saved.outcome, SubmitOutcome::Saved);
        assert_eq!(saved.question_points, 0.0);

        let result = flow
            .submit(&ctx, variant.id, json!(5), SubmissionAction::Grade)
            .await
            .unwrap();
        assert!(matches!(result.outcome, SubmitOutcome::Graded(GradeApplication { score, .. }) if score == 1.0));
        assert_eq!(result.question_points, 10.0);
        assert_eq!(result.instance_points, 10.0);
        assert_eq!(points(&flow, &ctx).await, (10.0, 10.0));
    }

    #[tokio::test]
    async fn test_not_gradable_is_outcome() {
        let question = AssessmentQuestion::new("q", 10.0).with_true_answer(json!(5));
        let (flow, ctx) = setup(homework(question), Arc::new(ExactMatchGrader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();

        let result = flow
            .submit(&ctx, variant.id, json!("abc"), SubmissionAction::Grade)
            .await
            .unwrap();
        assert!(matches!(result.outcome, SubmitOutcome::NotGradable { .. }));
        assert_eq!(result.question_points, 0.0);

        let iq = flow.gradebook().instance_question(ctx.instance_question_id).await.unwrap();
        let iq = iq.lock().await;
        assert_eq!(iq.status, QuestionStatus::Invalid);
        assert!(!iq.last_submission().unwrap().gradable);
    }

    #[tokio::test]
    async fn test_crash_marks_variant_broken() {
        let grader = ScriptedGrader::new(vec![Err(GraderError::Crashed("boom".into())), graded(1.0)]);
        let (flow, ctx) = setup(homework(AssessmentQuestion::new("q", 10.0)), Arc::new(grader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();

        let err = flow
            .submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Grading(GradingError::BrokenVariant { .. })));

        // 再次提交到损坏的变体被拒绝
        let err = flow
            .submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Grading(GradingError::BrokenVariant { .. })));

        let fresh = flow.open_variant(&ctx).await.unwrap();
        assert_ne!(fresh.id, variant.id);
        let result = flow
            .submit(&ctx, fresh.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap();
        assert_eq!(result.question_points, 10.0);
    }

    #[tokio::test]
    async fn test_crash_removes_points_from_broken_variant() {
        let grader = ScriptedGrader::new(vec![graded(0.5), Err(GraderError::Crashed("boom".into()))]);
        let (flow, ctx) = setup(homework(AssessmentQuestion::new("q", 10.0)), Arc::new(grader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();

        flow.submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap();
        assert_eq!(points(&flow, &ctx).await, (5.0, 5.0));

        // 同一变体上的重试让评分器崩溃
        let err = flow
            .submit(&ctx, variant.id, json!(2), SubmissionAction::Grade)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Grading(GradingError::BrokenVariant { .. })));
        assert_eq!(points(&flow, &ctx).await, (0.0, 0.0));

        // 重新评分不再改变分数
        let report = flow
            .regrade_instance_question(ctx.instance_question_id)
            .await
            .unwrap();
        assert_eq!(report.points_before, 0.0);
        assert_eq!(report.points_after, 0.0);
        assert_eq!(points(&flow, &ctx).await, (0.0, 0.0));
    }

    #[tokio::test]
    async fn test_transient_error_leaves_pending_submission() {
        let grader = ScriptedGrader::new(vec![Err(GraderError::Transient("busy".into())), graded(0.5)]);
        let (flow, ctx) = setup(homework(AssessmentQuestion::new("q", 10.0)), Arc::new(grader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();

        let err = flow
            .submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let outcome = flow.grade_pending(ctx.instance_question_id).await.unwrap();
        assert!(matches!(outcome, Some(SubmitOutcome::Graded(_))));
        assert_eq!(points(&flow, &ctx).await, (5.0, 5.0));
        assert_eq!(flow.grade_pending(ctx.instance_question_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_old_variant_rejected() {
        let question = AssessmentQuestion::new("q", 10.0).with_true_answer(json!(1));
        let (flow, ctx) = setup(homework(question), Arc::new(ExactMatchGrader)).await;
        let first = flow.open_variant(&ctx).await.unwrap();
        let second = flow.request_new_variant(&ctx).await.unwrap();
        assert_eq!(second.number, 2);

        let err = flow
            .submit(&ctx, first.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Grading(GradingError::VariantNotCurrent { .. })));
    }

    #[tokio::test]
    async fn test_exam_new_variant_not_allowed() {
        let exam = Assessment::new(
            "EX1",
            AssessmentType::Exam,
            vec![Zone::new("z", vec![AssessmentQuestion::new("q", 10.0)])],
        );
        let (flow, ctx) = setup(exam, Arc::new(ExactMatchGrader)).await;
        flow.open_variant(&ctx).await.unwrap();
        let err = flow.request_new_variant(&ctx).await.unwrap_err();
        assert!(matches!(err, AppError::Grading(GradingError::NewVariantNotAllowed { .. })));
    }

    #[tokio::test]
    async fn test_closed_question_rejects_grading() {
        let exam = Assessment::new(
            "EX1",
            AssessmentType::Exam,
            vec![Zone::new(
                "z",
                vec![AssessmentQuestion::new("q", 10.0)
                    .with_points_list(vec![10.0, 5.0])
                    .with_true_answer(json!(1))],
            )],
        );
        let (flow, ctx) = setup(exam, Arc::new(ExactMatchGrader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();
        flow.submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap();

        let err = flow
            .submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Grading(GradingError::QuestionClosed { .. })));
    }

    #[tokio::test]
    async fn test_manual_score_update_and_feedback() {
        let question = AssessmentQuestion::new("q", 4.0)
            .with_manual_points(6.0)
            .with_true_answer(json!(1));
        let (flow, ctx) = setup(homework(question), Arc::new(ExactMatchGrader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();
        flow.submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap();

        let update = ScoreUpdate {
            points: Some(7.0),
            feedback: Some(json!({ "manual": "需要写出步骤" })),
            ..Default::default()
        };
        let breakdown = flow
            .update_instance_question_score(&ctx.acting_as("prof"), &update)
            .await
            .unwrap();
        assert_eq!(breakdown.auto_points, 4.0);
        assert_eq!(breakdown.manual_points, 3.0);
        assert_eq!(breakdown.score_perc, 70.0);
        assert_eq!(points(&flow, &ctx).await, (7.0, 7.0));

        let iq = flow.gradebook().instance_question(ctx.instance_question_id).await.unwrap();
        let iq = iq.lock().await;
        assert_eq!(iq.last_submission().unwrap().feedback["manual"], json!("需要写出步骤"));
    }

    #[tokio::test]
    async fn test_conflicting_update_changes_nothing() {
        let (flow, ctx) = setup(
            homework(AssessmentQuestion::new("q", 4.0).with_manual_points(6.0)),
            Arc::new(ExactMatchGrader),
        )
        .await;
        let update = ScoreUpdate {
            points: Some(7.0),
            manual_points: Some(2.0),
            ..Default::default()
        };
        let err = flow.update_instance_question_score(&ctx, &update).await.unwrap_err();
        assert!(matches!(err, AppError::Grading(GradingError::ConflictingScores { .. })));
        assert_eq!(points(&flow, &ctx).await, (0.0, 0.0));
    }

    fn rubric_update(items: &[(&str, i64, f64, &str)]) -> RubricSettingsUpdate {
        let rubric_item: BTreeMap<String, RubricItemInput> = items
            .iter()
            .map(|(key, order, points, description)| {
                (
                    key.to_string(),
                    RubricItemInput {
                        order: *order,
                        points: Some(*points),
                        description: Some(description.to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect();
        RubricSettingsUpdate {
            rubric_type: RubricType::Manual,
            use_rubric: true,
            starting_points: StartingPoints::Zero,
            min_points: 0.0,
            max_extra_points: 0.0,
            rubric_item,
        }
    }

    #[tokio::test]
    async fn test_rubric_grading_and_recompute() {
        let question = AssessmentQuestion::new("essay", 0.0).with_manual_points(10.0);
        let (flow, ctx) = setup(homework(question), Arc::new(ExactMatchGrader)).await;
        let aq_id = flow.gradebook().question_key(ctx.instance_question_id).await.unwrap().assessment_question_id;

        // 未启用细则时拒绝细则评分
        let err = flow
            .apply_rubric_grading(&ctx, RubricType::Manual, &[], Adjustment::None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Grading(GradingError::RubricNotInUse { .. })));

        flow.update_rubric_settings(
            ctx.assessment_id,
            aq_id,
            &rubric_update(&[("new1", 1, 6.0, "论点清晰"), ("new2", 2, 4.0, "引用充分")]),
        )
        .await
        .unwrap();
        let config = flow.gradebook().rubric(aq_id).await;
        let ids: Vec<_> = config.items.iter().map(|i| i.id).collect();

        let breakdown = flow
            .apply_rubric_grading(
                &ctx,
                RubricType::Manual,
                &[RubricSelection::full(ids[0]), RubricSelection::full(ids[1])],
                Adjustment::Points(-1.0),
            )
            .await
            .unwrap();
        assert_eq!(breakdown.manual_points, 9.0);

        // 修改第一项分值后已评分的题目自动重算
        let (first_key, second_key) = (ids[0].to_string(), ids[1].to_string());
        let update = rubric_update(&[
            (first_key.as_str(), 1, 3.0, "论点清晰"),
            (second_key.as_str(), 2, 4.0, "引用充分"),
        ]);
        let recomputed = flow
            .update_rubric_settings(ctx.assessment_id, aq_id, &update)
            .await
            .unwrap();
        assert_eq!(recomputed.len(), 1);
        assert_eq!(recomputed[0].1.manual_points, 6.0);
        assert_eq!(points(&flow, &ctx).await, (6.0, 6.0));
    }

    #[tokio::test]
    async fn test_invalid_rubric_keeps_previous_config() {
        let question = AssessmentQuestion::new("essay", 0.0).with_manual_points(10.0);
        let (flow, ctx) = setup(homework(question), Arc::new(ExactMatchGrader)).await;
        let aq_id = flow.gradebook().question_key(ctx.instance_question_id).await.unwrap().assessment_question_id;

        let err = flow
            .update_rubric_settings(ctx.assessment_id, aq_id, &rubric_update(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Rubric(crate::error::RubricError::NoItems)));
        assert!(!flow.gradebook().rubric(aq_id).await.manual.use_rubric);
    }

    #[tokio::test]
    async fn test_assessment_instance_override() {
        let question = AssessmentQuestion::new("q", 10.0).with_true_answer(json!(1));
        let (flow, ctx) = setup(homework(question), Arc::new(ExactMatchGrader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();
        flow.submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap();

        let result = flow
            .override_assessment_instance(ctx.assessment_instance_id, AssessmentOverride::ScorePerc(50.0), "prof")
            .await
            .unwrap();
        assert_eq!(result.points, 5.0);

        let result = flow
            .override_assessment_instance(ctx.assessment_instance_id, AssessmentOverride::Clear, "prof")
            .await
            .unwrap();
        assert_eq!(result.points, 10.0);
    }

    #[tokio::test]
    async fn test_override_replaced_by_next_grade() {
        let grader = ScriptedGrader::new(vec![graded(0.2), graded(1.0), graded(0.2), graded(1.0)]);
        let (flow, ctx) = setup(homework(AssessmentQuestion::new("q", 10.0)), Arc::new(grader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();
        flow.submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap();
        assert_eq!(points(&flow, &ctx).await, (2.0, 2.0));

        let result = flow
            .override_assessment_instance(ctx.assessment_instance_id, AssessmentOverride::ScorePerc(50.0), "prof")
            .await
            .unwrap();
        assert_eq!(result.points, 5.0);

        // 题目得分变化后总分重新按分区汇总
        let result = flow
            .submit(&ctx, variant.id, json!(2), SubmissionAction::Grade)
            .await
            .unwrap();
        assert_eq!(result.question_points, 10.0);
        assert_eq!(result.instance_points, 10.0);
        assert_eq!(points(&flow, &ctx).await, (10.0, 10.0));

        // 重新评分同样取消设置
        flow.override_assessment_instance(ctx.assessment_instance_id, AssessmentOverride::Points(3.0), "prof")
            .await
            .unwrap();
        assert_eq!(points(&flow, &ctx).await, (10.0, 3.0));
        flow.regrade_instance_question(ctx.instance_question_id)
            .await
            .unwrap();
        assert_eq!(points(&flow, &ctx).await, (10.0, 10.0));
        let ai = flow.gradebook().assessment_instance(ctx.assessment_instance_id).await.unwrap();
        assert_eq!(ai.lock().await.points_override, None);
    }

    #[tokio::test]
    async fn test_regrade_is_idempotent() {
        let question = AssessmentQuestion::new("partialCredit1", 19.0).with_true_answer(json!([1, 2, 3, 4]));
        let (flow, ctx) = setup(homework(question), Arc::new(ExactMatchGrader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();
        for answer in [json!([1, 0, 0, 0]), json!([1, 2, 0, 0])] {
            flow.submit(&ctx, variant.id, answer, SubmissionAction::Grade)
                .await
                .unwrap();
        }
        let (before, _) = points(&flow, &ctx).await;

        let first = flow.regrade_instance_question(ctx.instance_question_id).await.unwrap();
        assert_eq!(first.regraded, 2);
        assert_eq!(first.changed, 0);
        assert_eq!(first.points_after, before);

        let second = flow.regrade_instance_question(ctx.instance_question_id).await.unwrap();
        assert_eq!(second.points_after, before);
        assert_eq!(points(&flow, &ctx).await, (before, before));
    }

    #[tokio::test]
    async fn test_regrade_transient_failure_changes_nothing() {
        let grader = ScriptedGrader::new(vec![graded(0.5)]);
        let (flow, ctx) = setup(homework(AssessmentQuestion::new("q", 10.0)), Arc::new(grader)).await;
        let variant = flow.open_variant(&ctx).await.unwrap();
        flow.submit(&ctx, variant.id, json!(1), SubmissionAction::Grade)
            .await
            .unwrap();

        // 脚本用完后评分器一直返回临时故障
        let err = flow.regrade_instance_question(ctx.instance_question_id).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Grading(GradingError::GraderUnavailable { attempts: 2, .. })
        ));
        assert_eq!(points(&flow, &ctx).await, (5.0, 5.0));
    }
}
