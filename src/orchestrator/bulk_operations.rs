//! 批量操作 - 编排层
//!
//! 每个批量操作都是一个作业序列：按受影响的实例题目 / 评估实例 / CSV 行
//! 各生成一个作业，在后台顺序执行，立即返回序列 ID 供调用方轮询。
//! 作业内部调用的仍是 `GradingFlow` 的单次操作。

use std::sync::Arc;

use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{AssessmentId, JobSequenceId, SequenceKind};
use crate::orchestrator::job_sequence::{JobSequenceManager, PlannedJob};
use crate::services::score_upload::{self, AssessmentInstanceScoreRow, InstanceQuestionScoreRow, RowTarget};
use crate::workflow::{GradingCtx, GradingFlow};

/// 重新评分评估中的每一道实例题目
pub async fn regrade_all(
    flow: &Arc<GradingFlow>,
    manager: &Arc<JobSequenceManager>,
    assessment_id: AssessmentId,
    owner: &str,
) -> AppResult<JobSequenceId> {
    let assessment = flow.gradebook().assessment(assessment_id).await?;
    let gradebook = flow.gradebook();

    let mut jobs = Vec::new();
    for iq_id in gradebook.instance_question_ids_for_assessment(assessment_id).await {
        let key = gradebook.question_key(iq_id).await?;
        let instance_key = gradebook.instance_key(key.assessment_instance_id).await?;
        let qid = assessment
            .question(key.assessment_question_id)
            .map(|q| q.qid.as_str())
            .unwrap_or("?");
        let description = format!("重新评分 {} 第 {} 次 题目 {}", instance_key.uid, instance_key.number, qid);

        let flow = Arc::clone(flow);
        jobs.push(PlannedJob::new(description, async move {
            let report = flow.regrade_instance_question(iq_id).await?;
            Ok::<_, AppError>(report.summary())
        }));
    }

    info!("[评估 {}] 🔁 重新评分 {} 道实例题目", assessment.tid, jobs.len());
    let id = manager
        .execute_in_background(
            SequenceKind::RegradeAssessment(assessment_id),
            owner,
            format!("重新评分评估 {}", assessment.tid),
            jobs,
        )
        .await;
    Ok(id)
}

/// 为评估所有实例中已保存但未评分的提交评分
pub async fn grade_all_assessment_instances(
    flow: &Arc<GradingFlow>,
    manager: &Arc<JobSequenceManager>,
    assessment_id: AssessmentId,
    owner: &str,
) -> AppResult<JobSequenceId> {
    let assessment = flow.gradebook().assessment(assessment_id).await?;

    let mut jobs = Vec::new();
    for ai_id in flow.gradebook().assessment_instance_ids(assessment_id).await {
        let key = flow.gradebook().instance_key(ai_id).await?;
        let flow = Arc::clone(flow);
        jobs.push(PlannedJob::new(
            format!("评分 {} 第 {} 次作答", key.uid, key.number),
            async move {
                let graded = flow.grade_assessment_instance(ai_id).await?;
                Ok::<_, AppError>(format!("评分 {} 次提交", graded))
            },
        ));
    }

    let id = manager
        .execute_in_background(
            SequenceKind::GradeAllInstances(assessment_id),
            owner,
            format!("批量评分评估 {}", assessment.tid),
            jobs,
        )
        .await;
    Ok(id)
}

/// 上传实例题目分数 CSV
///
/// 表头错误时直接返回错误；每一行是一个作业，无法定位的行使该作业失败，
/// 没有分数字段的行记为跳过
pub async fn upload_instance_question_scores(
    flow: &Arc<GradingFlow>,
    manager: &Arc<JobSequenceManager>,
    assessment_id: AssessmentId,
    csv_text: &str,
    owner: &str,
) -> AppResult<JobSequenceId> {
    let assessment = flow.gradebook().assessment(assessment_id).await?;
    let rows = score_upload::parse_instance_question_scores(csv_text)?;

    let jobs = rows
        .into_iter()
        .map(|row| {
            let flow = Arc::clone(flow);
            let owner = owner.to_string();
            let description = format!("上传分数 {}", row.label());
            PlannedJob::new(description, async move {
                match row.result? {
                    Some(parsed) => apply_instance_question_row(&flow, assessment_id, parsed, &owner).await,
                    None => Ok("跳过: 没有分数字段".to_string()),
                }
            })
        })
        .collect::<Vec<_>>();

    info!("[评估 {}] 📤 上传题目分数: {} 行", assessment.tid, jobs.len());
    let id = manager
        .execute_in_background(
            SequenceKind::UploadInstanceQuestionScores(assessment_id),
            owner,
            format!("上传评估 {} 的题目分数", assessment.tid),
            jobs,
        )
        .await;
    Ok(id)
}

async fn resolve_row_target(
    flow: &GradingFlow,
    assessment_id: AssessmentId,
    target: &RowTarget,
    owner: &str,
) -> AppResult<GradingCtx> {
    let gradebook = flow.gradebook();
    match target {
        RowTarget::Submission {
            submission_id,
            uid,
            qid,
        } => {
            let iq_id = gradebook
                .instance_question_for_submission(*submission_id)
                .await
                .map_err(|_| AppError::row_not_matched(format!("提交 #{} 不存在", submission_id)))?;
            let ctx = flow.context(iq_id, owner).await?;
            if ctx.assessment_id != assessment_id {
                return Err(AppError::row_not_matched(format!(
                    "提交 #{} 不属于当前评估",
                    submission_id
                )));
            }

            let instance_key = gradebook.instance_key(ctx.assessment_instance_id).await?;
            if let Some(uid) = uid {
                if &instance_key.uid != uid {
                    return Err(AppError::row_not_matched(format!(
                        "提交 #{} 属于 {}，不是 {}",
                        submission_id, instance_key.uid, uid
                    )));
                }
            }
            if let Some(qid) = qid {
                let key = gradebook.question_key(iq_id).await?;
                let assessment = gradebook.assessment(assessment_id).await?;
                let actual = assessment
                    .question(key.assessment_question_id)
                    .map(|q| q.qid.as_str())
                    .unwrap_or_default();
                if actual != qid.as_str() {
                    return Err(AppError::row_not_matched(format!(
                        "提交 #{} 属于题目 {}，不是 {}",
                        submission_id, actual, qid
                    )));
                }
            }
            Ok(ctx)
        }
        RowTarget::Question { uid, instance, qid } => {
            let ai_id = gradebook
                .find_assessment_instance(assessment_id, uid, *instance)
                .await
                .ok_or_else(|| AppError::row_not_matched(format!("{} 没有第 {} 次作答", uid, instance)))?;
            flow.context_for_qid(ai_id, qid, owner)
                .await
                .map_err(|_| AppError::row_not_matched(format!("{} 第 {} 次作答中没有题目 {}", uid, instance, qid)))
        }
    }
}

async fn apply_instance_question_row(
    flow: &GradingFlow,
    assessment_id: AssessmentId,
    row: InstanceQuestionScoreRow,
    owner: &str,
) -> AppResult<String> {
    let ctx = resolve_row_target(flow, assessment_id, &row.target, owner).await?;
    let breakdown = flow.update_instance_question_score(&ctx, &row.update).await?;
    Ok(format!(
        "{} 得分 {} (自动 {} + 人工 {})",
        ctx, breakdown.points, breakdown.auto_points, breakdown.manual_points
    ))
}

/// 上传评估实例总分 CSV
pub async fn upload_assessment_instance_scores(
    flow: &Arc<GradingFlow>,
    manager: &Arc<JobSequenceManager>,
    assessment_id: AssessmentId,
    csv_text: &str,
    owner: &str,
) -> AppResult<JobSequenceId> {
    let assessment = flow.gradebook().assessment(assessment_id).await?;
    let rows = score_upload::parse_assessment_instance_scores(csv_text)?;

    let jobs = rows
        .into_iter()
        .map(|row| {
            let flow = Arc::clone(flow);
            let owner = owner.to_string();
            let description = format!("上传总分 {}", row.label());
            PlannedJob::new(description, async move {
                match row.result? {
                    Some(parsed) => apply_assessment_instance_row(&flow, assessment_id, parsed, &owner).await,
                    None => Ok("跳过: 没有分数字段".to_string()),
                }
            })
        })
        .collect::<Vec<_>>();

    info!("[评估 {}] 📤 上传实例总分: {} 行", assessment.tid, jobs.len());
    let id = manager
        .execute_in_background(
            SequenceKind::UploadAssessmentInstanceScores(assessment_id),
            owner,
            format!("上传评估 {} 的实例总分", assessment.tid),
            jobs,
        )
        .await;
    Ok(id)
}

async fn apply_assessment_instance_row(
    flow: &GradingFlow,
    assessment_id: AssessmentId,
    row: AssessmentInstanceScoreRow,
    owner: &str,
) -> AppResult<String> {
    let ai_id = flow
        .gradebook()
        .find_assessment_instance(assessment_id, &row.uid, row.instance)
        .await
        .ok_or_else(|| AppError::row_not_matched(format!("{} 没有第 {} 次作答", row.uid, row.instance)))?;
    let result = flow
        .override_assessment_instance(ai_id, row.score, owner)
        .await?;
    Ok(format!(
        "{} 第 {} 次作答总分 {}/{}",
        row.uid, row.instance, result.points, result.max_points
    ))
}
