use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use assessment_grading::error::GraderError;
use assessment_grading::models::{
    AssessmentQuestion, AssessmentType, JobStatus, SubmissionAction, Variant, Zone,
};
use assessment_grading::orchestrator::bulk_operations;
use assessment_grading::services::csv_export;
use assessment_grading::services::grader::{GradeOutcome, Grader, StaticVariantGenerator};
use assessment_grading::utils::approx_eq;
use assessment_grading::{
    Assessment, Config, Gradebook, GradingCtx, GradingFlow, JobSequenceManager, PollOptions,
};
use serde_json::{json, Value as JsonValue};
use tokio_test::{assert_err, assert_ok};

/// 答案本身就是得分：`0.5` 或 `{"score": 0.5, "flaky": true}`
///
/// 打开 outage 后，带 flaky 标记的答案返回临时故障
#[derive(Default)]
struct RatioGrader {
    outage: AtomicBool,
}

impl Grader for RatioGrader {
    fn grade(&self, _variant: &Variant, answer: &JsonValue) -> Result<GradeOutcome, GraderError> {
        let flaky = answer.get("flaky").and_then(JsonValue::as_bool).unwrap_or(false);
        if flaky && self.outage.load(Ordering::SeqCst) {
            return Err(GraderError::Transient("评分服务不可用".into()));
        }
        let score = answer
            .get("score")
            .and_then(JsonValue::as_f64)
            .or_else(|| answer.as_f64());
        Ok(match score {
            Some(score) => GradeOutcome::Graded {
                score,
                feedback: JsonValue::Null,
            },
            None => GradeOutcome::NotGradable {
                reason: "不是数值".into(),
            },
        })
    }
}

fn test_config() -> Config {
    Config {
        poll_interval_ms: 1,
        poll_max_interval_ms: 20,
        poll_max_attempts: 500,
        regrade_max_retries: 2,
        ..Config::default()
    }
}

struct Harness {
    flow: Arc<GradingFlow>,
    manager: Arc<JobSequenceManager>,
    grader: Arc<RatioGrader>,
    assessment: Arc<Assessment>,
}

impl Harness {
    async fn new(assessment: Assessment) -> Self {
        let grader = Arc::new(RatioGrader::default());
        let gradebook = Arc::new(Gradebook::new());
        let assessment = assert_ok!(gradebook.insert_assessment(assessment).await);
        let flow = Arc::new(GradingFlow::new(
            gradebook,
            grader.clone(),
            Arc::new(StaticVariantGenerator),
            &test_config(),
        ));
        Self {
            flow,
            manager: Arc::new(JobSequenceManager::new()),
            grader,
            assessment,
        }
    }

    async fn student(&self, uid: &str, qid: &str) -> GradingCtx {
        let ai_id = assert_ok!(self.flow.start_assessment_instance(self.assessment.id, uid, uid).await);
        assert_ok!(self.flow.context_for_qid(ai_id, qid, uid).await)
    }

    async fn grade(&self, ctx: &GradingCtx, answer: JsonValue) -> f64 {
        let variant = assert_ok!(self.flow.open_variant(ctx).await);
        let result = assert_ok!(
            self.flow
                .submit(ctx, variant.id, answer, SubmissionAction::Grade)
                .await
        );
        result.question_points
    }

    async fn question_points(&self, ctx: &GradingCtx) -> f64 {
        let iq = assert_ok!(self.flow.gradebook().instance_question(ctx.instance_question_id).await);
        let points = iq.lock().await.points;
        points
    }

    async fn instance_points(&self, ctx: &GradingCtx) -> f64 {
        let ai = assert_ok!(self.flow.gradebook().assessment_instance(ctx.assessment_instance_id).await);
        let points = ai.lock().await.points;
        points
    }
}

fn homework(questions: Vec<AssessmentQuestion>) -> Assessment {
    Assessment::new("HW1", AssessmentType::Homework, vec![Zone::new("作业", questions)])
}

#[tokio::test]
async fn test_partial_credit_counts_only_improvement() {
    let h = Harness::new(homework(vec![AssessmentQuestion::new("partialCredit1", 19.0)])).await;
    let ctx = h.student("alice", "partialCredit1").await;

    assert!(approx_eq(h.grade(&ctx, json!(0.15)).await, 2.85));
    // 得分下降不扣分
    assert!(approx_eq(h.grade(&ctx, json!(0.11)).await, 2.85));
    // 只计入超过历史最高的部分
    assert!(approx_eq(h.grade(&ctx, json!(0.34)).await, 6.46));
    assert!(approx_eq(h.instance_points(&ctx).await, 6.46));
}

#[tokio::test]
async fn test_homework_value_grows_after_correct_answer() {
    let question = AssessmentQuestion::new("doubling", 30.0).with_init_points(5.0);
    let h = Harness::new(homework(vec![question])).await;
    let ctx = h.student("alice", "doubling").await;

    assert_eq!(h.grade(&ctx, json!(1.0)).await, 5.0);

    let variant = assert_ok!(h.flow.request_new_variant(&ctx).await);
    let result = assert_ok!(
        h.flow
            .submit(&ctx, variant.id, json!(1.0), SubmissionAction::Grade)
            .await
    );
    // 答对后分值变为 10
    assert_eq!(result.question_points, 15.0);

    let variant = assert_ok!(h.flow.request_new_variant(&ctx).await);
    let result = assert_ok!(
        h.flow
            .submit(&ctx, variant.id, json!(1.0), SubmissionAction::Grade)
            .await
    );
    // 不超过题目满分
    assert_eq!(result.question_points, 30.0);
}

#[tokio::test]
async fn test_zone_cap_limits_instance_total() {
    let zone = Zone::new(
        "选做",
        vec![AssessmentQuestion::new("q1", 10.0), AssessmentQuestion::new("q2", 10.0)],
    )
    .with_max_points(10.0);
    let h = Harness::new(Assessment::new("HW2", AssessmentType::Homework, vec![zone])).await;

    let q1 = h.student("alice", "q1").await;
    let q2 = assert_ok!(
        h.flow
            .context_for_qid(q1.assessment_instance_id, "q2", "alice")
            .await
    );
    h.grade(&q1, json!(1.0)).await;
    h.grade(&q2, json!(1.0)).await;

    assert_eq!(h.question_points(&q1).await, 10.0);
    assert_eq!(h.question_points(&q2).await, 10.0);
    assert_eq!(h.instance_points(&q1).await, 10.0);
}

#[tokio::test]
async fn test_regrade_all_records_failed_jobs() {
    let h = Harness::new(homework(vec![AssessmentQuestion::new("q1", 10.0)])).await;
    let alice = h.student("alice", "q1").await;
    let bob = h.student("bob", "q1").await;
    h.grade(&alice, json!(0.5)).await;
    h.grade(&bob, json!({ "score": 0.8, "flaky": true })).await;

    h.grader.outage.store(true, Ordering::SeqCst);
    let id = assert_ok!(
        bulk_operations::regrade_all(&h.flow, &h.manager, h.assessment.id, "instructor").await
    );
    let snapshot = assert_ok!(
        h.manager
            .wait_for_completion(id, PollOptions::from_config(&test_config()))
            .await
    );

    assert_eq!(snapshot.status, JobStatus::Error);
    assert_eq!(snapshot.jobs.len(), 2);
    assert_eq!(snapshot.succeeded(), 1);
    assert_eq!(snapshot.failed(), 1);

    // 失败的重新评分不改动已有得分
    assert_eq!(h.question_points(&alice).await, 5.0);
    assert_eq!(h.question_points(&bob).await, 8.0);
}

#[tokio::test]
async fn test_regrade_all_is_idempotent() {
    let h = Harness::new(homework(vec![AssessmentQuestion::new("q1", 19.0)])).await;
    let ctx = h.student("alice", "q1").await;
    h.grade(&ctx, json!(0.15)).await;
    h.grade(&ctx, json!(0.34)).await;
    let before = h.question_points(&ctx).await;

    for _ in 0..2 {
        let id = assert_ok!(
            bulk_operations::regrade_all(&h.flow, &h.manager, h.assessment.id, "instructor").await
        );
        let snapshot = assert_ok!(
            h.manager
                .wait_for_completion(id, PollOptions::from_config(&test_config()))
                .await
        );
        assert_eq!(snapshot.status, JobStatus::Success);
        assert!(approx_eq(h.question_points(&ctx).await, before));
    }
}

#[tokio::test]
async fn test_grade_all_grades_saved_submissions() {
    let h = Harness::new(homework(vec![AssessmentQuestion::new("q1", 10.0)])).await;
    let mut contexts = Vec::new();
    for uid in ["alice", "bob"] {
        let ctx = h.student(uid, "q1").await;
        let variant = assert_ok!(h.flow.open_variant(&ctx).await);
        assert_ok!(
            h.flow
                .submit(&ctx, variant.id, json!(0.6), SubmissionAction::Save)
                .await
        );
        contexts.push(ctx);
    }

    let id = assert_ok!(
        bulk_operations::grade_all_assessment_instances(&h.flow, &h.manager, h.assessment.id, "instructor")
            .await
    );
    let snapshot = assert_ok!(
        h.manager
            .wait_for_completion(id, PollOptions::from_config(&test_config()))
            .await
    );
    assert_eq!(snapshot.status, JobStatus::Success);
    for ctx in &contexts {
        assert_eq!(h.question_points(ctx).await, 6.0);
    }
}

#[tokio::test]
async fn test_upload_instance_question_scores() {
    let question = AssessmentQuestion::new("q1", 6.0).with_manual_points(4.0);
    let h = Harness::new(homework(vec![question])).await;
    let alice = h.student("alice", "q1").await;
    let bob = h.student("bob", "q1").await;

    let csv_text = "uid,instance,qid,score_perc,feedback\n\
                    alice,1,q1,80,写得不错\n\
                    bob,1,q1,,\n\
                    carol,1,q1,50,\n";
    let id = assert_ok!(
        bulk_operations::upload_instance_question_scores(
            &h.flow,
            &h.manager,
            h.assessment.id,
            csv_text,
            "instructor"
        )
        .await
    );
    let snapshot = assert_ok!(
        h.manager
            .wait_for_completion(id, PollOptions::from_config(&test_config()))
            .await
    );

    assert_eq!(snapshot.jobs.len(), 3);
    assert_eq!(snapshot.jobs[0].status, JobStatus::Success);
    // 没有分数字段的行跳过，不算失败
    assert_eq!(snapshot.jobs[1].status, JobStatus::Success);
    assert!(snapshot.jobs[1].output.contains("跳过"));
    // carol 没有评估实例
    assert_eq!(snapshot.jobs[2].status, JobStatus::Error);
    assert_eq!(snapshot.status, JobStatus::Error);

    assert_eq!(h.question_points(&alice).await, 8.0);
    assert_eq!(h.question_points(&bob).await, 0.0);

    let iq = assert_ok!(h.flow.gradebook().instance_question(alice.instance_question_id).await);
    let iq = iq.lock().await;
    assert_eq!(iq.auto_points, 0.0);
    assert_eq!(iq.manual_points, 8.0);
}

#[tokio::test]
async fn test_upload_with_bad_header_creates_no_sequence() {
    let h = Harness::new(homework(vec![AssessmentQuestion::new("q1", 10.0)])).await;
    assert_err!(
        bulk_operations::upload_instance_question_scores(
            &h.flow,
            &h.manager,
            h.assessment.id,
            "name,grade\nalice,10\n",
            "instructor"
        )
        .await
    );
    assert_err!(
        bulk_operations::upload_assessment_instance_scores(
            &h.flow,
            &h.manager,
            h.assessment.id,
            "uid,points\nalice,10\n",
            "instructor"
        )
        .await
    );
}

#[tokio::test]
async fn test_upload_assessment_instance_scores() {
    let h = Harness::new(homework(vec![AssessmentQuestion::new("q1", 20.0)])).await;
    let alice = h.student("alice", "q1").await;
    h.grade(&alice, json!(0.25)).await;

    let id = assert_ok!(
        bulk_operations::upload_assessment_instance_scores(
            &h.flow,
            &h.manager,
            h.assessment.id,
            "uid,instance,score_perc\nalice,1,75\nalice,2,90\n",
            "instructor"
        )
        .await
    );
    let snapshot = assert_ok!(
        h.manager
            .wait_for_completion(id, PollOptions::from_config(&test_config()))
            .await
    );
    assert_eq!(snapshot.succeeded(), 1);
    assert_eq!(snapshot.failed(), 1);

    assert_eq!(h.instance_points(&alice).await, 15.0);
    // 覆盖的是总分，题目得分不变
    assert_eq!(h.question_points(&alice).await, 5.0);
}

#[tokio::test]
async fn test_concurrent_students_graded_independently() {
    let h = Harness::new(homework(vec![AssessmentQuestion::new("q1", 10.0)])).await;
    let h = Arc::new(h);

    let mut handles = Vec::new();
    for i in 0..8u32 {
        let h = Arc::clone(&h);
        handles.push(tokio::spawn(async move {
            let uid = format!("student{}", i);
            let ctx = h.student(&uid, "q1").await;
            let score = f64::from(i) / 10.0;
            h.grade(&ctx, json!(score)).await;
            (ctx, score * 10.0)
        }));
    }

    for handle in handles {
        let (ctx, expected) = assert_ok!(handle.await);
        assert!(approx_eq(h.question_points(&ctx).await, expected));
        assert!(approx_eq(h.instance_points(&ctx).await, expected));
    }
}

#[tokio::test]
async fn test_exports_reflect_current_scores() {
    let h = Harness::new(homework(vec![AssessmentQuestion::new("q1", 10.0)])).await;
    let alice = h.student("alice", "q1").await;
    let bob = h.student("bob", "q1").await;
    h.grade(&alice, json!(1.0)).await;
    h.grade(&bob, json!(0.5)).await;

    let records = assert_ok!(h.flow.instance_records(h.assessment.id).await);
    assert_eq!(records.len(), 2);

    let points = assert_ok!(csv_export::gradebook_csv(&[h.assessment.clone()], &records, true));
    assert!(points.starts_with("UID,HW1"));
    assert!(points.contains("alice,10"));
    assert!(points.contains("bob,5"));

    let files = assert_ok!(csv_export::assessment_exports(&h.assessment.tid, &records));
    assert_eq!(files.len(), 5);
    assert!(files.iter().all(|(name, _)| name.starts_with("HW1_")));
}
