//! 成绩导出 - 业务能力层
//!
//! 所有导出都基于评估实例的只读快照，列顺序固定

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::{AppError, AppResult, CsvError};
use crate::models::{Assessment, AssessmentInstance, InstanceQuestion, Submission};
use crate::utils::csv::CsvWriter;
use crate::utils::format_points;

pub const INSTANCES_COLUMNS: [&str; 6] = ["UID", "Username", "Assessment", "Score (%)", "Points", "Max points"];

pub const INSTANCE_QUESTIONS_COLUMNS: [&str; 10] = [
    "UID",
    "Assessment",
    "Question",
    "Question points",
    "Max points",
    "Question % score",
    "Auto points",
    "Max auto points",
    "Manual points",
    "Max manual points",
];

pub const SUBMISSIONS_COLUMNS: [&str; 10] = [
    "UID",
    "Assessment",
    "Question",
    "Variant",
    "submission_id",
    "Submitted answer",
    "Score",
    "Correct",
    "Max points",
    "Question % score",
];

/// 一个评估实例的快照
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub assessment: Arc<Assessment>,
    pub instance: AssessmentInstance,
    /// 按题号排序
    pub questions: Vec<InstanceQuestion>,
}

/// 提交导出范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionSelection {
    /// 全部提交
    All,
    /// 每道实例题目的最后一次提交
    Final,
    /// 每道实例题目得分最高的提交
    Best,
}

impl SubmissionSelection {
    pub fn file_stem(&self) -> &'static str {
        match self {
            SubmissionSelection::All => "all_submissions",
            SubmissionSelection::Final => "final_submissions",
            SubmissionSelection::Best => "best_submissions",
        }
    }
}

static UNSAFE_FILENAME_CHARS: OnceLock<Regex> = OnceLock::new();

fn unsafe_filename_chars() -> AppResult<&'static Regex> {
    if let Some(re) = UNSAFE_FILENAME_CHARS.get() {
        return Ok(re);
    }
    let re = Regex::new(r"[^A-Za-z0-9_\-]+").map_err(|e| AppError::Other(e.to_string()))?;
    Ok(UNSAFE_FILENAME_CHARS.get_or_init(|| re))
}

/// 把评估标识转换为安全的文件名前缀
pub fn sanitize_tid(tid: &str) -> AppResult<String> {
    let re = unsafe_filename_chars()?;
    let sanitized = re.replace_all(tid.trim(), "_").trim_matches('_').to_string();
    Ok(if sanitized.is_empty() {
        "assessment".to_string()
    } else {
        sanitized
    })
}

/// 带评估前缀的导出文件名
pub fn export_filename(tid: &str, stem: &str) -> AppResult<String> {
    Ok(format!("{}_{}.csv", sanitize_tid(tid)?, stem))
}

/// scores.csv / points.csv：每个学生一行，每个评估一列
///
/// 同一学生有多个实例时取最高分
pub fn gradebook_csv(assessments: &[Arc<Assessment>], records: &[InstanceRecord], use_points: bool) -> Result<String, CsvError> {
    let mut table: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for record in records {
        let value = if use_points {
            record.instance.points
        } else {
            record.instance.score_perc
        };
        let entry = table
            .entry(record.instance.uid.as_str())
            .or_default()
            .entry(record.assessment.tid.as_str())
            .or_insert(value);
        *entry = entry.max(value);
    }

    let mut headers = vec!["UID"];
    headers.extend(assessments.iter().map(|a| a.tid.as_str()));
    let mut writer = CsvWriter::new(&headers);
    for (uid, scores) in &table {
        let mut row = vec![uid.to_string()];
        row.extend(assessments.iter().map(|a| {
            scores
                .get(a.tid.as_str())
                .map(|v| format_points(*v))
                .unwrap_or_default()
        }));
        writer.write_row(row);
    }
    writer.finish()
}

/// instances.csv
pub fn instances_csv(records: &[InstanceRecord]) -> Result<String, CsvError> {
    let mut writer = CsvWriter::new(&INSTANCES_COLUMNS);
    for record in records {
        let instance = &record.instance;
        writer.write_row([
            instance.uid.clone(),
            instance.username.clone(),
            record.assessment.tid.clone(),
            format_points(instance.score_perc),
            format_points(instance.points),
            format_points(instance.max_points),
        ]);
    }
    writer.finish()
}

/// instance_questions.csv
pub fn instance_questions_csv(records: &[InstanceRecord]) -> Result<String, CsvError> {
    let mut writer = CsvWriter::new(&INSTANCE_QUESTIONS_COLUMNS);
    for record in records {
        for iq in &record.questions {
            let Some(question) = record.assessment.question(iq.assessment_question_id) else {
                continue;
            };
            writer.write_row([
                record.instance.uid.clone(),
                record.assessment.tid.clone(),
                question.qid.clone(),
                format_points(iq.points),
                format_points(question.max_points()),
                format_points(iq.score_perc),
                format_points(iq.auto_points),
                format_points(question.max_auto_points),
                format_points(iq.manual_points),
                format_points(question.max_manual_points),
            ]);
        }
    }
    writer.finish()
}

fn selected_submissions(iq: &InstanceQuestion, selection: SubmissionSelection) -> Vec<(u32, &Submission)> {
    let with_variant = iq
        .variants
        .iter()
        .flat_map(|v| v.submissions.iter().map(move |s| (v.number, s)));

    match selection {
        SubmissionSelection::All => with_variant.collect(),
        SubmissionSelection::Final => with_variant
            .max_by_key(|(_, s)| (s.submitted_at, s.id))
            .into_iter()
            .collect(),
        SubmissionSelection::Best => with_variant
            .filter(|(_, s)| s.counts_toward_points())
            .max_by(|(_, a), (_, b)| {
                a.score
                    .unwrap_or(0.0)
                    .total_cmp(&b.score.unwrap_or(0.0))
                    .then(b.id.cmp(&a.id))
            })
            .into_iter()
            .collect(),
    }
}

/// all_submissions.csv / final_submissions.csv / best_submissions.csv
pub fn submissions_csv(records: &[InstanceRecord], selection: SubmissionSelection) -> Result<String, CsvError> {
    let mut writer = CsvWriter::new(&SUBMISSIONS_COLUMNS);
    for record in records {
        for iq in &record.questions {
            let Some(question) = record.assessment.question(iq.assessment_question_id) else {
                continue;
            };
            for (variant_number, submission) in selected_submissions(iq, selection) {
                writer.write_row([
                    record.instance.uid.clone(),
                    record.assessment.tid.clone(),
                    question.qid.clone(),
                    variant_number.to_string(),
                    submission.id.to_string(),
                    submission.submitted_answer.to_string(),
                    submission.score.map(format_points).unwrap_or_default(),
                    submission
                        .correct
                        .map(|c| if c { "TRUE" } else { "FALSE" }.to_string())
                        .unwrap_or_default(),
                    format_points(question.max_points()),
                    format_points(iq.score_perc),
                ]);
            }
        }
    }
    writer.finish()
}

/// 生成一个评估的全部导出文件：(文件名, 内容)
pub fn assessment_exports(tid: &str, records: &[InstanceRecord]) -> AppResult<Vec<(String, String)>> {
    let mut files = vec![
        (export_filename(tid, "instances")?, instances_csv(records)?),
        (
            export_filename(tid, "instance_questions")?,
            instance_questions_csv(records)?,
        ),
    ];
    for selection in [
        SubmissionSelection::All,
        SubmissionSelection::Final,
        SubmissionSelection::Best,
    ] {
        files.push((
            export_filename(tid, selection.file_stem())?,
            submissions_csv(records, selection)?,
        ));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssessmentQuestion, AssessmentType, SubmissionAction, Variant, Zone};
    use crate::utils::csv;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn assessment(tid: &str) -> Arc<Assessment> {
        let mut q = AssessmentQuestion::new("addNumbers", 10.0);
        q.id = 2;
        let mut a = Assessment::new(tid, AssessmentType::Homework, vec![Zone::new("z", vec![q])]);
        a.id = 1;
        Arc::new(a)
    }

    fn submission(id: u64, score: f64, minutes: i64) -> Submission {
        let mut s = Submission::new(id, 7, json!({ "c": id }), SubmissionAction::Grade);
        s.record_score(score, serde_json::Value::Null);
        s.submitted_at = Utc::now() + Duration::minutes(minutes);
        s
    }

    fn record(uid: &str, assessment: Arc<Assessment>, points: f64) -> InstanceRecord {
        let mut instance = AssessmentInstance::new(3, assessment.id, uid, uid.to_uppercase(), 1, 10.0);
        instance.points = points;
        instance.score_perc = points * 10.0;

        let mut iq = InstanceQuestion::new(4, 3, 2, 1, 10.0);
        iq.set_points(points, 0.0, 10.0);
        iq.variants.push(Variant {
            id: 7,
            instance_question_id: 4,
            number: 1,
            seed: 1,
            params: json!({}),
            true_answer: json!(1),
            broken: false,
            created_at: Utc::now(),
            submissions: vec![submission(11, 0.5, 0), submission(12, 0.9, 1), submission(13, 0.2, 2)],
        });

        InstanceRecord {
            assessment,
            instance,
            questions: vec![iq],
        }
    }

    #[test]
    fn test_sanitize_tid() {
        assert_eq!(sanitize_tid("HW 1/part a").unwrap(), "HW_1_part_a");
        assert_eq!(sanitize_tid("  ").unwrap(), "assessment");
        assert_eq!(export_filename("Exam-2", "instances").unwrap(), "Exam-2_instances.csv");
    }

    #[test]
    fn test_filename_regex_compiled_once() {
        let first = unsafe_filename_chars().unwrap();
        let second = unsafe_filename_chars().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_instances_csv_columns() {
        let text = instances_csv(&[record("alice", assessment("HW1"), 9.0)]).unwrap();
        let table = csv::parse(&text).unwrap();
        assert_eq!(
            table.headers,
            vec!["uid", "username", "assessment", "score (%)", "points", "max points"]
        );
        assert_eq!(table.rows[0].values, vec!["alice", "ALICE", "HW1", "90", "9", "10"]);
    }

    #[test]
    fn test_instance_questions_csv() {
        let text = instance_questions_csv(&[record("alice", assessment("HW1"), 4.5)]).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], INSTANCE_QUESTIONS_COLUMNS.join(","));
        assert_eq!(lines[1], "alice,HW1,addNumbers,4.5,10,45,4.5,10,0,0");
    }

    #[test]
    fn test_submission_selections() {
        let records = [record("alice", assessment("HW1"), 9.0)];
        let ids = |selection| {
            let table = csv::parse(&submissions_csv(&records, selection).unwrap()).unwrap();
            table
                .rows
                .iter()
                .map(|r| r.values[4].clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(SubmissionSelection::All), vec!["11", "12", "13"]);
        assert_eq!(ids(SubmissionSelection::Final), vec!["13"]);
        assert_eq!(ids(SubmissionSelection::Best), vec!["12"]);

        let table = csv::parse(&submissions_csv(&records, SubmissionSelection::Best).unwrap()).unwrap();
        let row = &table.rows[0].values;
        assert_eq!(row[5], r#"{"c":12}"#);
        assert_eq!(row[6], "0.9");
        assert_eq!(row[7], "FALSE");
    }

    #[test]
    fn test_gradebook_csv_takes_best_instance() {
        let hw1 = assessment("HW1");
        let mut hw2 = (*assessment("HW2")).clone();
        hw2.id = 5;
        let hw2 = Arc::new(hw2);
        let records = vec![
            record("bob", hw1.clone(), 3.0),
            record("bob", hw1.clone(), 6.0),
            record("alice", hw2.clone(), 10.0),
        ];
        let text = gradebook_csv(&[hw1, hw2], &records, true).unwrap();
        assert_eq!(text, "UID,HW1,HW2\nalice,,10\nbob,6,\n");
    }

    #[test]
    fn test_assessment_exports_file_names() {
        let files = assessment_exports("HW 1", &[record("alice", assessment("HW 1"), 1.0)]).unwrap();
        let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "HW_1_instances.csv",
                "HW_1_instance_questions.csv",
                "HW_1_all_submissions.csv",
                "HW_1_final_submissions.csv",
                "HW_1_best_submissions.csv"
            ]
        );
    }
}
