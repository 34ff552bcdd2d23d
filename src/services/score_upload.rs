//! 分数 CSV 解析 - 业务能力层
//!
//! 只负责把上传的 CSV 行解析成改分请求，不查找记录也不改分。
//! 表头错误使整个文件失败；单行错误只影响该行

use phf::phf_map;
use serde_json::{json, Value as JsonValue};

use crate::error::CsvError;
use crate::models::SubmissionId;
use crate::services::score_override::{AssessmentOverride, ScoreUpdate};
use crate::utils::csv::{self, CsvRow, CsvTable};

/// 可上传的分数列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreField {
    ScorePerc,
    Points,
    ManualScorePerc,
    ManualPoints,
    AutoScorePerc,
    AutoPoints,
}

static SCORE_COLUMNS: phf::Map<&'static str, ScoreField> = phf_map! {
    "score_perc" => ScoreField::ScorePerc,
    "points" => ScoreField::Points,
    "manual_score_perc" => ScoreField::ManualScorePerc,
    "manual_points" => ScoreField::ManualPoints,
    "auto_score_perc" => ScoreField::AutoScorePerc,
    "auto_points" => ScoreField::AutoPoints,
};

/// 上传行定位到哪道实例题目
#[derive(Debug, Clone, PartialEq)]
pub enum RowTarget {
    /// 按提交 ID 定位，可附带 uid / qid 用于核对
    Submission {
        submission_id: SubmissionId,
        uid: Option<String>,
        qid: Option<String>,
    },
    /// 按学生 + 实例序号 + 题目定位
    Question {
        uid: String,
        instance: u32,
        qid: String,
    },
}

/// 实例题目分数上传中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceQuestionScoreRow {
    pub target: RowTarget,
    pub update: ScoreUpdate,
}

/// 评估实例分数上传中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentInstanceScoreRow {
    pub uid: String,
    pub instance: u32,
    pub score: AssessmentOverride,
}

/// 单行解析结果；`Ok(None)` 表示该行没有分数字段，应跳过
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow<T> {
    pub line: usize,
    pub result: Result<Option<T>, CsvError>,
}

impl<T> ParsedRow<T> {
    /// 用于作业描述的行标签
    pub fn label(&self) -> String {
        format!("第 {} 行", self.line)
    }
}

fn parse_number(table: &CsvTable, row: &CsvRow, column: &str) -> Result<Option<f64>, CsvError> {
    match table.get(row, column) {
        Some(value) => value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| CsvError::InvalidNumber {
                column: column.to_string(),
                value: value.to_string(),
            }),
        None => Ok(None),
    }
}

fn parse_integer<T: std::str::FromStr>(
    table: &CsvTable,
    row: &CsvRow,
    column: &str,
) -> Result<Option<T>, CsvError> {
    match table.get(row, column) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| CsvError::InvalidNumber {
                column: column.to_string(),
                value: value.to_string(),
            }),
        None => Ok(None),
    }
}

fn parse_feedback(value: &str) -> Result<JsonValue, CsvError> {
    if value.starts_with('{') {
        let parsed: JsonValue =
            serde_json::from_str(value).map_err(|e| CsvError::InvalidJson {
                column: "feedback".to_string(),
                message: e.to_string(),
            })?;
        if !parsed.is_object() {
            return Err(CsvError::InvalidJson {
                column: "feedback".to_string(),
                message: "不是 JSON 对象".to_string(),
            });
        }
        Ok(parsed)
    } else {
        Ok(json!({ "manual": value }))
    }
}

fn score_update(table: &CsvTable, row: &CsvRow) -> Result<ScoreUpdate, CsvError> {
    let mut update = ScoreUpdate::default();
    for header in &table.headers {
        let Some(field) = SCORE_COLUMNS.get(header.as_str()) else {
            continue;
        };
        let value = parse_number(table, row, header)?;
        match field {
            ScoreField::ScorePerc => update.score_perc = value,
            ScoreField::Points => update.points = value,
            ScoreField::ManualScorePerc => update.manual_score_perc = value,
            ScoreField::ManualPoints => update.manual_points = value,
            ScoreField::AutoScorePerc => update.auto_score_perc = value,
            ScoreField::AutoPoints => update.auto_points = value,
        }
    }
    if let Some(feedback) = table.get(row, "feedback") {
        update.feedback = Some(parse_feedback(feedback)?);
    }
    Ok(update)
}

fn instance_question_row(
    table: &CsvTable,
    row: &CsvRow,
) -> Result<Option<InstanceQuestionScoreRow>, CsvError> {
    let update = score_update(table, row)?;
    if update.is_empty() && update.feedback.is_none() {
        return Ok(None);
    }

    let uid = table
        .get(row, "uid")
        .or_else(|| table.get(row, "group_name"))
        .map(str::to_string);
    let qid = table.get(row, "qid").map(str::to_string);

    let target = match parse_integer::<SubmissionId>(table, row, "submission_id")? {
        Some(submission_id) => RowTarget::Submission {
            submission_id,
            uid,
            qid,
        },
        None => RowTarget::Question {
            uid: uid.ok_or_else(|| CsvError::MissingColumn("uid".to_string()))?,
            instance: parse_integer(table, row, "instance")?
                .ok_or_else(|| CsvError::MissingColumn("instance".to_string()))?,
            qid: qid.ok_or_else(|| CsvError::MissingColumn("qid".to_string()))?,
        },
    };

    Ok(Some(InstanceQuestionScoreRow { target, update }))
}

/// 解析实例题目分数 CSV
///
/// 必需列：`submission_id`，或 `uid`/`group_name` + `instance` + `qid`；
/// 分数列为 score_perc / points / manual_* / auto_* 中任意组合
pub fn parse_instance_question_scores(
    text: &str,
) -> Result<Vec<ParsedRow<InstanceQuestionScoreRow>>, CsvError> {
    let table = csv::parse(text)?;
    let has_submission = table.has_column("submission_id");
    let has_identity = (table.has_column("uid") || table.has_column("group_name"))
        && table.has_column("instance")
        && table.has_column("qid");
    if !has_submission && !has_identity {
        return Err(CsvError::MissingColumn(
            "submission_id 或 uid + instance + qid".to_string(),
        ));
    }

    Ok(table
        .rows
        .iter()
        .map(|row| ParsedRow {
            line: row.line,
            result: instance_question_row(&table, row),
        })
        .collect())
}

fn assessment_instance_row(
    table: &CsvTable,
    row: &CsvRow,
) -> Result<Option<AssessmentInstanceScoreRow>, CsvError> {
    let score = match (
        parse_number(table, row, "score_perc")?,
        parse_number(table, row, "points")?,
    ) {
        (Some(perc), _) => AssessmentOverride::ScorePerc(perc),
        (None, Some(points)) => AssessmentOverride::Points(points),
        (None, None) => return Ok(None),
    };

    let uid = table
        .get(row, "uid")
        .or_else(|| table.get(row, "group_name"))
        .ok_or_else(|| CsvError::MissingColumn("uid".to_string()))?
        .to_string();
    let instance = parse_integer(table, row, "instance")?
        .ok_or_else(|| CsvError::MissingColumn("instance".to_string()))?;

    Ok(Some(AssessmentInstanceScoreRow {
        uid,
        instance,
        score,
    }))
}

/// 解析评估实例分数 CSV
///
/// 必需列：`uid` + `instance`，以及 `score_perc` 或 `points`
pub fn parse_assessment_instance_scores(
    text: &str,
) -> Result<Vec<ParsedRow<AssessmentInstanceScoreRow>>, CsvError> {
    let table = csv::parse(text)?;
    if !table.has_column("instance") {
        return Err(CsvError::MissingColumn("instance".to_string()));
    }
    if !table.has_column("uid") && !table.has_column("group_name") {
        return Err(CsvError::MissingColumn("uid".to_string()));
    }
    if !table.has_column("score_perc") && !table.has_column("points") {
        return Err(CsvError::MissingColumn("score_perc 或 points".to_string()));
    }

    Ok(table
        .rows
        .iter()
        .map(|row| ParsedRow {
            line: row.line,
            result: assessment_instance_row(&table, row),
        })
        .collect())
}
