//! 作业序列与作业

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AssessmentId, JobId, JobSequenceId};
use crate::error::JobError;

/// 作业与作业序列共用的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// 作业序列的用途
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceKind {
    RegradeAssessment(AssessmentId),
    GradeAllInstances(AssessmentId),
    UploadInstanceQuestionScores(AssessmentId),
    UploadAssessmentInstanceScores(AssessmentId),
    Other(String),
}

impl SequenceKind {
    pub fn label(&self) -> String {
        match self {
            SequenceKind::RegradeAssessment(id) => format!("重新评分 评估#{}", id),
            SequenceKind::GradeAllInstances(id) => format!("批量评分 评估#{}", id),
            SequenceKind::UploadInstanceQuestionScores(id) => {
                format!("上传题目分数 评估#{}", id)
            }
            SequenceKind::UploadAssessmentInstanceScores(id) => {
                format!("上传实例分数 评估#{}", id)
            }
            SequenceKind::Other(name) => name.clone(),
        }
    }
}

/// 作业序列中的一个作业
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// 在序列中的序号（从1开始）
    pub number: usize,
    pub description: String,
    pub status: JobStatus,
    pub output: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, number: usize, description: impl Into<String>) -> Self {
        Self {
            id,
            number,
            description: description.into(),
            status: JobStatus::Running,
            output: String::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn succeed(&mut self, output: impl Into<String>) {
        self.output = output.into();
        self.status = JobStatus::Success;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.output.is_empty() {
            self.output.push('\n');
        }
        self.output.push_str(&message);
        self.error = Some(message);
        self.status = JobStatus::Error;
        self.finished_at = Some(Utc::now());
    }
}

/// 作业序列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSequence {
    pub id: JobSequenceId,
    pub kind: SequenceKind,
    /// 发起者
    pub owner: String,
    pub description: String,
    pub status: JobStatus,
    pub jobs: Vec<Job>,
    /// 不再追加作业
    pub finalized: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSequence {
    pub fn new(
        id: JobSequenceId,
        kind: SequenceKind,
        owner: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            owner: owner.into(),
            description: description.into(),
            status: JobStatus::Running,
            jobs: Vec::new(),
            finalized: false,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    /// 结束且没有运行中的作业时确定最终状态
    pub fn settle(&mut self) {
        if !self.finalized || self.status.is_terminal() {
            return;
        }
        if self.jobs.iter().any(|job| job.status == JobStatus::Running) {
            return;
        }
        self.status = if self.jobs.iter().any(|job| job.status == JobStatus::Error) {
            JobStatus::Error
        } else {
            JobStatus::Success
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> SequenceSnapshot {
        SequenceSnapshot {
            id: self.id,
            kind: self.kind.clone(),
            description: self.description.clone(),
            status: self.status,
            finalized: self.finalized,
            jobs: self.jobs.clone(),
        }
    }
}

/// 轮询结果：作业序列在某一时刻的只读副本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub id: JobSequenceId,
    pub kind: SequenceKind,
    pub description: String,
    pub status: JobStatus,
    pub finalized: bool,
    pub jobs: Vec<Job>,
}

impl SequenceSnapshot {
    pub fn succeeded(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Error)
            .count()
    }

    /// 失败的序列转换为带有每个作业详情的错误
    pub fn into_result(self) -> Result<Self, JobError> {
        if self.status != JobStatus::Error {
            return Ok(self);
        }
        let failures = self
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Error)
            .map(|job| JobError::JobFailure {
                job_id: job.id,
                message: job.error.clone().unwrap_or_default(),
            })
            .collect();
        Err(JobError::SequenceFailure {
            id: self.id,
            failures,
        })
    }
}
