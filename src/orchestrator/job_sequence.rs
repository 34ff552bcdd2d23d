//! 作业序列管理器 - 编排层
//!
//! ## 职责
//!
//! 长时间运行的批量操作（重新评分、分数上传）拆成一串作业顺序执行，
//! 调用方通过作业序列 ID 轮询进度。
//!
//! - 单个作业的错误或 panic 只记录在该作业上，不会向外传播
//! - 第一个失败之后剩余作业照常执行，序列最终为 `Error`
//! - 只有 `finalize` 之后且所有作业结束，序列才会离开 `Running`
//! - 没有取消操作

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppResult, JobError};
use crate::models::{Job, JobId, JobSequence, JobSequenceId, JobStatus, SequenceKind, SequenceSnapshot};

/// 预先构建好的作业：描述 + 待执行的工作
pub struct PlannedJob {
    pub description: String,
    pub work: BoxFuture<'static, AppResult<String>>,
}

impl PlannedJob {
    pub fn new<F>(description: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = AppResult<String>> + Send + 'static,
    {
        Self {
            description: description.into(),
            work: work.boxed(),
        }
    }
}

/// 轮询参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollOptions {
    /// 首次轮询间隔
    pub interval: Duration,
    /// 间隔上限
    pub max_interval: Duration,
    /// 每次轮询后间隔乘以该系数
    pub backoff_factor: f64,
    /// 最多轮询次数
    pub max_polls: usize,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PollOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.poll_interval(),
            max_interval: config.poll_max_interval(),
            backoff_factor: 2.0,
            max_polls: config.poll_max_attempts.max(1),
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_factor.max(1.0))
            .min(self.max_interval.max(self.interval))
    }
}

/// 作业序列管理器
pub struct JobSequenceManager {
    next_id: AtomicU64,
    sequences: RwLock<BTreeMap<JobSequenceId, Arc<Mutex<JobSequence>>>>,
}

impl JobSequenceManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sequences: RwLock::new(BTreeMap::new()),
        }
    }

    /// 创建作业序列
    pub async fn create(&self, kind: SequenceKind, owner: &str, description: impl Into<String>) -> JobSequenceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sequence = JobSequence::new(id, kind, owner, description);
        info!(
            "[作业序列 #{}] 🆕 创建: {} ({}), 发起者 {}",
            id,
            sequence.description,
            sequence.kind.label(),
            owner
        );
        self.sequences
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(sequence)));
        id
    }

    async fn sequence(&self, id: JobSequenceId) -> Result<Arc<Mutex<JobSequence>>, JobError> {
        self.sequences
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobError::SequenceNotFound { id })
    }

    /// 在序列中追加并执行一个作业，返回作业 ID
    ///
    /// 工作返回的错误和 panic 都被记录为作业失败；
    /// 只有序列不存在或已结束时返回错误
    pub async fn run_job<F, Fut, E>(
        &self,
        id: JobSequenceId,
        description: impl Into<String>,
        work: F,
    ) -> Result<JobId, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Display,
    {
        let sequence = self.sequence(id).await?;
        let description = description.into();
        let (job_id, number) = {
            let mut sequence = sequence.lock().await;
            if sequence.finalized {
                return Err(JobError::SequenceFinalized { id });
            }
            let job_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let number = sequence.jobs.len() + 1;
            sequence.jobs.push(Job::new(job_id, number, description.clone()));
            (job_id, number)
        };

        debug!("[作业序列 #{}] ▶ 作业 {}: {}", id, number, description);
        let result = AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await;

        let mut sequence = sequence.lock().await;
        if let Some(job) = sequence.job_mut(job_id) {
            match result {
                Ok(Ok(output)) => {
                    debug!("[作业序列 #{}] ✓ 作业 {}: {}", id, number, output);
                    job.succeed(output);
                }
                Ok(Err(e)) => {
                    warn!("[作业序列 #{}] ❌ 作业 {} 失败: {}", id, number, e);
                    job.fail(e.to_string());
                }
                Err(panic) => {
                    let message = format!("作业崩溃: {}", panic_message(panic.as_ref()));
                    error!("[作业序列 #{}] 💥 作业 {} {}", id, number, message);
                    job.fail(message);
                }
            }
        }
        sequence.settle();
        Ok(job_id)
    }

    /// 不再追加作业；所有作业结束后确定最终状态
    pub async fn finalize(&self, id: JobSequenceId) -> Result<SequenceSnapshot, JobError> {
        let sequence = self.sequence(id).await?;
        let mut sequence = sequence.lock().await;
        sequence.finalized = true;
        sequence.settle();

        if sequence.status.is_terminal() {
            let snapshot = sequence.snapshot();
            let message = format!(
                "[作业序列 #{}] 🏁 结束: {:?}, 成功 {}/{}",
                id,
                snapshot.status,
                snapshot.succeeded(),
                snapshot.jobs.len()
            );
            if snapshot.status == JobStatus::Success {
                info!("{}", message);
            } else {
                warn!("{}", message);
            }
        }
        Ok(sequence.snapshot())
    }

    /// 当前状态的只读副本
    pub async fn poll(&self, id: JobSequenceId) -> Result<SequenceSnapshot, JobError> {
        let sequence = self.sequence(id).await?;
        let snapshot = sequence.lock().await.snapshot();
        Ok(snapshot)
    }

    /// 轮询直到序列结束（指数退避）
    pub async fn wait_for_completion(
        &self,
        id: JobSequenceId,
        options: PollOptions,
    ) -> Result<SequenceSnapshot, JobError> {
        let mut interval = options.interval;
        for poll in 1..=options.max_polls {
            let snapshot = self.poll(id).await?;
            if snapshot.status.is_terminal() {
                debug!("[作业序列 #{}] 第 {} 次轮询时已结束", id, poll);
                return Ok(snapshot);
            }
            if poll < options.max_polls {
                tokio::time::sleep(interval).await;
                interval = options.next_interval(interval);
            }
        }
        Err(JobError::PollTimeout {
            id,
            polls: options.max_polls,
        })
    }

    /// 移除已结束的序列，返回其最终快照
    pub async fn remove(&self, id: JobSequenceId) -> Result<SequenceSnapshot, JobError> {
        let mut sequences = self.sequences.write().await;
        let sequence = sequences
            .get(&id)
            .cloned()
            .ok_or(JobError::SequenceNotFound { id })?;
        let snapshot = sequence.lock().await.snapshot();
        if !snapshot.status.is_terminal() {
            return Err(JobError::SequenceRunning { id });
        }
        sequences.remove(&id);
        debug!("[作业序列 #{}] 已移除", id);
        Ok(snapshot)
    }

    /// 当前保留的序列数
    pub async fn retained(&self) -> usize {
        self.sequences.read().await.len()
    }

    /// 顺序执行一组作业并结束序列（当前任务内）
    pub async fn execute(&self, id: JobSequenceId, jobs: Vec<PlannedJob>) -> Result<SequenceSnapshot, JobError> {
        for job in jobs {
            let work = job.work;
            self.run_job(id, job.description, move || work).await?;
        }
        self.finalize(id).await
    }

    /// 创建序列并在后台 tokio 任务中执行，立即返回序列 ID
    pub async fn execute_in_background(
        self: &Arc<Self>,
        kind: SequenceKind,
        owner: &str,
        description: impl Into<String>,
        jobs: Vec<PlannedJob>,
    ) -> JobSequenceId {
        let id = self.create(kind, owner, description).await;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.execute(id, jobs).await {
                error!("[作业序列 #{}] 后台执行失败: {}", id, e);
            }
        });
        id
    }
}

impl Default for JobSequenceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知错误".to_string()
    }
}
