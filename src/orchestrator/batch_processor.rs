//! 批量评分处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责一次完整的批量评分运行。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：日志文件、成绩簿、评分流程、作业序列管理器
//! 2. **加载评估**：扫描评估定义 TOML，发布评估并为名单中的学生创建实例、提交作答
//! 3. **分数上传**：每个上传 CSV 作为一个作业序列，用 Semaphore 限制并发
//! 4. **轮询等待**：按配置的退避参数轮询每个作业序列直到结束
//! 5. **导出**：把所有成绩导出为 CSV
//! 6. **全局统计**：汇总所有作业序列的处理结果

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::infrastructure::Gradebook;
use crate::models::{AssessmentFile, JobStatus, SubmissionAction};
use crate::orchestrator::bulk_operations;
use crate::orchestrator::job_sequence::{JobSequenceManager, PollOptions};
use crate::services::csv_export;
use crate::services::grader::{ExactMatchGrader, StaticVariantGenerator};
use crate::utils::logging;
use crate::workflow::{GradingCtx, GradingFlow};

/// 上传文件的类型，由文件名决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// `<tid>.instance_question_scores.csv`
    InstanceQuestionScores,
    /// `<tid>.assessment_instance_scores.csv`
    AssessmentInstanceScores,
}

/// 待处理的上传文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub tid: String,
    pub kind: UploadKind,
    pub path: PathBuf,
}

static UPLOAD_NAME: OnceLock<Regex> = OnceLock::new();

fn upload_name_regex() -> Result<&'static Regex> {
    if let Some(re) = UPLOAD_NAME.get() {
        return Ok(re);
    }
    let re = Regex::new(r"^(?P<tid>.+)\.(?P<kind>instance_question_scores|assessment_instance_scores)\.csv$")?;
    Ok(UPLOAD_NAME.get_or_init(|| re))
}

/// 按文件名识别上传文件；不符合命名规则时返回 None
pub fn classify_upload(path: &Path) -> Result<Option<UploadFile>> {
    let re = upload_name_regex()?;
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let Some(caps) = re.captures(name) else {
        return Ok(None);
    };
    let kind = match &caps["kind"] {
        "instance_question_scores" => UploadKind::InstanceQuestionScores,
        _ => UploadKind::AssessmentInstanceScores,
    };
    Ok(Some(UploadFile {
        tid: caps["tid"].to_string(),
        kind,
        path: path.to_path_buf(),
    }))
}

/// 处理统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}

/// 应用主结构
pub struct App {
    config: Config,
    flow: Arc<GradingFlow>,
    manager: Arc<JobSequenceManager>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        logging::init_log_file(&config.output_log_file)?;

        logging::log_startup(config.max_concurrent_sequences);

        let gradebook = Arc::new(Gradebook::new());
        let flow = Arc::new(GradingFlow::new(
            gradebook,
            Arc::new(ExactMatchGrader),
            Arc::new(StaticVariantGenerator),
            &config,
        ));

        Ok(Self {
            config,
            flow,
            manager: Arc::new(JobSequenceManager::new()),
        })
    }

    pub fn flow(&self) -> &Arc<GradingFlow> {
        &self.flow
    }

    pub fn manager(&self) -> &Arc<JobSequenceManager> {
        &self.manager
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<RunStats> {
        // 加载所有评估定义
        info!("\n📁 正在扫描评估定义...");
        let files = crate::models::load_all_assessment_files(&self.config.assessments_folder).await?;

        if files.is_empty() {
            warn!("⚠️ 没有找到评估定义文件，程序结束");
            return Ok(RunStats::default());
        }

        let assessments = files.len();
        let students = self.publish_assessments(files).await?;
        logging::log_assessments_loaded(assessments, students);

        // 处理所有上传文件
        let uploads = self.find_uploads().await?;
        let stats = self.process_uploads(uploads).await?;

        // 导出成绩
        self.write_exports().await?;

        logging::print_final_stats(
            stats.success,
            stats.failed,
            stats.total,
            &self.config.output_log_file,
        );
        Ok(stats)
    }

    /// 发布评估，为名单中的每个学生创建评估实例并提交作答，返回学生人数
    async fn publish_assessments(&self, files: Vec<AssessmentFile>) -> Result<usize> {
        let mut students = 0;
        for file in files {
            let tid = file.assessment.tid.clone();
            let assessment = match self.flow.gradebook().insert_assessment(file.assessment).await {
                Ok(assessment) => assessment,
                Err(e) => {
                    warn!("⚠️ 跳过评估 {}: {}", tid, e);
                    continue;
                }
            };

            for entry in &file.roster {
                let username = if entry.username.is_empty() {
                    entry.uid.as_str()
                } else {
                    entry.username.as_str()
                };
                let ai_id = self
                    .flow
                    .start_assessment_instance(assessment.id, &entry.uid, username)
                    .await
                    .with_context(|| format!("无法为 {} 创建评估 {} 的实例", entry.uid, tid))?;
                students += 1;

                for (qid, answers) in &entry.answers {
                    let ctx = match self.flow.context_for_qid(ai_id, qid, &entry.uid).await {
                        Ok(ctx) => ctx,
                        Err(e) => {
                            warn!("[评估 {} 学生 {}] ⚠️ 跳过作答: {}", tid, entry.uid, e);
                            continue;
                        }
                    };
                    self.submit_answers(&ctx, answers).await;
                }
            }
        }
        Ok(students)
    }

    /// 依次提交作答；单次提交失败只记录日志
    async fn submit_answers(&self, ctx: &GradingCtx, answers: &[JsonValue]) {
        for answer in answers {
            let result = match self.flow.open_variant(ctx).await {
                Ok(variant) => {
                    self.flow
                        .submit(ctx, variant.id, answer.clone(), SubmissionAction::Grade)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let answer = logging::truncate_text(&answer.to_string(), 40);
                warn!("{} ⚠️ 提交 {} 失败: {}", ctx, answer, e);
                if let Err(log_err) = logging::append_log_line(
                    &self.config.output_log_file,
                    &format!("{} 提交 {} 失败: {}", ctx, answer, e),
                ) {
                    warn!("{} ⚠️ 写入日志失败: {:#}", ctx, log_err);
                }
            }
        }
    }

    /// 扫描上传目录
    async fn find_uploads(&self) -> Result<Vec<UploadFile>> {
        let folder = PathBuf::from(&self.config.uploads_folder);
        if !folder.exists() {
            info!("上传目录不存在，跳过分数上传: {}", self.config.uploads_folder);
            return Ok(Vec::new());
        }

        let mut uploads = Vec::new();
        let mut entries = fs::read_dir(&folder)
            .await
            .with_context(|| format!("无法读取文件夹: {}", self.config.uploads_folder))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match classify_upload(&path)? {
                Some(upload) => uploads.push(upload),
                None => {
                    if path.extension().and_then(|s| s.to_str()) == Some("csv") {
                        warn!("⚠️ 无法识别的上传文件: {}", path.display());
                    }
                }
            }
        }
        uploads.sort_by(|a, b| a.path.cmp(&b.path));
        info!("✓ 找到 {} 个待处理的上传文件", uploads.len());
        Ok(uploads)
    }

    /// 并发处理上传文件，每个文件一个作业序列
    async fn process_uploads(&self, uploads: Vec<UploadFile>) -> Result<RunStats> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sequences.max(1)));
        let mut stats = RunStats {
            total: uploads.len(),
            ..Default::default()
        };

        let mut handles = Vec::new();
        for upload in uploads {
            let permit = semaphore.clone().acquire_owned().await?;
            let flow = self.flow.clone();
            let manager = self.manager.clone();
            let config = self.config.clone();
            let name = upload.path.display().to_string();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                match process_upload(&flow, &manager, &upload, &config).await {
                    Ok(success) => Ok(success),
                    Err(e) => {
                        error!("[{}] ❌ 处理过程中发生错误: {:#}", upload.path.display(), e);
                        Err(e)
                    }
                }
            });
            handles.push((name, handle));
        }

        // 等待所有任务完成
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(true)) => stats.success += 1,
                Ok(Ok(false)) | Ok(Err(_)) => stats.failed += 1,
                Err(e) => {
                    error!("[{}] 任务执行失败: {}", name, e);
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    /// 把所有评估的成绩写入导出目录
    async fn write_exports(&self) -> Result<()> {
        let folder = PathBuf::from(&self.config.exports_folder);
        fs::create_dir_all(&folder)
            .await
            .with_context(|| format!("无法创建导出目录: {}", self.config.exports_folder))?;

        let assessments = self.flow.gradebook().assessments().await;
        let mut all_records = Vec::new();
        for assessment in &assessments {
            let records = self.flow.instance_records(assessment.id).await?;
            for (name, content) in csv_export::assessment_exports(&assessment.tid, &records)? {
                write_export(&folder, &name, &content).await?;
            }
            all_records.extend(records);
        }

        write_export(
            &folder,
            "scores.csv",
            &csv_export::gradebook_csv(&assessments, &all_records, false)?,
        )
        .await?;
        write_export(
            &folder,
            "points.csv",
            &csv_export::gradebook_csv(&assessments, &all_records, true)?,
        )
        .await?;

        info!("✓ 成绩已导出至: {}", self.config.exports_folder);
        Ok(())
    }
}

/// 处理单个上传文件：提交作业序列并轮询到结束
async fn process_upload(
    flow: &Arc<GradingFlow>,
    manager: &Arc<JobSequenceManager>,
    upload: &UploadFile,
    config: &Config,
) -> Result<bool> {
    let content = fs::read_to_string(&upload.path)
        .await
        .with_context(|| format!("无法读取上传文件: {}", upload.path.display()))?;
    let assessment = flow.gradebook().assessment_by_tid(&upload.tid).await?;

    let sequence_id = match upload.kind {
        UploadKind::InstanceQuestionScores => {
            bulk_operations::upload_instance_question_scores(flow, manager, assessment.id, &content, "batch")
                .await?
        }
        UploadKind::AssessmentInstanceScores => {
            bulk_operations::upload_assessment_instance_scores(flow, manager, assessment.id, &content, "batch")
                .await?
        }
    };

    manager
        .wait_for_completion(sequence_id, PollOptions::from_config(config))
        .await?;
    let snapshot = manager.remove(sequence_id).await?;

    for job in snapshot.jobs.iter().filter(|j| j.status == JobStatus::Error) {
        logging::append_log_line(
            &config.output_log_file,
            &format!(
                "[{}] 作业 {} 失败: {}",
                upload.path.display(),
                job.description,
                job.error.as_deref().unwrap_or_default()
            ),
        )?;
    }
    info!(
        "[{}] 作业序列 #{} 结束: 成功 {}/{}",
        upload.path.display(),
        sequence_id,
        snapshot.succeeded(),
        snapshot.jobs.len()
    );
    Ok(snapshot.status == JobStatus::Success)
}

async fn write_export(folder: &Path, name: &str, content: &str) -> Result<()> {
    let path = folder.join(name);
    fs::write(&path, content)
        .await
        .with_context(|| format!("无法写入导出文件: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_upload() {
        let upload = classify_upload(Path::new("/tmp/HW 4.instance_question_scores.csv"))
            .unwrap()
            .unwrap();
        assert_eq!(upload.tid, "HW 4");
        assert_eq!(upload.kind, UploadKind::InstanceQuestionScores);

        let upload = classify_upload(Path::new("exam1.assessment_instance_scores.csv"))
            .unwrap()
            .unwrap();
        assert_eq!(upload.kind, UploadKind::AssessmentInstanceScores);

        assert!(classify_upload(Path::new("scores.csv")).unwrap().is_none());
    }

    #[test]
    fn test_upload_regex_compiled_once() {
        let first = upload_name_regex().unwrap();
        let second = upload_name_regex().unwrap();
        assert!(std::ptr::eq(first, second));
    }
}
