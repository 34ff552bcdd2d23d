//! # Assessment Grading
//!
//! 评估评分引擎：积分累计、区域汇总、评分细则和批量作业
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有所有评分数据，只暴露读写能力
//! - `Gradebook` - 评估、评估实例、实例题目和评分细则的唯一 owner
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 纯计算，不做任何 IO
//! - `PointsAccumulator` - 按重试策略累计单题得分
//! - `zone_aggregator` - 按区域汇总评估实例总分
//! - `rubric_engine` - 评分细则计算
//! - `score_upload` / `csv_export` - CSV 导入导出
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一道实例题目"的完整操作流程
//! - `GradingCtx` - 上下文封装（评估 + 实例 + 题目 + 操作者）
//! - `GradingFlow` - 流程编排（变体 → 提交 → 评分 → 累计 → 汇总）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/job_sequence` - 作业序列管理器
//! - `orchestrator/bulk_operations` - 重新评分、批量评分、分数上传
//! - `orchestrator/batch_processor` - 批量处理器，管理并发和导出

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::Gradebook;
pub use models::{Assessment, AssessmentInstance, InstanceQuestion};
pub use orchestrator::{App, JobSequenceManager, PollOptions};
pub use workflow::{GradingCtx, GradingFlow, SubmitOutcome};
