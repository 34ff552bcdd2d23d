//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量操作和作业调度。
//!
//! ## 模块划分
//!
//! ### `job_sequence` - 作业序列管理器
//! - 创建作业序列，逐个执行作业并记录结果
//! - 单个作业失败（包括 panic）不影响后续作业
//! - 按退避间隔轮询序列直到结束
//!
//! ### `bulk_operations` - 批量操作
//! - 重新评分整个评估
//! - 批量评分所有评估实例
//! - 上传题目分数 / 实例总分 CSV
//!
//! ### `batch_processor` - 批量评分处理器
//! - 管理应用生命周期（初始化、运行）
//! - 加载评估定义和学生作答
//! - 控制并发数量（Semaphore）
//! - 导出成绩并输出全局统计信息
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理所有评估和上传文件)
//!     ↓
//! bulk_operations → job_sequence (一个批量操作 = 一个作业序列)
//!     ↓
//! workflow::GradingFlow (处理单个实例题目 / 评估实例)
//!     ↓
//! services (能力层：积分 / 区域汇总 / 评分细则 / CSV)
//!     ↓
//! infrastructure (基础设施：Gradebook)
//! ```

pub mod batch_processor;
pub mod bulk_operations;
pub mod job_sequence;

// 重新导出主要类型
pub use batch_processor::{App, RunStats};
pub use job_sequence::{JobSequenceManager, PlannedJob, PollOptions};
