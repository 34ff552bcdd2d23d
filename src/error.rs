use thiserror::Error;

use crate::models::{
    AssessmentId, AssessmentInstanceId, InstanceQuestionId, JobId, JobSequenceId, RubricItemId,
    SubmissionId, VariantId,
};

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 评分相关错误
    #[error("评分错误: {0}")]
    Grading(#[from] GradingError),
    /// 评分细则配置无效
    #[error("评分细则配置无效: {0}")]
    Rubric(#[from] RubricError),
    /// 作业序列错误
    #[error("作业错误: {0}")]
    Job(#[from] JobError),
    /// 数据查找错误
    #[error("数据错误: {0}")]
    Store(#[from] StoreError),
    /// CSV 解析错误
    #[error("CSV错误: {0}")]
    Csv(#[from] CsvError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 评分器（外部协作者）返回的错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraderError {
    /// 临时性故障，可以重试
    #[error("评分器暂时不可用: {0}")]
    Transient(String),
    /// 评分器在生成或判分时崩溃
    #[error("评分器崩溃: {0}")]
    Crashed(String),
}

/// 评分流程错误
#[derive(Debug, Error)]
pub enum GradingError {
    /// 变体已损坏，需要重新生成
    #[error("变体 #{variant_id} 已损坏: {message}")]
    BrokenVariant { variant_id: VariantId, message: String },
    /// 题目已关闭，不再接受评分
    #[error("实例题目 #{instance_question_id} 已关闭")]
    QuestionClosed {
        instance_question_id: InstanceQuestionId,
    },
    /// 提交所针对的变体不是当前变体
    #[error("变体 #{variant_id} 不是当前打开的变体")]
    VariantNotCurrent { variant_id: VariantId },
    /// 该类型的评估不允许申请新变体
    #[error("实例题目 #{instance_question_id} 不允许申请新变体")]
    NewVariantNotAllowed {
        instance_question_id: InstanceQuestionId,
    },
    /// 评分器暂时不可用（重试后仍失败）
    #[error("评分器不可用 (已尝试 {attempts} 次): {message}")]
    GraderUnavailable { attempts: u32, message: String },
    /// 分数字段相互冲突
    #[error("不能同时设置 {first} 和 {second}")]
    ConflictingScores {
        first: &'static str,
        second: &'static str,
    },
    /// 分数不是有效数值
    #[error("{field} 的值不是有效数值: {value}")]
    InvalidScore { field: &'static str, value: f64 },
    /// 评分细则未启用却提交了细则评分
    #[error("实例题目 #{instance_question_id} 未启用评分细则")]
    RubricNotInUse {
        instance_question_id: InstanceQuestionId,
    },
}

/// 评分细则配置错误
///
/// 所有变体都在持久化之前被拒绝，原有配置保持不变
#[derive(Debug, Error, PartialEq)]
pub enum RubricError {
    #[error("启用评分细则时必须提供至少一个细则项")]
    NoItems,
    #[error("细则项 (顺序 {order}) 缺少描述")]
    MissingDescription { order: i64 },
    #[error("细则项 (顺序 {order}) 描述过长 ({len} 个字符)，不能超过 100 个字符")]
    DescriptionTooLong { order: i64, len: usize },
    #[error("细则项 (顺序 {order}) 的分值不是有效数值")]
    InvalidItemPoints { order: i64 },
    #[error("题目没有可用的分值范围: 最低 {min_points}, 最高 {max_points}")]
    NoPointRange { min_points: f64, max_points: f64 },
    #[error("细则项 #{item_id} 不存在")]
    UnknownItem { item_id: RubricItemId },
    #[error("细则项 #{item_id} 的类型与评分部分不符")]
    WrongItemType { item_id: RubricItemId },
    #[error("细则项 #{item_id} 的得分比例 {score} 超出 [0, 1]")]
    InvalidItemScore { item_id: RubricItemId, score: f64 },
    #[error("调整分值不是有效数值: {value}")]
    InvalidAdjustment { value: f64 },
}

/// 作业序列错误
#[derive(Debug, Error)]
pub enum JobError {
    #[error("作业序列 #{id} 不存在")]
    SequenceNotFound { id: JobSequenceId },
    #[error("作业序列 #{id} 已结束，不能继续追加作业")]
    SequenceFinalized { id: JobSequenceId },
    #[error("作业序列 #{id} 仍在运行，不能移除")]
    SequenceRunning { id: JobSequenceId },
    /// 单个作业失败
    #[error("作业 #{job_id} 失败: {message}")]
    JobFailure { job_id: JobId, message: String },
    /// 汇总失败：所有作业结束后至少有一个失败
    #[error("作业序列 #{id} 失败: {} 个作业出错", failures.len())]
    SequenceFailure {
        id: JobSequenceId,
        failures: Vec<JobError>,
    },
    /// 轮询次数用尽，序列仍在运行
    #[error("作业序列 #{id} 在 {polls} 次轮询后仍在运行")]
    PollTimeout { id: JobSequenceId, polls: usize },
}

/// 数据查找错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("评估 #{0} 不存在")]
    AssessmentNotFound(AssessmentId),
    #[error("评估 {0} 不存在")]
    AssessmentTidNotFound(String),
    #[error("评估 {0} 已存在")]
    DuplicateAssessment(String),
    #[error("评估中不存在题目 {0}")]
    QuestionNotFound(String),
    #[error("评估实例 #{0} 不存在")]
    AssessmentInstanceNotFound(AssessmentInstanceId),
    #[error("实例题目 #{0} 不存在")]
    InstanceQuestionNotFound(InstanceQuestionId),
    #[error("变体 #{0} 不存在")]
    VariantNotFound(VariantId),
    #[error("提交 #{0} 不存在")]
    SubmissionNotFound(SubmissionId),
    /// 上传的行无法定位到任何记录
    #[error("无法定位记录: {0}")]
    RowNotMatched(String),
}

/// CSV 解析错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CsvError {
    #[error("第 {line} 行格式错误: {message}")]
    Malformed { line: usize, message: String },
    #[error("写入 CSV 失败: {0}")]
    Write(String),
    #[error("CSV 文件缺少表头")]
    MissingHeader,
    #[error("缺少列: {0}")]
    MissingColumn(String),
    #[error("{column} 的值不是数值: {value}")]
    InvalidNumber { column: String, value: String },
    #[error("无法将 {column} 解析为 JSON 对象: {message}")]
    InvalidJson { column: String, message: String },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: String },
}

// ========== 从常见错误类型转换 ==========

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: String::new(),
            source: err,
        })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Other(format!("JSON解析失败: {}", err))
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建文件读取错误
    pub fn file_read_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建行匹配失败错误
    pub fn row_not_matched(description: impl Into<String>) -> Self {
        AppError::Store(StoreError::RowNotMatched(description.into()))
    }

    /// 是否为临时性故障（可以重试）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Grading(GradingError::GraderUnavailable { .. })
        )
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
