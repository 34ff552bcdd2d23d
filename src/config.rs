use std::time::Duration;

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 同时运行的作业序列数量
    pub max_concurrent_sequences: usize,
    /// 轮询作业序列的初始间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 轮询间隔上限（毫秒）
    pub poll_max_interval_ms: u64,
    /// 最多轮询次数，超过后放弃等待
    pub poll_max_attempts: usize,
    /// 重新评分时评分器临时故障的重试次数
    pub regrade_max_retries: u32,
    /// 评估定义 TOML 文件目录
    pub assessments_folder: String,
    /// 待导入的分数 CSV 目录
    pub uploads_folder: String,
    /// 导出 CSV 的目录
    pub exports_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_sequences: 4,
            poll_interval_ms: 50,
            poll_max_interval_ms: 1_000,
            poll_max_attempts: 600,
            regrade_max_retries: 3,
            assessments_folder: "assessments".to_string(),
            uploads_folder: "uploads".to_string(),
            exports_folder: "exports".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
        }
    }
}

impl Config {
    /// 从环境变量读取配置，未设置或无法解析的项使用默认值
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_sequences: std::env::var("MAX_CONCURRENT_SEQUENCES").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_concurrent_sequences),
            poll_interval_ms: std::env::var("POLL_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.poll_interval_ms),
            poll_max_interval_ms: std::env::var("POLL_MAX_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.poll_max_interval_ms),
            poll_max_attempts: std::env::var("POLL_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.poll_max_attempts),
            regrade_max_retries: std::env::var("REGRADE_MAX_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(default.regrade_max_retries),
            assessments_folder: std::env::var("ASSESSMENTS_FOLDER").unwrap_or(default.assessments_folder),
            uploads_folder: std::env::var("UPLOADS_FOLDER").unwrap_or(default.uploads_folder),
            exports_folder: std::env::var("EXPORTS_FOLDER").unwrap_or(default.exports_folder),
            verbose_logging: std::env::var("VERBOSE_LOGGING").ok().and_then(|v| v.parse().ok()).unwrap_or(default.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_max_interval(&self) -> Duration {
        Duration::from_millis(self.poll_max_interval_ms.max(self.poll_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_sequences, 4);
        assert_eq!(config.regrade_max_retries, 3);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert!(config.poll_max_interval() >= config.poll_interval());
    }
}
