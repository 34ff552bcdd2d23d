use crate::models::Assessment;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 名单中的一个学生
#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    pub uid: String,
    #[serde(default)]
    pub username: String,
    /// 按题目 qid 记录的作答，按顺序逐个提交评分
    #[serde(default)]
    pub answers: BTreeMap<String, Vec<JsonValue>>,
}

/// 评估定义文件：评估本身加上参与的学生名单
#[derive(Debug, Clone, Deserialize)]
pub struct AssessmentFile {
    #[serde(flatten)]
    pub assessment: Assessment,
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
    #[serde(skip)]
    pub file_path: Option<String>,
}

/// 从 TOML 文件加载评估定义
pub async fn load_assessment_file(toml_file_path: &Path) -> Result<AssessmentFile> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut file: AssessmentFile = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    // 设置文件路径
    file.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(file)
}

/// 从文件夹中加载所有评估定义，按文件名排序
pub async fn load_all_assessment_files(folder_path: &str) -> Result<Vec<AssessmentFile>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut toml_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml_files.push(path);
        }
    }
    toml_files.sort();

    let mut files = Vec::new();
    for path in toml_files {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_assessment_file(&path).await {
            Ok(file) => {
                tracing::info!(
                    "成功加载评估 {}: {} 道题目, {} 名学生",
                    file.assessment.tid,
                    file.assessment.questions().count(),
                    file.roster.len()
                );
                files.push(file);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(files)
}
