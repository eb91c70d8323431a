//! 外部建议评分接口
//!
//! 外部评分（如 AI 分析服务）通过 [`AdvisoryProvider`] 接入，调用失败或超时
//! 时服务只返回本地评分。

use crate::error::Result;
use crate::scoring::ScoreResult;
use crate::snapshot::ContentSnapshot;
use async_trait::async_trait;
use std::path::PathBuf;

/// 外部建议评分提供方
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdvisoryProvider: Send + Sync {
    async fn score(&self, snapshot: &ContentSnapshot, region: &str) -> Result<ScoreResult>;
}

/// 从 JSON 文件读取预先计算好的外部评分
#[derive(Debug, Clone)]
pub struct FileAdvisoryProvider {
    path: PathBuf,
}

impl FileAdvisoryProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AdvisoryProvider for FileAdvisoryProvider {
    async fn score(&self, _snapshot: &ContentSnapshot, region: &str) -> Result<ScoreResult> {
        let bytes = tokio::fs::read(&self.path).await?;
        let mut result: ScoreResult = serde_json::from_slice(&bytes)?;
        if result.region.is_empty() {
            result.region = region.to_string();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_file_provider() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"categories": {{"language": {{"score": 60, "issues": ["机器翻译"]}}}}, "overallScore": 60, "aiSuggestions": ["聘请母语审校"]}}"#
        )
        .unwrap();

        let provider = FileAdvisoryProvider::new(file.path());
        let result = provider
            .score(&ContentSnapshot::default(), "DE")
            .await
            .unwrap();

        assert_eq!(result.region, "DE");
        assert_eq!(result.ai_suggestions, vec!["聘请母语审校".to_string()]);
    }

    #[tokio::test]
    async fn test_file_provider_missing_file() {
        let provider = FileAdvisoryProvider::new("/nonexistent/advisory.json");
        let err = provider
            .score(&ContentSnapshot::default(), "DE")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
