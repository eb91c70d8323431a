//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: &'static str, id: String },

    #[error("规则版本未找到: rule_id={rule_id} version={version}")]
    VersionNotFound { rule_id: String, version: String },

    #[error("配置冲突: {0}")]
    ConfigurationConflict(String),

    #[error("外部服务不可用: {service} - {message}")]
    ExternalUnavailable { service: String, message: String },

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("条件评估失败: {0}")]
    Condition(String),

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    pub(crate) fn rule_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Rule",
            id: id.into(),
        }
    }

    pub(crate) fn ab_test_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "ABTest",
            id: id.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::VersionNotFound { .. } => "VERSION_NOT_FOUND",
            Self::ConfigurationConflict(_) => "CONFIGURATION_CONFLICT",
            Self::ExternalUnavailable { .. } => "EXTERNAL_UNAVAILABLE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Condition(_) => "CONDITION_ERROR",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::Json(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = RuleError::rule_not_found("rule-001");
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(err.to_string().contains("rule-001"));
    }
}
