//! 服务配置
//!
//! 通过 `locale_shared::config::load` 分层加载，所有配置项均有默认值，
//! 配置文件缺失时服务仍可启动。

use crate::error::{Result, RuleError};
use crate::merge::MergeWeights;
use crate::scoring::{CrossBorderMode, ScoringOptions};
use crate::store::RuleStoreOptions;
use locale_shared::config::{ConfigError, ObservabilityConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const SERVICE_NAME: &str = "locale-rules";

/// 顶层配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_service_name() -> String {
    SERVICE_NAME.to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            observability: ObservabilityConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// 按服务名加载分层配置
    pub fn load() -> std::result::Result<Self, ConfigError> {
        locale_shared::config::load(SERVICE_NAME)
    }
}

/// 持久化后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageKind,
    /// 文件后端根目录
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::Memory,
            dir: PathBuf::from("data/locale-rules"),
        }
    }
}

/// 自动刷新配置：定期从外部规则源导入
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// 刷新间隔（秒），0 表示关闭
    pub interval_secs: u64,
    pub source_path: Option<PathBuf>,
    /// 导入时是否覆盖已有规则
    pub overwrite: bool,
}

/// 自动备份配置：定期导出全部规则
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// 备份间隔（秒），0 表示关闭
    pub interval_secs: u64,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub local: f64,
    pub external: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        let weights = MergeWeights::default();
        Self {
            local: weights.local,
            external: weights.external,
        }
    }
}

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_version_history: usize,
    pub enable_versioning: bool,
    pub enable_ab_testing: bool,
    pub cross_border_mode: CrossBorderMode,
    pub merge: MergeConfig,
    /// 外部建议评分超时（毫秒）
    pub advisory_timeout_ms: u64,
    /// 外部建议评分结果文件，配置后启用文件型提供方
    pub advisory_path: Option<PathBuf>,
    pub storage: StorageConfig,
    /// 存储为空时写入内置规则
    pub seed_default_rules: bool,
    pub refresh: RefreshConfig,
    pub backup: BackupConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_version_history: 50,
            enable_versioning: true,
            enable_ab_testing: true,
            cross_border_mode: CrossBorderMode::default(),
            merge: MergeConfig::default(),
            advisory_timeout_ms: 5000,
            advisory_path: None,
            storage: StorageConfig::default(),
            seed_default_rules: true,
            refresh: RefreshConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 校验配置，返回第一个发现的问题
    pub fn validate(&self) -> Result<()> {
        if self.max_version_history == 0 {
            return Err(RuleError::Validation(
                "max_version_history 必须大于 0".to_string(),
            ));
        }
        self.merge_weights()?;
        Ok(())
    }

    pub fn store_options(&self) -> RuleStoreOptions {
        RuleStoreOptions {
            max_version_history: self.max_version_history,
            enable_versioning: self.enable_versioning,
        }
    }

    pub fn scoring_options(&self) -> ScoringOptions {
        ScoringOptions {
            cross_border_mode: self.cross_border_mode,
        }
    }

    pub fn merge_weights(&self) -> Result<MergeWeights> {
        MergeWeights::new(self.merge.local, self.merge.external)
    }

    pub fn advisory_timeout(&self) -> Duration {
        Duration::from_millis(self.advisory_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh.interval_secs > 0).then(|| Duration::from_secs(self.refresh.interval_secs))
    }

    pub fn backup_interval(&self) -> Option<Duration> {
        (self.backup.interval_secs > 0).then(|| Duration::from_secs(self.backup.interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_version_history, 50);
        assert_eq!(config.advisory_timeout(), Duration::from_millis(5000));
        assert_eq!(config.cross_border_mode, CrossBorderMode::Fold);
        assert!(config.refresh_interval().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("locale-rules.toml"),
            r#"
[engine]
max_version_history = 5
cross_border_mode = "separate"
advisory_timeout_ms = 250

[engine.merge]
local = 0.5
external = 0.5

[engine.storage]
backend = "file"
dir = "/tmp/rules"

[engine.backup]
interval_secs = 60
dir = "/tmp/backups"
"#,
        )
        .unwrap();

        let config: ServiceConfig =
            locale_shared::config::load_from(SERVICE_NAME, dir.path()).unwrap();
        assert_eq!(config.service_name, SERVICE_NAME);
        assert_eq!(config.engine.max_version_history, 5);
        assert_eq!(config.engine.cross_border_mode, CrossBorderMode::Separate);
        assert_eq!(config.engine.storage.backend, StorageKind::File);
        assert_eq!(config.engine.backup_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.engine.merge_weights().unwrap(), MergeWeights::new(0.5, 0.5).unwrap());
        assert!(config.engine.enable_versioning);
    }

    #[test]
    fn test_invalid_config() {
        let config = EngineConfig {
            max_version_history: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            merge: MergeConfig {
                local: -1.0,
                external: 1.0,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
