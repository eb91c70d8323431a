//! 定时维护任务
//!
//! - 自动刷新：定期从外部规则源拉取规则包并导入
//! - 自动备份：定期导出全部规则、版本和实验，并把实验计数写回存储
//!
//! 任务在 tokio 定时器上运行，失败只记录日志，下一周期重试。
//! 通过 `watch` channel 通知退出。

use crate::error::Result;
use crate::service::LocalizationRuleService;
use crate::transfer::{ExportOptions, ImportBundle, ImportOptions, ImportReport};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// 外部规则源
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// 拉取完整规则包
    async fn fetch(&self) -> Result<ImportBundle>;
}

/// 从本地 JSON 文件读取规则包（如挂载的 ConfigMap）
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn fetch(&self) -> Result<ImportBundle> {
        let json = tokio::fs::read_to_string(&self.path).await?;
        ImportBundle::from_json(&json)
    }
}

struct RefreshTask {
    source: Arc<dyn RuleSource>,
    interval: Duration,
    options: ImportOptions,
}

struct BackupTask {
    dir: PathBuf,
    interval: Duration,
}

/// 维护任务调度器
pub struct MaintenanceScheduler {
    service: Arc<LocalizationRuleService>,
    refresh: Option<RefreshTask>,
    backup: Option<BackupTask>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MaintenanceScheduler {
    pub fn new(service: Arc<LocalizationRuleService>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            service,
            refresh: None,
            backup: None,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// 从引擎配置构建，未配置的任务不启用
    pub fn from_config(
        service: Arc<LocalizationRuleService>,
        config: &crate::config::EngineConfig,
    ) -> Self {
        let mut scheduler = Self::new(service);
        if let (Some(interval), Some(path)) =
            (config.refresh_interval(), config.refresh.source_path.clone())
        {
            scheduler = scheduler.with_refresh(
                Arc::new(FileRuleSource::new(path)),
                interval,
                ImportOptions {
                    overwrite: config.refresh.overwrite,
                },
            );
        }
        if let (Some(interval), Some(dir)) = (config.backup_interval(), config.backup.dir.clone()) {
            scheduler = scheduler.with_backup(dir, interval);
        }
        scheduler
    }

    pub fn with_refresh(
        mut self,
        source: Arc<dyn RuleSource>,
        interval: Duration,
        options: ImportOptions,
    ) -> Self {
        self.refresh = Some(RefreshTask {
            source,
            interval,
            options,
        });
        self
    }

    pub fn with_backup(mut self, dir: impl Into<PathBuf>, interval: Duration) -> Self {
        self.backup = Some(BackupTask {
            dir: dir.into(),
            interval,
        });
        self
    }

    /// 是否配置了任一任务
    pub fn has_tasks(&self) -> bool {
        self.refresh.is_some() || self.backup.is_some()
    }

    /// 执行一次刷新
    pub async fn refresh_once(&self) -> anyhow::Result<Option<ImportReport>> {
        match &self.refresh {
            Some(task) => {
                refresh(&self.service, task.source.as_ref(), task.options)
                    .await
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    /// 执行一次备份，返回备份文件路径
    pub async fn backup_once(&self) -> anyhow::Result<Option<PathBuf>> {
        match &self.backup {
            Some(task) => backup(&self.service, &task.dir).await.map(Some),
            None => Ok(None),
        }
    }

    /// 启动后台任务
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(task) = &self.refresh {
            let service = Arc::clone(&self.service);
            let source = Arc::clone(&task.source);
            let options = task.options;
            let period = task.interval;
            let mut shutdown_rx = self.shutdown_rx.clone();

            handles.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!(interval_secs = period.as_secs_f64(), "规则自动刷新已启动");
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = refresh(&service, source.as_ref(), options).await {
                                error!(error = %e, "规则自动刷新失败，等待下次重试");
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                info!("规则自动刷新已停止");
                                break;
                            }
                        }
                    }
                }
            }));
        }

        if let Some(task) = &self.backup {
            let service = Arc::clone(&self.service);
            let dir = task.dir.clone();
            let period = task.interval;
            let mut shutdown_rx = self.shutdown_rx.clone();

            handles.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!(interval_secs = period.as_secs_f64(), dir = %dir.display(), "规则自动备份已启动");
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = backup(&service, &dir).await {
                                error!(error = %e, "规则自动备份失败，等待下次重试");
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                info!("规则自动备份已停止");
                                break;
                            }
                        }
                    }
                }
            }));
        }

        handles
    }

    /// 通知所有后台任务退出
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn refresh(
    service: &LocalizationRuleService,
    source: &dyn RuleSource,
    options: ImportOptions,
) -> anyhow::Result<ImportReport> {
    let bundle = source.fetch().await.context("拉取规则包失败")?;
    let report = service.import_rules(&bundle, options);
    info!(
        imported = report.imported,
        updated = report.updated,
        errors = report.errors.len(),
        "规则自动刷新完成"
    );
    Ok(report)
}

async fn backup(service: &LocalizationRuleService, dir: &Path) -> anyhow::Result<PathBuf> {
    let written = service
        .experiments()
        .persist_metrics()
        .context("写回实验计数失败")?;
    debug!(ab_tests = written, "实验计数已写回");

    let export = service.export_rules(ExportOptions::full());
    let json = export.to_json_pretty().context("序列化备份失败")?;

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("创建备份目录失败: {}", dir.display()))?;
    let path = dir.join(format!(
        "rules-backup-{}.json",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    ));
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("写入备份失败: {}", path.display()))?;

    info!(path = %path.display(), rules = export.count, "规则备份完成");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleError;
    use crate::transfer::RuleExport;
    use serde_json::json;

    fn bundle() -> ImportBundle {
        ImportBundle::from_rules(vec![json!({
            "id": "remote-imprint",
            "category": "compliance",
            "name": "缺少 Impressum",
            "conditions": {"type": "condition", "field": "legal.imprintUrl", "operator": "is_empty"},
            "actions": {"scoring": {"deduction": 20}, "message": "缺少 Impressum"},
            "regions": ["DE"]
        })])
    }

    #[tokio::test]
    async fn test_refresh_once_imports_from_source() {
        let service = Arc::new(LocalizationRuleService::in_memory());
        let mut source = MockRuleSource::new();
        source.expect_fetch().times(1).returning(|| Ok(bundle()));

        let scheduler = MaintenanceScheduler::new(Arc::clone(&service)).with_refresh(
            Arc::new(source),
            Duration::from_secs(60),
            ImportOptions::default(),
        );
        let report = scheduler.refresh_once().await.unwrap().unwrap();

        assert_eq!(report.imported, 1);
        assert!(service.get_rule("remote-imprint").is_ok());
    }

    #[tokio::test]
    async fn test_refresh_source_failure() {
        let service = Arc::new(LocalizationRuleService::in_memory());
        let mut source = MockRuleSource::new();
        source
            .expect_fetch()
            .returning(|| Err(RuleError::Storage("unreachable".to_string())));

        let scheduler = MaintenanceScheduler::new(service).with_refresh(
            Arc::new(source),
            Duration::from_secs(60),
            ImportOptions::default(),
        );
        assert!(scheduler.refresh_once().await.is_err());
    }

    #[tokio::test]
    async fn test_file_rule_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, serde_json::to_string(&bundle()).unwrap()).unwrap();

        let fetched = FileRuleSource::new(&path).fetch().await.unwrap();
        assert_eq!(fetched.rules.len(), 1);
    }

    #[tokio::test]
    async fn test_backup_once_writes_export() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(LocalizationRuleService::in_memory());
        service.import_rules(&bundle(), ImportOptions::default());

        let scheduler = MaintenanceScheduler::new(service).with_backup(dir.path(), Duration::from_secs(60));
        let path = scheduler.backup_once().await.unwrap().unwrap();

        let export: RuleExport =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(export.count, 1);
        assert!(export.versions.is_some());
    }

    #[tokio::test]
    async fn test_background_refresh_and_stop() {
        let service = Arc::new(LocalizationRuleService::in_memory());
        let mut source = MockRuleSource::new();
        source.expect_fetch().returning(|| Ok(bundle()));

        let scheduler = MaintenanceScheduler::new(Arc::clone(&service)).with_refresh(
            Arc::new(source),
            Duration::from_millis(20),
            ImportOptions::default(),
        );
        let handles = scheduler.start();
        assert_eq!(handles.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(service.get_rule("remote-imprint").is_ok());
    }

    #[test]
    fn test_from_config_without_tasks() {
        let service = Arc::new(LocalizationRuleService::in_memory());
        let scheduler =
            MaintenanceScheduler::from_config(service, &crate::config::EngineConfig::default());
        assert!(!scheduler.has_tasks());
    }
}
