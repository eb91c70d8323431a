//! 本地化规则服务
//!
//! 用法：
//! - `locale-rules`：加载规则并运行定时维护任务，直到收到退出信号
//! - `locale-rules <snapshot.json> <region> [user_id]`：评估单个内容快照并输出 JSON 结果

use anyhow::{Context, Result};
use locale_rules::catalog::seed_defaults;
use locale_rules::{
    ContentSnapshot, FileAdvisoryProvider, LocalizationRuleService, MaintenanceScheduler,
    ServiceConfig,
};
use locale_shared::observability;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// 单次评估参数
struct EvaluateArgs {
    snapshot_path: String,
    region: String,
    user_id: Option<String>,
}

impl EvaluateArgs {
    fn from_env() -> Option<Self> {
        let mut args = std::env::args().skip(1);
        let snapshot_path = args.next()?;
        let region = args.next().unwrap_or_else(|| "*".to_string());
        Some(Self {
            snapshot_path,
            region,
            user_id: args.next(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 统一加载配置：config/default.toml → {env}.toml → locale-rules.toml → 环境变量
    let config = ServiceConfig::load().unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        ServiceConfig::default()
    });

    let _guard = observability::init(&config.service_name, &config.observability)?;

    info!(environment = %config.environment, "Starting locale-rules service...");

    let mut service = LocalizationRuleService::open(&config.engine)
        .context("打开规则存储失败")?;
    if let Some(path) = &config.engine.advisory_path {
        info!(path = %path.display(), "已启用文件型外部建议评分");
        service = service.with_advisory(Arc::new(FileAdvisoryProvider::new(path.clone())));
    }
    let service = Arc::new(service);

    if config.engine.seed_default_rules {
        match seed_defaults(service.rules()) {
            Ok(0) => {}
            Ok(count) => info!("Seeded {} built-in rules", count),
            Err(e) => warn!("Failed to seed built-in rules: {}", e),
        }
    }

    if let Some(args) = EvaluateArgs::from_env() {
        return evaluate_snapshot(&service, &args).await;
    }

    let scheduler = MaintenanceScheduler::from_config(Arc::clone(&service), &config.engine);
    if !scheduler.has_tasks() {
        info!("No maintenance tasks configured, waiting for shutdown signal");
    }
    let handles = scheduler.start();

    shutdown_signal().await;

    scheduler.stop();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Maintenance task aborted");
        }
    }
    if let Err(e) = scheduler.backup_once().await {
        error!(error = %e, "Final backup failed");
    }

    info!("Service shutdown complete");
    Ok(())
}

/// 评估单个快照并输出结果
async fn evaluate_snapshot(service: &LocalizationRuleService, args: &EvaluateArgs) -> Result<()> {
    let json = tokio::fs::read_to_string(&args.snapshot_path)
        .await
        .with_context(|| format!("读取快照文件失败: {}", args.snapshot_path))?;
    let snapshot = ContentSnapshot::from_json(&json).context("解析快照失败")?;

    let result = service
        .evaluate_with_advisory(&snapshot, &args.region, args.user_id.as_deref())
        .await;
    info!(
        region = %args.region,
        overall = result.overall_score,
        fired = result.rules_fired,
        "Snapshot evaluated"
    );

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
