//! 本地化规则服务
//!
//! 组装规则存储、实验存储、选择器、评分引擎和结果合并器，
//! 对外提供评估、规则管理、实验管理和导入导出接口。
//! 所有写入前都先用条件评估器校验 `conditions`。

use crate::advisory::AdvisoryProvider;
use crate::condition::ConditionEvaluator;
use crate::config::{EngineConfig, StorageKind};
use crate::error::{Result, RuleError};
use crate::events::{EventKind, RuleEvent, Subscription, SubscriberBus};
use crate::executor::StructuredConditionEvaluator;
use crate::experiment::{
    validate_variant_overlays, ABTest, ABTestConfig, ExperimentStore, TestStatus, VariantStats,
};
use crate::merge::ResultMerger;
use crate::models::{Rule, RuleDraft, RuleFilter, RulePatch, RuleVersion};
use crate::scoring::{ScoreResult, ScoringEngine};
use crate::selector::RuleSelector;
use crate::snapshot::ContentSnapshot;
use crate::storage::{FileBackend, KeyValueBackend, MemoryBackend};
use crate::store::{RuleStore, RuleStoreStats};
use crate::transfer::{
    export_rules, import_rules, ExportOptions, ImportBundle, ImportOptions, ImportReport,
    RuleExport,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// 本地化规则服务
pub struct LocalizationRuleService {
    rules: Arc<RuleStore>,
    experiments: Arc<ExperimentStore>,
    evaluator: Arc<dyn ConditionEvaluator>,
    engine: ScoringEngine,
    merger: ResultMerger,
    advisory: Option<Arc<dyn AdvisoryProvider>>,
    advisory_timeout: Duration,
}

impl LocalizationRuleService {
    /// 按配置打开服务，使用默认的结构化条件评估器
    pub fn open(config: &EngineConfig) -> Result<Self> {
        Self::open_with_evaluator(config, Arc::new(StructuredConditionEvaluator::new()))
    }

    /// 按配置打开服务并指定条件评估器
    pub fn open_with_evaluator(
        config: &EngineConfig,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn KeyValueBackend> = match config.storage.backend {
            StorageKind::Memory => Arc::new(MemoryBackend::new()),
            StorageKind::File => Arc::new(FileBackend::open(config.storage.dir.clone())?),
        };

        let rules = Arc::new(RuleStore::open(
            Arc::clone(&backend),
            SubscriberBus::new(),
            config.store_options(),
        )?);
        let experiments = Arc::new(ExperimentStore::open(backend)?);

        info!(
            backend = ?config.storage.backend,
            rules = rules.len(),
            ab_tests = experiments.len(),
            "本地化规则服务已打开"
        );
        Self::from_parts(rules, experiments, evaluator, config)
    }

    /// 基于内存存储和默认配置创建服务
    pub fn in_memory() -> Self {
        Self::assemble(
            Arc::new(RuleStore::new()),
            Arc::new(ExperimentStore::new()),
            Arc::new(StructuredConditionEvaluator::new()),
            &EngineConfig::default(),
            ResultMerger::default(),
        )
    }

    /// 用已有的存储组装服务
    pub fn from_parts(
        rules: Arc<RuleStore>,
        experiments: Arc<ExperimentStore>,
        evaluator: Arc<dyn ConditionEvaluator>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let merger = ResultMerger::new(config.merge_weights()?);
        Ok(Self::assemble(rules, experiments, evaluator, config, merger))
    }

    fn assemble(
        rules: Arc<RuleStore>,
        experiments: Arc<ExperimentStore>,
        evaluator: Arc<dyn ConditionEvaluator>,
        config: &EngineConfig,
        merger: ResultMerger,
    ) -> Self {
        let selector = RuleSelector::new(Arc::clone(&rules), Arc::clone(&experiments))
            .with_ab_testing(config.enable_ab_testing);
        let engine = ScoringEngine::new(selector, Arc::clone(&evaluator))
            .with_options(config.scoring_options());

        Self {
            rules,
            experiments,
            evaluator,
            engine,
            merger,
            advisory: None,
            advisory_timeout: config.advisory_timeout(),
        }
    }

    /// 接入外部建议评分
    pub fn with_advisory(mut self, provider: Arc<dyn AdvisoryProvider>) -> Self {
        self.advisory = Some(provider);
        self
    }

    pub fn with_advisory_timeout(mut self, timeout: Duration) -> Self {
        self.advisory_timeout = timeout;
        self
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn experiments(&self) -> &Arc<ExperimentStore> {
        &self.experiments
    }

    pub fn evaluator(&self) -> &Arc<dyn ConditionEvaluator> {
        &self.evaluator
    }

    // ---------------------------------------------------------------------
    // 评估
    // ---------------------------------------------------------------------

    /// 仅使用本地规则评分
    pub fn evaluate(&self, snapshot: &ContentSnapshot, region: &str, user_id: Option<&str>) -> ScoreResult {
        self.engine.evaluate(snapshot, region, user_id)
    }

    /// 本地评分后与给定的外部结果合并
    pub fn evaluate_with_external(
        &self,
        snapshot: &ContentSnapshot,
        region: &str,
        user_id: Option<&str>,
        external: Option<&ScoreResult>,
    ) -> ScoreResult {
        let local = self.evaluate(snapshot, region, user_id);
        self.merger.merge(local, external)
    }

    /// 本地评分并调用外部建议评分，外部调用失败或超时时返回本地结果
    #[instrument(skip(self, snapshot), fields(url = %snapshot.url))]
    pub async fn evaluate_with_advisory(
        &self,
        snapshot: &ContentSnapshot,
        region: &str,
        user_id: Option<&str>,
    ) -> ScoreResult {
        let local = self.evaluate(snapshot, region, user_id);
        let Some(provider) = &self.advisory else {
            return local;
        };

        match self.fetch_advisory(provider.as_ref(), snapshot, region).await {
            Ok(external) => self.merger.merge(local, Some(&external)),
            Err(e) => {
                warn!(region = %region, error = %e, "外部建议评分不可用，仅返回本地评分");
                metrics::counter!("localization_advisory_failures_total", "code" => e.code())
                    .increment(1);
                local
            }
        }
    }

    async fn fetch_advisory(
        &self,
        provider: &dyn AdvisoryProvider,
        snapshot: &ContentSnapshot,
        region: &str,
    ) -> Result<ScoreResult> {
        match tokio::time::timeout(self.advisory_timeout, provider.score(snapshot, region)).await {
            Ok(Ok(result)) => {
                debug!(region = %region, overall = result.overall_score, "外部建议评分已返回");
                Ok(result)
            }
            Ok(Err(e)) => Err(RuleError::ExternalUnavailable {
                service: "advisory".to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(RuleError::ExternalUnavailable {
                service: "advisory".to_string(),
                message: format!("超时 {}ms", self.advisory_timeout.as_millis()),
            }),
        }
    }

    // ---------------------------------------------------------------------
    // 规则管理
    // ---------------------------------------------------------------------

    pub fn create_rule(&self, draft: RuleDraft) -> Result<Rule> {
        if let Some(conditions) = &draft.conditions {
            self.validate_conditions(conditions)?;
        }
        self.rules.create(draft)
    }

    pub fn update_rule(&self, rule_id: &str, patch: RulePatch) -> Result<Rule> {
        if let Some(conditions) = &patch.conditions {
            self.validate_conditions(conditions)?;
        }
        self.rules.update(rule_id, patch)
    }

    pub fn delete_rule(&self, rule_id: &str, soft: bool) -> Result<bool> {
        self.rules.delete(rule_id, soft)
    }

    pub fn get_rule(&self, rule_id: &str) -> Result<Rule> {
        self.rules.get(rule_id)
    }

    pub fn list_rules(&self, filter: &RuleFilter) -> Vec<Rule> {
        self.rules.get_all(filter)
    }

    pub fn get_rule_versions(&self, rule_id: &str) -> Result<Vec<RuleVersion>> {
        self.rules.get_versions(rule_id)
    }

    pub fn restore_rule_version(&self, rule_id: &str, version: &str) -> Result<Rule> {
        self.rules.restore_version(rule_id, version)
    }

    pub fn stats(&self) -> RuleStoreStats {
        self.rules.stats()
    }

    fn validate_conditions(&self, conditions: &Value) -> Result<()> {
        self.evaluator.validate(conditions).map_err(|e| match e {
            RuleError::Validation(_) => e,
            other => RuleError::Validation(format!("规则条件无效: {}", other)),
        })
    }

    // ---------------------------------------------------------------------
    // 实验管理
    // ---------------------------------------------------------------------

    /// 创建实验，引用的规则必须存在且未删除
    ///
    /// 每个变体覆盖后的规则都必须仍是合法规则。
    pub fn create_ab_test(&self, config: ABTestConfig) -> Result<ABTest> {
        let base = match self.rules.get(&config.rule_id) {
            Ok(rule) if !rule.deleted => rule,
            _ => return Err(RuleError::rule_not_found(config.rule_id.as_str())),
        };

        validate_variant_overlays(&config.variants, &base, self.evaluator.as_ref())?;
        self.experiments.create(config)
    }

    pub fn get_ab_test(&self, test_id: &str) -> Result<ABTest> {
        self.experiments.get(test_id)
    }

    pub fn list_ab_tests(&self) -> Vec<ABTest> {
        self.experiments.list()
    }

    pub fn set_ab_test_status(&self, test_id: &str, status: TestStatus) -> Result<ABTest> {
        self.experiments.set_status(test_id, status)
    }

    pub fn delete_ab_test(&self, test_id: &str) -> Result<bool> {
        self.experiments.delete(test_id)
    }

    pub fn record_conversion(&self, test_id: &str, variant: &str) -> Result<()> {
        self.experiments.record_conversion(test_id, variant)
    }

    pub fn ab_test_metrics(&self, test_id: &str) -> Result<BTreeMap<String, VariantStats>> {
        self.experiments.metrics(test_id)
    }

    // ---------------------------------------------------------------------
    // 导入导出与订阅
    // ---------------------------------------------------------------------

    pub fn export_rules(&self, options: ExportOptions) -> RuleExport {
        export_rules(&self.rules, &self.experiments, options)
    }

    pub fn import_rules(&self, bundle: &ImportBundle, options: ImportOptions) -> ImportReport {
        import_rules(
            &self.rules,
            &self.experiments,
            self.evaluator.as_ref(),
            bundle,
            options,
        )
    }

    /// 订阅规则生命周期事件
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&RuleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.rules.bus().subscribe(kind, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::MockAdvisoryProvider;
    use crate::condition::ConditionNode;
    use crate::experiment::Variant;
    use crate::models::{RuleActions, RuleCategory};
    use crate::operators::Operator;
    use crate::scoring::CategoryScore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn privacy_rule() -> RuleDraft {
        RuleDraft::new(RuleCategory::Compliance, "缺少隐私政策")
            .with_id("privacy")
            .with_weight(25.0)
            .with_conditions(
                ConditionNode::field("legal.privacyPolicyUrl", Operator::IsEmpty, json!(null))
                    .to_value(),
            )
            .with_actions(RuleActions::new(25.0, "缺少隐私政策链接"))
            .with_regions(["DE"])
    }

    fn external_result() -> ScoreResult {
        let mut external = ScoreResult::perfect("DE");
        external
            .categories
            .insert(RuleCategory::Compliance, CategoryScore::new(50.0).with_issues(["外部问题"]));
        external.ai_suggestions = vec!["补充 Impressum".to_string()];
        external
    }

    struct SlowProvider;

    #[async_trait]
    impl AdvisoryProvider for SlowProvider {
        async fn score(&self, _snapshot: &ContentSnapshot, region: &str) -> Result<ScoreResult> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ScoreResult::perfect(region))
        }
    }

    #[test]
    fn test_evaluate_local() {
        let service = LocalizationRuleService::in_memory();
        service.create_rule(privacy_rule()).unwrap();

        let result = service.evaluate(&ContentSnapshot::default(), "DE", None);
        assert_eq!(result.score_of(RuleCategory::Compliance), Some(75.0));
        assert_eq!(result.rules_fired, 1);

        let result = service.evaluate(&ContentSnapshot::default(), "FR", None);
        assert_eq!(result.score_of(RuleCategory::Compliance), Some(100.0));
    }

    #[test]
    fn test_invalid_conditions_rejected_before_mutation() {
        let service = LocalizationRuleService::in_memory();
        let draft = privacy_rule().with_conditions(json!({
            "type": "condition",
            "field": "lang",
            "operator": "gt",
            "value": "abc"
        }));

        let err = service.create_rule(draft).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(service.rules().is_empty());

        service.create_rule(privacy_rule()).unwrap();
        let patch = RulePatch {
            conditions: Some(json!({"type": "group", "operator": "AND", "children": []})),
            ..Default::default()
        };
        assert!(service.update_rule("privacy", patch).is_err());
        assert_eq!(service.get_rule("privacy").unwrap().version, "1.0.0");
    }

    #[test]
    fn test_ab_test_requires_existing_rule() {
        let service = LocalizationRuleService::in_memory();
        let config = ABTestConfig::new("missing", "test")
            .with_variant(Variant::control("a"), 100.0);
        let err = service.create_ab_test(config).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        service.create_rule(privacy_rule()).unwrap();
        let config = ABTestConfig::new("privacy", "test")
            .with_variant(Variant::control("a"), 100.0);
        let test = service.create_ab_test(config).unwrap();
        assert_eq!(service.list_ab_tests().len(), 1);

        service.record_conversion(&test.id, "a").unwrap();
        assert_eq!(service.ab_test_metrics(&test.id).unwrap()["a"].conversions, 1);
    }

    #[test]
    fn test_ab_test_rejects_invalid_variant_overlay() {
        let service = LocalizationRuleService::in_memory();
        service.create_rule(privacy_rule()).unwrap();

        let with_override = |overrides: RulePatch| {
            ABTestConfig::new("privacy", "invalid overlay")
                .with_variant(Variant::control("A"), 50.0)
                .with_variant(Variant::new("B", overrides), 50.0)
        };

        let negative_weight = RulePatch {
            weight: Some(-5.0),
            ..Default::default()
        };
        let negative_deduction = RulePatch {
            actions: Some(RuleActions::new(-40.0, "缺少隐私政策链接")),
            ..Default::default()
        };
        let empty_group = RulePatch {
            conditions: Some(json!({"type": "group", "operator": "AND", "children": []})),
            ..Default::default()
        };
        let other_region = RulePatch {
            regions: Some(vec!["FR".to_string()]),
            ..Default::default()
        };
        let other_category = RulePatch {
            category: Some(RuleCategory::Culture),
            ..Default::default()
        };

        for overrides in [
            negative_weight,
            negative_deduction,
            empty_group,
            other_region,
            other_category,
        ] {
            let err = service.create_ab_test(with_override(overrides)).unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
        assert!(service.list_ab_tests().is_empty());

        let stronger = RulePatch {
            weight: Some(40.0),
            ..Default::default()
        };
        assert!(service.create_ab_test(with_override(stronger)).is_ok());
    }

    #[test]
    fn test_subscribe_through_service() {
        let service = LocalizationRuleService::in_memory();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let subscription = service.subscribe(EventKind::RuleCreated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        service.create_rule(privacy_rule()).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        assert!(subscription.unsubscribe());
        service
            .create_rule(privacy_rule().with_id("privacy-2"))
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_advisory_merged() {
        let mut provider = MockAdvisoryProvider::new();
        provider
            .expect_score()
            .withf(|_, region| region == "DE")
            .times(1)
            .returning(|_, _| Ok(external_result()));

        let service = LocalizationRuleService::in_memory().with_advisory(Arc::new(provider));
        service.create_rule(privacy_rule()).unwrap();

        let result = service
            .evaluate_with_advisory(&ContentSnapshot::default(), "DE", None)
            .await;

        // 75*0.4 + 50*0.6 = 60
        assert_eq!(result.score_of(RuleCategory::Compliance), Some(60.0));
        assert!(result.ai_enhanced);
        assert_eq!(result.ai_suggestions, vec!["补充 Impressum".to_string()]);
    }

    #[tokio::test]
    async fn test_advisory_failure_degrades_to_local() {
        let mut provider = MockAdvisoryProvider::new();
        provider.expect_score().returning(|_, _| {
            Err(RuleError::ExternalUnavailable {
                service: "mock".to_string(),
                message: "down".to_string(),
            })
        });

        let service = LocalizationRuleService::in_memory().with_advisory(Arc::new(provider));
        service.create_rule(privacy_rule()).unwrap();

        let result = service
            .evaluate_with_advisory(&ContentSnapshot::default(), "DE", None)
            .await;
        assert!(!result.ai_enhanced);
        assert_eq!(result.score_of(RuleCategory::Compliance), Some(75.0));
    }

    #[tokio::test]
    async fn test_advisory_timeout_degrades_to_local() {
        let service = LocalizationRuleService::in_memory()
            .with_advisory(Arc::new(SlowProvider))
            .with_advisory_timeout(Duration::from_millis(100));

        let result = service
            .evaluate_with_advisory(&ContentSnapshot::default(), "DE", None)
            .await;
        assert!(!result.ai_enhanced);
        assert_eq!(result.overall_score, 100.0);
    }

    #[test]
    fn test_evaluate_with_external() {
        let service = LocalizationRuleService::in_memory();
        let external = external_result();
        let merged = service.evaluate_with_external(&ContentSnapshot::default(), "DE", None, Some(&external));
        assert_eq!(merged.score_of(RuleCategory::Compliance), Some(70.0));

        let local = service.evaluate_with_external(&ContentSnapshot::default(), "DE", None, None);
        assert!(!local.ai_enhanced);
    }

    #[test]
    fn test_open_file_backend_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.storage.backend = StorageKind::File;
        config.storage.dir = dir.path().to_path_buf();

        {
            let service = LocalizationRuleService::open(&config).unwrap();
            service.create_rule(privacy_rule()).unwrap();
            service
                .update_rule("privacy", RulePatch { weight: Some(30.0), ..Default::default() })
                .unwrap();
        }

        let service = LocalizationRuleService::open(&config).unwrap();
        let rule = service.get_rule("privacy").unwrap();
        assert_eq!(rule.weight, 30.0);
        assert_eq!(service.get_rule_versions("privacy").unwrap().len(), 2);
    }
}
