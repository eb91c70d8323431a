//! A/B 实验
//!
//! 实验按 ruleId 引用规则，为每个用户确定性地分配变体，并在应用变体时
//! 用变体的覆盖内容生成实验版规则。分桶是纯函数：`SHA-256(userId:testId)`
//! 的前 8 字节按大端解释后对 100 取模。

use crate::condition::ConditionEvaluator;
use crate::error::{Result, RuleError};
use crate::models::{region_matches, Rule, RulePatch, REGION_WILDCARD};
use crate::storage::{KeyValueBackend, MemoryBackend, Namespace};
use crate::store::validate_rule;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// 流量分配总和的容差
const SPLIT_TOLERANCE: f64 = 0.001;

const BUCKETS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Active,
    Inactive,
}

/// 实验变体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    /// 覆盖到基础规则上的部分字段，空补丁即对照组
    #[serde(default)]
    pub overrides: RulePatch,
}

impl Variant {
    pub fn new(name: impl Into<String>, overrides: RulePatch) -> Self {
        Self {
            name: name.into(),
            overrides,
        }
    }

    pub fn control(name: impl Into<String>) -> Self {
        Self::new(name, RulePatch::default())
    }

    /// 把变体覆盖应用到基础规则上
    ///
    /// 变体覆盖了权重而未覆盖动态权重时，以变体权重为准。
    pub fn overlay(&self, base: &Rule) -> Rule {
        let mut rule = base.clone();
        self.overrides.apply_to(&mut rule);
        if self.overrides.weight.is_some() && self.overrides.dynamic_weight.is_none() {
            rule.dynamic_weight.clear();
        }
        rule
    }
}

/// 变体统计
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStats {
    pub impressions: u64,
    pub conversions: u64,
}

impl VariantStats {
    pub fn conversion_rate(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.conversions as f64 / self.impressions as f64
        }
    }
}

/// A/B 实验定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ABTest {
    pub id: String,
    pub rule_id: String,
    pub name: String,
    /// 有序变体列表，分桶时按此顺序累计流量
    pub variants: Vec<Variant>,
    /// 变体名 -> 流量百分比
    pub traffic_split: BTreeMap<String, f64>,
    pub regions: Vec<String>,
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default)]
    pub metrics: BTreeMap<String, VariantStats>,
}

impl ABTest {
    /// 实验在给定时间和区域下是否生效
    pub fn is_applicable(&self, region: Option<&str>, now: DateTime<Utc>) -> bool {
        if self.status != TestStatus::Active {
            return false;
        }
        if now < self.start_date {
            return false;
        }
        if let Some(end) = self.end_date {
            if now >= end {
                return false;
            }
        }
        match region {
            Some(region) => region_matches(&self.regions, region),
            None => true,
        }
    }

    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.rule_id.trim().is_empty() {
            return Err(RuleError::Validation("实验必须指定 ruleId".to_string()));
        }
        if self.variants.is_empty() {
            return Err(RuleError::Validation(format!("实验 {} 至少需要一个变体", self.id)));
        }

        let mut names = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return Err(RuleError::Validation(format!("实验 {} 存在空的变体名", self.id)));
            }
            if !names.insert(variant.name.as_str()) {
                return Err(RuleError::Validation(format!(
                    "实验 {} 的变体名重复: {}",
                    self.id, variant.name
                )));
            }
            // 规则的选择范围在覆盖前已确定，变体不能改变类别和区域
            if variant.overrides.category.is_some() || variant.overrides.regions.is_some() {
                return Err(RuleError::Validation(format!(
                    "变体 {} 不能覆盖规则的类别或区域",
                    variant.name
                )));
            }
            if !self.traffic_split.contains_key(&variant.name) {
                return Err(RuleError::Validation(format!(
                    "变体 {} 缺少流量分配",
                    variant.name
                )));
            }
        }

        if let Some(extra) = self.traffic_split.keys().find(|k| !names.contains(k.as_str())) {
            return Err(RuleError::Validation(format!(
                "流量分配中的变体 {} 不存在",
                extra
            )));
        }
        if let Some((name, pct)) = self
            .traffic_split
            .iter()
            .find(|(_, p)| !(p.is_finite() && **p >= 0.0))
        {
            return Err(RuleError::Validation(format!(
                "变体 {} 的流量比例无效: {}",
                name, pct
            )));
        }

        let total: f64 = self.traffic_split.values().sum();
        if (total - 100.0).abs() > SPLIT_TOLERANCE {
            return Err(RuleError::Validation(format!(
                "流量分配总和必须为 100，当前为 {}",
                total
            )));
        }

        if self.regions.is_empty() {
            return Err(RuleError::Validation(format!("实验 {} 的区域不能为空", self.id)));
        }
        if let Some(end) = self.end_date {
            if end <= self.start_date {
                return Err(RuleError::Validation(format!(
                    "实验 {} 的结束时间必须晚于开始时间",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// 创建实验的输入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ABTestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub rule_id: String,
    pub name: String,
    pub variants: Vec<Variant>,
    pub traffic_split: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TestStatus>,
}

impl ABTestConfig {
    pub fn new(rule_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// 追加变体及其流量比例
    pub fn with_variant(mut self, variant: Variant, percentage: f64) -> Self {
        self.traffic_split.insert(variant.name.clone(), percentage);
        self.variants.push(variant);
        self
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = Some(regions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_window(mut self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        self.start_date = Some(start);
        self.end_date = end;
        self
    }

    fn into_test(self, now: DateTime<Utc>) -> ABTest {
        ABTest {
            id: self
                .id
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!("abtest-{}", Uuid::new_v4())),
            rule_id: self.rule_id,
            name: self.name,
            variants: self.variants,
            traffic_split: self.traffic_split,
            regions: self
                .regions
                .unwrap_or_else(|| vec![REGION_WILDCARD.to_string()]),
            start_date: self.start_date.unwrap_or(now),
            end_date: self.end_date,
            status: self.status.unwrap_or_default(),
            metrics: BTreeMap::new(),
        }
    }
}

/// 校验每个变体覆盖到基础规则后仍是合法规则
pub(crate) fn validate_variant_overlays(
    variants: &[Variant],
    base: &Rule,
    evaluator: &dyn ConditionEvaluator,
) -> Result<()> {
    for variant in variants {
        let invalid = |e: RuleError| {
            RuleError::Validation(format!("变体 {} 覆盖后的规则无效: {}", variant.name, e))
        };
        if let Some(conditions) = &variant.overrides.conditions {
            evaluator.validate(conditions).map_err(invalid)?;
        }
        validate_rule(&variant.overlay(base)).map_err(invalid)?;
    }
    Ok(())
}

/// 为用户分配变体
///
/// 分桶只依赖 userId 和 testId，跨进程稳定。
pub fn assign_user_to_variant<'a>(user_id: &str, test: &'a ABTest) -> Option<&'a Variant> {
    let bucket = bucket_for(user_id, &test.id) as f64;

    let mut cumulative = 0.0;
    for variant in &test.variants {
        cumulative += test.traffic_split.get(&variant.name).copied().unwrap_or(0.0);
        if bucket < cumulative {
            return Some(variant);
        }
    }
    // 浮点累计误差落在末尾时归入最后一个有流量的变体
    test.variants
        .iter()
        .rev()
        .find(|v| test.traffic_split.get(&v.name).copied().unwrap_or(0.0) > 0.0)
}

fn bucket_for(user_id: &str, test_id: &str) -> u64 {
    let digest = Sha256::digest(format!("{}:{}", user_id, test_id).as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % BUCKETS
}

#[derive(Debug, Default)]
struct VariantCounters {
    impressions: AtomicU64,
    conversions: AtomicU64,
}

/// 单个实验的计数器，变体集合在实验创建后固定
#[derive(Debug, Default)]
struct TestCounters {
    variants: BTreeMap<String, VariantCounters>,
}

impl TestCounters {
    fn for_test(test: &ABTest) -> Self {
        let variants = test
            .variants
            .iter()
            .map(|v| {
                let seed = test.metrics.get(&v.name).copied().unwrap_or_default();
                (
                    v.name.clone(),
                    VariantCounters {
                        impressions: AtomicU64::new(seed.impressions),
                        conversions: AtomicU64::new(seed.conversions),
                    },
                )
            })
            .collect();
        Self { variants }
    }

    fn snapshot(&self) -> BTreeMap<String, VariantStats> {
        self.variants
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    VariantStats {
                        impressions: c.impressions.load(Ordering::Relaxed),
                        conversions: c.conversions.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

/// 实验存储
pub struct ExperimentStore {
    tests: DashMap<String, ABTest>,
    counters: DashMap<String, Arc<TestCounters>>,
    write_lock: Mutex<()>,
    backend: Arc<dyn KeyValueBackend>,
}

impl ExperimentStore {
    pub fn new() -> Self {
        Self {
            tests: DashMap::new(),
            counters: DashMap::new(),
            write_lock: Mutex::new(()),
            backend: Arc::new(MemoryBackend::new()),
        }
    }

    /// 打开实验存储并加载已持久化的实验
    #[instrument(skip(backend))]
    pub fn open(backend: Arc<dyn KeyValueBackend>) -> Result<Self> {
        let store = Self {
            tests: DashMap::new(),
            counters: DashMap::new(),
            write_lock: Mutex::new(()),
            backend,
        };

        for key in store.backend.keys(Namespace::Experiments)? {
            let Some(value) = store.backend.get(Namespace::Experiments, &key)? else {
                continue;
            };
            match serde_json::from_value::<ABTest>(value) {
                Ok(test) => {
                    store
                        .counters
                        .insert(test.id.clone(), Arc::new(TestCounters::for_test(&test)));
                    store.tests.insert(test.id.clone(), test);
                }
                Err(e) => warn!(key = %key, error = %e, "跳过无法解析的实验定义"),
            }
        }

        info!(tests = store.tests.len(), "实验存储已加载");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// 创建实验
    #[instrument(skip(self, config), fields(rule_id = %config.rule_id))]
    pub fn create(&self, config: ABTestConfig) -> Result<ABTest> {
        self.insert(config.into_test(Utc::now()))
    }

    /// 导入实验定义（保留 id 和已有计数）
    pub fn import(&self, test: ABTest) -> Result<ABTest> {
        self.insert(test)
    }

    fn insert(&self, test: ABTest) -> Result<ABTest> {
        test.validate()?;

        let _guard = self.write_lock.lock();
        if self.tests.contains_key(&test.id) {
            return Err(RuleError::Validation(format!("实验 ID 已存在: {}", test.id)));
        }
        if test.status == TestStatus::Active {
            self.ensure_no_active_conflict(&test.rule_id, &test.id)?;
        }

        let counters = Arc::new(TestCounters::for_test(&test));
        let mut stored = test;
        stored.metrics = counters.snapshot();

        self.persist(&stored)?;
        self.counters.insert(stored.id.clone(), counters);
        self.tests.insert(stored.id.clone(), stored.clone());

        info!(test_id = %stored.id, rule_id = %stored.rule_id, variants = stored.variants.len(), "实验已创建");
        Ok(stored)
    }

    fn ensure_no_active_conflict(&self, rule_id: &str, test_id: &str) -> Result<()> {
        let conflict = self
            .tests
            .iter()
            .find(|t| t.rule_id == rule_id && t.status == TestStatus::Active && t.id != test_id)
            .map(|t| t.id.clone());

        match conflict {
            Some(existing) => Err(RuleError::ConfigurationConflict(format!(
                "规则 {} 已有进行中的实验 {}",
                rule_id, existing
            ))),
            None => Ok(()),
        }
    }

    /// 获取实验（含最新计数）
    pub fn get(&self, test_id: &str) -> Result<ABTest> {
        let mut test = self
            .tests
            .get(test_id)
            .map(|t| t.clone())
            .ok_or_else(|| RuleError::ab_test_not_found(test_id))?;
        if let Some(counters) = self.counters.get(test_id) {
            test.metrics = counters.snapshot();
        }
        Ok(test)
    }

    /// 列出全部实验，按 id 排序
    pub fn list(&self) -> Vec<ABTest> {
        let mut ids: Vec<String> = self.tests.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.get(id).ok()).collect()
    }

    /// 当前时间和区域下生效的实验
    pub fn applicable_tests(&self, region: Option<&str>) -> Vec<ABTest> {
        let now = Utc::now();
        self.list()
            .into_iter()
            .filter(|t| t.is_applicable(region, now))
            .collect()
    }

    /// 判断实验是否对当前请求生效
    pub fn is_test_applicable(&self, test: &ABTest, region: Option<&str>) -> bool {
        test.is_applicable(region, Utc::now())
    }

    /// 修改实验状态
    #[instrument(skip(self))]
    pub fn set_status(&self, test_id: &str, status: TestStatus) -> Result<ABTest> {
        let _guard = self.write_lock.lock();
        let mut test = self
            .tests
            .get(test_id)
            .map(|t| t.clone())
            .ok_or_else(|| RuleError::ab_test_not_found(test_id))?;

        if status == TestStatus::Active {
            self.ensure_no_active_conflict(&test.rule_id, test_id)?;
        }
        test.status = status;
        if let Some(counters) = self.counters.get(test_id) {
            test.metrics = counters.snapshot();
        }

        self.persist(&test)?;
        self.tests.insert(test.id.clone(), test.clone());
        info!(test_id = %test_id, status = ?status, "实验状态已更新");
        Ok(test)
    }

    /// 删除实验，不存在时返回 false
    #[instrument(skip(self))]
    pub fn delete(&self, test_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if !self.tests.contains_key(test_id) {
            return Ok(false);
        }
        self.backend.delete(Namespace::Experiments, test_id)?;
        self.tests.remove(test_id);
        self.counters.remove(test_id);
        info!(test_id = %test_id, "实验已删除");
        Ok(true)
    }

    /// 为用户应用实验变体，返回覆盖后的规则并记录一次曝光
    pub fn apply(&self, test: &ABTest, base: &Rule, user_id: &str) -> Option<Rule> {
        let variant = assign_user_to_variant(user_id, test)?;

        let mut rule = variant.overlay(base);
        rule.ab_test_id = Some(test.id.clone());
        rule.ab_test_variant = Some(variant.name.clone());

        if let Some(counters) = self.counters.get(&test.id) {
            if let Some(c) = counters.variants.get(&variant.name) {
                c.impressions.fetch_add(1, Ordering::Relaxed);
            }
        }
        metrics::counter!(
            "localization_ab_impressions_total",
            "test" => test.id.clone(),
            "variant" => variant.name.clone()
        )
        .increment(1);

        debug!(test_id = %test.id, variant = %variant.name, user_id = %user_id, "已应用实验变体");
        Some(rule)
    }

    /// 记录一次转化
    pub fn record_conversion(&self, test_id: &str, variant: &str) -> Result<()> {
        let counters = self
            .counters
            .get(test_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| RuleError::ab_test_not_found(test_id))?;
        let c = counters.variants.get(variant).ok_or_else(|| {
            RuleError::Validation(format!("实验 {} 不存在变体 {}", test_id, variant))
        })?;
        c.conversions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 各变体的曝光和转化计数
    pub fn metrics(&self, test_id: &str) -> Result<BTreeMap<String, VariantStats>> {
        self.counters
            .get(test_id)
            .map(|c| c.snapshot())
            .ok_or_else(|| RuleError::ab_test_not_found(test_id))
    }

    /// 将内存中的计数写回持久化后端
    pub fn persist_metrics(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut written = 0;
        for id in self.tests.iter().map(|t| t.key().clone()).collect::<Vec<_>>() {
            let Some(mut test) = self.tests.get(&id).map(|t| t.clone()) else {
                continue;
            };
            if let Some(counters) = self.counters.get(&id) {
                test.metrics = counters.snapshot();
            }
            self.persist(&test)?;
            written += 1;
        }
        Ok(written)
    }

    fn persist(&self, test: &ABTest) -> Result<()> {
        self.backend
            .set(Namespace::Experiments, &test.id, &serde_json::to_value(test)?)
    }
}

impl Default for ExperimentStore {
    fn default() -> Self {
        Self::new()
    }
}
