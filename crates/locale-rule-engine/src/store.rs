//! 规则存储管理
//!
//! 使用 DashMap 提供无锁读取的规则缓存，所有写操作经同一把写锁串行化，
//! 并同步写入持久化后端。每次变更都会生成新的版本号，按配置保留有限的版本历史。

use crate::error::{Result, RuleError};
use crate::events::{RuleEvent, SubscriberBus};
use crate::models::{
    Rule, RuleCategory, RuleDraft, RuleFilter, RulePatch, RuleVersion, SortBy, VersionChange,
    DEFAULT_RULE_WEIGHT, REGION_WILDCARD,
};
use crate::storage::{KeyValueBackend, MemoryBackend, Namespace};
use crate::version::{next_version, SemVer, INITIAL_VERSION};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 规则存储配置
#[derive(Debug, Clone, Copy)]
pub struct RuleStoreOptions {
    /// 每条规则保留的最大版本数
    pub max_version_history: usize,
    pub enable_versioning: bool,
}

impl Default for RuleStoreOptions {
    fn default() -> Self {
        Self {
            max_version_history: 50,
            enable_versioning: true,
        }
    }
}

/// 规则存储
pub struct RuleStore {
    rules: DashMap<String, Rule>,
    versions: DashMap<String, VecDeque<RuleVersion>>,
    /// 写锁，保证所有变更串行执行
    write_lock: Mutex<()>,
    backend: Arc<dyn KeyValueBackend>,
    bus: SubscriberBus,
    options: RuleStoreOptions,
}

impl RuleStore {
    /// 创建基于内存后端的规则存储
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            versions: DashMap::new(),
            write_lock: Mutex::new(()),
            backend: Arc::new(MemoryBackend::new()),
            bus: SubscriberBus::new(),
            options: RuleStoreOptions::default(),
        }
    }

    /// 打开规则存储，从持久化后端加载已有规则和版本历史
    #[instrument(skip(backend, bus))]
    pub fn open(
        backend: Arc<dyn KeyValueBackend>,
        bus: SubscriberBus,
        options: RuleStoreOptions,
    ) -> Result<Self> {
        let store = Self {
            rules: DashMap::new(),
            versions: DashMap::new(),
            write_lock: Mutex::new(()),
            backend,
            bus,
            options,
        };

        for key in store.backend.keys(Namespace::Rules)? {
            let Some(value) = store.backend.get(Namespace::Rules, &key)? else {
                continue;
            };
            match serde_json::from_value::<Rule>(value) {
                Ok(rule) => {
                    store.rules.insert(rule.id.clone(), rule);
                }
                Err(e) => warn!(key = %key, error = %e, "跳过无法解析的持久化规则"),
            }
        }

        for key in store.backend.keys(Namespace::Versions)? {
            let Some(value) = store.backend.get(Namespace::Versions, &key)? else {
                continue;
            };
            match serde_json::from_value::<VecDeque<RuleVersion>>(value) {
                Ok(mut history) => {
                    while history.len() > store.options.max_version_history {
                        history.pop_front();
                    }
                    store.versions.insert(key, history);
                }
                Err(e) => warn!(key = %key, error = %e, "跳过无法解析的版本历史"),
            }
        }

        info!(
            rules = store.rules.len(),
            histories = store.versions.len(),
            "规则存储已加载"
        );
        Ok(store)
    }

    pub fn bus(&self) -> &SubscriberBus {
        &self.bus
    }

    pub fn options(&self) -> RuleStoreOptions {
        self.options
    }

    /// 获取当前存储的规则数量（含软删除）
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// 检查存储是否为空
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 检查规则是否存在
    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.contains_key(rule_id)
    }

    /// 创建规则
    #[instrument(skip(self, draft), fields(rule_id = ?draft.id, rule_name = ?draft.name))]
    pub fn create(&self, draft: RuleDraft) -> Result<Rule> {
        self.create_with(draft, VersionChange::Created)
    }

    pub(crate) fn create_with(&self, draft: RuleDraft, change: VersionChange) -> Result<Rule> {
        let rule = {
            let _guard = self.write_lock.lock();

            let rule = build_rule(draft, Utc::now())?;
            if self.rules.contains_key(&rule.id) {
                return Err(RuleError::Validation(format!("规则 ID 已存在: {}", rule.id)));
            }

            // 同 ID 的旧历史（硬删除后重建）不再保留
            self.commit(&rule, None, RuleVersion::capture(&rule, change), true)?;
            rule
        };

        info!(rule_id = %rule.id, category = %rule.category, "规则已创建");
        self.bus.publish(&RuleEvent::RuleCreated { rule: rule.clone() });
        Ok(rule)
    }

    /// 更新规则，版本号补丁位 +1
    #[instrument(skip(self, patch))]
    pub fn update(&self, rule_id: &str, patch: RulePatch) -> Result<Rule> {
        self.update_with(rule_id, |rule| patch.apply_to(rule), VersionChange::Updated, None)
    }

    pub(crate) fn update_with<F>(
        &self,
        rule_id: &str,
        mutate: F,
        change: VersionChange,
        restored_from: Option<String>,
    ) -> Result<Rule>
    where
        F: FnOnce(&mut Rule),
    {
        let (rule, previous) = {
            let _guard = self.write_lock.lock();

            let previous = match self.rules.get(rule_id) {
                Some(r) => r.clone(),
                None => {
                    warn!("更新不存在的规则: {}", rule_id);
                    return Err(RuleError::rule_not_found(rule_id));
                }
            };

            let mut rule = previous.clone();
            mutate(&mut rule);
            rule.id = previous.id.clone();
            rule.created_at = previous.created_at;
            validate_rule(&rule)?;

            rule.version = next_version(&previous.version)?;
            rule.updated_at = Utc::now();

            let mut version = RuleVersion::capture(&rule, change);
            version.restored_from = restored_from;
            self.commit(&rule, Some(&previous), version, false)?;
            (rule, previous)
        };

        info!(rule_id = %rule.id, version = %rule.version, "规则已更新");
        self.bus.publish(&RuleEvent::RuleUpdated {
            rule: rule.clone(),
            previous,
        });
        Ok(rule)
    }

    /// 删除规则，规则不存在时返回 false
    ///
    /// 软删除只打删除标记并保留历史，硬删除同时移除版本历史。
    #[instrument(skip(self))]
    pub fn delete(&self, rule_id: &str, soft: bool) -> Result<bool> {
        let removed = {
            let _guard = self.write_lock.lock();

            let Some(existing) = self.rules.get(rule_id).map(|r| r.clone()) else {
                warn!("删除不存在的规则: {}", rule_id);
                return Ok(false);
            };

            if soft {
                let mut rule = existing.clone();
                let now = Utc::now();
                rule.deleted = true;
                rule.deleted_at = Some(now);
                rule.updated_at = now;
                self.persist_rule(&rule)?;
                self.rules.insert(rule.id.clone(), rule);
            } else {
                self.backend.delete(Namespace::Rules, rule_id)?;
                self.backend.delete(Namespace::Versions, rule_id)?;
                self.rules.remove(rule_id);
                self.versions.remove(rule_id);
            }
            existing
        };

        info!(rule_id = %rule_id, soft, "规则已删除");
        self.bus.publish(&RuleEvent::RuleDeleted {
            rule_id: rule_id.to_string(),
            soft,
            rule: Some(removed),
        });
        Ok(true)
    }

    /// 获取规则（包括软删除的规则）
    pub fn get(&self, rule_id: &str) -> Result<Rule> {
        self.rules
            .get(rule_id)
            .map(|r| r.clone())
            .ok_or_else(|| RuleError::rule_not_found(rule_id))
    }

    /// 按条件列出规则
    pub fn get_all(&self, filter: &RuleFilter) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .rules
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();

        // 默认按创建时间和 ID 排序，排序键相同时同样回退到该顺序
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        match filter.sort_by {
            Some(SortBy::Priority) => rules.sort_by_key(|r| Reverse(r.priority)),
            Some(SortBy::Weight) => rules.sort_by(|a, b| b.weight.total_cmp(&a.weight)),
            Some(SortBy::Name) => rules.sort_by(|a, b| a.name.cmp(&b.name)),
            Some(SortBy::UpdatedAt) => rules.sort_by_key(|r| Reverse(r.updated_at)),
            None => {}
        }
        rules
    }

    /// 获取版本历史（由旧到新）
    pub fn get_versions(&self, rule_id: &str) -> Result<Vec<RuleVersion>> {
        match self.versions.get(rule_id) {
            Some(history) => Ok(history.iter().cloned().collect()),
            None if self.rules.contains_key(rule_id) => Ok(Vec::new()),
            None => Err(RuleError::rule_not_found(rule_id)),
        }
    }

    /// 所有规则的版本历史，用于导出
    pub fn all_versions(&self) -> BTreeMap<String, Vec<RuleVersion>> {
        self.versions
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().cloned().collect()))
            .collect()
    }

    /// 恢复到历史版本：以快照内容生成一个新版本
    #[instrument(skip(self))]
    pub fn restore_version(&self, rule_id: &str, version: &str) -> Result<Rule> {
        if !self.rules.contains_key(rule_id) {
            return Err(RuleError::rule_not_found(rule_id));
        }

        let snapshot = self
            .versions
            .get(rule_id)
            .and_then(|history| {
                history
                    .iter()
                    .find(|v| v.version == version)
                    .map(|v| v.snapshot.clone())
            })
            .ok_or_else(|| RuleError::VersionNotFound {
                rule_id: rule_id.to_string(),
                version: version.to_string(),
            })?;

        let restored = self.update_with(
            rule_id,
            |rule| {
                RulePatch::from_rule(&snapshot).apply_to(rule);
                rule.deleted = snapshot.deleted;
                rule.deleted_at = snapshot.deleted_at;
            },
            VersionChange::Restored,
            Some(version.to_string()),
        )?;

        info!(rule_id = %rule_id, from = %version, to = %restored.version, "规则版本已恢复");
        Ok(restored)
    }

    /// 清空所有规则和版本历史
    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        for key in self.backend.keys(Namespace::Rules)? {
            self.backend.delete(Namespace::Rules, &key)?;
        }
        for key in self.backend.keys(Namespace::Versions)? {
            self.backend.delete(Namespace::Versions, &key)?;
        }
        let count = self.rules.len();
        self.rules.clear();
        self.versions.clear();
        info!("已清空 {} 条规则", count);
        Ok(())
    }

    /// 获取规则统计信息
    pub fn stats(&self) -> RuleStoreStats {
        let mut stats = RuleStoreStats::default();
        for entry in self.rules.iter() {
            let rule = entry.value();
            stats.total += 1;
            if rule.deleted {
                stats.deleted += 1;
                continue;
            }
            if rule.enabled {
                stats.enabled += 1;
            }
            *stats.by_category.entry(rule.category).or_insert(0) += 1;
        }
        stats.versions = self.versions.iter().map(|h| h.len()).sum();
        stats
    }

    fn persist_rule(&self, rule: &Rule) -> Result<()> {
        self.backend
            .set(Namespace::Rules, &rule.id, &serde_json::to_value(rule)?)
    }

    /// 写入规则和版本快照
    ///
    /// 先写规则再写历史。历史写入失败时把规则键回滚到 `previous`
    /// （新建规则则删除），内存状态只在两者都成功后更新。
    fn commit(
        &self,
        rule: &Rule,
        previous: Option<&Rule>,
        version: RuleVersion,
        fresh_history: bool,
    ) -> Result<()> {
        let history = self.next_history(version, fresh_history);
        let history_value = history.as_ref().map(serde_json::to_value).transpose()?;

        self.persist_rule(rule)?;
        if let Some(value) = &history_value {
            if let Err(e) = self.backend.set(Namespace::Versions, &rule.id, value) {
                error!(rule_id = %rule.id, error = %e, "版本历史写入失败，回滚规则");
                let rollback = match previous {
                    Some(prev) => self.persist_rule(prev),
                    None => self.backend.delete(Namespace::Rules, &rule.id).map(|_| ()),
                };
                if let Err(re) = rollback {
                    error!(rule_id = %rule.id, error = %re, "规则回滚失败");
                }
                return Err(e);
            }
        }

        match history {
            Some(history) => {
                self.versions.insert(rule.id.clone(), history);
            }
            None if fresh_history => {
                self.versions.remove(&rule.id);
            }
            None => {}
        }
        self.rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    /// 追加版本快照后的历史，超出上限时淘汰最旧的版本。版本功能关闭时返回 `None`
    fn next_history(
        &self,
        version: RuleVersion,
        fresh: bool,
    ) -> Option<VecDeque<RuleVersion>> {
        if !self.options.enable_versioning || self.options.max_version_history == 0 {
            return None;
        }

        let rule_id = version.rule_id.clone();
        let mut history = if fresh {
            VecDeque::new()
        } else {
            self.versions
                .get(&rule_id)
                .map(|h| h.clone())
                .unwrap_or_default()
        };
        history.push_back(version);
        while history.len() > self.options.max_version_history {
            if let Some(evicted) = history.pop_front() {
                debug!(rule_id = %rule_id, version = %evicted.version, "淘汰最旧的版本快照");
            }
        }
        Some(history)
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 规则存储统计信息
#[derive(Debug, Clone, Default)]
pub struct RuleStoreStats {
    pub total: usize,
    pub enabled: usize,
    pub deleted: usize,
    pub versions: usize,
    pub by_category: HashMap<RuleCategory, usize>,
}

/// 校验创建输入并填充默认值
pub(crate) fn build_rule(draft: RuleDraft, now: DateTime<Utc>) -> Result<Rule> {
    let id = draft.id.filter(|s| !s.trim().is_empty());
    let name = draft.name.filter(|s| !s.trim().is_empty());

    let (id, name) = match (id, name) {
        (None, None) => {
            return Err(RuleError::Validation("规则必须提供 id 或 name".to_string()));
        }
        (Some(id), None) => (id.clone(), id),
        (None, Some(name)) => (format!("rule-{}", Uuid::new_v4()), name),
        (Some(id), Some(name)) => (id, name),
    };

    let category = draft
        .category
        .ok_or_else(|| RuleError::Validation(format!("规则 {} 缺少类别", id)))?;

    let rule = Rule {
        id,
        category,
        name,
        description: draft.description.unwrap_or_default(),
        priority: draft.priority.unwrap_or_default(),
        enabled: draft.enabled.unwrap_or(true),
        weight: draft.weight.unwrap_or(DEFAULT_RULE_WEIGHT),
        conditions: draft.conditions.unwrap_or_default(),
        actions: draft.actions.unwrap_or_default(),
        regions: draft
            .regions
            .unwrap_or_else(|| vec![REGION_WILDCARD.to_string()]),
        version: draft.version.unwrap_or_else(|| INITIAL_VERSION.to_string()),
        tags: draft.tags.unwrap_or_default(),
        dynamic_weight: draft.dynamic_weight.unwrap_or_default(),
        created_at: now,
        updated_at: now,
        deleted: false,
        deleted_at: None,
        ab_test_id: None,
        ab_test_variant: None,
    };

    validate_rule(&rule)?;
    Ok(rule)
}

/// 规则字段校验
pub(crate) fn validate_rule(rule: &Rule) -> Result<()> {
    if rule.name.trim().is_empty() {
        return Err(RuleError::Validation(format!("规则 {} 的名称不能为空", rule.id)));
    }
    if !(rule.weight.is_finite() && rule.weight > 0.0) {
        return Err(RuleError::Validation(format!(
            "规则 {} 的权重必须为正数: {}",
            rule.id, rule.weight
        )));
    }
    if let Some((region, weight)) = rule
        .dynamic_weight
        .iter()
        .find(|(_, w)| !(w.is_finite() && **w > 0.0))
    {
        return Err(RuleError::Validation(format!(
            "规则 {} 在区域 {} 的动态权重必须为正数: {}",
            rule.id, region, weight
        )));
    }
    let deduction = rule.actions.scoring.deduction;
    if !(deduction.is_finite() && deduction >= 0.0) {
        return Err(RuleError::Validation(format!(
            "规则 {} 的扣分不能为负数: {}",
            rule.id, deduction
        )));
    }
    if rule.regions.is_empty() || rule.regions.iter().any(|r| r.trim().is_empty()) {
        return Err(RuleError::Validation(format!("规则 {} 的区域不能为空", rule.id)));
    }
    rule.version.parse::<SemVer>()?;
    Ok(())
}
