//! 本地化规则领域模型

use crate::error::{Result, RuleError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 区域通配符，表示规则适用于所有区域
pub const REGION_WILDCARD: &str = "*";

pub const DEFAULT_RULE_WEIGHT: f64 = 10.0;

/// 规则类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleCategory {
    Language,
    Culture,
    Compliance,
    UserExperience,
    CrossBorder,
}

impl RuleCategory {
    pub const ALL: [RuleCategory; 5] = [
        Self::Language,
        Self::Culture,
        Self::Compliance,
        Self::UserExperience,
        Self::CrossBorder,
    ];

    /// 参与总分计算的四个类别
    pub const SCORED: [RuleCategory; 4] = [
        Self::Language,
        Self::Culture,
        Self::Compliance,
        Self::UserExperience,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Language => "language",
            Self::Culture => "culture",
            Self::Compliance => "compliance",
            Self::UserExperience => "userExperience",
            Self::CrossBorder => "crossBorder",
        }
    }

    /// 总分中的固定权重，crossBorder 不直接参与
    pub fn overall_weight(&self) -> Option<f64> {
        match self {
            Self::Language => Some(0.30),
            Self::Culture => Some(0.25),
            Self::Compliance => Some(0.25),
            Self::UserExperience => Some(0.20),
            Self::CrossBorder => None,
        }
    }

    /// 低于该分数时输出改进建议
    pub fn recommendation_threshold(&self) -> f64 {
        match self {
            Self::Compliance => 80.0,
            _ => 70.0,
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RuleCategory {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RuleError::Validation(format!("未知的规则类别: '{}'", s)))
    }
}

/// 规则优先级，声明顺序即排序顺序（Critical 最高）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoringAction {
    /// 条件命中时从类别得分中扣除的分值
    pub deduction: f64,
}

/// 规则命中后的动作
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleActions {
    #[serde(default)]
    pub scoring: ScoringAction,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    /// crossBorder 规则折叠计分时归入的类别
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_category: Option<RuleCategory>,
}

impl RuleActions {
    pub fn new(deduction: f64, message: impl Into<String>) -> Self {
        Self {
            scoring: ScoringAction { deduction },
            message: message.into(),
            recommendation: None,
            target_category: None,
        }
    }

    pub fn with_target(mut self, category: RuleCategory) -> Self {
        self.target_category = Some(category);
        self
    }
}

/// 本地化规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub category: RuleCategory,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    pub enabled: bool,
    pub weight: f64,
    /// 不透明的条件数据，由可插拔的条件评估器解释
    #[serde(default)]
    pub conditions: Value,
    pub actions: RuleActions,
    pub regions: Vec<String>,
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dynamic_weight: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_test_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_test_variant: Option<String>,
}

impl Rule {
    /// 规则是否适用于指定区域（通配符或区域代码，大小写不敏感）
    pub fn applies_to_region(&self, region: &str) -> bool {
        region_matches(&self.regions, region)
    }

    /// 推荐排序使用的权重，区域动态权重优先
    pub fn effective_weight(&self, region: &str) -> f64 {
        self.dynamic_weight
            .iter()
            .find(|(r, _)| r.eq_ignore_ascii_case(region))
            .map(|(_, w)| *w)
            .unwrap_or(self.weight)
    }

    /// 参与计分的类别：crossBorder 规则在折叠模式下归入目标类别
    pub fn scoring_category(&self, fold_cross_border: bool) -> RuleCategory {
        match self.category {
            RuleCategory::CrossBorder if fold_cross_border => self
                .actions
                .target_category
                .filter(|c| *c != RuleCategory::CrossBorder)
                .unwrap_or(RuleCategory::UserExperience),
            other => other,
        }
    }
}

/// 区域集合是否覆盖指定区域
pub fn region_matches(regions: &[String], region: &str) -> bool {
    regions
        .iter()
        .any(|r| r == REGION_WILDCARD || r.eq_ignore_ascii_case(region))
}

/// 创建规则的输入，未设置的字段使用默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<RuleCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<RuleActions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_weight: Option<BTreeMap<String, f64>>,
}

impl RuleDraft {
    pub fn new(category: RuleCategory, name: impl Into<String>) -> Self {
        Self {
            category: Some(category),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_conditions(mut self, conditions: Value) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_actions(mut self, actions: RuleActions) -> Self {
        self.actions = Some(actions);
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

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_dynamic_weight(mut self, region: impl Into<String>, weight: f64) -> Self {
        self.dynamic_weight
            .get_or_insert_with(BTreeMap::new)
            .insert(region.into(), weight);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = Some(false);
        self
    }
}

impl From<&Rule> for RuleDraft {
    fn from(rule: &Rule) -> Self {
        Self {
            id: Some(rule.id.clone()),
            category: Some(rule.category),
            name: Some(rule.name.clone()),
            description: Some(rule.description.clone()),
            priority: Some(rule.priority),
            enabled: Some(rule.enabled),
            weight: Some(rule.weight),
            conditions: Some(rule.conditions.clone()),
            actions: Some(rule.actions.clone()),
            regions: Some(rule.regions.clone()),
            version: Some(rule.version.clone()),
            tags: Some(rule.tags.clone()),
            dynamic_weight: Some(rule.dynamic_weight.clone()),
        }
    }
}

/// 规则的部分更新，也用作 A/B 测试变体的覆盖内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<RuleCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<RuleActions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_weight: Option<BTreeMap<String, f64>>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 覆盖规则的全部可变内容，用于版本恢复和覆盖导入
    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            category: Some(rule.category),
            name: Some(rule.name.clone()),
            description: Some(rule.description.clone()),
            priority: Some(rule.priority),
            enabled: Some(rule.enabled),
            weight: Some(rule.weight),
            conditions: Some(rule.conditions.clone()),
            actions: Some(rule.actions.clone()),
            regions: Some(rule.regions.clone()),
            tags: Some(rule.tags.clone()),
            dynamic_weight: Some(rule.dynamic_weight.clone()),
        }
    }

    /// 将补丁合并到规则上（不修改 id、版本和时间戳）
    pub fn apply_to(&self, rule: &mut Rule) {
        if let Some(category) = self.category {
            rule.category = category;
        }
        if let Some(name) = &self.name {
            rule.name = name.clone();
        }
        if let Some(description) = &self.description {
            rule.description = description.clone();
        }
        if let Some(priority) = self.priority {
            rule.priority = priority;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        if let Some(weight) = self.weight {
            rule.weight = weight;
        }
        if let Some(conditions) = &self.conditions {
            rule.conditions = conditions.clone();
        }
        if let Some(actions) = &self.actions {
            rule.actions = actions.clone();
        }
        if let Some(regions) = &self.regions {
            rule.regions = regions.clone();
        }
        if let Some(tags) = &self.tags {
            rule.tags = tags.clone();
        }
        if let Some(dynamic_weight) = &self.dynamic_weight {
            rule.dynamic_weight = dynamic_weight.clone();
        }
    }
}

/// 版本快照的变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionChange {
    Created,
    Updated,
    Restored,
    Imported,
}

/// 规则版本快照（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleVersion {
    pub rule_id: String,
    pub version: String,
    pub change_type: VersionChange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<String>,
    pub snapshot: Rule,
    pub created_at: DateTime<Utc>,
}

impl RuleVersion {
    pub fn capture(rule: &Rule, change_type: VersionChange) -> Self {
        Self {
            rule_id: rule.id.clone(),
            version: rule.version.clone(),
            change_type,
            restored_from: None,
            snapshot: rule.clone(),
            created_at: Utc::now(),
        }
    }
}

/// 规则列表排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    Priority,
    Weight,
    Name,
    UpdatedAt,
}

/// 规则列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub category: Option<RuleCategory>,
    pub region: Option<String>,
    pub enabled_only: bool,
    pub include_deleted: bool,
    pub sort_by: Option<SortBy>,
}

impl RuleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: RuleCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn enabled_only(mut self) -> Self {
        self.enabled_only = true;
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn sort_by(mut self, sort_by: SortBy) -> Self {
        self.sort_by = Some(sort_by);
        self
    }

    pub fn matches(&self, rule: &Rule) -> bool {
        if rule.deleted && !self.include_deleted {
            return false;
        }
        if self.enabled_only && !rule.enabled {
            return false;
        }
        if let Some(category) = self.category {
            if rule.category != category {
                return false;
            }
        }
        match &self.region {
            Some(region) => rule.applies_to_region(region),
            None => true,
        }
    }
}
