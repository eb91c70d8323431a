//! 本地化评分
//!
//! 每个类别从 100 分起，命中规则按 `actions.scoring.deduction` 扣分并记录问题，
//! 总分按固定类别权重加权求和后取整。

use crate::condition::ConditionEvaluator;
use crate::models::{Priority, Rule, RuleCategory};
use crate::selector::{RuleSelector, SelectionContext};
use crate::snapshot::{ContentSnapshot, EvaluationContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const MAX_SCORE: f64 = 100.0;

/// crossBorder 规则的计分方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CrossBorderMode {
    /// 计入 `actions.targetCategory`（默认 userExperience）
    #[default]
    Fold,
    /// 单独输出 crossBorder 类别，不参与总分
    Separate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringOptions {
    #[serde(default)]
    pub cross_border_mode: CrossBorderMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryScore {
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl CategoryScore {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            issues: Vec::new(),
        }
    }

    pub fn with_issues<I, S>(mut self, issues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.issues = issues.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for CategoryScore {
    fn default() -> Self {
        Self::new(MAX_SCORE)
    }
}

/// 改进建议
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub rule_id: String,
    pub category: RuleCategory,
    pub priority: Priority,
    /// 区域生效权重
    pub weight: f64,
    pub message: String,
}

/// 评分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub categories: BTreeMap<RuleCategory, CategoryScore>,
    pub overall_score: f64,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    #[serde(default)]
    pub ai_enhanced: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ai_suggestions: Vec<String>,
    #[serde(default)]
    pub rules_evaluated: usize,
    #[serde(default)]
    pub rules_fired: usize,
    #[serde(default = "Utc::now")]
    pub evaluated_at: DateTime<Utc>,
}

impl ScoreResult {
    /// 四个计分类别均为满分的结果
    pub fn perfect(region: impl Into<String>) -> Self {
        let categories = RuleCategory::SCORED
            .into_iter()
            .map(|c| (c, CategoryScore::default()))
            .collect();
        Self {
            region: region.into(),
            categories,
            overall_score: MAX_SCORE,
            recommendations: Vec::new(),
            ai_enhanced: false,
            ai_suggestions: Vec::new(),
            rules_evaluated: 0,
            rules_fired: 0,
            evaluated_at: Utc::now(),
        }
    }

    pub fn category(&self, category: RuleCategory) -> Option<&CategoryScore> {
        self.categories.get(&category)
    }

    pub fn score_of(&self, category: RuleCategory) -> Option<f64> {
        self.categories.get(&category).map(|c| c.score)
    }
}

/// 按固定权重计算总分，缺失的类别按满分计
pub fn compute_overall(categories: &BTreeMap<RuleCategory, CategoryScore>) -> f64 {
    let total: f64 = RuleCategory::SCORED
        .iter()
        .filter_map(|c| {
            let weight = c.overall_weight()?;
            let score = categories.get(c).map(|s| s.score).unwrap_or(MAX_SCORE);
            Some(weight * score)
        })
        .sum();
    total.round().clamp(0.0, MAX_SCORE)
}

struct FiredRule<'a> {
    rule: &'a Rule,
    category: RuleCategory,
}

/// 评分引擎
#[derive(Clone)]
pub struct ScoringEngine {
    selector: RuleSelector,
    evaluator: Arc<dyn ConditionEvaluator>,
    options: ScoringOptions,
}

impl ScoringEngine {
    pub fn new(selector: RuleSelector, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self {
            selector,
            evaluator,
            options: ScoringOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ScoringOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> ScoringOptions {
        self.options
    }

    /// 为区域（及可选用户）选择规则并评分
    pub fn evaluate(
        &self,
        snapshot: &ContentSnapshot,
        region: &str,
        user_id: Option<&str>,
    ) -> ScoreResult {
        let mut context = SelectionContext::new().region(region);
        context.user_id = user_id.map(str::to_string);
        let rules = self.selector.get_applicable_rules(&context);
        self.score_rules(&rules, snapshot, region)
    }

    /// 对给定规则集合评分，结果与规则顺序无关
    pub fn score_rules(&self, rules: &[Rule], snapshot: &ContentSnapshot, region: &str) -> ScoreResult {
        let started = Instant::now();
        let context = EvaluationContext::from_snapshot(snapshot).unwrap_or_else(|e| {
            warn!(error = %e, "快照序列化失败，按空快照评估");
            EvaluationContext::new(Value::Null)
        });

        let mut ordered: Vec<&Rule> = rules.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let fold = self.options.cross_border_mode == CrossBorderMode::Fold;
        let mut result = ScoreResult::perfect(region);
        if !fold {
            result
                .categories
                .insert(RuleCategory::CrossBorder, CategoryScore::default());
        }

        let mut fired = Vec::new();
        for rule in ordered {
            result.rules_evaluated += 1;
            if !self.fires(rule, &context) {
                continue;
            }

            let category = rule.scoring_category(fold);
            let bucket = result.categories.entry(category).or_default();
            bucket.score = (bucket.score - rule.actions.scoring.deduction).clamp(0.0, MAX_SCORE);
            if !rule.actions.message.is_empty() {
                bucket.issues.push(rule.actions.message.clone());
            }

            metrics::counter!(
                "localization_rules_fired_total",
                "category" => category.as_str()
            )
            .increment(1);
            debug!(rule_id = %rule.id, category = %category, deduction = rule.actions.scoring.deduction, "规则命中");
            fired.push(FiredRule { rule, category });
        }

        result.rules_fired = fired.len();
        result.overall_score = compute_overall(&result.categories);
        result.recommendations = self.recommendations(&result, &fired, region);

        metrics::counter!("localization_evaluations_total").increment(1);
        metrics::histogram!("localization_evaluation_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(
            region = %region,
            rules_evaluated = result.rules_evaluated,
            rules_fired = result.rules_fired,
            overall_score = result.overall_score,
            "本地化评分完成"
        );
        result
    }

    /// 条件为空的规则不会命中，评估出错按未命中处理
    fn fires(&self, rule: &Rule, context: &EvaluationContext) -> bool {
        if rule.conditions.is_null() {
            return false;
        }
        match self.evaluator.evaluate(&rule.conditions, context) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "规则条件评估失败，按未命中处理");
                false
            }
        }
    }

    fn recommendations(
        &self,
        result: &ScoreResult,
        fired: &[FiredRule<'_>],
        region: &str,
    ) -> Vec<Recommendation> {
        let mut recommendations: Vec<Recommendation> = fired
            .iter()
            .filter(|f| {
                result
                    .score_of(f.category)
                    .is_some_and(|score| score < f.category.recommendation_threshold())
            })
            .map(|f| Recommendation {
                rule_id: f.rule.id.clone(),
                category: f.category,
                priority: f.rule.priority,
                weight: f.rule.effective_weight(region),
                message: f
                    .rule
                    .actions
                    .recommendation
                    .clone()
                    .unwrap_or_else(|| f.rule.actions.message.clone()),
            })
            .collect();

        recommendations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.weight.total_cmp(&a.weight))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        recommendations
    }
}
