//! 规则选择
//!
//! 按区域和类别筛选基础规则，再为指定用户叠加生效中的实验变体。

use crate::experiment::ExperimentStore;
use crate::models::{Rule, RuleCategory, RuleFilter};
use crate::store::RuleStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 选择规则的请求上下文
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub region: Option<String>,
    pub category: Option<RuleCategory>,
    pub user_id: Option<String>,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn category(mut self, category: RuleCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// 规则选择器
#[derive(Clone)]
pub struct RuleSelector {
    rules: Arc<RuleStore>,
    experiments: Arc<ExperimentStore>,
    enable_ab_testing: bool,
}

impl RuleSelector {
    pub fn new(rules: Arc<RuleStore>, experiments: Arc<ExperimentStore>) -> Self {
        Self {
            rules,
            experiments,
            enable_ab_testing: true,
        }
    }

    pub fn with_ab_testing(mut self, enabled: bool) -> Self {
        self.enable_ab_testing = enabled;
        self
    }

    /// 获取生效的规则集合
    pub fn get_applicable_rules(&self, context: &SelectionContext) -> Vec<Rule> {
        let filter = RuleFilter {
            category: context.category,
            region: context.region.clone(),
            enabled_only: true,
            include_deleted: false,
            sort_by: None,
        };
        let mut rules = self.rules.get_all(&filter);

        let Some(user_id) = context.user_id.as_deref() else {
            return rules;
        };
        if !self.enable_ab_testing {
            return rules;
        }

        let tests = self.experiments.applicable_tests(context.region.as_deref());
        if tests.is_empty() {
            return rules;
        }

        let positions: HashMap<String, usize> = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        let mut disabled = Vec::new();
        for test in &tests {
            let Some(&index) = positions.get(&test.rule_id) else {
                // 规则不在当前集合中：可能已被删除或仅是被过滤掉
                match self.rules.get(&test.rule_id) {
                    Ok(rule) if !rule.deleted => {}
                    _ => warn!(
                        test_id = %test.id,
                        rule_id = %test.rule_id,
                        "实验引用的规则不存在或已删除，跳过"
                    ),
                }
                continue;
            };

            if let Some(overlaid) = self.experiments.apply(test, &rules[index], user_id) {
                debug!(
                    rule_id = %overlaid.id,
                    variant = ?overlaid.ab_test_variant,
                    "规则已替换为实验变体"
                );
                if !overlaid.enabled {
                    disabled.push(index);
                }
                rules[index] = overlaid;
            }
        }

        if !disabled.is_empty() {
            let mut index = 0;
            rules.retain(|_| {
                let keep = !disabled.contains(&index);
                index += 1;
                keep
            });
        }
        rules
    }
}
