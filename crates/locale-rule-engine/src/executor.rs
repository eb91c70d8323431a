//! 结构化条件评估器
//!
//! 默认的 [`ConditionEvaluator`] 实现：对条件树做短路求值，可选记录评估追踪。

use crate::compiler::ConditionCompiler;
use crate::condition::{ConditionEvaluator, ConditionNode, FieldCondition, LogicalGroup};
use crate::error::Result;
use crate::evaluator::{OperatorEvaluator, RegexCache};
use crate::operators::LogicalOperator;
use crate::snapshot::EvaluationContext;
use serde_json::Value;

/// 单次条件评估的详细结果
#[derive(Debug, Clone, Default)]
pub struct ConditionOutcome {
    pub matched: bool,
    pub matched_conditions: Vec<String>,
    pub evaluation_trace: Vec<String>,
}

/// 结构化条件评估器
#[derive(Debug, Default)]
pub struct StructuredConditionEvaluator {
    compiler: ConditionCompiler,
    regexes: RegexCache,
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl StructuredConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 评估条件并返回匹配细节
    pub fn explain(&self, conditions: &Value, context: &EvaluationContext) -> Result<ConditionOutcome> {
        let mut outcome = ConditionOutcome::default();

        let Some(compiled) = self.compiler.compile(conditions)? else {
            if self.trace_enabled {
                outcome.evaluation_trace.push("root: 无触发条件".to_string());
            }
            return Ok(outcome);
        };

        outcome.matched = self.evaluate_node(&compiled.root, context, &mut outcome, "root")?;
        Ok(outcome)
    }

    fn evaluate_node(
        &self,
        node: &ConditionNode,
        context: &EvaluationContext,
        outcome: &mut ConditionOutcome,
        path: &str,
    ) -> Result<bool> {
        match node {
            ConditionNode::Condition(cond) => self.evaluate_condition(cond, context, outcome, path),
            ConditionNode::Group(group) => self.evaluate_group(group, context, outcome, path),
        }
    }

    fn evaluate_condition(
        &self,
        cond: &FieldCondition,
        context: &EvaluationContext,
        outcome: &mut ConditionOutcome,
        path: &str,
    ) -> Result<bool> {
        let field_value = context.get_field(&cond.field);
        let matched =
            OperatorEvaluator::evaluate(field_value, cond.operator, &cond.value, &self.regexes)?;

        if self.trace_enabled {
            outcome.evaluation_trace.push(format!(
                "{}: {} {} {} => {}",
                path,
                cond.field,
                cond.operator,
                cond.value,
                if matched { "MATCHED" } else { "NOT_MATCHED" }
            ));
        }

        if matched {
            outcome
                .matched_conditions
                .push(format!("{}.{} {} {}", path, cond.field, cond.operator, cond.value));
        }

        Ok(matched)
    }

    /// 评估逻辑组节点（短路求值）
    fn evaluate_group(
        &self,
        group: &LogicalGroup,
        context: &EvaluationContext,
        outcome: &mut ConditionOutcome,
        path: &str,
    ) -> Result<bool> {
        match group.operator {
            LogicalOperator::And => {
                for (i, child) in group.children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    if !self.evaluate_node(child, context, outcome, &child_path)? {
                        if self.trace_enabled {
                            outcome
                                .evaluation_trace
                                .push(format!("{}: AND 短路 - 子节点 {} 不匹配", path, i));
                        }
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicalOperator::Or => {
                for (i, child) in group.children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    if self.evaluate_node(child, context, outcome, &child_path)? {
                        if self.trace_enabled {
                            outcome
                                .evaluation_trace
                                .push(format!("{}: OR 短路 - 子节点 {} 匹配", path, i));
                        }
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            LogicalOperator::Not => {
                let child_path = format!("{}.children[0]", path);
                let inner = match group.children.first() {
                    Some(child) => self.evaluate_node(child, context, outcome, &child_path)?,
                    None => false,
                };
                Ok(!inner)
            }
        }
    }
}

impl ConditionEvaluator for StructuredConditionEvaluator {
    fn evaluate(&self, conditions: &Value, context: &EvaluationContext) -> Result<bool> {
        Ok(self.explain(conditions, context)?.matched)
    }

    fn validate(&self, conditions: &Value) -> Result<()> {
        self.compiler.compile(conditions).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_context() -> EvaluationContext {
        EvaluationContext::new(json!({
            "url": "https://shop.example.cn",
            "lang": "zh-CN",
            "buttons": ["立即购买", "Add to cart"],
            "legal": {
                "privacyPolicyUrl": null,
                "cookieConsent": false
            },
            "ecommerce": {
                "currency": "CNY",
                "paymentMethods": ["Alipay", "Visa"]
            },
            "performance": {
                "loadTimeMs": 4200
            }
        }))
    }

    #[test]
    fn test_simple_condition_match() {
        let evaluator = StructuredConditionEvaluator::new();
        let matched = evaluator
            .evaluate(
                &json!({"type": "condition", "field": "ecommerce.currency", "operator": "eq", "value": "CNY"}),
                &create_test_context(),
            )
            .unwrap();
        assert!(matched);
    }

    #[test]
    fn test_and_group_short_circuit() {
        let evaluator = StructuredConditionEvaluator::new().with_trace();
        let outcome = evaluator
            .explain(
                &json!({
                    "type": "group",
                    "operator": "AND",
                    "children": [
                        {"type": "condition", "field": "lang", "operator": "eq", "value": "de"},
                        {"type": "condition", "field": "performance.loadTimeMs", "operator": "gt", "value": 3000}
                    ]
                }),
                &create_test_context(),
            )
            .unwrap();

        assert!(!outcome.matched);
        assert!(outcome.evaluation_trace.iter().any(|t| t.contains("短路")));
    }

    #[test]
    fn test_or_group_first_match() {
        let evaluator = StructuredConditionEvaluator::new();
        let outcome = evaluator
            .explain(
                &json!({
                    "type": "group",
                    "operator": "OR",
                    "children": [
                        {"type": "condition", "field": "legal.privacyPolicyUrl", "operator": "is_empty"},
                        {"type": "condition", "field": "legal.cookieConsent", "operator": "eq", "value": false}
                    ]
                }),
                &create_test_context(),
            )
            .unwrap();

        assert!(outcome.matched);
        assert_eq!(outcome.matched_conditions.len(), 1);
    }

    #[test]
    fn test_not_group() {
        let evaluator = StructuredConditionEvaluator::new();
        let conditions = ConditionNode::not(ConditionNode::field(
            "ecommerce.paymentMethods",
            crate::operators::Operator::Contains,
            "alipay",
        ))
        .to_value();

        assert!(!evaluator.evaluate(&conditions, &create_test_context()).unwrap());
    }

    #[test]
    fn test_blank_conditions_never_fire() {
        let evaluator = StructuredConditionEvaluator::new();
        assert!(!evaluator.evaluate(&Value::Null, &create_test_context()).unwrap());
    }

    #[test]
    fn test_type_error_propagates() {
        let evaluator = StructuredConditionEvaluator::new();
        let result = evaluator.evaluate(
            &json!({"type": "condition", "field": "lang", "operator": "gt", "value": 3}),
            &create_test_context(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let evaluator = StructuredConditionEvaluator::new();
        assert!(evaluator.validate(&json!({"type": "bogus"})).is_err());
        assert!(evaluator
            .validate(&json!({"type": "condition", "field": "lang", "operator": "is_empty"}))
            .is_ok());
    }
}
