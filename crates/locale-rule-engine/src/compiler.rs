//! 条件编译器
//!
//! 将规则中的条件 JSON 解析为条件树并做结构校验。

use crate::condition::{ConditionNode, FieldCondition};
use crate::error::{Result, RuleError};
use crate::operators::{LogicalOperator, Operator};
use serde_json::Value;
use std::collections::HashSet;

/// 解析后的条件树
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub root: ConditionNode,
    /// 条件中引用的所有字段路径
    pub required_fields: HashSet<String>,
}

/// 条件编译器
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionCompiler;

impl ConditionCompiler {
    pub fn new() -> Self {
        Self
    }

    /// 编译条件 JSON；`null` 或空对象表示规则没有触发条件，返回 `None`
    pub fn compile(&self, conditions: &Value) -> Result<Option<CompiledCondition>> {
        if Self::is_blank(conditions) {
            return Ok(None);
        }

        let root: ConditionNode = serde_json::from_value(conditions.clone())
            .map_err(|e| RuleError::Condition(format!("条件结构无法解析: {}", e)))?;

        self.validate_node(&root, "root")?;

        let mut required_fields = HashSet::new();
        Self::collect_fields(&root, &mut required_fields);

        Ok(Some(CompiledCondition {
            root,
            required_fields,
        }))
    }

    fn is_blank(conditions: &Value) -> bool {
        match conditions {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    fn validate_node(&self, node: &ConditionNode, path: &str) -> Result<()> {
        match node {
            ConditionNode::Condition(cond) => self.validate_condition(cond, path),
            ConditionNode::Group(group) => {
                if group.children.is_empty() {
                    return Err(RuleError::Condition(format!("逻辑组 '{}' 不能为空", path)));
                }

                if group.operator == LogicalOperator::Not && group.children.len() != 1 {
                    return Err(RuleError::Condition(format!(
                        "NOT 组 '{}' 只能包含一个子节点，当前有 {} 个",
                        path,
                        group.children.len()
                    )));
                }

                for (i, child) in group.children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    self.validate_node(child, &child_path)?;
                }
                Ok(())
            }
        }
    }

    fn validate_condition(&self, cond: &FieldCondition, path: &str) -> Result<()> {
        if cond.field.trim().is_empty() {
            return Err(RuleError::Condition(format!(
                "条件 '{}' 的字段不能为空",
                path
            )));
        }

        match cond.operator {
            Operator::In | Operator::NotIn | Operator::ContainsAny => {
                if !cond.value.is_array() {
                    return Err(RuleError::Condition(format!(
                        "条件 '{}' 的 {} 操作符需要数组值",
                        path, cond.operator
                    )));
                }
            }
            Operator::Regex | Operator::AnyMatch | Operator::NoneMatch => {
                let pattern = cond.value.as_str().ok_or_else(|| {
                    RuleError::Condition(format!(
                        "条件 '{}' 的 {} 操作符需要字符串值",
                        path, cond.operator
                    ))
                })?;
                regex::Regex::new(pattern).map_err(|e| {
                    RuleError::Condition(format!("条件 '{}' 的正则表达式无效: {}", path, e))
                })?;
            }
            Operator::AnyMissing => {
                if !cond.value.is_string() {
                    return Err(RuleError::Condition(format!(
                        "条件 '{}' 的 any_missing 操作符需要字段名字符串",
                        path
                    )));
                }
            }
            Operator::Gt
            | Operator::Gte
            | Operator::Lt
            | Operator::Lte
            | Operator::LengthGte
            | Operator::LengthLt => {
                if !cond.value.is_number() {
                    return Err(RuleError::Condition(format!(
                        "条件 '{}' 的 {} 操作符需要数值",
                        path, cond.operator
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn collect_fields(node: &ConditionNode, fields: &mut HashSet<String>) {
        match node {
            ConditionNode::Condition(cond) => {
                fields.insert(cond.field.clone());
            }
            ConditionNode::Group(group) => {
                for child in &group.children {
                    Self::collect_fields(child, fields);
                }
            }
        }
    }
}
