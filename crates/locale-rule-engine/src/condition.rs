//! 条件模型与可插拔评估接口
//!
//! 规则的 `conditions` 字段对存储层和计分层都是不透明的 JSON，
//! 由 [`ConditionEvaluator`] 的实现决定如何解释。默认实现
//! [`StructuredConditionEvaluator`](crate::executor::StructuredConditionEvaluator)
//! 使用下面的条件树结构。

use crate::error::Result;
use crate::operators::{LogicalOperator, Operator};
use crate::snapshot::EvaluationContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 条件评估策略
pub trait ConditionEvaluator: Send + Sync {
    /// 判断规则的触发条件是否成立
    fn evaluate(&self, conditions: &Value, context: &EvaluationContext) -> Result<bool>;

    /// 在规则写入前校验条件数据，默认不做校验
    fn validate(&self, conditions: &Value) -> Result<()> {
        let _ = conditions;
        Ok(())
    }
}

/// 条件树节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionNode {
    Condition(FieldCondition),
    Group(LogicalGroup),
}

impl ConditionNode {
    pub fn field(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::Condition(FieldCondition::new(field, operator, value))
    }

    pub fn and(children: Vec<ConditionNode>) -> Self {
        Self::Group(LogicalGroup::new(LogicalOperator::And, children))
    }

    pub fn or(children: Vec<ConditionNode>) -> Self {
        Self::Group(LogicalGroup::new(LogicalOperator::Or, children))
    }

    pub fn not(child: ConditionNode) -> Self {
        Self::Group(LogicalGroup::new(LogicalOperator::Not, vec![child]))
    }

    /// 转为规则中存储的 JSON 形式
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// 字段条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl FieldCondition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// 逻辑组节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalGroup {
    pub operator: LogicalOperator,
    pub children: Vec<ConditionNode>,
}

impl LogicalGroup {
    pub fn new(operator: LogicalOperator, children: Vec<ConditionNode>) -> Self {
        Self { operator, children }
    }
}
