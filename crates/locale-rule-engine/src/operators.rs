//! 条件操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 字段操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    // 通用比较
    Eq,
    Neq,

    // 数值比较
    Gt,
    Gte,
    Lt,
    Lte,

    // 包含检查
    In,
    NotIn,
    Contains,
    NotContains,
    ContainsAny,

    // 字符串/文本操作
    StartsWith,
    Regex,
    /// 数组中任一字符串匹配正则
    AnyMatch,
    /// 数组中没有字符串匹配正则
    NoneMatch,

    // 对象数组：任一元素缺少指定字段
    AnyMissing,

    // 长度
    LengthGte,
    LengthLt,

    // 空值检查
    IsEmpty,
    IsNotEmpty,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::ContainsAny => "contains_any",
            Self::StartsWith => "starts_with",
            Self::Regex => "regex",
            Self::AnyMatch => "any_match",
            Self::NoneMatch => "none_match",
            Self::AnyMissing => "any_missing",
            Self::LengthGte => "length_gte",
            Self::LengthLt => "length_lt",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
        };
        write!(f, "{}", s)
    }
}

/// 逻辑操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
    /// 取反，要求恰好一个子节点
    Not,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
            Self::Not => write!(f, "NOT"),
        }
    }
}
