//! 字段操作符评估
//!
//! 实现各操作符对快照字段值的判断逻辑。

use crate::error::{Result, RuleError};
use crate::operators::Operator;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;

/// 已编译正则缓存，键为原始模式串
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: DashMap<String, Regex>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pattern: &str) -> Result<Regex> {
        if let Some(regex) = self.compiled.get(pattern) {
            return Ok(regex.clone());
        }

        let regex = Regex::new(pattern).map_err(|e| {
            RuleError::Condition(format!("无效的正则表达式 '{}': {}", pattern, e))
        })?;
        self.compiled.insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// 字段操作符评估器
pub struct OperatorEvaluator;

impl OperatorEvaluator {
    /// 评估单个字段条件
    ///
    /// # Arguments
    /// * `field_value` - 从上下文中获取的字段值
    /// * `operator` - 操作符
    /// * `expected_value` - 条件中定义的期望值
    /// * `regexes` - 正则缓存
    pub fn evaluate(
        field_value: Option<&Value>,
        operator: Operator,
        expected_value: &Value,
        regexes: &RegexCache,
    ) -> Result<bool> {
        // 空值检查的语义就是判断字段是否存在
        match operator {
            Operator::IsEmpty => return Ok(Self::is_empty(field_value)),
            Operator::IsNotEmpty => return Ok(!Self::is_empty(field_value)),
            _ => {}
        }

        // 字段缺失时：否定类操作符成立，其余不成立
        let field_value = match field_value {
            Some(Value::Null) | None => {
                let matched = match operator {
                    Operator::Neq
                    | Operator::NotIn
                    | Operator::NotContains
                    | Operator::NoneMatch => true,
                    Operator::LengthLt => Self::as_f64(expected_value).is_some_and(|n| n > 0.0),
                    _ => false,
                };
                return Ok(matched);
            }
            Some(v) => v,
        };

        match operator {
            Operator::Eq => Ok(Self::eq(field_value, expected_value)),
            Operator::Neq => Ok(!Self::eq(field_value, expected_value)),
            Operator::Gt => Self::compare(field_value, expected_value, |a, b| a > b),
            Operator::Gte => Self::compare(field_value, expected_value, |a, b| a >= b),
            Operator::Lt => Self::compare(field_value, expected_value, |a, b| a < b),
            Operator::Lte => Self::compare(field_value, expected_value, |a, b| a <= b),
            Operator::In => Self::in_list(field_value, expected_value),
            Operator::NotIn => Self::in_list(field_value, expected_value).map(|r| !r),
            Operator::Contains => Self::contains(field_value, expected_value),
            Operator::NotContains => Self::contains(field_value, expected_value).map(|r| !r),
            Operator::ContainsAny => Self::contains_any(field_value, expected_value),
            Operator::StartsWith => Self::starts_with(field_value, expected_value),
            Operator::Regex => Self::regex_match(field_value, expected_value, regexes),
            Operator::AnyMatch => Self::any_match(field_value, expected_value, regexes),
            Operator::NoneMatch => {
                Self::any_match(field_value, expected_value, regexes).map(|r| !r)
            }
            Operator::AnyMissing => Self::any_missing(field_value, expected_value),
            Operator::LengthGte => Self::length_compare(field_value, expected_value, |a, b| a >= b),
            Operator::LengthLt => Self::length_compare(field_value, expected_value, |a, b| a < b),
            Operator::IsEmpty => Ok(Self::is_empty(Some(field_value))),
            Operator::IsNotEmpty => Ok(!Self::is_empty(Some(field_value))),
        }
    }

    fn is_empty(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Array(arr)) => arr.is_empty(),
            Some(Value::Object(obj)) => obj.is_empty(),
            _ => false,
        }
    }

    /// 相等比较：数值统一转浮点，字符串忽略大小写
    fn eq(field: &Value, expected: &Value) -> bool {
        if let (Value::Number(a), Value::Number(b)) = (field, expected) {
            if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
                return (a - b).abs() < f64::EPSILON;
            }
        }

        if let (Value::String(a), Value::String(b)) = (field, expected) {
            return a.eq_ignore_ascii_case(b);
        }

        field == expected
    }

    fn compare<F>(field: &Value, expected: &Value, cmp: F) -> Result<bool>
    where
        F: Fn(f64, f64) -> bool,
    {
        let field_num = Self::require_f64(field)?;
        let expected_num = Self::require_f64(expected)?;
        Ok(cmp(field_num, expected_num))
    }

    fn in_list(field: &Value, expected: &Value) -> Result<bool> {
        let arr = Self::require_array(expected)?;
        Ok(arr.iter().any(|item| Self::eq(field, item)))
    }

    /// 字符串子串（忽略大小写）或数组元素包含
    fn contains(field: &Value, expected: &Value) -> Result<bool> {
        match field {
            Value::String(s) => {
                let needle = Self::require_str(expected)?;
                Ok(s.to_lowercase().contains(&needle.to_lowercase()))
            }
            Value::Array(arr) => Ok(arr.iter().any(|item| match (item, expected) {
                (Value::String(s), Value::String(needle)) => {
                    s.to_lowercase().contains(&needle.to_lowercase())
                }
                _ => Self::eq(item, expected),
            })),
            _ => Err(RuleError::TypeMismatch {
                expected: "string or array".to_string(),
                actual: Self::type_name(field).to_string(),
            }),
        }
    }

    fn contains_any(field: &Value, expected: &Value) -> Result<bool> {
        for candidate in Self::require_array(expected)? {
            if Self::contains(field, candidate)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn starts_with(field: &Value, expected: &Value) -> Result<bool> {
        let s = Self::require_str(field)?;
        let prefix = Self::require_str(expected)?;
        Ok(s.to_lowercase().starts_with(&prefix.to_lowercase()))
    }

    fn regex_match(field: &Value, expected: &Value, regexes: &RegexCache) -> Result<bool> {
        let s = Self::require_str(field)?;
        let regex = regexes.get(Self::require_str(expected)?)?;
        Ok(regex.is_match(s))
    }

    /// 数组中任一字符串元素匹配；字段为字符串时等同 regex
    fn any_match(field: &Value, expected: &Value, regexes: &RegexCache) -> Result<bool> {
        let regex = regexes.get(Self::require_str(expected)?)?;
        match field {
            Value::String(s) => Ok(regex.is_match(s)),
            Value::Array(arr) => Ok(arr.iter().any(|item| match item {
                Value::String(s) => regex.is_match(s),
                Value::Object(obj) => obj
                    .values()
                    .filter_map(Value::as_str)
                    .any(|s| regex.is_match(s)),
                _ => false,
            })),
            _ => Err(RuleError::TypeMismatch {
                expected: "string or array".to_string(),
                actual: Self::type_name(field).to_string(),
            }),
        }
    }

    /// 对象数组中任一元素的指定字段为空
    fn any_missing(field: &Value, expected: &Value) -> Result<bool> {
        let key = Self::require_str(expected)?;
        let arr = Self::require_array(field)?;
        Ok(arr.iter().any(|item| Self::is_empty(item.get(key))))
    }

    fn length_compare<F>(field: &Value, expected: &Value, cmp: F) -> Result<bool>
    where
        F: Fn(f64, f64) -> bool,
    {
        let len = match field {
            Value::String(s) => s.chars().count(),
            Value::Array(arr) => arr.len(),
            Value::Object(obj) => obj.len(),
            _ => {
                return Err(RuleError::TypeMismatch {
                    expected: "string, array or object".to_string(),
                    actual: Self::type_name(field).to_string(),
                })
            }
        };
        Ok(cmp(len as f64, Self::require_f64(expected)?))
    }

    fn as_f64(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn require_f64(value: &Value) -> Result<f64> {
        Self::as_f64(value).ok_or_else(|| RuleError::TypeMismatch {
            expected: "number".to_string(),
            actual: Self::type_name(value).to_string(),
        })
    }

    fn require_str(value: &Value) -> Result<&str> {
        value.as_str().ok_or_else(|| RuleError::TypeMismatch {
            expected: "string".to_string(),
            actual: Self::type_name(value).to_string(),
        })
    }

    fn require_array(value: &Value) -> Result<&Vec<Value>> {
        value.as_array().ok_or_else(|| RuleError::TypeMismatch {
            expected: "array".to_string(),
            actual: Self::type_name(value).to_string(),
        })
    }

    fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(field: Option<&Value>, operator: Operator, expected: &Value) -> bool {
        OperatorEvaluator::evaluate(field, operator, expected, &RegexCache::new()).unwrap()
    }

    #[test]
    fn test_eq_case_insensitive() {
        assert!(eval(Some(&json!("EUR")), Operator::Eq, &json!("eur")));
        assert!(eval(Some(&json!(100)), Operator::Eq, &json!(100.0)));
        assert!(!eval(Some(&json!("USD")), Operator::Eq, &json!("EUR")));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(eval(Some(&json!(3200.5)), Operator::Gt, &json!(3000)));
        assert!(eval(Some(&json!(1000)), Operator::Lte, &json!(1000)));
        assert!(!eval(Some(&json!(500)), Operator::Gte, &json!(1000)));
    }

    #[test]
    fn test_type_mismatch() {
        let result = OperatorEvaluator::evaluate(
            Some(&json!("fast")),
            Operator::Gt,
            &json!(10),
            &RegexCache::new(),
        );
        assert!(matches!(result, Err(RuleError::TypeMismatch { .. })));
    }

    #[test]
    fn test_in_list() {
        assert!(eval(Some(&json!("CNY")), Operator::In, &json!(["CNY", "RMB"])));
        assert!(eval(Some(&json!("USD")), Operator::NotIn, &json!(["CNY", "RMB"])));
    }

    #[test]
    fn test_contains_string_and_array() {
        assert!(eval(
            Some(&json!("Datenschutzerklärung lesen")),
            Operator::Contains,
            &json!("datenschutz")
        ));
        assert!(eval(
            Some(&json!(["Alipay", "WeChat Pay"])),
            Operator::Contains,
            &json!("wechat")
        ));
        assert!(eval(
            Some(&json!(["PayPal"])),
            Operator::NotContains,
            &json!("alipay")
        ));
    }

    #[test]
    fn test_contains_any() {
        assert!(eval(
            Some(&json!(["Visa", "UnionPay"])),
            Operator::ContainsAny,
            &json!(["alipay", "unionpay"])
        ));
        assert!(!eval(
            Some(&json!(["Visa"])),
            Operator::ContainsAny,
            &json!(["alipay", "unionpay"])
        ));
    }

    #[test]
    fn test_regex_and_any_match() {
        assert!(eval(
            Some(&json!("€ 19,99")),
            Operator::Regex,
            &json!(r"\d+,\d{2}")
        ));
        assert!(eval(
            Some(&json!(["Buy now", "Add to cart"])),
            Operator::AnyMatch,
            &json!("(?i)buy now")
        ));
        assert!(eval(
            Some(&json!(["Jetzt kaufen"])),
            Operator::NoneMatch,
            &json!("(?i)buy now")
        ));
    }

    #[test]
    fn test_any_missing() {
        let images = json!([{"src": "/a.png", "alt": "A"}, {"src": "/b.png", "alt": null}]);
        assert!(eval(Some(&images), Operator::AnyMissing, &json!("alt")));

        let complete = json!([{"src": "/a.png", "alt": "A"}]);
        assert!(!eval(Some(&complete), Operator::AnyMissing, &json!("alt")));
    }

    #[test]
    fn test_length() {
        assert!(eval(Some(&json!(["a", "b", "c"])), Operator::LengthGte, &json!(3)));
        assert!(eval(Some(&json!("短")), Operator::LengthLt, &json!(2)));
    }

    #[test]
    fn test_missing_field() {
        assert!(!eval(None, Operator::Eq, &json!("EUR")));
        assert!(eval(None, Operator::Neq, &json!("EUR")));
        assert!(eval(Some(&json!(null)), Operator::NoneMatch, &json!("x")));
        assert!(eval(None, Operator::LengthLt, &json!(1)));
    }

    #[test]
    fn test_is_empty() {
        assert!(eval(None, Operator::IsEmpty, &json!(null)));
        assert!(eval(Some(&json!("  ")), Operator::IsEmpty, &json!(null)));
        assert!(eval(Some(&json!([])), Operator::IsEmpty, &json!(null)));
        assert!(eval(Some(&json!("https://x/privacy")), Operator::IsNotEmpty, &json!(null)));
    }

    #[test]
    fn test_regex_cache_reuse() {
        let cache = RegexCache::new();
        cache.get("^a+$").unwrap();
        cache.get("^a+$").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("[invalid").is_err());
    }
}
