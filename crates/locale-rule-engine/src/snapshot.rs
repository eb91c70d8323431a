//! 页面内容快照
//!
//! 由外部采集方提供的结构化页面数据。条件评估器通过点号路径（如
//! `legal.privacyPolicyUrl`、`images.0.alt`）读取字段。

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentSnapshot {
    pub url: String,
    pub title: String,
    /// `<html lang>` 声明
    pub lang: Option<String>,
    pub headings: Vec<String>,
    pub paragraphs: Vec<String>,
    pub buttons: Vec<String>,
    pub links: Vec<LinkInfo>,
    pub images: Vec<ImageInfo>,
    pub meta: BTreeMap<String, String>,
    pub forms: FormInfo,
    pub legal: LegalInfo,
    pub ecommerce: EcommerceInfo,
    pub performance: PerformanceTiming,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkInfo {
    pub text: String,
    pub href: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageInfo {
    pub src: String,
    pub alt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormInfo {
    pub fields: Vec<String>,
    pub has_consent_checkbox: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegalInfo {
    pub privacy_policy_url: Option<String>,
    pub terms_url: Option<String>,
    pub imprint_url: Option<String>,
    pub cookie_consent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EcommerceInfo {
    pub currency: Option<String>,
    pub prices: Vec<String>,
    pub payment_methods: Vec<String>,
    pub shipping_regions: Vec<String>,
    pub has_tax_info: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceTiming {
    pub load_time_ms: Option<f64>,
    pub first_contentful_paint_ms: Option<f64>,
    pub dom_content_loaded_ms: Option<f64>,
}

impl ContentSnapshot {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// 评估上下文 - 快照及其 JSON 视图，每次评估只序列化一次
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    snapshot: ContentSnapshot,
    data: Value,
}

impl EvaluationContext {
    /// 从任意 JSON 创建，无法映射为快照的字段仍可按路径读取
    pub fn new(data: Value) -> Self {
        let snapshot = serde_json::from_value(data.clone()).unwrap_or_default();
        Self { snapshot, data }
    }

    pub fn from_snapshot(snapshot: &ContentSnapshot) -> Result<Self> {
        Ok(Self {
            snapshot: snapshot.clone(),
            data: serde_json::to_value(snapshot)?,
        })
    }

    pub fn snapshot(&self) -> &ContentSnapshot {
        &self.snapshot
    }

    /// 获取字段值（点号分隔路径，数组支持数字下标）
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        let mut current = &self.data;

        for part in path.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(part)?;
                }
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }

        Some(current)
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}
