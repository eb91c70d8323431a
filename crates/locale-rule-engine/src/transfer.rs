//! 规则导出与导入
//!
//! 导出包为 camelCase JSON：`{version, exportedAt, count, rules, versions?, abTests?}`。
//! 导入时逐条处理，单条失败只记录到报告中，不中断整个导入。

use crate::condition::ConditionEvaluator;
use crate::error::{Result, RuleError};
use crate::experiment::{validate_variant_overlays, ABTest, ExperimentStore};
use crate::models::{Rule, RuleDraft, RuleFilter, RulePatch, RuleVersion, VersionChange};
use crate::store::{build_rule, RuleStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

/// 导出包格式版本
pub const EXPORT_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    #[serde(default)]
    pub include_versions: bool,
    #[serde(default)]
    pub include_ab_tests: bool,
    #[serde(default)]
    pub include_deleted: bool,
}

impl ExportOptions {
    /// 完整备份：包含历史、实验和已删除规则
    pub fn full() -> Self {
        Self {
            include_versions: true,
            include_ab_tests: true,
            include_deleted: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    /// 覆盖已存在的规则
    #[serde(default)]
    pub overwrite: bool,
}

/// 导出结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub count: usize,
    pub rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<BTreeMap<String, Vec<RuleVersion>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_tests: Option<Vec<ABTest>>,
}

impl RuleExport {
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 待导入的数据包，规则保持原始 JSON 以便逐条报告解析错误
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBundle {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub ab_tests: Vec<Value>,
}

impl ImportBundle {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_rules(rules: Vec<Value>) -> Self {
        Self {
            version: Some(EXPORT_FORMAT_VERSION.to_string()),
            rules,
            ab_tests: Vec::new(),
        }
    }
}

impl From<RuleExport> for ImportBundle {
    fn from(export: RuleExport) -> Self {
        Self {
            version: Some(export.version),
            rules: export
                .rules
                .iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect(),
            ab_tests: export
                .ab_tests
                .unwrap_or_default()
                .iter()
                .filter_map(|t| serde_json::to_value(t).ok())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportError {
    pub rule_id: String,
    pub error: String,
}

/// 导入报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    #[serde(default)]
    pub ab_tests_imported: usize,
    pub errors: Vec<ImportError>,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn fail(&mut self, id: impl Into<String>, error: impl ToString) {
        self.errors.push(ImportError {
            rule_id: id.into(),
            error: error.to_string(),
        });
    }
}

const UNKNOWN_ID: &str = "<unknown>";

fn id_of(value: &Value) -> String {
    value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_ID)
        .to_string()
}

/// 导出规则
pub fn export_rules(
    rules: &RuleStore,
    experiments: &ExperimentStore,
    options: ExportOptions,
) -> RuleExport {
    let mut filter = RuleFilter::new();
    if options.include_deleted {
        filter = filter.include_deleted();
    }
    let exported = rules.get_all(&filter);

    let versions = options.include_versions.then(|| {
        let mut all = rules.all_versions();
        if !options.include_deleted {
            all.retain(|id, _| exported.iter().any(|r| &r.id == id));
        }
        all
    });

    RuleExport {
        version: EXPORT_FORMAT_VERSION.to_string(),
        exported_at: Utc::now(),
        count: exported.len(),
        rules: exported,
        versions,
        ab_tests: options.include_ab_tests.then(|| experiments.list()),
    }
}

/// 导入规则和实验
#[instrument(skip_all, fields(rules = bundle.rules.len(), ab_tests = bundle.ab_tests.len()))]
pub fn import_rules(
    rules: &RuleStore,
    experiments: &ExperimentStore,
    evaluator: &dyn ConditionEvaluator,
    bundle: &ImportBundle,
    options: ImportOptions,
) -> ImportReport {
    let mut report = ImportReport::default();

    for value in &bundle.rules {
        let id = id_of(value);
        match import_one(rules, evaluator, value, options) {
            Ok(Outcome::Imported) => report.imported += 1,
            Ok(Outcome::Updated) => report.updated += 1,
            Ok(Outcome::Skipped) => report.skipped += 1,
            Err(e) => {
                warn!(rule_id = %id, error = %e, "规则导入失败");
                report.fail(id, e);
            }
        }
    }

    for value in &bundle.ab_tests {
        let id = id_of(value);
        let result = serde_json::from_value::<ABTest>(value.clone())
            .map_err(RuleError::from)
            .and_then(|test| {
                if experiments.get(&test.id).is_ok() {
                    return Ok(false);
                }
                let base = rules.get(&test.rule_id)?;
                validate_variant_overlays(&test.variants, &base, evaluator)?;
                experiments.import(test).map(|_| true)
            });
        match result {
            Ok(true) => report.ab_tests_imported += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                warn!(test_id = %id, error = %e, "实验导入失败");
                report.fail(id, e);
            }
        }
    }

    info!(
        imported = report.imported,
        updated = report.updated,
        skipped = report.skipped,
        ab_tests = report.ab_tests_imported,
        errors = report.errors.len(),
        "规则导入完成"
    );
    report
}

enum Outcome {
    Imported,
    Updated,
    Skipped,
}

fn import_one(
    rules: &RuleStore,
    evaluator: &dyn ConditionEvaluator,
    value: &Value,
    options: ImportOptions,
) -> Result<Outcome> {
    let draft: RuleDraft = serde_json::from_value(value.clone())?;
    if let Some(conditions) = &draft.conditions {
        evaluator.validate(conditions)?;
    }
    let deleted = value.get("deleted").and_then(Value::as_bool).unwrap_or(false);

    let exists = draft.id.as_deref().is_some_and(|id| rules.contains(id));
    if !exists {
        let rule = rules.create_with(draft, VersionChange::Imported)?;
        if deleted {
            rules.delete(&rule.id, true)?;
        }
        return Ok(Outcome::Imported);
    }

    if !options.overwrite {
        return Ok(Outcome::Skipped);
    }

    let incoming = build_rule(draft, Utc::now())?;
    let patch = RulePatch::from_rule(&incoming);
    rules.update_with(
        &incoming.id,
        |rule| {
            patch.apply_to(rule);
            rule.deleted = deleted;
            if !deleted {
                rule.deleted_at = None;
            } else if rule.deleted_at.is_none() {
                rule.deleted_at = Some(Utc::now());
            }
        },
        VersionChange::Imported,
        None,
    )?;
    Ok(Outcome::Updated)
}
