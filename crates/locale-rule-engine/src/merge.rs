//! 本地评分与外部建议评分的合并

use crate::error::{Result, RuleError};
use crate::models::RuleCategory;
use crate::scoring::{compute_overall, CategoryScore, ScoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// 合并权重
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeWeights {
    pub local: f64,
    pub external: f64,
}

impl Default for MergeWeights {
    fn default() -> Self {
        Self {
            local: 0.4,
            external: 0.6,
        }
    }
}

impl MergeWeights {
    pub fn new(local: f64, external: f64) -> Result<Self> {
        let weights = Self { local, external };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<()> {
        let valid = |w: f64| w.is_finite() && w >= 0.0;
        if !valid(self.local) || !valid(self.external) || self.local + self.external <= 0.0 {
            return Err(RuleError::Validation(format!(
                "合并权重无效: local={}, external={}",
                self.local, self.external
            )));
        }
        Ok(())
    }
}

/// 结果合并器
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultMerger {
    weights: MergeWeights,
}

impl ResultMerger {
    pub fn new(weights: MergeWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> MergeWeights {
        self.weights
    }

    /// 合并本地与外部结果；外部结果缺失时原样返回本地结果
    pub fn merge(&self, local: ScoreResult, external: Option<&ScoreResult>) -> ScoreResult {
        let Some(external) = external else {
            return local;
        };

        let categories: BTreeSet<RuleCategory> = local
            .categories
            .keys()
            .chain(external.categories.keys())
            .copied()
            .collect();

        let mut merged_categories = BTreeMap::new();
        for category in categories {
            let merged = match (local.categories.get(&category), external.categories.get(&category)) {
                (Some(l), Some(e)) => CategoryScore {
                    score: self.blend(l.score, e.score),
                    issues: dedup(l.issues.iter().chain(e.issues.iter())),
                },
                (Some(only), None) | (None, Some(only)) => CategoryScore {
                    score: only.score,
                    issues: dedup(only.issues.iter()),
                },
                (None, None) => continue,
            };
            merged_categories.insert(category, merged);
        }

        let overall_score = compute_overall(&merged_categories);
        debug!(
            local = local.overall_score,
            external = external.overall_score,
            merged = overall_score,
            "评分结果已合并"
        );

        ScoreResult {
            categories: merged_categories,
            overall_score,
            ai_enhanced: true,
            ai_suggestions: dedup(external.ai_suggestions.iter()),
            ..local
        }
    }

    fn blend(&self, local: f64, external: f64) -> f64 {
        (local * self.weights.local + external * self.weights.external)
            .round()
            .clamp(0.0, 100.0)
    }
}

/// 去除完全相同的字符串，保留首次出现的顺序
fn dedup<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}
