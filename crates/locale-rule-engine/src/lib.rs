//! 本地化规则引擎
//!
//! 根据区域化规则评估页面内容快照，输出分类评分、综合评分和改进建议：
//! - 带版本历史的规则存储，支持导入导出
//! - 确定性的 A/B 实验分流
//! - 规则选择与加权评分
//! - 本地评分与外部建议评分的合并
//! - 规则生命周期事件订阅

pub mod advisory;
pub mod catalog;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod experiment;
pub mod maintenance;
pub mod merge;
pub mod models;
pub mod operators;
pub mod scoring;
pub mod selector;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod transfer;
pub mod version;

pub use advisory::{AdvisoryProvider, FileAdvisoryProvider};
pub use condition::{ConditionEvaluator, ConditionNode};
pub use config::{EngineConfig, ServiceConfig};
pub use error::{Result, RuleError};
pub use events::{EventKind, RuleEvent, SubscriberBus, Subscription};
pub use executor::StructuredConditionEvaluator;
pub use experiment::{assign_user_to_variant, ABTest, ABTestConfig, ExperimentStore, TestStatus, Variant};
pub use maintenance::{FileRuleSource, MaintenanceScheduler, RuleSource};
pub use merge::{MergeWeights, ResultMerger};
pub use models::{Priority, Rule, RuleActions, RuleCategory, RuleDraft, RuleFilter, RulePatch, RuleVersion};
pub use operators::{LogicalOperator, Operator};
pub use scoring::{CategoryScore, CrossBorderMode, ScoreResult, ScoringEngine};
pub use selector::{RuleSelector, SelectionContext};
pub use service::LocalizationRuleService;
pub use snapshot::{ContentSnapshot, EvaluationContext};
pub use storage::{FileBackend, KeyValueBackend, MemoryBackend};
pub use store::RuleStore;
pub use transfer::{ExportOptions, ImportBundle, ImportOptions, ImportReport, RuleExport};
