//! 本地化规则引擎集成测试
//!
//! 测试规则管理、实验分流、评分和导入导出的完整工作流。

use locale_rules::catalog::seed_defaults;
use locale_rules::snapshot::LegalInfo;
use locale_rules::store::RuleStoreOptions;
use locale_rules::{
    assign_user_to_variant, ABTestConfig, ContentSnapshot, EventKind, ExportOptions,
    ImportBundle, ImportOptions, LocalizationRuleService, MemoryBackend, Operator, RuleActions,
    RuleCategory, RuleDraft, RuleEvent, RuleFilter, RulePatch, RuleStore, SubscriberBus, Variant,
    ConditionNode,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// 德国电商页面：缺少隐私政策链接
fn create_de_snapshot() -> ContentSnapshot {
    ContentSnapshot::from_json(
        r#"{
            "url": "https://shop.example.de",
            "title": "Sommerangebote",
            "lang": "de",
            "headings": ["Willkommen"],
            "buttons": ["In den Warenkorb"],
            "images": [{"src": "/hero.jpg", "alt": "Sommer"}],
            "legal": {"imprintUrl": "/impressum", "cookieConsent": true},
            "ecommerce": {"currency": "EUR", "prices": ["19,99 €"], "paymentMethods": ["PayPal"], "hasTaxInfo": true, "shippingRegions": ["DE"]},
            "performance": {"loadTimeMs": 1200}
        }"#,
    )
    .unwrap()
}

fn privacy_rule() -> RuleDraft {
    RuleDraft::new(RuleCategory::Compliance, "缺少隐私政策")
        .with_id("privacy-policy")
        .with_weight(25.0)
        .with_conditions(
            ConditionNode::field("legal.privacyPolicyUrl", Operator::IsEmpty, json!(null))
                .to_value(),
        )
        .with_actions(RuleActions::new(25.0, "缺少隐私政策链接"))
        .with_regions(["DE"])
}

fn always_rule(id: &str, category: RuleCategory, deduction: f64) -> RuleDraft {
    RuleDraft::new(category, id)
        .with_id(id)
        .with_conditions(ConditionNode::field("url", Operator::IsNotEmpty, json!(null)).to_value())
        .with_actions(RuleActions::new(deduction, format!("{} 触发", id)))
}

#[test]
fn test_region_scoped_rule_never_fires_elsewhere() {
    let service = LocalizationRuleService::in_memory();
    service
        .create_rule(always_rule("eu-only", RuleCategory::Language, 40.0).with_regions(["DE", "FR"]))
        .unwrap();

    let result = service.evaluate(&create_de_snapshot(), "CN", None);
    assert_eq!(result.score_of(RuleCategory::Language), Some(100.0));
    assert_eq!(result.overall_score, 100.0);
    assert_eq!(result.rules_evaluated, 0);

    let result = service.evaluate(&create_de_snapshot(), "fr", None);
    assert_eq!(result.score_of(RuleCategory::Language), Some(60.0));
}

#[test]
fn test_compliance_deduction_for_missing_privacy_policy() {
    let service = LocalizationRuleService::in_memory();
    service.create_rule(privacy_rule()).unwrap();

    let result = service.evaluate(&create_de_snapshot(), "DE", None);
    let compliance = result.category(RuleCategory::Compliance).unwrap();
    assert_eq!(compliance.score, 75.0);
    assert_eq!(compliance.issues, vec!["缺少隐私政策链接".to_string()]);
    // 0.25 * 75 + 0.75 * 100 = 93.75
    assert_eq!(result.overall_score, 94.0);
    assert_eq!(result.recommendations.len(), 1);

    let mut compliant = create_de_snapshot();
    compliant.legal = LegalInfo {
        privacy_policy_url: Some("/datenschutz".to_string()),
        ..compliant.legal
    };
    let result = service.evaluate(&compliant, "DE", None);
    assert_eq!(result.score_of(RuleCategory::Compliance), Some(100.0));
}

#[test]
fn test_traffic_split_distribution() {
    let service = LocalizationRuleService::in_memory();
    service.create_rule(privacy_rule()).unwrap();

    let test = service
        .create_ab_test(
            ABTestConfig::new("privacy-policy", "扣分力度")
                .with_variant(Variant::control("A"), 60.0)
                .with_variant(
                    Variant::new(
                        "B",
                        RulePatch {
                            weight: Some(40.0),
                            ..Default::default()
                        },
                    ),
                    40.0,
                ),
        )
        .unwrap();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for i in 0..10_000 {
        let variant = assign_user_to_variant(&format!("user-{}", i), &test).unwrap();
        *counts.entry(variant.name.clone()).or_default() += 1;
    }

    let a = counts.get("A").copied().unwrap_or_default();
    assert!((5700..=6300).contains(&a), "variant A assigned {} times", a);
    assert_eq!(a + counts.get("B").copied().unwrap_or_default(), 10_000);

    // 分流结果可重复
    let first = assign_user_to_variant("user-42", &test).unwrap().name.clone();
    for _ in 0..10 {
        assert_eq!(assign_user_to_variant("user-42", &test).unwrap().name, first);
    }
}

#[test]
fn test_soft_delete_keeps_history() {
    let service = LocalizationRuleService::in_memory();
    service.create_rule(privacy_rule()).unwrap();
    service
        .update_rule(
            "privacy-policy",
            RulePatch {
                weight: Some(30.0),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(
        service.evaluate(&create_de_snapshot(), "DE", None).score_of(RuleCategory::Compliance),
        Some(75.0)
    );

    assert!(service.delete_rule("privacy-policy", true).unwrap());

    assert!(service.list_rules(&RuleFilter::new()).is_empty());
    assert_eq!(service.list_rules(&RuleFilter::new().include_deleted()).len(), 1);
    assert_eq!(
        service.evaluate(&create_de_snapshot(), "DE", None).score_of(RuleCategory::Compliance),
        Some(100.0)
    );
    assert_eq!(service.get_rule_versions("privacy-policy").unwrap().len(), 2);
}

#[test]
fn test_version_history_is_capped() {
    let store = RuleStore::open(
        Arc::new(MemoryBackend::new()),
        SubscriberBus::new(),
        RuleStoreOptions {
            max_version_history: 3,
            enable_versioning: true,
        },
    )
    .unwrap();
    store.create(privacy_rule()).unwrap();

    for i in 1..=5 {
        let rule = store
            .update(
                "privacy-policy",
                RulePatch {
                    weight: Some(10.0 + i as f64),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rule.version, format!("1.0.{}", i));
    }

    let versions: Vec<String> = store
        .get_versions("privacy-policy")
        .unwrap()
        .into_iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(versions, vec!["1.0.3", "1.0.4", "1.0.5"]);
}

#[test]
fn test_restore_creates_new_version() {
    let service = LocalizationRuleService::in_memory();
    service.create_rule(privacy_rule()).unwrap();
    service
        .update_rule(
            "privacy-policy",
            RulePatch {
                weight: Some(50.0),
                ..Default::default()
            },
        )
        .unwrap();

    let restored = service.restore_rule_version("privacy-policy", "1.0.0").unwrap();
    assert_eq!(restored.weight, 25.0);
    assert_eq!(restored.version, "1.0.2");
    assert_eq!(service.get_rule_versions("privacy-policy").unwrap().len(), 3);

    let err = service.restore_rule_version("privacy-policy", "9.9.9").unwrap_err();
    assert_eq!(err.code(), "VERSION_NOT_FOUND");
}

#[test]
fn test_experiment_overlay_changes_score() {
    let service = LocalizationRuleService::in_memory();
    service.create_rule(privacy_rule()).unwrap();

    let stronger = RulePatch {
        actions: Some(RuleActions::new(40.0, "缺少隐私政策链接")),
        ..Default::default()
    };
    let test = service
        .create_ab_test(
            ABTestConfig::new("privacy-policy", "扣分力度")
                .with_variant(Variant::control("control"), 50.0)
                .with_variant(Variant::new("strict", stronger), 50.0),
        )
        .unwrap();

    let strict_user = (0..1000)
        .map(|i| format!("user-{}", i))
        .find(|uid| assign_user_to_variant(uid, &test).unwrap().name == "strict")
        .unwrap();

    let result = service.evaluate(&create_de_snapshot(), "DE", Some(&strict_user));
    assert_eq!(result.score_of(RuleCategory::Compliance), Some(60.0));

    // 无用户时不参与实验
    let result = service.evaluate(&create_de_snapshot(), "DE", None);
    assert_eq!(result.score_of(RuleCategory::Compliance), Some(75.0));

    let metrics = service.ab_test_metrics(&test.id).unwrap();
    assert_eq!(metrics["strict"].impressions, 1);
    assert_eq!(metrics["control"].impressions, 0);
}

#[test]
fn test_overall_score_is_weighted_sum() {
    let service = LocalizationRuleService::in_memory();
    service
        .create_rule(always_rule("lang", RuleCategory::Language, 30.0))
        .unwrap();
    service
        .create_rule(always_rule("culture", RuleCategory::Culture, 15.0))
        .unwrap();
    service
        .create_rule(always_rule("ux-1", RuleCategory::UserExperience, 70.0))
        .unwrap();
    service
        .create_rule(always_rule("ux-2", RuleCategory::UserExperience, 70.0))
        .unwrap();

    let result = service.evaluate(&create_de_snapshot(), "DE", None);
    for score in result.categories.values() {
        assert!((0.0..=100.0).contains(&score.score));
    }
    assert_eq!(result.score_of(RuleCategory::UserExperience), Some(0.0));
    // 0.30*70 + 0.25*85 + 0.25*100 + 0.20*0 = 67.25
    assert_eq!(result.overall_score, 67.0);
}

#[test]
fn test_export_import_round_trip() {
    let source = LocalizationRuleService::in_memory();
    seed_defaults(source.rules()).unwrap();
    source.create_rule(privacy_rule().with_id("to-delete")).unwrap();
    source.delete_rule("to-delete", true).unwrap();
    source
        .create_ab_test(
            ABTestConfig::new("ux-slow-load", "阈值")
                .with_variant(Variant::control("A"), 50.0)
                .with_variant(Variant::control("B"), 50.0),
        )
        .unwrap();

    let export = source.export_rules(ExportOptions::full());
    let json = export.to_json_pretty().unwrap();

    let target = LocalizationRuleService::in_memory();
    let bundle = ImportBundle::from_json(&json).unwrap();
    let report = target.import_rules(&bundle, ImportOptions::default());

    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.imported, export.count);
    assert_eq!(report.ab_tests_imported, 1);
    assert!(target.get_rule("to-delete").unwrap().deleted);

    for rule in source.list_rules(&RuleFilter::new()) {
        let imported = target.get_rule(&rule.id).unwrap();
        assert_eq!(imported.name, rule.name);
        assert_eq!(imported.conditions, rule.conditions);
        assert_eq!(imported.weight, rule.weight);
    }

    // 再次导入且不覆盖时全部跳过
    let report = target.import_rules(&bundle, ImportOptions::default());
    assert_eq!(report.imported, 0);
    assert_eq!(report.skipped, export.count + 1);
}

#[test]
fn test_export_import_with_overwrite_into_empty_store() {
    let source = LocalizationRuleService::in_memory();
    seed_defaults(source.rules()).unwrap();
    source.create_rule(privacy_rule().with_id("to-delete")).unwrap();
    source.delete_rule("to-delete", true).unwrap();

    let export = source.export_rules(ExportOptions::full());
    let bundle = ImportBundle::from_json(&export.to_json_pretty().unwrap()).unwrap();

    let target = LocalizationRuleService::in_memory();
    let overwrite = ImportOptions { overwrite: true };
    let report = target.import_rules(&bundle, overwrite);

    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.imported, export.count);
    assert_eq!(report.updated, 0);

    let filter = RuleFilter {
        include_deleted: true,
        ..RuleFilter::new()
    };
    for rule in source.list_rules(&filter) {
        let imported = target.get_rule(&rule.id).unwrap();
        assert_eq!(imported.category, rule.category);
        assert_eq!(imported.name, rule.name);
        assert_eq!(imported.conditions, rule.conditions);
        assert_eq!(imported.actions, rule.actions);
        assert_eq!(imported.regions, rule.regions);
        assert_eq!(imported.weight, rule.weight);
        assert_eq!(imported.deleted, rule.deleted);
    }

    // 再次覆盖导入时全部更新，内容保持不变
    let report = target.import_rules(&bundle, overwrite);
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.updated, export.count);
    assert_eq!(
        target.get_rule("compliance-de-privacy-policy").unwrap().actions,
        source.get_rule("compliance-de-privacy-policy").unwrap().actions
    );
}

#[test]
fn test_import_collects_errors() {
    let service = LocalizationRuleService::in_memory();
    let bundle = ImportBundle::from_rules(vec![
        json!({"id": "ok", "category": "culture", "name": "ok", "actions": {"scoring": {"deduction": 5}, "message": "m"}}),
        json!({"id": "bad-category", "category": "weather", "name": "bad"}),
        json!({"id": "bad-weight", "category": "culture", "name": "bad", "weight": 0}),
    ]);

    let report = service.import_rules(&bundle, ImportOptions::default());
    assert_eq!(report.imported, 1);
    assert_eq!(report.errors.len(), 2);
    assert_eq!(report.errors[0].rule_id, "bad-category");
}

#[test]
fn test_lifecycle_events() {
    let service = LocalizationRuleService::in_memory();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    let _updated = service.subscribe(EventKind::RuleUpdated, move |event| {
        if let RuleEvent::RuleUpdated { rule, previous } = event {
            log.lock()
                .unwrap()
                .push(format!("{}->{}", previous.version, rule.version));
        }
        Ok(())
    });
    let log = Arc::clone(&seen);
    let _deleted = service.subscribe(EventKind::RuleDeleted, move |event| {
        if let RuleEvent::RuleDeleted { rule_id, soft, .. } = event {
            log.lock().unwrap().push(format!("deleted {} soft={}", rule_id, soft));
        }
        Ok(())
    });
    // 出错的订阅者不影响其他订阅者和写操作
    let _failing = service.subscribe(EventKind::RuleUpdated, |_| anyhow::bail!("boom"));

    service.create_rule(privacy_rule()).unwrap();
    service
        .update_rule(
            "privacy-policy",
            RulePatch {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    service.delete_rule("privacy-policy", false).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "1.0.0->1.0.1".to_string(),
            "deleted privacy-policy soft=false".to_string()
        ]
    );
    assert!(service.get_rule("privacy-policy").is_err());
}

#[test]
fn test_builtin_catalog_on_german_page() {
    let service = LocalizationRuleService::in_memory();
    seed_defaults(service.rules()).unwrap();

    let result = service.evaluate(&create_de_snapshot(), "DE", None);
    // 仅缺少隐私政策链接
    assert_eq!(result.score_of(RuleCategory::Compliance), Some(75.0));
    assert_eq!(result.score_of(RuleCategory::Language), Some(100.0));
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.rule_id == "compliance-de-privacy-policy"));
}
