//! 内置规则目录
//!
//! 覆盖五个规则分类的默认规则集，存储为空时用于初始化。

use crate::condition::ConditionNode;
use crate::error::Result;
use crate::models::{Priority, RuleActions, RuleCategory, RuleDraft};
use crate::operators::Operator;
use crate::store::RuleStore;
use serde_json::json;
use tracing::info;

const EU_REGIONS: [&str; 8] = ["DE", "AT", "FR", "IT", "ES", "NL", "BE", "IE"];
const EURO_REGIONS: [&str; 7] = ["DE", "AT", "FR", "IT", "ES", "NL", "BE"];
const GERMAN_REGIONS: [&str; 3] = ["DE", "AT", "CH"];

fn has_prices() -> ConditionNode {
    ConditionNode::field("ecommerce.prices", Operator::IsNotEmpty, json!(null))
}

fn actions(deduction: f64, message: &str, recommendation: &str) -> RuleActions {
    RuleActions {
        recommendation: Some(recommendation.to_string()),
        ..RuleActions::new(deduction, message)
    }
}

/// 返回内置默认规则
pub fn default_rules() -> Vec<RuleDraft> {
    vec![
        // 语言
        RuleDraft::new(RuleCategory::Language, "页面缺少 lang 属性")
            .with_id("lang-missing-attribute")
            .with_priority(Priority::High)
            .with_weight(15.0)
            .with_conditions(
                ConditionNode::field("lang", Operator::IsEmpty, json!(null)).to_value(),
            )
            .with_actions(actions(
                15.0,
                "页面未声明语言",
                "在 <html> 元素上设置与目标市场一致的 lang 属性",
            ))
            .with_tags(["seo", "accessibility"]),
        RuleDraft::new(RuleCategory::Language, "德语市场页面语言不匹配")
            .with_id("lang-mismatch-german")
            .with_priority(Priority::High)
            .with_weight(20.0)
            .with_conditions(
                ConditionNode::not(ConditionNode::field(
                    "lang",
                    Operator::StartsWith,
                    "de",
                ))
                .to_value(),
            )
            .with_actions(actions(
                20.0,
                "页面语言与德语市场不一致",
                "为德语区提供德语版本页面",
            ))
            .with_regions(GERMAN_REGIONS),
        RuleDraft::new(RuleCategory::Language, "按钮文案未本地化")
            .with_id("lang-untranslated-cta")
            .with_weight(10.0)
            .with_conditions(
                ConditionNode::field(
                    "buttons",
                    Operator::ContainsAny,
                    json!(["Buy now", "Add to cart", "Checkout", "Sign up"]),
                )
                .to_value(),
            )
            .with_actions(actions(
                10.0,
                "行动按钮仍为英文",
                "翻译所有行动按钮文案",
            ))
            .with_regions(GERMAN_REGIONS)
            .with_dynamic_weight("DE", 14.0),
        // 文化
        RuleDraft::new(RuleCategory::Culture, "欧元区未使用欧元标价")
            .with_id("culture-currency-euro")
            .with_priority(Priority::High)
            .with_weight(20.0)
            .with_conditions(
                ConditionNode::and(vec![
                    has_prices(),
                    ConditionNode::field("ecommerce.currency", Operator::Neq, "EUR"),
                ])
                .to_value(),
            )
            .with_actions(actions(
                20.0,
                "价格未以欧元显示",
                "以欧元显示价格并使用本地数字格式",
            ))
            .with_regions(EURO_REGIONS),
        RuleDraft::new(RuleCategory::Culture, "价格使用美元符号")
            .with_id("culture-dollar-prices")
            .with_weight(10.0)
            .with_conditions(
                ConditionNode::field("ecommerce.prices", Operator::AnyMatch, r"^\s*(US)?\$")
                    .to_value(),
            )
            .with_actions(actions(
                10.0,
                "价格使用美元符号",
                "使用目标市场习惯的货币符号和位置",
            ))
            .with_regions(EURO_REGIONS),
        // 合规
        RuleDraft::new(RuleCategory::Compliance, "缺少隐私政策链接")
            .with_id("compliance-de-privacy-policy")
            .with_priority(Priority::Critical)
            .with_weight(25.0)
            .with_conditions(
                ConditionNode::field("legal.privacyPolicyUrl", Operator::IsEmpty, json!(null))
                    .to_value(),
            )
            .with_actions(actions(
                25.0,
                "缺少隐私政策链接",
                "按 GDPR 要求在页面显著位置提供隐私政策（Datenschutzerklärung）",
            ))
            .with_regions(["DE"])
            .with_tags(["gdpr"]),
        RuleDraft::new(RuleCategory::Compliance, "缺少 Impressum")
            .with_id("compliance-imprint")
            .with_priority(Priority::High)
            .with_weight(20.0)
            .with_conditions(
                ConditionNode::field("legal.imprintUrl", Operator::IsEmpty, json!(null))
                    .to_value(),
            )
            .with_actions(actions(
                20.0,
                "缺少 Impressum 链接",
                "提供包含公司信息的 Impressum 页面",
            ))
            .with_regions(["DE", "AT"]),
        RuleDraft::new(RuleCategory::Compliance, "缺少 Cookie 同意")
            .with_id("compliance-cookie-consent")
            .with_priority(Priority::Critical)
            .with_weight(20.0)
            .with_conditions(
                ConditionNode::field("legal.cookieConsent", Operator::Eq, false).to_value(),
            )
            .with_actions(actions(
                20.0,
                "未获取 Cookie 同意",
                "在设置非必要 Cookie 前展示同意横幅",
            ))
            .with_regions(EU_REGIONS)
            .with_tags(["gdpr"]),
        RuleDraft::new(RuleCategory::Compliance, "表单缺少同意勾选")
            .with_id("compliance-form-consent")
            .with_weight(15.0)
            .with_conditions(
                ConditionNode::and(vec![
                    ConditionNode::field("forms.fields", Operator::IsNotEmpty, json!(null)),
                    ConditionNode::field("forms.hasConsentCheckbox", Operator::Eq, false),
                ])
                .to_value(),
            )
            .with_actions(actions(
                15.0,
                "收集个人数据的表单缺少同意勾选",
                "为表单增加明确的数据处理同意选项",
            ))
            .with_regions(EU_REGIONS),
        RuleDraft::new(RuleCategory::Compliance, "缺少含税说明")
            .with_id("compliance-tax-info")
            .with_priority(Priority::Low)
            .with_weight(10.0)
            .with_conditions(
                ConditionNode::and(vec![
                    has_prices(),
                    ConditionNode::field("ecommerce.hasTaxInfo", Operator::Eq, false),
                ])
                .to_value(),
            )
            .with_actions(actions(
                10.0,
                "价格未注明是否含税",
                "在价格旁注明含增值税（inkl. MwSt.）",
            ))
            .with_regions(["DE", "AT"]),
        // 用户体验
        RuleDraft::new(RuleCategory::UserExperience, "图片缺少替代文本")
            .with_id("ux-image-alt")
            .with_weight(10.0)
            .with_conditions(
                ConditionNode::field("images", Operator::AnyMissing, "alt").to_value(),
            )
            .with_actions(actions(
                10.0,
                "部分图片缺少 alt 文本",
                "为所有内容图片提供本地化的 alt 文本",
            ))
            .with_tags(["accessibility"]),
        RuleDraft::new(RuleCategory::UserExperience, "页面加载缓慢")
            .with_id("ux-slow-load")
            .with_priority(Priority::High)
            .with_weight(15.0)
            .with_conditions(
                ConditionNode::field("performance.loadTimeMs", Operator::Gt, 3000).to_value(),
            )
            .with_actions(actions(
                15.0,
                "页面加载时间超过 3 秒",
                "在目标市场部署 CDN 节点并压缩静态资源",
            )),
        RuleDraft::new(RuleCategory::UserExperience, "页面缺少标题")
            .with_id("ux-missing-title")
            .with_priority(Priority::Low)
            .with_weight(5.0)
            .with_conditions(
                ConditionNode::field("title", Operator::IsEmpty, json!(null)).to_value(),
            )
            .with_actions(actions(
                10.0,
                "页面缺少标题",
                "设置本地化的页面标题",
            )),
        // 跨境
        RuleDraft::new(RuleCategory::CrossBorder, "缺少本地支付方式")
            .with_id("cross-border-local-payment")
            .with_priority(Priority::High)
            .with_weight(15.0)
            .with_conditions(
                ConditionNode::and(vec![
                    has_prices(),
                    ConditionNode::not(ConditionNode::field(
                        "ecommerce.paymentMethods",
                        Operator::ContainsAny,
                        json!(["SEPA", "Klarna", "Sofort", "giropay", "PayPal"]),
                    )),
                ])
                .to_value(),
            )
            .with_actions(actions(
                15.0,
                "未提供本地常用支付方式",
                "接入 SEPA、Klarna 或 PayPal 等本地支付方式",
            ))
            .with_regions(GERMAN_REGIONS),
        RuleDraft::new(RuleCategory::CrossBorder, "缺少配送范围说明")
            .with_id("cross-border-shipping")
            .with_weight(10.0)
            .with_conditions(
                ConditionNode::and(vec![
                    has_prices(),
                    ConditionNode::field("ecommerce.shippingRegions", Operator::IsEmpty, json!(null)),
                ])
                .to_value(),
            )
            .with_actions(
                actions(
                    10.0,
                    "未说明配送国家和地区",
                    "列出支持的配送国家、运费和时效",
                )
                .with_target(RuleCategory::Culture),
            ),
    ]
}

/// 存储为空时写入内置规则，返回写入数量
pub fn seed_defaults(store: &RuleStore) -> Result<usize> {
    if !store.is_empty() {
        return Ok(0);
    }

    let mut count = 0;
    for draft in default_rules() {
        store.create(draft)?;
        count += 1;
    }
    info!(count, "内置规则已写入");
    Ok(count)
}
