// Copyright (C) 2023-2025 Qubesd Core Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use proptest::prelude::*;
use qubesd::policy::{Action, DomainInfo, Policy, PolicyRule, SystemInfo};

fn arb_vm_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,8}").unwrap()
}

fn arb_tag() -> impl Strategy<Value = String> {
    prop_oneof![Just("t1".to_owned()), Just("t2".to_owned()), Just("work".to_owned())]
}

fn arb_spec(for_target: bool) -> impl Strategy<Value = String> {
    let common = prop_oneof![
        arb_vm_name(),
        Just("$anyvm".to_owned()),
        Just("$adminvm".to_owned()),
        arb_tag().prop_map(|t| format!("$tag:{t}")),
        prop_oneof![
            Just("AppVM".to_owned()),
            Just("StandaloneVM".to_owned()),
            Just("TemplateVM".to_owned())
        ]
        .prop_map(|c| format!("$type:{c}")),
    ];
    if for_target {
        prop_oneof![
            common,
            Just("$default".to_owned()),
            Just("$dispvm".to_owned()),
            arb_vm_name().prop_map(|n| format!("$dispvm:{n}")),
        ]
        .boxed()
    } else {
        common.boxed()
    }
}

fn arb_action() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("allow".to_owned()),
        Just("deny".to_owned()),
        Just("ask".to_owned()),
        Just("ask,default_target=work1".to_owned()),
        Just("allow,user=root".to_owned()),
    ]
}

fn arb_rule_line() -> impl Strategy<Value = String> {
    (arb_spec(false), arb_spec(true), arb_action()).prop_filter_map(
        "skip combinations the parser rejects",
        |(source, target, action)| {
            let line = format!("{source} {target} {action}");
            PolicyRule::parse(&line, "prop", 1).ok().map(|_| line)
        },
    )
}

fn fixed_system_info() -> SystemInfo {
    let mut domains = BTreeMap::new();
    let mut insert = |name: &str, class: &str, tags: &[&str], dispvm_allowed: bool| {
        domains.insert(
            name.to_owned(),
            DomainInfo {
                tags: tags.iter().map(|t| (*t).to_owned()).collect(),
                class: class.to_owned(),
                dispvm_allowed,
                default_dispvm: Some("dvm-base".to_owned()),
                icon: "appvm-red".to_owned(),
            },
        );
    };
    insert("dom0", "AdminVM", &[], false);
    insert("work1", "AppVM", &["t1", "work"], false);
    insert("work2", "AppVM", &["t2"], false);
    insert("solo", "StandaloneVM", &["t1"], false);
    insert("tpl", "TemplateVM", &[], false);
    insert("dvm-base", "AppVM", &["work"], true);
    SystemInfo { domains }
}

fn decision(policy: &Policy, info: &SystemInfo, source: &str, target: &str) -> String {
    match policy.evaluate(info, source, target) {
        Ok(action) => format!(
            "{:?} target={:?} ask={:?}",
            action.action, action.target, action.targets_for_ask
        ),
        Err(error) => format!("denied ({})", error.wire_name()),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Re-serializing a parsed rule list and parsing it again yields the
    /// same rules.
    #[test]
    fn reparse_round_trip(lines in prop::collection::vec(arb_rule_line(), 1..8)) {
        let rules: Vec<PolicyRule> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| PolicyRule::parse(line, "prop", i + 1).unwrap())
            .collect();

        let reparsed: Vec<PolicyRule> = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| PolicyRule::parse(&rule.to_line(), "prop", i + 1).unwrap())
            .collect();

        prop_assert_eq!(&rules, &reparsed);
        for (rule, again) in rules.iter().zip(&reparsed) {
            prop_assert_eq!(rule.to_line(), again.to_line());
        }
    }

    /// Replacing a `$tag:T` rule with the union of the concrete rules it
    /// expands to gives an equivalent decision for every (source, target).
    #[test]
    fn tag_rules_equal_their_expansion(
        tag in arb_tag(),
        action in prop_oneof![Just("allow"), Just("deny")],
        suffix in arb_rule_line(),
    ) {
        let info = fixed_system_info();

        let tagged = Policy {
            service: "prop.Service".to_owned(),
            rules: vec![
                PolicyRule::parse(&format!("$anyvm $tag:{tag} {action}"), "prop", 1).unwrap(),
                PolicyRule::parse(&suffix, "prop", 2).unwrap(),
            ],
        };

        // the concrete equivalent: one rule per qube carrying the tag
        let mut expanded_rules = Vec::new();
        for (name, domain) in &info.domains {
            if domain.tags.iter().any(|t| *t == tag) {
                expanded_rules.push(
                    PolicyRule::parse(&format!("$anyvm {name} {action}"), "prop", 1).unwrap(),
                );
            }
        }
        expanded_rules.push(PolicyRule::parse(&suffix, "prop", 2).unwrap());
        let expanded = Policy {
            service: "prop.Service".to_owned(),
            rules: expanded_rules,
        };

        for source in info.domains.keys() {
            if source == "dom0" {
                continue;
            }
            for target in info.domains.keys() {
                let lhs = decision(&tagged, &info, source, target);
                let rhs = decision(&expanded, &info, source, target);
                prop_assert_eq!(
                    lhs,
                    rhs,
                    "source={} target={} tag={} action={}",
                    source,
                    target,
                    tag,
                    action
                );
            }
        }
    }
}
