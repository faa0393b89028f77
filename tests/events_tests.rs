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

mod test_helpers;

use std::cell::RefCell;
use std::rc::Rc;

use qubesd::events::{self, Emitter, EventArgs, SubscriberScope};
use qubesd::features::{self, FeatureValue};
use qubesd::property::{self, PropertyValue};
use qubesd::vm;

use crate::test_helpers::{add_appvm, add_netvm, add_template, test_env};

fn record_events(
    env: &test_helpers::TestEnv,
    scope: SubscriberScope,
) -> Rc<RefCell<Vec<(String, String)>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink_seen = Rc::clone(&seen);
    env.app.borrow_mut().add_subscription(
        scope,
        "*",
        Rc::new(move |subject, event, _args| {
            sink_seen
                .borrow_mut()
                .push((subject.to_owned(), event.to_owned()));
        }),
    );
    seen
}

#[test]
fn wildcard_subscription_sees_vm_events() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");

    let seen = record_events(&env, SubscriberScope::AnyVm);
    features::set(
        &mut env.app.borrow_mut(),
        vm,
        "service.x",
        FeatureValue::Bool(true),
    )
    .unwrap();

    let seen = seen.borrow();
    assert!(
        seen.iter()
            .any(|(subject, event)| subject == "work" && event == "domain-feature-set:service.x"),
        "expected the feature event, got {seen:?}"
    );
}

#[test]
fn subscription_scoped_to_one_qube_ignores_others() {
    let env = test_env();
    add_template(&env, "tpl");
    let work = add_appvm(&env, "work", "tpl");
    let personal = add_appvm(&env, "personal", "tpl");

    let seen = record_events(&env, SubscriberScope::Vm(work));
    features::set(
        &mut env.app.borrow_mut(),
        personal,
        "x",
        FeatureValue::Bool(true),
    )
    .unwrap();
    assert!(seen.borrow().is_empty());

    features::set(&mut env.app.borrow_mut(), work, "x", FeatureValue::Bool(true)).unwrap();
    assert_eq!(seen.borrow().len(), 1);
}

#[test]
fn app_events_have_empty_subject() {
    let env = test_env();
    let seen = record_events(&env, SubscriberScope::App);
    add_template(&env, "tpl");

    let seen = seen.borrow();
    assert!(
        seen.iter()
            .any(|(subject, event)| subject.is_empty() && event == "domain-add")
    );
}

#[test]
fn events_disabled_suppresses_dispatch() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");

    let seen = record_events(&env, SubscriberScope::AnyVm);
    env.app.borrow_mut().domains.get_mut(vm).unwrap().events_enabled = false;
    features::set(&mut env.app.borrow_mut(), vm, "x", FeatureValue::Bool(true)).unwrap();
    assert!(seen.borrow().is_empty());
}

#[test]
fn pre_event_veto_aborts_property_set() {
    let env = test_env();
    add_template(&env, "tpl");
    let work = add_appvm(&env, "work", "tpl");
    let other = add_appvm(&env, "other", "tpl");
    let _ = other;

    // "other" does not provide network, so the bound pre-set handler vetoes
    let result = property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(work),
        "netvm",
        PropertyValue::Vm(Some("other".to_owned())),
    );
    assert!(result.is_err());
    assert!(
        property::is_default(&env.app.borrow(), Emitter::Vm(work), "netvm").unwrap(),
        "the vetoed set must not leave a stored value behind"
    );
}

#[test]
fn netvm_loop_is_rejected() {
    let env = test_env();
    let net_a = add_netvm(&env, "sys-net");
    let net_b = add_netvm(&env, "sys-firewall");

    property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(net_b),
        "netvm",
        PropertyValue::Vm(Some("sys-net".to_owned())),
    )
    .unwrap();

    // sys-net -> sys-firewall would close the loop
    let result = property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(net_a),
        "netvm",
        PropertyValue::Vm(Some("sys-firewall".to_owned())),
    );
    assert!(result.is_err());

    // and so would pointing a qube at itself
    let result = property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(net_a),
        "netvm",
        PropertyValue::Vm(Some("sys-net".to_owned())),
    );
    assert!(result.is_err());
}

#[test]
fn tag_add_then_remove_leaves_no_trace() {
    let env = test_env();
    add_template(&env, "tpl");
    let work = add_appvm(&env, "work", "tpl");

    let before: Vec<String> = env.app.borrow().domains.get(work).unwrap().tags.iter().cloned().collect();
    let seen = record_events(&env, SubscriberScope::Vm(work));

    vm::add_tag(&mut env.app.borrow_mut(), work, "audited").unwrap();
    vm::remove_tag(&mut env.app.borrow_mut(), work, "audited").unwrap();

    let after: Vec<String> = env.app.borrow().domains.get(work).unwrap().tags.iter().cloned().collect();
    assert_eq!(before, after);

    let seen = seen.borrow();
    assert_eq!(
        seen.iter().map(|(_, e)| e.as_str()).collect::<Vec<_>>(),
        vec!["domain-tag-add:audited", "domain-tag-delete:audited"]
    );

    // adding the same tag twice fires only once
    drop(seen);
    vm::remove_tag(&mut env.app.borrow_mut(), work, "missing").unwrap_err();
}

#[test]
fn template_delete_with_dependents_is_vetoed() {
    let env = test_env();
    let tpl = add_template(&env, "tpl");
    add_appvm(&env, "work", "tpl");

    let result = qubesd::app::del_vm(&mut env.app.borrow_mut(), tpl);
    assert!(result.is_err());
    assert!(env.app.borrow().domains.get(tpl).is_some());
}

#[test]
fn deleting_a_netvm_resets_references() {
    let env = test_env();
    add_template(&env, "tpl");
    let net = add_netvm(&env, "sys-net");
    let work = add_appvm(&env, "work", "tpl");
    property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(work),
        "netvm",
        PropertyValue::Vm(Some("sys-net".to_owned())),
    )
    .unwrap();

    qubesd::app::del_vm(&mut env.app.borrow_mut(), net).unwrap();
    assert!(property::is_default(&env.app.borrow(), Emitter::Vm(work), "netvm").unwrap());
}

#[test]
fn fire_event_collects_handler_returns() {
    let env = test_env();
    // no bound handler matches this invented event; dispatch returns cleanly
    let returns = events::fire_event(
        &mut env.app.borrow_mut(),
        Emitter::App,
        "custom-event",
        &EventArgs::new().arg("key", "value"),
    )
    .unwrap();
    assert!(returns.is_empty());
}
