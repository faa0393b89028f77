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

use std::io::Write;

use qubesd::app;
use qubesd::commons::VmClass;
use qubesd::error::QubesError;
use qubesd::events::Emitter;
use qubesd::features::{self, FeatureValue};
use qubesd::property::{self, PropertyValue};
use qubesd::store;
use qubesd::vm;

use crate::test_helpers::{add_appvm, add_netvm, add_template, test_env};

#[test]
fn fresh_model_contains_the_administrative_qube() {
    let env = test_env();
    let app = env.app.borrow();
    let dom0 = app.domains.get(0).expect("dom0 must exist");
    assert_eq!(dom0.name, "dom0");
    assert_eq!(dom0.class, VmClass::AdminVM);
    assert_eq!(app.domains.len(), 1);
}

#[test]
fn qids_are_allocated_smallest_free() {
    let env = test_env();
    add_template(&env, "tpl");
    let a = add_appvm(&env, "a", "tpl");
    let b = add_appvm(&env, "b", "tpl");
    assert_eq!((a, b), (2, 3));

    app::del_vm(&mut env.app.borrow_mut(), a).unwrap();
    let c = add_appvm(&env, "c", "tpl");
    assert_eq!(c, 2, "freed qids are reused, smallest first");
}

#[test]
fn qid_zero_is_reserved() {
    let env = test_env();
    let first = add_template(&env, "tpl");
    assert_ne!(first, 0);

    let result = app::add_new_vm(
        &mut env.app.borrow_mut(),
        VmClass::AdminVM,
        "dom0bis",
        "black",
        None,
    );
    assert!(result.is_err());
}

#[test]
fn duplicate_names_are_rejected() {
    let env = test_env();
    add_template(&env, "tpl");
    add_appvm(&env, "work", "tpl");
    let result = app::add_new_vm(
        &mut env.app.borrow_mut(),
        VmClass::AppVM,
        "work",
        "red",
        Some("tpl"),
    );
    assert!(result.is_err());
}

#[test]
fn templates_do_not_take_templates() {
    let env = test_env();
    add_template(&env, "tpl");
    let result = app::add_new_vm(
        &mut env.app.borrow_mut(),
        VmClass::StandaloneVM,
        "solo",
        "red",
        Some("tpl"),
    );
    assert!(result.is_err());
}

#[test]
fn save_load_round_trip_preserves_the_model() {
    let env = test_env();
    add_template(&env, "tpl");
    let work = add_appvm(&env, "work", "tpl");
    let net = add_netvm(&env, "sys-net");
    let _ = net;

    {
        let mut app = env.app.borrow_mut();
        property::set(&mut app, Emitter::Vm(work), "memory", PropertyValue::Int(512 * 1024))
            .unwrap();
        property::set(
            &mut app,
            Emitter::Vm(work),
            "netvm",
            PropertyValue::Vm(Some("sys-net".to_owned())),
        )
        .unwrap();
        property::set(
            &mut app,
            Emitter::App,
            "default_template",
            PropertyValue::Vm(Some("tpl".to_owned())),
        )
        .unwrap();
        features::set(&mut app, work, "service.crond", FeatureValue::Bool(true)).unwrap();
        vm::add_tag(&mut app, work, "audited").unwrap();
        store::save(&mut app).unwrap();
    }

    let before = store::serialize(&env.app.borrow());
    {
        let mut app = env.app.borrow_mut();
        store::load(&mut app).unwrap();
    }
    let after = store::serialize(&env.app.borrow());
    assert_eq!(before, after, "load(save(model)) must compare equal");

    // spot-check a few things survived
    let app = env.app.borrow();
    let work = app.domains.get_by_name("work").unwrap();
    assert_eq!(work.features.get("service.crond").map(String::as_str), Some("1"));
    assert!(work.tags.contains("audited"));
    assert_eq!(
        property::get(&app, Emitter::Vm(work.qid), "netvm")
            .unwrap()
            .and_then(|v| v.as_vm().map(str::to_owned)),
        Some("sys-net".to_owned())
    );
}

#[test]
fn save_fails_on_outside_modification() {
    let env = test_env();
    add_template(&env, "tpl");
    store::save(&mut env.app.borrow_mut()).unwrap();

    let store_path = env.app.borrow().store_path.clone();
    let original = std::fs::read(&store_path).unwrap();

    // an out-of-process writer bumps the mtime
    std::thread::sleep(std::time::Duration::from_millis(20));
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&store_path)
            .unwrap();
        file.write_all(b"<!-- outside edit -->\n").unwrap();
        file.sync_all().unwrap();
    }
    let tampered = std::fs::read(&store_path).unwrap();

    add_appvm(&env, "work", "tpl");
    let result = store::save(&mut env.app.borrow_mut());
    assert!(
        matches!(result, Err(QubesError::StoreConflict { .. })),
        "expected a conflict, got {result:?}"
    );

    // and the file on disk was not replaced
    assert_eq!(std::fs::read(&store_path).unwrap(), tampered);
    assert_ne!(original, tampered);
}

#[test]
fn consecutive_saves_without_reload_succeed() {
    let env = test_env();
    add_template(&env, "tpl");
    store::save(&mut env.app.borrow_mut()).unwrap();
    add_appvm(&env, "work", "tpl");
    store::save(&mut env.app.borrow_mut()).unwrap();
}

#[test]
fn netvm_fixup_drops_stale_references() {
    let env = test_env();
    add_template(&env, "tpl");
    let work = add_appvm(&env, "work", "tpl");
    let net = app::add_new_vm(
        &mut env.app.borrow_mut(),
        VmClass::StandaloneVM,
        "sys-net",
        "green",
        None,
    )
    .unwrap();
    property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(net),
        "provides_network",
        PropertyValue::Bool(true),
    )
    .unwrap();
    property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(work),
        "netvm",
        PropertyValue::Vm(Some("sys-net".to_owned())),
    )
    .unwrap();
    store::save(&mut env.app.borrow_mut()).unwrap();

    // sabotage the store: flip the provider into a plain qube
    let store_path = env.app.borrow().store_path.clone();
    std::thread::sleep(std::time::Duration::from_millis(20));
    let text = std::fs::read_to_string(&store_path).unwrap();
    let text = text.replace(
        "<property name=\"provides_network\">True</property>",
        "<property name=\"provides_network\">False</property>",
    );
    std::fs::write(&store_path, text).unwrap();

    store::load(&mut env.app.borrow_mut()).unwrap();
    let app = env.app.borrow();
    let work = app.domains.get_by_name("work").unwrap();
    assert!(
        property::is_default(&app, Emitter::Vm(work.qid), "netvm").unwrap(),
        "a netvm reference to a non-provider must not survive load"
    );
}

#[test]
fn labels_in_use_cannot_be_removed() {
    let env = test_env();
    {
        let mut app = env.app.borrow_mut();
        app.add_label(9, "0x123456", "teal").unwrap();
    }
    app::add_new_vm(&mut env.app.borrow_mut(), VmClass::StandaloneVM, "solo", "teal", None)
        .unwrap();

    assert!(env.app.borrow_mut().remove_label("teal").is_err());
    assert!(env.app.borrow_mut().remove_label("red").is_err(), "built-ins are permanent");

    let solo = env.app.borrow().domains.get_by_name("solo").unwrap().qid;
    property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(solo),
        "label",
        PropertyValue::Label("red".to_owned()),
    )
    .unwrap();
    env.app.borrow_mut().remove_label("teal").unwrap();
}

#[test]
fn label_indices_below_nine_are_reserved() {
    let env = test_env();
    let mut app = env.app.borrow_mut();
    assert!(app.add_label(8, "0x123456", "custom").is_err());
    assert!(app.add_label(9, "0x123456", "custom").is_ok());
}
