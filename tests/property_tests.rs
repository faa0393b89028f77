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

use qubesd::commons::{self, validate_name};
use qubesd::events::Emitter;
use qubesd::property::{self, PropertyValue, SetValue};

use crate::test_helpers::{add_appvm, add_template, test_env};

#[test]
fn set_then_get_returns_the_value() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");
    let holder = Emitter::Vm(vm);

    for (name, value) in [
        ("memory", PropertyValue::Int(500 * 1024)),
        ("kernelopts", PropertyValue::Str("console=hvc0".to_owned())),
        ("debug", PropertyValue::Bool(true)),
        ("default_user", PropertyValue::Str("operator".to_owned())),
    ] {
        property::set(&mut env.app.borrow_mut(), holder, name, value.clone()).unwrap();
        assert_eq!(
            property::get(&env.app.borrow(), holder, name).unwrap(),
            Some(value),
            "round-trip of {name}"
        );
        assert!(!property::is_default(&env.app.borrow(), holder, name).unwrap());
    }
}

#[test]
fn reset_restores_the_default() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");
    let holder = Emitter::Vm(vm);

    let default = property::get(&env.app.borrow(), holder, "qrexec_timeout").unwrap();
    property::set(&mut env.app.borrow_mut(), holder, "qrexec_timeout", PropertyValue::Int(120))
        .unwrap();
    property::reset(&mut env.app.borrow_mut(), holder, "qrexec_timeout").unwrap();

    assert!(property::is_default(&env.app.borrow(), holder, "qrexec_timeout").unwrap());
    assert_eq!(
        property::get(&env.app.borrow(), holder, "qrexec_timeout").unwrap(),
        default
    );
}

#[test]
fn assigning_the_default_marker_is_a_delete() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");
    let holder = Emitter::Vm(vm);

    property::set(&mut env.app.borrow_mut(), holder, "debug", PropertyValue::Bool(true)).unwrap();
    property::assign(&mut env.app.borrow_mut(), holder, "debug", SetValue::Default).unwrap();
    assert!(property::is_default(&env.app.borrow(), holder, "debug").unwrap());
}

#[test]
fn identity_properties_cannot_be_set() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");
    let holder = Emitter::Vm(vm);

    for name in ["qid", "uuid", "name"] {
        let result = property::set(
            &mut env.app.borrow_mut(),
            holder,
            name,
            if name == "qid" {
                PropertyValue::Int(7)
            } else {
                PropertyValue::Str("whatever".to_owned())
            },
        );
        assert!(result.is_err(), "{name} must not be settable");
    }
}

#[test]
fn resource_shape_invariants_hold() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");
    let holder = Emitter::Vm(vm);

    // memory above the host total
    let too_much = test_helpers::HOST_MEMORY / 1024 + 1;
    assert!(
        property::set(&mut env.app.borrow_mut(), holder, "memory", PropertyValue::Int(too_much))
            .is_err()
    );

    // maxmem above ten times the initial memory
    property::set(&mut env.app.borrow_mut(), holder, "memory", PropertyValue::Int(400 * 1024))
        .unwrap();
    assert!(
        property::set(
            &mut env.app.borrow_mut(),
            holder,
            "maxmem",
            PropertyValue::Int(400 * 1024 * 10 + 1)
        )
        .is_err()
    );
    property::set(
        &mut env.app.borrow_mut(),
        holder,
        "maxmem",
        PropertyValue::Int(400 * 1024 * 10),
    )
    .unwrap();

    // vcpus outside [1, host cpus]
    assert!(
        property::set(&mut env.app.borrow_mut(), holder, "vcpus", PropertyValue::Int(0)).is_err()
    );
    assert!(
        property::set(
            &mut env.app.borrow_mut(),
            holder,
            "vcpus",
            PropertyValue::Int(test_helpers::HOST_CPUS as u64 + 1)
        )
        .is_err()
    );

    // qrexec_timeout must be positive
    assert!(
        property::set(&mut env.app.borrow_mut(), holder, "qrexec_timeout", PropertyValue::Int(0))
            .is_err()
    );
}

#[test]
fn vm_typed_property_enforces_class() {
    let env = test_env();
    add_template(&env, "tpl");
    add_appvm(&env, "work", "tpl");

    // default_template must point at a template
    let result = property::set(
        &mut env.app.borrow_mut(),
        Emitter::App,
        "default_template",
        PropertyValue::Vm(Some("work".to_owned())),
    );
    assert!(result.is_err());

    property::set(
        &mut env.app.borrow_mut(),
        Emitter::App,
        "default_template",
        PropertyValue::Vm(Some("tpl".to_owned())),
    )
    .unwrap();

    // nonexistent qubes are rejected outright
    let result = property::set(
        &mut env.app.borrow_mut(),
        Emitter::App,
        "default_netvm",
        PropertyValue::Vm(Some("missing".to_owned())),
    );
    assert!(result.is_err());
}

#[test]
fn null_is_rejected_unless_allowed() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");

    // netvm allows null
    property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(vm),
        "netvm",
        PropertyValue::Vm(None),
    )
    .unwrap();

    // template does not
    let result = property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(vm),
        "template",
        PropertyValue::Vm(None),
    );
    assert!(result.is_err());
}

#[test]
fn mac_addresses_are_validated_and_normalized() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");
    let holder = Emitter::Vm(vm);

    property::set(
        &mut env.app.borrow_mut(),
        holder,
        "mac",
        PropertyValue::Str("00:16:3E:AA:BB:CC".to_owned()),
    )
    .unwrap();
    assert_eq!(
        property::get(&env.app.borrow(), holder, "mac").unwrap(),
        Some(PropertyValue::Str("00:16:3e:aa:bb:cc".to_owned()))
    );

    assert!(
        property::set(
            &mut env.app.borrow_mut(),
            holder,
            "mac",
            PropertyValue::Str("not-a-mac".to_owned())
        )
        .is_err()
    );
}

#[test]
fn sanitize_rejects_hostile_payloads() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");
    let app = env.app.borrow();
    let def = property::get_def(&app, Emitter::Vm(vm), "kernelopts").unwrap();

    assert!(def.sanitize(b"quiet").is_ok());
    assert!(def.sanitize(b"quiet\nsplash").is_err());
    assert!(def.sanitize("zażółć".as_bytes()).is_err());

    let int_def = property::get_def(&app, Emitter::Vm(vm), "memory").unwrap();
    assert!(int_def.sanitize(b"400000").is_ok());
    assert!(int_def.sanitize(b"lots").is_err());
    assert!(int_def.sanitize(b"-1").is_err());

    let bool_def = property::get_def(&app, Emitter::Vm(vm), "debug").unwrap();
    assert!(bool_def.sanitize(b"True").is_ok());
    assert!(bool_def.sanitize(b"maybe").is_err());
}

#[test]
fn name_validation_boundaries() {
    assert!(validate_name(&"a".repeat(31)).is_ok());
    assert!(validate_name(&"a".repeat(32)).is_err());
    assert!(validate_name("1work").is_err());
    assert!(validate_name("lost+found").is_err());
    assert!(validate_name("").is_err());
    assert!(validate_name("work-vm_2").is_ok());
}

#[test]
fn label_color_validation() {
    assert!(commons::validate_label_color("0xcc0000").is_ok());
    assert!(commons::validate_label_color("cc0000").is_err());
    assert!(commons::validate_label_color("0xCC0000").is_err());
    assert!(commons::validate_label_color("0xcc00").is_err());
}

#[test]
fn maxmem_default_tracks_memory() {
    let env = test_env();
    add_template(&env, "tpl");
    let vm = add_appvm(&env, "work", "tpl");
    let holder = Emitter::Vm(vm);

    property::set(&mut env.app.borrow_mut(), holder, "memory", PropertyValue::Int(100 * 1024))
        .unwrap();
    let maxmem = property::get(&env.app.borrow(), holder, "maxmem")
        .unwrap()
        .and_then(|v| v.as_int())
        .unwrap();
    assert_eq!(maxmem, 400 * 1024);
}
