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

use qubesd::commons::PowerState;
use qubesd::error::QubesError;
use qubesd::events::{Emitter, SubscriberScope};
use qubesd::features::{self, FeatureValue};
use qubesd::property::{self, PropertyValue};
use qubesd::qdb::ConfigBus;
use qubesd::qmemman::Balancer;
use qubesd::vm::{dispvm, lifecycle};

use crate::test_helpers::{
    TestEnv, add_appvm, add_netvm, add_template, provision, run_local, test_env,
};

async fn networked_appvm(env: &TestEnv) -> (u32, u32) {
    add_template(env, "tpl");
    let net = add_netvm(env, "sys-net");
    let work = add_appvm(env, "work", "tpl");
    property::set(
        &mut env.app.borrow_mut(),
        Emitter::Vm(work),
        "netvm",
        PropertyValue::Vm(Some("sys-net".to_owned())),
    )
    .unwrap();
    provision(env, net).await;
    provision(env, work).await;
    (work, net)
}

#[test]
fn start_brings_the_netvm_up_first() {
    run_local(async {
        let env = test_env();
        let (work, net) = networked_appvm(&env).await;

        lifecycle::start(&env.app, work).await.unwrap();

        {
            let app = env.app.borrow();
            assert_eq!(app.domains.get(work).unwrap().power_state, PowerState::Running);
            assert_eq!(app.domains.get(net).unwrap().power_state, PowerState::Running);
        }

        let calls = env.hv.calls.borrow();
        let create_net = calls.iter().position(|c| c == "create sys-net").unwrap();
        let create_work = calls.iter().position(|c| c == "create work").unwrap();
        assert!(create_net < create_work, "netvm must start first: {calls:?}");
    });
}

#[test]
fn domain_start_fires_after_the_qube_and_its_netvm_run() {
    run_local(async {
        let env = test_env();
        let (work, net) = networked_appvm(&env).await;

        let observed = Rc::new(RefCell::new(Vec::new()));
        let sink_observed = Rc::clone(&observed);
        env.app.borrow_mut().add_subscription(
            SubscriberScope::AnyVm,
            "domain-start",
            Rc::new(move |subject, _event, _args| {
                sink_observed.borrow_mut().push(subject.to_owned());
            }),
        );

        lifecycle::start(&env.app, work).await.unwrap();

        // the provider finishes starting before its client does, and the
        // unpause always precedes the domain-start event
        assert_eq!(*observed.borrow(), vec!["sys-net".to_owned(), "work".to_owned()]);
        let calls = env.hv.calls.borrow();
        assert!(
            calls.iter().position(|c| c == "unpause work").unwrap()
                > calls.iter().position(|c| c == "unpause sys-net").unwrap()
        );
        let app = env.app.borrow();
        assert_eq!(app.domains.get(work).unwrap().power_state, PowerState::Running);
        assert_eq!(app.domains.get(net).unwrap().power_state, PowerState::Running);
    });
}

#[test]
fn start_requires_halted() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let work = add_appvm(&env, "work", "tpl");
        provision(&env, work).await;

        lifecycle::start(&env.app, work).await.unwrap();
        let result = lifecycle::start(&env.app, work).await;
        assert!(matches!(result, Err(QubesError::NotHalted { .. })));
    });
}

#[test]
fn prohibit_start_feature_blocks_start() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let work = add_appvm(&env, "work", "tpl");
        features::set(
            &mut env.app.borrow_mut(),
            work,
            "prohibit-start",
            FeatureValue::Bool(true),
        )
        .unwrap();

        assert!(lifecycle::start(&env.app, work).await.is_err());
        assert!(env.hv.calls.borrow().iter().all(|c| !c.starts_with("create")));
    });
}

#[test]
fn failed_start_kills_the_half_started_domain() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let work = add_appvm(&env, "work", "tpl");
        provision(&env, work).await;

        env.hv
            .fail_next
            .replace(Some(("unpause work".to_owned(), "guest refused".to_owned())));

        let result = lifecycle::start(&env.app, work).await;
        assert!(result.is_err());
        assert!(
            env.hv.calls.borrow().iter().any(|c| c == "destroy work"),
            "a failed start must not leak the domain: {:?}",
            env.hv.calls.borrow()
        );
        assert_eq!(
            env.app.borrow().domains.get(work).unwrap().power_state,
            PowerState::Halted
        );
    });
}

#[test]
fn administrative_qube_is_never_started_or_stopped() {
    run_local(async {
        let env = test_env();
        assert!(lifecycle::start(&env.app, 0).await.is_err());
        assert!(lifecycle::shutdown(&env.app, 0, false, false).await.is_err());
        assert!(lifecycle::kill(&env.app, 0).await.is_err());
        assert_eq!(
            lifecycle::get_power_state(&env.app, 0).await.unwrap(),
            PowerState::Running
        );
    });
}

#[test]
fn netvm_shutdown_is_vetoed_while_clients_run() {
    run_local(async {
        let env = test_env();
        let (work, net) = networked_appvm(&env).await;
        lifecycle::start(&env.app, work).await.unwrap();

        let result = lifecycle::shutdown(&env.app, net, false, false).await;
        assert!(matches!(result, Err(QubesError::Vm { .. })), "{result:?}");

        // force bypasses the veto, and kill ignores it entirely
        lifecycle::shutdown(&env.app, net, true, false).await.unwrap();
    });
}

#[test]
fn shutdown_requires_a_started_qube() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let work = add_appvm(&env, "work", "tpl");
        let result = lifecycle::shutdown(&env.app, work, false, false).await;
        assert!(matches!(result, Err(QubesError::NotStarted { .. })));
    });
}

#[test]
fn pause_and_unpause_round_trip() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let work = add_appvm(&env, "work", "tpl");
        provision(&env, work).await;
        lifecycle::start(&env.app, work).await.unwrap();

        lifecycle::pause(&env.app, work).await.unwrap();
        assert_eq!(
            lifecycle::get_power_state(&env.app, work).await.unwrap(),
            PowerState::Paused
        );
        assert!(matches!(
            lifecycle::pause(&env.app, work).await,
            Err(QubesError::NotRunning { .. })
        ));

        lifecycle::unpause(&env.app, work).await.unwrap();
        assert_eq!(
            lifecycle::get_power_state(&env.app, work).await.unwrap(),
            PowerState::Running
        );
        assert!(matches!(
            lifecycle::unpause(&env.app, work).await,
            Err(QubesError::NotPaused { .. })
        ));
    });
}

#[test]
fn start_writes_identity_to_the_configuration_bus() {
    run_local(async {
        let env = test_env();
        let (work, _net) = networked_appvm(&env).await;
        lifecycle::start(&env.app, work).await.unwrap();

        assert_eq!(env.bus.read("work", "/name").as_deref(), Some("work"));
        assert_eq!(env.bus.read("work", "/qubes-vm-type").as_deref(), Some("AppVM"));
        let ip = env.bus.read("work", "/qubes-ip").expect("networked qubes get an address");
        assert!(ip.starts_with("10.137."));

        // the firewall lands in the provider's tree
        let rules = env.bus.list("sys-net", &format!("/qubes-firewall/{ip}"));
        assert!(!rules.is_empty());
    });
}

#[test]
fn out_of_memory_start_fails_cleanly() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let work = add_appvm(&env, "work", "tpl");
        provision(&env, work).await;

        env.hv.set_free_memory(0);
        let balancer = Balancer::new(env.hv.clone(), env.bus.clone());
        env.app.borrow_mut().memman = Some(balancer);

        let result = lifecycle::start(&env.app, work).await;
        assert!(matches!(result, Err(QubesError::OutOfMemory { .. })), "{result:?}");
        assert!(env.hv.calls.borrow().iter().all(|c| !c.starts_with("create")));
    });
}

#[test]
fn rename_requires_halted_and_updates_the_model() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let work = add_appvm(&env, "work", "tpl");
        provision(&env, work).await;

        lifecycle::start(&env.app, work).await.unwrap();
        assert!(lifecycle::rename(&env.app, work, "renamed").await.is_err());
        lifecycle::kill(&env.app, work).await.unwrap();

        lifecycle::rename(&env.app, work, "renamed").await.unwrap();
        let app = env.app.borrow();
        assert!(app.domains.get_by_name("renamed").is_some());
        assert!(app.domains.get_by_name("work").is_none());
        assert_eq!(app.domains.get(work).unwrap().qid, work, "the qid is stable");
    });
}

#[test]
fn clone_copies_properties_and_volumes() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let src = add_appvm(&env, "src", "tpl");
        {
            let mut app = env.app.borrow_mut();
            property::set(&mut app, Emitter::Vm(src), "memory", PropertyValue::Int(512 * 1024))
                .unwrap();
            property::set(
                &mut app,
                Emitter::Vm(src),
                "default_user",
                PropertyValue::Str("alice".to_owned()),
            )
            .unwrap();
        }
        let dst = add_appvm(&env, "dst", "tpl");
        provision(&env, src).await;
        provision(&env, dst).await;

        lifecycle::clone_vm(&env.app, src, dst).await.unwrap();

        let app = env.app.borrow();
        assert_eq!(
            property::get(&app, Emitter::Vm(dst), "memory").unwrap(),
            Some(PropertyValue::Int(512 * 1024))
        );
        assert_eq!(
            property::get(&app, Emitter::Vm(dst), "default_user").unwrap(),
            Some(PropertyValue::Str("alice".to_owned()))
        );
        // identity does not follow
        assert_ne!(app.domains.get(dst).unwrap().uuid, app.domains.get(src).unwrap().uuid);
    });
}

#[test]
fn disposables_are_created_and_cleaned_up() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let base = add_appvm(&env, "dvm-base", "tpl");
        property::set(
            &mut env.app.borrow_mut(),
            Emitter::Vm(base),
            "template_for_dispvms",
            PropertyValue::Bool(true),
        )
        .unwrap();

        let disp = dispvm::from_appvm(&env.app, base).await.unwrap();
        let disp_name = env.app.borrow().domains.get(disp).unwrap().name.clone();
        assert!(disp_name.starts_with("disp"));
        assert!(env.app.borrow().domains.get(disp).unwrap().auto_cleanup);

        lifecycle::start(&env.app, disp).await.unwrap();
        dispvm::cleanup(&env.app, disp).await.unwrap();
        assert!(env.app.borrow().domains.get(disp).is_none());
    });
}

#[test]
fn ordinary_qubes_cannot_be_cleaned_up_as_disposables() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let work = add_appvm(&env, "work", "tpl");
        assert!(dispvm::cleanup(&env.app, work).await.is_err());
    });
}

#[test]
fn disposables_require_an_enabled_base() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let base = add_appvm(&env, "plain", "tpl");
        assert!(dispvm::from_appvm(&env.app, base).await.is_err());
    });
}
