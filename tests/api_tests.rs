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

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use qubesd::api::{ApiFlavor, handle_connection};
use qubesd::features::{self, FeatureValue};

use crate::test_helpers::{TestEnv, add_appvm, add_template, run_local, test_env};

/// Issue one request and return the raw response bytes.
async fn call(env: &TestEnv, flavor: ApiFlavor, request: &[u8]) -> Vec<u8> {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let connection =
        tokio::task::spawn_local(handle_connection(env.app.clone(), flavor, server));

    client.write_all(request).await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    connection.await.unwrap();
    response
}

fn admin_request(method: &str, dest: &str, arg: &str, payload: &[u8]) -> Vec<u8> {
    let mut request = Vec::new();
    for part in ["dom0", method, dest, arg] {
        request.extend_from_slice(part.as_bytes());
        request.push(0);
    }
    request.extend_from_slice(payload);
    request
}

#[test]
fn empty_model_lists_only_the_administrative_qube() {
    run_local(async {
        let env = test_env();
        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.List", "dom0", "", b""),
        )
        .await;
        assert_eq!(response, b"0\0dom0 class=AdminVM state=Running\n");
    });
}

#[test]
fn property_get_reports_the_default_flag_and_type() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        add_appvm(&env, "vm", "tpl");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.property.Get", "vm", "label", b""),
        )
        .await;
        assert_eq!(response, b"0\0default=False type=label red");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.property.Get", "vm", "qrexec_timeout", b""),
        )
        .await;
        assert_eq!(response, b"0\0default=True type=int 60");
    });
}

#[test]
fn property_set_round_trips_through_the_wire() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        add_appvm(&env, "vm", "tpl");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.property.Set", "vm", "memory", b"524288"),
        )
        .await;
        assert_eq!(response, b"0\0");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.property.Get", "vm", "memory", b""),
        )
        .await;
        assert_eq!(response, b"0\0default=False type=int 524288");
    });
}

#[test]
fn unknown_methods_are_a_protocol_error() {
    run_local(async {
        let env = test_env();
        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.Explode", "dom0", "", b""),
        )
        .await;
        assert!(response.starts_with(b"2\0ProtocolError\0"), "{response:?}");
    });
}

#[test]
fn unexpected_payload_is_rejected() {
    run_local(async {
        let env = test_env();
        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.List", "dom0", "", b"stray bytes"),
        )
        .await;
        assert!(response.starts_with(b"2\0ProtocolError\0"));
    });
}

#[test]
fn non_ascii_fields_never_reach_a_handler() {
    run_local(async {
        let env = test_env();
        let mut request = Vec::new();
        request.extend_from_slice("dom0\0admin.vm.List\0dom\u{f8}\0\0".as_bytes());
        let response = call(&env, ApiFlavor::Admin, &request).await;
        assert!(response.starts_with(b"2\0ProtocolError\0"));
    });
}

#[test]
fn unknown_source_and_dest_are_rejected() {
    run_local(async {
        let env = test_env();
        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.List", "missing", "", b""),
        )
        .await;
        assert!(response.starts_with(b"2\0ProtocolError\0"));
    });
}

#[test]
fn typed_errors_carry_the_exception_name() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        add_appvm(&env, "vm", "tpl");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.feature.Get", "vm", "no-such-feature", b""),
        )
        .await;
        assert!(
            response.starts_with(b"2\0QubesFeatureNotFoundError\0"),
            "{:?}",
            String::from_utf8_lossy(&response)
        );
        // frame layout: 2, type, traceback, message, args
        let fields: Vec<&[u8]> = response.split(|b| *b == 0).collect();
        assert_eq!(fields[0], b"2");
        assert_eq!(fields[1], b"QubesFeatureNotFoundError");
        assert_eq!(fields[2], b"");
        assert!(!fields[3].is_empty());
    });
}

#[test]
fn feature_set_and_get_through_the_api() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        add_appvm(&env, "vm", "tpl");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.feature.Set", "vm", "service.ntpd", b"1"),
        )
        .await;
        assert_eq!(response, b"0\0");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.feature.Get", "vm", "service.ntpd", b""),
        )
        .await;
        assert_eq!(response, b"0\x001");
    });
}

#[test]
fn reserved_tags_cannot_be_changed_over_the_api() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        add_appvm(&env, "vm", "tpl");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.tag.Set", "vm", "created-by-attacker", b""),
        )
        .await;
        assert!(response.starts_with(b"2\0PermissionDenied\0"));

        // removal is refused before existence is even checked
        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.tag.Remove", "vm", "created-by-dom0", b""),
        )
        .await;
        assert!(response.starts_with(b"2\0PermissionDenied\0"));
    });
}

#[test]
fn vm_create_builds_a_whole_qube() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");

        let response = call(
            &env,
            ApiFlavor::Admin,
            &admin_request("admin.vm.Create.AppVM", "dom0", "tpl", b"name=work label=red"),
        )
        .await;
        assert_eq!(response, b"0\0", "{:?}", String::from_utf8_lossy(&response));

        let app = env.app.borrow();
        let vm = app.domains.get_by_name("work").expect("created");
        assert!(vm.tags.contains("created-by-dom0"));
        assert!(!vm.volumes.is_empty());
    });
}

#[test]
fn vm_create_rejects_bad_parameters() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        for payload in [
            b"label=red".as_slice(),                    // missing name
            b"name=work".as_slice(),                    // missing label
            b"name=work name=w2 label=red".as_slice(),  // duplicated
            b"name=1work label=red".as_slice(),         // invalid name
            b"name=work label=9".as_slice(),            // label index, not name
            b"name=work label=red frob=1".as_slice(),   // unknown parameter
        ] {
            let response = call(
                &env,
                ApiFlavor::Admin,
                &admin_request("admin.vm.Create.AppVM", "dom0", "tpl", payload),
            )
            .await;
            assert!(response.starts_with(b"2\0"), "payload {payload:?} must fail");
        }
    });
}

#[test]
fn internal_system_info_names_every_domain() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        add_appvm(&env, "vm", "tpl");

        let response = call(
            &env,
            ApiFlavor::Internal,
            &admin_request("internal.GetSystemInfo", "dom0", "", b""),
        )
        .await;
        assert!(response.starts_with(b"0\0"));
        let info: serde_json::Value = serde_json::from_slice(&response[2..]).unwrap();
        let domains = info.get("domains").unwrap().as_object().unwrap();
        assert!(domains.contains_key("dom0"));
        assert!(domains.contains_key("vm"));
        assert_eq!(domains["vm"]["type"], "AppVM");
    });
}

#[test]
fn misc_api_is_not_reachable_through_admin_methods() {
    run_local(async {
        let env = test_env();
        let response = call(
            &env,
            ApiFlavor::Misc,
            &admin_request("admin.vm.List", "dom0", "", b""),
        )
        .await;
        assert!(response.starts_with(b"2\0ProtocolError\0"));
    });
}

#[test]
fn notify_updates_flips_the_feature_on_the_template() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        add_appvm(&env, "vm", "tpl");

        let mut request = Vec::new();
        for part in ["vm", "qubes.NotifyUpdates", "dom0", ""] {
            request.extend_from_slice(part.as_bytes());
            request.push(0);
        }
        request.extend_from_slice(b"3\n");
        let response = call(&env, ApiFlavor::Misc, &request).await;
        assert_eq!(response, b"0\0");

        let app = env.app.borrow();
        let tpl = app.domains.get_by_name("tpl").unwrap();
        assert_eq!(tpl.features.get("updates-available").map(String::as_str), Some("1"));
    });
}

#[test]
fn event_stream_delivers_model_changes() {
    run_local(async {
        let env = test_env();
        add_template(&env, "tpl");
        let vm = add_appvm(&env, "vm", "tpl");

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let connection = tokio::task::spawn_local(handle_connection(
            env.app.clone(),
            ApiFlavor::Admin,
            server,
        ));

        client
            .write_all(&admin_request("admin.Events", "dom0", "", b""))
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        // the artificial hello comes first
        let frame = read_frame(&mut client).await;
        assert_eq!(frame, b"1\0\0connection-established\0\0");

        features::set(&mut env.app.borrow_mut(), vm, "x", FeatureValue::Bool(true)).unwrap();
        let frame = read_frame(&mut client).await;
        assert_eq!(
            frame,
            b"1\0vm\0domain-feature-set:x\0feature\0x\0value\x001\0\0"
        );

        // dropping the client cancels the stream: the next delivery attempt
        // hits the closed pipe, the handler future is dropped, and its guard
        // unhooks the subscriptions
        drop(client);
        features::set(&mut env.app.borrow_mut(), vm, "y", FeatureValue::Bool(true)).unwrap();
        connection.await.unwrap();
        assert!(env.app.borrow().subscriptions.is_empty());
    });
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    // frames end with an empty key slot: ...\0\0
    let mut frame = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await.unwrap();
        frame.push(byte[0]);
        if frame.len() >= 2 && frame[frame.len() - 2..] == [0, 0] && frame.len() > 4 {
            return frame;
        }
    }
}
