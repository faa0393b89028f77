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

//! Interface for calls qubes make about themselves: feature requests, tools
//! advertisement and update notifications. The calling qube is the source;
//! everything it sends is untrusted.

use crate::api::{ApiCall, MethodDef, save_app};
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs};
use crate::features::{self, FeatureValue};
use crate::utils;

pub static METHODS: &[MethodDef] = &[
    MethodDef { name: "qubes.FeaturesRequest", no_payload: true },
    MethodDef { name: "qubes.NotifyTools", no_payload: true },
    MethodDef { name: "qubes.NotifyUpdates", no_payload: false },
];

pub async fn dispatch(call: ApiCall, untrusted_payload: Vec<u8>) -> Result<Option<String>> {
    match call.method.as_str() {
        "qubes.FeaturesRequest" => features_request(&call),
        "qubes.NotifyTools" => notify_tools(&call),
        "qubes.NotifyUpdates" => notify_updates(&call, &untrusted_payload),
        other => Err(QubesError::protocol(format!("no such method: {other:?}"))),
    }
}

const FEATURES_REQUEST_PREFIX: &str = "/features-request/";

/// A qube (usually a template) asks dom0 for features. The requests sit in
/// the qube's configuration bus; the daemon validates them and fires
/// `features-request`, leaving the decision to handlers. Unhandled requests
/// are ignored.
fn features_request(call: &ApiCall) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.require_no_arg()?;

    let untrusted_features: Vec<(String, String)> = {
        let app = call.app.borrow();
        app.bus
            .list(&call.src_name, FEATURES_REQUEST_PREFIX)
            .into_iter()
            .filter_map(|key| {
                let value = app.bus.read(&call.src_name, &key)?;
                Some((key[FEATURES_REQUEST_PREFIX.len()..].to_owned(), value))
            })
            .collect()
    };

    let safe_set = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    for (untrusted_key, untrusted_value) in &untrusted_features {
        if !utils::all_chars_in(untrusted_key, utils::SAFE_KEY_CHARS)
            || !utils::all_chars_in(untrusted_value, safe_set)
        {
            return Err(QubesError::protocol("invalid feature request"));
        }
    }
    let features = untrusted_features;

    {
        let mut app = call.app.borrow_mut();
        let mut args = EventArgs::new();
        for (key, value) in &features {
            args = args.arg(key, value.as_str());
        }
        events::fire_event(&mut app, Emitter::Vm(call.src), "features-request", &args)?;
    }
    save_app(&call.app)?;
    Ok(None)
}

/// Legacy version of `qubes.FeaturesRequest` used by in-guest tool
/// installers: advertises qrexec and gui agent presence.
fn notify_tools(call: &ApiCall) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.require_no_arg()?;

    let template_based = {
        let app = call.app.borrow();
        crate::vm::template_of(&app, call.src).is_some()
    };
    if template_based {
        log::warn!(
            "ignoring qubes.NotifyTools for template-based qube {}",
            call.src_name
        );
        return Ok(None);
    }

    let (untrusted_version, untrusted_qrexec, untrusted_gui) = {
        let app = call.app.borrow();
        (
            app.bus.read(&call.src_name, "/qubes-tools/version"),
            app.bus.read(&call.src_name, "/qubes-tools/qrexec"),
            app.bus.read(&call.src_name, "/qubes-tools/gui"),
        )
    };

    // no tools advertised; strange that the service was called, but ignore
    let Some(untrusted_version) = untrusted_version else {
        return Ok(None);
    };
    untrusted_version
        .parse::<u32>()
        .map_err(|_| QubesError::protocol("invalid tools version"))?;

    let parse_flag = |untrusted_value: Option<String>| -> Result<bool> {
        match untrusted_value {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "0" => Ok(false),
                "1" => Ok(true),
                _ => Err(QubesError::protocol("invalid tools flag")),
            },
        }
    };
    let qrexec = parse_flag(untrusted_qrexec)?;
    let gui = parse_flag(untrusted_gui)?;

    let prev_qrexec = {
        let mut app = call.app.borrow_mut();
        let prev = features::get_bool(&app, call.src, "qrexec", false);
        features::set(&mut app, call.src, "qrexec", FeatureValue::Bool(qrexec))?;
        features::set(&mut app, call.src, "gui", FeatureValue::Bool(gui))?;
        prev
    };
    save_app(&call.app)?;

    if !prev_qrexec && qrexec {
        // the first qrexec advertisement completes template setup
        let mut app = call.app.borrow_mut();
        events::fire_event(
            &mut app,
            Emitter::Vm(call.src),
            "template-postinstall",
            &EventArgs::new(),
        )?;
    }
    Ok(None)
}

/// A qube reports how many updates are pending: a single non-negative
/// integer, zero meaning none.
fn notify_updates(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.require_no_arg()?;

    let untrusted_count = utils::decode_ascii(untrusted_payload)?;
    let update_count: u64 = untrusted_count
        .trim()
        .parse()
        .map_err(|_| QubesError::protocol("invalid update count"))?;

    {
        let mut app = call.app.borrow_mut();
        let check = crate::property::get(&app, Emitter::App, "check_updates_vm")?
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !check {
            return Ok(None);
        }
        let targets: Vec<u32> = match crate::vm::template_of(&app, call.src) {
            // a template-based qube reports on behalf of its template
            Some(template) => vec![template],
            None => vec![call.src],
        };
        for qid in targets {
            features::set(
                &mut app,
                qid,
                "updates-available",
                FeatureValue::Bool(update_count > 0),
            )?;
        }
    }
    save_app(&call.app)?;
    Ok(None)
}
