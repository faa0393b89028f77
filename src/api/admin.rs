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

//! The public Admin API. Every call is gated by the
//! `mgmt-permission:<method>` event fired on the source qube.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::AppRef;
use crate::api::{ApiCall, MethodDef, save_app};
use crate::app;
use crate::commons::VmClass;
use crate::devices::{self, DeviceAssignment};
use crate::error::{QubesError, Result};
use crate::events::{
    self, Emitter, EventArgs, EventSink, FilterCandidate, PermissionFilter, SubscriberScope,
};
use crate::features::{self, FeatureValue};
use crate::formatting::{
    DeviceRow, LabelRow, PoolInfoReply, PropertyGetReply, VmListEntry, VolumeInfoReply,
};
use crate::property::{self, PropertyType};
use crate::storage;
use crate::utils::{self, decode_ascii};
use crate::vm::{self, lifecycle};

pub static METHODS: &[MethodDef] = &[
    MethodDef { name: "admin.vmclass.List", no_payload: true },
    MethodDef { name: "admin.vm.List", no_payload: true },
    MethodDef { name: "admin.vm.property.List", no_payload: true },
    MethodDef { name: "admin.vm.property.Get", no_payload: true },
    MethodDef { name: "admin.vm.property.Set", no_payload: false },
    MethodDef { name: "admin.vm.property.Help", no_payload: true },
    MethodDef { name: "admin.vm.property.Reset", no_payload: true },
    MethodDef { name: "admin.property.List", no_payload: true },
    MethodDef { name: "admin.property.Get", no_payload: true },
    MethodDef { name: "admin.property.Set", no_payload: false },
    MethodDef { name: "admin.property.Help", no_payload: true },
    MethodDef { name: "admin.property.Reset", no_payload: true },
    MethodDef { name: "admin.vm.feature.List", no_payload: true },
    MethodDef { name: "admin.vm.feature.Get", no_payload: true },
    MethodDef { name: "admin.vm.feature.CheckWithTemplate", no_payload: true },
    MethodDef { name: "admin.vm.feature.CheckWithNetvm", no_payload: true },
    MethodDef { name: "admin.vm.feature.Set", no_payload: false },
    MethodDef { name: "admin.vm.feature.Remove", no_payload: true },
    MethodDef { name: "admin.vm.tag.List", no_payload: true },
    MethodDef { name: "admin.vm.tag.Get", no_payload: true },
    MethodDef { name: "admin.vm.tag.Set", no_payload: true },
    MethodDef { name: "admin.vm.tag.Remove", no_payload: true },
    MethodDef { name: "admin.vm.device.{endpoint}.Available", no_payload: true },
    MethodDef { name: "admin.vm.device.{endpoint}.List", no_payload: true },
    MethodDef { name: "admin.vm.device.{endpoint}.Attach", no_payload: false },
    MethodDef { name: "admin.vm.device.{endpoint}.Detach", no_payload: true },
    MethodDef { name: "admin.vm.volume.List", no_payload: true },
    MethodDef { name: "admin.vm.volume.Info", no_payload: true },
    MethodDef { name: "admin.vm.volume.ListSnapshots", no_payload: true },
    MethodDef { name: "admin.vm.volume.Revert", no_payload: false },
    MethodDef { name: "admin.vm.volume.Clone", no_payload: false },
    MethodDef { name: "admin.vm.volume.Resize", no_payload: false },
    MethodDef { name: "admin.vm.volume.Import", no_payload: true },
    MethodDef { name: "admin.pool.List", no_payload: true },
    MethodDef { name: "admin.pool.ListDrivers", no_payload: true },
    MethodDef { name: "admin.pool.Info", no_payload: true },
    MethodDef { name: "admin.pool.Add", no_payload: false },
    MethodDef { name: "admin.pool.Remove", no_payload: true },
    MethodDef { name: "admin.label.List", no_payload: true },
    MethodDef { name: "admin.label.Get", no_payload: true },
    MethodDef { name: "admin.label.Index", no_payload: true },
    MethodDef { name: "admin.label.Create", no_payload: false },
    MethodDef { name: "admin.label.Remove", no_payload: true },
    MethodDef { name: "admin.vm.Start", no_payload: true },
    MethodDef { name: "admin.vm.Shutdown", no_payload: true },
    MethodDef { name: "admin.vm.Pause", no_payload: true },
    MethodDef { name: "admin.vm.Unpause", no_payload: true },
    MethodDef { name: "admin.vm.Kill", no_payload: true },
    MethodDef { name: "admin.vm.Create.{endpoint}", no_payload: false },
    MethodDef { name: "admin.vm.CreateInPool.{endpoint}", no_payload: false },
    MethodDef { name: "admin.vm.Remove", no_payload: true },
    MethodDef { name: "admin.vm.Clone", no_payload: false },
    MethodDef { name: "admin.Events", no_payload: true },
];

pub async fn dispatch(call: ApiCall, untrusted_payload: Vec<u8>) -> Result<Option<String>> {
    let name = if call.endpoint.is_some() {
        call.template
    } else {
        call.method.as_str()
    };
    match name {
        "admin.vmclass.List" => vmclass_list(&call),
        "admin.vm.List" => vm_list(&call).await,
        "admin.vm.property.List" => property_list(&call, Emitter::Vm(call.dest)),
        "admin.vm.property.Get" => property_get(&call, Emitter::Vm(call.dest)),
        "admin.vm.property.Set" => {
            // netvm changes detach and reattach the virtual NIC, so they go
            // through the lifecycle path instead of the plain store
            if call.arg == "netvm" {
                vm_set_netvm(&call, &untrusted_payload).await
            } else {
                property_set(&call, Emitter::Vm(call.dest), &untrusted_payload)
            }
        }
        "admin.vm.property.Help" => property_help(&call, Emitter::Vm(call.dest)),
        "admin.vm.property.Reset" => property_reset(&call, Emitter::Vm(call.dest)),
        "admin.property.List" => global(&call).and_then(|_| property_list(&call, Emitter::App)),
        "admin.property.Get" => global(&call).and_then(|_| property_get(&call, Emitter::App)),
        "admin.property.Set" => {
            global(&call).and_then(|_| property_set(&call, Emitter::App, &untrusted_payload))
        }
        "admin.property.Help" => global(&call).and_then(|_| property_help(&call, Emitter::App)),
        "admin.property.Reset" => global(&call).and_then(|_| property_reset(&call, Emitter::App)),
        "admin.vm.feature.List" => feature_list(&call),
        "admin.vm.feature.Get" => feature_get(&call),
        "admin.vm.feature.CheckWithTemplate" => feature_check_with_template(&call),
        "admin.vm.feature.CheckWithNetvm" => feature_check_with_netvm(&call),
        "admin.vm.feature.Set" => feature_set(&call, &untrusted_payload),
        "admin.vm.feature.Remove" => feature_remove(&call),
        "admin.vm.tag.List" => tag_list(&call),
        "admin.vm.tag.Get" => tag_get(&call),
        "admin.vm.tag.Set" => tag_set(&call),
        "admin.vm.tag.Remove" => tag_remove(&call),
        "admin.vm.device.{endpoint}.Available" => device_available(&call),
        "admin.vm.device.{endpoint}.List" => device_list(&call),
        "admin.vm.device.{endpoint}.Attach" => device_attach(&call, &untrusted_payload),
        "admin.vm.device.{endpoint}.Detach" => device_detach(&call),
        "admin.vm.volume.List" => volume_list(&call),
        "admin.vm.volume.Info" => volume_info(&call).await,
        "admin.vm.volume.ListSnapshots" => volume_list_snapshots(&call).await,
        "admin.vm.volume.Revert" => volume_revert(&call, &untrusted_payload).await,
        "admin.vm.volume.Clone" => volume_clone(&call, &untrusted_payload).await,
        "admin.vm.volume.Resize" => volume_resize(&call, &untrusted_payload).await,
        "admin.vm.volume.Import" => volume_import(&call).await,
        "admin.pool.List" => pool_list(&call),
        "admin.pool.ListDrivers" => pool_list_drivers(&call),
        "admin.pool.Info" => pool_info(&call),
        "admin.pool.Add" => pool_add(&call, &untrusted_payload),
        "admin.pool.Remove" => pool_remove(&call),
        "admin.label.List" => label_list(&call),
        "admin.label.Get" => label_get(&call),
        "admin.label.Index" => label_index(&call),
        "admin.label.Create" => label_create(&call, &untrusted_payload),
        "admin.label.Remove" => label_remove(&call),
        "admin.vm.Start" => vm_start(&call).await,
        "admin.vm.Shutdown" => vm_shutdown(&call).await,
        "admin.vm.Pause" => vm_pause(&call).await,
        "admin.vm.Unpause" => vm_unpause(&call).await,
        "admin.vm.Kill" => vm_kill(&call).await,
        "admin.vm.Create.{endpoint}" => vm_create(&call, &untrusted_payload, false).await,
        "admin.vm.CreateInPool.{endpoint}" => vm_create(&call, &untrusted_payload, true).await,
        "admin.vm.Remove" => vm_remove(&call).await,
        "admin.vm.Clone" => vm_clone(&call, &untrusted_payload).await,
        "admin.Events" => events_stream(&call).await,
        other => Err(QubesError::protocol(format!("no such method: {other:?}"))),
    }
}

fn global(call: &ApiCall) -> Result<()> {
    call.require_dest_dom0()
}

fn apply_name_filters(names: Vec<String>, filters: &[PermissionFilter]) -> Vec<String> {
    events::apply_filters(names, filters, |name| FilterCandidate::Name(name))
}

fn vmclass_list(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.require_dest_dom0()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;
    let classes = apply_name_filters(
        VmClass::ALL
            .iter()
            .map(|class| class.as_str().to_owned())
            .collect(),
        &filters,
    );
    Ok(Some(
        classes.iter().map(|c| format!("{c}\n")).collect::<String>(),
    ))
}

async fn vm_list(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;

    let qids: Vec<u32> = if call.dest_name == "dom0" {
        call.app.borrow().domains.qids()
    } else {
        vec![call.dest]
    };

    let mut out = String::new();
    for qid in qids {
        let Some((name, class)) = call
            .app
            .borrow()
            .domains
            .get(qid)
            .map(|vm| (vm.name.clone(), vm.class))
        else {
            continue;
        };
        let keep = filters.iter().all(|f| f(&FilterCandidate::Vm(&name)));
        if !keep {
            continue;
        }
        let state = lifecycle::get_power_state(&call.app, qid).await?;
        out.push_str(&VmListEntry { name, class, state }.to_string());
    }
    Ok(Some(out))
}

fn property_list(call: &ApiCall, holder: Emitter) -> Result<Option<String>> {
    call.require_no_arg()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    let names = apply_name_filters(
        property::list(&app, holder)?
            .iter()
            .map(|def| def.name.to_owned())
            .collect(),
        &filters,
    );
    Ok(Some(
        names.iter().map(|n| format!("{n}\n")).collect::<String>(),
    ))
}

fn property_get(call: &ApiCall, holder: Emitter) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    let def = property::get_def(&app, holder, &call.arg)?;
    let ptype = if call.arg == "label" {
        PropertyType::Label
    } else {
        def.ptype
    };
    let reply = match property::get(&app, holder, &call.arg)? {
        Some(value) => PropertyGetReply {
            is_default: property::is_default(&app, holder, &call.arg)?,
            ptype,
            value: Some(value.to_string()),
        },
        None => PropertyGetReply {
            is_default: true,
            ptype,
            value: None,
        },
    };
    Ok(Some(reply.to_string()))
}

fn property_set(call: &ApiCall, holder: Emitter, untrusted_payload: &[u8]) -> Result<Option<String>> {
    let def = property::get_def(&call.app.borrow(), holder, &call.arg)?;
    let newvalue = def.sanitize(untrusted_payload)?;

    call.fire_event_for_permission(EventArgs::new().arg("newvalue", newvalue.to_string()))?;

    property::set(&mut call.app.borrow_mut(), holder, &call.arg, newvalue)?;
    save_app(&call.app)?;
    Ok(None)
}

async fn vm_set_netvm(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    let def = property::get_def(&call.app.borrow(), Emitter::Vm(call.dest), "netvm")?;
    let newvalue = def.sanitize(untrusted_payload)?;

    call.fire_event_for_permission(EventArgs::new().arg("newvalue", newvalue.to_string()))?;

    lifecycle::set_netvm(&call.app, call.dest, newvalue.as_vm().map(str::to_owned)).await?;
    save_app(&call.app)?;
    Ok(None)
}

fn property_help(call: &ApiCall, holder: Emitter) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    let def = property::get_def(&app, holder, &call.arg)?;
    Ok(Some(def.doc.to_owned()))
}

fn property_reset(call: &ApiCall, holder: Emitter) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    property::get_def(&call.app.borrow(), holder, &call.arg)?;
    property::reset(&mut call.app.borrow_mut(), holder, &call.arg)?;
    save_app(&call.app)?;
    Ok(None)
}

fn feature_list(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;
    let names = apply_name_filters(features::keys(&call.app.borrow(), call.dest), &filters);
    Ok(Some(
        names.iter().map(|n| format!("{n}\n")).collect::<String>(),
    ))
}

fn feature_get(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    features::get(&app, call.dest, &call.arg)
        .map(Some)
        .ok_or_else(|| QubesError::FeatureNotFound {
            vm: call.dest_name.clone(),
            feature: call.arg.clone(),
        })
}

fn feature_check_with_template(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    features::check_with_template(&app, call.dest, &call.arg)
        .map(Some)
        .ok_or_else(|| QubesError::FeatureNotFound {
            vm: call.dest_name.clone(),
            feature: call.arg.clone(),
        })
}

fn feature_check_with_netvm(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    features::check_with_netvm(&app, call.dest, &call.arg)
        .map(Some)
        .ok_or_else(|| QubesError::FeatureNotFound {
            vm: call.dest_name.clone(),
            feature: call.arg.clone(),
        })
}

fn feature_set(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    let value = decode_ascii(untrusted_payload)?;
    call.fire_event_for_permission(EventArgs::new().arg("value", value.as_str()))?;
    features::set(
        &mut call.app.borrow_mut(),
        call.dest,
        &call.arg,
        FeatureValue::Str(&value),
    )?;
    save_app(&call.app)?;
    Ok(None)
}

fn feature_remove(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    features::remove(&mut call.app.borrow_mut(), call.dest, &call.arg)?;
    save_app(&call.app)?;
    Ok(None)
}

fn tag_list(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;
    let tags: Vec<String> = call
        .app
        .borrow()
        .domains
        .get(call.dest)
        .map(|vm| vm.tags.iter().cloned().collect())
        .unwrap_or_default();
    let tags = apply_name_filters(tags, &filters);
    Ok(Some(tags.iter().map(|t| format!("{t}\n")).collect::<String>()))
}

fn tag_get(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let present = call
        .app
        .borrow()
        .domains
        .get(call.dest)
        .is_some_and(|vm| vm.tags.contains(&call.arg));
    Ok(Some(if present { "1" } else { "0" }.to_owned()))
}

fn tag_set(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    vm::add_tag(&mut call.app.borrow_mut(), call.dest, &call.arg)?;
    save_app(&call.app)?;
    Ok(None)
}

fn tag_remove(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    vm::remove_tag(&mut call.app.borrow_mut(), call.dest, &call.arg)?;
    save_app(&call.app)?;
    Ok(None)
}

fn devclass(call: &ApiCall) -> String {
    call.endpoint.clone().unwrap_or_default()
}

/// Devices a backend qube advertises through its configuration bus, under
/// `/devices/<class>/<ident>`.
fn advertised_devices(call: &ApiCall, backend: &str, class: &str) -> Vec<(String, String)> {
    let app = call.app.borrow();
    let prefix = format!("/devices/{class}/");
    app.bus
        .list(backend, &prefix)
        .into_iter()
        .filter_map(|key| {
            let ident = key.strip_prefix(&prefix)?.to_owned();
            let description = app.bus.read(backend, &key).unwrap_or_default();
            Some((ident, description))
        })
        .collect()
}

fn device_available(call: &ApiCall) -> Result<Option<String>> {
    let class = devclass(call);
    let filters =
        call.fire_event_for_permission(EventArgs::new().arg("devclass", class.as_str()))?;
    let mut devices = advertised_devices(call, &call.dest_name, &class);
    if !call.arg.is_empty() {
        devices.retain(|(ident, _)| *ident == call.arg);
    }
    let devices = events::apply_filters(devices, &filters, |(ident, _)| {
        FilterCandidate::Name(ident)
    });
    let mut rows = BTreeMap::new();
    for (ident, description) in devices {
        rows.insert(
            ident.clone(),
            DeviceRow {
                ident,
                properties: vec![("description".to_owned(), description)],
            },
        );
    }
    Ok(Some(rows.values().map(DeviceRow::to_string).collect()))
}

fn device_list(call: &ApiCall) -> Result<Option<String>> {
    let class = devclass(call);
    let filters =
        call.fire_event_for_permission(EventArgs::new().arg("devclass", class.as_str()))?;
    let mut assignments = devices::assignments(&call.app.borrow(), call.dest, &class);
    if !call.arg.is_empty() {
        let (select_backend, select_ident) = call
            .arg
            .split_once('+')
            .ok_or_else(|| QubesError::protocol("invalid device identifier"))?;
        assignments
            .retain(|dev| dev.backend == select_backend && dev.ident == select_ident);
    }
    let assignments = events::apply_filters(assignments, &filters, |dev| {
        FilterCandidate::Name(&dev.ident)
    });
    let mut rows = BTreeMap::new();
    for dev in assignments {
        let mut properties: Vec<(String, String)> = dev
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        properties.push((
            "persistent".to_owned(),
            if dev.persistent { "yes" } else { "no" }.to_owned(),
        ));
        rows.insert(
            dev.wire_ident(),
            DeviceRow {
                ident: dev.wire_ident(),
                properties,
            },
        );
    }
    Ok(Some(rows.values().map(DeviceRow::to_string).collect()))
}

fn device_attach(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    let class = devclass(call);
    let mut options = BTreeMap::new();
    let mut persistent = false;
    for untrusted_option in decode_ascii(untrusted_payload)?.split_whitespace() {
        let Some((untrusted_key, untrusted_value)) = untrusted_option.split_once('=') else {
            return Err(QubesError::protocol("invalid options format"));
        };
        if untrusted_key == "persistent" {
            persistent = matches!(untrusted_value, "True" | "true" | "yes" | "1");
        } else {
            if !utils::all_chars_in(untrusted_key, utils::SAFE_KEY_CHARS) {
                return Err(QubesError::protocol("invalid chars in option name"));
            }
            if !untrusted_value
                .chars()
                .all(|c| utils::SAFE_KEY_CHARS.contains(c) || ",+:".contains(c))
            {
                return Err(QubesError::protocol("invalid chars in option value"));
            }
            options.insert(untrusted_key.to_owned(), untrusted_value.to_owned());
        }
    }

    // the transport already vetted the argument's character set
    let (backend, ident) = call
        .arg
        .split_once('+')
        .ok_or_else(|| QubesError::protocol("invalid device identifier"))?;
    let advertised = advertised_devices(call, backend, &class)
        .iter()
        .any(|(advertised_ident, _)| advertised_ident == ident);
    if !advertised {
        return Err(QubesError::value(format!(
            "backend {backend} does not expose device {ident}"
        )));
    }

    call.fire_event_for_permission(
        EventArgs::new()
            .arg("devclass", class.as_str())
            .arg("device", call.arg.as_str())
            .arg("persistent", persistent),
    )?;

    devices::attach(
        &mut call.app.borrow_mut(),
        call.dest,
        &class,
        DeviceAssignment {
            backend: backend.to_owned(),
            ident: ident.to_owned(),
            options,
            persistent,
        },
    )?;
    save_app(&call.app)?;
    Ok(None)
}

fn device_detach(call: &ApiCall) -> Result<Option<String>> {
    let class = devclass(call);
    let (backend, ident) = call
        .arg
        .split_once('+')
        .ok_or_else(|| QubesError::protocol("invalid device identifier"))?;
    call.fire_event_for_permission(
        EventArgs::new()
            .arg("devclass", class.as_str())
            .arg("device", call.arg.as_str()),
    )?;
    devices::detach(&mut call.app.borrow_mut(), call.dest, &class, backend, ident)?;
    save_app(&call.app)?;
    Ok(None)
}

fn volume_of(call: &ApiCall) -> Result<crate::storage::VolumeConfig> {
    call.app
        .borrow()
        .domains
        .get(call.dest)
        .and_then(|vm| vm.volumes.get(&call.arg))
        .cloned()
        .ok_or_else(|| QubesError::value(format!("no such volume: {:?}", call.arg)))
}

fn volume_list(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;
    let names: Vec<String> = call
        .app
        .borrow()
        .domains
        .get(call.dest)
        .map(|vm| vm.volumes.keys().cloned().collect())
        .unwrap_or_default();
    let names = apply_name_filters(names, &filters);
    Ok(Some(
        names.iter().map(|n| format!("{n}\n")).collect::<String>(),
    ))
}

async fn volume_info(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let config = volume_of(call)?;
    let pool = call.app.borrow().get_pool(&config.pool)?;
    let info = pool
        .info(&call.dest_name, &call.arg)
        .await
        .map_err(|e| QubesError::Storage(e.to_string()))?;
    Ok(Some(
        VolumeInfoReply {
            pool: config.pool,
            size: config.size,
            usage: info.usage,
            rw: config.rw,
            snap_on_start: config.snap_on_start,
            save_on_stop: config.save_on_stop,
            source: config.source,
        }
        .to_string(),
    ))
}

async fn volume_list_snapshots(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let config = volume_of(call)?;
    let pool = call.app.borrow().get_pool(&config.pool)?;
    let revisions = pool
        .list_revisions(&call.dest_name, &call.arg)
        .await
        .map_err(|e| QubesError::Storage(e.to_string()))?;
    Ok(Some(
        revisions.iter().map(|r| format!("{r}\n")).collect::<String>(),
    ))
}

async fn volume_revert(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    let revision = decode_ascii(untrusted_payload)?;
    let revision = revision.trim();
    call.fire_event_for_permission(EventArgs::new().arg("revision", revision))?;
    let config = volume_of(call)?;
    let pool = call.app.borrow().get_pool(&config.pool)?;
    pool.revert(&call.dest_name, &call.arg, revision)
        .await
        .map_err(|e| QubesError::Storage(e.to_string()))?;
    Ok(None)
}

async fn volume_clone(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    let untrusted_target = decode_ascii(untrusted_payload)?;
    let target = untrusted_target.trim();
    crate::commons::validate_name(target)?;
    call.fire_event_for_permission(EventArgs::new().arg("target", target))?;

    let config = volume_of(call)?;
    let (pool, target_exists) = {
        let app = call.app.borrow();
        (app.get_pool(&config.pool)?, app.domains.contains_name(target))
    };
    if !target_exists {
        return Err(QubesError::value(format!("no such domain: {target:?}")));
    }
    pool.clone_volume(&call.dest_name, target, &call.arg)
        .await
        .map_err(|e| QubesError::Storage(e.to_string()))?;

    {
        let mut app = call.app.borrow_mut();
        let mut config = config;
        config.source = None;
        if let Some(vm) = app.domains.get_by_name_mut(target) {
            vm.volumes.insert(call.arg.clone(), config);
        }
    }
    save_app(&call.app)?;
    Ok(None)
}

async fn volume_resize(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    let untrusted_size = decode_ascii(untrusted_payload)?;
    let size: u64 = untrusted_size
        .trim()
        .parse()
        .map_err(|_| QubesError::value("invalid size"))?;
    call.fire_event_for_permission(EventArgs::new().arg("size", size as i64))?;

    let config = volume_of(call)?;
    let pool = call.app.borrow().get_pool(&config.pool)?;
    pool.resize(&call.dest_name, &call.arg, size)
        .await
        .map_err(|e| QubesError::Storage(e.to_string()))?;
    {
        let mut app = call.app.borrow_mut();
        if let Some(volume) = app
            .domains
            .get_mut(call.dest)
            .and_then(|vm| vm.volumes.get_mut(&call.arg))
        {
            volume.size = size;
        }
    }
    save_app(&call.app)?;
    Ok(None)
}

/// First phase of a volume import: answer with the size and the path the
/// writer streams data into. `internal.vm.volume.ImportEnd` finishes the
/// job and reports the outcome to the original caller.
async fn volume_import(call: &ApiCall) -> Result<Option<String>> {
    call.fire_event_for_permission(EventArgs::new())?;
    let config = volume_of(call)?;
    let pool = call.app.borrow().get_pool(&config.pool)?;
    let path = pool
        .import_begin(&call.dest_name, &call.arg)
        .await
        .map_err(|e| QubesError::Storage(e.to_string()))?;
    Ok(Some(format!("{} {}", config.size, path.display())))
}

fn pool_list(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.require_dest_dom0()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;
    let names = apply_name_filters(
        call.app.borrow().pools.keys().cloned().collect(),
        &filters,
    );
    Ok(Some(
        names.iter().map(|n| format!("{n}\n")).collect::<String>(),
    ))
}

fn pool_list_drivers(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.require_dest_dom0()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;
    let names = apply_name_filters(
        storage::drivers().iter().map(|d| (*d).to_owned()).collect(),
        &filters,
    );
    Ok(Some(
        names.iter().map(|n| format!("{n}\n")).collect::<String>(),
    ))
}

fn pool_info(call: &ApiCall) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.fire_event_for_permission(EventArgs::new())?;
    let pool = call.app.borrow().get_pool(&call.arg)?;
    Ok(Some(PoolInfoReply { config: pool.config() }.to_string()))
}

fn pool_add(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    let driver = call.arg.clone();
    if !storage::drivers().contains(&driver.as_str()) {
        return Err(QubesError::value(format!("unknown pool driver: {driver:?}")));
    }

    let mut config: Vec<(String, String)> = Vec::new();
    for untrusted_line in decode_ascii(untrusted_payload)?.lines() {
        let line = untrusted_line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(QubesError::protocol("invalid pool configuration line"));
        };
        config.push((key.to_owned(), value.to_owned()));
    }
    let name = config
        .iter()
        .find(|(key, _)| key == "name")
        .map(|(_, value)| value.clone())
        .ok_or_else(|| QubesError::value("pool configuration without a name"))?;
    if call.app.borrow().pools.contains_key(&name) {
        return Err(QubesError::value(format!("pool {name:?} already exists")));
    }

    call.fire_event_for_permission(EventArgs::new().arg("name", name.as_str()))?;

    let pool = storage::pool_from_config(&driver, &name, &config)
        .map_err(|e| QubesError::Storage(e.to_string()))?;
    call.app.borrow_mut().add_pool(pool);
    save_app(&call.app)?;
    Ok(None)
}

fn pool_remove(call: &ApiCall) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.fire_event_for_permission(EventArgs::new())?;
    {
        let mut app = call.app.borrow_mut();
        if call.arg == app.default_pool {
            return Err(QubesError::value("cannot remove the default pool"));
        }
        let in_use = app
            .domains
            .iter()
            .any(|vm| vm.volumes.values().any(|volume| volume.pool == call.arg));
        if in_use {
            return Err(QubesError::value("pool still in use"));
        }
        if app.pools.remove(&call.arg).is_none() {
            return Err(QubesError::value(format!("no such pool: {:?}", call.arg)));
        }
    }
    save_app(&call.app)?;
    Ok(None)
}

fn label_list(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.require_dest_dom0()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    let labels = events::apply_filters(
        app.labels.values().collect::<Vec<_>>(),
        &filters,
        |label| FilterCandidate::Name(&label.name),
    );
    Ok(Some(
        labels
            .into_iter()
            .map(|label| LabelRow(label).to_string())
            .collect(),
    ))
}

fn label_get(call: &ApiCall) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    app.get_label(&call.arg)
        .map(|label| Some(label.color.clone()))
        .ok_or_else(|| QubesError::value(format!("no such label: {:?}", call.arg)))
}

fn label_index(call: &ApiCall) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.fire_event_for_permission(EventArgs::new())?;
    let app = call.app.borrow();
    app.get_label(&call.arg)
        .map(|label| Some(label.index.to_string()))
        .ok_or_else(|| QubesError::value(format!("no such label: {:?}", call.arg)))
}

fn label_create(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    call.require_dest_dom0()?;

    // the label name travels in the argument; do not confuse a name with an
    // index
    if call.arg.is_empty() || call.arg.chars().all(|c| c.is_ascii_digit()) {
        return Err(QubesError::value("invalid label name"));
    }
    if !utils::all_chars_in(&call.arg, utils::SAFE_KEY_CHARS) {
        return Err(QubesError::value("invalid characters in label name"));
    }
    let untrusted_color = decode_ascii(untrusted_payload)?;
    let color = untrusted_color.trim();
    crate::commons::validate_label_color(color)?;

    call.fire_event_for_permission(EventArgs::new().arg("color", color))?;

    let index = {
        let app = call.app.borrow();
        app.labels.keys().max().copied().unwrap_or(0).max(crate::commons::MAX_DEFAULT_LABEL) + 1
    };
    call.app.borrow_mut().add_label(index, color, &call.arg)?;
    save_app(&call.app)?;
    Ok(None)
}

fn label_remove(call: &ApiCall) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.fire_event_for_permission(EventArgs::new())?;
    call.app.borrow_mut().remove_label(&call.arg)?;
    save_app(&call.app)?;
    Ok(None)
}

async fn vm_start(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.fire_event_for_permission(EventArgs::new())?;
    lifecycle::start(&call.app, call.dest).await?;
    Ok(None)
}

async fn vm_shutdown(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.fire_event_for_permission(EventArgs::new())?;
    lifecycle::shutdown(&call.app, call.dest, false, false).await?;
    Ok(None)
}

async fn vm_pause(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.fire_event_for_permission(EventArgs::new())?;
    lifecycle::pause(&call.app, call.dest).await?;
    Ok(None)
}

async fn vm_unpause(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.fire_event_for_permission(EventArgs::new())?;
    lifecycle::unpause(&call.app, call.dest).await?;
    Ok(None)
}

async fn vm_kill(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.fire_event_for_permission(EventArgs::new())?;
    lifecycle::kill(&call.app, call.dest).await?;
    Ok(None)
}

async fn vm_create(
    call: &ApiCall,
    untrusted_payload: &[u8],
    allow_pool: bool,
) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    let class = VmClass::parse(call.endpoint.as_deref().unwrap_or_default())?;
    if !class.user_creatable() {
        return Err(QubesError::value(format!("{class} qubes cannot be created")));
    }

    // the argument names the template, and only for template-based classes
    let template = if class.has_template() {
        if call.arg.is_empty() {
            None
        } else {
            if !call.app.borrow().domains.contains_name(&call.arg) {
                return Err(QubesError::value(format!("no such domain: {:?}", call.arg)));
            }
            Some(call.arg.clone())
        }
    } else {
        call.require_no_arg()?;
        None
    };

    let mut name = None;
    let mut label = None;
    let mut pool = None;
    let mut volume_pools: BTreeMap<String, String> = BTreeMap::new();
    for untrusted_param in decode_ascii(untrusted_payload)?.split_whitespace() {
        let Some((untrusted_key, untrusted_value)) = untrusted_param.split_once('=') else {
            return Err(QubesError::protocol("invalid parameter syntax"));
        };
        match untrusted_key {
            "name" => {
                crate::commons::validate_name(untrusted_value)?;
                if name.replace(untrusted_value.to_owned()).is_some() {
                    return Err(QubesError::protocol("duplicated parameters"));
                }
            }
            "label" => {
                if untrusted_value.chars().all(|c| c.is_ascii_digit())
                    || !utils::all_chars_in(untrusted_value, utils::SAFE_KEY_CHARS)
                {
                    return Err(QubesError::value("invalid label"));
                }
                if label.replace(untrusted_value.to_owned()).is_some() {
                    return Err(QubesError::protocol("duplicated parameters"));
                }
            }
            "pool" if allow_pool => {
                if pool.replace(untrusted_value.to_owned()).is_some() {
                    return Err(QubesError::protocol("duplicated pool parameter"));
                }
            }
            untrusted_key if untrusted_key.starts_with("pool:") && allow_pool => {
                let untrusted_volume = &untrusted_key["pool:".len()..];
                if !matches!(untrusted_volume, "root" | "private" | "volatile" | "kernel") {
                    return Err(QubesError::protocol("invalid pool:volume parameter"));
                }
                if volume_pools
                    .insert(untrusted_volume.to_owned(), untrusted_value.to_owned())
                    .is_some()
                {
                    return Err(QubesError::protocol("duplicated pool:volume parameter"));
                }
            }
            _ => return Err(QubesError::protocol("invalid param name")),
        }
    }
    let (Some(name), Some(label)) = (name, label) else {
        return Err(QubesError::protocol("missing name or label"));
    };
    if pool.is_some() && !volume_pools.is_empty() {
        return Err(QubesError::protocol(
            "only one of 'pool=' and 'pool:volume=' can be used",
        ));
    }
    if call.app.borrow().domains.contains_name(&name) {
        return Err(QubesError::value(format!("VM {name} already exists")));
    }

    call.fire_event_for_permission(
        EventArgs::new()
            .arg("name", name.as_str())
            .arg("label", label.as_str()),
    )?;

    let qid = {
        let mut app = call.app.borrow_mut();
        let qid = app::add_new_vm(&mut app, class, &name, &label, template.as_deref())?;
        if let Some(pool) = &pool {
            if let Some(vm) = app.domains.get_mut(qid) {
                for volume in vm.volumes.values_mut() {
                    volume.pool = pool.clone();
                }
            }
        }
        for (volume, pool) in &volume_pools {
            if let Some(config) = app
                .domains
                .get_mut(qid)
                .and_then(|vm| vm.volumes.get_mut(volume))
            {
                config.pool = pool.clone();
            }
        }
        vm::add_tag(&mut app, qid, &format!("created-by-{}", call.src_name))?;
        qid
    };

    let created = lifecycle::create_volumes_on_disk(&call.app, qid).await;
    if let Err(error) = created {
        let mut app = call.app.borrow_mut();
        let _ = app::del_vm(&mut app, qid);
        return Err(error);
    }
    save_app(&call.app)?;
    Ok(None)
}

async fn vm_remove(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    call.fire_event_for_permission(EventArgs::new())?;

    if lifecycle::get_power_state(&call.app, call.dest).await? != crate::commons::PowerState::Halted
    {
        return Err(QubesError::NotHalted {
            vm: call.dest_name.clone(),
        });
    }

    let removed = {
        let mut app = call.app.borrow_mut();
        app::del_vm(&mut app, call.dest)?
    };
    for volume in removed.volumes.values() {
        let pool = match call.app.borrow().get_pool(&volume.pool) {
            Ok(pool) => pool,
            Err(_) => continue,
        };
        if let Err(error) = pool.remove(&removed.name, &volume.name).await {
            log::warn!("error removing volume {} of {}: {error}", volume.name, removed.name);
        }
    }
    call.app.borrow().bus.rm_vm(&removed.name);
    save_app(&call.app)?;
    Ok(None)
}

async fn vm_clone(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    call.require_no_arg()?;
    let mut name = None;
    for untrusted_param in decode_ascii(untrusted_payload)?.split_whitespace() {
        match untrusted_param.split_once('=') {
            Some(("name", untrusted_value)) => {
                crate::commons::validate_name(untrusted_value)?;
                name = Some(untrusted_value.to_owned());
            }
            _ => return Err(QubesError::protocol("invalid param name")),
        }
    }
    let name = name.ok_or_else(|| QubesError::protocol("missing name"))?;

    call.fire_event_for_permission(EventArgs::new().arg("name", name.as_str()))?;

    let (class, label, template) = {
        let app = call.app.borrow();
        let src = app
            .domains
            .get(call.dest)
            .ok_or_else(|| QubesError::value("no such domain"))?;
        let label = property::get_required(&app, Emitter::Vm(call.dest), "label")?
            .to_string();
        let template = if src.class.has_template() {
            property::get(&app, Emitter::Vm(call.dest), "template")?
                .and_then(|v| v.as_vm().map(str::to_owned))
        } else {
            None
        };
        (src.class, label, template)
    };

    let qid = {
        let mut app = call.app.borrow_mut();
        let qid = app::add_new_vm(&mut app, class, &name, &label, template.as_deref())?;
        vm::add_tag(&mut app, qid, &format!("created-by-{}", call.src_name))?;
        qid
    };

    let cloned = async {
        lifecycle::create_volumes_on_disk(&call.app, qid).await?;
        lifecycle::clone_vm(&call.app, call.dest, qid).await
    }
    .await;
    if let Err(error) = cloned {
        let mut app = call.app.borrow_mut();
        let _ = app::del_vm(&mut app, qid);
        return Err(error);
    }
    save_app(&call.app)?;
    Ok(None)
}

struct SubscriptionGuard {
    app: AppRef,
    ids: Vec<u64>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut app = self.app.borrow_mut();
        for id in &self.ids {
            app.remove_subscription(*id);
        }
    }
}

/// Stream events to the client until it disconnects. This is the one
/// cancellable method: the runtime drops the future when the connection
/// goes away, and the guard unhooks the subscriptions.
async fn events_stream(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    let filters = call.fire_event_for_permission(EventArgs::new())?;

    let send_event = call
        .send_event
        .clone()
        .ok_or_else(|| QubesError::Qubes("event streaming unavailable".to_owned()))?;

    let sink_filters = filters.clone();
    let sink: EventSink = Rc::new(move |subject: &str, event: &str, args: &EventArgs| {
        if event.starts_with("mgmt-permission:") {
            return;
        }
        let candidate = FilterCandidate::Event { subject, event };
        if !sink_filters.iter().all(|f| f(&candidate)) {
            return;
        }
        send_event(subject, event, args);
    });

    let ids = {
        let mut app = call.app.borrow_mut();
        if call.dest_name == "dom0" {
            vec![
                app.add_subscription(SubscriberScope::App, "*", Rc::clone(&sink)),
                app.add_subscription(SubscriberScope::AnyVm, "*", Rc::clone(&sink)),
            ]
        } else {
            vec![app.add_subscription(SubscriberScope::Vm(call.dest), "*", Rc::clone(&sink))]
        }
    };
    let _guard = SubscriptionGuard {
        app: call.app.clone(),
        ids,
    };

    // artificial event confirming the subscription is live
    sink("", "connection-established", &EventArgs::new());

    std::future::pending::<()>().await;
    Ok(None)
}
