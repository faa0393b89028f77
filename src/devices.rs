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

//! Device assignments.
//!
//! Devices are grouped by class (`pci`, `block`, `mic`, ...). Within a class
//! an assignment is identified by `(backend_qube, ident)`; attaching the same
//! device twice is rejected, so an assignment's options can only be changed
//! by detaching first.

use std::collections::BTreeMap;

use crate::app::App;
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs};

pub const KNOWN_CLASSES: [&str; 4] = ["pci", "block", "usb", "mic"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAssignment {
    /// Qube exposing the device, by name
    pub backend: String,
    pub ident: String,
    pub options: BTreeMap<String, String>,
    /// Survives qube restarts (persisted in the store)
    pub persistent: bool,
}

impl DeviceAssignment {
    /// Wire identifier, `<backend>+<ident>`.
    pub fn wire_ident(&self) -> String {
        format!("{}+{}", self.backend, self.ident)
    }
}

pub fn assignments(app: &App, qid: u32, class: &str) -> Vec<DeviceAssignment> {
    app.domains
        .get(qid)
        .and_then(|vm| vm.devices.get(class))
        .cloned()
        .unwrap_or_default()
}

/// Attach a device to a qube, firing `device-pre-attach:<class>` (vetoable)
/// and `device-attach:<class>`.
pub fn attach(app: &mut App, qid: u32, class: &str, assignment: DeviceAssignment) -> Result<()> {
    {
        let vm = app
            .domains
            .get(qid)
            .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
        if vm.devices.get(class).is_some_and(|devs| {
            devs.iter()
                .any(|d| d.backend == assignment.backend && d.ident == assignment.ident)
        }) {
            return Err(QubesError::value(format!(
                "device {} of class {class} already attached to {}",
                assignment.wire_ident(),
                vm.name
            )));
        }
    }

    let args = EventArgs::new()
        .arg("device", assignment.wire_ident())
        .arg("devclass", class)
        .arg("persistent", assignment.persistent);
    events::fire_event_pre(
        app,
        Emitter::Vm(qid),
        &format!("device-pre-attach:{class}"),
        &args,
    )?;

    app.domains
        .get_mut(qid)
        .expect("domain vanished mid-attach")
        .devices
        .entry(class.to_owned())
        .or_default()
        .push(assignment);

    events::fire_event(
        app,
        Emitter::Vm(qid),
        &format!("device-attach:{class}"),
        &args,
    )?;
    Ok(())
}

/// Detach a device, firing `device-pre-detach:<class>` and
/// `device-detach:<class>`.
pub fn detach(app: &mut App, qid: u32, class: &str, backend: &str, ident: &str) -> Result<()> {
    let wire_ident = format!("{backend}+{ident}");
    {
        let vm = app
            .domains
            .get(qid)
            .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
        if !vm.devices.get(class).is_some_and(|devs| {
            devs.iter().any(|d| d.backend == backend && d.ident == ident)
        }) {
            return Err(QubesError::value(format!(
                "device {wire_ident} of class {class} not attached to {}",
                vm.name
            )));
        }
    }

    let args = EventArgs::new()
        .arg("device", wire_ident.as_str())
        .arg("devclass", class);
    events::fire_event_pre(
        app,
        Emitter::Vm(qid),
        &format!("device-pre-detach:{class}"),
        &args,
    )?;

    if let Some(devs) = app
        .domains
        .get_mut(qid)
        .expect("domain vanished mid-detach")
        .devices
        .get_mut(class)
    {
        devs.retain(|d| !(d.backend == backend && d.ident == ident));
    }

    events::fire_event(
        app,
        Emitter::Vm(qid),
        &format!("device-detach:{class}"),
        &args,
    )?;
    Ok(())
}
