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

//! The qube object model.
//!
//! A [`Qube`] is plain data: identity, sparse property storage and the owned
//! collections. All mutation goes through module-level functions that take
//! the whole [`App`], because mutations fire events whose handlers may look
//! at (or change) any part of the model. A qube never holds a reference to
//! another qube; relations are stored as names and resolved through the
//! collection on every use.

pub mod dispvm;
pub mod lifecycle;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::OnceLock;

use uuid::Uuid;

use crate::app::App;
use crate::commons::{self, PowerState, VmClass};
use crate::devices::DeviceAssignment;
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs, EventReturn, Handler, HandlerEntry};
use crate::firewall::Firewall;
use crate::property::{self, PropertyDef, PropertyType, PropertyValue};
use crate::storage::VolumeConfig;

/// A compartment descriptor.
pub struct Qube {
    pub qid: u32,
    pub name: String,
    pub uuid: Uuid,
    pub class: VmClass,

    pub events_enabled: bool,
    pub properties: property::PropertyBag,

    pub features: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub devices: BTreeMap<String, Vec<DeviceAssignment>>,
    pub firewall: Firewall,
    pub volumes: BTreeMap<String, VolumeConfig>,

    /// Network slot id; allocated like the qid
    pub netid: u32,
    /// Disposable slot id; only for disposable qubes
    pub dispid: Option<u32>,
    /// Kill and remove this qube when its qrexec session completes
    pub auto_cleanup: bool,

    /// Hypervisor runtime id; -1 when not running
    pub xid: i64,
    /// Last state the daemon observed; authoritative state always comes from
    /// the hypervisor, this cache only feeds synchronous invariant checks
    pub power_state: PowerState,
    /// Whether the qrexec helper for this qube is up
    pub qrexec_running: bool,

    /// Serializes lifecycle operations on this qube
    pub op_lock: Rc<tokio::sync::Mutex<()>>,
}

impl Qube {
    pub fn new(qid: u32, name: &str, class: VmClass) -> Self {
        Qube {
            qid,
            name: name.to_owned(),
            uuid: Uuid::new_v4(),
            class,
            events_enabled: false,
            properties: property::PropertyBag::new(),
            features: BTreeMap::new(),
            tags: BTreeSet::new(),
            devices: BTreeMap::new(),
            firewall: Firewall::allow_all(),
            volumes: BTreeMap::new(),
            netid: qid,
            dispid: None,
            auto_cleanup: false,
            xid: -1,
            power_state: PowerState::Halted,
            qrexec_running: false,
            op_lock: Rc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.power_state, PowerState::Halted | PowerState::NA)
    }

    pub fn is_running(&self) -> bool {
        self.power_state.is_running()
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self.power_state,
            PowerState::Paused | PowerState::Suspended
        )
    }

    /// IP address of this qube, derived from its stable id. Disposable qubes
    /// draw from a separate network so their addresses never clash with the
    /// qid-based ones.
    pub fn ip(&self) -> Option<String> {
        if !self.is_networked() {
            return None;
        }
        Some(match self.dispid {
            Some(dispid) => format!("10.138.{}.{}", (dispid >> 8) & 0xff, dispid & 0xff),
            None => format!("10.137.{}.{}", (self.qid >> 8) & 0xff, self.qid & 0xff),
        })
    }

    /// Gateway address for qubes that use this qube as their netvm.
    pub fn gateway(&self, app: &App) -> Option<String> {
        if provides_network(app, self.qid) {
            self.ip()
        } else {
            None
        }
    }

    pub fn dns(&self) -> (&'static str, &'static str) {
        ("10.139.1.1", "10.139.1.2")
    }

    fn is_networked(&self) -> bool {
        self.class != VmClass::AdminVM
    }
}

/// Resolve the netvm of a qube, as a qid.
pub fn netvm_of(app: &App, qid: u32) -> Option<u32> {
    property::get(app, Emitter::Vm(qid), "netvm")
        .ok()
        .flatten()
        .and_then(|v| v.as_vm().map(str::to_owned))
        .and_then(|name| app.domains.get_by_name(&name).map(|vm| vm.qid))
}

/// Resolve the template of a qube, as a qid.
pub fn template_of(app: &App, qid: u32) -> Option<u32> {
    property::get(app, Emitter::Vm(qid), "template")
        .ok()
        .flatten()
        .and_then(|v| v.as_vm().map(str::to_owned))
        .and_then(|name| app.domains.get_by_name(&name).map(|vm| vm.qid))
}

pub fn provides_network(app: &App, qid: u32) -> bool {
    property::get(app, Emitter::Vm(qid), "provides_network")
        .ok()
        .flatten()
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn template_for_dispvms(app: &App, qid: u32) -> bool {
    property::get(app, Emitter::Vm(qid), "template_for_dispvms")
        .ok()
        .flatten()
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Qubes that use the given qube as their netvm. Computed on demand; nothing
/// stores this relation.
pub fn connected_vms(app: &App, qid: u32) -> Vec<u32> {
    app.domains
        .iter()
        .filter(|vm| netvm_of(app, vm.qid) == Some(qid))
        .map(|vm| vm.qid)
        .collect()
}

/// Template-based qubes whose template is the given qube.
pub fn dependent_vms(app: &App, qid: u32) -> Vec<u32> {
    app.domains
        .iter()
        .filter(|vm| template_of(app, vm.qid) == Some(qid))
        .map(|vm| vm.qid)
        .collect()
}

/// Transitive closure of [`connected_vms`].
pub fn vms_connected_to(app: &App, qid: u32) -> Vec<u32> {
    let mut dependent = Vec::new();
    let mut queue = vec![qid];
    while let Some(cur) = queue.pop() {
        for vm in connected_vms(app, cur) {
            if vm != qid && !dependent.contains(&vm) {
                dependent.push(vm);
                queue.push(vm);
            }
        }
    }
    dependent
}

//
// tags
//

/// Names matching this prefix are managed by the daemon itself; the
/// permission handler rejects changing them over the API.
pub const RESERVED_TAG_PREFIX: &str = "created-by-";

pub fn add_tag(app: &mut App, qid: u32, tag: &str) -> Result<()> {
    commons::validate_name(tag)
        .map_err(|_| QubesError::value(format!("invalid tag name: {tag:?}")))?;
    let vm = app
        .domains
        .get_mut(qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
    if !vm.tags.insert(tag.to_owned()) {
        return Ok(());
    }
    let args = EventArgs::new().arg("tag", tag);
    events::fire_event(app, Emitter::Vm(qid), &format!("domain-tag-add:{tag}"), &args)?;
    Ok(())
}

pub fn remove_tag(app: &mut App, qid: u32, tag: &str) -> Result<()> {
    let vm = app
        .domains
        .get_mut(qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
    let vm_name = vm.name.clone();
    if !vm.tags.remove(tag) {
        return Err(QubesError::TagNotFound {
            vm: vm_name,
            tag: tag.to_owned(),
        });
    }
    let args = EventArgs::new().arg("tag", tag);
    events::fire_event(
        app,
        Emitter::Vm(qid),
        &format!("domain-tag-delete:{tag}"),
        &args,
    )?;
    Ok(())
}

//
// property tables
//

fn field_default(
    field: fn(&Qube) -> PropertyValue,
) -> impl Fn(&App, Emitter) -> Result<PropertyValue> {
    move |app, holder| match holder {
        Emitter::Vm(qid) => app
            .domains
            .get(qid)
            .map(field)
            .ok_or_else(|| QubesError::value("no such domain")),
        Emitter::App => Err(QubesError::value("not a qube property")),
    }
}

fn default_qid(app: &App, holder: Emitter) -> Result<PropertyValue> {
    field_default(|vm| PropertyValue::Int(vm.qid as u64))(app, holder)
}

fn default_name(app: &App, holder: Emitter) -> Result<PropertyValue> {
    field_default(|vm| PropertyValue::Str(vm.name.clone()))(app, holder)
}

fn default_uuid(app: &App, holder: Emitter) -> Result<PropertyValue> {
    field_default(|vm| PropertyValue::Str(vm.uuid.to_string()))(app, holder)
}

fn default_dispid(app: &App, holder: Emitter) -> Result<PropertyValue> {
    match holder {
        Emitter::Vm(qid) => app
            .domains
            .get(qid)
            .and_then(|vm| vm.dispid)
            .map(|dispid| PropertyValue::Int(dispid as u64))
            .ok_or_else(|| QubesError::value("dispid is not set")),
        Emitter::App => Err(QubesError::value("not a qube property")),
    }
}

fn setter_reject_identity(
    _app: &App,
    _holder: Emitter,
    def: &PropertyDef,
    _value: PropertyValue,
) -> Result<PropertyValue> {
    Err(QubesError::value(format!(
        "property {:?} cannot be set directly",
        def.name
    )))
}

fn setter_memory(
    app: &App,
    _holder: Emitter,
    _def: &PropertyDef,
    value: PropertyValue,
) -> Result<PropertyValue> {
    let kib = value.as_int().unwrap_or(0);
    if kib == 0 {
        return Err(QubesError::value("memory must be positive"));
    }
    if kib * 1024 > app.host.memory_total {
        return Err(QubesError::value(format!(
            "memory {kib} KiB exceeds host total"
        )));
    }
    Ok(value)
}

fn setter_maxmem(
    app: &App,
    holder: Emitter,
    _def: &PropertyDef,
    value: PropertyValue,
) -> Result<PropertyValue> {
    let kib = value.as_int().unwrap_or(0);
    let memory = property::get(app, holder, "memory")?
        .and_then(|v| v.as_int())
        .unwrap_or(commons::DEFAULT_MEMORY_KIB);
    if kib > memory * 10 {
        return Err(QubesError::value(format!(
            "maxmem {kib} KiB exceeds 10 times the initial memory"
        )));
    }
    Ok(value)
}

fn setter_vcpus(
    app: &App,
    _holder: Emitter,
    _def: &PropertyDef,
    value: PropertyValue,
) -> Result<PropertyValue> {
    let vcpus = value.as_int().unwrap_or(0);
    if vcpus < 1 {
        return Err(QubesError::value("vcpus must be at least 1"));
    }
    if vcpus > app.host.cpus as u64 {
        return Err(QubesError::value(format!(
            "vcpus {vcpus} exceeds host cpu count"
        )));
    }
    Ok(value)
}

fn setter_qrexec_timeout(
    _app: &App,
    _holder: Emitter,
    _def: &PropertyDef,
    value: PropertyValue,
) -> Result<PropertyValue> {
    if value.as_int().unwrap_or(0) == 0 {
        return Err(QubesError::value("qrexec_timeout must be positive"));
    }
    Ok(value)
}

fn setter_mac(
    _app: &App,
    _holder: Emitter,
    _def: &PropertyDef,
    value: PropertyValue,
) -> Result<PropertyValue> {
    match value.as_str() {
        Some(mac) => Ok(PropertyValue::Str(commons::validate_mac(mac)?)),
        None => Err(QubesError::value("MAC address must be a string")),
    }
}

fn setter_virt_mode(
    _app: &App,
    _holder: Emitter,
    _def: &PropertyDef,
    value: PropertyValue,
) -> Result<PropertyValue> {
    match value.as_str() {
        Some(mode) => {
            commons::VirtMode::parse(mode)?;
            Ok(value)
        }
        None => Err(QubesError::value("virt_mode must be a string")),
    }
}

fn default_memory(_app: &App, _holder: Emitter) -> Result<PropertyValue> {
    Ok(PropertyValue::Int(commons::DEFAULT_MEMORY_KIB))
}

fn default_maxmem(app: &App, holder: Emitter) -> Result<PropertyValue> {
    let memory = property::get(app, holder, "memory")?
        .and_then(|v| v.as_int())
        .unwrap_or(commons::DEFAULT_MEMORY_KIB);
    let host_cap = app.host.memory_total / 1024;
    Ok(PropertyValue::Int((memory * 4).min(host_cap)))
}

fn default_vcpus(app: &App, _holder: Emitter) -> Result<PropertyValue> {
    Ok(PropertyValue::Int((app.host.cpus as u64).min(2)))
}

fn default_kernel(app: &App, _holder: Emitter) -> Result<PropertyValue> {
    property::get_required(app, Emitter::App, "default_kernel")
}

fn default_kernelopts(_app: &App, _holder: Emitter) -> Result<PropertyValue> {
    Ok(PropertyValue::Str(commons::DEFAULT_KERNELOPTS.to_owned()))
}

fn default_netvm(app: &App, _holder: Emitter) -> Result<PropertyValue> {
    match property::get(app, Emitter::App, "default_netvm")? {
        Some(value) => Ok(value),
        None => Ok(PropertyValue::Vm(None)),
    }
}

fn default_default_dispvm(app: &App, _holder: Emitter) -> Result<PropertyValue> {
    match property::get(app, Emitter::App, "default_dispvm")? {
        Some(value) => Ok(value),
        None => Ok(PropertyValue::Vm(None)),
    }
}

fn default_provides_network(app: &App, holder: Emitter) -> Result<PropertyValue> {
    field_default(|vm| PropertyValue::Bool(vm.class == VmClass::NetVM))(app, holder)
}

fn default_false(_app: &App, _holder: Emitter) -> Result<PropertyValue> {
    Ok(PropertyValue::Bool(false))
}

fn default_true(_app: &App, _holder: Emitter) -> Result<PropertyValue> {
    Ok(PropertyValue::Bool(true))
}

static BASE_PROPS: [PropertyDef; 4] = [
    PropertyDef {
        write_once: true,
        clone: false,
        default: Some(default_qid),
        setter: Some(setter_reject_identity),
        doc: "Internal, persistent identifier of this qube",
        ..PropertyDef::base("qid", PropertyType::Int)
    },
    PropertyDef {
        clone: false,
        default: Some(default_name),
        setter: Some(setter_reject_identity),
        doc: "Name of this qube",
        ..PropertyDef::base("name", PropertyType::Str)
    },
    PropertyDef {
        write_once: true,
        clone: false,
        default: Some(default_uuid),
        setter: Some(setter_reject_identity),
        doc: "UUID of this qube",
        ..PropertyDef::base("uuid", PropertyType::Str)
    },
    PropertyDef {
        save_via_ref: true,
        doc: "Colorful label assigned to this qube",
        ..PropertyDef::base("label", PropertyType::Label)
    },
];

static QUBESVM_PROPS: [PropertyDef; 14] = [
    PropertyDef {
        clone: false,
        default: Some(default_false),
        doc: "Installed from a system package; renaming is forbidden",
        ..PropertyDef::base("installed_by_rpm", PropertyType::Bool)
    },
    PropertyDef {
        default: Some(|_, _| Ok(PropertyValue::Str("pv".to_owned()))),
        setter: Some(setter_virt_mode),
        doc: "Virtualization mode: pv or hvm",
        ..PropertyDef::base("virt_mode", PropertyType::Str)
    },
    PropertyDef {
        default: Some(default_memory),
        setter: Some(setter_memory),
        doc: "Memory assigned at startup, in KiB",
        ..PropertyDef::base("memory", PropertyType::Int)
    },
    PropertyDef {
        default: Some(default_maxmem),
        setter: Some(setter_maxmem),
        doc: "Upper bound the memory balancer may balloon this qube to, in KiB",
        ..PropertyDef::base("maxmem", PropertyType::Int)
    },
    PropertyDef {
        default: Some(default_vcpus),
        setter: Some(setter_vcpus),
        doc: "Number of virtual cpus",
        ..PropertyDef::base("vcpus", PropertyType::Int)
    },
    PropertyDef {
        save_via_ref: true,
        default: Some(default_kernel),
        doc: "Kernel this qube boots; empty means the bundled one",
        ..PropertyDef::base("kernel", PropertyType::Str)
    },
    PropertyDef {
        load_stage: 4,
        default: Some(default_kernelopts),
        doc: "Kernel command line",
        ..PropertyDef::base("kernelopts", PropertyType::Str)
    },
    PropertyDef {
        default: Some(default_false),
        doc: "Verbose logging and debug-friendly boot",
        ..PropertyDef::base("debug", PropertyType::Bool)
    },
    PropertyDef {
        default: Some(|_, _| Ok(PropertyValue::Str("user".to_owned()))),
        doc: "Default user for service calls",
        ..PropertyDef::base("default_user", PropertyType::Str)
    },
    PropertyDef {
        default: Some(|_, _| Ok(PropertyValue::Int(commons::DEFAULT_QREXEC_TIMEOUT))),
        setter: Some(setter_qrexec_timeout),
        doc: "Seconds to wait for the qube to accept a service call",
        ..PropertyDef::base("qrexec_timeout", PropertyType::Int)
    },
    PropertyDef {
        default: Some(default_false),
        doc: "Start this qube at system boot",
        ..PropertyDef::base("autostart", PropertyType::Bool)
    },
    PropertyDef {
        default: Some(default_true),
        doc: "Include this qube in backups",
        ..PropertyDef::base("include_in_backups", PropertyType::Bool)
    },
    PropertyDef {
        load_stage: 4,
        allow_none: true,
        default: Some(default_default_dispvm),
        doc: "Disposable template new disposables for this qube are based on",
        ..PropertyDef::base("default_dispvm", PropertyType::Vm)
    },
    PropertyDef {
        default: Some(default_false),
        doc: "May serve as a base for disposable qubes",
        ..PropertyDef::base("template_for_dispvms", PropertyType::Bool)
    },
];

static NET_PROPS: [PropertyDef; 3] = [
    PropertyDef {
        default: Some(|_, _| Ok(PropertyValue::Str("00:16:3e:5e:6c:00".to_owned()))),
        setter: Some(setter_mac),
        doc: "MAC address of the NIC emulated inside the qube",
        ..PropertyDef::base("mac", PropertyType::Str)
    },
    PropertyDef {
        load_stage: 4,
        allow_none: true,
        default: Some(default_netvm),
        doc: "Qube that provides network to this one; null means disconnected",
        ..PropertyDef::base("netvm", PropertyType::Vm)
    },
    PropertyDef {
        default: Some(default_provides_network),
        doc: "Whether this qube can act as a network provider",
        ..PropertyDef::base("provides_network", PropertyType::Bool)
    },
];

static APPVM_PROPS: [PropertyDef; 1] = [PropertyDef {
    load_stage: 4,
    vm_class: Some(VmClass::TemplateVM),
    clone: false,
    doc: "Template this qube's root volume is based on",
    ..PropertyDef::base("template", PropertyType::Vm)
}];

static DISPVM_PROPS: [PropertyDef; 2] = [
    PropertyDef {
        load_stage: 4,
        clone: false,
        doc: "Disposable template this qube was created from",
        ..PropertyDef::base("template", PropertyType::Vm)
    },
    PropertyDef {
        write_once: true,
        clone: false,
        default: Some(default_dispid),
        setter: Some(setter_reject_identity),
        doc: "Single-use slot identifier of this disposable",
        ..PropertyDef::base("dispid", PropertyType::Int)
    },
];

/// Property descriptors of a class, base tables first, in declaration order.
pub fn properties_for_class(class: VmClass) -> &'static [&'static PropertyDef] {
    static TABLES: OnceLock<HashMap<VmClass, Vec<&'static PropertyDef>>> = OnceLock::new();
    let tables = TABLES.get_or_init(|| {
        let mut map = HashMap::new();
        for class in VmClass::ALL {
            let mut defs: Vec<&'static PropertyDef> = BASE_PROPS.iter().collect();
            if class != VmClass::AdminVM {
                defs.extend(QUBESVM_PROPS.iter());
                defs.extend(NET_PROPS.iter());
            }
            match class {
                VmClass::AppVM => defs.extend(APPVM_PROPS.iter()),
                VmClass::DispVM => defs.extend(DISPVM_PROPS.iter()),
                _ => {}
            }
            map.insert(class, defs);
        }
        map
    });
    tables[&class].as_slice()
}

//
// bound event handlers
//

fn on_tag_permission(
    _app: &mut App,
    _emitter: Emitter,
    _event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    if let Some(arg) = args.get_str("arg") {
        if arg.starts_with(RESERVED_TAG_PREFIX) {
            return Err(QubesError::PermissionDenied(
                "changing this tag is prohibited".to_owned(),
            ));
        }
    }
    Ok(None)
}

fn on_property_pre_set_netvm(
    app: &mut App,
    emitter: Emitter,
    _event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    let Emitter::Vm(qid) = emitter else {
        return Ok(None);
    };
    let Some(new_netvm) = args.get_str("newvalue") else {
        return Ok(None);
    };
    if new_netvm.is_empty() {
        return Ok(None);
    }

    let new_qid = app
        .domains
        .get_by_name(new_netvm)
        .map(|vm| vm.qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {new_netvm:?}")))?;

    if !provides_network(app, new_qid) {
        return Err(QubesError::value(format!(
            "the {new_netvm} qube does not provide network"
        )));
    }
    if new_qid == qid || vms_connected_to(app, qid).contains(&new_qid) {
        return Err(QubesError::value("loops in network are unsupported"));
    }

    let self_running = app.domains.get(qid).is_some_and(|vm| vm.is_running());
    let target_running = app.domains.get(new_qid).is_some_and(|vm| vm.is_running());
    if self_running && !target_running {
        return Err(QubesError::NotStarted {
            vm: new_netvm.to_owned(),
        });
    }
    Ok(None)
}

fn on_property_pre_set_template(
    app: &mut App,
    emitter: Emitter,
    _event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    let Emitter::Vm(qid) = emitter else {
        return Ok(None);
    };
    let vm = app
        .domains
        .get(qid)
        .ok_or_else(|| QubesError::value("no such domain"))?;
    if !vm.is_halted() {
        return Err(QubesError::NotHalted {
            vm: vm.name.clone(),
        });
    }
    if vm.class == VmClass::DispVM {
        if let Some(base) = args.get_str("newvalue") {
            let base_qid = app
                .domains
                .get_by_name(base)
                .map(|vm| vm.qid)
                .ok_or_else(|| QubesError::value(format!("no such domain: {base:?}")))?;
            if !template_for_dispvms(app, base_qid) {
                return Err(QubesError::value(format!(
                    "{base} cannot serve as a disposable template"
                )));
            }
        }
    }
    Ok(None)
}

fn on_domain_pre_shutdown(
    app: &mut App,
    emitter: Emitter,
    _event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    let Emitter::Vm(qid) = emitter else {
        return Ok(None);
    };
    if !provides_network(app, qid) {
        return Ok(None);
    }
    let force = args.get("force").and_then(|v| v.as_bool()).unwrap_or(false);
    let running: Vec<String> = connected_vms(app, qid)
        .into_iter()
        .filter_map(|dep| app.domains.get(dep))
        .filter(|vm| vm.is_running())
        .map(|vm| vm.name.clone())
        .collect();
    if !running.is_empty() && !force {
        let name = app.domains.get(qid).map(|vm| vm.name.clone()).unwrap_or_default();
        return Err(QubesError::Vm {
            vm: name,
            msg: format!("there are other qubes connected to this one: {}", running.join(", ")),
        });
    }
    Ok(None)
}

static BASE_VM_HANDLERS: [HandlerEntry; 2] = [
    HandlerEntry {
        event: "mgmt-permission:admin.vm.tag.Set",
        handler: on_tag_permission as Handler,
    },
    HandlerEntry {
        event: "mgmt-permission:admin.vm.tag.Remove",
        handler: on_tag_permission as Handler,
    },
];

static QUBESVM_HANDLERS: [HandlerEntry; 3] = [
    HandlerEntry {
        event: "property-pre-set:netvm",
        handler: on_property_pre_set_netvm as Handler,
    },
    HandlerEntry {
        event: "property-pre-set:template",
        handler: on_property_pre_set_template as Handler,
    },
    HandlerEntry {
        event: "domain-pre-shutdown",
        handler: on_domain_pre_shutdown as Handler,
    },
];

/// Bound handler tables of a class, base-to-derived.
pub fn handler_chain(class: VmClass) -> &'static [&'static [HandlerEntry]] {
    static ADMIN_CHAIN: [&[HandlerEntry]; 1] = [&BASE_VM_HANDLERS];
    static VM_CHAIN: [&[HandlerEntry]; 2] = [&BASE_VM_HANDLERS, &QUBESVM_HANDLERS];
    match class {
        VmClass::AdminVM => &ADMIN_CHAIN,
        _ => &VM_CHAIN,
    }
}
