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

//! The root aggregate.
//!
//! Exactly one [`App`] exists per process, but it is not a global: every
//! component receives it explicitly, so tests can build as many as they like
//! with fake adapters plugged in.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use log::info;
use rand::RngExt;

use crate::commons::{self, Label, VmClass};
use crate::error::{QubesError, Result};
use crate::events::{
    self, Emitter, EventArgs, EventReturn, EventSink, Handler, HandlerEntry, SubscriberScope,
    Subscription,
};
use crate::hypervisor::{HostInfo, HypervisorRef};
use crate::property::{self, PropertyBag, PropertyDef, PropertyType, PropertyValue};
use crate::qdb::ConfigBusRef;
use crate::storage::{self, PoolRef};
use crate::vm::Qube;

/// A collection of qubes, indexed by qid with secondary lookup by name.
#[derive(Default)]
pub struct VmCollection {
    by_qid: BTreeMap<u32, Qube>,
}

impl VmCollection {
    pub fn get(&self, qid: u32) -> Option<&Qube> {
        self.by_qid.get(&qid)
    }

    pub fn get_mut(&mut self, qid: u32) -> Option<&mut Qube> {
        self.by_qid.get_mut(&qid)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Qube> {
        self.by_qid.values().find(|vm| vm.name == name)
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut Qube> {
        self.by_qid.values_mut().find(|vm| vm.name == name)
    }

    pub fn contains_qid(&self, qid: u32) -> bool {
        self.by_qid.contains_key(&qid)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.get_by_name(name).is_some()
    }

    /// Iterate over all qubes, sorted by qid.
    pub fn iter(&self) -> impl Iterator<Item = &Qube> {
        self.by_qid.values()
    }

    pub fn qids(&self) -> Vec<u32> {
        self.by_qid.keys().copied().collect()
    }

    /// All names, sorted lexically.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_qid.values().map(|vm| vm.name.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_qid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_qid.is_empty()
    }

    /// Insert a qube without firing events; creation paths use this for the
    /// not-yet-whole stub and fire `domain-add` themselves.
    pub(crate) fn insert_stub(&mut self, vm: Qube) {
        self.by_qid.insert(vm.qid, vm);
    }

    pub(crate) fn remove_stub(&mut self, qid: u32) {
        self.by_qid.remove(&qid);
    }

    /// Smallest free qid in `[1, MAX_QID)`.
    pub fn get_new_unused_qid(&self) -> Result<u32> {
        (1..commons::MAX_QID)
            .find(|qid| !self.by_qid.contains_key(qid))
            .ok_or_else(|| QubesError::value("cannot find an unused qid"))
    }

    /// Smallest free netid in `[1, MAX_NETID)`.
    pub fn get_new_unused_netid(&self) -> Result<u32> {
        let used: Vec<u32> = self.by_qid.values().map(|vm| vm.netid).collect();
        (1..commons::MAX_NETID)
            .find(|netid| !used.contains(netid))
            .ok_or_else(|| QubesError::value("cannot find an unused netid"))
    }

    /// A free dispid. The scan starts at a random offset so ids of removed
    /// disposables are not handed out again right away.
    pub fn get_new_unused_dispid(&self) -> Result<u32> {
        let used: Vec<u32> = self.by_qid.values().filter_map(|vm| vm.dispid).collect();
        let offset = rand::rng().random_range(1..commons::MAX_DISPID);
        (0..commons::MAX_DISPID)
            .map(|i| 1 + (offset + i - 1) % (commons::MAX_DISPID - 1))
            .find(|dispid| !used.contains(dispid))
            .ok_or_else(|| QubesError::value("cannot find an unused dispid"))
    }
}

pub struct App {
    pub events_enabled: bool,
    pub properties: PropertyBag,
    pub labels: BTreeMap<u32, Label>,
    pub pools: BTreeMap<String, PoolRef>,
    pub default_pool: String,
    pub domains: VmCollection,

    pub host: HostInfo,
    pub hypervisor: HypervisorRef,
    pub bus: ConfigBusRef,
    /// The memory balancer; absent in store-only tooling contexts
    pub memman: Option<std::rc::Rc<crate::qmemman::Balancer>>,

    pub store_path: PathBuf,
    /// Store mtime captured at load; save refuses when the file has moved on
    pub load_timestamp: Option<SystemTime>,

    pub subscriptions: Vec<Subscription>,
    next_subscription_id: u64,

    /// Send tracebacks to API clients on unexpected errors
    pub debug: bool,
}

impl App {
    /// Build an empty model around the given adapters. The administrative
    /// qube and built-in labels are created; nothing is loaded or saved.
    pub fn new(
        store_path: PathBuf,
        hypervisor: HypervisorRef,
        bus: ConfigBusRef,
        host: HostInfo,
    ) -> Self {
        let mut app = App {
            events_enabled: false,
            properties: PropertyBag::new(),
            labels: commons::builtin_labels()
                .into_iter()
                .map(|label| (label.index, label))
                .collect(),
            pools: BTreeMap::new(),
            default_pool: "varlibqubes".to_owned(),
            domains: VmCollection::default(),
            host,
            hypervisor,
            bus,
            memman: None,
            store_path,
            load_timestamp: None,
            subscriptions: Vec::new(),
            next_subscription_id: 1,
            debug: false,
        };

        let mut dom0 = Qube::new(0, "dom0", VmClass::AdminVM);
        dom0.properties
            .insert("label", PropertyValue::Label("black".to_owned()));
        dom0.events_enabled = true;
        app.domains.by_qid.insert(0, dom0);
        app.events_enabled = true;
        app
    }

    pub fn add_pool(&mut self, pool: PoolRef) {
        self.pools.insert(pool.name().to_owned(), pool);
    }

    pub fn get_pool(&self, name: &str) -> Result<PoolRef> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| QubesError::value(format!("no such pool: {name:?}")))
    }

    /// Find a label by index, name, or stringified index.
    pub fn get_label(&self, label: &str) -> Option<&Label> {
        if let Ok(index) = label.parse::<u32>() {
            if let Some(found) = self.labels.get(&index) {
                return Some(found);
            }
        }
        self.labels.values().find(|l| l.name == label)
    }

    pub fn add_label(&mut self, index: u32, color: &str, name: &str) -> Result<()> {
        if index <= commons::MAX_DEFAULT_LABEL {
            return Err(QubesError::value(
                "label indices up to 8 are reserved for built-in labels",
            ));
        }
        if self.labels.contains_key(&index) || self.labels.values().any(|l| l.name == name) {
            return Err(QubesError::value(format!("label {name:?} already exists")));
        }
        let label = Label::new(index, color, name)?;
        self.labels.insert(index, label);
        Ok(())
    }

    pub fn remove_label(&mut self, label: &str) -> Result<()> {
        let label = self
            .get_label(label)
            .cloned()
            .ok_or_else(|| QubesError::value(format!("no such label: {label:?}")))?;
        if label.index <= commons::MAX_DEFAULT_LABEL {
            return Err(QubesError::value("cannot remove a built-in label"));
        }
        let in_use = self.domains.iter().any(|vm| {
            property::get(self, Emitter::Vm(vm.qid), "label")
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_owned))
                .as_deref()
                == Some(label.name.as_str())
        });
        if in_use {
            return Err(QubesError::Qubes("label still in use".to_owned()));
        }
        self.labels.remove(&label.index);
        Ok(())
    }

    pub fn add_subscription(
        &mut self,
        scope: SubscriberScope,
        event: &str,
        sink: EventSink,
    ) -> u64 {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.subscriptions.push(Subscription {
            id,
            scope,
            event: event.to_owned(),
            sink,
        });
        id
    }

    pub fn remove_subscription(&mut self, id: u64) {
        self.subscriptions.retain(|sub| sub.id != id);
    }
}

/// Insert a qube into the collection, firing `domain-add`.
pub fn add_vm(app: &mut App, vm: Qube) -> Result<u32> {
    if app.domains.contains_qid(vm.qid) {
        return Err(QubesError::value(format!(
            "the collection already holds a qube with qid {}",
            vm.qid
        )));
    }
    if app.domains.contains_name(&vm.name) {
        return Err(QubesError::value(format!(
            "the collection already holds a qube named {:?}",
            vm.name
        )));
    }
    let qid = vm.qid;
    let name = vm.name.clone();
    app.domains.by_qid.insert(qid, vm);
    app.domains
        .get_mut(qid)
        .expect("just inserted")
        .events_enabled = true;

    let args = EventArgs::new().arg("vm", name.as_str());
    events::fire_event(app, Emitter::App, "domain-add", &args)?;
    Ok(qid)
}

/// Remove a qube, firing `domain-pre-delete` (vetoable) then `domain-delete`.
pub fn del_vm(app: &mut App, qid: u32) -> Result<Qube> {
    let name = app
        .domains
        .get(qid)
        .map(|vm| vm.name.clone())
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;

    let args = EventArgs::new().arg("vm", name.as_str());
    events::fire_event_pre(app, Emitter::App, "domain-pre-delete", &args)?;

    let vm = app.domains.by_qid.remove(&qid).expect("checked above");
    events::fire_event(app, Emitter::App, "domain-delete", &args)?;
    Ok(vm)
}

/// Create a new qube: allocate a qid, build the stub, assign the initial
/// properties and default volume configuration, and add it to the collection.
pub fn add_new_vm(
    app: &mut App,
    class: VmClass,
    name: &str,
    label: &str,
    template: Option<&str>,
) -> Result<u32> {
    commons::validate_name(name)?;
    if app.domains.contains_name(name) {
        return Err(QubesError::value(format!("VM {name} already exists")));
    }
    if app.get_label(label).is_none() {
        return Err(QubesError::value(format!("no such label: {label:?}")));
    }
    if class == VmClass::AdminVM {
        return Err(QubesError::value(
            "the administrative qube cannot be created",
        ));
    }

    // handle the default template; only template-based classes take one
    let template = match (class.has_template(), template) {
        (false, Some(_)) => {
            return Err(QubesError::value(format!(
                "{class} qubes do not have a template"
            )));
        }
        (false, None) => None,
        (true, Some(t)) => Some(t.to_owned()),
        (true, None) => property::get(app, Emitter::App, "default_template")?
            .and_then(|v| v.as_vm().map(str::to_owned)),
    };
    if class.has_template() && template.is_none() {
        return Err(QubesError::value(format!(
            "{class} qubes require a template and no default is set"
        )));
    }

    let qid = app.domains.get_new_unused_qid()?;
    let mut vm = Qube::new(qid, name, class);
    vm.netid = app.domains.get_new_unused_netid()?;
    vm.volumes = storage::default_volume_config(class, &app.default_pool, template.as_deref());

    // the stub enters the collection silently; property assignment below
    // still validates, and domain-add fires once the qube is whole
    app.domains.by_qid.insert(qid, vm);

    let assign = |app: &mut App, name: &str, value: PropertyValue| -> Result<()> {
        property::set(app, Emitter::Vm(qid), name, value)
    };
    let result = (|| {
        assign(app, "label", PropertyValue::Label(label.to_owned()))?;
        if let Some(template) = &template {
            assign(app, "template", PropertyValue::Vm(Some(template.clone())))?;
        }
        Ok(())
    })();
    if let Err(error) = result {
        app.domains.by_qid.remove(&qid);
        return Err(error);
    }

    app.domains.get_mut(qid).expect("just inserted").events_enabled = true;
    let args = EventArgs::new().arg("vm", name);
    events::fire_event(app, Emitter::App, "domain-add", &args)?;
    info!("created {class} {name} (qid {qid})");
    Ok(qid)
}

//
// global properties
//

fn default_check_updates(_app: &App, _holder: Emitter) -> Result<PropertyValue> {
    Ok(PropertyValue::Bool(true))
}

static APP_PROPS: [PropertyDef; 8] = [
    PropertyDef {
        load_stage: 3,
        allow_none: true,
        doc: "Default netvm for new compute qubes; null leaves them offline",
        ..PropertyDef::base("default_netvm", PropertyType::Vm)
    },
    PropertyDef {
        load_stage: 3,
        allow_none: true,
        doc: "Default netvm for qubes that themselves provide network",
        ..PropertyDef::base("default_fw_netvm", PropertyType::Vm)
    },
    PropertyDef {
        load_stage: 3,
        vm_class: Some(VmClass::TemplateVM),
        doc: "Template for new template-based qubes",
        ..PropertyDef::base("default_template", PropertyType::Vm)
    },
    PropertyDef {
        load_stage: 3,
        allow_none: true,
        doc: "Default disposable template",
        ..PropertyDef::base("default_dispvm", PropertyType::Vm)
    },
    PropertyDef {
        load_stage: 3,
        allow_none: true,
        doc: "Qube used as the package update proxy for the administrative qube",
        ..PropertyDef::base("updatevm", PropertyType::Vm)
    },
    PropertyDef {
        load_stage: 3,
        allow_none: true,
        doc: "Qube used as the time synchronization source",
        ..PropertyDef::base("clockvm", PropertyType::Vm)
    },
    PropertyDef {
        load_stage: 3,
        doc: "Kernel used by qubes with no override",
        ..PropertyDef::base("default_kernel", PropertyType::Str)
    },
    PropertyDef {
        default: Some(default_check_updates),
        doc: "Check for updates inside qubes",
        ..PropertyDef::base("check_updates_vm", PropertyType::Bool)
    },
];

pub fn app_properties() -> &'static [&'static PropertyDef] {
    static TABLE: std::sync::OnceLock<Vec<&'static PropertyDef>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| APP_PROPS.iter().collect())
}

//
// bound event handlers
//

fn on_domain_pre_deleted(
    app: &mut App,
    _emitter: Emitter,
    _event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    let Some(name) = args.get_str("vm") else {
        return Ok(None);
    };
    let Some(qid) = app.domains.get_by_name(name).map(|vm| vm.qid) else {
        return Ok(None);
    };
    let dependents = crate::vm::dependent_vms(app, qid);
    if !dependents.is_empty() {
        let names: Vec<String> = dependents
            .iter()
            .filter_map(|dep| app.domains.get(*dep))
            .map(|vm| vm.name.clone())
            .collect();
        return Err(QubesError::Qubes(format!(
            "cannot remove a template that has dependent qubes: {}",
            names.join(", ")
        )));
    }
    Ok(None)
}

fn on_domain_deleted(
    app: &mut App,
    _emitter: Emitter,
    _event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    let Some(name) = args.get_str("vm") else {
        return Ok(None);
    };

    for propname in [
        "default_netvm",
        "default_fw_netvm",
        "clockvm",
        "updatevm",
        "default_template",
        "default_dispvm",
    ] {
        let points_here = app
            .properties
            .get(propname)
            .and_then(|v| v.as_vm())
            .is_some_and(|target| target == name);
        if points_here {
            property::reset(app, Emitter::App, propname)?;
        }
    }

    // per-qube references die with the referent too
    let holders: Vec<u32> = app.domains.qids();
    for qid in holders {
        for propname in ["netvm", "default_dispvm"] {
            let points_here = app
                .domains
                .get(qid)
                .and_then(|vm| vm.properties.get(propname))
                .and_then(|v| v.as_vm())
                .is_some_and(|target| target == name);
            if points_here {
                property::reset(app, Emitter::Vm(qid), propname)?;
            }
        }
    }
    Ok(None)
}

fn on_property_pre_set_clockvm(
    app: &mut App,
    _emitter: Emitter,
    _event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    let Some(new_name) = args.get_str("newvalue") else {
        return Ok(None);
    };
    if new_name.is_empty() {
        return Ok(None);
    }
    let qid = app
        .domains
        .get_by_name(new_name)
        .map(|vm| vm.qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {new_name:?}")))?;
    if crate::features::get_bool(app, qid, "services/ntpd", false) {
        return Err(QubesError::Vm {
            vm: new_name.to_owned(),
            msg: "cannot be the clock source with the ntpd service enabled".to_owned(),
        });
    }
    crate::features::set(app, qid, "services/ntpd", crate::features::FeatureValue::Bool(false))?;
    Ok(None)
}

fn on_property_pre_set_default_netvm(
    app: &mut App,
    _emitter: Emitter,
    _event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    let new_name = args.get_str("newvalue").unwrap_or("");
    let old_name = args.get_str("oldvalue").unwrap_or("");
    if new_name.is_empty() || old_name.is_empty() {
        return Ok(None);
    }
    let old_running = app
        .domains
        .get_by_name(old_name)
        .is_some_and(|vm| vm.is_running());
    let new_running = app
        .domains
        .get_by_name(new_name)
        .is_some_and(|vm| vm.is_running());
    let old_qid = app.domains.get_by_name(old_name).map(|vm| vm.qid);
    let has_clients = old_qid
        .map(|qid| !crate::vm::vms_connected_to(app, qid).is_empty())
        .unwrap_or(false);
    if old_running && !new_running && has_clients {
        return Err(QubesError::NotRunning {
            vm: new_name.to_owned(),
        });
    }
    Ok(None)
}

fn on_property_set_default_netvm(
    app: &mut App,
    _emitter: Emitter,
    event: &str,
    args: &EventArgs,
) -> Result<Option<EventReturn>> {
    // qubes tracking the default see their effective netvm change
    let for_providers = event.ends_with("default_fw_netvm");
    let affected: Vec<u32> = app
        .domains
        .iter()
        .filter(|vm| vm.class != VmClass::AdminVM)
        .filter(|vm| !vm.properties.contains("netvm"))
        .filter(|vm| crate::vm::provides_network(app, vm.qid) == for_providers)
        .map(|vm| vm.qid)
        .collect();
    for qid in affected {
        events::fire_event(app, Emitter::Vm(qid), "property-del:netvm", args)?;
    }
    Ok(None)
}

static APP_HANDLERS: [HandlerEntry; 6] = [
    HandlerEntry {
        event: "domain-pre-delete",
        handler: on_domain_pre_deleted as Handler,
    },
    HandlerEntry {
        event: "domain-delete",
        handler: on_domain_deleted as Handler,
    },
    HandlerEntry {
        event: "property-pre-set:clockvm",
        handler: on_property_pre_set_clockvm as Handler,
    },
    HandlerEntry {
        event: "property-pre-set:default_netvm",
        handler: on_property_pre_set_default_netvm as Handler,
    },
    HandlerEntry {
        event: "property-set:default_netvm",
        handler: on_property_set_default_netvm as Handler,
    },
    HandlerEntry {
        event: "property-set:default_fw_netvm",
        handler: on_property_set_default_netvm as Handler,
    },
];

pub fn handler_chain() -> &'static [&'static [HandlerEntry]] {
    static CHAIN: [&[HandlerEntry]; 1] = [&APP_HANDLERS];
    &CHAIN
}
