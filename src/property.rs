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

//! Typed properties carried by the application object and by every qube.
//!
//! A property is described once, in a per-class compile-time table of
//! [`PropertyDef`] rows, and stored sparsely: a holder keeps only the values
//! that were explicitly set. Reading an unset property evaluates its default;
//! deleting a set property restores the default. Every mutation fires the
//! `property-pre-set` / `property-set` (or `-del`) event pair, and any
//! pre-handler may veto the change.

use std::collections::HashMap;
use std::fmt;

use crate::app::App;
use crate::commons::VmClass;
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs, EventValue};
use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Str,
    Int,
    Bool,
    /// Stored as a qube name (empty for null), resolved through the collection
    Vm,
    /// Stored as a label name
    Label,
}

impl PropertyType {
    /// Type tag used by `admin.*.property.Get` responses.
    pub fn wire_name(self) -> &'static str {
        match self {
            PropertyType::Str => "str",
            PropertyType::Int => "int",
            PropertyType::Bool => "bool",
            PropertyType::Vm => "vm",
            PropertyType::Label => "label",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Int(u64),
    Bool(bool),
    Vm(Option<String>),
    Label(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            PropertyValue::Label(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The referenced qube name for a vm-typed value.
    pub fn as_vm(&self) -> Option<&str> {
        match self {
            PropertyValue::Vm(Some(name)) => Some(name),
            _ => None,
        }
    }

    fn matches(&self, ptype: PropertyType) -> bool {
        matches!(
            (self, ptype),
            (PropertyValue::Str(_), PropertyType::Str)
                | (PropertyValue::Int(_), PropertyType::Int)
                | (PropertyValue::Bool(_), PropertyType::Bool)
                | (PropertyValue::Vm(_), PropertyType::Vm)
                | (PropertyValue::Label(_), PropertyType::Label)
        )
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Str(s) => f.write_str(s),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Bool(b) => f.write_str(if *b { "True" } else { "False" }),
            PropertyValue::Vm(Some(name)) => f.write_str(name),
            PropertyValue::Vm(None) => Ok(()),
            PropertyValue::Label(name) => f.write_str(name),
        }
    }
}

impl From<PropertyValue> for EventValue {
    fn from(value: PropertyValue) -> EventValue {
        match value {
            PropertyValue::Str(s) => EventValue::Str(s),
            PropertyValue::Int(i) => EventValue::Int(i as i64),
            PropertyValue::Bool(b) => EventValue::Bool(b),
            PropertyValue::Vm(Some(name)) => EventValue::Str(name),
            PropertyValue::Vm(None) => EventValue::Null,
            PropertyValue::Label(name) => EventValue::Str(name),
        }
    }
}

/// Default resolver; receives the app and the holder. Returning an error
/// means "this property has no default" and surfaces as an absent value.
pub type DefaultFn = fn(&App, Emitter) -> Result<PropertyValue>;

/// Validating/normalizing setter, applied after the pre-set event.
pub type SetterFn = fn(&App, Emitter, &PropertyDef, PropertyValue) -> Result<PropertyValue>;

/// One property descriptor row.
pub struct PropertyDef {
    pub name: &'static str,
    pub ptype: PropertyType,
    pub write_once: bool,
    /// Participates in qube clone operations
    pub clone: bool,
    /// Persisted by reference name instead of inline value
    pub save_via_ref: bool,
    /// Which load stage resolves this property (2, 3 or 4)
    pub load_stage: u8,
    /// vm-typed only: whether null is an acceptable value
    pub allow_none: bool,
    /// vm-typed only: class the referenced qube must have
    pub vm_class: Option<VmClass>,
    pub default: Option<DefaultFn>,
    pub setter: Option<SetterFn>,
    pub doc: &'static str,
}

impl PropertyDef {
    pub const fn base(name: &'static str, ptype: PropertyType) -> Self {
        PropertyDef {
            name,
            ptype,
            write_once: false,
            clone: true,
            save_via_ref: false,
            load_stage: 2,
            allow_none: false,
            vm_class: None,
            default: None,
            setter: None,
            doc: "",
        }
    }

    /// Parse and validate a value arriving over the wire for this property.
    ///
    /// The payload is untrusted until it survives this function; the strict
    /// ASCII decode and per-type parse are the trust boundary.
    pub fn sanitize(&self, untrusted_payload: &[u8]) -> Result<PropertyValue> {
        let untrusted_value = utils::decode_ascii(untrusted_payload)?;
        if untrusted_value.contains(['\n', '\0']) {
            return Err(QubesError::protocol("invalid characters in property value"));
        }
        let value = untrusted_value;
        match self.ptype {
            PropertyType::Str => Ok(PropertyValue::Str(value)),
            PropertyType::Int => value
                .parse::<u64>()
                .map(PropertyValue::Int)
                .map_err(|_| QubesError::value(format!("invalid integer: {value:?}"))),
            PropertyType::Bool => parse_bool(&value),
            PropertyType::Vm => {
                if value.is_empty() {
                    Ok(PropertyValue::Vm(None))
                } else {
                    crate::commons::validate_name(&value)?;
                    Ok(PropertyValue::Vm(Some(value)))
                }
            }
            PropertyType::Label => {
                if value.is_empty() {
                    Err(QubesError::value("label name must not be empty"))
                } else {
                    Ok(PropertyValue::Label(value))
                }
            }
        }
    }
}

fn parse_bool(value: &str) -> Result<PropertyValue> {
    match value {
        "True" | "true" | "on" | "1" => Ok(PropertyValue::Bool(true)),
        "False" | "false" | "off" | "0" => Ok(PropertyValue::Bool(false)),
        other => Err(QubesError::value(format!("invalid boolean: {other:?}"))),
    }
}

/// Sparse property storage embedded in each holder.
#[derive(Debug, Default)]
pub struct PropertyBag {
    values: HashMap<&'static str, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        PropertyBag::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: &'static str, value: PropertyValue) {
        self.values.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Value accepted by [`assign`]: either a concrete value, or the DEFAULT
/// sentinel, which is equivalent to deleting the property.
pub enum SetValue {
    Value(PropertyValue),
    Default,
}

fn defs_for(app: &App, holder: Emitter) -> Result<&'static [&'static PropertyDef]> {
    match holder {
        Emitter::App => Ok(crate::app::app_properties()),
        Emitter::Vm(qid) => {
            let vm = app
                .domains
                .get(qid)
                .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
            Ok(crate::vm::properties_for_class(vm.class))
        }
    }
}

fn holder_name(app: &App, holder: Emitter) -> String {
    match holder {
        Emitter::App => "dom0".to_owned(),
        Emitter::Vm(qid) => app
            .domains
            .get(qid)
            .map(|vm| vm.name.clone())
            .unwrap_or_default(),
    }
}

fn bag<'a>(app: &'a App, holder: Emitter) -> Option<&'a PropertyBag> {
    match holder {
        Emitter::App => Some(&app.properties),
        Emitter::Vm(qid) => app.domains.get(qid).map(|vm| &vm.properties),
    }
}

fn bag_mut<'a>(app: &'a mut App, holder: Emitter) -> Option<&'a mut PropertyBag> {
    match holder {
        Emitter::App => Some(&mut app.properties),
        Emitter::Vm(qid) => app.domains.get_mut(qid).map(|vm| &mut vm.properties),
    }
}

/// Look up the descriptor of a property on a holder.
pub fn get_def(app: &App, holder: Emitter, name: &str) -> Result<&'static PropertyDef> {
    defs_for(app, holder)?
        .iter()
        .find(|def| def.name == name)
        .copied()
        .ok_or_else(|| QubesError::NoSuchProperty {
            holder: holder_name(app, holder),
            name: name.to_owned(),
        })
}

/// All property descriptors of a holder, in declaration order.
pub fn list(app: &App, holder: Emitter) -> Result<&'static [&'static PropertyDef]> {
    defs_for(app, holder)
}

/// Read a property. `Ok(None)` means the property is known but has neither a
/// stored value nor a default.
pub fn get(app: &App, holder: Emitter, name: &str) -> Result<Option<PropertyValue>> {
    let def = get_def(app, holder, name)?;
    if let Some(stored) = bag(app, holder).and_then(|b| b.get(name)) {
        return Ok(Some(stored.clone()));
    }
    match def.default {
        Some(default) => match default(app, holder) {
            Ok(value) => Ok(Some(value)),
            Err(_) => Ok(None),
        },
        None => Ok(None),
    }
}

/// Read a property, failing when it has no value at all.
pub fn get_required(app: &App, holder: Emitter, name: &str) -> Result<PropertyValue> {
    get(app, holder, name)?.ok_or_else(|| QubesError::NoSuchProperty {
        holder: holder_name(app, holder),
        name: name.to_owned(),
    })
}

/// Whether the holder currently falls back to the default for this property.
pub fn is_default(app: &App, holder: Emitter, name: &str) -> Result<bool> {
    get_def(app, holder, name)?;
    Ok(!bag(app, holder).is_some_and(|b| b.contains(name)))
}

/// Set a property, running the full contract: write-once check, pre-set
/// event (vetoable), type validation, custom setter, store, post-set event.
pub fn set(app: &mut App, holder: Emitter, name: &str, value: PropertyValue) -> Result<()> {
    let def = get_def(app, holder, name)?;

    if def.write_once && bag(app, holder).is_some_and(|b| b.contains(name)) {
        return Err(QubesError::value(format!(
            "property {:?} is write-once and already set",
            def.name
        )));
    }

    let value = validate_type(app, def, value)?;
    let oldvalue = get(app, holder, name)?;

    let args = pre_set_args(&value, &oldvalue, def.name);
    events::fire_event_pre(app, holder, &format!("property-pre-set:{}", def.name), &args)?;

    let value = match def.setter {
        Some(setter) => setter(app, holder, def, value)?,
        None => value,
    };

    bag_mut(app, holder)
        .expect("holder vanished mid-set")
        .insert(def.name, value.clone());

    let args = pre_set_args(&value, &oldvalue, def.name);
    events::fire_event(app, holder, &format!("property-set:{}", def.name), &args)?;
    Ok(())
}

/// Delete a property, restoring its default. Fires the `-pre-del`/`-del`
/// event pair; a no-op when the property was not explicitly set.
pub fn reset(app: &mut App, holder: Emitter, name: &str) -> Result<()> {
    let def = get_def(app, holder, name)?;
    let oldvalue = match bag(app, holder).and_then(|b| b.get(name)) {
        Some(v) => v.clone(),
        None => return Ok(()),
    };

    let args = EventArgs::new()
        .arg("name", def.name)
        .arg("oldvalue", EventValue::from(oldvalue.clone()));
    events::fire_event_pre(app, holder, &format!("property-pre-del:{}", def.name), &args)?;

    bag_mut(app, holder)
        .expect("holder vanished mid-reset")
        .remove(name);

    events::fire_event(app, holder, &format!("property-del:{}", def.name), &args)?;
    Ok(())
}

/// Assign either a concrete value or the DEFAULT sentinel.
pub fn assign(app: &mut App, holder: Emitter, name: &str, value: SetValue) -> Result<()> {
    match value {
        SetValue::Value(v) => set(app, holder, name, v),
        SetValue::Default => reset(app, holder, name),
    }
}

/// Store a value without firing events or running setters. Used by the store
/// loader, which replays already-validated values.
pub fn load_raw(app: &mut App, holder: Emitter, name: &str, value: PropertyValue) -> Result<()> {
    let def = get_def(app, holder, name)?;
    let value = validate_type(app, def, value)?;
    bag_mut(app, holder)
        .ok_or_else(|| QubesError::value("no such holder"))?
        .insert(def.name, value);
    Ok(())
}

fn pre_set_args(value: &PropertyValue, oldvalue: &Option<PropertyValue>, name: &str) -> EventArgs {
    let mut args = EventArgs::new()
        .arg("name", name)
        .arg("newvalue", EventValue::from(value.clone()));
    args = match oldvalue {
        Some(old) => args.arg("oldvalue", EventValue::from(old.clone())),
        None => args.arg("oldvalue", EventValue::Null),
    };
    args
}

fn validate_type(app: &App, def: &PropertyDef, value: PropertyValue) -> Result<PropertyValue> {
    if !value.matches(def.ptype) {
        return Err(QubesError::value(format!(
            "wrong value type for property {:?}",
            def.name
        )));
    }

    match &value {
        PropertyValue::Vm(None) => {
            if !def.allow_none {
                return Err(QubesError::value(format!(
                    "property {:?} does not accept a null qube",
                    def.name
                )));
            }
        }
        PropertyValue::Vm(Some(name)) => {
            let vm = app
                .domains
                .get_by_name(name)
                .ok_or_else(|| QubesError::value(format!("no such domain: {name:?}")))?;
            if let Some(required) = def.vm_class {
                if vm.class != required {
                    return Err(QubesError::value(format!(
                        "property {:?} requires a {} qube, {} is a {}",
                        def.name, required, vm.name, vm.class
                    )));
                }
            }
        }
        PropertyValue::Label(name) => {
            if app.get_label(name).is_none() {
                return Err(QubesError::value(format!("no such label: {name:?}")));
            }
        }
        _ => {}
    }

    Ok(value)
}
