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

//! Per-qube features.
//!
//! A feature can be in three states: absent, empty string (the false
//! witness), and non-empty string (true). Booleans and "nothing" coerce to
//! strings on assignment, so `get_bool(.., false)` is truthy iff the feature
//! is set to a non-empty string. Every mutation fires an event pair on the
//! owning qube.

use crate::app::App;
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs};

/// Value accepted on assignment, before string coercion.
pub enum FeatureValue<'a> {
    Str(&'a str),
    Bool(bool),
    /// Coerces to the empty string, like `Bool(false)`
    Nothing,
}

impl FeatureValue<'_> {
    fn coerce(&self) -> String {
        match self {
            FeatureValue::Str(s) => (*s).to_owned(),
            FeatureValue::Bool(true) => "1".to_owned(),
            FeatureValue::Bool(false) | FeatureValue::Nothing => String::new(),
        }
    }
}

pub fn get(app: &App, qid: u32, key: &str) -> Option<String> {
    app.domains.get(qid)?.features.get(key).cloned()
}

/// Truthiness of a feature: set and non-empty.
pub fn get_bool(app: &App, qid: u32, key: &str, default: bool) -> bool {
    match get(app, qid, key) {
        Some(value) => !value.is_empty(),
        None => default,
    }
}

pub fn keys(app: &App, qid: u32) -> Vec<String> {
    app.domains
        .get(qid)
        .map(|vm| vm.features.keys().cloned().collect())
        .unwrap_or_default()
}

/// Assign a feature, firing `domain-feature-pre-set:<key>` (vetoable) and
/// `domain-feature-set:<key>` with `value` and, when replacing, `oldvalue`.
pub fn set(app: &mut App, qid: u32, key: &str, value: FeatureValue<'_>) -> Result<()> {
    let value = value.coerce();
    let oldvalue = get(app, qid, key);

    let mut args = EventArgs::new()
        .arg("feature", key)
        .arg("value", value.as_str());
    if let Some(old) = &oldvalue {
        args = args.arg("oldvalue", old.as_str());
    }

    events::fire_event_pre(
        app,
        Emitter::Vm(qid),
        &format!("domain-feature-pre-set:{key}"),
        &args,
    )?;

    let vm = app
        .domains
        .get_mut(qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
    vm.features.insert(key.to_owned(), value);

    events::fire_event(
        app,
        Emitter::Vm(qid),
        &format!("domain-feature-set:{key}"),
        &args,
    )?;
    Ok(())
}

/// Remove a feature; absent keys are an error the caller surfaces as
/// [`QubesError::FeatureNotFound`].
pub fn remove(app: &mut App, qid: u32, key: &str) -> Result<()> {
    let vm = app
        .domains
        .get_mut(qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
    let vm_name = vm.name.clone();
    if vm.features.remove(key).is_none() {
        return Err(QubesError::FeatureNotFound {
            vm: vm_name,
            feature: key.to_owned(),
        });
    }

    let args = EventArgs::new().arg("feature", key);
    events::fire_event(
        app,
        Emitter::Vm(qid),
        &format!("domain-feature-delete:{key}"),
        &args,
    )?;
    Ok(())
}

/// Relation attribute followed by the recursive checks.
#[derive(Clone, Copy)]
enum Relation {
    Template,
    Netvm,
}

fn recursive_check(
    app: &App,
    qid: u32,
    relation: Option<Relation>,
    check_adminvm: bool,
    feature: &str,
) -> Option<String> {
    let mut current = Some(qid);
    while let Some(cur) = current {
        let vm = app.domains.get(cur)?;
        if let Some(value) = vm.features.get(feature) {
            return Some(value.clone());
        }
        let next_name = match relation {
            None => None,
            Some(Relation::Template) => crate::property::get(app, Emitter::Vm(cur), "template")
                .ok()
                .flatten()
                .and_then(|v| v.as_vm().map(str::to_owned)),
            Some(Relation::Netvm) => crate::property::get(app, Emitter::Vm(cur), "netvm")
                .ok()
                .flatten()
                .and_then(|v| v.as_vm().map(str::to_owned)),
        };
        current = next_name.and_then(|name| app.domains.get_by_name(&name).map(|vm| vm.qid));
        if current == Some(cur) {
            break;
        }
    }

    if check_adminvm && qid != 0 {
        if let Some(adminvm) = app.domains.get(0) {
            if let Some(value) = adminvm.features.get(feature) {
                return Some(value.clone());
            }
        }
    }

    None
}

/// Search the qube and its template chain for a feature.
pub fn check_with_template(app: &App, qid: u32, feature: &str) -> Option<String> {
    recursive_check(app, qid, Some(Relation::Template), false, feature)
}

/// Search the qube and its netvm chain for a feature.
pub fn check_with_netvm(app: &App, qid: u32, feature: &str) -> Option<String> {
    recursive_check(app, qid, Some(Relation::Netvm), false, feature)
}

/// Search the qube, then the administrative qube.
pub fn check_with_adminvm(app: &App, qid: u32, feature: &str) -> Option<String> {
    recursive_check(app, qid, None, true, feature)
}

/// Search the qube, its template chain, then the administrative qube.
pub fn check_with_template_and_adminvm(app: &App, qid: u32, feature: &str) -> Option<String> {
    recursive_check(app, qid, Some(Relation::Template), true, feature)
}
