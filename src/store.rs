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

//! The persistent store: a single XML document holding labels, pools,
//! application properties and every domain.
//!
//! Loading happens in five stages driven by each property's `load_stage`,
//! because global properties reference qubes and qubes reference each other.
//! Saving is concurrent-safe: the file is locked exclusively, its identity
//! re-checked after the lock, the mtime compared against the one captured at
//! load, and the new content renamed over the target from a sibling
//! temporary file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use fs2::FileExt;
use log::{info, warn};
use roxmltree::{Document, Node};

use crate::app::{self, App};
use crate::commons::{self, Label, VmClass};
use crate::devices::DeviceAssignment;
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs};
use crate::firewall::{Firewall, Rule};
use crate::property::{self, PropertyValue};
use crate::storage::{self, VolumeConfig};
use crate::utils::xml_escape;
use crate::vm::Qube;

const STORE_VERSION: &str = "3.0";

//
// serialization
//

fn write_properties(out: &mut String, app: &App, holder: Emitter, indent: &str) {
    let defs = match property::list(app, holder) {
        Ok(defs) => defs,
        Err(_) => return,
    };
    out.push_str(indent);
    out.push_str("<properties>\n");

    if let Emitter::Vm(qid) = holder {
        if let Some(vm) = app.domains.get(qid) {
            for (name, value) in [
                ("qid", vm.qid.to_string()),
                ("name", vm.name.clone()),
                ("uuid", vm.uuid.to_string()),
            ] {
                out.push_str(&format!(
                    "{indent}  <property name=\"{name}\">{}</property>\n",
                    xml_escape(&value)
                ));
            }
        }
    }

    for def in defs {
        if matches!(def.name, "qid" | "name" | "uuid") {
            continue;
        }
        let stored = match holder {
            Emitter::App => app.properties.get(def.name),
            Emitter::Vm(qid) => app.domains.get(qid).and_then(|vm| vm.properties.get(def.name)),
        };
        let Some(value) = stored else { continue };
        let text = value.to_string();
        if def.save_via_ref {
            out.push_str(&format!(
                "{indent}  <property name=\"{}\" ref=\"{}\"/>\n",
                def.name,
                xml_escape(&text)
            ));
        } else {
            out.push_str(&format!(
                "{indent}  <property name=\"{}\">{}</property>\n",
                def.name,
                xml_escape(&text)
            ));
        }
    }
    out.push_str(indent);
    out.push_str("</properties>\n");
}

fn write_domain(out: &mut String, app: &App, vm: &Qube) {
    out.push_str(&format!(
        "    <domain id=\"domain-{}\" class=\"{}\" netid=\"{}\"",
        vm.qid, vm.class, vm.netid
    ));
    if let Some(dispid) = vm.dispid {
        out.push_str(&format!(" dispid=\"{dispid}\""));
    }
    if vm.auto_cleanup {
        out.push_str(" auto-cleanup=\"True\"");
    }
    out.push_str(">\n");

    write_properties(out, app, Emitter::Vm(vm.qid), "      ");

    out.push_str("      <features>\n");
    for (key, value) in &vm.features {
        out.push_str(&format!(
            "        <feature name=\"{}\">{}</feature>\n",
            xml_escape(key),
            xml_escape(value)
        ));
    }
    out.push_str("      </features>\n");

    out.push_str("      <tags>\n");
    for tag in &vm.tags {
        out.push_str(&format!("        <tag name=\"{}\"/>\n", xml_escape(tag)));
    }
    out.push_str("      </tags>\n");

    for (class, assignments) in &vm.devices {
        out.push_str(&format!("      <devices class=\"{}\">\n", xml_escape(class)));
        for dev in assignments {
            if !dev.persistent {
                continue;
            }
            out.push_str(&format!(
                "        <device backend-domain=\"{}\" id=\"{}\">\n",
                xml_escape(&dev.backend),
                xml_escape(&dev.ident)
            ));
            for (key, value) in &dev.options {
                out.push_str(&format!(
                    "          <option name=\"{}\">{}</option>\n",
                    xml_escape(key),
                    xml_escape(value)
                ));
            }
            out.push_str("        </device>\n");
        }
        out.push_str("      </devices>\n");
    }

    out.push_str("      <firewall>\n");
    for rule in &vm.firewall.rules {
        out.push_str(&format!(
            "        <rule>{}</rule>\n",
            xml_escape(&rule.to_line())
        ));
    }
    out.push_str("      </firewall>\n");

    out.push_str("      <volume-config>\n");
    for volume in vm.volumes.values() {
        out.push_str(&format!(
            "        <volume name=\"{}\" pool=\"{}\" size=\"{}\" \
             snap_on_start=\"{}\" save_on_stop=\"{}\" rw=\"{}\"",
            xml_escape(&volume.name),
            xml_escape(&volume.pool),
            volume.size,
            bool_str(volume.snap_on_start),
            bool_str(volume.save_on_stop),
            bool_str(volume.rw),
        ));
        if let Some(source) = &volume.source {
            out.push_str(&format!(" source=\"{}\"", xml_escape(source)));
        }
        out.push_str("/>\n");
    }
    out.push_str("      </volume-config>\n");

    out.push_str("    </domain>\n");
}

fn bool_str(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Serialize the whole model to the store document.
pub fn serialize(app: &App) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n");
    out.push_str(&format!("<qubes version=\"{STORE_VERSION}\">\n"));

    out.push_str("  <labels>\n");
    for label in app.labels.values() {
        out.push_str(&format!(
            "    <label id=\"label-{}\" color=\"{}\">{}</label>\n",
            label.index,
            xml_escape(&label.color),
            xml_escape(&label.name)
        ));
    }
    out.push_str("  </labels>\n");

    out.push_str("  <pools>\n");
    for pool in app.pools.values() {
        out.push_str(&format!(
            "    <pool name=\"{}\" driver=\"{}\"",
            xml_escape(pool.name()),
            xml_escape(pool.driver())
        ));
        for (key, value) in pool.config() {
            if key == "name" || key == "driver" {
                continue;
            }
            out.push_str(&format!(" {}=\"{}\"", key, xml_escape(&value)));
        }
        out.push_str("/>\n");
    }
    out.push_str("  </pools>\n");

    write_properties(&mut out, app, Emitter::App, "  ");

    out.push_str("  <domains>\n");
    for vm in app.domains.iter() {
        write_domain(&mut out, app, vm);
    }
    out.push_str("  </domains>\n");

    out.push_str("</qubes>\n");
    out
}

//
// save
//

/// Persist the model, per the concurrent-safe algorithm. Callers are the API
/// runtime (after every mutating call) and the daemon's own maintenance
/// paths.
pub fn save(app: &mut App) -> Result<()> {
    let path = app.store_path.clone();

    let fd_old = loop {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        fd.lock_exclusive()?;

        // While we were waiting for the lock, someone could have unlinked or
        // renamed our file out of the filesystem. We have to make sure we
        // hold the lock on something still linked at the store path.
        let held = fd.metadata()?;
        match fs::metadata(&path) {
            Ok(on_disk) if on_disk.dev() == held.dev() && on_disk.ino() == held.ino() => break fd,
            _ => continue,
        }
    };

    if let Some(loaded) = app.load_timestamp {
        let current = fs::metadata(&path)?.modified()?;
        if current != loaded {
            drop(fd_old);
            return Err(QubesError::StoreConflict {
                path: path.display().to_string(),
            });
        }
    }

    let content = serialize(app);
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(content.as_bytes())?;
        tmp.sync_all()?;
    }
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o660))?;
    chown_admin_group(&tmp_path);
    fs::rename(&tmp_path, &path)?;

    // keep the new mtime so consecutive saves without a reload still pass
    // the conflict check; the lock is released only now, by closing
    app.load_timestamp = Some(fs::metadata(&path)?.modified()?);
    drop(fd_old);
    Ok(())
}

fn chown_admin_group(path: &Path) {
    match nix::unistd::Group::from_name(commons::ADMIN_GROUP) {
        Ok(Some(group)) => {
            if let Err(error) = std::os::unix::fs::chown(path, None, Some(group.gid.as_raw())) {
                warn!("cannot chown {} to group {}: {error}", path.display(), commons::ADMIN_GROUP);
            }
        }
        _ => {
            // unprivileged test runs have no such group
            warn!("group {} not found, leaving store ownership alone", commons::ADMIN_GROUP);
        }
    }
}

//
// load
//

/// Load the store into `app`, replacing the current model.
pub fn load(app: &mut App) -> Result<()> {
    let path = app.store_path.clone();
    let mut file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            QubesError::Qubes(format!("store {} is missing", path.display()))
        } else {
            QubesError::from(e)
        }
    })?;
    file.lock_exclusive()?;

    let mut text = String::new();
    file.read_to_string(&mut text)?;

    app.events_enabled = false;
    app.domains = Default::default();
    app.labels.clear();
    app.properties = property::PropertyBag::new();

    let result = load_document(app, &text);
    if result.is_err() {
        app.events_enabled = true;
        return result;
    }

    // grab the timestamp before closing, while still holding the lock, to
    // detect out-of-process writers at save time
    app.load_timestamp = Some(file.metadata()?.modified()?);
    drop(file);

    app.events_enabled = true;
    let qids = app.domains.qids();
    for qid in qids {
        if let Some(vm) = app.domains.get_mut(qid) {
            vm.events_enabled = true;
        }
        events::fire_event(app, Emitter::Vm(qid), "domain-load", &EventArgs::new())?;
    }
    info!("loaded {} domains from {}", app.domains.len(), path.display());
    Ok(())
}

fn load_document(app: &mut App, text: &str) -> Result<()> {
    let doc = Document::parse(text)
        .map_err(|error| QubesError::Qubes(format!("cannot parse store: {error}")))?;
    let root = doc.root_element();
    if root.tag_name().name() != "qubes" {
        return Err(QubesError::Qubes("store root element is not <qubes>".to_owned()));
    }

    // stage 1: labels and pool configurations
    for node in children(root, "labels").flat_map(|n| children(n, "label")) {
        let index: u32 = node
            .attribute("id")
            .and_then(|id| id.strip_prefix("label-"))
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| QubesError::Qubes("label without a valid id".to_owned()))?;
        let color = node
            .attribute("color")
            .ok_or_else(|| QubesError::Qubes("label without color".to_owned()))?;
        let name = node.text().unwrap_or_default().trim().to_owned();
        app.labels.insert(index, Label::new(index, color, &name)?);
    }

    for node in children(root, "pools").flat_map(|n| children(n, "pool")) {
        let name = node
            .attribute("name")
            .ok_or_else(|| QubesError::Qubes("pool without name".to_owned()))?;
        let driver = node.attribute("driver").unwrap_or("memory");
        let config: Vec<(String, String)> = node
            .attributes()
            .map(|a| (a.name().to_owned(), a.value().to_owned()))
            .collect();
        match storage::pool_from_config(driver, name, &config) {
            Ok(pool) => {
                app.pools.insert(name.to_owned(), pool);
            }
            Err(error) => warn!("skipping pool {name}: {error}"),
        }
    }

    // stage 2: domain stubs with identity properties
    for node in children(root, "domains").flat_map(|n| children(n, "domain")) {
        load_domain_stub(app, node)?;
    }
    if app.domains.get(0).is_none() {
        let mut dom0 = Qube::new(0, "dom0", VmClass::AdminVM);
        dom0.properties
            .insert("label", PropertyValue::Label("black".to_owned()));
        app::add_vm(app, dom0)?;
    }

    // stage 3: global properties, which may reference qubes
    for node in children(root, "properties").flat_map(|n| children(n, "property")) {
        let (name, value) = read_property(node)?;
        let def = property::get_def(app, Emitter::App, &name)?;
        let value = def.sanitize(value.as_bytes())?;
        property::load_raw(app, Emitter::App, &name, value)?;
    }

    // stage 4: remaining per-qube properties, inter-qube references included
    for node in children(root, "domains").flat_map(|n| children(n, "domain")) {
        load_domain_properties(app, node)?;
    }

    // stage 5: invariant fix-ups
    fixup_netvm_references(app)?;
    Ok(())
}

fn children<'a>(node: Node<'a, 'a>, name: &'static str) -> impl Iterator<Item = Node<'a, 'a>> {
    node.children().filter(move |n| n.tag_name().name() == name)
}

fn read_property(node: Node<'_, '_>) -> Result<(String, String)> {
    let name = node
        .attribute("name")
        .ok_or_else(|| QubesError::Qubes("property without name".to_owned()))?;
    let value = match node.attribute("ref") {
        Some(reference) => reference.to_owned(),
        None => node.text().unwrap_or_default().trim().to_owned(),
    };
    Ok((name.to_owned(), value))
}

fn load_domain_stub(app: &mut App, node: Node<'_, '_>) -> Result<()> {
    let class = VmClass::parse(
        node.attribute("class")
            .ok_or_else(|| QubesError::Qubes("domain without class".to_owned()))?,
    )?;

    let mut qid = None;
    let mut name = None;
    let mut uuid = None;
    for prop in children(node, "properties").flat_map(|n| children(n, "property")) {
        let (key, value) = read_property(prop)?;
        match key.as_str() {
            "qid" => qid = value.parse::<u32>().ok(),
            "name" => name = Some(value),
            "uuid" => uuid = uuid::Uuid::parse_str(&value).ok(),
            _ => {}
        }
    }
    let qid = qid.ok_or_else(|| QubesError::Qubes("domain without qid".to_owned()))?;
    let name = name.ok_or_else(|| QubesError::Qubes("domain without name".to_owned()))?;
    if qid != 0 {
        commons::validate_name(&name)?;
    }

    let mut vm = Qube::new(qid, &name, class);
    if let Some(uuid) = uuid {
        vm.uuid = uuid;
    }
    if let Some(netid) = node.attribute("netid").and_then(|v| v.parse().ok()) {
        vm.netid = netid;
    }
    vm.dispid = node.attribute("dispid").and_then(|v| v.parse().ok());
    vm.auto_cleanup = node.attribute("auto-cleanup") == Some("True");

    for feature in children(node, "features").flat_map(|n| children(n, "feature")) {
        let key = feature
            .attribute("name")
            .ok_or_else(|| QubesError::Qubes("feature without name".to_owned()))?;
        vm.features
            .insert(key.to_owned(), feature.text().unwrap_or_default().to_owned());
    }

    for tag in children(node, "tags").flat_map(|n| children(n, "tag")) {
        if let Some(tag) = tag.attribute("name") {
            vm.tags.insert(tag.to_owned());
        }
    }

    for devices in children(node, "devices") {
        let class = devices.attribute("class").unwrap_or("pci").to_owned();
        for dev in children(devices, "device") {
            let backend = dev.attribute("backend-domain").unwrap_or("dom0");
            let ident = dev
                .attribute("id")
                .ok_or_else(|| QubesError::Qubes("device without id".to_owned()))?;
            let options = children(dev, "option")
                .filter_map(|o| {
                    o.attribute("name")
                        .map(|n| (n.to_owned(), o.text().unwrap_or_default().to_owned()))
                })
                .collect();
            vm.devices.entry(class.clone()).or_default().push(DeviceAssignment {
                backend: backend.to_owned(),
                ident: ident.to_owned(),
                options,
                persistent: true,
            });
        }
    }

    let mut rules = Vec::new();
    for rule in children(node, "firewall").flat_map(|n| children(n, "rule")) {
        rules.push(Rule::parse_line(rule.text().unwrap_or_default())?);
    }
    if !rules.is_empty() {
        vm.firewall = Firewall { rules };
    }

    for volume in children(node, "volume-config").flat_map(|n| children(n, "volume")) {
        let name = volume
            .attribute("name")
            .ok_or_else(|| QubesError::Qubes("volume without name".to_owned()))?;
        vm.volumes.insert(
            name.to_owned(),
            VolumeConfig {
                name: name.to_owned(),
                pool: volume.attribute("pool").unwrap_or("varlibqubes").to_owned(),
                size: volume.attribute("size").and_then(|v| v.parse().ok()).unwrap_or(0),
                snap_on_start: volume.attribute("snap_on_start") == Some("True"),
                save_on_stop: volume.attribute("save_on_stop") == Some("True"),
                rw: volume.attribute("rw") == Some("True"),
                source: volume.attribute("source").map(str::to_owned),
            },
        );
    }

    // collisions surface here; events are still disabled so nothing fires
    app::add_vm(app, vm)?;
    if let Some(vm) = app.domains.get_mut(qid) {
        vm.events_enabled = false;
    }

    // stage-2 properties (everything that does not reference another qube)
    load_properties_for_stage(app, node, qid, 2)?;
    Ok(())
}

fn load_domain_properties(app: &mut App, node: Node<'_, '_>) -> Result<()> {
    let name = children(node, "properties")
        .flat_map(|n| children(n, "property"))
        .find_map(|prop| {
            let (key, value) = read_property(prop).ok()?;
            (key == "name").then_some(value)
        })
        .ok_or_else(|| QubesError::Qubes("domain without name".to_owned()))?;
    let qid = app
        .domains
        .get_by_name(&name)
        .map(|vm| vm.qid)
        .ok_or_else(|| QubesError::Qubes(format!("domain {name} lost during load")))?;
    for stage in [3, 4] {
        load_properties_for_stage(app, node, qid, stage)?;
    }
    Ok(())
}

fn load_properties_for_stage(app: &mut App, node: Node<'_, '_>, qid: u32, stage: u8) -> Result<()> {
    for prop in children(node, "properties").flat_map(|n| children(n, "property")) {
        let (name, value) = read_property(prop)?;
        if matches!(name.as_str(), "qid" | "name" | "uuid") {
            continue;
        }
        let def = property::get_def(app, Emitter::Vm(qid), &name)?;
        if def.load_stage != stage {
            continue;
        }
        let value = def.sanitize(value.as_bytes())?;
        property::load_raw(app, Emitter::Vm(qid), &name, value)?;
    }
    Ok(())
}

/// Stage 5: drop netvm references that no longer point at a network
/// provider, so the invariant holds right after load.
fn fixup_netvm_references(app: &mut App) -> Result<()> {
    let qids = app.domains.qids();
    for qid in qids {
        let stored = app
            .domains
            .get(qid)
            .and_then(|vm| vm.properties.get("netvm"))
            .and_then(|v| v.as_vm().map(str::to_owned));
        let Some(netvm_name) = stored else { continue };
        let valid = app
            .domains
            .get_by_name(&netvm_name)
            .map(|netvm| crate::vm::provides_network(app, netvm.qid))
            .unwrap_or(false);
        if !valid {
            warn!("dropping netvm {netvm_name:?} of domain {qid}: not a network provider");
            if let Some(vm) = app.domains.get_mut(qid) {
                vm.properties.remove("netvm");
            }
        }
    }
    Ok(())
}
