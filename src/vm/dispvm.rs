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

//! Disposable qubes: created from a disposable template for a single qrexec
//! session, then killed and removed.

use log::info;

use crate::AppRef;
use crate::app::{self, App};
use crate::commons::VmClass;
use crate::error::{QubesError, Result};
use crate::events::Emitter;
use crate::property::{self, PropertyValue};
use crate::storage;
use crate::vm::Qube;

/// Create a disposable qube based on the given disposable template. The new
/// qube is marked for automatic cleanup, its volumes are provisioned, and it
/// is not started.
pub async fn from_appvm(app: &AppRef, base_qid: u32) -> Result<u32> {
    let qid = build_model(&mut app.borrow_mut(), base_qid)?;
    if let Err(error) = super::lifecycle::create_volumes_on_disk(app, qid).await {
        let mut app = app.borrow_mut();
        let _ = crate::app::del_vm(&mut app, qid);
        return Err(error);
    }
    Ok(qid)
}

fn build_model(app: &mut App, base_qid: u32) -> Result<u32> {
    let base = app
        .domains
        .get(base_qid)
        .ok_or_else(|| QubesError::value(format!("no such domain: {base_qid}")))?;
    let base_name = base.name.clone();
    if !crate::vm::template_for_dispvms(app, base_qid) {
        return Err(QubesError::Qubes(format!(
            "{base_name} cannot serve as a disposable template"
        )));
    }

    let qid = app.domains.get_new_unused_qid()?;
    let dispid = app.domains.get_new_unused_dispid()?;
    let name = format!("disp{dispid}");

    let mut vm = Qube::new(qid, &name, VmClass::DispVM);
    vm.netid = app.domains.get_new_unused_netid()?;
    vm.dispid = Some(dispid);
    vm.auto_cleanup = true;
    vm.volumes = storage::default_volume_config(VmClass::DispVM, &app.default_pool, Some(&base_name));
    app.domains.insert_stub(vm);

    let result = (|| {
        let base_label = property::get_required(app, Emitter::Vm(base_qid), "label")?;
        property::set(app, Emitter::Vm(qid), "label", base_label)?;
        property::set(
            app,
            Emitter::Vm(qid),
            "template",
            PropertyValue::Vm(Some(base_name.clone())),
        )?;
        // the disposable inherits its network from the base
        if let Some(netvm) = property::get(app, Emitter::Vm(base_qid), "netvm")? {
            if netvm.as_vm().is_some() {
                property::set(app, Emitter::Vm(qid), "netvm", netvm)?;
            }
        }
        Ok(())
    })();
    if let Err(error) = result {
        app.domains.remove_stub(qid);
        return Err(error);
    }

    if let Some(vm) = app.domains.get_mut(qid) {
        vm.events_enabled = true;
    }
    let args = crate::events::EventArgs::new().arg("vm", name.as_str());
    crate::events::fire_event(app, Emitter::App, "domain-add", &args)?;
    info!("created disposable {name} from {base_name}");
    Ok(qid)
}

/// Kill and remove a disposable qube, even when it never started. Volumes
/// are removed through the pool; the collection entry goes last.
pub async fn cleanup(app: &AppRef, qid: u32) -> Result<()> {
    let (name, auto_cleanup) = {
        let app = app.borrow();
        let vm = app
            .domains
            .get(qid)
            .ok_or_else(|| QubesError::value(format!("no such domain: {qid}")))?;
        (vm.name.clone(), vm.auto_cleanup)
    };
    if !auto_cleanup {
        return Err(QubesError::Qubes(format!(
            "{name} is not a disposable qube"
        )));
    }

    match super::lifecycle::kill(app, qid).await {
        Ok(()) | Err(QubesError::NotStarted { .. }) => {}
        Err(error) => return Err(error),
    }

    let volumes: Vec<(String, crate::storage::PoolRef)> = {
        let app = app.borrow();
        let vm = app.domains.get(qid).expect("checked above");
        vm.volumes
            .values()
            .filter_map(|volume| {
                app.get_pool(&volume.pool)
                    .ok()
                    .map(|pool| (volume.name.clone(), pool))
            })
            .collect()
    };
    for (volume, pool) in volumes {
        let _ = pool.remove(&name, &volume).await;
    }

    {
        let mut app = app.borrow_mut();
        app.bus.rm_vm(&name);
        app::del_vm(&mut app, qid)?;
    }
    info!("cleaned up disposable {name}");
    Ok(())
}
