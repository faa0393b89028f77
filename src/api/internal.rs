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

//! Internal interface for administrative-domain components. By design the
//! input here is trusted; there is no permission gating.

use crate::api::{ApiCall, MethodDef, save_app};
use crate::commons::VmClass;
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs};
use crate::policy::SystemInfo;
use crate::vm::{dispvm, lifecycle};

pub static METHODS: &[MethodDef] = &[
    MethodDef { name: "internal.GetSystemInfo", no_payload: true },
    MethodDef { name: "internal.vm.Start", no_payload: true },
    MethodDef { name: "internal.vm.Create.DispVM", no_payload: true },
    MethodDef { name: "internal.vm.CleanupDispVM", no_payload: true },
    MethodDef { name: "internal.vm.volume.ImportEnd", no_payload: false },
    MethodDef { name: "internal.SuspendPre", no_payload: true },
    MethodDef { name: "internal.SuspendPost", no_payload: true },
];

pub async fn dispatch(call: ApiCall, untrusted_payload: Vec<u8>) -> Result<Option<String>> {
    match call.method.as_str() {
        "internal.GetSystemInfo" => get_system_info(&call),
        "internal.vm.Start" => start(&call).await,
        "internal.vm.Create.DispVM" => create_dispvm(&call).await,
        "internal.vm.CleanupDispVM" => cleanup_dispvm(&call).await,
        "internal.vm.volume.ImportEnd" => volume_import_end(&call, &untrusted_payload).await,
        "internal.SuspendPre" => suspend_pre(&call).await,
        "internal.SuspendPost" => suspend_post(&call).await,
        other => Err(QubesError::protocol(format!("no such method: {other:?}"))),
    }
}

fn get_system_info(call: &ApiCall) -> Result<Option<String>> {
    call.require_dest_dom0()?;
    call.require_no_arg()?;
    let info = SystemInfo::from_app(&call.app.borrow());
    let json = serde_json::to_string(&info)
        .map_err(|error| QubesError::Qubes(format!("cannot serialize system info: {error}")))?;
    Ok(Some(json))
}

async fn start(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    if call.dest_name == "dom0" {
        return Ok(None);
    }
    lifecycle::start(&call.app, call.dest).await?;
    Ok(None)
}

async fn create_dispvm(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    let qid = dispvm::from_appvm(&call.app, call.dest).await?;
    let name = call
        .app
        .borrow()
        .domains
        .get(qid)
        .map(|vm| vm.name.clone())
        .expect("created above");
    save_app(&call.app)?;
    Ok(Some(name))
}

async fn cleanup_dispvm(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    dispvm::cleanup(&call.app, call.dest).await?;
    save_app(&call.app)?;
    Ok(None)
}

/// Second half of `admin.vm.volume.Import`: called when the out-of-band data
/// transfer finished, with `ok` on success. The response here is relayed to
/// the original import caller.
async fn volume_import_end(call: &ApiCall, untrusted_payload: &[u8]) -> Result<Option<String>> {
    let volume = call.arg.clone();
    let exists = call
        .app
        .borrow()
        .domains
        .get(call.dest)
        .is_some_and(|vm| vm.volumes.contains_key(&volume));
    if !exists {
        return Err(QubesError::value(format!("no such volume: {volume:?}")));
    }
    let success = untrusted_payload == b"ok";

    let pool = {
        let app = call.app.borrow();
        let pool_name = app
            .domains
            .get(call.dest)
            .and_then(|vm| vm.volumes.get(&volume))
            .map(|v| v.pool.clone())
            .expect("checked above");
        app.get_pool(&pool_name)?
    };
    let finished = pool
        .import_end(&call.dest_name, &volume, success)
        .await
        .map_err(|e| QubesError::Storage(e.to_string()));

    {
        let mut app = call.app.borrow_mut();
        let args = EventArgs::new()
            .arg("volume", volume.as_str())
            .arg("success", success && finished.is_ok());
        events::fire_event(
            &mut app,
            Emitter::Vm(call.dest),
            "domain-volume-import-end",
            &args,
        )?;
    }
    finished?;
    if !success {
        return Err(QubesError::Qubes("data import failed".to_owned()));
    }
    Ok(None)
}

/// Called before the host goes to sleep: pause every running qube. Qubes
/// with a qrexec agent get a chance to run their pre-suspend hooks first,
/// driven by the transport, which is outside this daemon.
async fn suspend_pre(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    let running: Vec<u32> = {
        let app = call.app.borrow();
        app.domains
            .iter()
            .filter(|vm| vm.class != VmClass::AdminVM && vm.is_running())
            .map(|vm| vm.qid)
            .collect()
    };
    for qid in running {
        if let Err(error) = lifecycle::suspend(&call.app, qid).await {
            log::warn!("cannot suspend domain {qid}: {error}");
        }
    }
    Ok(None)
}

/// Called after the host wakes up: resume everything suspended before.
async fn suspend_post(call: &ApiCall) -> Result<Option<String>> {
    call.require_no_arg()?;
    let suspended: Vec<u32> = {
        let app = call.app.borrow();
        app.domains
            .iter()
            .filter(|vm| vm.class != VmClass::AdminVM && vm.is_paused())
            .map(|vm| vm.qid)
            .collect()
    };
    for qid in suspended {
        if let Err(error) = lifecycle::resume(&call.app, qid).await {
            log::warn!("cannot resume domain {qid}: {error}");
        }
    }
    Ok(None)
}
