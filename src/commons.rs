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
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{QubesError, Result};

/// Highest qube id handed out by the collection (exclusive). qid 0 is the
/// administrative qube.
pub const MAX_QID: u32 = 254;
/// Highest network slot id (exclusive).
pub const MAX_NETID: u32 = 254;
/// Disposable qubes draw their ids from a much wider range so that ids are
/// not immediately reused.
pub const MAX_DISPID: u32 = 10000;
/// Built-in labels occupy indices up to this value; user labels must be above.
pub const MAX_DEFAULT_LABEL: u32 = 8;

pub const ADMIN_SOCKET: &str = "/var/run/qubesd.sock";
pub const INTERNAL_SOCKET: &str = "/var/run/qubesd.internal.sock";
pub const MISC_SOCKET: &str = "/var/run/qubesd.misc.sock";

pub const DEFAULT_STORE_PATH: &str = "/var/lib/qubes/qubes.xml";
pub const POLICY_DIR: &str = "/etc/qubes-rpc/policy";
/// Presence of this file disables idle memory balancing.
pub const NO_MEMBALANCE_SENTINEL: &str = "/etc/do-not-membalance";
/// Group that owns the store file; members may read it.
pub const ADMIN_GROUP: &str = "qubes";

/// Memory a single vcpu costs on top of the guest allotment, in bytes.
pub const VCPU_OVERHEAD: u64 = 2 * 1024 * 1024;
/// Fixed start overhead per qube, in bytes.
pub const START_OVERHEAD: u64 = 32 * 1024 * 1024;

pub const DEFAULT_MEMORY_KIB: u64 = 400 * 1024;
pub const DEFAULT_KERNELOPTS: &str = "nopat";
pub const DEFAULT_QREXEC_TIMEOUT: u64 = 60;

/// Qube classes. The set is closed: every domain in the store carries exactly
/// one of these and the class never changes after creation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmClass {
    /// The administrative qube (dom0); exactly one exists, with qid 0
    AdminVM,
    /// Template-based compute qube
    AppVM,
    /// Root filesystem provider for template-based qubes
    TemplateVM,
    /// Self-contained qube with its own root volume
    StandaloneVM,
    /// Single-use qube derived from a disposable template
    DispVM,
    /// Qube whose primary duty is providing network to others
    NetVM,
}

const VM_CLASS_ADMINVM: &str = "AdminVM";
const VM_CLASS_APPVM: &str = "AppVM";
const VM_CLASS_TEMPLATEVM: &str = "TemplateVM";
const VM_CLASS_STANDALONEVM: &str = "StandaloneVM";
const VM_CLASS_DISPVM: &str = "DispVM";
const VM_CLASS_NETVM: &str = "NetVM";

impl VmClass {
    pub const ALL: [VmClass; 6] = [
        VmClass::AdminVM,
        VmClass::AppVM,
        VmClass::TemplateVM,
        VmClass::StandaloneVM,
        VmClass::DispVM,
        VmClass::NetVM,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VmClass::AdminVM => VM_CLASS_ADMINVM,
            VmClass::AppVM => VM_CLASS_APPVM,
            VmClass::TemplateVM => VM_CLASS_TEMPLATEVM,
            VmClass::StandaloneVM => VM_CLASS_STANDALONEVM,
            VmClass::DispVM => VM_CLASS_DISPVM,
            VmClass::NetVM => VM_CLASS_NETVM,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            VM_CLASS_ADMINVM => Ok(VmClass::AdminVM),
            VM_CLASS_APPVM => Ok(VmClass::AppVM),
            VM_CLASS_TEMPLATEVM => Ok(VmClass::TemplateVM),
            VM_CLASS_STANDALONEVM => Ok(VmClass::StandaloneVM),
            VM_CLASS_DISPVM => Ok(VmClass::DispVM),
            VM_CLASS_NETVM => Ok(VmClass::NetVM),
            other => Err(QubesError::value(format!("no such VM class: {other:?}"))),
        }
    }

    /// Classes whose instances are created from a template.
    pub fn has_template(self) -> bool {
        matches!(self, VmClass::AppVM | VmClass::DispVM)
    }

    /// Classes that may be created through `admin.vm.Create.*`.
    pub fn user_creatable(self) -> bool {
        !matches!(self, VmClass::AdminVM | VmClass::DispVM)
    }
}

impl fmt::Display for VmClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<VmClass> for String {
    fn from(value: VmClass) -> String {
        value.as_str().to_owned()
    }
}

/// Power state of a qube, derived from the hypervisor's runtime state plus a
/// qrexec reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Machine is not active
    Halted,
    /// Machine is running, but qrexec is not (yet) reachable
    Transient,
    /// Machine is ready and running
    Running,
    /// Machine is paused
    Paused,
    /// Machine is S3-suspended
    Suspended,
    /// Machine is in the process of shutting down
    Halting,
    /// Machine is dying after a crash
    Dying,
    /// Machine crashed and is unusable
    Crashed,
    /// Machine is in an unknown state (domain undefined at the hypervisor)
    NA,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::Halted => "Halted",
            PowerState::Transient => "Transient",
            PowerState::Running => "Running",
            PowerState::Paused => "Paused",
            PowerState::Suspended => "Suspended",
            PowerState::Halting => "Halting",
            PowerState::Dying => "Dying",
            PowerState::Crashed => "Crashed",
            PowerState::NA => "NA",
        }
    }

    /// Running in the wide sense: anything with a live hypervisor domain.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            PowerState::Running | PowerState::Transient | PowerState::Halting
        )
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Virtualization mode of a qube.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum VirtMode {
    /// Paravirtualized
    #[default]
    Pv,
    /// Hardware-assisted
    Hvm,
}

impl VirtMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VirtMode::Pv => "pv",
            VirtMode::Hvm => "hvm",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pv" => Ok(VirtMode::Pv),
            "hvm" => Ok(VirtMode::Hvm),
            other => Err(QubesError::value(format!("invalid virt_mode: {other:?}"))),
        }
    }
}

impl fmt::Display for VirtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A colored label assigned to every qube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    /// Stable index; built-in labels occupy `1..=MAX_DEFAULT_LABEL`
    pub index: u32,
    /// Color in `0xRRGGBB` form
    pub color: String,
    pub name: String,
}

impl Label {
    pub fn new(index: u32, color: &str, name: &str) -> Result<Self> {
        validate_label_color(color)?;
        Ok(Label {
            index,
            color: color.to_owned(),
            name: name.to_owned(),
        })
    }

    /// Path of the icon for this label, as exposed over the API.
    pub fn icon(&self) -> String {
        format!("appvm-{}", self.name)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The eight built-in labels present in every store.
pub fn builtin_labels() -> Vec<Label> {
    [
        (1, "0xcc0000", "red"),
        (2, "0xf57900", "orange"),
        (3, "0xedd400", "yellow"),
        (4, "0x73d216", "green"),
        (5, "0x555753", "gray"),
        (6, "0x3465a4", "blue"),
        (7, "0x75507b", "purple"),
        (8, "0x000000", "black"),
    ]
    .iter()
    .map(|(index, color, name)| Label {
        index: *index,
        color: (*color).to_owned(),
        name: (*name).to_owned(),
    })
    .collect()
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").unwrap())
}

fn label_color_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^0x[0-9a-f]{6}$").unwrap())
}

fn mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9a-fA-F][0-9a-fA-F]:){5}[0-9a-fA-F][0-9a-fA-F]$").unwrap())
}

/// Validate a qube name: ascii, leading letter, at most 31 characters, and
/// not a name the system reserves.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 31 {
        return Err(QubesError::value(format!(
            "VM name must be between 1 and 31 characters long: {name:?}"
        )));
    }
    if !name_regex().is_match(name) {
        return Err(QubesError::value(format!(
            "VM name contains illegal characters or starts with a digit: {name:?}"
        )));
    }
    if name == "lost+found" {
        return Err(QubesError::value(
            "VM name 'lost+found' is reserved".to_owned(),
        ));
    }
    Ok(())
}

pub fn validate_label_color(color: &str) -> Result<()> {
    if label_color_regex().is_match(color) {
        Ok(())
    } else {
        Err(QubesError::value(format!(
            "invalid label color: {color:?}, expected 0xrrggbb"
        )))
    }
}

/// Validate and normalize a MAC address (lowercased on success).
pub fn validate_mac(value: &str) -> Result<String> {
    if mac_regex().is_match(value) {
        Ok(value.to_lowercase())
    } else {
        Err(QubesError::value(format!("invalid MAC address: {value:?}")))
    }
}
