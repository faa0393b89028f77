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

//! Rendering of wire response lines. The formats here are part of the
//! management protocol; clients parse them, so every impl is covered by the
//! API tests.

use std::fmt;
use std::fmt::Display;

use crate::commons::{Label, PowerState, VmClass};
use crate::property::PropertyType;

/// One row of an `admin.vm.List` response.
pub struct VmListEntry {
    pub name: String,
    pub class: VmClass,
    pub state: PowerState,
}

impl Display for VmListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} class={} state={}", self.name, self.class, self.state)
    }
}

/// Body of an `admin.*.property.Get` response.
pub struct PropertyGetReply {
    pub is_default: bool,
    pub ptype: PropertyType,
    /// Stringified value; empty when the property has no value at all
    pub value: Option<String>,
}

impl Display for PropertyGetReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the trailing space before an empty value is deliberate; clients
        // split on the first two fields
        write!(
            f,
            "default={} type={} {}",
            if self.is_default { "True" } else { "False" },
            self.ptype.wire_name(),
            self.value.as_deref().unwrap_or("")
        )
    }
}

/// One row of a device listing: `<backend>+<ident> <key>=<value>...`.
pub struct DeviceRow {
    pub ident: String,
    pub properties: Vec<(String, String)>,
}

impl Display for DeviceRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ident)?;
        for (key, value) in &self.properties {
            write!(f, " {key}={value}")?;
        }
        writeln!(f)
    }
}

/// Body of an `admin.vm.volume.Info` response.
pub struct VolumeInfoReply {
    pub pool: String,
    pub size: u64,
    pub usage: u64,
    pub rw: bool,
    pub snap_on_start: bool,
    pub save_on_stop: bool,
    pub source: Option<String>,
}

impl Display for VolumeInfoReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pool={}", self.pool)?;
        writeln!(f, "size={}", self.size)?;
        writeln!(f, "usage={}", self.usage)?;
        writeln!(f, "rw={}", if self.rw { "True" } else { "False" })?;
        writeln!(
            f,
            "snap_on_start={}",
            if self.snap_on_start { "True" } else { "False" }
        )?;
        writeln!(
            f,
            "save_on_stop={}",
            if self.save_on_stop { "True" } else { "False" }
        )?;
        if let Some(source) = &self.source {
            writeln!(f, "source={source}")?;
        }
        Ok(())
    }
}

/// One row of an `admin.label.List` response.
pub struct LabelRow<'a>(pub &'a Label);

impl Display for LabelRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.0.name)
    }
}

/// Body of an `admin.pool.Info` response.
pub struct PoolInfoReply {
    pub config: Vec<(String, String)>,
}

impl Display for PoolInfoReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.config {
            writeln!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
