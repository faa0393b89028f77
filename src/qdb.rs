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

//! Configuration bus adapter.
//!
//! Every qube carries a small key-value store used for out-of-band
//! coordination: the daemon writes identity and network entries there at
//! start, qubes write their memory reports, and the balancer watches for
//! them. Reads may race with the qube writing, so absent keys are normal.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tokio::sync::mpsc;

/// Change notification from a watched prefix.
#[derive(Debug, Clone)]
pub struct QdbEvent {
    pub vm: String,
    pub key: String,
}

/// Per-qube key-value store, addressed by qube name.
pub trait ConfigBus {
    fn read(&self, vm: &str, key: &str) -> Option<String>;
    fn write(&self, vm: &str, key: &str, value: &str);
    /// Keys under the given prefix, sorted.
    fn list(&self, vm: &str, prefix: &str) -> Vec<String>;
    /// Remove every key under the given prefix.
    fn rm(&self, vm: &str, prefix: &str);
    /// Remove the whole tree of a qube (when it is removed or renamed).
    fn rm_vm(&self, vm: &str);
    /// Watch a prefix across all qubes; the receiver gets a [`QdbEvent`] for
    /// every write under it.
    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<QdbEvent>;
}

pub type ConfigBusRef = Rc<dyn ConfigBus>;

struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<QdbEvent>,
}

/// In-memory bus used by tests and offline runs.
#[derive(Default)]
pub struct InMemoryBus {
    entries: RefCell<BTreeMap<(String, String), String>>,
    watchers: RefCell<Vec<Watcher>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        InMemoryBus::default()
    }

    /// Every entry of a qube, sorted by key. Test hook.
    pub fn dump(&self, vm: &str) -> Vec<(String, String)> {
        self.entries
            .borrow()
            .iter()
            .filter(|((owner, _), _)| owner == vm)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl ConfigBus for InMemoryBus {
    fn read(&self, vm: &str, key: &str) -> Option<String> {
        self.entries
            .borrow()
            .get(&(vm.to_owned(), key.to_owned()))
            .cloned()
    }

    fn write(&self, vm: &str, key: &str, value: &str) {
        self.entries
            .borrow_mut()
            .insert((vm.to_owned(), key.to_owned()), value.to_owned());
        let event = QdbEvent {
            vm: vm.to_owned(),
            key: key.to_owned(),
        };
        self.watchers.borrow_mut().retain(|watcher| {
            if key.starts_with(&watcher.prefix) {
                watcher.sender.send(event.clone()).is_ok()
            } else {
                !watcher.sender.is_closed()
            }
        });
    }

    fn list(&self, vm: &str, prefix: &str) -> Vec<String> {
        self.entries
            .borrow()
            .keys()
            .filter(|(owner, key)| owner == vm && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn rm(&self, vm: &str, prefix: &str) {
        self.entries
            .borrow_mut()
            .retain(|(owner, key), _| !(owner == vm && key.starts_with(prefix)));
    }

    fn rm_vm(&self, vm: &str) {
        self.entries.borrow_mut().retain(|(owner, _), _| owner != vm);
    }

    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<QdbEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.borrow_mut().push(Watcher {
            prefix: prefix.to_owned(),
            sender: tx,
        });
        rx
    }
}
