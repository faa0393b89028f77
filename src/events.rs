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

//! Events are fired when something happens, like a qube start or stop, or a
//! property change.
//!
//! Handlers come in two flavors. *Bound* handlers belong to an emitter class
//! and are listed in static tables, ordered base-to-derived; they run
//! synchronously in the firing task and may veto an operation by returning an
//! error. *Subscriptions* are registered at runtime (the event streaming API
//! uses them) and only observe: they receive the subject name, the event name
//! and the stringified arguments, after all bound handlers accepted.

use std::fmt;
use std::rc::Rc;

use crate::app::App;
use crate::error::Result;

/// Identifies the object an event fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitter {
    /// The application object itself
    App,
    /// A qube, by qid
    Vm(u32),
}

/// A single event argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Explicit "no value", e.g. `oldvalue` when a property was unset
    Null,
}

impl EventValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EventValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            EventValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::Str(s) => f.write_str(s),
            EventValue::Int(i) => write!(f, "{i}"),
            EventValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            EventValue::Null => Ok(()),
        }
    }
}

impl From<&str> for EventValue {
    fn from(value: &str) -> Self {
        EventValue::Str(value.to_owned())
    }
}

impl From<String> for EventValue {
    fn from(value: String) -> Self {
        EventValue::Str(value)
    }
}

impl From<bool> for EventValue {
    fn from(value: bool) -> Self {
        EventValue::Bool(value)
    }
}

impl From<i64> for EventValue {
    fn from(value: i64) -> Self {
        EventValue::Int(value)
    }
}

/// Ordered keyword arguments passed verbatim to every handler.
#[derive(Debug, Clone, Default)]
pub struct EventArgs {
    entries: Vec<(String, EventValue)>,
}

impl EventArgs {
    pub fn new() -> Self {
        EventArgs::default()
    }

    pub fn arg<V: Into<EventValue>>(mut self, key: &str, value: V) -> Self {
        self.entries.push((key.to_owned(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&EventValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(EventValue::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EventValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a candidate being filtered by a permission handler looks like.
pub enum FilterCandidate<'a> {
    /// A qube, by name
    Vm(&'a str),
    /// A property, feature, tag, volume or device identifier
    Name(&'a str),
    /// An event about to be streamed to a client
    Event { subject: &'a str, event: &'a str },
}

/// Selector returned by a `mgmt-permission:*` handler; candidates it rejects
/// are dropped from list-style responses.
pub type PermissionFilter = Rc<dyn Fn(&FilterCandidate<'_>) -> bool>;

/// Non-`None` value returned by a bound handler.
pub enum EventReturn {
    Value(String),
    Filter(PermissionFilter),
}

/// A bound handler. Runs with full access to the model; returning an error
/// aborts the dispatch and the operation that fired the event.
pub type Handler = fn(&mut App, Emitter, &str, &EventArgs) -> Result<Option<EventReturn>>;

/// One row of a class-level handler table.
pub struct HandlerEntry {
    /// Event name to match; a trailing `:*` matches the whole family
    pub event: &'static str,
    pub handler: Handler,
}

fn entry_matches(entry: &HandlerEntry, event: &str) -> bool {
    if let Some(prefix) = entry.event.strip_suffix(":*") {
        event
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(':'))
    } else {
        entry.event == event
    }
}

/// Which emitters a subscription watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberScope {
    App,
    Vm(u32),
    /// Every qube, including ones added after the subscription was made
    AnyVm,
}

impl SubscriberScope {
    fn matches(self, emitter: Emitter) -> bool {
        match (self, emitter) {
            (SubscriberScope::App, Emitter::App) => true,
            (SubscriberScope::Vm(qid), Emitter::Vm(other)) => qid == other,
            (SubscriberScope::AnyVm, Emitter::Vm(_)) => true,
            _ => false,
        }
    }
}

/// Observer callback: `(subject, event, args)`. The subject is the qube name,
/// or the empty string for application-level events.
pub type EventSink = Rc<dyn Fn(&str, &str, &EventArgs)>;

pub struct Subscription {
    pub id: u64,
    pub scope: SubscriberScope,
    /// Event name, or `*` for everything on the scoped emitter
    pub event: String,
    pub sink: EventSink,
}

enum Order {
    BaseToDerived,
    DerivedToBase,
}

/// Call all bound handlers for an event, base-to-derived, then notify
/// subscriptions. Returns the non-`None` handler results.
pub fn fire_event(
    app: &mut App,
    emitter: Emitter,
    event: &str,
    args: &EventArgs,
) -> Result<Vec<EventReturn>> {
    dispatch(app, emitter, event, args, Order::BaseToDerived)
}

/// Like [`fire_event`], but derived-to-base. Used for `*-pre-*` events whose
/// handlers may veto the operation.
pub fn fire_event_pre(
    app: &mut App,
    emitter: Emitter,
    event: &str,
    args: &EventArgs,
) -> Result<Vec<EventReturn>> {
    dispatch(app, emitter, event, args, Order::DerivedToBase)
}

fn dispatch(
    app: &mut App,
    emitter: Emitter,
    event: &str,
    args: &EventArgs,
    order: Order,
) -> Result<Vec<EventReturn>> {
    let enabled = match emitter {
        Emitter::App => app.events_enabled,
        Emitter::Vm(qid) => app
            .domains
            .get(qid)
            .map(|vm| vm.events_enabled)
            .unwrap_or(false),
    };
    if !enabled {
        return Ok(Vec::new());
    }

    let chain: &[&[HandlerEntry]] = match emitter {
        Emitter::App => crate::app::handler_chain(),
        Emitter::Vm(qid) => match app.domains.get(qid) {
            Some(vm) => crate::vm::handler_chain(vm.class),
            None => return Ok(Vec::new()),
        },
    };

    let mut returns = Vec::new();
    let mut run_table = |app: &mut App, table: &[HandlerEntry]| -> Result<()> {
        for entry in table {
            if !entry_matches(entry, event) {
                continue;
            }
            if let Some(value) = (entry.handler)(app, emitter, event, args)? {
                returns.push(value);
            }
        }
        Ok(())
    };

    match order {
        Order::BaseToDerived => {
            for table in chain {
                run_table(app, table)?;
            }
        }
        Order::DerivedToBase => {
            for table in chain.iter().rev() {
                run_table(app, table)?;
            }
        }
    }

    notify_subscribers(app, emitter, event, args);

    Ok(returns)
}

fn notify_subscribers(app: &mut App, emitter: Emitter, event: &str, args: &EventArgs) {
    let subject = match emitter {
        Emitter::App => String::new(),
        Emitter::Vm(qid) => match app.domains.get(qid) {
            Some(vm) => vm.name.clone(),
            None => return,
        },
    };

    // Collect the sinks first: a sink must not observe the bus mid-mutation,
    // and a handler may have registered or removed subscriptions.
    let sinks: Vec<EventSink> = app
        .subscriptions
        .iter()
        .filter(|sub| sub.scope.matches(emitter) && (sub.event == "*" || sub.event == event))
        .map(|sub| Rc::clone(&sub.sink))
        .collect();

    for sink in sinks {
        sink(&subject, event, args);
    }
}

/// Apply permission filters to an iterable of candidates, keeping only the
/// ones every filter accepts.
pub fn apply_filters<T, F>(items: Vec<T>, filters: &[PermissionFilter], as_candidate: F) -> Vec<T>
where
    F: for<'a> Fn(&'a T) -> FilterCandidate<'a>,
{
    items
        .into_iter()
        .filter(|item| {
            let candidate = as_candidate(item);
            filters.iter().all(|f| f(&candidate))
        })
        .collect()
}

/// Extract the filters from a list of handler returns.
pub fn filters_of(returns: Vec<EventReturn>) -> Vec<PermissionFilter> {
    returns
        .into_iter()
        .filter_map(|r| match r {
            EventReturn::Filter(f) => Some(f),
            EventReturn::Value(_) => None,
        })
        .collect()
}
