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

//! The qrexec policy engine.
//!
//! A policy lives in a directory as one rule file per service. Each rule
//! names a source specifier, a target specifier and an action; evaluation
//! walks the rules top to bottom and acts on the first match. Specifiers are
//! a closed vocabulary parsed into [`TargetSpec`]; both the `$` and the `@`
//! sigil spellings are accepted on input, and `$` is emitted on output.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::error::{QubesError, Result};
use crate::events::Emitter;
use crate::property;

/// Action decided by a matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
    Ask,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
            Action::Ask => "ask",
        })
    }
}

/// One side of a rule: the closed specifier vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// A concrete qube name
    Name(String),
    /// `$anyvm`: any qube except the administrative one
    AnyVm,
    /// `$default`: the caller named no target
    Default,
    /// `$adminvm`: the administrative qube
    AdminVm,
    /// `$tag:<name>`
    Tag(String),
    /// `$type:<class>`
    Type(String),
    /// `$dispvm`: a disposable derived from the source's default template
    DispVm,
    /// `$dispvm:<name>`: a disposable based on the named template
    DispVmTemplate(String),
    /// `$dispvm:$tag:<name>`: disposable templates selected by tag
    DispVmTag(String),
}

impl TargetSpec {
    /// Parse a specifier token. Target-only forms (`$default`, `$dispvm*`)
    /// are rejected for sources.
    pub fn parse(token: &str, for_target: bool) -> Option<TargetSpec> {
        let token = canonical(token);
        let spec = if let Some(rest) = token.strip_prefix('$') {
            match rest {
                "anyvm" => TargetSpec::AnyVm,
                "adminvm" => TargetSpec::AdminVm,
                "default" if for_target => TargetSpec::Default,
                "dispvm" if for_target => TargetSpec::DispVm,
                _ => {
                    if let Some(tag) = rest.strip_prefix("tag:") {
                        if tag.is_empty() {
                            return None;
                        }
                        TargetSpec::Tag(tag.to_owned())
                    } else if let Some(class) = rest.strip_prefix("type:") {
                        if class.is_empty() {
                            return None;
                        }
                        TargetSpec::Type(class.to_owned())
                    } else if let Some(base) = rest.strip_prefix("dispvm:") {
                        if !for_target {
                            return None;
                        }
                        if let Some(tag) = base.strip_prefix("$tag:") {
                            TargetSpec::DispVmTag(tag.to_owned())
                        } else {
                            TargetSpec::DispVmTemplate(base.to_owned())
                        }
                    } else {
                        return None;
                    }
                }
            }
        } else {
            TargetSpec::Name(token)
        };
        Some(spec)
    }

    /// Canonical spelling, with the `$` sigil.
    pub fn to_token(&self) -> String {
        match self {
            TargetSpec::Name(name) => name.clone(),
            TargetSpec::AnyVm => "$anyvm".to_owned(),
            TargetSpec::Default => "$default".to_owned(),
            TargetSpec::AdminVm => "$adminvm".to_owned(),
            TargetSpec::Tag(tag) => format!("$tag:{tag}"),
            TargetSpec::Type(class) => format!("$type:{class}"),
            TargetSpec::DispVm => "$dispvm".to_owned(),
            TargetSpec::DispVmTemplate(base) => format!("$dispvm:{base}"),
            TargetSpec::DispVmTag(tag) => format!("$dispvm:$tag:{tag}"),
        }
    }
}

/// Rewrite the `@` sigil spelling (and any embedded `@tag:`) to `$`.
fn canonical(token: &str) -> String {
    if token.starts_with('@') {
        let mut out = String::with_capacity(token.len());
        out.push('$');
        out.push_str(&token[1..].replace("@tag:", "$tag:"));
        out
    } else {
        token.to_owned()
    }
}

/// Per-domain snapshot the engine evaluates against.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DomainInfo {
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub class: String,
    /// Whether disposables may be based on this domain
    #[serde(rename = "dispvm_allowed")]
    pub dispvm_allowed: bool,
    #[serde(rename = "default_dispvm")]
    pub default_dispvm: Option<String>,
    pub icon: String,
}

/// Snapshot of the system as the engine sees it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemInfo {
    pub domains: BTreeMap<String, DomainInfo>,
}

impl SystemInfo {
    pub fn from_app(app: &App) -> SystemInfo {
        let mut domains = BTreeMap::new();
        for vm in app.domains.iter() {
            let holder = Emitter::Vm(vm.qid);
            let icon = property::get(app, holder, "label")
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_owned))
                .and_then(|name| app.get_label(&name).map(|l| l.icon()))
                .unwrap_or_default();
            domains.insert(
                vm.name.clone(),
                DomainInfo {
                    tags: vm.tags.iter().cloned().collect(),
                    class: vm.class.as_str().to_owned(),
                    dispvm_allowed: crate::vm::template_for_dispvms(app, vm.qid),
                    default_dispvm: property::get(app, holder, "default_dispvm")
                        .ok()
                        .flatten()
                        .and_then(|v| v.as_vm().map(str::to_owned)),
                    icon,
                },
            );
        }
        SystemInfo { domains }
    }
}

/// Check that a value names a valid call target: an existing domain, or a
/// valid `$dispvm`-like keyword.
pub fn verify_target_value(info: &SystemInfo, value: &str) -> bool {
    let value = canonical(value);
    if value == "$dispvm" {
        true
    } else if let Some(base) = value.strip_prefix("$dispvm:") {
        info.domains
            .get(base)
            .map(|d| d.dispvm_allowed)
            .unwrap_or(false)
    } else {
        info.domains.contains_key(value.as_str())
    }
}

/// A single line of a policy file.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRule {
    pub source: TargetSpec,
    pub target: TargetSpec,
    pub action: Action,
    /// `target=` option: replaces the target named by the caller
    pub override_target: Option<String>,
    /// `user=` option
    pub override_user: Option<String>,
    /// `default_target=` option, only with ask
    pub default_target: Option<String>,
    pub filename: String,
    pub lineno: usize,
}

fn syntax_error(filename: &str, lineno: usize, msg: impl Into<String>) -> QubesError {
    QubesError::PolicySyntax {
        filename: filename.to_owned(),
        lineno,
        msg: msg.into(),
    }
}

impl PolicyRule {
    /// Parse one non-blank, non-comment policy line. Named objects are not
    /// resolved here; only syntax is checked.
    pub fn parse(line: &str, filename: &str, lineno: usize) -> Result<PolicyRule> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [source, target, full_action] = fields.as_slice() else {
            return Err(syntax_error(filename, lineno, "wrong number of fields"));
        };

        let mut params = full_action.split(',');
        let action = match params.next() {
            Some("allow") => Action::Allow,
            Some("deny") => Action::Deny,
            Some("ask") => Action::Ask,
            other => {
                return Err(syntax_error(
                    filename,
                    lineno,
                    format!("invalid action: {}", other.unwrap_or("")),
                ));
            }
        };

        let mut rule = PolicyRule {
            source: TargetSpec::parse(source, false).ok_or_else(|| {
                syntax_error(filename, lineno, format!("invalid source specification: {source}"))
            })?,
            target: TargetSpec::parse(target, true).ok_or_else(|| {
                syntax_error(filename, lineno, format!("invalid target specification: {target}"))
            })?,
            action,
            override_target: None,
            override_user: None,
            default_target: None,
            filename: filename.to_owned(),
            lineno,
        };

        for param in params {
            let Some((name, value)) = param.split_once('=') else {
                return Err(syntax_error(
                    filename,
                    lineno,
                    format!("invalid action parameter syntax: {param}"),
                ));
            };
            match name {
                "target" => {
                    if rule.action == Action::Deny {
                        return Err(syntax_error(
                            filename,
                            lineno,
                            "target= option not allowed for deny action",
                        ));
                    }
                    rule.override_target = Some(canonical(value));
                }
                "user" => {
                    if rule.action == Action::Deny {
                        return Err(syntax_error(
                            filename,
                            lineno,
                            "user= option not allowed for deny action",
                        ));
                    }
                    rule.override_user = Some(value.to_owned());
                }
                "default_target" => {
                    if rule.action != Action::Ask {
                        return Err(syntax_error(
                            filename,
                            lineno,
                            "default_target= option allowed only for ask action",
                        ));
                    }
                    rule.default_target = Some(canonical(value));
                }
                other => {
                    return Err(syntax_error(
                        filename,
                        lineno,
                        format!("invalid option {other}={value} for {action} action"),
                    ));
                }
            }
        }

        if rule.target == TargetSpec::Default
            && rule.action == Action::Allow
            && rule.override_target.is_none()
        {
            return Err(syntax_error(
                filename,
                lineno,
                "allow action for $default rule must specify target= option",
            ));
        }

        if let Some(override_target) = &rule.override_target {
            if override_target.starts_with('$') && !override_target.starts_with("$dispvm") {
                return Err(syntax_error(
                    filename,
                    lineno,
                    "target= option needs to name a specific target",
                ));
            }
        }

        Ok(rule)
    }

    /// Canonical re-serialization of this rule.
    pub fn to_line(&self) -> String {
        let mut action = self.action.to_string();
        if let Some(target) = &self.override_target {
            action.push_str(&format!(",target={target}"));
        }
        if let Some(user) = &self.override_user {
            action.push_str(&format!(",user={user}"));
        }
        if let Some(default_target) = &self.default_target {
            action.push_str(&format!(",default_target={default_target}"));
        }
        format!(
            "{} {} {}",
            self.source.to_token(),
            self.target.to_token(),
            action
        )
    }

    /// Evaluate whether a single value (qube name, `$default`, empty, or a
    /// `$dispvm` form) matches one specifier.
    pub fn is_match_single(info: &SystemInfo, spec: &TargetSpec, value: &str) -> bool {
        let value = canonical(value);

        // an unspecified target matches only $default and $anyvm entries
        if value == "$default" || value.is_empty() {
            return matches!(spec, TargetSpec::Default | TargetSpec::AnyVm);
        }

        // a concrete value must name something that exists; this is also
        // used for call sources, which by the nature of the transport are
        // always real domain names
        if !verify_target_value(info, &value) {
            return false;
        }

        // any valid, non-administrative target
        if *spec == TargetSpec::AnyVm {
            return value != "dom0";
        }

        // exact match, $dispvm forms included
        if value == spec.to_token() {
            return true;
        }

        // a $dispvm value not matched exactly above matches nothing else
        if value.starts_with("$dispvm") {
            return false;
        }

        if *spec == TargetSpec::AdminVm {
            return value == "dom0";
        }

        let Some(domain) = info.domains.get(value.as_str()) else {
            return false;
        };
        match spec {
            TargetSpec::Tag(tag) => domain.tags.iter().any(|t| t == tag),
            TargetSpec::Type(class) => *class == domain.class,
            _ => false,
        }
    }

    /// Check whether a (source, target) pair matches this rule.
    pub fn is_match(&self, info: &SystemInfo, source: &str, target: &str) -> bool {
        Self::is_match_single(info, &self.source, source)
            && Self::is_match_single(info, &self.target, target)
    }

    /// All values this rule's target can stand for, for the ask set.
    pub fn expand_target(&self, info: &SystemInfo) -> Vec<String> {
        match &self.target {
            TargetSpec::Tag(tag) => info
                .domains
                .iter()
                .filter(|(_, d)| d.tags.iter().any(|t| t == tag))
                .map(|(name, _)| name.clone())
                .collect(),
            TargetSpec::Type(class) => info
                .domains
                .iter()
                .filter(|(_, d)| d.class == *class)
                .map(|(name, _)| name.clone())
                .collect(),
            TargetSpec::AnyVm => {
                let mut targets = Vec::new();
                for (name, domain) in &info.domains {
                    if name != "dom0" {
                        targets.push(name.clone());
                    }
                    if domain.dispvm_allowed {
                        targets.push(format!("$dispvm:{name}"));
                    }
                }
                targets.push("$dispvm".to_owned());
                targets
            }
            TargetSpec::DispVmTemplate(base) => {
                if info
                    .domains
                    .get(base)
                    .map(|d| d.dispvm_allowed)
                    .unwrap_or(false)
                {
                    vec![self.target.to_token()]
                } else {
                    Vec::new()
                }
            }
            TargetSpec::DispVmTag(tag) => info
                .domains
                .iter()
                .filter(|(_, d)| d.dispvm_allowed && d.tags.iter().any(|t| t == tag))
                .map(|(name, _)| format!("$dispvm:{name}"))
                .collect(),
            TargetSpec::DispVm => vec!["$dispvm".to_owned()],
            TargetSpec::AdminVm => vec!["dom0".to_owned()],
            TargetSpec::Name(name) => {
                if info.domains.contains_key(name) {
                    vec![name.clone()]
                } else {
                    Vec::new()
                }
            }
            TargetSpec::Default => Vec::new(),
        }
    }

    /// Resolve `target=$dispvm` against the source's default disposable
    /// template; other override forms pass through.
    pub fn expand_override_target(&self, info: &SystemInfo, source: &str) -> Option<String> {
        match self.override_target.as_deref() {
            Some("$dispvm") => info
                .domains
                .get(source)
                .and_then(|d| d.default_dispvm.clone())
                .map(|dispvm| format!("$dispvm:{dispvm}")),
            other => other.map(str::to_owned),
        }
    }
}

/// Error type the transport reports back from a remote daemon call.
#[derive(Debug)]
pub struct RemoteCallError {
    pub exc_type: String,
    pub message: String,
}

impl fmt::Display for RemoteCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.message)
    }
}

/// The qrexec transport the engine executes allowed calls through.
#[async_trait(?Send)]
pub trait QrexecTransport {
    /// Call a method on the internal daemon socket (source dom0).
    async fn internal_call(
        &self,
        dest: &str,
        method: &str,
    ) -> std::result::Result<String, RemoteCallError>;

    /// Launch the transport client: `-d <target> -c <caller_ident>`, with
    /// `-W` (wait for completion) when `wait` is set.
    async fn run_client(
        &self,
        target: &str,
        caller_ident: &str,
        wait: bool,
        command: &str,
    ) -> std::result::Result<(), RemoteCallError>;
}

/// Transport implementation speaking the daemon's internal socket protocol
/// and the qrexec client binary.
pub struct SocketTransport {
    pub internal_socket: PathBuf,
    pub qrexec_client: PathBuf,
}

impl Default for SocketTransport {
    fn default() -> Self {
        SocketTransport {
            internal_socket: PathBuf::from(crate::commons::INTERNAL_SOCKET),
            qrexec_client: PathBuf::from("/usr/lib/qubes/qrexec-client"),
        }
    }
}

#[async_trait(?Send)]
impl QrexecTransport for SocketTransport {
    async fn internal_call(
        &self,
        dest: &str,
        method: &str,
    ) -> std::result::Result<String, RemoteCallError> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let io_error = |error: std::io::Error| RemoteCallError {
            exc_type: "ConnectionError".to_owned(),
            message: error.to_string(),
        };

        let mut stream = tokio::net::UnixStream::connect(&self.internal_socket)
            .await
            .map_err(io_error)?;
        let mut request = Vec::new();
        for part in ["dom0", method, dest, ""] {
            request.extend_from_slice(part.as_bytes());
            request.push(0);
        }
        stream.write_all(&request).await.map_err(io_error)?;
        stream.shutdown().await.map_err(io_error)?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.map_err(io_error)?;
        if let Some(body) = response.strip_prefix(b"0\0") {
            Ok(String::from_utf8_lossy(body).into_owned())
        } else if let Some(body) = response.strip_prefix(b"2\0") {
            let mut fields = body.split(|b| *b == 0);
            let exc_type = fields.next().unwrap_or_default();
            let _traceback = fields.next();
            let message = fields.next().unwrap_or_default();
            Err(RemoteCallError {
                exc_type: String::from_utf8_lossy(exc_type).into_owned(),
                message: String::from_utf8_lossy(message).into_owned(),
            })
        } else {
            Err(RemoteCallError {
                exc_type: "ProtocolError".to_owned(),
                message: "invalid daemon response".to_owned(),
            })
        }
    }

    async fn run_client(
        &self,
        target: &str,
        caller_ident: &str,
        wait: bool,
        command: &str,
    ) -> std::result::Result<(), RemoteCallError> {
        let mut args = vec!["-d".to_owned(), target.to_owned(), "-c".to_owned(), caller_ident.to_owned()];
        if wait {
            args.push("-W".to_owned());
        }
        args.push(command.to_owned());
        // the client process is fire-and-observe; a non-zero exit is the
        // remote side's business, not a policy failure
        let status = std::process::Command::new(&self.qrexec_client)
            .args(&args)
            .status()
            .map_err(|error| RemoteCallError {
                exc_type: "ConnectionError".to_owned(),
                message: error.to_string(),
            })?;
        let _ = status;
        Ok(())
    }
}

/// Positive policy evaluation result: an allow, or an ask awaiting the user.
#[derive(Debug, Clone)]
pub struct PolicyAction {
    pub service: String,
    pub source: String,
    /// Target the call will go to; `None` until an ask is answered
    pub target: Option<String>,
    /// Target the caller originally named
    pub original_target: String,
    /// Choices for the user; `None` for allow
    pub targets_for_ask: Option<Vec<String>>,
    pub rule: PolicyRule,
    pub action: Action,
}

impl PolicyAction {
    fn new(
        service: &str,
        source: &str,
        target: Option<String>,
        rule: &PolicyRule,
        original_target: &str,
        targets_for_ask: Option<Vec<String>>,
    ) -> Result<Self> {
        if rule.action == Action::Deny {
            return Err(QubesError::AccessDenied(format!(
                "denied by policy {}:{}",
                rule.filename, rule.lineno
            )));
        }
        // a preselected default outside the ask set silently drops
        let target = match &targets_for_ask {
            Some(targets) => target.filter(|t| targets.contains(t)),
            None => target,
        };
        Ok(PolicyAction {
            service: service.to_owned(),
            source: source.to_owned(),
            target,
            original_target: original_target.to_owned(),
            targets_for_ask,
            rule: rule.clone(),
            action: rule.action,
        })
    }

    /// Apply the user's answer to an ask action. The chosen target must be
    /// one of the offered ones; a denial raises.
    pub fn handle_user_response(&mut self, allowed: bool, target: Option<&str>) -> Result<()> {
        debug_assert_eq!(self.action, Action::Ask);
        if allowed {
            let targets = self
                .targets_for_ask
                .as_ref()
                .ok_or_else(|| QubesError::AccessDenied("no targets to choose from".to_owned()))?;
            let target = target
                .map(canonical)
                .filter(|t| targets.contains(t))
                .ok_or_else(|| {
                    QubesError::AccessDenied("chosen target is not among the offered ones".to_owned())
                })?;
            self.target = Some(target);
            self.action = Action::Allow;
            Ok(())
        } else {
            self.action = Action::Deny;
            Err(QubesError::AccessDenied(format!(
                "denied by the user {}:{}",
                self.rule.filename, self.rule.lineno
            )))
        }
    }

    /// Execute an allowed call through the transport.
    ///
    /// For `$dispvm:<base>` targets a disposable is created and started
    /// first, and cleaned up afterwards even when the call fails.
    pub async fn execute(
        &self,
        transport: &dyn QrexecTransport,
        caller_ident: &str,
    ) -> Result<()> {
        debug_assert_eq!(self.action, Action::Allow);
        let target = self
            .target
            .as_deref()
            .ok_or_else(|| QubesError::AccessDenied("no target resolved".to_owned()))?;

        let command = if target == "dom0" {
            format!(
                "QUBESRPC {} {} {}",
                self.service, self.source, self.original_target
            )
        } else {
            format!(
                "{}:QUBESRPC {} {}",
                self.rule.override_user.as_deref().unwrap_or("DEFAULT"),
                self.service,
                self.source
            )
        };

        if let Some(base) = target.strip_prefix("$dispvm:") {
            let dispvm = transport
                .internal_call(base, "internal.vm.Create.DispVM")
                .await
                .map_err(|e| QubesError::Qubes(e.to_string()))?;
            let dispvm = dispvm.trim().to_owned();
            let result = async {
                transport
                    .internal_call(&dispvm, "internal.vm.Start")
                    .await
                    .map_err(|e| QubesError::Qubes(e.to_string()))?;
                transport
                    .run_client(&dispvm, caller_ident, true, &command)
                    .await
                    .map_err(|e| QubesError::Qubes(e.to_string()))
            }
            .await;
            // the disposable dies with its one call, error or not
            if let Err(error) = transport
                .internal_call(&dispvm, "internal.vm.CleanupDispVM")
                .await
            {
                warn!("cannot clean up disposable {dispvm}: {error}");
            }
            return result;
        }

        if target != "dom0" {
            match transport.internal_call(target, "internal.vm.Start").await {
                Ok(_) => {}
                Err(error) if error.exc_type == "QubesVMNotHaltedError" => {}
                Err(error) => return Err(QubesError::Qubes(error.to_string())),
            }
        }
        transport
            .run_client(target, caller_ident, false, &command)
            .await
            .map_err(|e| QubesError::Qubes(e.to_string()))
    }
}

/// Full policy for one service.
#[derive(Debug, Clone)]
pub struct Policy {
    pub service: String,
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    /// Load the policy of a service from the policy directory. A service
    /// with an argument (`svc+arg`) falls back to the bare service file.
    pub fn load(policy_dir: &Path, service: &str) -> Result<Policy> {
        let mut policy_file = policy_dir.join(service);
        if !policy_file.exists() {
            if let Some((bare, _)) = service.split_once('+') {
                policy_file = policy_dir.join(bare);
            }
        }
        let mut policy = Policy {
            service: service.to_owned(),
            rules: Vec::new(),
        };
        policy.load_file(policy_dir, &policy_file)?;
        Ok(policy)
    }

    fn load_file(&mut self, policy_dir: &Path, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            QubesError::AccessDenied(format!("failed to load {}: {error}", path.display()))
        })?;
        self.load_str(policy_dir, &text, &path.display().to_string())
    }

    /// Parse policy text; `$include:` lines pull other files in, resolved
    /// against the policy directory.
    pub fn load_str(&mut self, policy_dir: &Path, text: &str, filename: &str) -> Result<()> {
        for (lineno, line) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(include) = line.strip_prefix("$include:").or_else(|| line.strip_prefix("@include:")) {
                let include_path = PathBuf::from(include);
                let include_path = if include_path.is_absolute() {
                    include_path
                } else {
                    policy_dir.join(include_path)
                };
                self.load_file(policy_dir, &include_path)?;
            } else {
                self.rules.push(PolicyRule::parse(line, filename, lineno)?);
            }
        }
        Ok(())
    }

    /// First rule matching the given (source, target), top to bottom.
    pub fn find_matching_rule(
        &self,
        info: &SystemInfo,
        source: &str,
        target: &str,
    ) -> Result<&PolicyRule> {
        self.rules
            .iter()
            .find(|rule| rule.is_match(info, source, target))
            .ok_or_else(|| QubesError::AccessDenied("no matching rule found".to_owned()))
    }

    /// Targets the user may choose from for an ask action.
    ///
    /// Rules are walked in reverse so deny rules simply subtract their
    /// expanded targets from whatever later (earlier in the file) rules
    /// added.
    pub fn collect_targets_for_ask(&self, info: &SystemInfo, source: &str) -> Vec<String> {
        let mut targets: BTreeSet<String> = BTreeSet::new();

        for rule in self.rules.iter().rev() {
            if !PolicyRule::is_match_single(info, &rule.source, source) {
                continue;
            }
            if rule.action == Action::Deny {
                for expanded in rule.expand_target(info) {
                    targets.remove(&expanded);
                }
            } else if rule.override_target.is_some() {
                if let Some(override_target) = rule.expand_override_target(info, source) {
                    if verify_target_value(info, &override_target) {
                        if let Some(raw) = &rule.override_target {
                            targets.insert(raw.clone());
                        }
                    }
                }
            } else {
                targets.extend(rule.expand_target(info));
            }
        }

        // expand the default disposable placeholder
        if targets.remove("$dispvm") {
            if let Some(dispvm) = info
                .domains
                .get(source)
                .and_then(|d| d.default_dispvm.clone())
            {
                let dispvm = format!("$dispvm:{dispvm}");
                if verify_target_value(info, &dispvm) {
                    targets.insert(dispvm);
                }
            }
        }

        targets.into_iter().collect()
    }

    /// Evaluate the policy for a call. Returns an allow or ask action;
    /// denies raise [`QubesError::AccessDenied`].
    pub fn evaluate(
        &self,
        info: &SystemInfo,
        source: &str,
        target: &str,
    ) -> Result<PolicyAction> {
        let target = canonical(target);
        let rule = self.find_matching_rule(info, source, &target)?;
        if rule.action == Action::Deny {
            return Err(QubesError::AccessDenied(format!(
                "denied by policy {}:{}",
                rule.filename, rule.lineno
            )));
        }

        let actual_target = if rule.override_target.is_some() {
            let override_target = rule.expand_override_target(info, source);
            match override_target {
                Some(override_target) if verify_target_value(info, &override_target) => {
                    override_target
                }
                _ => {
                    return Err(QubesError::AccessDenied(format!(
                        "invalid target= value in {}:{}",
                        rule.filename, rule.lineno
                    )));
                }
            }
        } else {
            target.clone()
        };

        match rule.action {
            Action::Ask => {
                let targets = if rule.override_target.is_some() {
                    vec![actual_target]
                } else {
                    self.collect_targets_for_ask(info, source)
                };
                if targets.is_empty() {
                    return Err(QubesError::AccessDenied(format!(
                        "policy defines ask action at {}:{} but no target is available to choose from",
                        rule.filename, rule.lineno
                    )));
                }
                PolicyAction::new(
                    &self.service,
                    source,
                    rule.default_target.clone(),
                    rule,
                    &target,
                    Some(targets),
                )
            }
            Action::Allow => {
                if actual_target == "$default" {
                    return Err(QubesError::AccessDenied(format!(
                        "policy defines allow action at {}:{} but no target is specified by caller or policy",
                        rule.filename, rule.lineno
                    )));
                }
                PolicyAction::new(&self.service, source, Some(actual_target), rule, &target, None)
            }
            Action::Deny => unreachable!("denies raise above"),
        }
    }
}
