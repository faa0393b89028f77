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

//! Per-qube firewall: an ordered rule list evaluated first-match by the
//! network-providing qube. The daemon only stores the rules and publishes
//! them to the netvm's configuration bus; enforcement happens in the netvm.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QubesError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleAction::Accept => "accept",
            RuleAction::Drop => "drop",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: RuleAction,
    /// Destination host or CIDR; absent means any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsthost: Option<String>,
    /// Destination port or inclusive range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dstports: Option<(u16, u16)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Rule {
    pub fn accept() -> Self {
        Rule {
            action: RuleAction::Accept,
            dsthost: None,
            dstports: None,
            proto: None,
            comment: None,
        }
    }

    /// Render in the `key=value` form published to the configuration bus.
    pub fn to_line(&self) -> String {
        let mut parts = vec![format!("action={}", self.action)];
        if let Some(host) = &self.dsthost {
            parts.push(format!("dsthost={host}"));
        }
        if let Some((lo, hi)) = self.dstports {
            parts.push(format!("dstports={lo}-{hi}"));
        }
        if let Some(proto) = &self.proto {
            parts.push(format!("proto={proto}"));
        }
        if let Some(comment) = &self.comment {
            parts.push(format!("comment={comment}"));
        }
        parts.join(" ")
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let mut rule = Rule {
            action: RuleAction::Drop,
            dsthost: None,
            dstports: None,
            proto: None,
            comment: None,
        };
        let mut saw_action = false;
        for part in line.split_whitespace() {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| QubesError::value(format!("invalid firewall token: {part:?}")))?;
            match key {
                "action" => {
                    rule.action = match value {
                        "accept" => RuleAction::Accept,
                        "drop" => RuleAction::Drop,
                        other => {
                            return Err(QubesError::value(format!(
                                "invalid firewall action: {other:?}"
                            )));
                        }
                    };
                    saw_action = true;
                }
                "dsthost" => rule.dsthost = Some(value.to_owned()),
                "dstports" => {
                    let (lo, hi) = match value.split_once('-') {
                        Some((lo, hi)) => (lo, hi),
                        None => (value, value),
                    };
                    let lo = lo
                        .parse()
                        .map_err(|_| QubesError::value(format!("invalid port: {value:?}")))?;
                    let hi = hi
                        .parse()
                        .map_err(|_| QubesError::value(format!("invalid port: {value:?}")))?;
                    rule.dstports = Some((lo, hi));
                }
                "proto" => rule.proto = Some(value.to_owned()),
                "comment" => rule.comment = Some(value.to_owned()),
                other => {
                    return Err(QubesError::value(format!(
                        "unknown firewall option: {other:?}"
                    )));
                }
            }
        }
        if !saw_action {
            return Err(QubesError::value("firewall rule without action"));
        }
        Ok(rule)
    }
}

/// The full firewall state of one qube. The final rule is an implicit drop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Firewall {
    pub rules: Vec<Rule>,
}

impl Firewall {
    /// Permissive default for freshly created qubes.
    pub fn allow_all() -> Self {
        Firewall {
            rules: vec![Rule::accept()],
        }
    }

    /// Entries published under `/qubes-firewall/<ip>/` in the netvm's
    /// configuration bus: zero-padded rule keys so lexical order matches
    /// evaluation order, plus a `policy` key for the implicit final action.
    pub fn qdb_entries(&self, ip: &str) -> Vec<(String, String)> {
        let prefix = format!("/qubes-firewall/{ip}");
        let mut entries: Vec<(String, String)> = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| (format!("{prefix}/{i:04}"), rule.to_line()))
            .collect();
        entries.push((format!("{prefix}/policy"), "drop".to_owned()));
        entries
    }
}
