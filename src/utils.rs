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
use crate::error::{QubesError, Result};

/// Escape a string for use as XML text or attribute value.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Decode wire bytes as strict ASCII. Anything outside the 7-bit range is a
/// protocol error; the caller never sees the offending bytes as a string.
pub fn decode_ascii(untrusted_bytes: &[u8]) -> Result<String> {
    if untrusted_bytes.is_ascii() {
        // a checked trust boundary crossing
        Ok(String::from_utf8(untrusted_bytes.to_vec()).unwrap())
    } else {
        Err(QubesError::protocol("non-ASCII data on the wire"))
    }
}

/// Check that every character of `value` is in `allowed`.
pub fn all_chars_in(value: &str, allowed: &str) -> bool {
    value.chars().all(|c| allowed.contains(c))
}

pub const SAFE_KEY_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";
