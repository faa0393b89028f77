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

//! The management API runtime.
//!
//! Three flavors are served over local stream sockets with one framing: the
//! request is `<src>\0<method>\0<dest>\0<arg>\0<payload>`, terminated by the
//! client closing its write half; the response starts with `0` (ok), `1`
//! (event frame) or `2` (typed error). Every parameter coming off the wire
//! stays in an `untrusted_`-named binding until it survives validation.

/// Public, permission-gated management calls
pub mod admin;
/// Trusted calls from other administrative-domain components
pub mod internal;
/// Calls unprivileged qubes make about themselves
pub mod misc;

use std::rc::Rc;

use log::{debug, error, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use crate::AppRef;
use crate::error::{QubesError, Result};
use crate::events::{self, Emitter, EventArgs, PermissionFilter};
use crate::utils::decode_ascii;

/// Requests larger than this are dropped as malformed.
const MAX_REQUEST: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    Admin,
    Internal,
    Misc,
}

/// One registered method. `name` may contain a single `{endpoint}`
/// placeholder; the matched segment is handed to the handler.
pub struct MethodDef {
    pub name: &'static str,
    pub no_payload: bool,
}

/// Resolve a wire method name against a registry. Exactly one candidate must
/// match: none is a protocol error, several are a bug in the table.
pub fn resolve_method(
    table: &'static [MethodDef],
    method: &str,
) -> Result<(&'static MethodDef, Option<String>)> {
    let mut candidates = Vec::new();
    for def in table {
        match def.name.split_once("{endpoint}") {
            None => {
                if def.name == method {
                    candidates.push((def, None));
                }
            }
            Some((prefix, suffix)) => {
                if let Some(rest) = method.strip_prefix(prefix) {
                    if let Some(endpoint) = rest.strip_suffix(suffix) {
                        if !endpoint.is_empty() && !endpoint.contains('.') {
                            candidates.push((def, Some(endpoint.to_owned())));
                        }
                    }
                }
            }
        }
    }
    match candidates.len() {
        0 => Err(QubesError::protocol(format!("no such method: {method:?}"))),
        1 => Ok(candidates.pop().unwrap()),
        _ => Err(QubesError::Qubes(format!(
            "multiple candidates for method {method:?}"
        ))),
    }
}

/// Callback streaming handlers use to push one event frame to the client.
pub type EventSender = Rc<dyn Fn(&str, &str, &EventArgs)>;

/// Per-call context shared by all three APIs.
pub struct ApiCall {
    pub app: AppRef,
    /// Source qube, resolved from the wire source name
    pub src: u32,
    pub src_name: String,
    /// Destination qube, resolved from the wire destination name
    pub dest: u32,
    pub dest_name: String,
    pub method: String,
    pub arg: String,
    pub endpoint: Option<String>,
    /// Registry name the method resolved against (`{endpoint}` form kept)
    pub template: &'static str,
    pub send_event: Option<EventSender>,
}

impl ApiCall {
    /// Build the context, sanitizing every wire field. Non-ASCII data or an
    /// unknown qube name never reaches a handler body.
    pub fn new(
        app: &AppRef,
        untrusted_src: &[u8],
        untrusted_method: &[u8],
        untrusted_dest: &[u8],
        untrusted_arg: &[u8],
        send_event: Option<EventSender>,
    ) -> Result<ApiCall> {
        let src_name = decode_ascii(untrusted_src)?;
        let method = decode_ascii(untrusted_method)?;
        let dest_name = decode_ascii(untrusted_dest)?;
        let arg = decode_ascii(untrusted_arg)?;

        let (src, dest) = {
            let app = app.borrow();
            let src = app
                .domains
                .get_by_name(&src_name)
                .map(|vm| vm.qid)
                .ok_or_else(|| QubesError::protocol(format!("no such domain: {src_name:?}")))?;
            let dest = app
                .domains
                .get_by_name(&dest_name)
                .map(|vm| vm.qid)
                .ok_or_else(|| QubesError::protocol(format!("no such domain: {dest_name:?}")))?;
            (src, dest)
        };

        Ok(ApiCall {
            app: app.clone(),
            src,
            src_name,
            dest,
            dest_name,
            method,
            arg,
            endpoint: None,
            template: "",
            send_event,
        })
    }

    /// The destination must be the administrative qube.
    pub fn require_dest_dom0(&self) -> Result<()> {
        if self.dest_name == "dom0" {
            Ok(())
        } else {
            Err(QubesError::protocol("this method targets dom0 only"))
        }
    }

    /// The argument must be empty.
    pub fn require_no_arg(&self) -> Result<()> {
        if self.arg.is_empty() {
            Ok(())
        } else {
            Err(QubesError::protocol("unexpected argument"))
        }
    }

    /// Fire `mgmt-permission:<method>` on the source qube; handlers veto by
    /// raising and select by returning filters.
    pub fn fire_event_for_permission(&self, extra: EventArgs) -> Result<Vec<PermissionFilter>> {
        let args = extra
            .arg("dest", self.dest_name.as_str())
            .arg("arg", self.arg.as_str());
        let event = format!("mgmt-permission:{}", self.method);
        let mut app = self.app.borrow_mut();
        let returns = events::fire_event_pre(&mut app, Emitter::Vm(self.src), &event, &args)?;
        Ok(events::filters_of(returns))
    }
}

/// Persist the model after a mutating call. A conflict surfaces to the
/// client as a typed error, without retry.
pub fn save_app(app: &AppRef) -> Result<()> {
    crate::store::save(&mut app.borrow_mut())
}

fn split_request(untrusted_data: &[u8]) -> Result<[&[u8]; 5]> {
    let mut parts = untrusted_data.splitn(5, |b| *b == 0);
    let mut out: [&[u8]; 5] = [b""; 5];
    for slot in out.iter_mut() {
        *slot = parts
            .next()
            .ok_or_else(|| QubesError::protocol("malformed request header"))?;
    }
    Ok(out)
}

fn render_event_frame(subject: &str, event: &str, args: &EventArgs) -> Vec<u8> {
    let mut frame = b"1\0".to_vec();
    frame.extend_from_slice(subject.as_bytes());
    frame.push(0);
    frame.extend_from_slice(event.as_bytes());
    frame.push(0);
    for (key, value) in args.iter() {
        frame.extend_from_slice(key.as_bytes());
        frame.push(0);
        frame.extend_from_slice(value.to_string().as_bytes());
        frame.push(0);
    }
    frame.push(0);
    frame
}

fn render_error(error: &QubesError, debug: bool) -> Vec<u8> {
    let mut frame = b"2\0".to_vec();
    frame.extend_from_slice(error.wire_name().as_bytes());
    frame.push(0);
    if debug {
        frame.extend_from_slice(format!("{error:?}").as_bytes());
    }
    frame.push(0);
    frame.extend_from_slice(error.to_string().as_bytes());
    frame.push(0);
    frame.push(0);
    frame
}

async fn dispatch(flavor: ApiFlavor, call: ApiCall, untrusted_payload: Vec<u8>) -> Result<Option<String>> {
    match flavor {
        ApiFlavor::Admin => admin::dispatch(call, untrusted_payload).await,
        ApiFlavor::Internal => internal::dispatch(call, untrusted_payload).await,
        ApiFlavor::Misc => misc::dispatch(call, untrusted_payload).await,
    }
}

fn method_table(flavor: ApiFlavor) -> &'static [MethodDef] {
    match flavor {
        ApiFlavor::Admin => admin::METHODS,
        ApiFlavor::Internal => internal::METHODS,
        ApiFlavor::Misc => misc::METHODS,
    }
}

/// Handle one accepted connection: read the request to EOF, dispatch, write
/// the response. Streaming methods push event frames until the client goes
/// away, at which point the handler future is dropped (cancelled) and its
/// cleanup guards run.
pub async fn handle_connection<S>(app: AppRef, flavor: ApiFlavor, stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut untrusted_data = Vec::new();
    let mut buf = [0u8; 4096];
    let request = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(std::mem::take(&mut untrusted_data)),
            Ok(n) => {
                untrusted_data.extend_from_slice(&buf[..n]);
                if untrusted_data.len() > MAX_REQUEST {
                    break Err(QubesError::protocol("request too long"));
                }
            }
            Err(error) => break Err(QubesError::from(error)),
        }
    };

    let debug = app.borrow().debug;
    let outcome = match request {
        Ok(untrusted_data) => run_call(&app, flavor, &untrusted_data, &mut writer).await,
        Err(error) => Some(Err(error)),
    };

    match outcome {
        Some(Ok(Some(text))) => {
            let mut response = b"0\0".to_vec();
            response.extend_from_slice(text.as_bytes());
            let _ = writer.write_all(&response).await;
        }
        Some(Ok(None)) => {
            let _ = writer.write_all(b"0\0").await;
        }
        Some(Err(error)) => {
            debug!("api call failed: {error}");
            let _ = writer.write_all(&render_error(&error, debug)).await;
        }
        // the client went away mid-stream; nothing left to say
        None => {}
    }
    let _ = writer.shutdown().await;
}

async fn run_call<W>(
    app: &AppRef,
    flavor: ApiFlavor,
    untrusted_data: &[u8],
    writer: &mut W,
) -> Option<Result<Option<String>>>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let prepared = (|| {
        let [untrusted_src, untrusted_method, untrusted_dest, untrusted_arg, untrusted_payload] =
            split_request(untrusted_data)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let sender_tx = event_tx.clone();
        let send_event: EventSender = Rc::new(move |subject, event, args| {
            let _ = sender_tx.send(render_event_frame(subject, event, args));
        });

        let mut call = ApiCall::new(
            app,
            untrusted_src,
            untrusted_method,
            untrusted_dest,
            untrusted_arg,
            Some(send_event),
        )?;
        let (def, endpoint) = resolve_method(method_table(flavor), &call.method)?;
        call.endpoint = endpoint;
        call.template = def.name;
        if def.no_payload && !untrusted_payload.is_empty() {
            return Err(QubesError::protocol("unexpected payload"));
        }
        Ok((call, untrusted_payload.to_vec(), event_rx))
    })();

    let (call, untrusted_payload, mut event_rx) = match prepared {
        Ok(prepared) => prepared,
        Err(error) => return Some(Err(error)),
    };

    let method = call.method.clone();
    let mut handler = Box::pin(dispatch(flavor, call, untrusted_payload));
    let mut events_open = true;
    loop {
        tokio::select! {
            result = &mut handler => {
                if let Err(error) = &result {
                    warn!("{method} failed: {error}");
                }
                return Some(result);
            }
            maybe_frame = event_rx.recv(), if events_open => {
                match maybe_frame {
                    Some(frame) => {
                        if writer.write_all(&frame).await.is_err()
                            || writer.flush().await.is_err()
                        {
                            // client disconnected; dropping the handler is
                            // the cancellation
                            return None;
                        }
                    }
                    None => events_open = false,
                }
            }
        }
    }
}

/// Accept loop for one socket endpoint.
pub async fn serve(app: AppRef, flavor: ApiFlavor, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let app = app.clone();
                tokio::task::spawn_local(async move {
                    handle_connection(app, flavor, stream).await;
                });
            }
            Err(err) => {
                error!("accept failed: {err}");
                break;
            }
        }
    }
}
