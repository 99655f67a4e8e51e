// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request dispatch: turns a raw (method, path, headers, body) request into
//! exactly one [`Reply`].
//!
//! The dispatcher resolves the path against the [`RouteTable`], parses the
//! payload for endpoints that take one, invokes the handler with whatever
//! guest identifier the route captured, and maps every failure onto a status
//! code. Nothing that happens while handling a request escapes as an error
//! or a panic.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use bytes::Bytes;
use futures::FutureExt;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use slog::{error, info, o, warn, Logger};
use thiserror::Error;
use virt_agent_api_types::GuestCreateRequest;

use crate::handlers::{Endpoint, Payload, Services};
use crate::pages::Content;
use crate::probe::ProbeUnavailable;
use crate::provision::ProvisionError;
use crate::router::RouteTable;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

/// A fully-formed response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl Reply {
    /// Serializes `value` as pretty-printed JSON.
    pub fn json<T: Serialize>(
        status: StatusCode,
        value: &T,
    ) -> Result<Self, DispatchError> {
        let body = serde_json::to_vec_pretty(value).map_err(|e| {
            DispatchError::Internal(format!("failed to serialize reply: {e}"))
        })?;
        Ok(Self { status, content_type: APPLICATION_JSON, body: body.into() })
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self { status, content_type: TEXT_PLAIN, body: body.into().into() }
    }

    pub fn content(content: Content) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: content.media_type,
            body: content.body,
        }
    }
}

/// Reasons a request did not produce a successful reply.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no route for {method} {path}")]
    NoMatch { method: Method, path: String },

    #[error("{0}")]
    MalformedPayload(String),

    #[error("{endpoint} is not implemented{}", guest_suffix(.guest))]
    NotImplemented { endpoint: &'static str, guest: Option<String> },

    #[error(transparent)]
    ProbeUnavailable(#[from] ProbeUnavailable),

    #[error(transparent)]
    ProvisioningFailed(#[from] ProvisionError),

    #[error("static file {0} not found")]
    FileNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn guest_suffix(guest: &Option<String>) -> String {
    match guest {
        Some(g) => format!(" (guest {g})"),
        None => String::new(),
    }
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::NoMatch { method, .. } if method == Method::POST => {
                StatusCode::BAD_REQUEST
            }
            DispatchError::NoMatch { .. } => StatusCode::NOT_FOUND,
            DispatchError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            DispatchError::ProbeUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::ProvisioningFailed(_)
            | DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::FileNotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// The plain-text reply sent to the client.
    pub fn into_reply(self) -> Reply {
        let status = self.status();
        let body = match self {
            DispatchError::NoMatch { method, .. } if method == Method::POST => {
                "Invalid request path.".to_string()
            }
            DispatchError::NoMatch { .. } => "Resource not found.".to_string(),
            DispatchError::FileNotFound(_) => "File not found.".to_string(),
            // The script's own diagnostics are the most useful thing to hand
            // back to whoever asked for the guest.
            DispatchError::ProvisioningFailed(ProvisionError::Failed {
                stderr,
                ..
            }) if !stderr.is_empty() => stderr,
            DispatchError::Internal(_) => "Internal server error.".to_string(),
            other => other.to_string(),
        };
        Reply::text(status, body)
    }
}

/// Strips the query string and a single trailing slash.
fn normalize(path: &str) -> &str {
    let path = path.split_once('?').map_or(path, |(p, _)| p);
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Rejects a body whose declared type is not JSON. A missing Content-Type is
/// accepted.
fn check_content_type(headers: &HeaderMap) -> Result<(), DispatchError> {
    let Some(value) = headers.get(CONTENT_TYPE) else {
        return Ok(());
    };
    let media_type = value
        .to_str()
        .ok()
        .and_then(|v| v.split(';').next())
        .map(str::trim);
    match media_type {
        Some(t) if t.eq_ignore_ascii_case(APPLICATION_JSON) => Ok(()),
        _ => Err(DispatchError::MalformedPayload(format!(
            "unsupported content type {value:?}, expected {APPLICATION_JSON}"
        ))),
    }
}

fn parse_payload(
    endpoint: &Endpoint,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Payload, DispatchError> {
    if !endpoint.takes_body() {
        return Ok(Payload::Empty);
    }
    check_content_type(headers)?;
    let req: GuestCreateRequest =
        serde_json::from_slice(body).map_err(|e| {
            DispatchError::MalformedPayload(format!(
                "invalid guest description: {e}"
            ))
        })?;
    req.validate().map_err(|e| {
        DispatchError::MalformedPayload(format!(
            "invalid guest description: {e}"
        ))
    })?;
    Ok(Payload::Guest(req))
}

/// Routes requests to the agent's handlers.
pub struct Dispatcher {
    routes: RouteTable<Endpoint>,
    services: Services,
    log: Logger,
}

impl Dispatcher {
    pub fn new(
        routes: RouteTable<Endpoint>,
        services: Services,
        log: Logger,
    ) -> Self {
        Self { routes, services, log }
    }

    /// Handles one request. Always produces a reply.
    pub async fn handle(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Reply {
        let start = Instant::now();
        let path = normalize(path);
        let log = self.log.new(o!(
            "method" => method.to_string(),
            "path" => path.to_string(),
        ));

        let reply = match self.dispatch(method, path, headers, body, &log).await
        {
            Ok(reply) => reply,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    error!(log, "request failed"; "error" => %e);
                } else {
                    warn!(log, "request rejected"; "error" => %e);
                }
                e.into_reply()
            }
        };

        info!(log, "request completed";
            "status" => reply.status.as_u16(),
            "latency_us" => start.elapsed().as_micros() as u64);
        reply
    }

    async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
        log: &Logger,
    ) -> Result<Reply, DispatchError> {
        let resolved = self.routes.resolve(method, path).ok_or_else(|| {
            DispatchError::NoMatch {
                method: method.clone(),
                path: path.to_string(),
            }
        })?;
        let payload = parse_payload(resolved.handler, headers, body)?;

        let call = self.services.call(
            resolved.handler,
            resolved.captured,
            payload,
            log,
        );
        AssertUnwindSafe(call).catch_unwind().await.unwrap_or_else(|p| {
            Err(DispatchError::Internal(format!(
                "handler for {} panicked: {}",
                resolved.pattern,
                panic_message(p.as_ref())
            )))
        })
    }
}
