// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP hosting for the agent.
//!
//! Dropshot owns the listener and the connection handling, but routing is
//! the agent's own: every request for a supported method lands on a
//! catch-all endpoint and is handed to the [`Dispatcher`] unchanged.

use std::sync::Arc;

use dropshot::{
    endpoint, ApiDescription, Body, HttpError, Path, RequestContext,
    UntypedBody,
};
use http::header::CONTENT_TYPE;
use http::Response;
use schemars::JsonSchema;
use serde::Deserialize;
use slog::{o, Logger};

use crate::dispatch::{Dispatcher, Reply};

/// Server-wide state shared by every request.
pub struct Context {
    pub dispatcher: Dispatcher,
}

impl Context {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

/// The complete request path, as dropshot splits it.
#[derive(Deserialize, JsonSchema)]
struct AnyPath {
    #[allow(dead_code)]
    path: Vec<String>,
}

async fn forward(
    rqctx: RequestContext<Arc<Context>>,
    body: UntypedBody,
) -> Result<Response<Body>, HttpError> {
    let request = &rqctx.request;
    let reply = rqctx
        .context()
        .dispatcher
        .handle(
            request.method(),
            request.uri().path(),
            request.headers(),
            body.as_bytes(),
        )
        .await;
    into_response(reply)
}

fn into_response(reply: Reply) -> Result<Response<Body>, HttpError> {
    Response::builder()
        .status(reply.status)
        .header(CONTENT_TYPE, reply.content_type)
        .body(Body::with_content(reply.body))
        .map_err(|e| {
            HttpError::for_internal_error(format!("building response: {e}"))
        })
}

#[endpoint {
    method = GET,
    path = "/{path:.*}",
    unpublished = true,
}]
async fn get_any(
    rqctx: RequestContext<Arc<Context>>,
    _path: Path<AnyPath>,
    body: UntypedBody,
) -> Result<Response<Body>, HttpError> {
    forward(rqctx, body).await
}

#[endpoint {
    method = POST,
    path = "/{path:.*}",
    unpublished = true,
}]
async fn post_any(
    rqctx: RequestContext<Arc<Context>>,
    _path: Path<AnyPath>,
    body: UntypedBody,
) -> Result<Response<Body>, HttpError> {
    forward(rqctx, body).await
}

#[endpoint {
    method = DELETE,
    path = "/{path:.*}",
    unpublished = true,
}]
async fn delete_any(
    rqctx: RequestContext<Arc<Context>>,
    _path: Path<AnyPath>,
    body: UntypedBody,
) -> Result<Response<Body>, HttpError> {
    forward(rqctx, body).await
}

/// Returns a Dropshot [`ApiDescription`] that forwards every GET, POST and
/// DELETE request to the dispatcher.
pub fn api() -> ApiDescription<Arc<Context>> {
    let mut api = ApiDescription::new();
    api.register(get_any).unwrap();
    api.register(post_any).unwrap();
    api.register(delete_any).unwrap();
    api
}

/// configuration for the dropshot server
pub type Config = dropshot::ConfigDropshot;
/// the dropshot server itself
pub type Server = dropshot::HttpServer<Arc<Context>>;
/// errors returned from attempting to start a dropshot server
pub type ServerStartError = Box<dyn std::error::Error + Send + Sync>;

/// Starts serving `dispatcher` with the given dropshot configuration.
pub fn start(
    config: &Config,
    dispatcher: Dispatcher,
    log: &Logger,
) -> Result<Server, ServerStartError> {
    let dropshot_log = log.new(o!("component" => "dropshot"));
    let context = Arc::new(Context::new(dispatcher));
    let starter = dropshot::HttpServerStarter::new(
        config,
        api(),
        context,
        &dropshot_log,
    )?;
    Ok(starter.start())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;

    #[test]
    fn api_registers_catch_alls() {
        // Registration panics on a malformed endpoint; building the
        // description is enough to check all three.
        let _ = api();
    }

    #[test]
    fn reply_becomes_response() {
        let reply = Reply {
            status: StatusCode::ACCEPTED,
            content_type: "application/json",
            body: Bytes::from_static(b"{}"),
        };
        let response = into_response(reply).unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
