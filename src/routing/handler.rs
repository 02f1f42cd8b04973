//! The contract a route plugs into.
//!
//! A handler receives the parsed request, the part of the path below the
//! matched wildcard prefix, and the client's write side (for handlers that
//! stream their own output, such as the proxy and tunnel forwarding). It
//! yields a [`Response`], or `None` for "no match" which becomes a `404`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::http::pipeline::Downstream;
use crate::http::request::Request;
use crate::http::response::Response;

pub struct RequestContext<'a> {
    pub request: &'a Request,
    /// Path remainder below the matched `/*` prefix; empty on exact matches.
    pub short_path: &'a str,
    pub downstream: &'a mut Downstream,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<Option<Response>>;
}

pub type SyncHandler = dyn Fn(&Request, &str) -> Result<Option<Response>> + Send + Sync;

#[derive(Clone)]
pub enum RouteHandler {
    Sync(Arc<SyncHandler>),
    Async(Arc<dyn Handler>),
}

impl fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteHandler::Sync(_) => f.write_str("RouteHandler::Sync"),
            RouteHandler::Async(_) => f.write_str("RouteHandler::Async"),
        }
    }
}

impl RouteHandler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Request, &str) -> Result<Option<Response>> + Send + Sync + 'static,
    {
        RouteHandler::Sync(Arc::new(f))
    }

    pub fn from_handler<H: Handler + 'static>(handler: H) -> Self {
        RouteHandler::Async(Arc::new(handler))
    }

    pub async fn invoke(&self, ctx: &mut RequestContext<'_>) -> Result<Option<Response>> {
        match self {
            RouteHandler::Sync(f) => f(ctx.request, ctx.short_path),
            RouteHandler::Async(h) => h.handle(ctx).await,
        }
    }
}
