//! Built-in route handlers for configured routes.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};

use crate::error::Result;
use crate::http::response::Response;
use crate::http::websocket::{self, MessageCallback};
use crate::routing::handler::{Handler, RequestContext, RouteHandler};

/// Fixed bytes for every request.
pub fn static_bytes(body: Bytes, content_type: String) -> RouteHandler {
    RouteHandler::sync(move |_, _| {
        Ok(Some(Response::bytes(StatusCode::OK, &content_type, body.clone())))
    })
}

/// One file, range-capable.
pub fn single_file(path: PathBuf) -> RouteHandler {
    RouteHandler::sync(move |request, _| {
        if !matches!(request.method, Method::GET | Method::HEAD) {
            return Ok(Some(method_not_allowed()));
        }
        Ok(Some(Response::file(path.clone())))
    })
}

/// WebSocket endpoint delivering messages to `callback`.
pub fn websocket(callback: MessageCallback) -> RouteHandler {
    RouteHandler::sync(move |request, _| Ok(Some(websocket::upgrade(request, callback.clone()))))
}

fn method_not_allowed() -> Response {
    Response::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").with_header("Allow", "GET, HEAD")
}

/// Serves files below `root`, addressed by the route's short path.
#[derive(Debug, Clone)]
pub struct DirectoryHandler {
    root: PathBuf,
    index: String,
}

impl DirectoryHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: "index.html".to_string(),
        }
    }

    /// Join `short_path` under the root. `None` if it tries to escape.
    fn resolve(&self, short_path: &str) -> Option<PathBuf> {
        let relative = Path::new(short_path);
        let mut out = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(out)
    }
}

#[async_trait]
impl Handler for DirectoryHandler {
    async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<Option<Response>> {
        if !matches!(ctx.request.method, Method::GET | Method::HEAD) {
            return Ok(Some(method_not_allowed()));
        }
        let Some(mut path) = self.resolve(ctx.short_path) else {
            tracing::warn!(
                request_id = %ctx.request.request_id,
                short_path = %ctx.short_path,
                "Rejected directory traversal"
            );
            return Ok(Some(Response::text(StatusCode::FORBIDDEN, "Forbidden")));
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => path.push(&self.index),
            Ok(_) => {}
            Err(_) => return Ok(Some(Response::text(StatusCode::NOT_FOUND, "Not Found"))),
        }
        Ok(Some(Response::file(path)))
    }
}
