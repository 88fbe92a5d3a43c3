//! Static landing-page assets with single-page-app fallback

use crate::error::{empty_body, full_body, json_error_response, ProxyBody, ProxyErrorCode};
use hyper::header::{HeaderValue, ALLOW, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use mime_guess::MimeGuess;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub struct StaticAssets {
    root: PathBuf,
    index: String,
}

impl StaticAssets {
    pub fn new(root: impl Into<PathBuf>, index: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index: index.into(),
        }
    }

    /// Serve the request path from disk, falling back to the index document
    pub async fn serve<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let head_only = match *req.method() {
            Method::GET => false,
            Method::HEAD => true,
            _ => return method_not_allowed(),
        };

        if let Some(file) = self.resolve(req.uri().path()) {
            let is_file = tokio::fs::metadata(&file).await.map(|m| m.is_file()).unwrap_or(false);
            if is_file {
                match tokio::fs::read(&file).await {
                    Ok(contents) => return file_response(&file, contents, head_only, false),
                    Err(e) => warn!(path = %file.display(), error = %e, "Failed to read static asset"),
                }
            }
        }

        let index = self.root.join(&self.index);
        match tokio::fs::read(&index).await {
            Ok(contents) => {
                debug!(path = req.uri().path(), "Serving index for client-side route");
                file_response(&index, contents, head_only, true)
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %index.display(), error = %e, "Failed to read index document");
                }
                json_error_response(ProxyErrorCode::NotFound, "Not found")
            }
        }
    }

    /// Map a URL path under the root; `None` for anything that could escape it
    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(url_path).ok()?;
        let relative = decoded.trim_start_matches('/');
        if relative.is_empty() || relative.ends_with('/') || relative.contains('\0') {
            return None;
        }

        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                _ => return None,
            }
        }
        Some(path)
    }
}

fn file_response(path: &Path, contents: Vec<u8>, head_only: bool, is_index: bool) -> Response<ProxyBody> {
    let mime = MimeGuess::from_path(path).first_or_octet_stream();
    let cache = if is_index { "no-cache" } else { "public, max-age=3600" };
    let len = contents.len();

    let mut response = Response::new(if head_only { empty_body() } else { full_body(contents) });
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    response
}

fn method_not_allowed() -> Response<ProxyBody> {
    let mut response = json_error_response(ProxyErrorCode::MethodNotAllowed, "Method not allowed");
    response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
    response
}
