//! Responses served on the public port before the router goes live

use crate::config::{PlaceholderMode, ServerConfig};
use crate::error::{ok_response, LoadingPage, ProxyBody};
use hyper::{Request, Response, StatusCode};

const STARTING_MESSAGE: &str = "We're getting things ready. This only takes a moment.";

/// Health answers plus a loading response for everything else
#[derive(Debug, Clone)]
pub struct Placeholder {
    health_path: String,
    mode: PlaceholderMode,
    page: LoadingPage,
}

impl Placeholder {
    pub fn new(health_path: impl Into<String>, mode: PlaceholderMode, page: LoadingPage) -> Self {
        Self {
            health_path: health_path.into(),
            mode,
            page,
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(
            server.health_path.clone(),
            server.placeholder,
            LoadingPage::new(server.brand.clone(), server.loading_refresh_secs),
        )
    }

    pub fn respond<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        if req.uri().path() == self.health_path {
            return ok_response();
        }

        match self.mode {
            PlaceholderMode::Ok => ok_response(),
            PlaceholderMode::LoadingPage => self.page.response(StatusCode::OK, STARTING_MESSAGE),
        }
    }
}
