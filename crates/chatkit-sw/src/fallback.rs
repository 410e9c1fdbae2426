//! Offline fallback.
//!
//! Used only after a strategy could serve neither from its partition nor from the network.
//! Navigations get the application shell; everything else gets a network error.

use http::{header, HeaderValue, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use chatkit_net::{Destination, FetchResponse, HttpResponse, Request, ResponseSource};

use crate::cache::CacheStorage;

const OFFLINE_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Offline</title></head>\n<body><h1>You are offline</h1><p>Reconnect to keep chatting.</p></body>\n</html>\n";

/// Produces substitute responses when cache and network both failed.
#[derive(Debug, Clone)]
pub struct OfflineFallback {
    shell_partition: String,
    shell_key: String,
}

impl OfflineFallback {
    /// `shell_url` is the document captured into `shell_partition` at install time.
    pub fn new(shell_partition: impl Into<String>, shell_url: &Url) -> Self {
        Self {
            shell_partition: shell_partition.into(),
            shell_key: Request::get(shell_url.clone()).cache_key(),
        }
    }

    /// Resolve a substitute response. Never fails.
    pub async fn resolve(&self, request: &Request, caches: &RwLock<CacheStorage>) -> FetchResponse {
        if !is_document_request(request) {
            debug!(url = %request.url, "No fallback for non-navigation request");
            return FetchResponse::NetworkError;
        }

        let shell = caches
            .read()
            .await
            .get(&self.shell_partition)
            .and_then(|partition| partition.get(&self.shell_key));

        match shell {
            Some(entry) => {
                debug!(url = %request.url, "Serving cached shell");
                FetchResponse::Http(entry.to_response())
            }
            None => {
                warn!(url = %request.url, "No cached shell, serving built-in offline page");
                FetchResponse::Http(offline_page(request.url.clone()))
            }
        }
    }
}

fn is_document_request(request: &Request) -> bool {
    request.is_navigation() || request.destination == Destination::Document
}

/// The built-in offline document.
pub fn offline_page(url: Url) -> HttpResponse {
    let mut response = HttpResponse::new(url, StatusCode::SERVICE_UNAVAILABLE, OFFLINE_PAGE);
    response.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response.source = ResponseSource::Builtin;
    response
}
