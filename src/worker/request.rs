use http::header::{ACCEPT, HeaderMap};
use http::{Method, Uri};

/// An intercepted request as the worker sees it: method, origin-form target
/// (or an absolute URL for cross-origin interception), and headers.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub cross_origin: bool,
}

impl WorkerRequest {
    pub fn get(uri: Uri) -> Self {
        Self {
            method: Method::GET,
            uri,
            headers: HeaderMap::new(),
            cross_origin: false,
        }
    }

    /// The request identity used for cache keys and in-flight tickets:
    /// path plus query, fragment stripped; absolute for cross-origin
    /// targets since this worker serves exactly one origin.
    pub fn identity(&self) -> String {
        if self.cross_origin {
            self.uri.to_string()
        } else {
            self.uri
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| self.uri.path().to_string())
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    fn header_str(&self, name: &http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn accepts_html(&self) -> bool {
        self.header_str(&ACCEPT)
            .map(|accept| accept.contains("text/html"))
            .unwrap_or(false)
    }

    /// Navigation detection: trust the fetch metadata header when the
    /// browser supplies it, otherwise fall back to content negotiation.
    pub fn is_navigation(&self) -> bool {
        if let Some(mode) = self.header_str(&SEC_FETCH_MODE) {
            return mode.eq_ignore_ascii_case("navigate");
        }
        self.accepts_html()
    }

    pub fn destination_is_image(&self) -> bool {
        if let Some(dest) = self.header_str(&SEC_FETCH_DEST) {
            return dest.eq_ignore_ascii_case("image");
        }
        let path = self.path();
        let extension = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        matches!(
            extension.as_deref(),
            Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "avif")
        )
    }
}

pub const SEC_FETCH_MODE: http::header::HeaderName =
    http::header::HeaderName::from_static("sec-fetch-mode");
pub const SEC_FETCH_DEST: http::header::HeaderName =
    http::header::HeaderName::from_static("sec-fetch-dest");
