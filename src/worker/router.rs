use std::collections::HashSet;

use http::Method;

use super::request::WorkerRequest;

/// Routing classes, in evaluation order. Each maps to one strategy and one
/// namespace purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Api,
    Navigation,
    Image,
    /// A non-navigation request for a URL seeded from the precache manifest.
    Precached,
    Static,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Api => "api",
            RouteClass::Navigation => "navigation",
            RouteClass::Image => "image",
            RouteClass::Precached => "precached",
            RouteClass::Static => "static",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Handle(RouteClass),
    /// Not intercepted: passes through to default handling untouched.
    Bypass,
}

/// Stateless classification. Non-GET requests and cross-origin requests
/// outside the allow-list are never intercepted; everything else lands in
/// exactly one class, first match wins.
pub fn classify(
    request: &WorkerRequest,
    api_prefixes: &[String],
    allowed_origins: &[String],
    precached_urls: &HashSet<String>,
) -> Routing {
    if request.method != Method::GET {
        return Routing::Bypass;
    }
    if request.cross_origin {
        let host = request.uri.host().unwrap_or_default();
        let allowed = allowed_origins.iter().any(|origin| origin == host);
        if !allowed {
            return Routing::Bypass;
        }
        // Allow-listed cross-origin assets are treated as static content.
        return if request.destination_is_image() {
            Routing::Handle(RouteClass::Image)
        } else {
            Routing::Handle(RouteClass::Static)
        };
    }

    let path = request.path();
    if api_prefixes.iter().any(|prefix| path.starts_with(prefix)) {
        return Routing::Handle(RouteClass::Api);
    }
    if request.is_navigation() {
        return Routing::Handle(RouteClass::Navigation);
    }
    if request.destination_is_image() {
        return Routing::Handle(RouteClass::Image);
    }
    // Precache entries are keyed by bare URL; queryful variants go to the
    // runtime namespace instead.
    if request.uri.query().is_none() && precached_urls.contains(path) {
        return Routing::Handle(RouteClass::Precached);
    }
    Routing::Handle(RouteClass::Static)
}
