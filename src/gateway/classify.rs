//! Request classification.

/// How the gateway treats an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A backend route: network only, offline envelope on failure.
    Api,
    /// Anything else: cache first, then network.
    Static,
}

/// Classifies a request path against the API route suffixes.
///
/// A path is [`RequestKind::Api`] iff it ends with `/` followed by one of
/// `routes`. Matching is on whole trailing segments: `/v1/health` is an API
/// call, `/healthcheck`, `/unhealth` and `/health/` are not. Pass the path
/// without its query string.
///
/// # Examples
///
/// ```
/// use oathlink_gateway::gateway::{RequestKind, classify};
/// use oathlink_gateway::config::DEFAULT_API_ROUTES;
///
/// assert_eq!(classify("/memory/search", &DEFAULT_API_ROUTES), RequestKind::Api);
/// assert_eq!(classify("/index.html", &DEFAULT_API_ROUTES), RequestKind::Static);
/// ```
pub fn classify<S: AsRef<str>>(path: &str, routes: &[S]) -> RequestKind {
    let is_api = routes.iter().any(|route| {
        path.strip_suffix(route.as_ref())
            .is_some_and(|head| head.ends_with('/'))
    });
    if is_api {
        RequestKind::Api
    } else {
        RequestKind::Static
    }
}
