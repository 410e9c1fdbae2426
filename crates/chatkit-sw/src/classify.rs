//! Request classification.
//!
//! Each intercepted request is assigned to exactly one [`Route`] by an ordered rule list;
//! the first matching rule wins and the last rule matches everything.

use chatkit_net::{Destination, Request};
use std::fmt;
use tracing::trace;

/// Named route, one per caching role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Manifest,
    Static,
    Image,
    Api,
    Default,
}

impl Route {
    pub const ALL: [Route; 5] = [
        Route::Manifest,
        Route::Static,
        Route::Image,
        Route::Api,
        Route::Default,
    ];

    /// Role name, also used in partition names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Manifest => "manifest",
            Route::Static => "static",
            Route::Image => "image",
            Route::Api => "api",
            Route::Default => "default",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePredicate {
    /// URL path ends with the given suffix.
    PathSuffix(String),
    /// URL path starts with the given prefix.
    PathPrefix(String),
    /// Request destination is one of the given values.
    DestinationIn(Vec<Destination>),
    /// Matches every request.
    Any,
}

impl RoutePredicate {
    pub fn matches(&self, request: &Request) -> bool {
        let path = request.url.path();
        match self {
            RoutePredicate::PathSuffix(suffix) => path.ends_with(suffix.as_str()),
            RoutePredicate::PathPrefix(prefix) => path.starts_with(prefix.as_str()),
            RoutePredicate::DestinationIn(destinations) => destinations.contains(&request.destination),
            RoutePredicate::Any => true,
        }
    }
}

/// One classification rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub predicate: RoutePredicate,
    pub route: Route,
}

/// Maps requests to routes.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    rules: Vec<RouteRule>,
}

impl RequestClassifier {
    /// Build the standard rule list:
    /// manifest filename, script/style, image, API prefix, then the catch-all.
    pub fn new(manifest_filename: &str, api_prefix: &str) -> Self {
        let rules = vec![
            RouteRule {
                predicate: RoutePredicate::PathSuffix(manifest_filename.to_string()),
                route: Route::Manifest,
            },
            RouteRule {
                predicate: RoutePredicate::DestinationIn(vec![Destination::Script, Destination::Style]),
                route: Route::Static,
            },
            RouteRule {
                predicate: RoutePredicate::DestinationIn(vec![Destination::Image]),
                route: Route::Image,
            },
            RouteRule {
                predicate: RoutePredicate::PathPrefix(api_prefix.to_string()),
                route: Route::Api,
            },
            RouteRule {
                predicate: RoutePredicate::Any,
                route: Route::Default,
            },
        ];
        Self { rules }
    }

    /// Classify a request. Never fails: the last rule matches everything.
    pub fn classify(&self, request: &Request) -> Route {
        let route = self
            .rules
            .iter()
            .find(|rule| rule.predicate.matches(request))
            .map(|rule| rule.route)
            .unwrap_or(Route::Default);
        trace!(url = %request.url, destination = ?request.destination, route = %route, "Classified request");
        route
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self::new("manifest.json", "/api/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, destination: Destination) -> Request {
        Request::parse(url).unwrap().destination(destination)
    }

    #[test]
    fn test_manifest_wins_over_everything() {
        let classifier = RequestClassifier::default();
        assert_eq!(
            classifier.classify(&request("https://chat.example/manifest.json", Destination::Manifest)),
            Route::Manifest
        );
        // Even when fetched with a static-asset destination.
        assert_eq!(
            classifier.classify(&request("https://chat.example/manifest.json", Destination::Script)),
            Route::Manifest
        );
    }

    #[test]
    fn test_script_and_style_are_static() {
        let classifier = RequestClassifier::default();
        assert_eq!(
            classifier.classify(&request("https://chat.example/static/js/main.1a2b.js", Destination::Script)),
            Route::Static
        );
        assert_eq!(
            classifier.classify(&request("https://chat.example/static/css/main.css", Destination::Style)),
            Route::Static
        );
    }

    #[test]
    fn test_image() {
        let classifier = RequestClassifier::default();
        assert_eq!(
            classifier.classify(&request("https://chat.example/chatapp.png", Destination::Image)),
            Route::Image
        );
    }

    #[test]
    fn test_api_prefix() {
        let classifier = RequestClassifier::default();
        assert_eq!(
            classifier.classify(&request("https://chat.example/api/foo", Destination::Empty)),
            Route::Api
        );
        // Destination rules are checked first.
        assert_eq!(
            classifier.classify(&request("https://chat.example/api/avatar.png", Destination::Image)),
            Route::Image
        );
    }

    #[test]
    fn test_everything_else_is_default() {
        let classifier = RequestClassifier::default();
        assert_eq!(
            classifier.classify(&Request::navigate(url::Url::parse("https://chat.example/").unwrap())),
            Route::Default
        );
        assert_eq!(
            classifier.classify(&request("https://chat.example/apiary", Destination::Empty)),
            Route::Default
        );
    }

    #[test]
    fn test_custom_prefixes() {
        let classifier = RequestClassifier::new("site.webmanifest", "/v2/");
        assert_eq!(
            classifier.classify(&request("https://chat.example/site.webmanifest", Destination::Empty)),
            Route::Manifest
        );
        assert_eq!(
            classifier.classify(&request("https://chat.example/v2/rooms", Destination::Empty)),
            Route::Api
        );
        assert_eq!(classifier.rules().len(), 5);
    }
}
