//! Route trie
//!
//! Children are indexed by exact decoded segment text; each node carries at
//! most one parametric child. Lookup prefers static children, descends the
//! parametric child with its (cached) regex constraint, and lets a trailing
//! wildcard swallow the rest of the path. There is no backtracking: once a
//! static child matches a component, the parametric sibling is not retried.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::error::{Error, ErrorKind, Result};
use crate::router::pattern::{Pattern, Segment, SegmentKind};

static REGEX_CACHE: Lazy<DashMap<String, Arc<Regex>>> = Lazy::new(DashMap::new);

/// Compile (or fetch) the anchored regex for a constrained param
fn cached_regex(source: &str) -> Result<Arc<Regex>> {
    if let Some(existing) = REGEX_CACHE.get(source) {
        return Ok(existing.clone());
    }
    let compiled = Regex::new(&format!("^(?:{source})$")).map_err(|e| {
        Error::new(ErrorKind::ArgumentError, format!("invalid segment regex {source:?}: {e}"))
    })?;
    let compiled = Arc::new(compiled);
    REGEX_CACHE.insert(source.to_string(), compiled.clone());
    Ok(compiled)
}

#[derive(Debug)]
struct Node<H> {
    children: HashMap<String, Node<H>>,
    param_child: Option<Box<Node<H>>>,
    /// Descriptor of this node's own segment (None for the root)
    segment: Option<Segment>,
    is_end: bool,
    host: String,
    pattern: String,
    strip_prefix: Option<String>,
    handlers: HashMap<String, H>,
}

impl<H> Node<H> {
    fn new(segment: Option<Segment>) -> Self {
        Self {
            children: HashMap::new(),
            param_child: None,
            segment,
            is_end: false,
            host: String::new(),
            pattern: String::new(),
            strip_prefix: None,
            handlers: HashMap::new(),
        }
    }
}

/// A successful route resolution
#[derive(Debug, Clone)]
pub struct Found<H> {
    /// Handler registered for the method (or the `"*"` fallback)
    pub handler: H,
    /// Captured parameters in path order
    pub params: Vec<(String, String)>,
    /// The raw pattern that matched
    pub pattern: String,
    /// Path prefix to strip before the handler runs
    pub strip_prefix: Option<String>,
}

/// Trie router mapping `(host, method, path)` to handlers
pub struct Router<H> {
    root: RwLock<Node<H>>,
}

impl<H: Clone> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> Router<H> {
    /// An empty router
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::new(None)),
        }
    }

    /// Register a handler for `(method, pattern)`
    ///
    /// `strip_prefix`, when set, is recorded on the terminal node and
    /// removed from the request path before the handler observes it.
    pub fn insert(
        &self,
        method: &str,
        pattern: &str,
        handler: H,
        strip_prefix: Option<String>,
    ) -> Result<()> {
        let parsed = Pattern::parse(pattern)?;
        // validate constraint regexes at registration time
        for segment in &parsed.segments {
            if let Some(source) = &segment.regex {
                cached_regex(source)?;
            }
        }

        let mut root = self
            .root
            .write()
            .map_err(|_| Error::new(ErrorKind::Panic, "router lock poisoned"))?;
        let mut node = &mut *root;

        for segment in &parsed.segments {
            match segment.kind {
                SegmentKind::Static => {
                    node = node
                        .children
                        .entry(segment.name.clone())
                        .or_insert_with(|| Node::new(Some(segment.clone())));
                }
                SegmentKind::Param | SegmentKind::Wild => {
                    let child = node
                        .param_child
                        .get_or_insert_with(|| Box::new(Node::new(Some(segment.clone()))));
                    if child.segment.as_ref() != Some(segment) {
                        return Err(Error::new(
                            ErrorKind::RouteConflict,
                            format!(
                                "conflicting parametric segment {segment} in pattern {pattern:?}"
                            ),
                        ));
                    }
                    node = child.as_mut();
                }
            }
        }

        if node.handlers.contains_key(method) {
            return Err(Error::new(
                ErrorKind::RouteConflict,
                format!("route {method} {pattern:?} registered twice"),
            ));
        }
        node.is_end = true;
        node.host = parsed.host;
        node.pattern = parsed.raw;
        if strip_prefix.is_some() {
            node.strip_prefix = strip_prefix;
        }
        node.handlers.insert(method.to_string(), handler);
        Ok(())
    }

    /// Resolve a request path
    pub fn find(&self, host: &str, method: &str, path: &str) -> Result<Found<H>> {
        let root = self
            .root
            .read()
            .map_err(|_| Error::new(ErrorKind::Panic, "router lock poisoned"))?;

        let components: Vec<String> = path
            .split('/')
            .map(|component| {
                percent_decode_str(component)
                    .decode_utf8()
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_else(|_| component.to_string())
            })
            .collect();

        let mut node = &*root;
        let mut params: Vec<(String, String)> = Vec::new();
        let not_found = || Error::new(ErrorKind::NotFound, format!("no route for {path:?}"));

        let mut index = 0;
        while index < components.len() {
            let component = &components[index];

            if component.is_empty() {
                // empty components are skipped, except a wildcard binds empty tails
                let wild_child = node.param_child.as_deref().filter(|child| {
                    child.segment.as_ref().is_some_and(|s| s.kind == SegmentKind::Wild)
                });
                if let Some(child) = wild_child {
                    let rest = components[index..].join("/");
                    if let Some(segment) = &child.segment {
                        params.push((segment.name.clone(), rest));
                    }
                    node = child;
                    break;
                }
                index += 1;
                continue;
            }

            if let Some(child) = node.children.get(component.as_str()) {
                node = child;
                index += 1;
                continue;
            }

            let Some(child) = node.param_child.as_deref() else {
                return Err(not_found());
            };
            let Some(segment) = child.segment.clone() else {
                return Err(not_found());
            };

            match segment.kind {
                SegmentKind::Wild => {
                    let rest = components[index..].join("/");
                    params.push((segment.name.clone(), rest));
                    node = child;
                    index = components.len();
                }
                SegmentKind::Param | SegmentKind::Static => {
                    if let Some(source) = &segment.regex {
                        let re = cached_regex(source)?;
                        if !re.is_match(component) {
                            return Err(not_found());
                        }
                    }
                    params.push((segment.name.clone(), component.clone()));
                    node = child;
                    index += 1;
                }
            }
        }

        if !node.is_end {
            return Err(not_found());
        }
        if !node.host.is_empty() && !node.host.eq_ignore_ascii_case(host) {
            return Err(Error::new(
                ErrorKind::HostMismatch,
                format!("route {:?} is bound to host {:?}", node.pattern, node.host),
            ));
        }

        let handler = node
            .handlers
            .get(method)
            .or_else(|| node.handlers.get("*"))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::MethodNotAllowed,
                    format!("method {method} not allowed for {:?}", node.pattern),
                )
            })?;

        Ok(Found {
            handler: handler.clone(),
            params,
            pattern: node.pattern.clone(),
            strip_prefix: node.strip_prefix.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router<&'static str> {
        Router::new()
    }

    #[test]
    fn test_static_lookup() {
        let r = router();
        r.insert("GET", "/users/all", "list", None).unwrap();
        let found = r.find("localhost", "GET", "/users/all").unwrap();
        assert_eq!(found.handler, "list");
        assert!(found.params.is_empty());
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let r = router();
        r.insert("GET", "/a", "h1", None).unwrap();
        let err = r.insert("GET", "/a", "h2", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RouteConflict);
        // a different method on the same pattern is fine
        r.insert("POST", "/a", "h3", None).unwrap();
    }

    #[test]
    fn test_param_binding() {
        let r = router();
        r.insert("GET", "/u/{id}", "show", None).unwrap();
        let found = r.find("", "GET", "/u/42").unwrap();
        assert_eq!(found.params, vec![("id".to_string(), "42".to_string())]);
        assert_eq!(found.pattern, "/u/{id}");
    }

    #[test]
    fn test_static_beats_param() {
        let r = router();
        r.insert("GET", "/x/{id}", "param", None).unwrap();
        r.insert("GET", "/x/new", "static", None).unwrap();
        assert_eq!(r.find("", "GET", "/x/new").unwrap().handler, "static");
        let found = r.find("", "GET", "/x/42").unwrap();
        assert_eq!(found.handler, "param");
        assert_eq!(found.params[0].1, "42");
    }

    #[test]
    fn test_regex_constraint() {
        let r = router();
        r.insert("GET", "/u/{id:[0-9]+}", "num", None).unwrap();
        assert_eq!(r.find("", "GET", "/u/123").unwrap().handler, "num");
        let err = r.find("", "GET", "/u/abc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_regex_is_anchored() {
        let r = router();
        r.insert("GET", "/u/{id:[0-9]+}", "num", None).unwrap();
        assert!(r.find("", "GET", "/u/12a").is_err());
        assert!(r.find("", "GET", "/u/a12").is_err());
    }

    #[test]
    fn test_wildcard_capture() {
        let r = router();
        r.insert("GET", "/f/{p...}", "files", None).unwrap();
        let found = r.find("", "GET", "/f/a/b").unwrap();
        assert_eq!(found.params, vec![("p".to_string(), "a/b".to_string())]);
        let found = r.find("", "GET", "/f/").unwrap();
        assert_eq!(found.params, vec![("p".to_string(), String::new())]);
    }

    #[test]
    fn test_wildcard_does_not_match_bare_prefix() {
        let r = router();
        r.insert("GET", "/f/{p...}", "files", None).unwrap();
        assert!(r.find("", "GET", "/f").is_err());
    }

    #[test]
    fn test_host_gating() {
        let r = router();
        r.insert("GET", "h/ping", "pong", None).unwrap();
        assert_eq!(r.find("h", "GET", "/ping").unwrap().handler, "pong");
        let err = r.find("other", "GET", "/ping").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostMismatch);
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn test_method_fallback() {
        let r = router();
        r.insert("GET", "/m", "get", None).unwrap();
        r.insert("*", "/m", "any", None).unwrap();
        assert_eq!(r.find("", "GET", "/m").unwrap().handler, "get");
        assert_eq!(r.find("", "DELETE", "/m").unwrap().handler, "any");

        let strict = router();
        strict.insert("GET", "/s", "get", None).unwrap();
        let err = strict.find("", "PUT", "/s").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotAllowed);
        assert_eq!(err.status(), 405);
    }

    #[test]
    fn test_empty_components_skipped() {
        let r = router();
        r.insert("GET", "/a/b", "h", None).unwrap();
        assert_eq!(r.find("", "GET", "//a///b").unwrap().handler, "h");
    }

    #[test]
    fn test_percent_decoded_lookup() {
        let r = router();
        r.insert("GET", "/caf%C3%A9", "menu", None).unwrap();
        assert_eq!(r.find("", "GET", "/caf%C3%A9").unwrap().handler, "menu");
    }

    #[test]
    fn test_conflicting_param_descriptors() {
        let r = router();
        r.insert("GET", "/p/{id}", "a", None).unwrap();
        let err = r.insert("GET", "/p/{name}", "b", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RouteConflict);
    }

    #[test]
    fn test_strip_prefix_recorded() {
        let r = router();
        r.insert("GET", "/static/{p...}", "files", Some("/static".to_string()))
            .unwrap();
        let found = r.find("", "GET", "/static/css/site.css").unwrap();
        assert_eq!(found.strip_prefix.as_deref(), Some("/static"));
    }

    #[test]
    fn test_deep_mixed_routes() {
        let r = router();
        r.insert("GET", "/api/v1/users/{id}/posts/{post:[0-9]+}", "post", None)
            .unwrap();
        let found = r.find("", "GET", "/api/v1/users/7/posts/99").unwrap();
        assert_eq!(
            found.params,
            vec![
                ("id".to_string(), "7".to_string()),
                ("post".to_string(), "99".to_string())
            ]
        );
        assert!(r.find("", "GET", "/api/v1/users/7/posts/x").is_err());
    }
}
