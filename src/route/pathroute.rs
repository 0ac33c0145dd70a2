//! Routes requests by matching paths against regular expressions.
//!
//! All registered patterns are compiled into a single alternation
//! `^(p1)|(p2)|.../?$` sorted so that longer patterns come first; the most
//! specific pattern therefore wins. One match per request, the index of the
//! first participating capture group selects the location.

use std::sync::{Arc, RwLock};

use regex::Regex;

use crate::error::{GantryError, GantryResult};
use crate::location::Location;
use crate::request::ProxyRequest;
use crate::route::Router;

pub struct PathRouter {
    inner: RwLock<PathInner>,
}

struct PathInner {
    locations: Vec<LocPair>,
    mapping: Option<Mapping>,
}

struct LocPair {
    pattern: String,
    location: Arc<dyn Location>,
}

struct Mapping {
    expression: Regex,
    // First capture group index of each pattern inside the alternation;
    // patterns may contain their own groups, so the offsets are not uniform
    group_offsets: Vec<usize>,
}

impl Default for PathRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PathRouter {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PathInner {
                locations: Vec::new(),
                mapping: None,
            }),
        }
    }

    /// Registers a location under a path pattern. The pattern must compile
    /// as a regular expression and must not be registered twice.
    pub fn add_location(&self, pattern: &str, location: Arc<dyn Location>) -> GantryResult<()> {
        Regex::new(pattern).map_err(|e| {
            GantryError::config(format!(
                "Pattern '{}' does not compile into a regular expression: {}",
                pattern, e
            ))
        })?;

        let mut inner = self.inner.write().unwrap();
        if inner.locations.iter().any(|p| p.pattern == pattern) {
            return Err(GantryError::config(format!(
                "Pattern '{}' already exists",
                pattern
            )));
        }
        inner.locations.push(LocPair {
            pattern: pattern.to_string(),
            location,
        });
        // Longer patterns first, so the most specific match wins
        inner
            .locations
            .sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
        inner.mapping = Some(build_mapping(&inner.locations)?);
        Ok(())
    }

    pub fn remove_location(&self, pattern: &str) -> GantryResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.locations.retain(|p| p.pattern != pattern);
        inner.mapping = if inner.locations.is_empty() {
            None
        } else {
            Some(build_mapping(&inner.locations)?)
        };
        Ok(())
    }
}

impl Router for PathRouter {
    fn route(&self, req: &ProxyRequest) -> GantryResult<Option<Arc<dyn Location>>> {
        let inner = self.inner.read().unwrap();
        let mapping = match &inner.mapping {
            Some(mapping) => mapping,
            None => return Ok(None),
        };

        let path = req.uri().path();
        let path = if path.is_empty() { "/" } else { path };
        let captures = match mapping.expression.captures(path) {
            Some(captures) => captures,
            None => return Ok(None),
        };
        for (i, &offset) in mapping.group_offsets.iter().enumerate() {
            if captures.get(offset).is_some() {
                return Ok(Some(Arc::clone(&inner.locations[i].location)));
            }
        }
        Ok(None)
    }
}

fn build_mapping(locations: &[LocPair]) -> GantryResult<Mapping> {
    let mut out = String::from("^");
    let mut group_offsets = Vec::with_capacity(locations.len());
    let mut next_group = 1;
    for (i, pair) in locations.iter().enumerate() {
        group_offsets.push(next_group);
        // The wrapping group plus any groups inside the pattern itself
        let own_groups = Regex::new(&pair.pattern)
            .map_err(|e| GantryError::config(format!("Pattern '{}': {}", pair.pattern, e)))?
            .captures_len()
            - 1;
        next_group += 1 + own_groups;

        out.push('(');
        out.push_str(&pair.pattern);
        out.push(')');
        if i != locations.len() - 1 {
            out.push('|');
        }
    }
    // Optional trailing slash
    out.push_str("/?$");
    let expression = Regex::new(&out)
        .map_err(|e| GantryError::config(format!("Joined pattern failed to compile: {}", e)))?;
    Ok(Mapping {
        expression,
        group_offsets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::testutil::get;
    use crate::route::testutil::Loc;

    async fn route_path(router: &PathRouter, path: &str) -> Option<String> {
        let req = get(&format!("http://proxy{}", path), "1.2.3.4:1000").await;
        router
            .route(&req)
            .unwrap()
            .map(|loc| loc.id().to_string())
    }

    #[tokio::test]
    async fn test_empty_router_matches_nothing() {
        let router = PathRouter::new();
        assert_eq!(route_path(&router, "/anything").await, None);
    }

    #[tokio::test]
    async fn test_single_pattern() {
        let router = PathRouter::new();
        router.add_location("/api", Loc::new("api")).unwrap();
        assert_eq!(route_path(&router, "/api").await, Some("api".into()));
        assert_eq!(route_path(&router, "/api/").await, Some("api".into()));
        assert_eq!(route_path(&router, "/other").await, None);
    }

    #[tokio::test]
    async fn test_longest_pattern_wins() {
        let router = PathRouter::new();
        router.add_location("/api/.*", Loc::new("l1")).unwrap();
        router.add_location("/api/v2/.*", Loc::new("l2")).unwrap();

        assert_eq!(route_path(&router, "/api/v2/x").await, Some("l2".into()));
        assert_eq!(route_path(&router, "/api/x").await, Some("l1".into()));
    }

    #[tokio::test]
    async fn test_insertion_order_is_irrelevant() {
        let router = PathRouter::new();
        // Register the longer pattern first this time
        router.add_location("/api/v2/.*", Loc::new("l2")).unwrap();
        router.add_location("/api/.*", Loc::new("l1")).unwrap();

        assert_eq!(route_path(&router, "/api/v2/x").await, Some("l2".into()));
        assert_eq!(route_path(&router, "/api/x").await, Some("l1".into()));
    }

    #[tokio::test]
    async fn test_patterns_with_inner_groups() {
        let router = PathRouter::new();
        router
            .add_location("/users/(\\d+)/posts", Loc::new("posts"))
            .unwrap();
        router.add_location("/users", Loc::new("users")).unwrap();

        assert_eq!(
            route_path(&router, "/users/42/posts").await,
            Some("posts".into())
        );
        assert_eq!(route_path(&router, "/users").await, Some("users".into()));
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_patterns() {
        let router = PathRouter::new();
        router.add_location("/api", Loc::new("api")).unwrap();
        assert!(router.add_location("/api", Loc::new("api2")).is_err());
        assert!(router.add_location("/bad[", Loc::new("bad")).is_err());
    }

    #[tokio::test]
    async fn test_remove_location() {
        let router = PathRouter::new();
        router.add_location("/api", Loc::new("api")).unwrap();
        router.add_location("/web", Loc::new("web")).unwrap();

        router.remove_location("/api").unwrap();
        assert_eq!(route_path(&router, "/api").await, None);
        assert_eq!(route_path(&router, "/web").await, Some("web".into()));

        router.remove_location("/web").unwrap();
        assert_eq!(route_path(&router, "/web").await, None);
    }
}
