//! Maps requests to locations.

pub mod hostroute;
pub mod pathroute;

use std::sync::Arc;

use crate::error::GantryResult;
use crate::location::Location;
use crate::request::ProxyRequest;

pub use hostroute::HostRouter;
pub use pathroute::PathRouter;

/// Matches an incoming request to the location that should serve it.
/// Returning `Ok(None)` means nothing matched; the handler replies with a
/// formatted 404.
pub trait Router: Send + Sync {
    fn route(&self, req: &ProxyRequest) -> GantryResult<Option<Arc<dyn Location>>>;
}

/// Routes all requests to the single configured location.
pub struct ConstRouter {
    location: Arc<dyn Location>,
}

impl ConstRouter {
    pub fn new(location: Arc<dyn Location>) -> Self {
        Self { location }
    }
}

impl Router for ConstRouter {
    fn route(&self, _req: &ProxyRequest) -> GantryResult<Option<Arc<dyn Location>>> {
        Ok(Some(Arc::clone(&self.location)))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use async_trait::async_trait;
    use hyper::{Body, Response};

    /// Location used in tests; replies with its name.
    pub struct Loc {
        pub id: String,
    }

    impl Loc {
        pub fn new(id: &str) -> Arc<dyn Location> {
            Arc::new(Self { id: id.to_string() })
        }
    }

    #[async_trait]
    impl Location for Loc {
        fn id(&self) -> &str {
            &self.id
        }

        async fn round_trip(
            &self,
            _req: &mut crate::request::ProxyRequest,
        ) -> GantryResult<Response<Body>> {
            Ok(Response::new(Body::from(self.id.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::testutil::get;

    #[tokio::test]
    async fn test_const_router_matches_everything() {
        let router = ConstRouter::new(testutil::Loc::new("only"));
        for uri in ["http://proxy/", "http://proxy/a/b/c?x=1"] {
            let req = get(uri, "1.2.3.4:1000").await;
            let loc = router.route(&req).unwrap().unwrap();
            assert_eq!(loc.id(), "only");
        }
    }
}
