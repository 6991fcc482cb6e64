use crate::http::{make_boxed_error_response, make_boxed_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Result of a health check, rendered as the `/health` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    pub healthy: bool,
    /// JSON document describing the health of each component.
    pub body: String,
}

/// Serves `/health` and `/ready`. Both callbacks run on every request.
pub struct AdminService<R, H, E> {
    is_ready: R,
    health: H,
    _error: PhantomData<fn() -> E>,
}

impl<R, H, E> AdminService<R, H, E>
where
    R: Fn() -> bool,
    H: Fn() -> HealthCheck,
    E: 'static,
{
    pub fn new(is_ready: R, health: H) -> Self {
        Self {
            is_ready,
            health,
            _error: PhantomData,
        }
    }

    fn respond(&self, path: &str) -> Response<BoxBody<Bytes, E>> {
        match path {
            "/health" => {
                let check = (self.health)();
                let status = match check.healthy {
                    true => StatusCode::OK,
                    false => StatusCode::SERVICE_UNAVAILABLE,
                };
                make_boxed_response(status, "application/json", check.body)
            }
            "/ready" => match (self.is_ready)() {
                true => make_boxed_response(StatusCode::OK, "text/plain", "ok\n"),
                false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl<R, H, E> Service<Request<Incoming>> for AdminService<R, H, E>
where
    R: Fn() -> bool + Send + Sync + 'static,
    H: Fn() -> HealthCheck + Send + Sync + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}
