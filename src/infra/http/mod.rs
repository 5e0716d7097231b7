//! HTTP listeners: the proxy surface and the administrative surface.

mod admin;
mod middleware;
mod public;

pub use admin::build_admin_router;
pub use middleware::RequestContext;
pub use public::build_proxy_router;
