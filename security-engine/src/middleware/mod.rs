pub mod security;

pub use security::{
    forward_auth_middleware, security_middleware, security_request, Authenticated, RequestSource,
};
