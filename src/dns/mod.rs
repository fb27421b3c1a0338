//! DNS resolution for routing
//!
//! Destinations arrive as host names more often than not; resolving them
//! lets IP rules match and lets failover learn IP rules.

mod resolver;

pub use resolver::Resolver;
