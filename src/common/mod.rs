//! Common utilities and types

pub mod error;
pub mod metadata;
pub mod net;

pub use error::{Error, Result};
pub use metadata::{ConnType, Metadata, Network};
