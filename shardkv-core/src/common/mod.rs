//! Common utilities shared by the controller and the storage groups

pub mod codec;
pub mod error_context;

pub use error_context::SerializationContext;
