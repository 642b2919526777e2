//! On-disk layout, settings and persisted records

pub mod layout;
pub mod settings;
pub mod store;
