//! stackd library
//!
//! Core modules of the home-server application lifecycle daemon.

pub mod app;
pub mod cache;
pub mod catalog;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod ops;
pub mod server;
pub mod storage;
pub mod utils;
