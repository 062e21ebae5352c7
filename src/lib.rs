//! prodflow
//!
//! Production order routing, an inventory ledger and supply orders for manufacturing ERPs.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod app;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod notifications;
pub mod services;

pub use app::App;
pub use errors::ServiceError;
pub use services::factory::{ServiceContainer, ServiceFactory};
