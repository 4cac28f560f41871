//! HTTP request handlers.
//!
//! This module contains all HTTP handlers organized by domain.

pub mod health;
pub mod metrics;
pub mod orders;

pub use health::{health_check, readiness};
pub use orders::{generate_test_orders, get_order, list_orders, submit_order};
