//! Service Module
//!
//! Business logic layer. Services sit on top of the store traits and hold the
//! lifecycle rules.

pub mod lifecycle;

pub use lifecycle::{LatestStep, LifecycleCoordinator};
