//! Larder DB - SQLite repository layer
//!
//! This crate provides the repository pattern for the two local stores the
//! pipeline writes to.
//!
//! # Overview
//!
//! The main components are:
//! - [`connect`] - Opens (and migrates) the SQLite database file
//! - [`RecordRepository`] - The keyed intake record set ([`larder_core::RecordStore`])
//! - [`MealRepository`] - Users and persisted meals ([`larder_core::MealStore`])

mod meal_repository;
mod pool;
mod repository;

pub use meal_repository::MealRepository;
pub use pool::{connect, run_migrations};
pub use repository::RecordRepository;
