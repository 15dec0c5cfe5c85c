//! Larder Client - HTTP clients for external APIs
//!
//! This crate provides:
//!
//! - [`myfoodrepo`] - the MyFoodRepo collaborator API (cohorts, participations,
//!   annotations, nutrients)
//!
//! The client handles authentication headers, request building, response
//! parsing and error classification. Retrying is left to the harvester.

pub mod myfoodrepo;

pub use myfoodrepo::MyFoodRepoClient;
