//! Cluster console service library crate.
//!
//! # Purpose
//! A document-store consistency layer with a replication change log, a watcher
//! that tails it across cursor deaths, a coordinator that bridges writes to an
//! external orchestration API with local observation, and notification fan-out.
//! The binary and integration tests build on these modules.
pub mod actions;
pub mod api;
pub mod app;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod fanout;
pub mod mirror;
pub mod model;
pub mod observability;
pub mod orchestration;
pub mod store;
pub mod watch;
