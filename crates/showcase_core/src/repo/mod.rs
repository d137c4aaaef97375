//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts for the catalog.
//! - Isolate SQLite query details from orchestration logic.
//!
//! # Invariants
//! - Every multi-statement write runs inside exactly one transaction.
//! - Repository APIs return semantic errors (`NotFound`, `StaleVersion`) in
//!   addition to DB transport errors.

pub mod project_repo;
