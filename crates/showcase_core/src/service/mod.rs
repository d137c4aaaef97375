//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository and attachment calls into use-case level APIs.
//! - Keep transport layers decoupled from storage details.

pub mod form;
pub mod participation;
pub mod project_service;
