//! CRM backend: data model, startup schema reconciliation and the HTTP
//! surface that serves once the database matches the canonical model.

pub mod api;
pub mod config;
pub mod entity;
pub mod schema;
