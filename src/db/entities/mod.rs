//! Database entities

pub mod branch;
pub mod repository;
