//! Shared fixtures for runner integration tests

pub mod utils;
