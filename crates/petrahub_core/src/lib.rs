pub mod backend;
pub mod catalog;
pub mod config;
pub mod memory;
pub mod migrate;
pub mod model;
pub mod options;
pub mod postgrest;
pub mod runtime;
pub mod schema;
pub mod seed;
