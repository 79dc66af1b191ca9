pub mod acquire;
pub mod channel;
pub mod config;
pub mod convert;
pub mod error;
pub mod failure;
pub mod finalize;
pub mod job;
pub mod library;
pub mod paths;
pub mod registry;
pub mod routes;
pub mod tools;
pub mod ws;
