pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod optimistic;
pub mod retry;
pub mod routes;
pub mod state;
pub mod sync;
pub mod transitions;
