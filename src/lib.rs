pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod default_model;
pub mod discovery;
pub mod events;
pub mod parser;
pub mod reconcile;
pub mod summary;
pub mod tail;
pub mod util;
pub mod watcher;
pub mod workspace;
