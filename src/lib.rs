#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod chunk_buffer;
pub mod constants;
pub mod db;
pub mod frames;
pub mod generate;
pub mod hardening;
pub mod health;
pub mod intent;
pub mod json_repair;
pub mod logging;
pub mod main_helper;
pub mod model;
pub mod ndjson;
pub mod prompt;
pub mod reconcile;
pub mod routes;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
