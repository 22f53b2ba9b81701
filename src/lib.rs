// Perp-futures trigger/breakout engine library

pub mod api;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod feed;
pub mod models;
pub mod planner;
pub mod render;
pub mod simulation;
pub mod store;
pub mod strategy;
pub mod trading;
pub mod types;

// Re-export commonly used types
pub use api::{FuturesApi, VenueError};
pub use config::{AppConfig, CliConfig, Mode};
pub use engine::Engine;
pub use simulation::SimState;
pub use store::{StoreLimits, SymbolStore};
pub use trading::LiveTrader;
pub use types::*;

// Global history-file logger (append-only event journal beside stdout)
use std::fs::File;
use std::io::Write;
use std::sync::{Mutex, OnceLock};

static HISTORY_FILE: OnceLock<Mutex<File>> = OnceLock::new();

/// Initialize the global history file writer (called by main.rs)
pub fn init_history_file(file: File) {
    // Ignore error if already initialized; this crate only has one main
    let _ = HISTORY_FILE.set(Mutex::new(file));
}

/// Write a message to the history file (without extra prefixes).
/// Callers can still `println!` separately if they want terminal output.
pub fn log_to_history(message: &str) {
    if let Some(file_mutex) = HISTORY_FILE.get() {
        if let Ok(mut file) = file_mutex.lock() {
            let _ = write!(file, "{}", message);
            let _ = file.flush();
        }
    }
}

/// Log a structured trading event to the history file with a UTC timestamp
pub fn log_trading_event(event: &str) {
    use chrono::Utc;
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    log_to_history(&format!("[{}] {}\n", timestamp, event));
}
