pub mod models;
pub mod rules;
pub mod profile;
pub mod filter;
pub mod transform;
pub mod verdict;
pub mod engine;
pub mod state;
pub mod log;
pub mod orchestrator;
pub mod config;
pub mod persistence;
pub mod capture;
pub mod reporting;
pub mod error;
pub mod logging;

// Re-export commonly used items
pub use models::*;
pub use rules::*;
pub use profile::*;
pub use verdict::*;
pub use engine::*;
pub use state::*;
pub use log::*;
pub use orchestrator::*;
pub use error::{Error, Result};
pub use filter::eligible;
pub use transform::{strip_identity, transform};
pub use config::ConfigDocument;
pub use persistence::SettingsStore;
pub use capture::{load_path, CaptureParser};
pub use reporting::ReportFilter;
pub use logging::{init_logging, LoggingConfig};
