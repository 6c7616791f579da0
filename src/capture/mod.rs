// Capture loading
// Reads recorded request/response pairs from disk so they can be fed through
// the live pipeline. `.har` files are HTTP Archives, other `.json` files use
// the native capture format.

pub mod har;
pub mod native;

pub use har::HarParser;
pub use native::NativeParser;

use std::path::Path;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::CapturedExchange;

pub trait CaptureParser {
    /// Parse one capture file into exchanges, in file order.
    fn parse(&self, path: &Path) -> Result<Vec<CapturedExchange>>;
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case(ext))
}

/// Parser for a file, picked by extension.
pub fn parser_for(path: &Path) -> Option<Box<dyn CaptureParser>> {
    if has_extension(path, "har") {
        Some(Box::new(HarParser))
    } else if has_extension(path, "json") {
        Some(Box::new(NativeParser))
    } else {
        None
    }
}

/// Load one capture file, or every `.json` / `.har` file under a directory
/// in path order.
pub fn load_path(path: &Path) -> Result<Vec<CapturedExchange>> {
    if !path.exists() {
        return Err(Error::Capture(format!("{} does not exist", path.display())));
    }

    if path.is_file() {
        let parser = parser_for(path)
            .ok_or_else(|| Error::Capture(format!("{}: expected a .json or .har file", path.display())))?;
        return parser.parse(path);
    }

    let mut files: Vec<_> = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| parser_for(p).is_some())
        .collect();
    files.sort();

    let mut exchanges = Vec::new();
    for file in &files {
        if let Some(parser) = parser_for(file) {
            let parsed = parser.parse(file)?;
            debug!("{}: {} exchanges", file.display(), parsed.len());
            exchanges.extend(parsed);
        }
    }
    info!("Loaded {} exchanges from {} files", exchanges.len(), files.len());
    Ok(exchanges)
}
