//! Queue presets loaded from a TOML file at startup.
//!
//! ```toml
//! [[queue]]
//! name = "orders"
//! capacity = 1
//! dedup_key_fields = ["orderId"]
//!
//! [[queue]]
//! name = "prices"
//! fanout = true
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::QueueOptions;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PresetFile {
    #[serde(default)]
    queue: Vec<QueuePreset>,
}

/// One queue declared ahead of time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueuePreset {
    pub name: String,
    #[serde(default)]
    pub fanout: bool,
    pub capacity: Option<u32>,
    pub dedup_key_fields: Option<Vec<String>>,
}

impl QueuePreset {
    pub fn options(&self) -> QueueOptions {
        QueueOptions {
            capacity: self.capacity.map(|c| c.max(1)),
            dedup_key_fields: self.dedup_key_fields.clone(),
            fanout: Some(self.fanout),
        }
    }
}

/// Parse presets from TOML text.
pub fn parse(content: &str) -> Result<Vec<QueuePreset>> {
    let file: PresetFile =
        toml::from_str(content).map_err(|e| Error::Config(format!("bad queue presets: {e}")))?;
    Ok(file.queue)
}

/// Load presets from a file.
pub fn load_from_file(path: &Path) -> Result<Vec<QueuePreset>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read queue presets {}: {e}", path.display()))
    })?;
    parse(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}
