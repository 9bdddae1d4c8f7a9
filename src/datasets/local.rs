//! Local CSV prompt files.
//!
//! Any `.csv` file in the configured directory that carries a `prompt`
//! column contributes its rows as one dataset named after the file stem.
//! Files without the column are skipped with a warning.

use std::path::Path;

use crate::httpspec::Modality;

use super::{DatasetSource, PromptDataset};

pub fn load_dir(dir: &Path) -> Vec<PromptDataset> {
    let mut entries = match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .map(|e| e.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>(),
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "dataset directory unreadable");
            return Vec::new();
        }
    };
    // Directory order is platform-dependent; sort for a stable module order.
    entries.sort();

    let mut out = Vec::new();
    for path in entries {
        match load_file(&path) {
            Ok(Some(ds)) => out.push(ds),
            Ok(None) => {
                tracing::warn!(file = %path.display(), "no 'prompt' column, skipping");
            }
            Err(err) => {
                tracing::warn!(file = %path.display(), error = %err, "unreadable CSV, skipping");
            }
        }
    }
    out
}

fn load_file(path: &Path) -> anyhow::Result<Option<PromptDataset>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?;
    let prompt_col = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case("prompt"));
    let Some(col) = prompt_col else {
        return Ok(None);
    };

    let mut prompts = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(value) = record.get(col) {
            let value = value.trim();
            if !value.is_empty() {
                prompts.push(value.to_string());
            }
        }
    }

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("local")
        .to_string();
    Ok(Some(PromptDataset::new(
        name,
        prompts,
        Modality::Text,
        DatasetSource::Local,
        true,
    )))
}
