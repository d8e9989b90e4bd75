//! Filesystem corpus loader.
//!
//! Walks `[corpus].root` and turns every file matching the include globs
//! (and none of the exclude globs) into one [`Document`]. The document id is
//! the path relative to the root, with `/` separators, so ids stay stable
//! across machines. Output is sorted by id.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::models::Document;

pub fn load_documents(config: &CorpusConfig) -> Result<Vec<Document>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Corpus root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut documents = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match file_to_document(path, &rel_str) {
            Ok(document) => documents.push(document),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable review"),
        }
    }

    documents.sort_by(|a, b| a.id.cmp(&b.id));
    tracing::debug!(root = %root.display(), documents = documents.len(), "corpus loaded");
    Ok(documents)
}

fn file_to_document(path: &Path, relative_path: &str) -> Result<Document> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut document = Document::new(relative_path, text);
    if let Some(name) = path.file_name() {
        document = document.with_metadata("file_name", name.to_string_lossy());
    }
    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
        let modified: DateTime<Utc> = modified.into();
        document = document.with_metadata("modified_at", modified.to_rfc3339());
    }
    Ok(document)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
