//! Content collectors feeding probe archives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ExamResult;

/// Adds named entries to an archive under construction.
pub trait ContentCollector: Send + Sync {
    fn collect(&self, entries: &mut BTreeMap<String, Vec<u8>>) -> ExamResult<()>;
}

/// Collects every file below each package directory of a base folder.
///
/// Package `acme.store` maps to `<base>/acme/store`; entry names are the
/// `/`-separated paths relative to `base`.
#[derive(Debug, Clone)]
pub struct CollectFromBase {
    base: PathBuf,
    packages: Vec<String>,
}

impl CollectFromBase {
    pub fn new(base: impl Into<PathBuf>, packages: Vec<String>) -> Self {
        Self {
            base: base.into(),
            packages,
        }
    }
}

impl ContentCollector for CollectFromBase {
    fn collect(&self, entries: &mut BTreeMap<String, Vec<u8>>) -> ExamResult<()> {
        for package in &self.packages {
            let dir = package
                .split('.')
                .filter(|s| !s.is_empty())
                .fold(self.base.clone(), |dir, segment| dir.join(segment));
            collect_files_recursive(&self.base, &dir, entries)?;
        }
        Ok(())
    }
}

fn collect_files_recursive(
    base: &Path,
    dir: &Path,
    entries: &mut BTreeMap<String, Vec<u8>>,
) -> ExamResult<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut children: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.path());

    for child in children {
        let path = child.path();
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if path.is_file() {
            let relative = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            debug!(entry = %relative, "collected probe resource");
            entries.insert(relative, std::fs::read(&path)?);
        } else if path.is_dir() {
            collect_files_recursive(base, &path, entries)?;
        }
    }

    Ok(())
}

/// Explicitly supplied entries.
#[derive(Debug, Clone, Default)]
pub struct CollectFromItems {
    items: Vec<(String, Vec<u8>)>,
}

impl CollectFromItems {
    pub fn new(items: Vec<(String, Vec<u8>)>) -> Self {
        Self { items }
    }
}

impl ContentCollector for CollectFromItems {
    fn collect(&self, entries: &mut BTreeMap<String, Vec<u8>>) -> ExamResult<()> {
        for (name, data) in &self.items {
            entries.insert(name.clone(), data.clone());
        }
        Ok(())
    }
}

/// Runs its parts in order; later parts overwrite earlier entries.
#[derive(Default)]
pub struct CompositeCollector {
    parts: Vec<Box<dyn ContentCollector>>,
}

impl CompositeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, part: impl ContentCollector + 'static) -> Self {
        self.parts.push(Box::new(part));
        self
    }
}

impl ContentCollector for CompositeCollector {
    fn collect(&self, entries: &mut BTreeMap<String, Vec<u8>>) -> ExamResult<()> {
        for part in &self.parts {
            part.collect(entries)?;
        }
        Ok(())
    }
}
