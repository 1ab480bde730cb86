use super::walker::FileEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Classification of one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Only in the source
    New,
    /// In both, and the comparison predicate reports a change
    Updated,
    /// In both, no change detected
    Unchanged,
    /// Only in the destination
    Extraneous,
}

/// A file entry together with its classification.
///
/// For `extraneous` entries the embedded entry is the destination file;
/// otherwise it is the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedEntry {
    #[serde(flatten)]
    pub entry: FileEntry,
    pub disposition: Disposition,
}

/// How a path present on both sides is judged changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareStrategy {
    /// Changed when the sizes differ. Same-size content edits go unnoticed.
    #[default]
    Size,
    /// Mirror mode: presence on both sides means up to date
    Presence,
}

/// File tree comparator
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    strategy: CompareStrategy,
}

impl DiffEngine {
    pub fn new(strategy: CompareStrategy) -> Self {
        Self { strategy }
    }

    /// Compare two files with the configured predicate
    pub fn is_changed(&self, source: &FileEntry, dest: &FileEntry) -> bool {
        match self.strategy {
            CompareStrategy::Size => source.size_bytes != dest.size_bytes,
            CompareStrategy::Presence => false,
        }
    }

    /// Classify every path of the union of both snapshots exactly once.
    ///
    /// Both snapshots are indexed by relative path and scanned once, so the
    /// cost is linear in the total number of files. Source entries come out
    /// in source order, followed by extraneous entries in destination order.
    pub fn compare(&self, source: &[FileEntry], dest: &[FileEntry]) -> DiffResult {
        let source_index: HashMap<&str, &FileEntry> = source
            .iter()
            .map(|e| (e.relative_path.as_str(), e))
            .collect();
        let mut dest_index: HashMap<&str, &FileEntry> = dest
            .iter()
            .map(|e| (e.relative_path.as_str(), e))
            .collect();

        let mut entries = Vec::with_capacity(source_index.len() + dest_index.len());
        let mut summary = DiffSummary::default();

        for src in source {
            // a duplicate relative path in the input is classified once
            if !std::ptr::eq(source_index[src.relative_path.as_str()], src) {
                continue;
            }

            let disposition = match dest_index.remove(src.relative_path.as_str()) {
                None => Disposition::New,
                Some(dst) if self.is_changed(src, dst) => Disposition::Updated,
                Some(_) => Disposition::Unchanged,
            };
            summary.add(disposition, src.size_bytes);
            entries.push(ClassifiedEntry {
                entry: src.clone(),
                disposition,
            });
        }

        // whatever was not visited from the source side only exists in the destination
        for dst in dest {
            if dest_index.remove(dst.relative_path.as_str()).is_some() {
                summary.add(Disposition::Extraneous, dst.size_bytes);
                entries.push(ClassifiedEntry {
                    entry: dst.clone(),
                    disposition: Disposition::Extraneous,
                });
            }
        }

        DiffResult { entries, summary }
    }
}

/// Output of [`DiffEngine::compare`]
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub entries: Vec<ClassifiedEntry>,
    pub summary: DiffSummary,
}

impl DiffResult {
    pub fn with_disposition(&self, disposition: Disposition) -> impl Iterator<Item = &ClassifiedEntry> {
        self.entries.iter().filter(move |e| e.disposition == disposition)
    }
}

/// Per-disposition counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub new_count: usize,
    pub new_bytes: u64,
    pub updated_count: usize,
    pub updated_bytes: u64,
    pub unchanged_count: usize,
    pub extraneous_count: usize,
}

impl DiffSummary {
    fn add(&mut self, disposition: Disposition, size: u64) {
        match disposition {
            Disposition::New => {
                self.new_count += 1;
                self.new_bytes += size;
            }
            Disposition::Updated => {
                self.updated_count += 1;
                self.updated_bytes += size;
            }
            Disposition::Unchanged => self.unchanged_count += 1,
            Disposition::Extraneous => self.extraneous_count += 1,
        }
    }

    pub fn total_paths(&self) -> usize {
        self.new_count + self.updated_count + self.unchanged_count + self.extraneous_count
    }

    pub fn transfer_count(&self) -> usize {
        self.new_count + self.updated_count
    }

    pub fn transfer_bytes(&self) -> u64 {
        self.new_bytes + self.updated_bytes
    }
}
