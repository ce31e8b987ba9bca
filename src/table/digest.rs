//! Digestion: row log -> column blocks
//!
//! Under the `digest` lock, live segments are moved into a private
//! stomache directory, decoded, chunked, and written out as blocks; the
//! table info is then rewritten under the `info` lock and the stomached
//! segments are deleted. A failure at any point moves the segments back
//! into the live log.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{block, Table};
use crate::data::SavedRecord;
use crate::storage::lock::STOMACHE_DIR;
use crate::storage::rowlog;
use crate::{CaskError, Result};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DigestStats {
    pub segments: usize,
    pub records: usize,
    pub blocks_written: usize,
    /// Records returned to the live log (under-full final chunk).
    pub leftover: usize,
}

impl Table {
    /// Append one segment to the ingestion log, digesting when the
    /// segment count passes the configured threshold.
    pub fn ingest(&mut self, records: &[SavedRecord]) -> Result<PathBuf> {
        self.make_dir()?;
        let path = rowlog::append_segment(&self.dir(), records, &self.settings)?;

        if rowlog::segment_count(&self.dir()) > self.settings.auto_digest_segments {
            match self.digest_records() {
                Ok(stats) => log::debug!(
                    "auto-digest wrote {} blocks from {} records",
                    stats.blocks_written,
                    stats.records
                ),
                // Another writer holding the digest lock is fine.
                Err(CaskError::LockContended(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(path)
    }

    /// Compact the ingestion log into column blocks.
    pub fn digest_records(&mut self) -> Result<DigestStats> {
        if !self.grab_digest_lock() {
            return Err(CaskError::LockContended("digest".to_string()));
        }
        let result = self.digest_under_lock();
        self.release_digest_lock()?;
        result
    }

    fn digest_under_lock(&mut self) -> Result<DigestStats> {
        // Resync with on-disk state so the info rewrite below keeps
        // blocks written by other processes.
        self.load_info()?;

        let ingest_dir = rowlog::ingest_dir(&self.dir());
        let segments = rowlog::segment_paths(&ingest_dir)?;
        if segments.is_empty() {
            return Ok(DigestStats::default());
        }

        let stomache = self
            .dir()
            .join(STOMACHE_DIR)
            .join(Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&stomache)?;

        let mut moved = Vec::with_capacity(segments.len());
        for segment in &segments {
            let dest = stomache.join(segment.file_name().unwrap_or_default());
            fs::rename(segment, &dest)?;
            moved.push(dest);
        }

        match self.digest_stomache(&stomache, moved.len()) {
            Ok(stats) => {
                fs::remove_dir_all(&stomache)?;
                Ok(stats)
            }
            Err(e) => {
                restore_segments(&stomache, &ingest_dir);
                Err(e)
            }
        }
    }

    /// Digest the stomached segments. On failure every block and
    /// segment this attempt wrote is undone, so restoring the stomache
    /// cannot duplicate records.
    fn digest_stomache(&mut self, stomache: &Path, segments: usize) -> Result<DigestStats> {
        let mut written: Vec<String> = Vec::new();
        let mut leftover_path: Option<PathBuf> = None;

        let result = self.digest_chunks(stomache, segments, &mut written, &mut leftover_path);
        if result.is_err() {
            for name in &written {
                let _ = fs::remove_dir_all(self.dir().join(name));
            }
            self.blocks.retain(|b| !written.contains(&b.name));
            if let Some(path) = &leftover_path {
                let _ = fs::remove_file(path);
            }
        }
        result
    }

    fn digest_chunks(
        &mut self,
        stomache: &Path,
        segments: usize,
        written: &mut Vec<String>,
        leftover_path: &mut Option<PathBuf>,
    ) -> Result<DigestStats> {
        let records = rowlog::load_all(stomache);
        let chunk_size = self.settings.chunk_size;
        let mut stats = DigestStats {
            segments,
            records: records.len(),
            ..Default::default()
        };

        let mut full_end = (records.len() / chunk_size) * chunk_size;
        if self.settings.keep_last_chunk {
            full_end = records.len();
        }

        for chunk in records[..full_end].chunks(chunk_size) {
            let name = format!("block_{}", Uuid::new_v4().simple());
            let summary = block::write_block(self, &name, chunk)?;
            written.push(summary.name.clone());
            self.blocks.push(summary);
            stats.blocks_written += 1;
        }

        // Under-full remainder goes back to the live log as a fresh
        // segment; records are never dropped.
        let leftover = &records[full_end..];
        if !leftover.is_empty() {
            *leftover_path = Some(rowlog::append_segment(&self.dir(), leftover, &self.settings)?);
            stats.leftover = leftover.len();
        }

        self.save_info()?;
        Ok(stats)
    }

    /// Put stomached segments back into the live log and clear a stale
    /// digest lock. Used when a digesting process crashed.
    pub fn recover_digest(&self) -> Result<()> {
        let stomache_root = self.dir().join(STOMACHE_DIR);
        let ingest_dir = rowlog::ingest_dir(&self.dir());
        if let Ok(entries) = fs::read_dir(&stomache_root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    restore_segments(&path, &ingest_dir);
                }
            }
        }
        self.lock("digest").recover()
    }
}

fn restore_segments(stomache: &Path, ingest_dir: &Path) {
    let paths = match rowlog::segment_paths(stomache) {
        Ok(paths) => paths,
        Err(e) => {
            log::error!("can't enumerate stomache {:?}: {}", stomache, e);
            return;
        }
    };
    for path in paths {
        let dest = ingest_dir.join(path.file_name().unwrap_or_default());
        if let Err(e) = fs::rename(&path, &dest) {
            log::error!("can't restore segment {:?}: {}", path, e);
        }
    }
    let _ = fs::remove_dir_all(stomache);
}
