//! Persistent browser profiles ("contexts") stored as tar.gz archives.
//!
//! Each context owns at most one archive at `<store_path>/<id>.tar.gz`.
//! Saves write to a `.tmp` sibling first and rename into place so a crash
//! mid-save never leaves a truncated archive behind.

use crate::error::{Error, Result};
use crate::models::Context;
use chrono::Utc;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;
use uuid::Uuid;

pub struct ContextStore {
    contexts: RwLock<HashMap<String, Context>>,
    store_path: PathBuf,
}

impl ContextStore {
    /// Open (and create, if needed) the archive directory.
    pub fn new(store_path: impl Into<PathBuf>) -> Result<Self> {
        let store_path = store_path.into();
        fs::create_dir_all(&store_path)?;
        Ok(Self {
            contexts: RwLock::new(HashMap::new()),
            store_path,
        })
    }

    pub fn create_context(&self, project_id: &str) -> Result<Context> {
        if project_id.is_empty() {
            return Err(Error::Validation("projectId is required".into()));
        }

        let now = Utc::now();
        let ctx = Context {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            created_at: now,
            updated_at: now,
            data_path: String::new(),
        };

        self.contexts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ctx.id.clone(), ctx.clone());
        Ok(ctx)
    }

    pub fn get_context(&self, id: &str) -> Result<Context> {
        self.contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or(Error::NotFound("context"))
    }

    /// Remove the on-disk archive (if any) and then the record.
    pub fn delete_context(&self, id: &str) -> Result<()> {
        let ctx = self.get_context(id)?;

        if !ctx.data_path.is_empty() {
            match fs::remove_file(&ctx.data_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.contexts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    /// Archive `source_dir` as the context's profile data, entries stored
    /// relative to `source_dir`.
    pub fn save_context_data(&self, context_id: &str, source_dir: &Path) -> Result<()> {
        self.get_context(context_id)?;

        let archive_path = self.archive_path(context_id);
        let tmp_path = archive_path.with_extension("gz.tmp");

        compress_directory(source_dir, &tmp_path)?;
        fs::rename(&tmp_path, &archive_path)?;

        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ctx) = contexts.get_mut(context_id) {
            ctx.data_path = archive_path.display().to_string();
            ctx.updated_at = Utc::now();
        }

        info!(context = %context_id, archive = %archive_path.display(), "Saved context data");
        Ok(())
    }

    /// Extract the context's archive into a per-context scratch directory
    /// and return its path.
    pub fn load_context_data(&self, context_id: &str) -> Result<PathBuf> {
        let ctx = self.get_context(context_id)?;
        if ctx.data_path.is_empty() {
            return Err(Error::EmptyContext);
        }

        let extract_path = extraction_dir(context_id);
        fs::create_dir_all(&extract_path)?;
        extract_directory(Path::new(&ctx.data_path), &extract_path)?;

        Ok(extract_path)
    }

    fn archive_path(&self, context_id: &str) -> PathBuf {
        self.store_path.join(format!("{}.tar.gz", context_id))
    }
}

/// Scratch directory a context is extracted into (also used as the fresh
/// profile directory when a context has no saved data yet).
pub fn extraction_dir(context_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("browser-context-{}", context_id))
}

fn compress_directory(source: &Path, target: &Path) -> Result<()> {
    let file = File::create(target)?;
    let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut tar = tar::Builder::new(enc);
    tar.append_dir_all(".", source)?;
    let enc = tar.into_inner()?;
    enc.finish()?;
    Ok(())
}

/// Recreate directory entries and regular files from the archive. Links,
/// devices and other entry types are skipped.
fn extract_directory(source: &Path, target: &Path) -> Result<()> {
    let file = File::open(source)?;
    let dec = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(dec);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let out_path = target.join(&rel);

        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&out_path)?;
        } else if entry.header().entry_type().is_file() {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
        }
    }

    Ok(())
}
