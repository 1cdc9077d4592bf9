use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    download::BulkSource,
    error::{CacheError, Result},
    freshness::FreshnessTracker,
    ingest::ingest_file,
    models::RefreshOutcome,
    store::CatalogWriter,
};

pub struct Refresher<S, W> {
    source: S,
    writer: Arc<W>,
    source_path: PathBuf,
    batch_size: usize,
    max_corruption_retries: u32,
}

impl<S, W> Refresher<S, W>
where
    S: BulkSource,
    W: CatalogWriter,
{
    pub fn new(
        source: S,
        writer: Arc<W>,
        source_path: PathBuf,
        batch_size: usize,
        max_corruption_retries: u32,
    ) -> Self {
        Self {
            source,
            writer,
            source_path,
            batch_size: batch_size.max(1),
            max_corruption_retries,
        }
    }

    /// Freshness is marked as soon as the download lands, before ingestion.
    /// A failed ingest therefore leaves the tracker fresh; recover with a
    /// forced refresh.
    pub async fn ensure_fresh(
        &self,
        tracker: &mut FreshnessTracker,
        force: bool,
    ) -> Result<RefreshOutcome> {
        if !force && !tracker.is_expired(Utc::now()) {
            return Ok(RefreshOutcome::Skipped);
        }

        let mut reset_requested = force;
        let mut resets = 0u32;
        loop {
            let size_bytes = self.source.fetch(&self.source_path).await?;
            tracker.mark_refreshed(Utc::now())?;

            let prepared = if reset_requested {
                resets += 1;
                self.run_blocking(|writer, _, _| writer.reset()).await
            } else {
                Ok(())
            };
            let ingested = match prepared {
                Ok(()) => {
                    self.run_blocking(|writer, path, batch_size| {
                        ingest_file(&path, batch_size, writer)
                    })
                    .await
                }
                Err(err) => Err(err),
            };

            match ingested {
                Ok(rows) => {
                    info!(rows, resets, size_bytes, "Systems cache refreshed");
                    return Ok(RefreshOutcome::Refreshed { rows, resets });
                }
                Err(err) if err.is_structural() => {
                    let retries_used = resets - u32::from(force);
                    if retries_used >= self.max_corruption_retries {
                        return Err(CacheError::refresh_failed(format!(
                            "store still failing after {retries_used} reset retries: {err}"
                        )));
                    }
                    warn!("Structural storage error during refresh, rebuilding store: {err}");
                    reset_requested = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    async fn run_blocking<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&W, PathBuf, usize) -> Result<T> + Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        let path = self.source_path.clone();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || task(writer.as_ref(), path, batch_size))
            .await
            .map_err(|err| CacheError::refresh_failed(format!("refresh task join error: {err}")))?
    }
}
