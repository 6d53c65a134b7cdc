use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use transitx_core::{
    CancelToken, CongestionSample, EngineConfig, Error, Forecast, GraphFilter, Result, TransitEngine, YearSnapshot,
};
use crate::export::{heat_index, ArtifactDescription, ArtifactManager, HeatIndex};
use crate::loader::{self, SnapshotFormat, SnapshotRecord};
use crate::wal::CongestionLog;

/// Storage plumbing errors surface as `Io`; core errors pass through.
fn into_core(e: anyhow::Error) -> Error {
    match e.downcast::<Error>() {
        Ok(core) => core,
        Err(other) => Error::Io(std::io::Error::other(format!("{:#}", other))),
    }
}

/// Owns a dataset directory and the engine loaded from it.
///
/// Layout:
/// - `snapshots/<year>.json` and `snapshots/data_<year>.geojson`
/// - `congestion.log`
/// - `artifacts/`
pub struct DatasetManager {
    engine: Arc<TransitEngine>,
    data_dir: PathBuf,
    log: Arc<CongestionLog>,
    artifacts: Arc<ArtifactManager>,
}

impl DatasetManager {
    pub fn open<P: AsRef<Path>>(data_dir: P, config: EngineConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let snapshot_dir = data_dir.join("snapshots");
        std::fs::create_dir_all(&snapshot_dir)?;

        let engine = Arc::new(TransitEngine::new(config)?);

        for (year, format, path) in loader::discover(&snapshot_dir).map_err(into_core)? {
            if engine.store().exact(year).is_some() {
                warn!("Ignoring {}: {} is already loaded", path.display(), year);
                continue;
            }
            let snapshot = match format {
                SnapshotFormat::Record => loader::load_record(&path),
                SnapshotFormat::GeoJson => loader::load_geojson(&path, year),
            }
            .map_err(into_core)?;
            engine.insert_snapshot(snapshot)?;
        }
        info!("Loaded snapshots {:?}", engine.store().years());

        let log_path = data_dir.join("congestion.log");
        let replayed = CongestionLog::replay(&log_path).map_err(into_core)?;
        if !replayed.is_empty() {
            engine.ingest_batch(replayed);
        }
        let log = Arc::new(CongestionLog::new(&log_path).map_err(into_core)?);

        let artifacts = Arc::new(ArtifactManager::new(data_dir.join("artifacts")).map_err(into_core)?);
        info!(
            "Congestion log at {}, artifacts in {}",
            log.path().display(),
            artifacts.dir().display()
        );

        Ok(Self {
            engine,
            data_dir,
            log,
            artifacts,
        })
    }

    #[inline]
    pub fn engine(&self) -> &Arc<TransitEngine> {
        &self.engine
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    /// Validates and stores a new year, then persists it as a record.
    pub fn add_snapshot(&self, record: SnapshotRecord) -> Result<Arc<YearSnapshot>> {
        let snapshot = self.engine.insert_snapshot(record.into_snapshot()?)?;
        let body = serde_json::to_vec_pretty(&SnapshotRecord::from_snapshot(&snapshot))?;
        let path = self.data_dir.join("snapshots").join(format!("{}.json", snapshot.year()));
        atomicwrites::AtomicFile::new(&path, atomicwrites::AllowOverwrite)
            .write(|f| std::io::Write::write_all(f, &body))
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        Ok(snapshot)
    }

    /// Logs the samples before they become visible to queries.
    pub fn ingest(&self, samples: Vec<CongestionSample>) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        self.log.append_batch(&samples).map_err(into_core)?;
        Ok(self.engine.ingest_batch(samples))
    }

    pub fn export_snapshot(&self, year: i32) -> Result<ArtifactDescription> {
        let snapshot = self.engine.store().snapshot_for(year)?;
        self.artifacts.write_snapshot(&snapshot).map_err(into_core)
    }

    pub fn compute_heat_index(&self, year: i32, top_k: usize, cancel: &CancelToken) -> Result<HeatIndex> {
        let graph = self.engine.build_graph_with_cancel(year, GraphFilter::ALL, cancel)?;
        let scores = self.engine.rank_criticality(year, GraphFilter::ALL, top_k, cancel)?;
        Ok(heat_index(year, &graph, &scores))
    }

    pub fn export_heat_index(&self, year: i32, top_k: usize, cancel: &CancelToken) -> Result<ArtifactDescription> {
        let index = self.compute_heat_index(year, top_k, cancel)?;
        self.artifacts.write_heat_index(&index).map_err(into_core)
    }

    pub fn export_forecast(&self, target_year: i32, cancel: &CancelToken) -> Result<(Forecast, ArtifactDescription)> {
        let forecast = self.engine.project_future(target_year, cancel)?;
        let base = self.engine.store().snapshot_for(forecast.base_year)?;
        let description = self.artifacts.write_forecast(&forecast, &base).map_err(into_core)?;
        Ok((forecast, description))
    }

    pub fn list_artifacts(&self) -> Result<Vec<ArtifactDescription>> {
        self.artifacts.list().map_err(into_core)
    }
}
