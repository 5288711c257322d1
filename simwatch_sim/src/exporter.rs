//! JSON exporter for series snapshots.
//!
//! Writes what a dashboard would have plotted: the last point of every series
//! after each round, then the full series at the end of the run.

use serde::Serialize;
use simwatch_core::{Series, SeriesStore, SyncMetrics};
use simwatch_env::RunId;
use std::fs::File;
use std::io::Write;

/// Latest point of one series.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

/// Store snapshot taken at one version.
#[derive(Debug, Clone, Serialize)]
pub struct StoreFrame {
    /// Store version at capture
    pub version: u64,

    /// Last point of each non-empty series
    pub points: Vec<SeriesPoint>,
}

impl StoreFrame {
    /// Captures the latest point of every series.
    pub fn capture(store: &SeriesStore) -> Self {
        let points = store
            .series()
            .iter()
            .filter_map(|s| {
                s.last().map(|(x, y)| SeriesPoint {
                    id: s.id().to_string(),
                    x,
                    y,
                })
            })
            .collect();
        Self {
            version: store.version(),
            points,
        }
    }
}

/// Complete series export for one run.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Run the series belong to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Snapshots in capture order
    pub frames: Vec<StoreFrame>,

    /// Final series contents
    pub series: Vec<Series>,

    /// Final store version
    pub final_version: u64,

    /// Telemetry counters at the end of the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SyncMetrics>,

    /// Final results
    pub passed: bool,
}

impl SeriesExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            run_id: None,
            frames: Vec::new(),
            series: Vec::new(),
            final_version: 0,
            metrics: None,
            passed: false,
        }
    }

    /// Records the run being exported.
    pub fn set_run(&mut self, run: &RunId) {
        self.run_id = Some(run.as_key());
    }

    /// Adds a snapshot of the store.
    pub fn add_frame(&mut self, store: &SeriesStore) {
        self.frames.push(StoreFrame::capture(store));
    }

    /// Finalizes the export with the store's full contents.
    pub fn finalize(&mut self, store: &SeriesStore, metrics: &SyncMetrics, passed: bool) {
        self.series = store.series().to_vec();
        self.final_version = store.version();
        self.metrics = Some(metrics.clone());
        self.passed = passed;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simwatch_core::BatchEvent;
    use simwatch_env::{AgentId, AgentSpec, ScenarioDescriptor};

    fn store_with_one_batch() -> SeriesStore {
        let mut store = SeriesStore::new();
        store.initialize(&ScenarioDescriptor::new(
            "export",
            "7",
            vec![AgentSpec::new("a1")],
        ));
        store
            .apply_batch(&BatchEvent {
                run_id: RunId::from(7u64),
                raw_id: AgentId::new("a1"),
                elapsed_time: 1.5,
                actuators_issued: 3.0,
                sensor_data_received: 4.0,
            })
            .unwrap();
        store
    }

    #[test]
    fn test_frame_captures_last_points() {
        let store = store_with_one_batch();
        let frame = StoreFrame::capture(&store);

        assert_eq!(frame.version, 1);
        assert_eq!(frame.points.len(), 2);
        let sensor = frame.points.iter().find(|p| p.id == "a1_s").unwrap();
        assert_eq!((sensor.x, sensor.y), (1.5, 4.0));
    }

    #[test]
    fn test_export_writes_json() {
        let store = store_with_one_batch();
        let mut export = SeriesExport::new("nominal", 42);
        export.set_run(&RunId::from("7"));
        export.add_frame(&store);
        export.finalize(&store, &SyncMetrics::default(), true);

        let path = std::env::temp_dir().join(format!("simwatch_export_{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();
        export.write_to_file(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(written["scenario"], "nominal");
        assert_eq!(written["run_id"], "7");
        assert_eq!(written["final_version"], 1);
        assert_eq!(written["series"][0]["id"], "a1");
        assert_eq!(written["series"][1]["kind"], "sensor");
        assert_eq!(written["passed"], true);
    }
}
