//! Series Store - append-only per-agent time series.
//!
//! Every agent of the active scenario owns two series:
//!
//! | Series id      | Channel  | y-value                |
//! |----------------|----------|------------------------|
//! | `<agent>`      | Actuator | `actuators_issued`     |
//! | `<agent>_s`    | Sensor   | `sensor_data_received` |
//!
//! Both share the batch's `elapsed_time` as x. The store's `version` is bumped
//! once per applied batch (or sample pass) so renderers can poll a single
//! integer instead of diffing series contents.

use crate::error::SyncError;
use crate::telemetry::BatchEvent;
use rand::Rng;
use serde::Serialize;
use simwatch_env::{AgentId, ScenarioDescriptor};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Suffix distinguishing an agent's sensor series from its actuator series.
pub const SENSOR_SUFFIX: &str = "_s";

/// Default number of points per series for [`SeriesStore::add_sample_agent_data`].
pub const DEFAULT_SAMPLE_POINTS: usize = 10;

/// Upper bound of a sample x increment.
const SAMPLE_MAX_STEP: f64 = 1.0;

/// Sample y-values are drawn from `[0, SAMPLE_Y_MAX)`.
const SAMPLE_Y_MAX: f64 = 10.0;

/// Which measurement a series carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Actuator,
    Sensor,
}

impl ChannelKind {
    /// Series id for `agent` on this channel.
    pub fn series_id(self, agent: &AgentId) -> String {
        match self {
            ChannelKind::Actuator => agent.as_str().to_string(),
            ChannelKind::Sensor => format!("{}{}", agent, SENSOR_SUFFIX),
        }
    }
}

/// One agent's (x, y) series on one channel.
///
/// `x` and `y` are private so they can only grow together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    id: String,
    agent: AgentId,
    kind: ChannelKind,
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Series {
    /// Creates a series holding only the seed point (0, 0).
    fn seeded(agent: &AgentId, kind: ChannelKind) -> Self {
        Self {
            id: kind.series_id(agent),
            agent: agent.clone(),
            kind,
            x: vec![0.0],
            y: vec![0.0],
        }
    }

    fn push(&mut self, x: f64, y: f64) {
        self.x.push(x);
        self.y.push(y);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    /// Number of points (including the seed point).
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Most recent point.
    pub fn last(&self) -> Option<(f64, f64)> {
        Some((*self.x.last()?, *self.y.last()?))
    }
}

/// Ordered collection of series plus the change counter.
#[derive(Debug, Default)]
pub struct SeriesStore {
    version: u64,
    series: Vec<Series>,
    index: HashMap<String, usize>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the store for a freshly started scenario.
    ///
    /// Two seeded series per agent, in descriptor order; version back to 0.
    /// A repeated agent id keeps its first pair of series.
    pub fn initialize(&mut self, descriptor: &ScenarioDescriptor) {
        self.series.clear();
        self.index.clear();
        self.version = 0;

        for agent in &descriptor.agents {
            if self.index.contains_key(&ChannelKind::Actuator.series_id(&agent.id)) {
                warn!("duplicate agent {} in scenario {}", agent.id, descriptor.id);
                continue;
            }
            for kind in [ChannelKind::Actuator, ChannelKind::Sensor] {
                let series = Series::seeded(&agent.id, kind);
                self.index.insert(series.id.clone(), self.series.len());
                self.series.push(series);
            }
        }

        debug!("series store initialized with {} series", self.series.len());
    }

    /// Appends one batch to its agent's actuator and sensor series.
    ///
    /// Both lookups happen before any append, so an unknown agent leaves the
    /// store untouched.
    ///
    /// # Returns
    /// The new version.
    pub fn apply_batch(&mut self, event: &BatchEvent) -> Result<u64, SyncError> {
        let actuator = self.lookup(&event.raw_id, ChannelKind::Actuator)?;
        let sensor = self.lookup(&event.raw_id, ChannelKind::Sensor)?;

        self.series[actuator].push(event.elapsed_time, event.actuators_issued);
        self.series[sensor].push(event.elapsed_time, event.sensor_data_received);
        self.version += 1;

        Ok(self.version)
    }

    fn lookup(&self, agent: &AgentId, kind: ChannelKind) -> Result<usize, SyncError> {
        self.index
            .get(&kind.series_id(agent))
            .copied()
            .ok_or_else(|| SyncError::UnknownAgent(agent.clone()))
    }

    /// Drops every series and resets the version. Safe to call repeatedly.
    pub fn clear(&mut self) {
        self.series.clear();
        self.index.clear();
        self.version = 0;
    }

    /// Appends `n` synthetic points to every series, then bumps the version once.
    ///
    /// x keeps growing from each series' last point by steps in `(0, 1]`;
    /// y is uniform in `[0, 10)`.
    pub fn add_sample_agent_data<R: Rng + ?Sized>(&mut self, n: usize, rng: &mut R) {
        for series in &mut self.series {
            let mut x = series.last().map(|(x, _)| x).unwrap_or(0.0);
            for _ in 0..n {
                // gen::<f64>() is [0, 1); flip it to (0, 1]
                x += (1.0 - rng.gen::<f64>()) * SAMPLE_MAX_STEP;
                let y = rng.gen_range(0.0..SAMPLE_Y_MAX);
                series.push(x, y);
            }
        }
        self.version += 1;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Series by id (`<agent>` or `<agent>_s`).
    pub fn get(&self, id: &str) -> Option<&Series> {
        self.index.get(id).map(|&i| &self.series[i])
    }

    pub fn actuator(&self, agent: &AgentId) -> Option<&Series> {
        self.get(&ChannelKind::Actuator.series_id(agent))
    }

    pub fn sensor(&self, agent: &AgentId) -> Option<&Series> {
        self.get(&ChannelKind::Sensor.series_id(agent))
    }

    /// All series in initialization order.
    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
