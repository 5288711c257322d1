//! Fault scenarios for the sync engine.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SW-001: Clean run, every batch lands
    Nominal,

    /// SW-002: Telemetry from a foreign run interleaved with the active one
    StaleRun,

    /// SW-003: Batches naming agents outside the descriptor
    UnknownAgent,

    /// SW-004: Garbage and unknown-type frames on the stream
    MalformedFrames,

    /// SW-005: Stop and restart with late frames from the first run
    Restart,

    /// SW-006: Emergency stop mid-stream
    PanicStop,

    /// SW-007: Server starts the run without offering a stream
    NoStream,

    /// SW-008: Server closes the stream, engine returns to idle
    ChannelClose,

    /// SW-009: Control API unreachable
    Unreachable,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Nominal,
            ScenarioId::StaleRun,
            ScenarioId::UnknownAgent,
            ScenarioId::MalformedFrames,
            ScenarioId::Restart,
            ScenarioId::PanicStop,
            ScenarioId::NoStream,
            ScenarioId::ChannelClose,
            ScenarioId::Unreachable,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Nominal => "nominal",
            ScenarioId::StaleRun => "stale_run",
            ScenarioId::UnknownAgent => "unknown_agent",
            ScenarioId::MalformedFrames => "malformed_frames",
            ScenarioId::Restart => "restart",
            ScenarioId::PanicStop => "panic_stop",
            ScenarioId::NoStream => "no_stream",
            ScenarioId::ChannelClose => "channel_close",
            ScenarioId::Unreachable => "unreachable",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Nominal => "Start, stream every agent's batches, close; all land in order",
            ScenarioId::StaleRun => "Foreign-run batches interleaved with the active run are dropped",
            ScenarioId::UnknownAgent => "Batches for unknown agents are rejected without stopping the stream",
            ScenarioId::MalformedFrames => "Undecodable and unknown-type frames never touch the store",
            ScenarioId::Restart => "Late frames from a stopped run are dropped after restart",
            ScenarioId::PanicStop => "Panic mid-stream clears the run; later telemetry is stale",
            ScenarioId::NoStream => "Run starts without a stream; sample data fills the store",
            ScenarioId::ChannelClose => "Server-side closure returns the engine to idle",
            ScenarioId::Unreachable => "Control failures surface as errors and leave the engine idle",
        }
    }

    /// Resolves a `--scenario` argument for an exported run.
    ///
    /// Only the nominal stream is exported; `all` selects it too.
    pub fn for_export(arg: &str) -> Result<ScenarioId, String> {
        if arg.eq_ignore_ascii_case("all") {
            return Ok(ScenarioId::Nominal);
        }
        match arg.parse::<ScenarioId>()? {
            ScenarioId::Nominal => Ok(ScenarioId::Nominal),
            other => Err(format!(
                "--export only runs the nominal scenario, got {} (use --scenario nominal or all)",
                other
            )),
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nominal" | "sw-001" => Ok(ScenarioId::Nominal),
            "stale_run" | "stalerun" | "sw-002" => Ok(ScenarioId::StaleRun),
            "unknown_agent" | "unknownagent" | "sw-003" => Ok(ScenarioId::UnknownAgent),
            "malformed_frames" | "malformed" | "sw-004" => Ok(ScenarioId::MalformedFrames),
            "restart" | "sw-005" => Ok(ScenarioId::Restart),
            "panic_stop" | "panic" | "sw-006" => Ok(ScenarioId::PanicStop),
            "no_stream" | "nostream" | "sw-007" => Ok(ScenarioId::NoStream),
            "channel_close" | "close" | "sw-008" => Ok(ScenarioId::ChannelClose),
            "unreachable" | "sw-009" => Ok(ScenarioId::Unreachable),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
