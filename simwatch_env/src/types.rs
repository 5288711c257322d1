//! Wire and control-plane types shared by the transport and the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Renders a JSON value the way JavaScript's `String(value)` would.
///
/// Run and agent identifiers arrive as numbers on some paths and as strings
/// on others; comparing their string forms is what makes `42` and `"42"`
/// the same run.
pub fn js_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                js_number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::Array(items) => items.iter().map(js_string).collect::<Vec<_>>().join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// Renders a float the way JavaScript's `Number.prototype.toString` does:
/// shortest round-trip digits, exponent form below `1e-6` and from `1e21` up,
/// and `-0` as `"0"`.
fn js_number(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if f == 0.0 {
        return "0".to_string();
    }
    if f < 0.0 {
        return format!("-{}", js_number(-f));
    }

    // `{:e}` yields the shortest round-trip digits, e.g. "1.5e-7"
    let sci = format!("{:e}", f);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let k = digits.len() as i32;
    let n = exp.parse::<i32>().unwrap_or(0) + 1;

    if k <= n && n <= 21 {
        format!("{}{}", digits, "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        format!("{}.{}", int, frac)
    } else if -6 < n && n <= 0 {
        format!("0.{}{}", "0".repeat((-n) as usize), digits)
    } else {
        let sign = if n - 1 < 0 { '-' } else { '+' };
        let (lead, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{}e{}{}", lead, sign, (n - 1).abs())
        } else {
            format!("{}.{}e{}{}", lead, rest, sign, (n - 1).abs())
        }
    }
}

/// Opaque run identifier, kept exactly as it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Value);

impl RunId {
    /// String form used for every comparison.
    pub fn as_key(&self) -> String {
        js_string(&self.0)
    }

    /// JSON type of the raw value (for mismatch diagnostics).
    pub fn type_name(&self) -> &'static str {
        match &self.0 {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// True when both ids render to the same string.
    pub fn matches(&self, other: &RunId) -> bool {
        self.as_key() == other.as_key()
    }

    /// Returns the raw wire value.
    pub fn raw(&self) -> &Value {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self(Value::String(id.to_string()))
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(Value::String(id))
    }
}

impl From<u64> for RunId {
    fn from(id: u64) -> Self {
        Self(Value::from(id))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// Agent identifier, normalized to its string form on decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Value", into = "String")]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Value> for AgentId {
    fn from(value: Value) -> Self {
        Self(js_string(&value))
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One simulated agent of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
}

impl AgentSpec {
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self { id: id.into() }
    }
}

/// A runnable scenario as described by the server's start response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDescriptor {
    /// Human-readable scenario name
    #[serde(default)]
    pub scenario_name: String,

    /// Run identifier (`id` or `run_id` on the wire)
    #[serde(alias = "run_id")]
    pub id: RunId,

    /// Agents taking part, in server order
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

impl ScenarioDescriptor {
    /// Creates a descriptor (mostly for tests and the simulated backend).
    pub fn new(scenario_name: impl Into<String>, id: impl Into<RunId>, agents: Vec<AgentSpec>) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            id: id.into(),
            agents,
        }
    }

    /// Extracts a descriptor from a start response body.
    ///
    /// Accepts the descriptor at the top level or nested under `scenario`.
    pub fn from_body(body: &Value) -> Option<Self> {
        serde_json::from_value(body.clone())
            .ok()
            .or_else(|| body.get("scenario").and_then(|s| serde_json::from_value(s.clone()).ok()))
    }
}

/// Result of a start request that reached the server.
#[derive(Debug, Clone)]
pub struct StartResponse {
    /// HTTP status code
    pub status: u16,

    /// True for a 2xx status
    pub ok: bool,

    /// Streaming endpoint path from the `x-scenario-ws` header
    pub stream_locator: Option<String>,

    /// Descriptor parsed from the body, if present
    pub descriptor: Option<ScenarioDescriptor>,

    /// Raw body (JSON, or a JSON string for non-JSON bodies)
    pub body: Value,
}

impl StartResponse {
    /// Returns true if the server accepted the start but offered no stream.
    pub fn started_without_stream(&self) -> bool {
        self.ok && self.stream_locator.is_none()
    }
}

/// Result of a stop or panic request that reached the server.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub status: u16,
    pub ok: bool,
    pub body: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_js_string_coercion() {
        assert_eq!(js_string(&json!(42)), "42");
        assert_eq!(js_string(&json!("42")), "42");
        assert_eq!(js_string(&json!(42.0)), "42");
        assert_eq!(js_string(&json!(1.5)), "1.5");
        assert_eq!(js_string(&json!(-7)), "-7");
        assert_eq!(js_string(&json!(null)), "null");
        assert_eq!(js_string(&json!(true)), "true");
    }

    #[test]
    fn test_js_string_float_forms() {
        assert_eq!(js_string(&json!(-0.0)), "0");
        assert_eq!(js_string(&json!(-2.5)), "-2.5");
        assert_eq!(js_string(&json!(123.456)), "123.456");
        assert_eq!(js_string(&json!(1e20)), "100000000000000000000");
        assert_eq!(js_string(&json!(1e21)), "1e+21");
        assert_eq!(js_string(&json!(1.25e22)), "1.25e+22");
        assert_eq!(js_string(&json!(0.000001)), "0.000001");
        assert_eq!(js_string(&json!(1.5e-7)), "1.5e-7");
        assert_eq!(js_string(&json!(0.1)), "0.1");
    }

    #[test]
    fn test_run_id_matches_across_types() {
        let numeric = RunId(json!(42));
        let text = RunId::from("42");

        assert!(numeric.matches(&text));
        assert_eq!(numeric.type_name(), "number");
        assert_eq!(text.type_name(), "string");
        assert!(!numeric.matches(&RunId::from("99")));
    }

    #[test]
    fn test_descriptor_accepts_run_id_alias() {
        let descriptor: ScenarioDescriptor = serde_json::from_value(json!({
            "scenario_name": "grid",
            "run_id": 7,
            "agents": [{"id": "a1"}, {"id": 2}]
        }))
        .unwrap();

        assert_eq!(descriptor.id.as_key(), "7");
        assert_eq!(descriptor.agents[1].id.as_str(), "2");
    }

    #[test]
    fn test_descriptor_from_nested_body() {
        let body = json!({"scenario": {"id": "42", "agents": [{"id": "a1"}]}});
        let descriptor = ScenarioDescriptor::from_body(&body).unwrap();
        assert_eq!(descriptor.id.as_key(), "42");
        assert_eq!(descriptor.scenario_name, "");

        assert!(ScenarioDescriptor::from_body(&json!({"status": "ok"})).is_none());
    }
}
