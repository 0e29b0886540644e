//! Producer-side emission shim. Inert unless explicitly enabled, so wiring
//! it into a producer changes nothing by default.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use spine_core::EventEnvelope;

use crate::error::{Result, StoreError};

pub const ENABLED_ENV: &str = "SPINE_EMIT_ENABLED";
pub const SINK_ENV: &str = "SPINE_EMIT_SINK";
pub const PATH_ENV: &str = "SPINE_EMIT_PATH";
pub const DEFAULT_EMIT_PATH: &str = "spine-events.jsonl";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmitSink {
    #[default]
    Discard,
    Stdout,
    /// Append one JSON line per event to the configured path.
    File,
}

impl EmitSink {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "discard" | "none" | "" => Some(EmitSink::Discard),
            "stdout" => Some(EmitSink::Stdout),
            "file" => Some(EmitSink::File),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmitSink::Discard => "discard",
            EmitSink::Stdout => "stdout",
            EmitSink::File => "file",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmissionConfig {
    pub enabled: bool,
    pub sink: EmitSink,
    pub path: PathBuf,
}

impl Default for EmissionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sink: EmitSink::Discard,
            path: PathBuf::from(DEFAULT_EMIT_PATH),
        }
    }
}

fn truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl EmissionConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. An unknown sink name is an error
    /// rather than a silent fallback.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENABLED_ENV) {
            config.enabled = truthy(&raw);
        }
        if let Some(raw) = lookup(SINK_ENV) {
            config.sink = EmitSink::parse(&raw).ok_or_else(|| {
                StoreError::InvalidData(format!("{SINK_ENV}: unknown sink '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup(PATH_ENV).filter(|v| !v.trim().is_empty()) {
            config.path = PathBuf::from(raw);
        }
        Ok(config)
    }

    /// Effective sink after the enable flag.
    pub fn effective_sink(&self) -> EmitSink {
        if self.enabled {
            self.sink
        } else {
            EmitSink::Discard
        }
    }
}

pub struct Emitter {
    config: EmissionConfig,
}

impl Emitter {
    pub fn new(config: EmissionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EmissionConfig {
        &self.config
    }

    /// Write one event. Returns whether anything was written.
    pub fn emit(&self, event: &EventEnvelope) -> Result<bool> {
        let sink = self.config.effective_sink();
        if sink == EmitSink::Discard {
            tracing::debug!(event_id = %event.event_id, "emission disabled, event discarded");
            return Ok(false);
        }

        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        match sink {
            EmitSink::Discard => return Ok(false),
            EmitSink::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(line.as_bytes())?;
                out.flush()?;
            }
            EmitSink::File => {
                if let Some(parent) = self.config.path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent)?;
                }
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.config.path)?;
                file.write_all(line.as_bytes())?;
            }
        }
        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            sink = sink.as_str(),
            "emitted event"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};
    use spine_core::{AgentEvent, EventKind};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn event() -> EventEnvelope {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        AgentEvent::new("s1", EventKind::SessionStarted, at)
            .with_id("e1")
            .to_envelope()
    }

    #[test]
    fn test_default_is_inert() {
        let config = EmissionConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EmissionConfig::default());
        assert_eq!(config.effective_sink(), EmitSink::Discard);
        assert!(!Emitter::new(config).emit(&event()).unwrap());
    }

    #[test]
    fn test_sink_without_enable_stays_inert() {
        let config = EmissionConfig::from_lookup(lookup(&[(SINK_ENV, "stdout")])).unwrap();
        assert_eq!(config.sink, EmitSink::Stdout);
        assert_eq!(config.effective_sink(), EmitSink::Discard);
    }

    #[test]
    fn test_unknown_sink_rejected() {
        let err = EmissionConfig::from_lookup(lookup(&[(SINK_ENV, "kafka")])).unwrap_err();
        assert!(err.to_string().contains("kafka"));
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let config = EmissionConfig::from_lookup(lookup(&[
            (ENABLED_ENV, "true"),
            (SINK_ENV, "file"),
            (PATH_ENV, path.to_str().unwrap()),
        ]))
        .unwrap();
        let emitter = Emitter::new(config);
        assert!(emitter.emit(&event()).unwrap());
        assert!(emitter.emit(&event()).unwrap());

        let text = fs::read_to_string(&path).unwrap();
        let parsed = spine_core::parse_event_log("events.jsonl", &text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].event_id, "e1");
    }
}
