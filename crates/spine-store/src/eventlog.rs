//! Event-log files on disk: path and glob resolution, then per-file parsing.
//!
//! A failing file never stops the others from loading. `load_all` hands back
//! every file's outcome so the caller can report and still replay the rest.

use std::fs;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSetBuilder};
use spine_core::{EventEnvelope, SpineError, parse_event_log};
use walkdir::WalkDir;

use crate::error::{Result, StoreError};

fn is_glob(raw: &str) -> bool {
    raw.contains(['*', '?', '[', '{'])
}

/// Longest leading run of literal components; the walk starts there.
fn glob_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    for component in Path::new(pattern).components() {
        if let Component::Normal(part) = component
            && is_glob(&part.to_string_lossy())
        {
            break;
        }
        base.push(component.as_os_str());
    }
    if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base
    }
}

fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut builder = GlobSetBuilder::new();
    builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
    let matcher = builder.build()?;

    let base = glob_base(pattern);
    let relative = !Path::new(pattern).has_root() && !pattern.starts_with("./");
    let mut matched = Vec::new();
    if !base.exists() {
        return Ok(matched);
    }
    for item in WalkDir::new(&base).follow_links(false) {
        let item = item.map_err(|e| StoreError::Walk {
            path: base.clone(),
            reason: e.to_string(),
        })?;
        if !item.file_type().is_file() {
            continue;
        }
        let path = item.path();
        let candidate = if relative {
            path.strip_prefix("./").unwrap_or(path)
        } else {
            path
        };
        if matcher.is_match(candidate) {
            matched.push(path.to_path_buf());
        }
    }
    matched.sort();
    Ok(matched)
}

/// Expand every input to concrete files, in order, without duplicates.
/// A literal path that does not exist, or a glob with no matches, is
/// `NotFound`.
pub fn resolve_inputs(inputs: &[String]) -> Vec<Result<PathBuf>> {
    let mut seen = Vec::<PathBuf>::new();
    let mut out = Vec::new();
    for raw in inputs {
        if is_glob(raw) {
            match expand_glob(raw) {
                Ok(paths) if paths.is_empty() => {
                    out.push(Err(StoreError::NotFound(PathBuf::from(raw))));
                }
                Ok(paths) => {
                    for path in paths {
                        if !seen.contains(&path) {
                            seen.push(path.clone());
                            out.push(Ok(path));
                        }
                    }
                }
                Err(e) => out.push(Err(e)),
            }
        } else {
            let path = PathBuf::from(raw);
            if !path.is_file() {
                out.push(Err(StoreError::NotFound(path)));
            } else if !seen.contains(&path) {
                seen.push(path.clone());
                out.push(Ok(path));
            }
        }
    }
    out
}

/// Read and parse one log file.
pub fn load_file(path: &Path) -> Result<Vec<EventEnvelope>> {
    if !path.is_file() {
        return Err(StoreError::NotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    parse_event_log(&path.display().to_string(), &text).map_err(|e| match e {
        SpineError::MalformedInput { line, reason, .. } => StoreError::Malformed {
            path: path.to_path_buf(),
            line,
            reason,
        },
        other => StoreError::InvalidData(other.to_string()),
    })
}

/// Outcome of loading one input.
#[derive(Debug)]
pub struct LoadedFile {
    /// The resolved path, or the raw input when resolution failed.
    pub path: PathBuf,
    pub events: Result<Vec<EventEnvelope>>,
}

/// Resolve and load every input.
pub fn load_all(inputs: &[String]) -> Vec<LoadedFile> {
    resolve_inputs(inputs)
        .into_iter()
        .map(|resolved| match resolved {
            Ok(path) => {
                let events = load_file(&path);
                match &events {
                    Ok(events) => {
                        tracing::info!(path = %path.display(), events = events.len(), "loaded event log")
                    }
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping event log"),
                }
                LoadedFile { path, events }
            }
            Err(e) => {
                let path = match &e {
                    StoreError::NotFound(p) => p.clone(),
                    _ => PathBuf::new(),
                };
                tracing::warn!(error = %e, "unresolvable input");
                LoadedFile {
                    path,
                    events: Err(e),
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"{"event_id":"a","event_type":"session_started","occurred_at":"2026-03-01T10:00:00Z","session_id":"s","schema_version":"1.0"}"#;

    #[test]
    fn test_glob_base() {
        assert_eq!(glob_base("logs/*.jsonl"), PathBuf::from("logs"));
        assert_eq!(glob_base("/var/logs/**/x.json"), PathBuf::from("/var/logs"));
        assert_eq!(glob_base("*.jsonl"), PathBuf::from("."));
    }

    #[test]
    fn test_resolve_glob_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.jsonl"), LINE).unwrap();
        fs::write(dir.path().join("a.jsonl"), LINE).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let pattern = format!("{}/*.jsonl", dir.path().display());
        let resolved: Vec<PathBuf> = resolve_inputs(&[pattern])
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            resolved,
            vec![dir.path().join("a.jsonl"), dir.path().join("b.jsonl")]
        );
    }

    #[test]
    fn test_missing_literal_and_empty_glob() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.jsonl").display().to_string();
        let empty_glob = format!("{}/*.json", dir.path().display());
        let resolved = resolve_inputs(&[missing, empty_glob]);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|r| matches!(r, Err(StoreError::NotFound(_)))));
    }

    #[test]
    fn test_duplicates_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        fs::write(&path, LINE).unwrap();
        let literal = path.display().to_string();
        let glob = format!("{}/*.jsonl", dir.path().display());
        assert_eq!(resolve_inputs(&[literal, glob]).len(), 1);
    }

    #[test]
    fn test_load_all_continues_past_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.jsonl");
        let good = dir.path().join("good.jsonl");
        fs::write(&bad, format!("{LINE}\n{{oops\n")).unwrap();
        fs::write(&good, LINE).unwrap();

        let loaded = load_all(&[bad.display().to_string(), good.display().to_string()]);
        assert_eq!(loaded.len(), 2);
        match &loaded[0].events {
            Err(StoreError::Malformed { path, line, .. }) => {
                assert_eq!(path, &bad);
                assert_eq!(*line, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(loaded[1].events.as_ref().unwrap().len(), 1);
    }
}
