#![forbid(unsafe_code)]

use serde::Deserialize;
use sha2::Digest as _;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tk_core::RepairJob;

#[derive(Debug, thiserror::Error)]
pub(crate) enum RunnerError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid job file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid job file: {0}")]
    InvalidConfig(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error(transparent)]
    Store(#[from] tk_storage::StoreError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobFile {
    jobs: Vec<RepairJob>,
}

#[derive(Debug)]
pub(crate) struct LoadedConfig {
    pub(crate) jobs: Vec<RepairJob>,
    /// SHA-256 of the raw file, recorded with every pass.
    pub(crate) digest: String,
}

pub(crate) fn load_config(path: &Path) -> Result<LoadedConfig, RunnerError> {
    let raw = std::fs::read(path).map_err(|source| RunnerError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8(raw)
        .map_err(|_| RunnerError::InvalidConfig("file is not UTF-8".to_string()))?;
    let jobs = parse_jobs(&text)?;
    Ok(LoadedConfig {
        jobs,
        digest: sha256_hex(text.as_bytes()),
    })
}

pub(crate) fn parse_jobs(text: &str) -> Result<Vec<RepairJob>, RunnerError> {
    let file: JobFile = serde_yaml::from_str(text)?;
    if file.jobs.is_empty() {
        return Err(RunnerError::InvalidConfig("no jobs declared".to_string()));
    }
    let mut names = BTreeSet::new();
    for job in &file.jobs {
        job.validate()
            .map_err(|err| RunnerError::InvalidConfig(format!("job {:?}: {err}", job.name)))?;
        if !names.insert(job.name.trim().to_string()) {
            return Err(RunnerError::InvalidConfig(format!(
                "job {:?} is declared twice",
                job.name
            )));
        }
    }
    Ok(file.jobs)
}

/// All jobs in file order, or the one named.
pub(crate) fn select_jobs<'a>(
    jobs: &'a [RepairJob],
    name: Option<&str>,
) -> Result<Vec<&'a RepairJob>, RunnerError> {
    let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) else {
        return Ok(jobs.iter().collect());
    };
    match jobs.iter().find(|job| job.name.trim() == name) {
        Some(job) => Ok(vec![job]),
        None => Err(RunnerError::UnknownJob(name.to_string())),
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = sha2::Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tk_core::NodeId;

    const SAMPLE: &str = r#"
jobs:
  - name: patterns
    mirror:
      left:
        tag: pattern
      right:
        tag: category
        anchor: c-patterns
        derive_code: true
  - name: nav
    links:
      scope: nav
      target_tag: category
      static_targets:
        - label: Sale
          target: /sale
"#;

    #[test]
    fn parses_mirror_and_link_jobs() {
        let jobs = parse_jobs(SAMPLE).expect("jobs");
        assert_eq!(jobs.len(), 2);

        let mirror = jobs[0].mirror.as_ref().expect("mirror rule");
        assert_eq!(mirror.left.anchor, None);
        assert!(!mirror.left.derive_code);
        assert_eq!(
            mirror.right.anchor,
            Some(NodeId::try_new("c-patterns").expect("id"))
        );
        assert!(jobs[0].retired.is_empty());

        let links = jobs[1].links.as_ref().expect("link rule");
        assert_eq!(links.target_template, "/shop?category={id}");
        assert_eq!(links.static_targets.len(), 1);
        assert_eq!(links.static_targets[0].target, "/sale");
    }

    #[test]
    fn rejects_invalid_files() {
        assert!(matches!(parse_jobs("jobs: []"), Err(RunnerError::InvalidConfig(_))));
        assert!(matches!(
            parse_jobs("jobs:\n  - name: empty\n"),
            Err(RunnerError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_jobs("jobs:\n  - name: bad\n    mirror:\n      left: {tag: pattern}\n      right: {tag: pattern}\n"),
            Err(RunnerError::InvalidConfig(_))
        ));
        assert!(matches!(parse_jobs("workers: 3"), Err(RunnerError::Yaml(_))));

        let twice = "jobs:\n  - name: a\n    links: {scope: nav, target_tag: category}\n  - name: a\n    links: {scope: nav, target_tag: category}\n";
        let err = parse_jobs(twice).expect_err("duplicate names");
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn selects_jobs_by_name() {
        let jobs = parse_jobs(SAMPLE).expect("jobs");
        assert_eq!(select_jobs(&jobs, None).expect("all").len(), 2);
        assert_eq!(select_jobs(&jobs, Some(" ")).expect("all").len(), 2);
        let picked = select_jobs(&jobs, Some("nav")).expect("nav");
        assert_eq!(picked[0].name, "nav");
        assert!(matches!(
            select_jobs(&jobs, Some("missing")),
            Err(RunnerError::UnknownJob(name)) if name == "missing"
        ));
    }

    #[test]
    fn digest_is_stable_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn load_config_reports_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = load_config(&dir.path().join("absent.yaml")).expect_err("missing");
        assert!(matches!(err, RunnerError::Read { .. }));
    }
}
