//! Artifact collection for the log-export step.
//!
//! The collector owns one host's artifact folder under the report root. Before
//! the export it empties that folder; afterwards it waits for the agent to
//! finish writing, finds the archives it produced, fixes file names that carry
//! a placeholder instead of the host name, and copies remote archives home.
//!
//! Discovery is keyed on the run-scoped output directory handed to the agent.
//! Only when that directory holds nothing does the collector fall back to
//! matching file names elsewhere, and it says so in the host's warnings.

pub mod naming;

use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::backend::{ArtifactStore, FileEntry};
use crate::config::ArtifactSettings;
use crate::error::Result;
use crate::poll::{poll_until, CancellationToken, Clock, PollConfig, PollOutcome};

use naming::{is_archive, normalize_name, sibling_path};

/// Slack applied to "modified after the step started" for local files.
const LOCAL_TIME_TOLERANCE: Duration = Duration::from_secs(2);

/// Remote files are stamped by the remote clock.
const REMOTE_TIME_TOLERANCE: Duration = Duration::from_secs(300);

/// Where a collected artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactLocation {
    Local { path: PathBuf },
    /// Copy failed; the archive is still on the target.
    RemoteOnly { host: String, path: String },
}

/// How sure the collector is that an archive belongs to this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Found in the run's output directory and written after the step began.
    High,
    /// Found in the run's output directory with an older timestamp.
    Medium,
    /// Matched by name outside the output directory.
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectedArtifact {
    pub location: ArtifactLocation,
    pub file_name: String,
    /// Name the agent originally gave the file, when it was changed
    pub original_name: Option<String>,
    pub size: u64,
    pub confidence: Confidence,
}

impl CollectedArtifact {
    pub fn is_local(&self) -> bool {
        matches!(self.location, ArtifactLocation::Local { .. })
    }

    /// Path shown in reports; remote-only entries are marked as such.
    pub fn display_path(&self) -> String {
        match &self.location {
            ArtifactLocation::Local { path } => path.display().to_string(),
            ArtifactLocation::RemoteOnly { host, path } => {
                format!("{}:{} (available on remote host, not copied)", host, path)
            }
        }
    }
}

/// Everything collection learned about one host.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub artifacts: Vec<CollectedArtifact>,
    pub warnings: Vec<String>,
    pub narrative: Vec<String>,
}

/// Collector tuned for one host.
pub struct ArtifactCollector<'a> {
    settings: &'a ArtifactSettings,
    process_name: String,
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
}

impl<'a> ArtifactCollector<'a> {
    pub fn new(
        settings: &'a ArtifactSettings,
        process_name: impl Into<String>,
        clock: &'a dyn Clock,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            settings,
            process_name: process_name.into(),
            clock,
            cancel,
        }
    }

    /// Waits for the export to settle and gathers its archives.
    ///
    /// `output_dir` is where the agent was told to write, on the target;
    /// `local_dir` is the host's folder under the report root; `since` is
    /// when the export step started.
    pub fn collect<S: ArtifactStore + ?Sized>(
        &self,
        store: &mut S,
        host: &str,
        is_local: bool,
        output_dir: &str,
        local_dir: &Path,
        since: SystemTime,
    ) -> Collection {
        let mut collection = Collection::default();

        let poll = PollConfig::new(
            self.settings.poll_interval(),
            self.settings.wait_ceiling(is_local),
        );
        let outcome = self.wait_for_export(store, output_dir, &poll);
        match outcome {
            PollOutcome::Satisfied { elapsed, .. } => collection
                .narrative
                .push(format!("Export settled after {:.1}s", elapsed.as_secs_f64())),
            PollOutcome::TimedOut { elapsed, .. } => {
                let msg = format!(
                    "Agent still busy after {:.0}s wait; collecting what is present",
                    elapsed.as_secs_f64()
                );
                warn!("{}: {}", host, msg);
                collection.warnings.push(msg);
            }
            PollOutcome::Cancelled { .. } => {
                collection
                    .warnings
                    .push("Artifact wait cancelled; collecting what is present".to_string());
            }
        }

        let tolerance = if is_local {
            LOCAL_TIME_TOLERANCE
        } else {
            REMOTE_TIME_TOLERANCE
        };
        let threshold = since.checked_sub(tolerance).unwrap_or(since);
        let found = self.discover(store, output_dir, threshold, &mut collection);

        if found.is_empty() {
            let msg = format!("No log archive found for {}", host);
            warn!("{}", msg);
            collection.warnings.push(msg);
            return collection;
        }

        let mut all_local = true;
        for (entry, confidence) in found {
            let (entry, original_name) = self.normalize(store, host, entry, &mut collection);
            let artifact = self.bring_home(
                store,
                host,
                is_local,
                &entry,
                local_dir,
                original_name,
                confidence,
                &mut collection,
            );
            all_local &= artifact.is_local();
            collection
                .narrative
                .push(format!("Artifact: {}", artifact.display_path()));
            collection.artifacts.push(artifact);
        }

        if !is_local && all_local {
            if let Err(e) = store.discard_output_dir(output_dir) {
                debug!("Failed to remove staging directory {}: {}", output_dir, e);
            }
        }

        info!(
            "Collected {} artifact(s) for {}",
            collection.artifacts.len(),
            host
        );
        collection
    }

    /// Polls until the agent process is gone, or archives stop growing.
    fn wait_for_export<S: ArtifactStore + ?Sized>(
        &self,
        store: &mut S,
        output_dir: &str,
        poll: &PollConfig,
    ) -> PollOutcome {
        let mut previous: Option<Vec<(String, u64)>> = None;

        poll_until(poll, self.clock, self.cancel, || {
            if !store.tool_running(&self.process_name) {
                return true;
            }

            let snapshot: Vec<(String, u64)> = self
                .archives_in(store, output_dir)
                .into_iter()
                .map(|f| (f.file_name, f.size))
                .collect();
            let stable = !snapshot.is_empty() && previous.as_ref() == Some(&snapshot);
            previous = Some(snapshot);
            stable
        })
    }

    fn archives_in<S: ArtifactStore + ?Sized>(&self, store: &mut S, dir: &str) -> Vec<FileEntry> {
        match store.list_files(dir) {
            Ok(files) => files
                .into_iter()
                .filter(|f| is_archive(&f.file_name, &self.settings.extensions))
                .collect(),
            Err(e) => {
                debug!("Could not list {}: {}", dir, e);
                Vec::new()
            }
        }
    }

    /// Final listing pass, strongest signal first.
    fn discover<S: ArtifactStore + ?Sized>(
        &self,
        store: &mut S,
        output_dir: &str,
        threshold: SystemTime,
        collection: &mut Collection,
    ) -> Vec<(FileEntry, Confidence)> {
        let in_output: Vec<(FileEntry, Confidence)> = self
            .archives_in(store, output_dir)
            .into_iter()
            .map(|f| {
                let confidence = match f.modified {
                    Some(modified) if modified < threshold => Confidence::Medium,
                    _ => Confidence::High,
                };
                (f, confidence)
            })
            .collect();
        if !in_output.is_empty() {
            return in_output;
        }

        let Some(fallback_dir) = store.fallback_search_dir() else {
            return Vec::new();
        };
        if fallback_dir == output_dir {
            return Vec::new();
        }

        let needle = self.process_name.to_ascii_lowercase();
        let matches: Vec<(FileEntry, Confidence)> = self
            .archives_in(store, &fallback_dir)
            .into_iter()
            .filter(|f| f.file_name.to_ascii_lowercase().contains(&needle))
            .filter(|f| f.modified.map_or(false, |m| m >= threshold))
            .map(|f| (f, Confidence::Low))
            .collect();

        if !matches.is_empty() {
            let msg = format!(
                "Low-confidence match: {} archive(s) found by name in {} instead of the run output directory",
                matches.len(),
                fallback_dir
            );
            warn!("{}", msg);
            collection.warnings.push(msg);
        }
        matches
    }

    /// Renames placeholder-named files; on failure keeps the original name.
    fn normalize<S: ArtifactStore + ?Sized>(
        &self,
        store: &mut S,
        host: &str,
        entry: FileEntry,
        collection: &mut Collection,
    ) -> (FileEntry, Option<String>) {
        let Some(new_name) =
            normalize_name(&entry.file_name, &self.settings.placeholder_tokens, host)
        else {
            return (entry, None);
        };

        let new_path = sibling_path(&entry.path, &new_name);
        match store.rename(&entry.path, &new_path) {
            Ok(()) => {
                collection
                    .narrative
                    .push(format!("Renamed {} -> {}", entry.file_name, new_name));
                let original = entry.file_name.clone();
                (
                    FileEntry {
                        path: new_path,
                        file_name: new_name,
                        ..entry
                    },
                    Some(original),
                )
            }
            Err(e) => {
                let msg = format!(
                    "Could not rename {} to {}: {}; keeping original name",
                    entry.file_name, new_name, e
                );
                warn!("{}", msg);
                collection.warnings.push(msg);
                (entry, None)
            }
        }
    }

    /// Makes sure the archive sits in the host's local folder.
    #[allow(clippy::too_many_arguments)]
    fn bring_home<S: ArtifactStore + ?Sized>(
        &self,
        store: &mut S,
        host: &str,
        is_local: bool,
        entry: &FileEntry,
        local_dir: &Path,
        original_name: Option<String>,
        confidence: Confidence,
        collection: &mut Collection,
    ) -> CollectedArtifact {
        let destination = local_dir.join(&entry.file_name);
        let artifact = |location, size| CollectedArtifact {
            location,
            file_name: entry.file_name.clone(),
            original_name: original_name.clone(),
            size,
            confidence,
        };

        if is_local && Path::new(&entry.path) == destination {
            return artifact(
                ArtifactLocation::Local { path: destination },
                entry.size,
            );
        }

        match store.fetch(&entry.path, &destination) {
            Ok(size) => {
                return artifact(ArtifactLocation::Local { path: destination }, size);
            }
            Err(e) => {
                let msg = format!(
                    "Primary copy of {} failed ({}); trying fallback",
                    entry.file_name, e
                );
                warn!("{}", msg);
                collection.warnings.push(msg);
            }
        }

        match store.fetch_fallback(&entry.path, &destination) {
            Ok(size) => artifact(ArtifactLocation::Local { path: destination }, size),
            Err(e) => {
                let msg = format!(
                    "Fallback copy of {} failed ({}); archive left on {}",
                    entry.file_name, e, host
                );
                warn!("{}", msg);
                collection.warnings.push(msg);
                artifact(
                    ArtifactLocation::RemoteOnly {
                        host: host.to_string(),
                        path: entry.path.clone(),
                    },
                    entry.size,
                )
            }
        }
    }
}

/// Creates the host folder, or empties it when a previous run left one behind.
pub fn prepare_host_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        debug!("Clearing previous contents of {}", dir.display());
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
    } else {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::poll::ManualClock;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// In-memory host file system.
    #[derive(Default)]
    struct FakeStore {
        files: Vec<FileEntry>,
        fallback_dir: Option<String>,
        fallback_files: Vec<FileEntry>,
        running: VecDeque<bool>,
        fail_rename: bool,
        fail_fetch: bool,
        fail_fallback: bool,
        discarded: Vec<String>,
    }

    fn entry(dir: &str, name: &str, size: u64, modified: SystemTime) -> FileEntry {
        FileEntry {
            path: format!("{}/{}", dir, name),
            file_name: name.to_string(),
            size,
            modified: Some(modified),
        }
    }

    impl ArtifactStore for FakeStore {
        fn prepare_output_dir(&mut self, _local_dir: &Path, run_key: &str) -> Result<String> {
            Ok(format!("/stage/{}", run_key))
        }

        fn list_files(&mut self, dir: &str) -> Result<Vec<FileEntry>> {
            if Some(dir) == self.fallback_dir.as_deref() {
                return Ok(self.fallback_files.clone());
            }
            Ok(self.files.clone())
        }

        fn fallback_search_dir(&mut self) -> Option<String> {
            self.fallback_dir.clone()
        }

        fn tool_running(&mut self, _process_name: &str) -> bool {
            self.running.pop_front().unwrap_or(false)
        }

        fn rename(&mut self, from: &str, to: &str) -> Result<()> {
            if self.fail_rename {
                return Err(Error::Remote("read-only file system".to_string()));
            }
            let file = self.files.iter_mut().find(|f| f.path == from).unwrap();
            file.path = to.to_string();
            file.file_name = to.rsplit('/').next().unwrap().to_string();
            Ok(())
        }

        fn fetch(&mut self, _path: &str, local_path: &Path) -> Result<u64> {
            if self.fail_fetch {
                return Err(Error::Remote("channel closed".to_string()));
            }
            fs::write(local_path, b"zipdata")?;
            Ok(7)
        }

        fn fetch_fallback(&mut self, _path: &str, local_path: &Path) -> Result<u64> {
            if self.fail_fallback {
                return Err(Error::Transfer("scp failed".to_string()));
            }
            fs::write(local_path, b"zipdata")?;
            Ok(7)
        }

        fn discard_output_dir(&mut self, dir: &str) -> Result<()> {
            self.discarded.push(dir.to_string());
            Ok(())
        }
    }

    fn settings() -> ArtifactSettings {
        ArtifactSettings::default()
    }

    #[test]
    fn test_prepare_host_dir_replaces_previous_run() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("SRV01");

        prepare_host_dir(&dir).unwrap();
        fs::write(dir.join("old-run.zip"), b"stale").unwrap();
        fs::create_dir(dir.join("nested")).unwrap();
        fs::write(dir.join("nested").join("x.log"), b"stale").unwrap();

        prepare_host_dir(&dir).unwrap();
        fs::write(dir.join("new-run.zip"), b"fresh").unwrap();

        let names: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["new-run.zip"]);
    }

    #[test]
    fn test_remote_collection_renames_and_copies() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let mut store = FakeStore {
            files: vec![entry("/stage/run", "azcmagent-logs-%COMPUTERNAME%.zip", 7, now)],
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        let collection =
            collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);

        assert_eq!(collection.artifacts.len(), 1);
        let artifact = &collection.artifacts[0];
        assert_eq!(artifact.file_name, "azcmagent-logs-SRV01.zip");
        assert_eq!(
            artifact.original_name.as_deref(),
            Some("azcmagent-logs-%COMPUTERNAME%.zip")
        );
        assert_eq!(artifact.confidence, Confidence::High);
        assert_eq!(
            artifact.location,
            ArtifactLocation::Local {
                path: temp.path().join("azcmagent-logs-SRV01.zip")
            }
        );
        assert!(temp.path().join("azcmagent-logs-SRV01.zip").exists());
        assert_eq!(store.discarded, vec!["/stage/run"]);
    }

    #[test]
    fn test_rename_failure_keeps_original_name() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let mut store = FakeStore {
            files: vec![entry("/stage/run", "logs-%COMPUTERNAME%.zip", 7, now)],
            fail_rename: true,
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        let collection =
            collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);

        assert_eq!(collection.artifacts.len(), 1);
        assert_eq!(collection.artifacts[0].file_name, "logs-%COMPUTERNAME%.zip");
        assert!(collection.warnings.iter().any(|w| w.contains("Could not rename")));
    }

    #[test]
    fn test_transfer_failure_leaves_remote_reference() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let mut store = FakeStore {
            files: vec![entry("/stage/run", "logs-SRV01.zip", 7, now)],
            fail_fetch: true,
            fail_fallback: true,
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        let collection =
            collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);

        let artifact = &collection.artifacts[0];
        assert!(!artifact.is_local());
        assert!(artifact
            .display_path()
            .contains("available on remote host, not copied"));
        assert!(store.discarded.is_empty(), "staging must survive for manual copy");
        assert_eq!(collection.warnings.len(), 2);
    }

    #[test]
    fn test_fallback_transfer_recovers() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let mut store = FakeStore {
            files: vec![entry("/stage/run", "logs-SRV01.zip", 7, now)],
            fail_fetch: true,
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        let collection =
            collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);

        assert!(collection.artifacts[0].is_local());
        assert_eq!(store.discarded.len(), 1);
    }

    #[test]
    fn test_wait_stops_when_process_exits() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let mut store = FakeStore {
            files: vec![],
            running: VecDeque::from(vec![true, true, true, false]),
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);

        assert_eq!(clock.now(), Duration::from_secs(3));
    }

    #[test]
    fn test_wait_stops_when_archive_is_stable() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let mut store = FakeStore {
            files: vec![entry("/stage/run", "logs-SRV01.zip", 7, now)],
            running: VecDeque::from(vec![true; 100]),
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        let collection =
            collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);

        assert_eq!(clock.now(), Duration::from_secs(1));
        assert!(collection.warnings.is_empty());
    }

    #[test]
    fn test_wait_ceiling_for_remote_hosts() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let mut store = FakeStore {
            running: VecDeque::from(vec![true; 100]),
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        let collection =
            collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);

        assert_eq!(clock.now(), Duration::from_secs(15));
        assert!(collection.warnings.iter().any(|w| w.contains("still busy")));
        assert!(collection.warnings.iter().any(|w| w.contains("No log archive")));
    }

    #[test]
    fn test_older_archive_in_output_dir_is_medium_confidence() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let old = now - Duration::from_secs(3600);
        let mut store = FakeStore {
            files: vec![entry("/stage/run", "logs-SRV01.zip", 7, old)],
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        let collection =
            collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);
        assert_eq!(collection.artifacts[0].confidence, Confidence::Medium);
    }

    #[test]
    fn test_name_match_fallback_is_low_confidence() {
        let temp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let mut store = FakeStore {
            fallback_dir: Some("/home/ops".to_string()),
            fallback_files: vec![
                entry("/home/ops", "azcmagent-logs-SRV01.zip", 7, now),
                entry("/home/ops", "unrelated-backup.zip", 7, now),
            ],
            ..FakeStore::default()
        };
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let settings = settings();
        let collector = ArtifactCollector::new(&settings, "azcmagent", &clock, &cancel);

        let collection =
            collector.collect(&mut store, "SRV01", false, "/stage/run", temp.path(), now);

        assert_eq!(collection.artifacts.len(), 1);
        assert_eq!(collection.artifacts[0].confidence, Confidence::Low);
        assert!(collection.warnings.iter().any(|w| w.contains("Low-confidence")));
    }
}
