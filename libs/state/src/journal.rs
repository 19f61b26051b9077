//! File-backed durability for the store: one append-only journal per
//! namespace, JSON-line records, compacted on startup by streaming the live
//! set into a fresh file and atomically replacing the old one.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use talemu_resource::AnyResource;
use tracing::warn;

const JOURNAL_EXT: &str = "log";

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum Record {
    Put { resource: AnyResource },
    Delete { kind: String, id: String },
}

pub struct Journal {
    dir: PathBuf,
    files: HashMap<String, File>,
}

impl Journal {
    /// Open the journal directory, replaying every namespace file. Returns
    /// the surviving resources alongside the handle.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<(Self, Vec<AnyResource>)> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut live = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
                continue;
            }
            let Some(namespace) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            live.extend(replay_file(&path, namespace)?);
        }

        // Compact: stream the live records into fresh files and atomically
        // replace the originals, dropping superseded puts and deletes.
        compact(&dir, &live)?;

        Ok((
            Self {
                dir,
                files: HashMap::new(),
            },
            live,
        ))
    }

    pub fn append_put(&mut self, resource: &AnyResource) -> std::io::Result<()> {
        let line = serde_json::to_string(&Record::Put {
            resource: resource.clone(),
        })?;
        let namespace = resource.metadata.namespace.clone();
        let file = self.file_for(&namespace)?;
        writeln!(file, "{line}")?;
        file.sync_data()
    }

    pub fn append_delete(&mut self, namespace: &str, kind: &str, id: &str) -> std::io::Result<()> {
        let line = serde_json::to_string(&Record::Delete {
            kind: kind.to_string(),
            id: id.to_string(),
        })?;
        let file = self.file_for(namespace)?;
        writeln!(file, "{line}")?;
        file.sync_data()
    }

    fn file_for(&mut self, namespace: &str) -> std::io::Result<&mut File> {
        if !self.files.contains_key(namespace) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(namespace))?;
            self.files.insert(namespace.to_string(), file);
        }
        Ok(self.files.get_mut(namespace).expect("inserted above"))
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.{JOURNAL_EXT}"))
    }
}

fn replay_file(path: &Path, namespace: &str) -> std::io::Result<Vec<AnyResource>> {
    let mut resources: HashMap<(String, String), AnyResource> = HashMap::new();

    let reader = BufReader::new(File::open(path)?);
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(&line) {
            Ok(Record::Put { resource }) => {
                let key = (resource.metadata.kind.clone(), resource.metadata.id.clone());
                resources.insert(key, resource);
            }
            Ok(Record::Delete { kind, id }) => {
                resources.remove(&(kind, id));
            }
            Err(error) => {
                // A torn tail write from a crash is expected; everything past
                // it is unrecoverable.
                warn!(
                    msg = "journal record unreadable, truncating replay",
                    namespace,
                    line = line_no + 1,
                    %error,
                );
                break;
            }
        }
    }

    Ok(resources.into_values().collect())
}

fn compact(dir: &Path, live: &[AnyResource]) -> std::io::Result<()> {
    let mut by_namespace: HashMap<&str, Vec<&AnyResource>> = HashMap::new();
    for resource in live {
        by_namespace
            .entry(resource.metadata.namespace.as_str())
            .or_default()
            .push(resource);
    }

    // Namespaces whose journal emptied out still need their file truncated.
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
            continue;
        }
        let Some(namespace) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let tmp = path.with_extension("log.tmp");
        {
            let mut file = File::create(&tmp)?;
            for resource in by_namespace.get(namespace).into_iter().flatten() {
                let line = serde_json::to_string(&Record::Put {
                    resource: (*resource).clone(),
                })?;
                writeln!(file, "{line}")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use talemu_resource::{Resource, ResourceSpec, runtime::RebootSpec};

    fn reboot(id: &str, downtime_secs: u64) -> AnyResource {
        Resource::new(id, RebootSpec { downtime_secs })
            .into_any()
            .unwrap()
    }

    #[test]
    fn test_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let (mut journal, live) = Journal::open(dir.path()).unwrap();
        assert!(live.is_empty());

        journal.append_put(&reboot("current", 2)).unwrap();
        journal.append_put(&reboot("current", 5)).unwrap();
        journal.append_put(&reboot("other", 1)).unwrap();
        journal
            .append_delete(RebootSpec::NAMESPACE, RebootSpec::KIND, "other")
            .unwrap();
        drop(journal);

        let (_, mut live) = Journal::open(dir.path()).unwrap();
        live.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        assert_eq!(live.len(), 1);
        let reboot: Resource<RebootSpec> = live[0].typed().unwrap();
        assert_eq!(reboot.spec.downtime_secs, 5);
    }

    #[test]
    fn test_compaction_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();

        let (mut journal, _) = Journal::open(dir.path()).unwrap();
        for n in 0..100 {
            journal.append_put(&reboot("current", n)).unwrap();
        }
        let path = dir.path().join("runtime.log");
        let before = fs::metadata(&path).unwrap().len();
        drop(journal);

        let (_, live) = Journal::open(dir.path()).unwrap();
        assert_eq!(live.len(), 1);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();

        let (mut journal, _) = Journal::open(dir.path()).unwrap();
        journal.append_put(&reboot("current", 2)).unwrap();
        drop(journal);

        let path = dir.path().join("runtime.log");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("{\"op\":\"put\",\"resource\":{\"met");
        fs::write(&path, contents).unwrap();

        let (_, live) = Journal::open(dir.path()).unwrap();
        assert_eq!(live.len(), 1);
    }
}
