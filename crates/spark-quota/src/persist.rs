//! File-backed persistence for [`crate::ledger::PastLedger`].
//!
//! On-disk record format is one tab-separated line per event:
//! `<time>\t<usage_0>\t<usage_1>\t...\t<usage_{dims-1}>\n`. Loading replays
//! every line through the ledger's ordinary `add` merge/prune logic, then
//! atomically rewrites the file with just the entries the in-memory ledger
//! actually retained, so the file never grows unbounded across restarts.
//! The atomic rewrite writes to a sibling `<path>._work_` file and renames
//! it over the original, matching the crash-safety idiom used for
//! `spark-core`'s on-disk state.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::PersistenceError;

pub struct FileLedgerStore {
    path: PathBuf,
    dims: usize,
    file: File,
}

impl FileLedgerStore {
    /// Parse every existing record in `path` (if any) and open an append
    /// handle for future writes.
    pub fn load(path: PathBuf, dims: usize) -> Result<(Vec<(f64, Vec<u64>)>, Self), PersistenceError> {
        let events = match File::open(&path) {
            Ok(f) => parse_records(&path, BufReader::new(f), dims)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| PersistenceError::Io {
                path: path.clone(),
                source,
            })?;
        Ok((events, Self { path, dims, file }))
    }

    /// Append a single event record.
    pub fn append(&mut self, t: f64, usage: &[u64]) -> Result<(), PersistenceError> {
        let line = render_record(t, usage);
        self.file
            .write_all(line.as_bytes())
            .map_err(|source| PersistenceError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Atomically replace the file's contents with exactly `entries`,
    /// discarding everything pruning already dropped from memory.
    pub fn rewrite_compacted<'a>(
        &mut self,
        entries: impl Iterator<Item = &'a (f64, Vec<u64>)>,
    ) -> Result<(), PersistenceError> {
        let work_path = work_path(&self.path);
        {
            let mut work = File::create(&work_path).map_err(|source| PersistenceError::Io {
                path: work_path.clone(),
                source,
            })?;
            for (t, usage) in entries {
                work.write_all(render_record(*t, usage).as_bytes())
                    .map_err(|source| PersistenceError::Io {
                        path: work_path.clone(),
                        source,
                    })?;
            }
            work.flush().map_err(|source| PersistenceError::Io {
                path: work_path.clone(),
                source,
            })?;
        }
        fs::rename(&work_path, &self.path).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| PersistenceError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }
}

fn work_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push("._work_");
    path.with_file_name(name)
}

fn render_record(t: f64, usage: &[u64]) -> String {
    let mut line = t.to_string();
    for u in usage {
        line.push('\t');
        line.push_str(&u.to_string());
    }
    line.push('\n');
    line
}

fn parse_records(
    path: &Path,
    reader: BufReader<File>,
    dims: usize,
) -> Result<Vec<(f64, Vec<u64>)>, PersistenceError> {
    let mut events = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.is_empty() {
            continue;
        }
        let malformed = || PersistenceError::MalformedRecord {
            path: path.to_path_buf(),
            line: line_no + 1,
            raw: line.clone(),
        };
        let mut fields = line.split('\t');
        let t: f64 = fields.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
        let usage: Vec<u64> = fields
            .map(|s| s.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| malformed())?;
        if usage.len() != dims {
            return Err(malformed());
        }
        events.push((t, usage));
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_records_through_a_temp_file() {
        let dir = std::env::temp_dir().join(format!("spark-quota-ledger-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ledger.tsv");
        let _ = fs::remove_file(&path);

        {
            let (events, mut store) = FileLedgerStore::load(path.clone(), 2).unwrap();
            assert!(events.is_empty());
            store.append(10.0, &[1, 2]).unwrap();
            store.append(20.0, &[3, 4]).unwrap();
        }

        let (events, _store) = FileLedgerStore::load(path.clone(), 2).unwrap();
        assert_eq!(events, vec![(10.0, vec![1, 2]), (20.0, vec![3, 4])]);

        fs::remove_file(&path).ok();
        fs::remove_dir(&dir).ok();
    }

    #[test]
    fn rewrite_compacted_replaces_file_atomically() {
        let dir = std::env::temp_dir().join(format!("spark-quota-ledger-test-compact-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ledger.tsv");
        let _ = fs::remove_file(&path);

        let (_events, mut store) = FileLedgerStore::load(path.clone(), 1).unwrap();
        store.append(1.0, &[1]).unwrap();
        store.append(2.0, &[2]).unwrap();
        store.append(3.0, &[3]).unwrap();

        let compacted = vec![(3.0_f64, vec![3_u64])];
        store.rewrite_compacted(compacted.iter()).unwrap();

        let (events, _store) = FileLedgerStore::load(path.clone(), 1).unwrap();
        assert_eq!(events, compacted);

        fs::remove_file(&path).ok();
        fs::remove_dir(&dir).ok();
    }
}
