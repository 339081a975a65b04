//! The output archive: one directory per patient stay.
//!
//! Records are grouped by `(servername, record_id)` where the record id
//! is the resolved patient id when the mapping is known and the mapping
//! id otherwise. A record stays open while messages keep arriving; an
//! idle gap longer than the split interval ends the stay and hands the
//! record to a finalization worker.
//!
//! A `%horizon` file marks the earliest boundary of usable data: records
//! whose first message falls before `horizon + split_interval` may be
//! missing their beginning, so they are kept in raw form only (dump
//! mode) rather than converted.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::OnceLock;

use dwc_core::bcp::{format_description, format_message};
use dwc_core::{DwcTimestamp, Message};
use regex::Regex;
use tracing::warn;

use crate::db::DwcDb;
use crate::dispatch::HandlerError;
use crate::logfile::{ArchiveBinaryFile, ArchiveLogFile};
use crate::timemap::TimeMap;
use crate::worker::{start_finalize, FinalizeChild, FinalizeMode};

/// Source-time gap that ends a stay, in milliseconds (about an hour).
pub const SPLIT_INTERVAL_MS: i64 = 60 * 60 * 1000;

fn record_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9-]+)_([0-9a-f-]+)_([-0-9]+)$").expect("static regex")
    })
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

pub struct Archive {
    base_dir: PathBuf,
    prefix_length: usize,
    split_interval: i64,
    records: HashMap<(String, String), Rc<RefCell<ArchiveRecord>>>,
    horizon: Option<DwcTimestamp>,
    finalize_mode: FinalizeMode,
    children: Vec<FinalizeChild>,
}

impl Archive {
    /// Open an archive directory, picking up existing records (one or two
    /// levels deep) and the horizon file.
    pub fn open(base_dir: &Path, finalize_mode: FinalizeMode) -> std::io::Result<Archive> {
        let mut archive = Archive {
            base_dir: base_dir.to_path_buf(),
            prefix_length: 2,
            split_interval: SPLIT_INTERVAL_MS,
            records: HashMap::new(),
            horizon: None,
            finalize_mode,
            children: Vec::new(),
        };

        archive.horizon = read_horizon(&base_dir.join("%horizon"));

        for (path, name) in subdirs(base_dir)? {
            if let Some(caps) = record_dir_re().captures(&name) {
                archive.open_existing(&path, &caps[1], &caps[2], &caps[3])?;
            } else {
                for (path2, name2) in subdirs(&path)? {
                    if let Some(caps) = record_dir_re().captures(&name2) {
                        archive.open_existing(&path2, &caps[1], &caps[2], &caps[3])?;
                    }
                }
            }
        }
        Ok(archive)
    }

    pub fn horizon(&self) -> Option<DwcTimestamp> {
        self.horizon
    }

    pub fn split_interval(&self) -> i64 {
        self.split_interval
    }

    pub fn open_record_count(&self) -> usize {
        self.records.len()
    }

    fn open_existing(
        &mut self,
        path: &Path,
        servername: &str,
        record_id: &str,
        datestamp: &str,
    ) -> std::io::Result<()> {
        let key = (servername.to_owned(), record_id.to_owned());
        // For duplicate (server, id) pairs, the newest stay wins.
        if let Some(existing) = self.records.get(&key) {
            if existing.borrow().datestamp.as_str() >= datestamp {
                return Ok(());
            }
        }
        let record = ArchiveRecord::new(path, servername, record_id, datestamp, false)?;
        self.records.insert(key, Rc::new(RefCell::new(record)));
        Ok(())
    }

    /// Find or create the record a message belongs to.
    ///
    /// Returns `None` when the mapping cannot be resolved yet and `sync`
    /// is false (the caller should hold the message and retry). With
    /// `sync`, an unresolved mapping id becomes the record id itself.
    pub fn get_record(
        &mut self,
        msg: &Message,
        sync: bool,
        db: &mut DwcDb,
    ) -> Result<Option<Rc<RefCell<ArchiveRecord>>>, HandlerError> {
        let servername = msg.origin().server.clone();
        let record_id = match msg.mapping_id() {
            Some(mapping_id) => {
                let patient_id = db
                    .get_patient_id(mapping_id)
                    .map_err(|e| HandlerError::Fatal(e.to_string()))?;
                match patient_id {
                    Some(pid) => pid.to_string(),
                    None if sync => mapping_id.to_string(),
                    None => return Ok(None),
                }
            }
            None => match msg.patient_id() {
                Some(pid) => pid.to_string(),
                None => {
                    return Err(HandlerError::bug(
                        "message has neither mapping nor patient id",
                    ));
                }
            },
        };

        let key = (servername.clone(), record_id.clone());
        let timestamp = msg.timestamp();

        if let Some(rec) = self.records.get(&key) {
            let end = rec.borrow().end_time();
            match end {
                None => rec.borrow_mut().set_end_time(timestamp),
                Some(end) => {
                    let gap = timestamp.delta_ms(&end);
                    if gap > self.split_interval {
                        self.finalize_record(&key)?;
                    } else if gap > 0 {
                        rec.borrow_mut().set_end_time(timestamp);
                    }
                }
            }
        }

        if let Some(rec) = self.records.get(&key) {
            return Ok(Some(Rc::clone(rec)));
        }

        // Start a new stay.
        let datestamp = timestamp.datestamp_utc();
        let prefix: String = record_id.chars().take(self.prefix_length).collect();
        let name = format!("{servername}_{record_id}_{datestamp}");
        let path = self.base_dir.join(prefix).join(name);
        let mut record = ArchiveRecord::new(&path, &servername, &record_id, &datestamp, true)?;
        if let Some(horizon) = self.horizon {
            if timestamp < horizon.add_ms(self.split_interval) {
                record.set_dump();
            }
        }
        record.set_end_time(timestamp);
        let rec = Rc::new(RefCell::new(record));
        self.records.insert(key, Rc::clone(&rec));
        Ok(Some(rec))
    }

    /// Finalize every record whose stay ended before `time` (minus the
    /// split interval). The live-mode stand-in for a stay-end detector.
    pub fn finalize_before(&mut self, time: DwcTimestamp) -> Result<(), HandlerError> {
        let threshold = time.add_ms(-self.split_interval);
        let stale: Vec<(String, String)> = self
            .records
            .iter()
            .filter(|(_, rec)| {
                rec.borrow()
                    .end_time()
                    .is_some_and(|end| end < threshold)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.finalize_record(&key)?;
        }
        Ok(())
    }

    /// Finalize everything (end of a batch conversion).
    pub fn terminate(&mut self) -> Result<(), HandlerError> {
        let keys: Vec<(String, String)> = self.records.keys().cloned().collect();
        for key in keys {
            self.finalize_record(&key)?;
        }
        Ok(())
    }

    fn finalize_record(&mut self, key: &(String, String)) -> Result<(), HandlerError> {
        let Some(rec) = self.records.remove(key) else {
            return Ok(());
        };
        let path = {
            let mut rec = rec.borrow_mut();
            rec.prepare_finalize()?;
            rec.path().to_path_buf()
        };
        let child = start_finalize(&self.finalize_mode, &path)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        self.children.push(child);
        Ok(())
    }

    /// Flush every open record and join outstanding finalization
    /// workers; a failed worker is fatal for the run.
    pub fn flush(&mut self) -> Result<(), HandlerError> {
        for rec in self.records.values() {
            rec.borrow_mut().flush()?;
        }
        for child in self.children.drain(..) {
            child
                .join()
                .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        }
        Ok(())
    }
}

fn subdirs(dir: &Path) -> std::io::Result<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                out.push((entry.path(), name.to_owned()));
            }
        }
    }
    out.sort();
    Ok(out)
}

fn read_horizon(path: &Path) -> Option<DwcTimestamp> {
    let text = std::fs::read_to_string(path).ok()?;
    match text.trim().parse() {
        Ok(ts) => Some(ts),
        Err(_) => {
            warn!("unparseable horizon file {}", path.display());
            None
        }
    }
}

// ---------------------------------------------------------------------------
// ArchiveRecord
// ---------------------------------------------------------------------------

pub struct ArchiveRecord {
    path: PathBuf,
    servername: String,
    record_id: String,
    datestamp: String,
    properties: serde_json::Value,
    pub time_map: TimeMap,
    base_seqnum: Option<i64>,
    end_time: Option<DwcTimestamp>,
    dump: bool,
    log_files: HashMap<String, ArchiveLogFile>,
    bin_files: HashMap<String, ArchiveBinaryFile>,
    modified: bool,
}

impl ArchiveRecord {
    pub fn new(
        path: &Path,
        servername: &str,
        record_id: &str,
        datestamp: &str,
        create: bool,
    ) -> std::io::Result<ArchiveRecord> {
        if create {
            std::fs::create_dir_all(path)?;
        }
        let properties = read_json(&path.join("_phi_properties"))
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
        let mut time_map = TimeMap::new(record_id);
        time_map.read(path, "_phi_time_map")?;

        let mut record = ArchiveRecord {
            path: path.to_path_buf(),
            servername: servername.to_owned(),
            record_id: record_id.to_owned(),
            datestamp: datestamp.to_owned(),
            properties,
            time_map,
            base_seqnum: None,
            end_time: None,
            dump: false,
            log_files: HashMap::new(),
            bin_files: HashMap::new(),
            modified: create,
        };
        record.base_seqnum = record.get_int_property(&["base_sequence_number"]);
        record.end_time = record.get_timestamp_property(&["end_time"]);
        record.dump = record.get_int_property(&["dump"]) == Some(1);
        Ok(record)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn servername(&self) -> &str {
        &self.servername
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn datestamp(&self) -> &str {
        &self.datestamp
    }

    // -----------------------------------------------------------------------
    // Time state
    // -----------------------------------------------------------------------

    /// The base sequence number: counter zero of the record's time axis.
    pub fn seqnum0(&self) -> Option<i64> {
        self.base_seqnum
    }

    pub fn set_seqnum0(&mut self, seqnum: i64) {
        self.base_seqnum = Some(seqnum);
        self.modified = true;
    }

    pub fn end_time(&self) -> Option<DwcTimestamp> {
        self.end_time
    }

    pub fn set_end_time(&mut self, time: DwcTimestamp) {
        self.end_time = Some(time);
        self.modified = true;
    }

    /// Add a reference point to the time map.
    pub fn set_time(&mut self, seqnum: i64, time: &DwcTimestamp) {
        self.time_map.set_time(seqnum, time);
        self.modified = true;
    }

    // -----------------------------------------------------------------------
    // Dump mode
    // -----------------------------------------------------------------------

    pub fn set_dump(&mut self) {
        self.dump = true;
        self.modified = true;
    }

    pub fn is_dump(&self) -> bool {
        self.dump
    }

    /// In dump mode, write the message verbatim as a BCP row (plus its
    /// format file, once) and report true; otherwise report false and
    /// write nothing.
    pub fn dump_message(&mut self, msg: &Message) -> std::io::Result<bool> {
        if !self.dump {
            return Ok(false);
        }
        let abbr = msg.kind().abbr();
        let fmt_path = self.path.join(format!("_dump_{abbr}.fmt"));
        if !fmt_path.exists() {
            std::fs::write(&fmt_path, format_description(msg.kind()))?;
        }
        let name = format!("_dump_{abbr}.dat");
        let row = format_message(msg);
        self.open_log_file(&name)?.append_bytes(&row)?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    pub fn get_property(&self, path: &[&str]) -> Option<&serde_json::Value> {
        let mut v = &self.properties;
        for key in path {
            v = v.get(key)?;
        }
        Some(v)
    }

    pub fn set_property(&mut self, path: &[&str], value: serde_json::Value) {
        if !self.properties.is_object() {
            self.properties = serde_json::Value::Object(serde_json::Map::new());
        }
        let mut v = &mut self.properties;
        for key in &path[..path.len() - 1] {
            let obj = v.as_object_mut().expect("object ensured");
            let entry = obj
                .entry((*key).to_owned())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if !entry.is_object() {
                *entry = serde_json::Value::Object(serde_json::Map::new());
            }
            v = entry;
        }
        v.as_object_mut()
            .expect("object ensured")
            .insert(path[path.len() - 1].to_owned(), value);
        self.modified = true;
    }

    pub fn get_int_property(&self, path: &[&str]) -> Option<i64> {
        self.get_property(path)?.as_i64()
    }

    pub fn get_str_property(&self, path: &[&str]) -> Option<String> {
        self.get_property(path)?.as_str().map(str::to_owned)
    }

    pub fn get_timestamp_property(&self, path: &[&str]) -> Option<DwcTimestamp> {
        self.get_property(path)?.as_str()?.parse().ok()
    }

    pub fn is_finalized(&self) -> bool {
        self.get_int_property(&["finalized"]) == Some(1)
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    pub fn open_log_file(&mut self, name: &str) -> std::io::Result<&mut ArchiveLogFile> {
        if !self.log_files.contains_key(name) {
            let file = ArchiveLogFile::open(&self.path.join(name))?;
            self.log_files.insert(name.to_owned(), file);
            self.modified = true;
        }
        Ok(self.log_files.get_mut(name).expect("just inserted"))
    }

    pub fn open_bin_file(
        &mut self,
        name: &str,
        window_size: Option<u64>,
    ) -> std::io::Result<&mut ArchiveBinaryFile> {
        if !self.bin_files.contains_key(name) {
            let file = ArchiveBinaryFile::open(&self.path.join(name), window_size)?;
            self.bin_files.insert(name.to_owned(), file);
            self.modified = true;
        }
        Ok(self.bin_files.get_mut(name).expect("just inserted"))
    }

    pub fn close_file(&mut self, name: &str) -> std::io::Result<()> {
        if let Some(mut log) = self.log_files.remove(name) {
            log.flush()?;
        }
        if let Some(mut bin) = self.bin_files.remove(name) {
            bin.flush()?;
        }
        Ok(())
    }

    fn close_all_files(&mut self) -> std::io::Result<()> {
        let names: Vec<String> = self
            .log_files
            .keys()
            .chain(self.bin_files.keys())
            .cloned()
            .collect();
        for name in names {
            self.close_file(&name)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Flush and finalize handoff
    // -----------------------------------------------------------------------

    /// Flush all files and, if state changed, rewrite the property store
    /// and time map atomically.
    pub fn flush(&mut self) -> std::io::Result<()> {
        for f in self.log_files.values_mut() {
            f.flush()?;
        }
        for f in self.bin_files.values_mut() {
            f.flush()?;
        }
        if self.modified {
            if let Some(sn) = self.base_seqnum {
                self.set_property(&["base_sequence_number"], serde_json::json!(sn));
            }
            if let Some(end) = self.end_time {
                self.set_property(&["end_time"], serde_json::json!(end.to_string()));
            }
            self.set_property(&["dump"], serde_json::json!(i32::from(self.dump)));
            write_json_atomic(&self.path, "_phi_properties", &self.properties)?;
            self.time_map.write(&self.path, "_phi_time_map")?;
            dir_sync(&self.path)?;
            self.modified = false;
        }
        Ok(())
    }

    /// Mark the record as finalizing (`finalized = 0`), close everything,
    /// and flush, ready for handoff to a worker.
    pub fn prepare_finalize(&mut self) -> std::io::Result<()> {
        self.set_property(&["finalized"], serde_json::json!(0));
        self.close_all_files()?;
        self.flush()
    }
}

fn read_json(path: &Path) -> Option<serde_json::Value> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Write `<dir>/<name>` via tmpfile + fsync + rename.
pub fn write_json_atomic(
    dir: &Path,
    name: &str,
    value: &serde_json::Value,
) -> std::io::Result<()> {
    let tmp = dir.join(format!("_{name}.tmp"));
    let mut f = std::fs::File::create(&tmp)?;
    serde_json::to_writer(&mut f, value)?;
    f.write_all(b"\n")?;
    f.sync_data()?;
    drop(f);
    std::fs::rename(&tmp, dir.join(name))
}

fn dir_sync(path: &Path) -> std::io::Result<()> {
    std::fs::File::open(path)?.sync_all()
}
