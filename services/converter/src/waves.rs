//! Wave samples: buffering, frame packing, and segment output.
//!
//! Frames run at a fixed 62.5 Hz (16 counter ticks per frame); each
//! signal contributes `ceil(16 / sample_period)` samples per frame. A
//! segment holds one constant interleaved layout; the layout changing,
//! a gap, or a write before the segment start opens a new segment.
//!
//! Messages for the different signals of one bed arrive interleaved and
//! slightly out of step, so samples are staged in a buffer keyed by
//! signal and flushed in homogeneous chunks once the signal set for a
//! time range is settled. `saved_intervals` records exactly which time
//! ranges have reached the `.dat` file; re-delivered messages only
//! contribute the slices not already saved, which is what makes replays
//! and restarts idempotent.

use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::path::PathBuf;
use std::rc::Rc;

use dwc_core::attr::WaveAttr;
use dwc_core::message::WaveSampleMessage;
use dwc_core::text::{sanitize_desc, sanitize_units};
use dwc_core::{Channel, Message};
use serde_json::json;
use tracing::warn;
use wfdb_io::{SegmentHeader, SignalInfo};

use crate::archive::{Archive, ArchiveRecord};
use crate::db::DwcDb;
use crate::dispatch::{Decisions, Handler, HandlerError};

/// Frame frequency and ticks per frame.
pub const FFREQ: f64 = 62.5;
pub const TPF: i64 = 16;
/// The counter frequency named in segment headers.
pub const CFREQ: f64 = 1000.0;

/// Samples per frame for a signal with the given sample period.
pub fn samples_per_frame(tps: i64) -> i64 {
    (TPF + tps - 1) / tps
}

// ---------------------------------------------------------------------------
// Sample intervals
// ---------------------------------------------------------------------------

/// Parse a space-separated ASCII integer list; garbage ends the list.
fn parse_sample_list(text: Option<&str>) -> Vec<i64> {
    let mut out = Vec::new();
    if let Some(text) = text {
        for token in text.split_whitespace() {
            match token.parse() {
                Ok(v) => out.push(v),
                Err(_) => break,
            }
        }
    }
    out
}

/// Pair up a list into inclusive (start, end) intervals.
fn parse_interval_list(text: Option<&str>) -> Vec<(i64, i64)> {
    let flat = parse_sample_list(text);
    flat.chunks_exact(2).map(|c| (c[0], c[1])).collect()
}

/// Sample index ranges (exclusive end) not marked invalid or
/// unavailable.
fn valid_sample_intervals(msg: &WaveSampleMessage) -> Vec<(i64, i64)> {
    let nsamples = (msg.wave_samples.len() / 2) as i64;
    let mut excluded = parse_interval_list(msg.invalid_samples.as_deref());
    excluded.extend(parse_interval_list(msg.unavailable_samples.as_deref()));
    excluded.sort_unstable();

    let mut out = Vec::new();
    let mut cur = 0;
    for (start, end) in excluded {
        if start <= end && start <= nsamples {
            if start > cur {
                out.push((cur, start));
            }
            cur = cur.max(end + 1);
        }
    }
    if nsamples > cur {
        out.push((cur, nsamples));
    }
    out
}

/// Sorted, disjoint, half-open `[start, end)` intervals.
#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
    spans: Vec<(i64, i64)>,
}

impl IntervalSet {
    pub fn from_pairs(pairs: Vec<(i64, i64)>) -> IntervalSet {
        let mut set = IntervalSet::default();
        for (start, end) in pairs {
            set.add(start, end);
        }
        set
    }

    pub fn spans(&self) -> &[(i64, i64)] {
        &self.spans
    }

    /// Insert a span, merging with neighbours it touches.
    pub fn add(&mut self, start: i64, end: i64) {
        if start >= end {
            return;
        }
        let mut merged = (start, end);
        let mut out = Vec::with_capacity(self.spans.len() + 1);
        for &(s, e) in &self.spans {
            if e < merged.0 || s > merged.1 {
                out.push((s, e));
            } else {
                merged.0 = merged.0.min(s);
                merged.1 = merged.1.max(e);
            }
        }
        out.push(merged);
        out.sort_unstable();
        self.spans = out;
    }

    pub fn covers(&self, start: i64, end: i64) -> bool {
        if start >= end {
            return true;
        }
        self.spans.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// Drop everything before time `t`.
    pub fn remove_before(&mut self, t: i64) {
        self.spans.retain_mut(|span| {
            span.0 = span.0.max(t);
            span.0 < span.1
        });
    }

    /// The parts of `[start, end)` not in the set.
    pub fn subtract(&self, start: i64, end: i64) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        let mut cur = start;
        for &(s, e) in &self.spans {
            if e <= cur {
                continue;
            }
            if s >= end {
                break;
            }
            if s > cur {
                out.push((cur, s.min(end)));
            }
            cur = cur.max(e);
            if cur >= end {
                break;
            }
        }
        if cur < end {
            out.push((cur, end));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Signal buffer
// ---------------------------------------------------------------------------

/// Staged sample chunks per signal, each a (start-time, bytes) pair in a
/// min-heap so overlapping and out-of-order arrivals sort themselves.
#[derive(Default)]
pub struct SignalBuffer {
    signals: HashMap<WaveAttr, (i64, BinaryHeap<Reverse<(i64, Vec<u8>)>>)>,
}

impl SignalBuffer {
    pub fn add_signal(&mut self, signal: &WaveAttr, tps: i64, start: i64, samples: Vec<u8>) {
        if samples.is_empty() {
            return;
        }
        let entry = self
            .signals
            .entry(signal.clone())
            .or_insert_with(|| (tps, BinaryHeap::new()));
        entry.1.push(Reverse((start, samples)));
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Drop all data before time `t`.
    pub fn truncate_before(&mut self, t: i64) {
        let mut dropped = Vec::new();
        for (signal, (tps, heap)) in &mut self.signals {
            let tps = *tps;
            loop {
                match heap.peek() {
                    Some(Reverse((start, _))) if *start <= t - tps => {}
                    _ => break,
                }
                let Reverse((start, samples)) = heap.pop().expect("peeked");
                let skip = (t - start).div_euclid(tps);
                if (samples.len() as i64) > skip * 2 {
                    let new_start = start + skip * tps;
                    let rest = samples[(skip * 2) as usize..].to_vec();
                    heap.push(Reverse((new_start, rest)));
                }
            }
            if heap.is_empty() {
                dropped.push(signal.clone());
            }
        }
        for signal in dropped {
            self.signals.remove(&signal);
        }
    }

    /// The longest chunk from the start of the buffer over which the
    /// available signal set does not change: (start, end, data).
    pub fn get_signals(&self) -> Option<(i64, i64, HashMap<WaveAttr, Vec<u8>>)> {
        let start = self
            .signals
            .values()
            .filter_map(|(_, heap)| heap.peek().map(|Reverse((s, _))| *s))
            .min()?;

        let mut end = i64::MAX;
        let mut data = HashMap::new();
        for (signal, (tps, heap)) in &self.signals {
            let Some(Reverse((s, samples))) = heap.peek() else {
                continue;
            };
            if *s == start {
                let chunk_end = s + (samples.len() as i64) / 2 * tps;
                end = end.min(chunk_end);
                data.insert(signal.clone(), samples.clone());
            } else {
                // This signal starts later; the set changes there.
                end = end.min(*s);
            }
        }
        if end <= start {
            return None;
        }
        Some((start, end, data))
    }
}

// ---------------------------------------------------------------------------
// Units and descriptions
// ---------------------------------------------------------------------------

/// Physio-id families with conventional units and naming.
const BASE_ECG: i64 = 131328;
const BASE_PRESSURE: i64 = 150016;
const BASE_PLETH: i64 = 150452;

/// Units and description strings for a signal's header line.
pub fn signal_units_desc(attr: &WaveAttr) -> (String, String) {
    let mut units = match attr.unit_label.as_deref() {
        Some("") => Some("NU".to_owned()),
        Some(label) => Some(sanitize_units(label)),
        None => None,
    };
    let mut desc = match attr.label.as_deref() {
        Some("") | None => None,
        Some(label) => Some(sanitize_desc(label)),
    };
    let physio = attr.physio_id.unwrap_or(0);
    match attr.base_physio_id {
        Some(BASE_ECG) => {
            units = units.or_else(|| Some("mV".to_owned()));
            desc = desc.or_else(|| Some(format!("ECG #{physio}")));
        }
        Some(BASE_PRESSURE) => {
            units = units.or_else(|| Some("mmHg".to_owned()));
            desc = desc.or_else(|| Some(format!("Pressure #{physio}")));
        }
        Some(BASE_PLETH) => {
            units = units.or_else(|| Some("NU".to_owned()));
            desc = desc.or_else(|| Some(format!("Pleth #{physio}")));
        }
        _ => {
            units = units.or_else(|| Some("unknown".to_owned()));
            desc = desc.or_else(|| {
                Some(format!(
                    "#{}/{}",
                    attr.base_physio_id.unwrap_or(0),
                    physio
                ))
            });
        }
    }
    (units.unwrap_or_default(), desc.unwrap_or_default())
}

/// File-name-safe form of a signal description for `_wq_` logs.
fn quality_log_name(attr: &WaveAttr) -> String {
    let (_, desc) = signal_units_desc(attr);
    format!("_wq_{}", desc.replace(['/', ' '], "_"))
}

// ---------------------------------------------------------------------------
// Per-record output state
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct WaveOutputInfo {
    signal_buffer: SignalBuffer,
    /// Time ranges currently staged in the buffer, per signal. Replayed
    /// messages must not stage (and later write) the same range twice.
    staged: HashMap<WaveAttr, IntervalSet>,
    /// Horizon of buffered-but-unwritten data.
    pending_start: Option<i64>,
    pending_end: Option<i64>,
    segment_name: Option<String>,
    signal_file: Option<String>,
    segment_start: Option<i64>,
    segment_end: Option<i64>,
    segment_signals: Vec<WaveAttr>,
    frame_offset: HashMap<WaveAttr, i64>,
    frame_size: i64,
    saved_intervals: IntervalSet,
    /// Per-signal running statistics for the segment header.
    sample_min: Vec<i64>,
    sample_max: Vec<i64>,
    sample_sum: Vec<u16>,
}

impl WaveOutputInfo {
    /// Resume output state from the record's property store.
    pub fn load(record: &mut ArchiveRecord) -> std::io::Result<WaveOutputInfo> {
        let mut info = WaveOutputInfo::default();

        if let Some(saved) = record.get_property(&["waves", "saved_intervals"]) {
            let pairs: Vec<(i64, i64)> =
                serde_json::from_value(saved.clone()).unwrap_or_default();
            info.saved_intervals = IntervalSet::from_pairs(pairs);
        }

        let signal_file = record.get_str_property(&["waves", "signal_file"]);
        let resumed = (|| -> Option<()> {
            let signals_json = record.get_property(&["waves", "signals"])?.clone();
            let signals: Vec<WaveAttr> = serde_json::from_value(signals_json).ok()?;
            if signals.is_empty() {
                return None;
            }
            let segment_name = record.get_str_property(&["waves", "segment_name"])?;
            let segment_start = record.get_int_property(&["waves", "segment_start"])?;
            let segment_end = record.get_int_property(&["waves", "segment_end"])?;
            let sample_min: Vec<i64> =
                serde_json::from_value(record.get_property(&["waves", "sample_min"])?.clone())
                    .ok()?;
            let sample_max: Vec<i64> =
                serde_json::from_value(record.get_property(&["waves", "sample_max"])?.clone())
                    .ok()?;
            let sample_sum: Vec<u16> =
                serde_json::from_value(record.get_property(&["waves", "sample_sum"])?.clone())
                    .ok()?;
            if sample_min.len() != signals.len()
                || sample_max.len() != signals.len()
                || sample_sum.len() != signals.len()
            {
                return None;
            }
            let mut frame_size = 0;
            let mut frame_offset = HashMap::new();
            for attr in &signals {
                let tps = attr.sample_period.filter(|t| *t > 0)?;
                frame_offset.insert(attr.clone(), frame_size);
                frame_size += samples_per_frame(tps);
            }
            info.signal_file = signal_file.clone();
            info.segment_name = Some(segment_name);
            info.segment_start = Some(segment_start);
            info.segment_end = Some(segment_end);
            info.segment_signals = signals;
            info.frame_offset = frame_offset;
            info.frame_size = frame_size;
            info.sample_min = sample_min;
            info.sample_max = sample_max;
            info.sample_sum = sample_sum;
            Some(())
        })();

        if resumed.is_none() {
            if signal_file.is_some() {
                warn!("unable to resume signal output in {}", record.path().display());
            }
            info.clear_segment_state(record);
        }
        Ok(info)
    }

    fn clear_segment_state(&mut self, record: &mut ArchiveRecord) {
        self.segment_name = None;
        self.signal_file = None;
        self.segment_start = None;
        self.segment_end = None;
        self.segment_signals = Vec::new();
        self.frame_offset = HashMap::new();
        self.frame_size = 0;
        self.sample_min = Vec::new();
        self.sample_max = Vec::new();
        self.sample_sum = Vec::new();
        self.store_props(record);
    }

    /// Persist the resumable output state into the property store.
    pub fn store_props(&self, record: &mut ArchiveRecord) {
        record.set_property(
            &["waves", "signals"],
            serde_json::to_value(&self.segment_signals).unwrap_or_else(|_| json!([])),
        );
        record.set_property(&["waves", "signal_file"], json!(self.signal_file));
        record.set_property(&["waves", "segment_name"], json!(self.segment_name));
        record.set_property(&["waves", "segment_start"], json!(self.segment_start));
        record.set_property(&["waves", "segment_end"], json!(self.segment_end));
        record.set_property(
            &["waves", "saved_intervals"],
            json!(self.saved_intervals.spans()),
        );
        record.set_property(&["waves", "sample_min"], json!(self.sample_min));
        record.set_property(&["waves", "sample_max"], json!(self.sample_max));
        record.set_property(&["waves", "sample_sum"], json!(self.sample_sum));
    }

    pub fn saved_intervals(&self) -> &IntervalSet {
        &self.saved_intervals
    }

    // -----------------------------------------------------------------------
    // Segments
    // -----------------------------------------------------------------------

    fn open_segment(
        &mut self,
        record: &mut ArchiveRecord,
        start: i64,
        signals: Vec<WaveAttr>,
    ) -> Result<(), HandlerError> {
        self.close_segment(record)?;

        let name = format!("{start:09}");
        let mut frame_size = 0;
        let mut frame_offset = HashMap::new();
        for attr in &signals {
            let tps = attr
                .sample_period
                .filter(|t| *t > 0)
                .ok_or_else(|| HandlerError::bug("signal without a sample period"))?;
            frame_offset.insert(attr.clone(), frame_size);
            frame_size += samples_per_frame(tps);
        }

        self.sample_min = vec![i64::MAX; signals.len()];
        self.sample_max = vec![i64::MIN; signals.len()];
        self.sample_sum = vec![0; signals.len()];
        self.signal_file = Some(format!("{name}.dat"));
        self.segment_name = Some(name);
        self.segment_start = Some(start);
        self.segment_end = Some(start);
        self.segment_signals = signals;
        self.frame_offset = frame_offset;
        self.frame_size = frame_size;
        self.store_props(record);
        Ok(())
    }

    /// Close the current segment: write its header (computed from the
    /// observed sample statistics) and release the data file.
    pub fn close_segment(&mut self, record: &mut ArchiveRecord) -> Result<(), HandlerError> {
        let (Some(segment_name), Some(signal_file)) =
            (self.segment_name.clone(), self.signal_file.clone())
        else {
            return Ok(());
        };
        if !self.segment_signals.is_empty() {
            let start = self.segment_start.unwrap_or(0);
            let end = self.segment_end.unwrap_or(start);
            let nframes = u64::try_from((end - start + TPF - 1).div_euclid(TPF)).unwrap_or(0);
            let mut header = SegmentHeader {
                name: segment_name.clone(),
                ffreq: FFREQ,
                cfreq: CFREQ,
                #[allow(clippy::cast_precision_loss)]
                basecount: start as f64,
                nframes: Some(nframes),
                signals: Vec::new(),
                info: Vec::new(),
                min_version: Vec::new(),
            };
            for (idx, attr) in self.segment_signals.iter().enumerate() {
                let sig = self.signal_header_info(attr, idx, &signal_file)?;
                if sig.spf > 1 {
                    header.min_version = header.min_version.max(vec![10, 6]);
                }
                push_signal_info_lines(&mut header.info, attr);
                header.signals.push(sig);
            }
            let hea = record.path().join(format!("{segment_name}.hea"));
            header
                .write(&hea, true)
                .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        }
        record.close_file(&signal_file)?;
        self.clear_segment_state(record);
        Ok(())
    }

    fn signal_header_info(
        &self,
        attr: &WaveAttr,
        idx: usize,
        signal_file: &str,
    ) -> Result<SignalInfo, HandlerError> {
        let tps = attr
            .sample_period
            .filter(|t| *t > 0)
            .ok_or_else(|| HandlerError::bug("signal without a sample period"))?;
        let (units, desc) = signal_units_desc(attr);

        let csl = attr.calibration_scaled_lower.unwrap_or(0);
        let csu = attr.calibration_scaled_upper.unwrap_or(0);
        let cal = attr
            .calibration_abs_lower
            .as_ref()
            .and_then(dwc_core::DwcDecimal::to_f64)
            .unwrap_or(0.0);
        let cau = attr
            .calibration_abs_upper
            .as_ref()
            .and_then(dwc_core::DwcDecimal::to_f64)
            .unwrap_or(0.0);
        let (gain, baseline) =
            if csl != csu && cal != cau && csl != 0 && csu != 0 && cal != 0.0 && cau != 0.0 {
                #[allow(clippy::cast_precision_loss)]
                let gain = (csu - csl) as f64 / (cau - cal);
                let baseline = if attr.base_physio_id == Some(BASE_ECG) {
                    // ECG calibration points straddle zero; the baseline
                    // is their midpoint.
                    (csl + csu).div_euclid(2)
                } else {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        (csl as f64 - cal * gain).round() as i64
                    }
                };
                (gain, baseline)
            } else {
                (1.0, 0)
            };

        let (adcres, adczero) = adc_range(self.sample_min[idx], self.sample_max[idx]);
        Ok(SignalInfo {
            fname: signal_file.to_owned(),
            fmt: 16,
            spf: u32::try_from(samples_per_frame(tps)).unwrap_or(1),
            skew: 0,
            start: 0,
            gain,
            baseline,
            units: Some(units),
            adcres,
            adczero,
            initval: 0,
            cksum: i64::from(self.sample_sum[idx] as i16),
            bsize: 0,
            desc,
        })
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Flush buffered data up to `end`, writing homogeneous chunks and
    /// extending `saved_intervals`. Returns whether anything was written.
    pub fn write_pending(
        &mut self,
        record: &mut ArchiveRecord,
        end: i64,
    ) -> Result<bool, HandlerError> {
        let mut wrote = false;
        loop {
            let Some((start, chunk_end, data)) = self.signal_buffer.get_signals() else {
                break;
            };
            if start >= end {
                break;
            }
            let chunk_end = chunk_end.min(end);
            if chunk_end <= start {
                break;
            }
            self.write_signals(record, start, chunk_end, &data)?;
            self.saved_intervals.add(start, chunk_end);
            self.signal_buffer.truncate_before(chunk_end);
            for staged in self.staged.values_mut() {
                staged.remove_before(chunk_end);
            }
            wrote = true;
        }
        match (self.pending_start, self.pending_end) {
            (Some(_), Some(pe)) if end >= pe => {
                self.pending_start = None;
                self.pending_end = None;
            }
            (Some(ps), Some(_)) => self.pending_start = Some(ps.max(end)),
            _ => {}
        }
        if wrote {
            self.store_props(record);
        }
        Ok(wrote)
    }

    fn write_signals(
        &mut self,
        record: &mut ArchiveRecord,
        start: i64,
        end: i64,
        data: &HashMap<WaveAttr, Vec<u8>>,
    ) -> Result<(), HandlerError> {
        let mut signals: Vec<WaveAttr> = data.keys().cloned().collect();
        signals.sort();

        let needs_new_segment = signals != self.segment_signals
            || self.segment_end.is_none()
            || self.segment_start.is_none_or(|s| start < s)
            || self.segment_end.is_some_and(|e| start > e);
        if needs_new_segment {
            self.open_segment(record, start, signals.clone())?;
        }

        let signal_file = self
            .signal_file
            .clone()
            .ok_or_else(|| HandlerError::bug("segment has no data file"))?;
        let segment_start = self.segment_start.unwrap_or(start);

        for signal in &signals {
            let samples = &data[signal];
            let tps = signal
                .sample_period
                .filter(|t| *t > 0)
                .ok_or_else(|| HandlerError::bug("signal without a sample period"))?;
            let spf = samples_per_frame(tps);
            let offset = *self
                .frame_offset
                .get(signal)
                .ok_or_else(|| HandlerError::bug("signal missing from frame layout"))?;
            let idx = self
                .segment_signals
                .iter()
                .position(|s| s == signal)
                .ok_or_else(|| HandlerError::bug("signal missing from segment"))?;

            let t0 = (start - segment_start).div_euclid(tps);
            let n = ((end - start).div_euclid(tps)).min((samples.len() / 2) as i64);
            let substitute_zero = signal.scale_lower.is_some_and(|s| s > 0);

            let file = record.open_bin_file(&signal_file, None)?;
            for i in 0..n {
                let sample_idx = t0 + i;
                let frame = sample_idx.div_euclid(spf);
                let sub = sample_idx.rem_euclid(spf);
                let ind = frame * self.frame_size + offset + sub;
                let src = &samples[(i * 2) as usize..(i * 2 + 2) as usize];
                // A raw 0x0000 means "no sample" for signals whose valid
                // range excludes zero; it is stored as -32768 so the
                // header's minimum marks the absence code.
                let out: [u8; 2] = if substitute_zero && src == [0, 0] {
                    [0x00, 0x80]
                } else {
                    [src[0], src[1]]
                };
                let pos = u64::try_from(ind * 2)
                    .map_err(|_| HandlerError::bug("sample position before segment start"))?;
                file.write(pos, &out, None)?;

                let value = i64::from(i16::from_le_bytes(out));
                self.sample_min[idx] = self.sample_min[idx].min(value);
                self.sample_max[idx] = self.sample_max[idx].max(value);
                self.sample_sum[idx] =
                    self.sample_sum[idx].wrapping_add(u16::from_le_bytes(out));
            }
        }

        if self.segment_end.is_none_or(|e| end > e) {
            self.segment_end = Some(end);
        }
        Ok(())
    }
}

/// Smallest ADC resolution whose symmetric or non-negative range covers
/// the observed samples, and the midpoint of that range.
fn adc_range(min: i64, max: i64) -> (u32, i64) {
    if min > max {
        return (0, 0);
    }
    if min >= 0 {
        let mut k = 0;
        while max > (1i64 << k) - 1 {
            k += 1;
        }
        let zero = if k == 0 { 0 } else { ((1i64 << k) - 1) / 2 };
        (k, zero)
    } else {
        let mut k = 1;
        while min < -(1i64 << (k - 1)) || max > (1i64 << (k - 1)) - 1 {
            k += 1;
        }
        (k, 0)
    }
}

fn push_signal_info_lines(info: &mut Vec<String>, attr: &WaveAttr) {
    let (_, desc) = signal_units_desc(attr);
    if attr.base_physio_id == Some(BASE_ECG) {
        if let Some(channel) = attr.channel {
            info.push(format!("{desc}: channel {channel}"));
        }
    }
    if attr.is_derived == Some(true) {
        info.push(format!("{desc}: derived"));
    }
    if let (Some(low), Some(high)) = (&attr.low_edge_frequency, &attr.high_edge_frequency) {
        info.push(format!("{desc}: bandpass {low}-{high} Hz"));
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct WaveSampleHandler {
    archive: Rc<RefCell<Archive>>,
    db: Rc<RefCell<DwcDb>>,
    info: HashMap<PathBuf, (Rc<RefCell<ArchiveRecord>>, WaveOutputInfo)>,
}

impl WaveSampleHandler {
    pub fn new(archive: Rc<RefCell<Archive>>, db: Rc<RefCell<DwcDb>>) -> WaveSampleHandler {
        WaveSampleHandler {
            archive,
            db,
            info: HashMap::new(),
        }
    }
}

/// Record the message's quality events (paced pulses, invalid and
/// unavailable intervals) in the signal's `_wq_` log, in record-relative
/// counter time.
fn log_quality(
    record: &mut ArchiveRecord,
    attr: &WaveAttr,
    m: &WaveSampleMessage,
    msg_start: i64,
    tps: i64,
) -> Result<(), HandlerError> {
    let nsamples = (m.wave_samples.len() / 2) as i64;
    let paced = parse_sample_list(m.paced_pulses.as_deref());
    let invalid = parse_interval_list(m.invalid_samples.as_deref());
    let unavailable = parse_interval_list(m.unavailable_samples.as_deref());
    if paced.is_empty() && invalid.is_empty() && unavailable.is_empty() {
        return Ok(());
    }

    let name = quality_log_name(attr);
    let logfile = record.open_log_file(&name)?;
    logfile.append(&format!("S{}", m.sequence_number))?;
    for p in paced {
        logfile.append(&format!("P{}", msg_start + p * tps))?;
    }
    for (prefix, intervals) in [('I', &invalid), ('U', &unavailable)] {
        for &(a, b) in intervals {
            if a <= b && a < nsamples {
                let t0 = msg_start + a.max(0) * tps;
                let t1 = msg_start + (b.min(nsamples - 1) + 1) * tps;
                logfile.append(&format!("{prefix}{t0} {t1}"))?;
            }
        }
    }
    Ok(())
}

impl Handler for WaveSampleHandler {
    fn name(&self) -> &'static str {
        "WaveSampleHandler"
    }

    fn send_message(
        &mut self,
        _channel: &Channel,
        msg: &Message,
        decisions: &mut Decisions,
        ttl: i64,
    ) -> Result<(), HandlerError> {
        let Message::WaveSample(m) = msg else {
            return Ok(());
        };
        decisions.nack();

        let attr = self
            .db
            .borrow_mut()
            .get_wave_attr(m.wave_id)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let record_rc = {
            let mut db = self.db.borrow_mut();
            self.archive.borrow_mut().get_record(msg, ttl <= 0, &mut db)?
        };
        let Some(record_rc) = record_rc else {
            return Ok(());
        };
        let mut record = record_rc.borrow_mut();

        if record.dump_message(msg)? {
            decisions.ack();
            return Ok(());
        }

        // Wave samples carry the authoritative (seqnum, timestamp)
        // pairing; every other stream leans on the map built here.
        record.set_time(m.sequence_number, &m.timestamp);

        let tps = attr
            .sample_period
            .filter(|t| *t > 0)
            .ok_or_else(|| HandlerError::bug("wave attribute has no sample period"))?;
        let nsamples = (m.wave_samples.len() / 2) as i64;

        let s0 = match record.seqnum0() {
            Some(s0) => s0,
            None => {
                record.set_seqnum0(m.sequence_number);
                m.sequence_number
            }
        };
        let mut msg_start = m.sequence_number - s0;
        msg_start -= msg_start.rem_euclid(tps);
        let msg_end = msg_start + nsamples * tps;

        let key = record.path().to_path_buf();
        let entry = match self.info.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let info = WaveOutputInfo::load(&mut record)?;
                v.insert((Rc::clone(&record_rc), info))
            }
        };
        let info = &mut entry.1;

        // Stage the valid slices not already written or already staged.
        let valid = valid_sample_intervals(m);
        let mut buffered = false;
        for &(vs, ve) in &valid {
            let t0 = msg_start + vs * tps;
            let t1 = msg_start + ve * tps;
            for (a0, b0) in info.saved_intervals.subtract(t0, t1) {
                let staged = info.staged.entry(attr.clone()).or_default();
                for (a, b) in staged.subtract(a0, b0) {
                    staged.add(a, b);
                    let si = (a - msg_start).div_euclid(tps);
                    let ei = (b - msg_start).div_euclid(tps);
                    info.signal_buffer.add_signal(
                        &attr,
                        tps,
                        a,
                        m.wave_samples[(si * 2) as usize..(ei * 2) as usize].to_vec(),
                    );
                    buffered = true;
                }
            }
        }
        if buffered {
            log_quality(&mut record, &attr, m, msg_start, tps)?;
        }

        let mut wrote = false;
        if buffered {
            match (info.pending_start, info.pending_end) {
                (Some(ps), Some(pe)) => {
                    if msg_start > pe {
                        // Forward gap: settle the old window, start anew.
                        wrote |= info.write_pending(&mut record, pe)?;
                        info.pending_start = Some(msg_start);
                        info.pending_end = Some(msg_end);
                    } else {
                        // Overlap (or touching): everything before this
                        // message's start now has its full signal set.
                        if msg_start > ps {
                            wrote |= info.write_pending(&mut record, msg_start)?;
                        }
                        info.pending_start =
                            Some(info.pending_start.map_or(msg_start, |p| p.min(msg_start)));
                        info.pending_end = Some(pe.max(msg_end));
                    }
                }
                _ => {
                    info.pending_start = Some(msg_start);
                    info.pending_end = Some(msg_end);
                }
            }
        }

        if ttl <= 0 {
            // Last chance: force out everything buffered.
            if let Some(pe) = info.pending_end {
                wrote |= info.write_pending(&mut record, pe.max(msg_end))?;
            }
        }

        let covered = valid.iter().all(|&(vs, ve)| {
            info.saved_intervals
                .covers(msg_start + vs * tps, msg_start + ve * tps)
        });
        if covered {
            decisions.ack();
        } else if wrote {
            decisions.nack_replay();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), HandlerError> {
        // Records the archive no longer tracks have been finalized;
        // their output state is dead weight here.
        self.info.retain(|_, (rc, _)| Rc::strong_count(rc) > 1);
        for (rc, info) in self.info.values_mut() {
            let mut record = rc.borrow_mut();
            info.store_props(&mut record);
        }
        self.archive.borrow_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr_with_period(tps: i64) -> WaveAttr {
        let mut attr = dwc_core::attr::undefined_wave();
        attr.sample_period = Some(tps);
        attr.base_physio_id = Some(BASE_ECG);
        attr.physio_id = Some(131_329);
        attr
    }

    #[test]
    fn interval_set_merges_and_subtracts() {
        let mut set = IntervalSet::default();
        set.add(0, 10);
        set.add(20, 30);
        set.add(10, 20);
        assert_eq!(set.spans(), &[(0, 30)]);
        assert!(set.covers(5, 25));
        assert!(!set.covers(5, 35));
        assert_eq!(set.subtract(25, 40), vec![(30, 40)]);
        assert_eq!(set.subtract(-5, 5), vec![(-5, 0)]);
        assert_eq!(set.subtract(0, 30), Vec::<(i64, i64)>::new());
    }

    #[test]
    fn valid_intervals_exclude_both_marker_kinds_independently() {
        let m = WaveSampleMessage {
            origin: dwc_core::Origin::new("test"),
            wave_id: 1,
            timestamp: "2017-03-01 12:00:00.000 +00:00".parse().unwrap(),
            sequence_number: 0,
            wave_samples: vec![0; 20], // ten samples
            unavailable_samples: Some("8 9".to_owned()),
            invalid_samples: Some("0 1".to_owned()),
            paced_pulses: None,
            mapping_id: uuid::Uuid::nil(),
        };
        assert_eq!(valid_sample_intervals(&m), vec![(2, 8)]);
    }

    #[test]
    fn signal_buffer_returns_homogeneous_prefix() {
        let a = attr_with_period(8);
        let mut b = attr_with_period(16);
        b.physio_id = Some(150_017);
        let mut buffer = SignalBuffer::default();
        buffer.add_signal(&a, 8, 0, vec![1, 0, 2, 0]); // covers [0, 16)
        buffer.add_signal(&b, 16, 16, vec![9, 0]); // covers [16, 32)

        let (start, end, data) = buffer.get_signals().expect("chunk");
        assert_eq!((start, end), (0, 16));
        assert_eq!(data.len(), 1);
        assert!(data.contains_key(&a));

        buffer.truncate_before(16);
        let (start, end, data) = buffer.get_signals().expect("chunk");
        assert_eq!((start, end), (16, 32));
        assert!(data.contains_key(&b));
    }

    #[test]
    fn signal_buffer_truncate_trims_partial_chunks() {
        let a = attr_with_period(8);
        let mut buffer = SignalBuffer::default();
        buffer.add_signal(&a, 8, 0, vec![1, 0, 2, 0, 3, 0, 4, 0]); // [0, 32)
        buffer.truncate_before(16);
        let (start, end, data) = buffer.get_signals().expect("chunk");
        assert_eq!((start, end), (16, 32));
        assert_eq!(data[&a], vec![3, 0, 4, 0]);
    }

    #[test]
    fn adc_range_prefers_the_tightest_fit() {
        assert_eq!(adc_range(i64::MAX, i64::MIN), (0, 0));
        assert_eq!(adc_range(0, 255), (8, 127));
        assert_eq!(adc_range(0, 256), (9, 255));
        assert_eq!(adc_range(-128, 127), (8, 0));
        assert_eq!(adc_range(-129, 0), (9, 0));
        assert_eq!(adc_range(-32768, 32767), (16, 0));
    }

    #[test]
    fn ecg_units_default_to_millivolts() {
        let attr = attr_with_period(8);
        let (units, desc) = signal_units_desc(&attr);
        assert_eq!(units, "mV");
        assert_eq!(desc, "ECG #131329");
    }
}
