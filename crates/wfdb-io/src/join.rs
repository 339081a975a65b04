//! Joining closed segments into a multi-segment record.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::header::{format_g, record_name_from_path, version_to_str, SegmentHeader, SignalInfo};
use crate::{Result, WfdbError};

struct JoinedSignal {
    info: SignalInfo,
    minphys: f64,
    maxphys: f64,
    /// Order of first appearance, to keep a stable pre-sort order.
    first_seen: usize,
}

/// Join a sequence of segments into a multi-segment record.
///
/// All segments must share a frame frequency and counter frequency, and
/// are aligned by their base counter values; holes between segments
/// become `~` gap entries. Every signal (identified by description) must
/// have consistent units, spf, and skew wherever it appears. The layout
/// header lists the union of signals with gain rescaled so the physical
/// range fits an ADC resolution of at most 31 bits.
pub fn join_segments(
    record_header: &Path,
    segment_headers: &[PathBuf],
    layout_suffix: &str,
    fsync: bool,
) -> Result<()> {
    let recdir = record_header.parent().unwrap_or_else(|| Path::new(""));
    let recname = record_name_from_path(record_header)?;

    if segment_headers.is_empty() {
        return Err(WfdbError::Mismatch("no segments provided".to_owned()));
    }

    let layout_name = format!("{recname}{layout_suffix}");

    let mut ffreq: Option<f64> = None;
    let mut cfreq = 0.0;
    let mut signals: BTreeMap<String, JoinedSignal> = BTreeMap::new();
    let mut segments: Vec<(String, u64)> = vec![(layout_name.clone(), 0)];
    // The record is aligned to the first segment's base counter value, so
    // segments whose counter time is negative (data recovered from before
    // the record's zero point) still join cleanly.
    let mut basecount = 0.0;
    let mut origin: Option<i64> = None;
    let mut end: i64 = 0;
    let mut prevsegment = "(start of record)".to_owned();
    let mut min_version: Vec<u32> = Vec::new();

    for (seg_idx, path) in segment_headers.iter().enumerate() {
        let seg = SegmentHeader::read(path)?;
        match ffreq {
            None => {
                ffreq = Some(seg.ffreq);
                cfreq = seg.cfreq;
            }
            Some(f) => {
                if f != seg.ffreq {
                    return Err(WfdbError::Mismatch(format!(
                        "ffreq mismatch in segment {}",
                        seg.name
                    )));
                }
                if cfreq != seg.cfreq {
                    return Err(WfdbError::Mismatch(format!(
                        "cfreq mismatch in segment {}",
                        seg.name
                    )));
                }
            }
        }
        let f = ffreq.unwrap_or(1.0);
        let nframes = seg.nframes.unwrap_or(0);

        #[allow(clippy::cast_possible_truncation)]
        let t_abs = (seg.basecount * f / cfreq) as i64;
        if origin.is_none() {
            origin = Some(t_abs);
            basecount = seg.basecount;
            end = t_abs;
        }
        if t_abs < end {
            return Err(WfdbError::Mismatch(format!(
                "segment {} overlaps with {}",
                seg.name, prevsegment
            )));
        } else if t_abs > end {
            segments.push(("~".to_owned(), u64::try_from(t_abs - end).unwrap_or(0)));
        }
        segments.push((seg.name.clone(), nframes));
        prevsegment = seg.name.clone();
        end = t_abs + i64::try_from(nframes).unwrap_or(0);

        if seg.min_version > min_version {
            min_version = seg.min_version.clone();
        }

        let first_fname = seg.signals.first().map(|s| s.fname.clone());
        for sig in &seg.signals {
            if sig.spf > 1 || Some(&sig.fname) != first_fname.as_ref() {
                min_version = min_version.max(vec![10, 6]);
            }
            if sig.skew != 0 {
                min_version = min_version.max(vec![10, 7]);
            }

            let (adu1, adu2) = if sig.adcres > 0 {
                let half = 1i64 << (sig.adcres - 1);
                (sig.adczero - half, sig.adczero + half - 1)
            } else {
                (sig.adczero, sig.adczero)
            };
            // -32768 marks absent samples and is excluded from the range.
            let adu1 = if adu1 == -32768 { -32767 } else { adu1 };

            #[allow(clippy::cast_precision_loss)]
            let phys1 = (adu1 - sig.baseline) as f64 / sig.gain;
            #[allow(clippy::cast_precision_loss)]
            let phys2 = (adu2 - sig.baseline) as f64 / sig.gain;
            let minphys = phys1.min(phys2);
            let maxphys = phys1.max(phys2);
            let gain = sig.gain.abs();

            match signals.get_mut(&sig.desc) {
                None => {
                    let mut info = sig.clone();
                    info.gain = gain;
                    signals.insert(
                        sig.desc.clone(),
                        JoinedSignal {
                            info,
                            minphys,
                            maxphys,
                            first_seen: seg_idx * 1000 + signals.len(),
                        },
                    );
                }
                Some(old) => {
                    if old.info.spf != sig.spf {
                        return Err(WfdbError::Mismatch(format!("spf mismatch in {}", sig.desc)));
                    }
                    if old.info.skew != sig.skew {
                        return Err(WfdbError::Mismatch(format!(
                            "skew mismatch in {}",
                            sig.desc
                        )));
                    }
                    if old.info.units != sig.units {
                        return Err(WfdbError::Mismatch(format!(
                            "units mismatch in {}",
                            sig.desc
                        )));
                    }
                    old.info.gain = old.info.gain.max(gain);
                    old.minphys = old.minphys.min(minphys);
                    old.maxphys = old.maxphys.max(maxphys);
                }
            }
        }
    }

    // Union of signals, ordered by units class then description.
    let mut joined: Vec<JoinedSignal> = signals.into_values().collect();
    joined.sort_by(|a, b| {
        sort_key(&a.info)
            .cmp(&sort_key(&b.info))
            .then(a.first_seen.cmp(&b.first_seen))
    });

    let mut layout = SegmentHeader {
        name: layout_name.clone(),
        ffreq: ffreq.unwrap_or(0.0),
        cfreq,
        basecount: 0.0,
        nframes: Some(0),
        signals: Vec::new(),
        info: Vec::new(),
        min_version: Vec::new(),
    };

    for joined_sig in &mut joined {
        let sig = &mut joined_sig.info;
        sig.fname = "~".to_owned();
        sig.fmt = 0;
        sig.bsize = 0;
        sig.adczero = 0;
        sig.cksum = 0;
        sig.initval = 0;

        let vrange = (joined_sig.maxphys - joined_sig.minphys) * sig.gain;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let mut adcres = (vrange + 1.0).log2().ceil().max(0.0) as u32;
        while adcres > 31 {
            sig.gain /= 2.0;
            adcres -= 1;
        }
        sig.adcres = adcres;
        sig.adczero = if adcres <= 16 { 0 } else { 1i64 << (adcres - 1) };
        let vmin = sig.adczero - (1i64 << adcres.saturating_sub(1));
        let vmax = vmin + (1i64 << adcres) - 1;

        let tvmin = joined_sig.minphys * sig.gain;
        let tvmax = joined_sig.maxphys * sig.gain;
        #[allow(clippy::cast_precision_loss)]
        if tvmin >= vmin as f64 && tvmax <= vmax as f64 {
            sig.baseline = 0;
        } else {
            #[allow(clippy::cast_possible_truncation)]
            {
                sig.baseline = ((vmax as f64 - tvmax + vmin as f64 - tvmin) / 2.0).round() as i64;
            }
        }
        layout.signals.push(sig.clone());
    }

    let layout_path = recdir.join(format!("{layout_name}.hea"));
    layout.write(&layout_path, fsync)?;

    // Master header referencing the layout plus each segment (and gaps).
    let mut out = String::new();
    if !min_version.is_empty() {
        out.push_str(&format!("#wfdb {}\n", version_to_str(&min_version)));
    }
    out.push_str(&format!("{recname}/{}", segments.len()));
    out.push_str(&format!(" {}", layout.signals.len()));
    out.push_str(&format!(" {}", format_g(layout.ffreq)));
    if cfreq != layout.ffreq || basecount != 0.0 {
        out.push_str(&format!("/{}", format_g(cfreq)));
        if basecount != 0.0 {
            out.push_str(&format!("({})", format_g(basecount)));
        }
    }
    out.push_str(&format!(" {}\n", end - origin.unwrap_or(0)));
    for (name, length) in &segments {
        out.push_str(&format!("{name} {length}\n"));
    }

    let mut f = File::create(record_header)?;
    f.write_all(out.as_bytes())?;
    if fsync {
        f.sync_data()?;
    }
    Ok(())
}

fn sort_key(sig: &SignalInfo) -> (u8, String) {
    match sig.units.as_deref() {
        Some("mV") => (0, sig.desc.clone()),
        Some("mmHg") => (1, sig.desc.clone()),
        _ => (2, sig.desc.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::join_segments;
    use crate::header::{SegmentHeader, SignalInfo};

    fn segment(name: &str, basecount: f64, nframes: u64, desc: &str, units: &str) -> SegmentHeader {
        SegmentHeader {
            name: name.to_owned(),
            ffreq: 62.5,
            cfreq: 1000.0,
            basecount,
            nframes: Some(nframes),
            signals: vec![SignalInfo {
                fname: format!("{name}.dat"),
                fmt: 16,
                spf: 2,
                gain: 100.0,
                baseline: 0,
                units: Some(units.to_owned()),
                adcres: 16,
                adczero: 0,
                desc: desc.to_owned(),
                ..SignalInfo::default()
            }],
            info: Vec::new(),
            min_version: Vec::new(),
        }
    }

    #[test]
    fn joins_contiguous_segments_with_a_gap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seg1 = dir.path().join("000000000.hea");
        let seg2 = dir.path().join("000128000.hea");
        segment("000000000", 0.0, 100, "ECG II", "mV")
            .write(&seg1, false)
            .expect("write seg1");
        // 128000 counter ticks = 8000 frames at 62.5/1000; 100 frames of
        // data leaves a 7900-frame hole.
        segment("000128000", 128_000.0, 50, "ECG II", "mV")
            .write(&seg2, false)
            .expect("write seg2");

        let master = dir.path().join("waves.hea");
        join_segments(&master, &[seg1, seg2], "_layout", false).expect("join");

        let text = std::fs::read_to_string(&master).expect("read master");
        let mut lines = text.lines();
        let record_line = lines.next().expect("record line");
        assert!(record_line.starts_with("waves/4 1 62.5/1000 8050"), "{record_line}");
        assert_eq!(lines.next(), Some("waves_layout 0"));
        assert_eq!(lines.next(), Some("000000000 100"));
        assert_eq!(lines.next(), Some("~ 7900"));
        assert_eq!(lines.next(), Some("000128000 50"));

        let layout = SegmentHeader::read(&dir.path().join("waves_layout.hea")).expect("layout");
        assert_eq!(layout.signals.len(), 1);
        assert_eq!(layout.signals[0].fname, "~");
        assert_eq!(layout.signals[0].desc, "ECG II");
    }

    #[test]
    fn signal_union_is_sorted_units_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seg1 = dir.path().join("a.hea");
        let seg2 = dir.path().join("b.hea");
        segment("a", 0.0, 10, "Pleth", "NU").write(&seg1, false).expect("seg1");
        segment("b", 160.0, 10, "ECG II", "mV").write(&seg2, false).expect("seg2");

        let master = dir.path().join("rec.hea");
        join_segments(&master, &[seg1, seg2], "_layout", false).expect("join");
        let layout = SegmentHeader::read(&dir.path().join("rec_layout.hea")).expect("layout");
        let descs: Vec<&str> = layout.signals.iter().map(|s| s.desc.as_str()).collect();
        assert_eq!(descs, vec!["ECG II", "Pleth"]);
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seg1 = dir.path().join("a.hea");
        let seg2 = dir.path().join("b.hea");
        segment("a", 0.0, 100, "ECG II", "mV").write(&seg1, false).expect("seg1");
        segment("b", 160.0, 100, "ECG II", "mV").write(&seg2, false).expect("seg2");
        let master = dir.path().join("rec.hea");
        assert!(join_segments(&master, &[seg1, seg2], "_layout", false).is_err());
    }

    #[test]
    fn pre_origin_segments_align_to_the_first_base_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seg1 = dir.path().join("-00000160.hea");
        let seg2 = dir.path().join("000000000.hea");
        // Ten frames starting 160 counter ticks before the record zero.
        segment("-00000160", -160.0, 10, "ECG II", "mV")
            .write(&seg1, false)
            .expect("seg1");
        segment("000000000", 0.0, 10, "ECG II", "mV")
            .write(&seg2, false)
            .expect("seg2");

        let master = dir.path().join("rec.hea");
        join_segments(&master, &[seg1, seg2], "_layout", false).expect("join");
        let text = std::fs::read_to_string(&master).expect("master");
        let mut lines = text.lines();
        let record_line = lines.next().expect("record line");
        assert!(record_line.starts_with("rec/3 1 62.5/1000(-160) 20"), "{record_line}");
        assert_eq!(lines.next(), Some("rec_layout 0"));
        assert_eq!(lines.next(), Some("-00000160 10"));
        assert_eq!(lines.next(), Some("000000000 10"));
    }
}
