//! WFDB header files.
//!
//! Reads and writes the subset of the header format this archive
//! produces: a record line `<name> <nsig> <ffreq>[/<cfreq>[(<basecount>)]]
//! <nframes>`, per-signal lines
//! `<fname> <fmt>[x<spf>][:<skew>][:<start>] <gain>[(<baseline>)][/<units>]
//! <adcres> <adczero> <initval> <cksum> <bsize> <desc>`, comment info
//! lines, and the `#wfdb <version>` pragma.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::{Result, WfdbError};

/// Parse a dotted version string into a comparable tuple.
pub fn str_to_version(s: &str) -> Vec<u32> {
    s.split('.').filter_map(|n| n.parse().ok()).collect()
}

/// Format a version tuple as a dotted string.
pub fn version_to_str(v: &[u32]) -> String {
    v.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Shortest-round-trip decimal formatting (the `%.16g` role).
pub fn format_g(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e16 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

// ---------------------------------------------------------------------------
// Signal descriptions
// ---------------------------------------------------------------------------

/// One signal line of a header file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalInfo {
    pub fname: String,
    pub fmt: u32,
    /// Samples per frame.
    pub spf: u32,
    pub skew: u32,
    pub start: u32,
    pub gain: f64,
    pub baseline: i64,
    pub units: Option<String>,
    pub adcres: u32,
    pub adczero: i64,
    pub initval: i64,
    pub cksum: i64,
    pub bsize: i64,
    pub desc: String,
}

// ---------------------------------------------------------------------------
// Segment headers
// ---------------------------------------------------------------------------

/// A single-segment header: the record line plus its signal lines.
#[derive(Debug, Clone, Default)]
pub struct SegmentHeader {
    pub name: String,
    pub ffreq: f64,
    pub cfreq: f64,
    pub basecount: f64,
    pub nframes: Option<u64>,
    pub signals: Vec<SignalInfo>,
    /// Trailing comment lines (without the `#`).
    pub info: Vec<String>,
    /// Minimum WFDB library version needed to read the file.
    pub min_version: Vec<u32>,
}

fn freq_spec_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^/()]+)(?:/([^/()]+)(?:\(([^/()]+)\))?)?$").expect("static regex")
    })
}

fn gain_spec_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^()/]+)(?:\(([^()/]+)\))?(?:/(.*))?$").expect("static regex"))
}

/// Split a line into at most `max` whitespace-separated fields; the last
/// field keeps its internal spaces.
fn split_fields(line: &str, max: usize) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut rest = line.trim();
    while fields.len() + 1 < max {
        let Some(end) = rest.find(char::is_whitespace) else {
            break;
        };
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if !rest.is_empty() {
        fields.push(rest);
    }
    fields
}

/// Parse `<fmt>[x<spf>][:<skew>][:<start>]`.
fn parse_fmt_spec(spec: &str) -> Option<(u32, u32, u32, u32)> {
    let digits = |s: &str| -> (Option<u32>, usize) {
        let n = s.bytes().take_while(u8::is_ascii_digit).count();
        (s[..n].parse().ok(), n)
    };
    let (fmt, n) = digits(spec);
    let fmt = fmt?;
    let mut rest = &spec[n..];
    let mut spf = 1;
    if let Some(r) = rest.strip_prefix('x') {
        let (v, n) = digits(r);
        spf = v?;
        rest = &r[n..];
    }
    let mut colon_vals = [0u32; 2];
    for slot in &mut colon_vals {
        if let Some(r) = rest.strip_prefix(':') {
            let (v, n) = digits(r);
            *slot = v?;
            rest = &r[n..];
        }
    }
    if !rest.is_empty() {
        return None;
    }
    Some((fmt, spf, colon_vals[0], colon_vals[1]))
}

impl SegmentHeader {
    /// Read and parse a header file.
    pub fn read(path: &Path) -> Result<SegmentHeader> {
        let text = std::fs::read_to_string(path)?;
        let mut header = SegmentHeader::default();
        let mut lines = text.lines();
        let mut nsig = 0usize;

        for line in lines.by_ref() {
            if let Some(version) = line.strip_prefix("#wfdb") {
                header.min_version = str_to_version(version.trim());
                continue;
            }
            let fields = split_fields(line, usize::MAX);
            if fields.is_empty() || fields[0].starts_with('#') {
                continue;
            }
            if fields[0].contains('/') || fields.len() < 4 {
                return Err(WfdbError::Format(format!(
                    "unsupported record line in {}",
                    path.display()
                )));
            }
            header.name = fields[0].to_owned();
            nsig = fields[1]
                .parse()
                .map_err(|_| WfdbError::Format("bad signal count".to_owned()))?;
            let caps = freq_spec_re()
                .captures(fields[2])
                .ok_or_else(|| WfdbError::Format("bad frequency spec".to_owned()))?;
            header.ffreq = caps[1]
                .parse()
                .map_err(|_| WfdbError::Format("bad frame frequency".to_owned()))?;
            header.cfreq = match caps.get(2) {
                Some(c) => c
                    .as_str()
                    .parse()
                    .map_err(|_| WfdbError::Format("bad counter frequency".to_owned()))?,
                None => header.ffreq,
            };
            header.basecount = match caps.get(3) {
                Some(c) => c
                    .as_str()
                    .parse()
                    .map_err(|_| WfdbError::Format("bad base counter".to_owned()))?,
                None => 0.0,
            };
            header.nframes = Some(
                fields[3]
                    .parse()
                    .map_err(|_| WfdbError::Format("bad frame count".to_owned()))?,
            );
            break;
        }

        for line in lines {
            let fields = split_fields(line, 9);
            if fields.is_empty() {
                continue;
            }
            if fields[0].starts_with('#') {
                let text = line[line.find('#').unwrap_or(0) + 1..].trim_end();
                header.info.push(text.to_owned());
                continue;
            }
            if fields.len() != 9 {
                return Err(WfdbError::Format(format!(
                    "unsupported signal line in {}: {line:?}",
                    path.display()
                )));
            }
            let mut sig = SignalInfo {
                fname: fields[0].to_owned(),
                ..SignalInfo::default()
            };
            let (fmt, spf, skew, start) = parse_fmt_spec(fields[1])
                .ok_or_else(|| WfdbError::Format(format!("bad format spec {:?}", fields[1])))?;
            sig.fmt = fmt;
            sig.spf = spf;
            sig.skew = skew;
            sig.start = start;
            let caps = gain_spec_re()
                .captures(fields[2])
                .ok_or_else(|| WfdbError::Format(format!("bad gain spec {:?}", fields[2])))?;
            sig.gain = caps[1]
                .parse()
                .map_err(|_| WfdbError::Format("bad gain".to_owned()))?;
            sig.units = caps.get(3).map(|c| c.as_str().to_owned());
            sig.adcres = fields[3]
                .parse()
                .map_err(|_| WfdbError::Format("bad adc resolution".to_owned()))?;
            sig.adczero = fields[4]
                .parse()
                .map_err(|_| WfdbError::Format("bad adc zero".to_owned()))?;
            sig.baseline = match caps.get(2) {
                Some(c) => c
                    .as_str()
                    .parse()
                    .map_err(|_| WfdbError::Format("bad baseline".to_owned()))?,
                None => sig.adczero,
            };
            sig.initval = fields[5]
                .parse()
                .map_err(|_| WfdbError::Format("bad initial value".to_owned()))?;
            sig.cksum = fields[6]
                .parse()
                .map_err(|_| WfdbError::Format("bad checksum".to_owned()))?;
            sig.bsize = fields[7]
                .parse()
                .map_err(|_| WfdbError::Format("bad block size".to_owned()))?;
            sig.desc = fields[8].to_owned();
            header.signals.push(sig);
            header.info.clear();
        }

        if header.signals.len() != nsig {
            return Err(WfdbError::Format(format!(
                "wrong number of signals in {}",
                path.display()
            )));
        }
        Ok(header)
    }

    /// Write the header to a file. The record name is taken from the file
    /// name, which must end in `.hea`.
    pub fn write(&self, path: &Path, fsync: bool) -> Result<()> {
        let recname = record_name_from_path(path)?;
        let mut out = String::new();
        if !self.min_version.is_empty() {
            out.push_str(&format!("#wfdb {}\n", version_to_str(&self.min_version)));
        }
        out.push_str(&format!(
            "{} {} {}",
            recname,
            self.signals.len(),
            format_g(self.ffreq)
        ));
        if self.cfreq != self.ffreq || self.basecount != 0.0 {
            out.push_str(&format!("/{}", format_g(self.cfreq)));
            if self.basecount != 0.0 {
                out.push_str(&format!("({})", format_g(self.basecount)));
            }
        }
        if let Some(nframes) = self.nframes {
            out.push_str(&format!(" {nframes}"));
        }
        out.push('\n');

        for sig in &self.signals {
            out.push_str(&format!("{} {}", sig.fname, sig.fmt));
            if sig.spf != 1 {
                out.push_str(&format!("x{}", sig.spf));
            }
            if sig.skew != 0 {
                out.push_str(&format!(":{}", sig.skew));
            }
            if sig.start != 0 {
                out.push_str(&format!(":{}", sig.start));
            }
            out.push_str(&format!(" {}", format_g(sig.gain)));
            if sig.baseline != sig.adczero {
                out.push_str(&format!("({})", sig.baseline));
            }
            if let Some(units) = &sig.units {
                out.push_str(&format!("/{units}"));
            }
            out.push_str(&format!(
                " {} {} {} {} {} {}\n",
                sig.adcres, sig.adczero, sig.initval, sig.cksum, sig.bsize, sig.desc
            ));
        }
        for info in &self.info {
            out.push_str(&format!("#{info}\n"));
        }

        let mut f = File::create(path)?;
        f.write_all(out.as_bytes())?;
        if fsync {
            f.sync_data()?;
        }
        Ok(())
    }
}

/// Strip directory and the mandatory `.hea` extension from a header path.
pub fn record_name_from_path(path: &Path) -> Result<String> {
    let fname = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    match fname.strip_suffix(".hea") {
        Some(name) if !name.is_empty() => Ok(name.to_owned()),
        _ => Err(WfdbError::Format(format!(
            "invalid header file name {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{SegmentHeader, SignalInfo};

    #[test]
    fn writes_and_reads_back_a_segment_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("000000000.hea");
        let header = SegmentHeader {
            name: "000000000".to_owned(),
            ffreq: 62.5,
            cfreq: 1000.0,
            basecount: 12345.0,
            nframes: Some(4),
            signals: vec![SignalInfo {
                fname: "000000000.dat".to_owned(),
                fmt: 16,
                spf: 2,
                gain: 100.0,
                baseline: -512,
                units: Some("mV".to_owned()),
                adcres: 12,
                adczero: 0,
                desc: "ECG #131329".to_owned(),
                ..SignalInfo::default()
            }],
            info: vec!["channel: 1".to_owned()],
            min_version: Vec::new(),
        };
        header.write(&path, false).expect("write");

        let parsed = SegmentHeader::read(&path).expect("read");
        assert_eq!(parsed.name, "000000000");
        assert_eq!(parsed.ffreq, 62.5);
        assert_eq!(parsed.cfreq, 1000.0);
        assert_eq!(parsed.basecount, 12345.0);
        assert_eq!(parsed.nframes, Some(4));
        assert_eq!(parsed.signals.len(), 1);
        let sig = &parsed.signals[0];
        assert_eq!(sig.fmt, 16);
        assert_eq!(sig.spf, 2);
        assert_eq!(sig.gain, 100.0);
        assert_eq!(sig.baseline, -512);
        assert_eq!(sig.units.as_deref(), Some("mV"));
        assert_eq!(sig.desc, "ECG #131329");
        assert_eq!(parsed.info, vec!["channel: 1".to_owned()]);
    }

    #[test]
    fn desc_may_contain_spaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg.hea");
        std::fs::write(
            &path,
            "seg 1 62.5/1000 16\nseg.dat 16 7(3)/mmHg 10 0 0 0 0 Pressure ART 2\n",
        )
        .expect("write");
        let parsed = SegmentHeader::read(&path).expect("read");
        assert_eq!(parsed.signals[0].desc, "Pressure ART 2");
        assert_eq!(parsed.signals[0].gain, 7.0);
        assert_eq!(parsed.signals[0].baseline, 3);
    }

    #[test]
    fn version_pragma_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg.hea");
        let header = SegmentHeader {
            name: "seg".to_owned(),
            ffreq: 62.5,
            cfreq: 62.5,
            basecount: 0.0,
            nframes: Some(0),
            signals: Vec::new(),
            info: Vec::new(),
            min_version: vec![10, 6],
        };
        header.write(&path, false).expect("write");
        let text = std::fs::read_to_string(&path).expect("read text");
        assert!(text.starts_with("#wfdb 10.6\n"));
        let parsed = SegmentHeader::read(&path).expect("read");
        assert_eq!(parsed.min_version, vec![10, 6]);
    }
}
