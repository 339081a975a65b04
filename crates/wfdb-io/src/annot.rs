//! MIT-format annotation files.
//!
//! The stream is a sequence of 16-bit little-endian words. The top six
//! bits of each word are an annotation type code; the low ten bits are
//! data (a time delta for real annotation types). Pseudo-annotation codes
//! carry subtype, channel, annotator number, and aux strings; `SKIP`
//! carries a 32-bit time interval for deltas that do not fit in ten bits.
//! The stream ends with a zero word.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::Result;

/// Annotation type codes (the standard WFDB code table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum AnnotationType {
    NOTQRS = 0,
    NORMAL = 1,
    PVC = 5,
    SVPB = 9,
    PACE = 12,
    UNKNOWN = 13,
    ARFCT = 16,
    NOTE = 22,
    PACESP = 26,
    LEARN = 30,
}

// Pseudo-annotation codes.
const SKIP: u16 = 59;
const NUM: u16 = 60;
const SUB: u16 = 61;
const CHN: u16 = 62;
const AUX: u16 = 63;

/// One annotation to be written.
#[derive(Debug, Clone)]
pub struct Annotation {
    /// Absolute time in counter ticks (must be non-decreasing).
    pub time: i64,
    pub anntyp: AnnotationType,
    pub subtyp: i64,
    pub chan: i64,
    pub num: i64,
    pub aux: Option<Vec<u8>>,
}

impl Default for Annotation {
    fn default() -> Annotation {
        Annotation {
            time: 0,
            anntyp: AnnotationType::NOTE,
            subtyp: 0,
            chan: 0,
            num: 0,
            aux: None,
        }
    }
}

/// Streaming writer for one annotation file.
pub struct Annotator {
    out: BufWriter<File>,
    prev_time: i64,
    prev_chan: i64,
    prev_num: i64,
    closed: bool,
}

impl Annotator {
    /// Create the file. If `afreq` is given, a time-resolution note is
    /// written first so readers know the annotation clock rate.
    pub fn create(path: &Path, afreq: Option<f64>) -> Result<Annotator> {
        let mut annotator = Annotator {
            out: BufWriter::new(File::create(path)?),
            prev_time: 0,
            prev_chan: 0,
            prev_num: 0,
            closed: false,
        };
        if let Some(afreq) = afreq {
            // A NOTQRS word would encode as the terminator, so the
            // resolution note rides on a NOTE annotation at time zero.
            let note = format!("## time resolution: {}", crate::header::format_g(afreq));
            annotator.word(AnnotationType::NOTE as u16, 0)?;
            annotator.aux_words(note.as_bytes())?;
        }
        Ok(annotator)
    }

    /// Append one annotation. Times must be non-decreasing; an earlier
    /// time is clamped to the previous one (the delta becomes zero).
    pub fn put(&mut self, ann: &Annotation) -> Result<()> {
        let delta = (ann.time - self.prev_time).max(0);
        if delta > 1023 {
            self.word(SKIP, 0)?;
            let interval = u32::try_from(delta).unwrap_or(u32::MAX);
            // PDP-11 order: high half first, each half little-endian.
            self.out
                .write_all(&u16::try_from(interval >> 16).unwrap_or(0).to_le_bytes())?;
            self.out
                .write_all(&((interval & 0xffff) as u16).to_le_bytes())?;
            self.word(ann.anntyp as u16, 0)?;
        } else {
            self.word(ann.anntyp as u16, u16::try_from(delta).unwrap_or(0))?;
        }
        self.prev_time = self.prev_time + delta;

        if ann.subtyp != 0 {
            self.word(SUB, (ann.subtyp & 0x3ff) as u16)?;
        }
        if ann.chan != self.prev_chan {
            self.word(CHN, (ann.chan & 0x3ff) as u16)?;
            self.prev_chan = ann.chan;
        }
        if ann.num != self.prev_num {
            self.word(NUM, (ann.num & 0x3ff) as u16)?;
            self.prev_num = ann.num;
        }
        if let Some(aux) = &ann.aux {
            self.aux_words(aux)?;
        }
        Ok(())
    }

    /// Write the terminator and flush.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.out.write_all(&[0, 0])?;
            self.out.flush()?;
            self.out.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn word(&mut self, code: u16, data: u16) -> Result<()> {
        let word = (code << 10) | (data & 0x3ff);
        self.out.write_all(&word.to_le_bytes())?;
        Ok(())
    }

    fn aux_words(&mut self, aux: &[u8]) -> Result<()> {
        let aux = &aux[..aux.len().min(0x3ff)];
        self.word(AUX, u16::try_from(aux.len()).unwrap_or(0))?;
        self.out.write_all(aux)?;
        if aux.len() % 2 == 1 {
            self.out.write_all(&[0])?;
        }
        Ok(())
    }
}

impl Drop for Annotator {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::{Annotation, AnnotationType, Annotator};

    fn words(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn small_deltas_pack_into_one_word() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("waves.beat");
        let mut ann = Annotator::create(&path, None).expect("create");
        ann.put(&Annotation {
            time: 100,
            anntyp: AnnotationType::NORMAL,
            ..Annotation::default()
        })
        .expect("put");
        ann.put(&Annotation {
            time: 300,
            anntyp: AnnotationType::PVC,
            ..Annotation::default()
        })
        .expect("put");
        ann.close().expect("close");

        let bytes = std::fs::read(&path).expect("read");
        let w = words(&bytes);
        assert_eq!(w[0], (1 << 10) | 100);
        assert_eq!(w[1], (5 << 10) | 200);
        assert_eq!(*w.last().unwrap(), 0);
    }

    #[test]
    fn large_delta_uses_skip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("waves.alarm");
        let mut ann = Annotator::create(&path, None).expect("create");
        ann.put(&Annotation {
            time: 70000,
            anntyp: AnnotationType::NOTE,
            ..Annotation::default()
        })
        .expect("put");
        ann.close().expect("close");

        let w = words(&std::fs::read(&path).expect("read"));
        assert_eq!(w[0], 59 << 10);
        let interval = (u32::from(w[1]) << 16) | u32::from(w[2]);
        assert_eq!(interval, 70000);
        assert_eq!(w[3], 22 << 10);
        assert_eq!(w[4], 0);
    }

    #[test]
    fn chan_num_are_sticky_and_sub_is_not() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("waves.wq");
        let mut ann = Annotator::create(&path, None).expect("create");
        for time in [10, 20] {
            ann.put(&Annotation {
                time,
                anntyp: AnnotationType::NOTE,
                subtyp: 3,
                chan: 255,
                num: 1,
                aux: Some(b"x".to_vec()),
            })
            .expect("put");
        }
        ann.close().expect("close");

        let w = words(&std::fs::read(&path).expect("read"));
        // First annotation: type word, SUB, CHN, NUM, AUX(len 1) + padded byte.
        assert_eq!(w[0], (22 << 10) | 10);
        assert_eq!(w[1], (61 << 10) | 3);
        assert_eq!(w[2], (62 << 10) | 255);
        assert_eq!(w[3], (60 << 10) | 1);
        assert_eq!(w[4], (63 << 10) | 1);
        // Second annotation repeats SUB and AUX but not CHN/NUM.
        assert_eq!(w[6], (22 << 10) | 10);
        assert_eq!(w[7], (61 << 10) | 3);
        assert_eq!(w[8], (63 << 10) | 1);
    }

    #[test]
    fn afreq_note_is_written_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("waves.beat");
        let ann = Annotator::create(&path, Some(1000.0)).expect("create");
        ann.close().expect("close");
        let bytes = std::fs::read(&path).expect("read");
        let w = words(&bytes);
        assert_eq!(w[0], 22 << 10);
        let text = b"## time resolution: 1000";
        assert_eq!(w[1], (63 << 10) | text.len() as u16);
        assert_eq!(&bytes[4..4 + text.len()], text);
    }
}
