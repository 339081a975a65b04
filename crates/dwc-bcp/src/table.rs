//! Tables backed by freebcp-format data files.
//!
//! A table is declared with its column set, an optional order column, and
//! optional unique-id index columns, then populated from one or more data
//! files (each with a `.fmt` companion). Data files are concatenated in
//! import order and must be sorted, without overlap, on the order column.
//!
//! Iterators keep their position between queries. The conversion workload
//! only ever moves forward in time, so a seek at or past the current
//! position scans ahead from where the last query stopped; an earlier
//! target rewinds to the start. Hitting end-of-file does not close
//! anything; a later scan simply retries the read, which also picks up
//! rows appended since.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{BcpError, Result};
use crate::value::{ColumnType, Value};

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Static description of a table, before any data files are attached.
#[derive(Debug, Clone)]
pub struct TableDefs {
    pub columns: Vec<(String, ColumnType)>,
    /// Column every data file is sorted by.
    pub order: Option<String>,
    /// Columns with a distinct value per row, indexed eagerly on import.
    pub unique_ids: Vec<String>,
}

/// How one column is stored in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldFormat {
    /// Text terminated by `\t`.
    ToTab,
    /// Text terminated by `\n`.
    ToLf,
    /// Blob with a 32-bit little-endian length prefix, no terminator.
    Blob32,
}

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    ctype: ColumnType,
    format: FieldFormat,
}

/// Column layout, fixed by the first imported `.fmt` file.
#[derive(Debug)]
pub struct TableLayout {
    columns: Vec<ColumnInfo>,
    order_idx: Option<usize>,
    index_idxs: Vec<usize>,
}

impl TableLayout {
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn order_idx(&self) -> Option<usize> {
        self.order_idx
    }

    pub fn column_number(&self, name: &str) -> Result<usize> {
        let lc = name.to_lowercase();
        self.columns
            .iter()
            .position(|c| c.name.to_lowercase() == lc)
            .ok_or_else(|| BcpError::Programming(format!("no column {name}")))
    }

    pub fn column_indexed(&self, idx: usize) -> bool {
        self.index_idxs.contains(&idx)
    }
}

#[derive(Debug)]
pub struct DataFileMeta {
    path: PathBuf,
    first_order: Option<Value>,
    /// column idx -> index key -> row start offset.
    index: HashMap<usize, HashMap<String, u64>>,
}

/// A table plus its imported data files.
pub struct Table {
    name: String,
    defs: TableDefs,
    layout: Option<Arc<TableLayout>>,
    files: Vec<Arc<DataFileMeta>>,
    cached_iter: Option<TableIter>,
}

impl Table {
    pub fn new(name: impl Into<String>, defs: TableDefs) -> Table {
        Table {
            name: name.into(),
            defs,
            layout: None,
            files: Vec::new(),
            cached_iter: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> Result<&Arc<TableLayout>> {
        self.layout
            .as_ref()
            .ok_or_else(|| BcpError::Operational(format!("table {} has no data", self.name)))
    }

    /// Whether any data file has ever been imported. A table without
    /// data has no layout either, and every query of it is empty.
    pub fn has_data(&self) -> bool {
        self.layout.is_some()
    }

    /// Drop all imported files (used when a metadata table is replaced).
    pub fn clear(&mut self) {
        self.files.clear();
        self.cached_iter = None;
    }

    /// Import a data file. Format must match previously imported files;
    /// the first row must sort after the last file's first row.
    pub fn add_data_file(&mut self, data_file: &Path, format_file: &Path) -> Result<()> {
        let layout = self.parse_format_file(format_file)?;
        match &self.layout {
            None => self.layout = Some(Arc::new(layout)),
            Some(existing) => {
                let same = existing.columns.len() == layout.columns.len()
                    && existing
                        .columns
                        .iter()
                        .zip(&layout.columns)
                        .all(|(a, b)| a.name == b.name && a.format == b.format);
                if !same {
                    return Err(BcpError::Operational(format!(
                        "format mismatch in {}",
                        format_file.display()
                    )));
                }
            }
        }
        let layout = Arc::clone(self.layout()?);

        let mut reader = RawReader::open(data_file)?;
        let mut index: HashMap<usize, HashMap<String, u64>> = HashMap::new();
        let first_offset = reader.offset();
        let Some(first_row) = read_row(&mut reader, &layout)? else {
            // Empty file; nothing to import.
            return Ok(());
        };

        let first_order = layout.order_idx.map(|i| first_row[i].clone());
        if let (Some(order), Some(prev)) = (
            &first_order,
            self.files.last().and_then(|f| f.first_order.as_ref()),
        ) {
            if order.compare(prev) != Some(std::cmp::Ordering::Greater) {
                return Err(BcpError::Operational(format!(
                    "files out of order in table {} ({})",
                    self.name,
                    data_file.display()
                )));
            }
        }

        if !layout.index_idxs.is_empty() {
            let mut offset = first_offset;
            let mut row = Some(first_row);
            while let Some(r) = row {
                for i in &layout.index_idxs {
                    let key = r[*i].index_key().ok_or_else(|| {
                        BcpError::Operational(format!(
                            "unindexable {} value in {}",
                            layout.columns[*i].name, self.name
                        ))
                    })?;
                    let per_col = index.entry(*i).or_default();
                    if per_col.insert(key.clone(), offset).is_some() {
                        return Err(BcpError::Operational(format!(
                            "duplicate {} in {}",
                            layout.columns[*i].name,
                            data_file.display()
                        )));
                    }
                    for old in &self.files {
                        if old.index.get(i).is_some_and(|m| m.contains_key(&key)) {
                            return Err(BcpError::Operational(format!(
                                "duplicate {} across {} and {}",
                                layout.columns[*i].name,
                                old.path.display(),
                                data_file.display()
                            )));
                        }
                    }
                }
                offset = reader.offset();
                row = read_row(&mut reader, &layout)?;
            }
        }

        self.files.push(Arc::new(DataFileMeta {
            path: data_file.to_path_buf(),
            first_order,
            index,
        }));
        self.cached_iter = None;
        Ok(())
    }

    /// The persistent iterator used for forward scans.
    pub fn cached_iter(&mut self) -> Result<&mut TableIter> {
        if self.cached_iter.is_none() {
            self.cached_iter = Some(self.fresh_iter()?);
        }
        Ok(self.cached_iter.as_mut().expect("just created"))
    }

    /// A throwaway iterator (used for reverse and indexed queries, which
    /// would otherwise wreck the persistent iterator's position).
    pub fn fresh_iter(&self) -> Result<TableIter> {
        Ok(TableIter::new(
            Arc::clone(self.layout()?),
            self.files.clone(),
        ))
    }

    fn parse_format_file(&self, path: &Path) -> Result<TableLayout> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BcpError::Operational(format!("cannot open {}: {e}", path.display()))
        })?;
        let mut lines = text.lines();
        let _version = lines
            .next()
            .ok_or_else(|| BcpError::Operational(format!("empty format file {}", path.display())))?;
        let ncols: usize = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| {
                BcpError::Operational(format!("bad column count in {}", path.display()))
            })?;

        let defined: HashMap<String, (String, ColumnType)> = self
            .defs
            .columns
            .iter()
            .map(|(name, ctype)| {
                (
                    name.to_lowercase().replace('_', ""),
                    (name.clone(), *ctype),
                )
            })
            .collect();

        let mut columns = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            let line = lines.next().ok_or_else(|| {
                BcpError::Operational(format!("truncated format file {}", path.display()))
            })?;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 7 {
                return Err(BcpError::Operational(format!(
                    "unparseable format line in {}: {line:?}",
                    path.display()
                )));
            }
            let format = match (tokens[1], tokens[2], tokens[3], tokens[4]) {
                ("SYBCHAR", "0", "-1", "\"\\t\"") => FieldFormat::ToTab,
                ("SYBCHAR", "0", "-1", "\"\\n\"") => FieldFormat::ToLf,
                ("SYBBINARY", "4", "-1", "\"\"") => FieldFormat::Blob32,
                _ => {
                    return Err(BcpError::Operational(format!(
                        "unsupported storage format in {}: {line:?}",
                        path.display()
                    )));
                }
            };
            let fmt_name = tokens[6].to_lowercase().replace('_', "");
            let (name, ctype) = defined.get(&fmt_name).ok_or_else(|| {
                BcpError::Operational(format!(
                    "unknown column {} in {}",
                    tokens[6],
                    path.display()
                ))
            })?;
            columns.push(ColumnInfo {
                name: name.clone(),
                ctype: *ctype,
                format,
            });
        }

        let order_idx = match &self.defs.order {
            None => None,
            Some(order) => {
                let lc = order.to_lowercase();
                Some(
                    columns
                        .iter()
                        .position(|c| c.name.to_lowercase() == lc)
                        .ok_or_else(|| {
                            BcpError::Operational(format!(
                                "order column {order} missing from {}",
                                path.display()
                            ))
                        })?,
                )
            }
        };
        let mut index_idxs = Vec::new();
        for key in &self.defs.unique_ids {
            let lc = key.to_lowercase();
            let idx = columns
                .iter()
                .position(|c| c.name.to_lowercase() == lc)
                .ok_or_else(|| {
                    BcpError::Operational(format!(
                        "index column {key} missing from {}",
                        path.display()
                    ))
                })?;
            index_idxs.push(idx);
        }

        Ok(TableLayout {
            columns,
            order_idx,
            index_idxs,
        })
    }
}

// ---------------------------------------------------------------------------
// Row iteration
// ---------------------------------------------------------------------------

pub type Row = Vec<Value>;

pub struct TableIter {
    layout: Arc<TableLayout>,
    files: Vec<Arc<DataFileMeta>>,
    file_idx: usize,
    reader: Option<RawReader>,
    next_row: Option<Row>,
    /// Order value of the most recently buffered or returned row.
    position: Option<Value>,
}

impl TableIter {
    fn new(layout: Arc<TableLayout>, files: Vec<Arc<DataFileMeta>>) -> TableIter {
        TableIter {
            layout,
            files,
            file_idx: 0,
            reader: None,
            next_row: None,
            position: None,
        }
    }

    /// Position so the next fetched row is the first with
    /// `order >= target`. `None` rewinds to the start of the table.
    pub fn seek_order(&mut self, target: Option<&Value>) -> Result<()> {
        let Some(target) = target else {
            self.rewind();
            self.advance_into_buffer()?;
            return Ok(());
        };
        let rewind_needed = match &self.position {
            Some(p) => p.compare(target) == Some(std::cmp::Ordering::Greater),
            None => false,
        };
        if rewind_needed {
            self.rewind();
        }
        if self.next_row.is_none() {
            self.advance_into_buffer()?;
        }
        loop {
            let Some(row) = &self.next_row else {
                return Ok(());
            };
            let order_idx = self.layout.order_idx.ok_or_else(|| {
                BcpError::Programming("cannot seek an unordered table".to_owned())
            })?;
            match row[order_idx].compare(target) {
                Some(std::cmp::Ordering::Less) => {
                    // Track skipped rows too, so a later rewind decision
                    // sees how far the scan actually got.
                    self.position = Some(row[order_idx].clone());
                    self.next_row = None;
                    self.advance_into_buffer()?;
                }
                Some(_) => return Ok(()),
                None => {
                    return Err(BcpError::DataSyntax(
                        "incomparable order value during seek".to_owned(),
                    ));
                }
            }
        }
    }

    /// Jump to the row whose indexed column equals `target`, if any.
    pub fn seek_indexed(&mut self, column: usize, target: &Value) -> Result<bool> {
        let Some(key) = target.index_key() else {
            return Err(BcpError::Programming(
                "unindexable comparison value".to_owned(),
            ));
        };
        for (i, file) in self.files.iter().enumerate() {
            if let Some(offset) = file.index.get(&column).and_then(|m| m.get(&key)) {
                let mut reader = RawReader::open(&file.path)?;
                reader.seek(*offset)?;
                self.file_idx = i;
                self.reader = Some(reader);
                self.next_row = None;
                self.advance_into_buffer()?;
                if let Some(row) = &self.next_row {
                    self.position = self.layout.order_idx.map(|oi| row[oi].clone());
                }
                return Ok(true);
            }
        }
        // Not present: park at the end so fetches return nothing.
        self.file_idx = self.files.len();
        self.reader = None;
        self.next_row = None;
        Ok(false)
    }

    /// Fetch the next row, if any.
    pub fn fetch(&mut self) -> Result<Option<Row>> {
        if self.next_row.is_none() {
            self.advance_into_buffer()?;
        }
        let row = self.next_row.take();
        if let (Some(r), Some(oi)) = (&row, self.layout.order_idx) {
            self.position = Some(r[oi].clone());
        }
        Ok(row)
    }

    fn rewind(&mut self) {
        self.file_idx = 0;
        self.reader = None;
        self.next_row = None;
        self.position = None;
    }

    /// Refill `next_row`, advancing across file boundaries. Leaves
    /// `next_row` as `None` at (current) end of data; a later call
    /// retries, picking up appended rows.
    fn advance_into_buffer(&mut self) -> Result<()> {
        while self.next_row.is_none() {
            if self.file_idx >= self.files.len() {
                return Ok(());
            }
            if self.reader.is_none() {
                self.reader = Some(RawReader::open(&self.files[self.file_idx].path)?);
            }
            let reader = self.reader.as_mut().expect("reader present");
            match read_row(reader, &self.layout)? {
                Some(row) => self.next_row = Some(row),
                None => {
                    if self.file_idx + 1 < self.files.len() {
                        self.file_idx += 1;
                        self.reader = None;
                    } else {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

fn read_row(reader: &mut RawReader, layout: &TableLayout) -> Result<Option<Row>> {
    let mut row = Vec::with_capacity(layout.columns.len());
    for (i, col) in layout.columns.iter().enumerate() {
        let raw = match col.format {
            FieldFormat::ToTab => reader.read_to(b'\t')?,
            FieldFormat::ToLf => reader.read_to(b'\n')?,
            FieldFormat::Blob32 => reader.read_blob32()?,
        };
        match raw {
            Some(bytes) => row.push(col.ctype.decode(&bytes).map_err(|e| {
                BcpError::DataSyntax(format!(
                    "column {} at byte {}: {e}",
                    col.name,
                    reader.offset()
                ))
            })?),
            None if i == 0 => return Ok(None),
            None => {
                return Err(BcpError::DataSyntax(format!(
                    "unexpected EOF while reading column {}",
                    col.name
                )));
            }
        }
    }
    Ok(Some(row))
}

// ---------------------------------------------------------------------------
// Raw file reading
// ---------------------------------------------------------------------------

const READ_CHUNK: usize = 64 * 1024;

struct RawReader {
    file: File,
    inbuf: Vec<u8>,
    head: usize,
    total_read: u64,
}

impl RawReader {
    fn open(path: &Path) -> Result<RawReader> {
        let file = File::open(path)
            .map_err(|e| BcpError::Operational(format!("cannot open {}: {e}", path.display())))?;
        Ok(RawReader {
            file,
            inbuf: Vec::new(),
            head: 0,
            total_read: 0,
        })
    }

    /// Offset of the next unconsumed byte.
    fn offset(&self) -> u64 {
        self.total_read - (self.inbuf.len() - self.head) as u64
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.inbuf.clear();
        self.head = 0;
        self.total_read = offset;
        Ok(())
    }

    fn pending(&self) -> usize {
        self.inbuf.len() - self.head
    }

    /// Read more data; returns false at (current) end of file.
    fn fill(&mut self) -> Result<bool> {
        if self.head > 0 {
            self.inbuf.drain(..self.head);
            self.head = 0;
        }
        let start = self.inbuf.len();
        self.inbuf.resize(start + READ_CHUNK, 0);
        let n = self.file.read(&mut self.inbuf[start..])?;
        self.inbuf.truncate(start + n);
        self.total_read += n as u64;
        Ok(n > 0)
    }

    /// Read a field terminated by `delim`. `None` means clean EOF with no
    /// pending bytes; a partial field at EOF is a syntax error.
    fn read_to(&mut self, delim: u8) -> Result<Option<Vec<u8>>> {
        // Invariant: the first `searched` pending bytes do not contain the
        // delimiter. fill() compacts the buffer, so pending bytes always
        // start at `head`.
        let mut searched = 0;
        loop {
            if let Some(pos) = self.inbuf[self.head + searched..]
                .iter()
                .position(|b| *b == delim)
            {
                let end = self.head + searched + pos;
                let field = self.inbuf[self.head..end].to_vec();
                self.head = end + 1;
                return Ok(Some(field));
            }
            searched = self.pending();
            if !self.fill()? {
                if self.pending() == 0 {
                    return Ok(None);
                }
                return Err(BcpError::DataSyntax(
                    "unexpected EOF inside a field".to_owned(),
                ));
            }
        }
    }

    /// Read a blob with a 32-bit little-endian length prefix.
    fn read_blob32(&mut self) -> Result<Option<Vec<u8>>> {
        while self.pending() < 4 {
            if !self.fill()? {
                if self.pending() == 0 {
                    return Ok(None);
                }
                return Err(BcpError::DataSyntax(
                    "unexpected EOF inside a blob length".to_owned(),
                ));
            }
        }
        let len_bytes: [u8; 4] = self.inbuf[self.head..self.head + 4]
            .try_into()
            .expect("four bytes checked");
        let len = u32::from_le_bytes(len_bytes) as usize;
        while self.pending() < 4 + len {
            if !self.fill()? {
                return Err(BcpError::DataSyntax(
                    "unexpected EOF inside a blob".to_owned(),
                ));
            }
        }
        let field = self.inbuf[self.head + 4..self.head + 4 + len].to_vec();
        self.head += 4 + len;
        Ok(Some(field))
    }
}
