//! Connection: a set of tables and the query execution engine.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{BcpError, Result};
use crate::query::{Constraint, Query, Relation, RowCheck};
use crate::table::{Row, Table, TableDefs, TableIter};
use crate::value::Value;

/// A read-only database of BCP-format files.
pub struct Connection {
    tables: HashMap<String, Table>,
}

impl Default for Connection {
    fn default() -> Connection {
        Connection::new()
    }
}

impl Connection {
    pub fn new() -> Connection {
        Connection {
            tables: HashMap::new(),
        }
    }

    /// Declare a table (idempotent; the first declaration wins).
    pub fn define_table(&mut self, name: &str, defs: TableDefs) {
        self.tables
            .entry(name.to_owned())
            .or_insert_with(|| Table::new(name, defs));
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| BcpError::Operational(format!("undefined table {name}")))
    }

    /// Import a data file into a declared table.
    pub fn add_data_file(
        &mut self,
        table: &str,
        data_file: &Path,
        format_file: &Path,
        replace: bool,
    ) -> Result<()> {
        let t = self.table_mut(table)?;
        if replace {
            t.clear();
        }
        t.add_data_file(data_file, format_file)
    }

    /// Run a query, returning the projected rows.
    pub fn execute(&mut self, query: &Query) -> Result<Vec<Row>> {
        let table = self.table_mut(&query.table)?;
        if !table.has_data() {
            return Ok(Vec::new());
        }
        let layout = std::sync::Arc::clone(table.layout()?);

        // Resolve projection.
        let mut projection = Vec::with_capacity(query.columns.len());
        for name in &query.columns {
            projection.push(layout.column_number(name)?);
        }

        // Validate the order clause: only the physical file order is
        // available.
        if let Some(order) = &query.order {
            let idx = layout.column_number(order)?;
            if Some(idx) != layout.order_idx() {
                return Err(BcpError::Programming(format!(
                    "cannot sort {} by {order}",
                    query.table
                )));
            }
        }

        // Split constraints into a seek target plus residual row checks,
        // mirroring what an index-aware planner would do with the single
        // physical ordering we have.
        let mut seek_order: Option<Value> = None;
        let mut seek_index: Option<(usize, Value)> = None;
        let mut checks: Vec<CompiledCheck> = Vec::new();
        for c in &query.constraints {
            let idx = layout.column_number(&c.column)?;
            let on_order = Some(idx) == layout.order_idx();
            match (on_order, c.relation) {
                (true, Relation::Lt | Relation::Le) => {
                    checks.push(CompiledCheck::halt_unless(idx, c));
                }
                (true, Relation::Eq) if seek_order.is_none() && seek_index.is_none() => {
                    seek_order = Some(c.value.clone());
                    checks.push(CompiledCheck::halt_unless(idx, c));
                }
                (true, Relation::Ge) if seek_order.is_none() && seek_index.is_none() => {
                    seek_order = Some(c.value.clone());
                }
                (true, Relation::Gt) if seek_order.is_none() && seek_index.is_none() => {
                    seek_order = Some(c.value.clone());
                    checks.push(CompiledCheck::skip_unless(
                        idx,
                        &Constraint {
                            column: c.column.clone(),
                            relation: Relation::Ne,
                            value: c.value.clone(),
                        },
                    ));
                }
                (false, Relation::Eq)
                    if layout.column_indexed(idx)
                        && seek_order.is_none()
                        && seek_index.is_none() =>
                {
                    seek_index = Some((idx, c.value.clone()));
                    checks.push(CompiledCheck::halt_unless(idx, c));
                }
                _ => checks.push(CompiledCheck::skip_unless(idx, c)),
            }
        }

        // Reverse and indexed queries use a throwaway iterator so they do
        // not disturb the persistent forward position.
        if query.reverse || seek_index.is_some() {
            let mut iter = table.fresh_iter()?;
            if let Some((idx, value)) = &seek_index {
                iter.seek_indexed(*idx, value)?;
            } else {
                iter.seek_order(seek_order.as_ref())?;
            }
            run_scan(&mut iter, &checks, query, &projection)
        } else {
            let iter = table.cached_iter()?;
            iter.seek_order(seek_order.as_ref())?;
            run_scan(iter, &checks, query, &projection)
        }
    }
}

fn run_scan(
    iter: &mut TableIter,
    checks: &[CompiledCheck],
    query: &Query,
    projection: &[usize],
) -> Result<Vec<Row>> {
    let mut rows: Vec<Row> = Vec::new();
    'scan: while let Some(row) = iter.fetch()? {
        for check in checks {
            match check.test(&row)? {
                RowCheck::Keep => {}
                RowCheck::Skip => continue 'scan,
                RowCheck::Halt => break 'scan,
            }
        }
        rows.push(project(row, projection));
        if let Some(limit) = query.limit {
            if query.reverse {
                // Keep only the newest `limit` matches.
                if rows.len() > limit {
                    rows.remove(0);
                }
            } else if rows.len() >= limit {
                break;
            }
        }
    }
    if query.reverse {
        rows.reverse();
    }
    Ok(rows)
}

fn project(row: Row, projection: &[usize]) -> Row {
    projection.iter().map(|i| row[*i].clone()).collect()
}

// ---------------------------------------------------------------------------
// Row checks
// ---------------------------------------------------------------------------

struct CompiledCheck {
    column: usize,
    relation: Relation,
    value: Value,
    /// Whether a failed test ends the scan instead of skipping the row.
    halts: bool,
}

impl CompiledCheck {
    fn halt_unless(column: usize, c: &Constraint) -> CompiledCheck {
        CompiledCheck {
            column,
            relation: c.relation,
            value: c.value.clone(),
            halts: true,
        }
    }

    fn skip_unless(column: usize, c: &Constraint) -> CompiledCheck {
        CompiledCheck {
            column,
            relation: c.relation,
            value: c.value.clone(),
            halts: false,
        }
    }

    fn test(&self, row: &Row) -> Result<RowCheck> {
        let cell = &row[self.column];
        let ord = cell.compare(&self.value);
        let pass = match (self.relation, ord) {
            (Relation::Ne, None) => !cell.is_null() || !self.value.is_null(),
            (_, None) => {
                return Err(BcpError::DataSyntax(
                    "cannot compare values of different types".to_owned(),
                ));
            }
            (Relation::Eq, Some(o)) => o == Ordering::Equal,
            (Relation::Ne, Some(o)) => o != Ordering::Equal,
            (Relation::Lt, Some(o)) => o == Ordering::Less,
            (Relation::Le, Some(o)) => o != Ordering::Greater,
            (Relation::Gt, Some(o)) => o == Ordering::Greater,
            (Relation::Ge, Some(o)) => o != Ordering::Less,
        };
        Ok(if pass {
            RowCheck::Keep
        } else if self.halts {
            RowCheck::Halt
        } else {
            RowCheck::Skip
        })
    }
}
