//! Row dedup and soft-delete: fingerprint every source row, drop rows the
//! target already holds, append the rest with audit columns and, for the
//! latest snapshot, mark rows that disappeared as deleted.

pub mod fingerprint;
pub mod target;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::schema::{derive_types, Naming};
use crate::source::{RowIter, SourceRow, SourceRows};

pub use fingerprint::fingerprint;
pub use target::{
    Audit, MemoryTargetTable, NewRow, SqlTargetTable, StoredRow, TableChanges, TargetTable,
    AUDIT_COLUMNS,
};

/// Rows sampled for schema inference on first load.
pub const DEFAULT_SAMPLE_ROWS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub consumer_id: String,
    pub source_system: String,
    pub source_table: String,
    pub naming: Naming,
    pub sample_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub rows_read: u64,
    pub duplicates_in_file: u64,
    pub rows_already_present: u64,
    pub rows_written: u64,
    pub rows_deleted: u64,
    pub table_created: bool,
}

/// Source column positions in target order.
struct Alignment {
    positions: Vec<Option<usize>>,
    width: usize,
}

impl Alignment {
    fn new(source: &[String], target: &[String]) -> Result<Self> {
        let index: HashMap<&str, usize> = source
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        if let Some(unknown) = source.iter().find(|s| !target.contains(*s)) {
            return Err(Error::Validation(format!(
                "source column `{}` is not in the target table",
                unknown
            )));
        }
        Ok(Self {
            positions: target.iter().map(|t| index.get(t.as_str()).copied()).collect(),
            width: source.len(),
        })
    }

    fn align(&self, mut row: SourceRow) -> Result<Vec<Option<String>>> {
        if row.values.len() != self.width {
            return Err(Error::Validation(format!(
                "row has {} cells, header has {}",
                row.values.len(),
                self.width
            )));
        }
        Ok(self
            .positions
            .iter()
            .map(|p| p.and_then(|i| row.values[i].take()))
            .collect())
    }
}

struct Scan {
    rows_read: u64,
    duplicates_in_file: u64,
    rows_already_present: u64,
    inserts: Vec<NewRow>,
    seen: HashSet<String>,
}

fn scan(rows: RowIter, alignment: &Alignment, existing: &HashMap<String, bool>) -> Result<Scan> {
    let mut out = Scan {
        rows_read: 0,
        duplicates_in_file: 0,
        rows_already_present: 0,
        inserts: Vec::new(),
        seen: HashSet::new(),
    };
    for row in rows {
        let values = alignment.align(row?)?;
        out.rows_read += 1;
        let row_hash = fingerprint(values.iter().map(|v| v.as_deref()));
        if !out.seen.insert(row_hash.clone()) {
            out.duplicates_in_file += 1;
            continue;
        }
        if existing.contains_key(&row_hash) {
            out.rows_already_present += 1;
            continue;
        }
        out.inserts.push(NewRow { row_hash, values });
    }
    Ok(out)
}

/// Reconcile one source file into `target`.
///
/// Intra-file duplicates keep their first occurrence. Rows whose fingerprint
/// the target already holds (deleted or not) are skipped. With
/// `is_latest_snapshot`, every live target row whose fingerprint is absent
/// from this file is soft-deleted in the same commit as the append.
#[instrument(skip_all, fields(source = %source.name, target = %target.name(), is_latest_snapshot = is_latest_snapshot))]
pub async fn reconcile<T>(
    source: SourceRows,
    target: &T,
    ctx: &ReconcileContext,
    is_latest_snapshot: bool,
) -> Result<ReconcileSummary>
where
    T: TargetTable + ?Sized,
{
    let headers = ctx.naming.canonicalize(&source.headers)?;
    let mut rows = source.rows;

    let (columns, create) = match target.columns().await? {
        Some(columns) => (columns, None),
        None => {
            // First load: sample for types, then replay the sample.
            let mut sample = Vec::new();
            for row in rows.by_ref().take(ctx.sample_rows.max(1)) {
                sample.push(row?);
            }
            let sample_values: Vec<Vec<Option<String>>> =
                sample.iter().map(|r| r.values.clone()).collect();
            let schema = derive_types(&ctx.source_table, &headers, &sample_values)?;
            rows = Box::new(sample.into_iter().map(Ok).chain(rows));
            (headers.clone(), Some(schema))
        }
    };

    let alignment = Alignment::new(&headers, &columns)?;
    let existing = target.fingerprints().await?;

    let (scan, existing) = tokio::task::spawn_blocking(move || {
        let result = scan(rows, &alignment, &existing);
        (result, existing)
    })
    .await?;
    let scan = scan?;

    let mut deletes: Vec<String> = if is_latest_snapshot {
        existing
            .iter()
            .filter(|(hash, deleted)| !**deleted && !scan.seen.contains(*hash))
            .map(|(hash, _)| hash.clone())
            .collect()
    } else {
        Vec::new()
    };
    deletes.sort();

    let summary = ReconcileSummary {
        rows_read: scan.rows_read,
        duplicates_in_file: scan.duplicates_in_file,
        rows_already_present: scan.rows_already_present,
        rows_written: scan.inserts.len() as u64,
        rows_deleted: deletes.len() as u64,
        table_created: create.is_some(),
    };

    let changes = TableChanges {
        create,
        columns,
        inserts: scan.inserts,
        audit: Audit {
            source_system: ctx.source_system.clone(),
            source_table: ctx.source_table.clone(),
            inserted_at: Utc::now(),
            consumer_id: ctx.consumer_id.clone(),
        },
        deletes,
    };
    target.commit(&changes).await?;

    info!(
        rows_read = summary.rows_read,
        duplicates_in_file = summary.duplicates_in_file,
        already_present = summary.rows_already_present,
        written = summary.rows_written,
        deleted = summary.rows_deleted,
        "reconciled"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx() -> ReconcileContext {
        ReconcileContext {
            consumer_id: "glue".into(),
            source_system: "Openpowerlifting.org".into(),
            source_table: "raw.openpowerlifting".into(),
            naming: Naming::new(BTreeMap::new()),
            sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }

    fn file(headers: &[&str], rows: &[&[&str]]) -> SourceRows {
        SourceRows::from_rows(
            "test.csv",
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|r| SourceRow::new(r.iter().map(|c| (!c.is_empty()).then_some(*c))))
                .collect(),
        )
    }

    fn live(target: &MemoryTargetTable) -> Vec<Vec<Option<String>>> {
        let mut rows: Vec<_> = target
            .rows()
            .into_iter()
            .filter(|r| !r.is_deleted)
            .map(|r| r.values)
            .collect();
        rows.sort();
        rows
    }

    #[tokio::test]
    async fn intra_file_duplicates_keep_first() {
        let target = MemoryTargetTable::new();
        let src = file(
            &["Name", "TotalKg"],
            &[&["A", "1"], &["B", "2"], &["A", "1"], &["C", ""]],
        );
        let s = reconcile(src, &target, &ctx(), false).await.unwrap();
        assert_eq!(s.rows_read, 4);
        assert_eq!(s.duplicates_in_file, 1);
        assert_eq!(s.rows_written, 3);
        assert!(s.table_created);
        assert_eq!(target.columns().await.unwrap().unwrap(), vec!["name", "total_kg"]);
    }

    #[tokio::test]
    async fn second_identical_run_writes_nothing() {
        let target = MemoryTargetTable::new();
        let rows: &[&[&str]] = &[&["A", "1"], &["B", "2"]];
        reconcile(file(&["Name", "TotalKg"], rows), &target, &ctx(), true)
            .await
            .unwrap();
        let again = reconcile(file(&["Name", "TotalKg"], rows), &target, &ctx(), true)
            .await
            .unwrap();
        assert_eq!(again.rows_written, 0);
        assert_eq!(again.rows_deleted, 0);
        assert_eq!(again.rows_already_present, 2);
        assert_eq!(target.rows().len(), 2);
    }

    #[tokio::test]
    async fn written_rows_carry_audit_columns() {
        let target = MemoryTargetTable::new();
        let before = Utc::now();
        reconcile(
            file(&["Name", "TotalKg"], &[&["A", "1"], &["B", ""]]),
            &target,
            &ctx(),
            false,
        )
        .await
        .unwrap();
        let after = Utc::now();

        let rows = target.rows();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert!(!row.is_deleted);
            assert_eq!(row.audit.source_system, ctx().source_system);
            assert_eq!(row.audit.source_table, ctx().source_table);
            assert_eq!(row.audit.consumer_id, ctx().consumer_id);
            assert!(before <= row.audit.inserted_at && row.audit.inserted_at <= after);
            assert_eq!(
                row.row_hash,
                fingerprint(row.values.iter().map(|v| v.as_deref()))
            );
        }
        assert_eq!(rows[1].values, vec![Some("B".to_string()), None]);
    }

    #[tokio::test]
    async fn latest_snapshot_soft_deletes_missing_rows() {
        let target = MemoryTargetTable::new();
        reconcile(
            file(&["Name"], &[&["A"], &["B"], &["C"]]),
            &target,
            &ctx(),
            false,
        )
        .await
        .unwrap();

        let s = reconcile(file(&["Name"], &[&["A"], &["C"]]), &target, &ctx(), true)
            .await
            .unwrap();
        assert_eq!(s.rows_deleted, 1);
        assert_eq!(
            live(&target),
            vec![vec![Some("A".to_string())], vec![Some("C".to_string())]]
        );
        let deleted: Vec<_> = target.rows().into_iter().filter(|r| r.is_deleted).collect();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].values, vec![Some("B".to_string())]);
        assert_eq!(target.rows().len(), 3);
    }

    #[tokio::test]
    async fn deleted_rows_are_never_revived() {
        let target = MemoryTargetTable::new();
        reconcile(file(&["Name"], &[&["A"], &["B"]]), &target, &ctx(), true)
            .await
            .unwrap();
        reconcile(file(&["Name"], &[&["A"]]), &target, &ctx(), true)
            .await
            .unwrap();
        let s = reconcile(file(&["Name"], &[&["A"], &["B"]]), &target, &ctx(), true)
            .await
            .unwrap();
        assert_eq!(s.rows_written, 0);
        assert_eq!(s.rows_deleted, 0);
        assert_eq!(live(&target), vec![vec![Some("A".to_string())]]);
    }

    #[tokio::test]
    async fn column_order_of_the_file_does_not_matter() {
        let target = MemoryTargetTable::new();
        reconcile(file(&["Name", "Sex"], &[&["A", "F"]]), &target, &ctx(), false)
            .await
            .unwrap();
        let s = reconcile(file(&["Sex", "Name"], &[&["F", "A"]]), &target, &ctx(), false)
            .await
            .unwrap();
        assert_eq!(s.rows_written, 0);
        assert_eq!(s.rows_already_present, 1);
    }

    #[tokio::test]
    async fn unknown_source_column_is_rejected() {
        let target = MemoryTargetTable::new();
        reconcile(file(&["Name"], &[&["A"]]), &target, &ctx(), false)
            .await
            .unwrap();
        let err = reconcile(file(&["Name", "Extra"], &[&["A", "x"]]), &target, &ctx(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn failed_commit_leaves_target_unchanged() {
        let target = MemoryTargetTable::new();
        reconcile(file(&["Name"], &[&["A"], &["B"]]), &target, &ctx(), false)
            .await
            .unwrap();
        target.set_fail_commits(true);
        let err = reconcile(file(&["Name"], &[&["C"]]), &target, &ctx(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueryExecution { .. }));
        assert_eq!(target.rows().len(), 2);
        assert!(target.rows().iter().all(|r| !r.is_deleted));
    }
}
