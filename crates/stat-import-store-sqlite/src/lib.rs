use std::cmp::min;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use stat_import_core::{
    Decision, Resolution, Resolver, RunContext, SourceIdentityIndex, TableSummary,
    TargetIdentityIndex, UnresolvedEntity,
};

/// The fixed column set of both statistics tables, in storage order.
/// `metadata_id` (index 2) is the only column rewritten during copy.
pub const STAT_COLUMNS: [&str; 13] = [
    "id",
    "created",
    "metadata_id",
    "start",
    "mean",
    "min",
    "max",
    "last_reset",
    "state",
    "sum",
    "created_ts",
    "start_ts",
    "last_reset_ts",
];

const METADATA_ID_INDEX: usize = 2;
const PROGRESS_PAGE_INTERVAL: u64 = 10;

/// The two dependent tables the copy engine processes, in processing order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatTable {
    ShortTerm,
    LongTerm,
}

impl StatTable {
    pub const ALL: [Self; 2] = [Self::ShortTerm, Self::LongTerm];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShortTerm => "statistics_short_term",
            Self::LongTerm => "statistics",
        }
    }
}

/// One statistics row as read from a source table. All thirteen values are
/// carried opaquely so that every column except `metadata_id` round-trips
/// bit-for-bit into the target.
#[derive(Debug, Clone)]
pub struct StatRow {
    metadata_id: i64,
    values: Vec<Value>,
}

impl StatRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let metadata_id: i64 = row.get(METADATA_ID_INDEX)?;
        let mut values = Vec::with_capacity(STAT_COLUMNS.len());
        for index in 0..STAT_COLUMNS.len() {
            values.push(row.get::<_, Value>(index)?);
        }
        Ok(Self { metadata_id, values })
    }

    #[must_use]
    pub fn metadata_id(&self) -> i64 {
        self.metadata_id
    }
}

/// A connection to one statistics database (source or target).
pub struct StatsDb {
    conn: Connection,
}

impl StatsDb {
    /// Open a statistics database. The schema is expected to exist already;
    /// this tool never creates or migrates it.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Full scan of the entity-metadata table as `(id, statistic_id)` pairs.
    /// The metadata table is orders of magnitude smaller than the
    /// statistics tables, so no pagination.
    ///
    /// # Errors
    /// Returns an error when `statistics_meta` cannot be read.
    pub fn load_identity_pairs(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, statistic_id FROM statistics_meta")
            .context("failed to prepare statistics_meta scan")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("failed to scan statistics_meta")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read statistics_meta rows")?;
        Ok(pairs)
    }

    /// Total row count of one statistics table, used for progress reporting
    /// only.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_rows(&self, table: StatTable) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table.as_str()), [], |row| row.get(0))
            .with_context(|| format!("failed to count rows in {}", table.as_str()))?;
        u64::try_from(count).context("row count is negative")
    }

    /// One page of rows in natural storage order.
    ///
    /// # Errors
    /// Returns an error when the page query fails or a row cannot be read.
    pub fn fetch_page(&self, table: StatTable, limit: u64, offset: u64) -> Result<Vec<StatRow>> {
        let sql = format!(
            "SELECT {} FROM {} LIMIT ?1 OFFSET ?2",
            STAT_COLUMNS.join(", "),
            table.as_str()
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare page query for {}", table.as_str()))?;
        let limit = i64::try_from(limit).context("page size does not fit in i64")?;
        let offset = i64::try_from(offset).context("page offset does not fit in i64")?;
        let rows = stmt
            .query_map(params![limit, offset], StatRow::from_row)
            .with_context(|| format!("failed to page through {}", table.as_str()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read rows from {}", table.as_str()))?;
        Ok(rows)
    }

    /// Most recent observed sample for a source metadata id, formatted for
    /// the operator: exact `state` preferred over `mean`, paired with the
    /// unit of measurement. Advisory only; never affects control flow.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn example_value(&self, metadata_id: i64) -> Result<String> {
        let sample = self
            .conn
            .query_row(
                "SELECT s.state, s.mean, sm.unit_of_measurement
                 FROM statistics s
                 JOIN statistics_meta sm ON s.metadata_id = sm.id
                 WHERE s.metadata_id = ?1
                 ORDER BY s.created DESC
                 LIMIT 1",
                params![metadata_id],
                |row| {
                    Ok((
                        row.get::<_, Value>(0)?,
                        row.get::<_, Value>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to look up example value for id {metadata_id}"))?;

        let Some((state, mean, unit)) = sample else {
            return Ok("no recent value found".to_string());
        };

        let unit = match unit {
            Some(unit) if !unit.is_empty() => unit,
            _ => "unknown unit".to_string(),
        };
        let value = display_value(&state).or_else(|| display_value(&mean));
        Ok(match value {
            Some(value) => format!("{value} {unit}"),
            None => format!("unknown {unit}"),
        })
    }

    fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn.transaction().context("failed to begin target transaction")
    }
}

fn display_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(n) => Some(n.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Text(text) => Some(text.clone()),
        Value::Blob(_) => Some("<blob>".to_string()),
    }
}

fn insert_sql(table: StatTable) -> String {
    let placeholders =
        (1..=STAT_COLUMNS.len()).map(|n| format!("?{n}")).collect::<Vec<_>>().join(", ");
    format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({placeholders})",
        table.as_str(),
        STAT_COLUMNS.join(", ")
    )
}

fn upsert_row(
    conn: &Connection,
    sql: &str,
    row: &StatRow,
    target_metadata_id: i64,
) -> Result<()> {
    let mut values = row.values.clone();
    values[METADATA_ID_INDEX] = Value::Integer(target_metadata_id);
    conn.execute(sql, params_from_iter(values)).context("failed to upsert statistics row")?;
    Ok(())
}

/// Supplies decisions for unresolved names. The copy engine never reads
/// operator input itself; it hands each unresolved entity to the provider
/// and trusts the returned decision (`Remap` replacements must already
/// exist in the target index).
pub trait DecisionProvider {
    /// Called once per encounter with an undecided name, with the advisory
    /// example value already fetched.
    ///
    /// # Errors
    /// Returns an error when a decision cannot be obtained, which aborts
    /// the run.
    fn decide(
        &mut self,
        entity: &UnresolvedEntity,
        example_value: &str,
        target: &TargetIdentityIndex,
    ) -> Result<Decision>;
}

/// Non-interactive provider used by dry runs: every unresolved name is
/// skipped for the rest of the run and reported afterwards.
#[derive(Debug, Default)]
pub struct SkipAllDecider;

impl DecisionProvider for SkipAllDecider {
    fn decide(
        &mut self,
        entity: &UnresolvedEntity,
        example_value: &str,
        _target: &TargetIdentityIndex,
    ) -> Result<Decision> {
        println!();
        println!("Missing metadata in target for: {}", entity.name);
        println!("Most recent value: {example_value}");
        println!("Dry run: skipping for the rest of the run");
        Ok(Decision::SkipAll)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    pub batch_size: u64,
    pub dry_run: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self { batch_size: 1000, dry_run: false }
    }
}

/// One entity from the deferred unresolved report, paired with its
/// advisory example value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnresolvedReportEntry {
    pub name: String,
    pub example_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub tables: Vec<TableSummary>,
    pub unresolved: Vec<UnresolvedReportEntry>,
}

/// Copy both statistics tables from `source` into `target`, rewriting
/// `metadata_id` through the reconciliation resolver. Writes are committed
/// per page; a crash loses at most the current page. Dry runs perform no
/// writes and no commits.
///
/// # Errors
/// Returns an error on any storage failure or when the decision provider
/// fails; pages committed before the failure stay committed.
pub fn import_statistics(
    source: &StatsDb,
    target: &mut StatsDb,
    options: &ImportOptions,
    decider: &mut dyn DecisionProvider,
) -> Result<ImportReport> {
    if options.batch_size == 0 {
        return Err(anyhow!("batch size must be at least 1"));
    }

    let source_index = SourceIdentityIndex::from_pairs(
        source.load_identity_pairs().context("failed to index source metadata")?,
    );
    let target_index = TargetIdentityIndex::from_pairs(
        target.load_identity_pairs().context("failed to index target metadata")?,
    );
    let resolver = Resolver::new(&source_index, &target_index);
    let mut ctx = RunContext::new();

    let mut tables = Vec::with_capacity(StatTable::ALL.len());
    for table in StatTable::ALL {
        tables.push(copy_table(source, target, table, resolver, &mut ctx, options, decider)?);
    }

    let mut unresolved = Vec::new();
    for entity in ctx.unresolved_entities() {
        let example_value = source.example_value(entity.metadata_id)?;
        unresolved.push(UnresolvedReportEntry { name: entity.name, example_value });
    }

    Ok(ImportReport { tables, unresolved })
}

fn copy_table(
    source: &StatsDb,
    target: &mut StatsDb,
    table: StatTable,
    resolver: Resolver<'_>,
    ctx: &mut RunContext,
    options: &ImportOptions,
    decider: &mut dyn DecisionProvider,
) -> Result<TableSummary> {
    let total_rows = source.count_rows(table)?;
    println!("Processing `{}` table...", table.as_str());

    let sql = insert_sql(table);
    let mut offset: u64 = 0;
    let mut pages: u64 = 0;
    let mut inserted: u64 = 0;
    let mut skipped: u64 = 0;

    loop {
        let rows = source.fetch_page(table, options.batch_size, offset)?;
        if rows.is_empty() {
            break;
        }

        let tx = if options.dry_run { None } else { Some(target.transaction()?) };
        for row in &rows {
            match resolve_row(source, resolver, ctx, decider, row.metadata_id())? {
                Some(target_metadata_id) => {
                    if let Some(tx) = &tx {
                        upsert_row(tx, &sql, row, target_metadata_id).with_context(|| {
                            format!("failed to write to {}", table.as_str())
                        })?;
                    }
                    inserted += 1;
                }
                None => skipped += 1,
            }
        }
        if let Some(tx) = tx {
            tx.commit().with_context(|| format!("failed to commit page into {}", table.as_str()))?;
        }

        offset += options.batch_size;
        pages += 1;
        if pages % PROGRESS_PAGE_INTERVAL == 0 {
            println!("Processed {} of {total_rows} rows", min(offset, total_rows));
        }
    }

    let summary = TableSummary { table: table.as_str().to_string(), total_rows, inserted, skipped };
    println!();
    println!("Summary for {}:", summary.table);
    println!("Total rows processed: {}", summary.total_rows);
    println!("Rows inserted: {}", summary.inserted);
    println!("Rows skipped: {}", summary.skipped);
    Ok(summary)
}

fn resolve_row(
    source: &StatsDb,
    resolver: Resolver<'_>,
    ctx: &mut RunContext,
    decider: &mut dyn DecisionProvider,
    metadata_id: i64,
) -> Result<Option<i64>> {
    match resolver.resolve(ctx, metadata_id) {
        Resolution::Resolved(target_metadata_id) => Ok(Some(target_metadata_id)),
        Resolution::Skipped => Ok(None),
        Resolution::MissingSourceEntry { metadata_id, first_occurrence } => {
            if first_occurrence {
                println!(
                    "Warning: no metadata found in source for id {metadata_id}; skipping its rows"
                );
            }
            Ok(None)
        }
        Resolution::NeedsDecision { name } => {
            let example_value = source.example_value(metadata_id)?;
            let entity = UnresolvedEntity { name, metadata_id };
            let decision = decider.decide(&entity, &example_value, resolver.target_index())?;
            resolver.apply_decision(ctx, &entity.name, decision).map_err(anyhow::Error::from)
        }
    }
}
