//! Cask command-line front-end
//!
//! Usage:
//!   cask ingest --table events < records.ndjson
//!   cask digest --table events
//!   cask query --table events --group browser --int latency --op avg
//!
//! The table root comes from --dir, CASK_DIR, or ./db.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use cask::data::SavedRecord;
use cask::query::QueryResults;
use cask::table::Table;
use cask::{QueryFlags, Result, Settings};

#[derive(Parser)]
#[command(name = "cask")]
#[command(about = "Embedded columnar analytic store")]
#[command(version)]
struct Cli {
    /// Table root directory (overrides CASK_DIR)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append newline-delimited JSON records from stdin to a table
    Ingest(IngestFlags),
    /// Compact the ingestion log into column blocks
    Digest(TableFlags),
    /// Run a group-by / aggregation / sample query
    Query(QueryFlags),
    /// Recompute table metadata from block contents
    Index(TableFlags),
    /// Recover from a crashed digest and rebuild table metadata
    Rebuild(TableFlags),
}

#[derive(Args)]
struct TableFlags {
    #[arg(long)]
    table: String,
}

#[derive(Args)]
struct IngestFlags {
    #[arg(long)]
    table: String,

    /// Write gzip-compressed log segments
    #[arg(long, default_value_t = false)]
    gzip: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(dir) = &cli.dir {
        settings.dir = dir.clone();
    }

    let result = match cli.command {
        Command::Ingest(flags) => cmd_ingest(settings, flags),
        Command::Digest(flags) => cmd_digest(settings, &flags.table),
        Command::Query(flags) => cmd_query(settings, flags),
        Command::Index(flags) => cmd_index(settings, &flags.table),
        Command::Rebuild(flags) => cmd_rebuild(settings, &flags.table),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Ingest
// ============================================================================

/// Flatten one JSON object into a record. Nested objects flatten with a
/// dotted prefix; numbers become ints, strings become strs, arrays of
/// strings become sets.
fn flatten_json(prefix: &str, value: &serde_json::Value, record: &mut SavedRecord) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_json(&name, inner, record);
            }
        }
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)) {
                record.ints.push((prefix.to_string(), v));
            }
        }
        serde_json::Value::String(s) => {
            record.strs.push((prefix.to_string(), s.clone()));
        }
        serde_json::Value::Bool(b) => {
            record.ints.push((prefix.to_string(), *b as i64));
        }
        serde_json::Value::Array(items) => {
            let members: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
            if !members.is_empty() {
                record.sets.push((prefix.to_string(), members));
            }
        }
        serde_json::Value::Null => {}
    }
}

fn cmd_ingest(mut settings: Settings, flags: IngestFlags) -> Result<()> {
    settings.gzip = flags.gzip;
    let mut table = Table::open(settings, &flags.table);

    let stdin = io::stdin();
    let mut records = Vec::new();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(value) if value.is_object() => {
                let mut record = SavedRecord::new();
                flatten_json("", &value, &mut record);
                records.push(record);
            }
            Ok(_) => log::warn!("skipping non-object ingest line"),
            Err(e) => log::warn!("skipping unparseable ingest line: {}", e),
        }
    }

    if records.is_empty() {
        log::debug!("nothing to ingest");
        return Ok(());
    }
    let count = records.len();
    table.ingest(&records)?;
    eprintln!("ingested {} records into {}", count, table.name);
    Ok(())
}

// ============================================================================
// Digest / index / rebuild
// ============================================================================

fn cmd_digest(settings: Settings, table: &str) -> Result<()> {
    let mut table = Table::open(settings, table);
    let stats = table.digest_records()?;
    eprintln!(
        "digested {} records from {} segments into {} blocks",
        stats.records, stats.segments, stats.blocks_written
    );
    Ok(())
}

fn cmd_index(settings: Settings, table: &str) -> Result<()> {
    let mut table = Table::open(settings, table);
    table.update_info()?;
    eprintln!(
        "rebuilt metadata for {} ({} blocks, {} records)",
        table.name,
        table.blocks.len(),
        table.record_count()
    );
    Ok(())
}

fn cmd_rebuild(settings: Settings, table: &str) -> Result<()> {
    let mut table = Table::open(settings, table);
    table.recover_digest()?;
    table.update_info()?;
    eprintln!("recovered and rebuilt {}", table.name);
    Ok(())
}

// ============================================================================
// Query
// ============================================================================

fn cmd_query(mut settings: Settings, mut flags: QueryFlags) -> Result<()> {
    if flags.decode_flags {
        flags = QueryFlags::decode(io::stdin().lock())?;
    }
    if flags.encode_flags {
        flags.encode(io::stdout().lock())?;
        return Ok(());
    }

    if flags.list_tables {
        for name in Table::list_tables(&settings) {
            println!("{}", name);
        }
        return Ok(());
    }

    if flags.table.is_empty() {
        return Err(cask::CaskError::PlanError("no table given".to_string()));
    }

    settings.read_ingestion_log = flags.read_log;
    let mut table = Table::open(settings, &flags.table);
    if flags.update_info {
        table.update_info()?;
    }
    table.load_info()?;

    if flags.print_info {
        print_table_info(&table);
        return Ok(());
    }

    let (load, spec) = flags.build_query(&table)?;
    log::debug!("inspecting {} records", table.record_count());
    let results = table.load_and_query(&load, &spec)?;

    if flags.encode_results {
        cask::storage::encoding::encode_to_writer(io::stdout().lock(), &results.sorted)?;
        return Ok(());
    }
    if flags.print {
        print_results(&flags, &results)?;
    }
    Ok(())
}

fn print_table_info(table: &Table) {
    println!("table: {}", table.name);
    println!("records: {}", table.record_count());
    println!("blocks: {}", table.blocks.len());
    let mut cols: Vec<(&String, cask::data::KeyId)> =
        table.key_table.iter().map(|(k, v)| (k, *v)).collect();
    cols.sort_by_key(|(_, id)| *id);
    for (name, id) in cols {
        let kind = table
            .key_types
            .get(&id)
            .map(|t| format!("{:?}", t).to_lowercase())
            .unwrap_or_else(|| "?".to_string());
        match table.int_info.get(&id) {
            Some(info) => println!("  {} {} [{}, {}]", name, kind, info.min, info.max),
            None => println!("  {} {}", name, kind),
        }
    }
}

fn group_to_json(group: &cask::query::GroupResult) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    obj.insert("key".to_string(), group.group_key.clone().into());
    obj.insert("count".to_string(), group.count.into());
    for (col, avg) in &group.avgs {
        obj.insert(col.clone(), avg.mean.into());
    }
    for (col, hist) in &group.hists {
        let buckets: serde_json::Map<String, serde_json::Value> = hist
            .buckets()
            .into_iter()
            .map(|(start, count)| (start.to_string(), count.into()))
            .collect();
        obj.insert(format!("{}_hist", col), buckets.into());
    }
    obj.into()
}

fn print_results(flags: &QueryFlags, results: &QueryResults) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if flags.samples {
        for sample in &results.samples {
            let json = serde_json::to_string(sample)
                .map_err(|e| cask::CaskError::SerializationError(e.to_string()))?;
            writeln!(out, "{}", json)?;
        }
        return Ok(());
    }

    if flags.json {
        let value: serde_json::Value = if flags.time {
            results
                .time_results
                .iter()
                .map(|(bucket, map)| {
                    let groups: Vec<serde_json::Value> = map.values().map(group_to_json).collect();
                    (bucket.to_string(), groups.into())
                })
                .collect::<serde_json::Map<String, serde_json::Value>>()
                .into()
        } else {
            results
                .sorted
                .iter()
                .map(group_to_json)
                .collect::<Vec<serde_json::Value>>()
                .into()
        };
        let json = serde_json::to_string_pretty(&value)
            .map_err(|e| cask::CaskError::SerializationError(e.to_string()))?;
        writeln!(out, "{}", json)?;
        return Ok(());
    }

    if flags.time {
        for (bucket, map) in &results.time_results {
            for group in map.values() {
                write_group(&mut out, &format!("{}", bucket), group)?;
            }
        }
    } else if results.sorted.is_empty() {
        for group in results.results.values() {
            write_group(&mut out, "", group)?;
        }
    } else {
        for group in &results.sorted {
            write_group(&mut out, "", group)?;
        }
    }

    if !results.diagnostics.is_empty() {
        log::debug!("query diagnostics: {:?}", results.diagnostics);
    }
    Ok(())
}

fn write_group(
    out: &mut impl Write,
    prefix: &str,
    group: &cask::query::GroupResult,
) -> Result<()> {
    let key = group.group_key.trim_end_matches(':');
    if prefix.is_empty() {
        write!(out, "{}\t{}", key, group.count)?;
    } else {
        write!(out, "{}\t{}\t{}", prefix, key, group.count)?;
    }
    let mut cols: Vec<&String> = group.avgs.keys().collect();
    cols.sort();
    for col in cols {
        write!(out, "\t{}={:.2}", col, group.avgs[col].mean)?;
    }
    writeln!(out)?;

    let mut hist_cols: Vec<&String> = group.hists.keys().collect();
    hist_cols.sort();
    for col in hist_cols {
        let hist = &group.hists[col];
        writeln!(
            out,
            "  {}: count={} mean={:.2} stddev={:.2}",
            col,
            hist.count(),
            hist.mean(),
            hist.stddev()
        )?;
        for (start, count) in hist.buckets() {
            writeln!(out, "    {}\t{}", start, count)?;
        }
    }
    Ok(())
}
