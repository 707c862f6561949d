//! export_log - read a detection log table back out of SQLite as JSON

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::{IsTerminal, Write};

use inference_log::{derive_table_id, SqlitePersistenceSink};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the detection log database.
    #[arg(long, default_value = "inference_log.db", env = "INFERENCE_LOG_DB_PATH")]
    db_path: String,
    /// Table to export.
    #[arg(long, conflicts_with = "source")]
    table: Option<String>,
    /// Source path the table was derived from (alternative to --table).
    #[arg(long)]
    source: Option<String>,
    /// Maximum records to export.
    #[arg(long, default_value_t = 100_000)]
    limit: usize,
    /// Output format (json|jsonl).
    #[arg(long, default_value = "json")]
    format: String,
    /// Output file; stdout when omitted.
    #[arg(long)]
    output: Option<String>,
    /// List detection log tables and exit.
    #[arg(long)]
    list_tables: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut store = {
        let _stage = ui.stage("Open detection log");
        SqlitePersistenceSink::open(&args.db_path)
            .with_context(|| format!("failed to open database {}", args.db_path))?
    };

    if args.list_tables {
        for table in store.list_tables()? {
            println!("{}", table);
        }
        return Ok(());
    }

    let table = match (&args.table, &args.source) {
        (Some(table), _) => table.clone(),
        (None, Some(source)) => derive_table_id(source),
        (None, None) => return Err(anyhow!("either --table or --source is required")),
    };

    let records = {
        let _stage = ui.stage("Read records");
        store.read_records(&table, args.limit)?
    };

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path).with_context(|| format!("failed to create {}", path))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };
    match args.format.as_str() {
        "json" => {
            serde_json::to_writer_pretty(&mut out, &records)?;
            writeln!(out)?;
        }
        "jsonl" => {
            for record in &records {
                serde_json::to_writer(&mut out, record)?;
                writeln!(out)?;
            }
        }
        other => return Err(anyhow!("unknown format '{}' (expected json|jsonl)", other)),
    }
    out.flush()?;
    log::info!("exported {} records from {}", records.len(), table);
    Ok(())
}
