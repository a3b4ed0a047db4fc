use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use log::info;

use etx::{FileRedoStore, Redo, RedoStore, TxId};

const REDO_FILE: &str = "etx.redo";

fn print_usage() {
    println!("etx - inspect an extended transaction redo log");
    println!();
    println!("Usage: etx [OPTIONS] [COMMAND]");
    println!();
    println!("Commands:");
    println!("  list                    List every pending operation (default)");
    println!("  stalled MANAGER SECS    Operations of MANAGER in transactions older than SECS");
    println!();
    println!("Options:");
    println!("  -d, --data-dir DIR    Data directory (default: ./data)");
    println!("  -h, --help            Show this help");
}

/// Due time relative to now, e.g. "in 30s" or "5s ago"
fn describe_due(due: SystemTime, now: SystemTime) -> String {
    match due.duration_since(now) {
        Ok(ahead) => format!("in {}s", ahead.as_secs()),
        Err(e) => format!("{}s ago", e.duration().as_secs()),
    }
}

/// Start of the window for `stalled`: `secs` seconds before now
fn stalled_before(now: SystemTime, secs: u64) -> Result<TxId, Box<dyn std::error::Error>> {
    match now.checked_sub(Duration::from_secs(secs)) {
        Some(before) => Ok(TxId::from_timestamp(before)),
        None => Err(format!("{} seconds is out of range", secs).into()),
    }
}

fn print_records(records: &[Redo]) {
    let now = SystemTime::now();
    println!(
        "{:<16} {:<20} {:<12} {:<6} {:>5} {:>8}  DUE",
        "TX", "ID", "MANAGER", "KIND", "TYPE", "DELAY"
    );
    for r in records {
        println!(
            "{:<16} {:<20} {:<12} {:<6} {:>5} {:>7}s  {}",
            TxId::from(r.tx).to_code(),
            r.id,
            r.manager,
            r.kind.to_string(),
            r.op_type,
            r.delay,
            r.due().map_or_else(|| "never".to_string(), |due| describe_due(due, now))
        );
    }
    println!("{} operation(s)", records.len());
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    // Parse command line arguments (simple)
    let args: Vec<String> = std::env::args().collect();

    let mut data_dir = PathBuf::from("./data");
    let mut command: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => command.push(other.to_string()),
        }
        i += 1;
    }

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let path = data_dir.join(REDO_FILE);
    info!("Opening redo log {:?}", path);
    let store = FileRedoStore::open(&path)?;

    match command.first().map(String::as_str) {
        None | Some("list") => {
            print_records(&store.all()?);
        }
        Some("stalled") => {
            let (manager, secs) = match (command.get(1), command.get(2)) {
                (Some(manager), Some(secs)) => (manager, secs.parse::<u64>()?),
                _ => {
                    print_usage();
                    return Err("stalled needs MANAGER and SECS".into());
                }
            };
            let before = stalled_before(SystemTime::now(), secs)?;
            print_records(&store.for_manager(manager, before.into())?);
        }
        Some(other) => {
            print_usage();
            return Err(format!("unknown command '{}'", other).into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_before() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let before = stalled_before(now, 10).unwrap();
        assert_eq!(before.timestamp(), SystemTime::UNIX_EPOCH + Duration::from_secs(990));
    }

    #[test]
    fn test_stalled_before_out_of_range() {
        assert!(stalled_before(SystemTime::now(), u64::MAX).is_err());
    }
}
