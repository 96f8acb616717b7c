//! auxcol Inspect - Column file inspection
//!
//! Lists the columns of a tree or ntuple file, the dynamic attributes found
//! for a base column and their resolution state, and dumps the attribute
//! values of one row as JSON.

use anyhow::{Context, Result, bail};
use auxcol_common::{Config, Error};
use auxcol_format::{ColumnDesc, FileKind, NTupleReader, TreeReader};
use auxcol_store::{AttributeRegistry, AuxRecord, ReadBackend};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "auxcol-inspect")]
#[command(about = "Inspect auxcol column files")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "AUXCOL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all columns of a file
    Columns {
        /// Column file
        file: PathBuf,
    },
    /// List the dynamic attributes of a base column
    Attributes {
        /// Column file
        file: PathBuf,
        /// Base column name, e.g. `ElectronsAux.`
        base: String,
        /// Records are standalone objects rather than collections
        #[arg(long)]
        standalone: bool,
    },
    /// Print the attribute values of one row as JSON
    Dump {
        /// Column file
        file: PathBuf,
        /// Base column name
        base: String,
        /// Row number
        row: u64,
        /// Records are standalone objects rather than collections
        #[arg(long)]
        standalone: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

fn columns_of(path: &Path) -> Result<(FileKind, Vec<ColumnDesc>)> {
    let kind = FileKind::detect(path)?;
    let columns = match kind {
        FileKind::Legacy => TreeReader::open(path)?.columns(),
        FileKind::Native => NTupleReader::open(path)?.columns(),
    };
    Ok((kind, columns))
}

/// Open a read backend for `base`, accepting whatever record type the file
/// declares for it
fn open_backend(path: &Path, base: &str, config: &Config) -> Result<Arc<ReadBackend>> {
    let (_, columns) = columns_of(path)?;
    let Some(base_column) = columns.iter().find(|c| c.name == base) else {
        bail!("{} has no column {base}", path.display());
    };

    let registry = Arc::new(AttributeRegistry::new());
    registry.declare_holder_type(&base_column.type_name);
    debug!("Base column {} holds {}", base, base_column.type_name);

    let backend = ReadBackend::open(path, base, registry, &config.reader)?;
    Ok(Arc::new(backend))
}

fn print_columns(path: &Path) -> Result<()> {
    let (kind, columns) = columns_of(path)?;
    println!("{} ({kind})", path.display());
    println!("{:<48} {:<40} {:>10} {:>6}", "COLUMN", "TYPE", "ENTRIES", "FIRST");
    for column in &columns {
        let type_name = match column.nbits {
            Some(nbits) => format!("{} [{nbits} bits]", column.type_name),
            None => column.type_name.clone(),
        };
        println!(
            "{:<48} {:<40} {:>10} {:>6}",
            column.name, type_name, column.entries, column.first_entry
        );
    }
    info!("Listed {} columns", columns.len());
    Ok(())
}

fn print_attributes(backend: &ReadBackend, standalone: bool) -> Result<()> {
    backend.discover(standalone);
    let registry = backend.registry();
    println!("{} ({} rows)", backend.base_name(), backend.entries());
    println!("{:<32} {:<16} {:<40} {}", "ATTRIBUTE", "STATUS", "COLUMN TYPE", "NOTES");
    for id in backend.attribute_ids().iter() {
        let meta = backend.resolve(id)?;
        let on_disk = meta.on_disk.as_ref().map(ToString::to_string).unwrap_or_default();
        let mut notes = Vec::new();
        if meta.needs_schema_evolution {
            if let Some(target) = &meta.decode.evolve_to {
                notes.push(format!("evolves to {target}"));
            }
        }
        if let Some(nbits) = meta.decode.packed_nbits {
            notes.push(format!("packed {nbits} bits"));
        }
        if let Some(reason) = &meta.reason {
            notes.push(reason.clone());
        }
        let name = registry.name_of(id).unwrap_or_else(|| meta.name.clone());
        println!("{:<32} {:<16} {:<40} {}", name, meta.status.to_string(), on_disk, notes.join(", "));
    }
    Ok(())
}

fn dump_row(backend: &Arc<ReadBackend>, row: u64, standalone: bool) -> Result<serde_json::Value> {
    let mut record = if standalone {
        AuxRecord::standalone()
    } else {
        AuxRecord::collection()
    };
    let store = backend.attach(&mut record, row)?;
    let registry = backend.registry();

    let mut object = serde_json::Map::new();
    for id in store.attribute_ids().iter() {
        let Some(name) = registry.name_of(id) else {
            continue;
        };
        let value = match store.get_data(id) {
            Ok(Some(value)) => serde_json::to_value(&*value)?,
            Ok(None) => serde_json::Value::Null,
            Err(Error::TypeError { reason, .. }) => serde_json::json!({ "error": reason }),
            Err(e) => return Err(e.into()),
        };
        object.insert(name, value);
    }
    info!("Read {} bytes for row {}", backend.bytes_read(), row);
    Ok(serde_json::Value::Object(object))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Columns { file } => print_columns(&file)?,
        Commands::Attributes { file, base, standalone } => {
            let backend = open_backend(&file, &base, &config)?;
            print_attributes(&backend, standalone)?;
        }
        Commands::Dump { file, base, row, standalone } => {
            let backend = open_backend(&file, &base, &config)?;
            let json = dump_row(&backend, row, standalone)?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use auxcol_common::{LogicalType, Value, WriterConfig};
    use auxcol_store::{AuxRow, OutputRegistry, WriteBackend};
    use tempfile::TempDir;

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("sample.tree");
        let registry = Arc::new(AttributeRegistry::new());
        let pt = registry.register("pt", LogicalType::F32).unwrap();
        let name = registry.register("name", LogicalType::String).unwrap();

        let outputs = OutputRegistry::new();
        let output = outputs.open_tree("sample", &path, "CollectionTree").unwrap();
        let mut writer = WriteBackend::new(output, registry, WriterConfig::default());
        writer.declare_container("MuonsAux.", "xAOD::MuonAuxContainer").unwrap();
        let values = AuxRow::collection()
            .with(pt, Value::List(vec![Value::F32(12.5), Value::F32(3.0)]))
            .with(name, Value::List(vec![Value::String("a".into()), Value::String("b".into())]));
        writer.write_attributes("MuonsAux.", &values, 0).unwrap();
        writer.commit().unwrap();
        outputs.close_all().unwrap();
        path
    }

    #[test]
    fn test_load_config() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(None).unwrap().reader.prefetch_clusters);

        let path = dir.path().join("auxcol.toml");
        std::fs::write(
            &path,
            "[reader]\nprefetch_clusters = false\n\n[reader.input_renames]\n\"MuonsAux.pt\" = \"MuonsAux.pt_v1\"\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(!config.reader.prefetch_clusters);
        assert_eq!(config.reader.input_renames.len(), 1);

        std::fs::write(&path, "reader = 3").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_dump_row() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let backend = open_backend(&path, "MuonsAux.", &Config::default()).unwrap();
        let json = dump_row(&backend, 0, false).unwrap();
        assert_eq!(json["pt"], serde_json::json!([12.5, 3.0]));
        assert_eq!(json["name"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_missing_base_column() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        assert!(open_backend(&path, "ElectronsAux.", &Config::default()).is_err());
        let (kind, columns) = columns_of(&path).unwrap();
        assert_eq!(kind, FileKind::Legacy);
        assert_eq!(columns.len(), 3);
    }
}
