//! stmeta - inspect, validate, and edit safetensors headers.

mod output;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde_json::Value;
use stmeta_core::{ToolConfig, METADATA_KEY};
use stmeta_safetensors::{ExpectedKeys, MetadataUpdate, Session};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "stmeta")]
#[command(author, version, about = "Inspect and edit safetensors file headers", long_about = None)]
struct Cli {
    /// Tool configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the file header, one entry per line
    Header {
        /// Input safetensors file
        input: PathBuf,
    },

    /// Print only the __metadata__ entry
    Metadata {
        /// Input safetensors file
        input: PathBuf,

        /// Expand string values that contain JSON
        #[arg(long = "parse-more", visible_alias = "pm")]
        parse_more: bool,
    },

    /// Print a single __metadata__ item
    Get {
        /// Metadata item name
        item: String,

        /// Input safetensors file
        input: PathBuf,
    },

    /// List tensor names with dtype, shape, and offsets
    Listkeys {
        /// Input safetensors file
        input: PathBuf,
    },

    /// Write the raw header bytes to a file
    Extracthdr {
        /// Input safetensors file
        input: PathBuf,

        /// Output file
        output: PathBuf,

        /// Overwrite an existing output file
        #[arg(short = 'f', long = "force-overwrite")]
        force: bool,
    },

    /// Write one tensor's raw bytes to a file
    Extractdata {
        /// Input safetensors file
        input: PathBuf,

        /// Tensor name
        tensor: String,

        /// Output file
        output: PathBuf,

        /// Overwrite an existing output file
        #[arg(short = 'f', long = "force-overwrite")]
        force: bool,
    },

    /// Validate the header and tensor layout
    Checkhdr {
        /// Input safetensors file
        input: PathBuf,
    },

    /// Compare tensor names against an expected key list
    Checkkeys {
        /// Input safetensors file
        input: PathBuf,

        /// Text file with one expected key per line
        keys: PathBuf,
    },

    /// Rewrite __metadata__ from a JSON file
    Writemd {
        /// Input safetensors file
        input: PathBuf,

        /// JSON file with the new metadata object
        metadata: PathBuf,

        /// Output file (may equal the input with -f)
        output: PathBuf,

        /// Overwrite an existing output file
        #[arg(short = 'f', long = "force-overwrite")]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet { Level::WARN } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => ToolConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ToolConfig::default(),
    };

    match cli.command {
        Commands::Header { input } => print_header(&config, &input),
        Commands::Metadata { input, parse_more } => print_metadata(&config, &input, parse_more),
        Commands::Get { item, input } => print_metadata_item(&config, &input, &item),
        Commands::Listkeys { input } => list_keys(&config, &input),
        Commands::Extracthdr {
            input,
            output,
            force,
        } => {
            let session = open(&config, &input)?;
            session
                .extract_raw_header(&output, force || config.rewrite.overwrite)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("header saved to file {}", output.display());
            Ok(())
        }
        Commands::Extractdata {
            input,
            tensor,
            output,
            force,
        } => {
            let mut session = open(&config, &input)?;
            let written = session
                .extract_tensor(&tensor, &output, force || config.rewrite.overwrite)
                .with_context(|| format!("failed to extract '{tensor}' to {}", output.display()))?;
            println!("{written} bytes of '{tensor}' saved to file {}", output.display());
            Ok(())
        }
        Commands::Checkhdr { input } => check_header(&config, &input),
        Commands::Checkkeys { input, keys } => check_keys(&config, &input, &keys),
        Commands::Writemd {
            input,
            metadata,
            output,
            force,
        } => write_metadata(&config, &input, &metadata, &output, force),
    }
}

fn open(config: &ToolConfig, input: &Path) -> anyhow::Result<Session> {
    let session = Session::open_with(input, &config.reader)
        .with_context(|| format!("failed to open {}", input.display()))?;
    info!(
        "{}: length={}, header length={}",
        input.display(),
        session.file_size(),
        session.header_len()
    );
    Ok(session)
}

/// The `__metadata__` entry as JSON, or an error naming the file.
fn metadata_value(session: &Session) -> anyhow::Result<Value> {
    let Some(metadata) = session.metadata() else {
        bail!(
            "{}: file header does not contain a {METADATA_KEY} item",
            session.path().display()
        );
    };
    Ok(serde_json::to_value(metadata)?)
}

fn print_header(config: &ToolConfig, input: &Path) -> anyhow::Result<()> {
    let session = open(config, input)?;
    let raw = session.raw_header();
    let entries: IndexMap<String, Value> = if raw.is_empty() {
        IndexMap::new()
    } else {
        serde_json::from_slice(raw.as_bytes())?
    };
    println!("{}", output::header_lines(&entries)?);
    Ok(())
}

fn print_metadata(config: &ToolConfig, input: &Path, parse_more: bool) -> anyhow::Result<()> {
    let session = open(config, input)?;
    let mut metadata = metadata_value(&session)?;
    if parse_more {
        output::parse_more(&mut metadata);
    }
    let mut wrapped = serde_json::Map::new();
    wrapped.insert(METADATA_KEY.to_string(), metadata);
    let text = output::render(&Value::Object(wrapped), output::IndentFormatter::metadata())?;
    println!("{text}");
    Ok(())
}

fn print_metadata_item(config: &ToolConfig, input: &Path, item: &str) -> anyhow::Result<()> {
    let session = open(config, input)?;
    let mut metadata = metadata_value(&session)?;
    output::parse_more(&mut metadata);
    let Some(value) = metadata.get(item) else {
        bail!("metadata does not contain a '{item}' item");
    };
    println!("{}", output::render(value, output::IndentFormatter::item())?);
    Ok(())
}

fn list_keys(config: &ToolConfig, input: &Path) -> anyhow::Result<()> {
    let session = open(config, input)?;
    for tensor in session.header().tensors() {
        println!("{}", output::describe_tensor(tensor));
    }
    Ok(())
}

fn check_header(config: &ToolConfig, input: &Path) -> anyhow::Result<()> {
    let session = open(config, input)?;
    let issues = session.check();
    let mut errors = 0usize;
    for issue in &issues {
        if issue.is_error() {
            errors += 1;
            println!("error: {issue}");
        } else {
            warn!("{issue}");
        }
    }
    if errors > 0 {
        bail!("{}: {errors} layout error(s)", input.display());
    }
    println!(
        "{}: ok, {} tensors, {} data bytes",
        input.display(),
        session.header().len(),
        session.data_len()
    );
    Ok(())
}

fn check_keys(config: &ToolConfig, input: &Path, keys: &Path) -> anyhow::Result<()> {
    let expected = ExpectedKeys::from_file(keys)
        .with_context(|| format!("failed to read key list {}", keys.display()))?;
    let session = open(config, input)?;
    let report = session.validate_keys(&expected);
    for key in &report.missing {
        println!("missing: {key}");
    }
    for key in &report.unexpected {
        println!("unexpected: {key}");
    }
    if !report.is_clean() {
        bail!(
            "{}: {} missing, {} unexpected of {} expected keys",
            input.display(),
            report.missing.len(),
            report.unexpected.len(),
            expected.len()
        );
    }
    println!("{}: all {} keys match", input.display(), expected.len());
    Ok(())
}

fn write_metadata(
    config: &ToolConfig,
    input: &Path,
    metadata: &Path,
    output: &Path,
    force: bool,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(metadata)
        .with_context(|| format!("failed to read {}", metadata.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", metadata.display()))?;
    let update = MetadataUpdate::from_json(Some(unwrap_metadata_key(value)));

    let rewrite = config.rewrite.clone().overwrite(force || config.rewrite.overwrite);
    let mut session = open(config, input)?;
    let summary = session
        .rewrite_metadata(&update, output, &rewrite)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "metadata written to {}, header length={}",
        output.display(),
        summary.header_len
    );
    Ok(())
}

/// Accept both a bare metadata object and the `{"__metadata__": {...}}`
/// shape printed by the `metadata` command.
fn unwrap_metadata_key(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(METADATA_KEY) => {
            map.remove(METADATA_KEY).unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_writemd() {
        let cli = Cli::parse_from(["stmeta", "-q", "writemd", "in.st", "md.json", "out.st", "-f"]);
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Writemd { force: true, .. }
        ));
    }

    #[test]
    fn test_unwrap_metadata_key() {
        assert_eq!(
            unwrap_metadata_key(json!({"__metadata__": {"a": "1"}})),
            json!({"a": "1"})
        );
        assert_eq!(unwrap_metadata_key(json!({"a": "1"})), json!({"a": "1"}));
        assert_eq!(
            unwrap_metadata_key(json!({"__metadata__": {}, "b": "2"})),
            json!({"__metadata__": {}, "b": "2"})
        );
    }

    #[test]
    fn test_write_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let header = br#"{"t":{"dtype":"U8","shape":[4],"data_offsets":[0,4]}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(&[9, 8, 7, 6]);
        let input = dir.path().join("in.safetensors");
        std::fs::write(&input, bytes).unwrap();

        let md = dir.path().join("md.json");
        std::fs::write(&md, r#"{"__metadata__": {"format": "pt"}}"#).unwrap();
        let output = dir.path().join("out.safetensors");

        let config = ToolConfig::default();
        write_metadata(&config, &input, &md, &output, false).unwrap();

        let mut session = Session::open(&output).unwrap();
        assert_eq!(session.metadata().and_then(|m| m.get("format")), Some("pt"));
        assert_eq!(session.read_tensor("t").unwrap(), vec![9, 8, 7, 6]);
        assert!(write_metadata(&config, &input, &md, &output, false).is_err());
    }
}
