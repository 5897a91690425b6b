use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use libtrie::{BuilderOptions, KeyEncoding, TrieBuilder};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use trie_input::parse_record;

const PROGRESS_EVERY: u64 = 100_000;

#[derive(Parser, Debug)]
#[command(
    name = "trie-compile",
    version,
    about = "Compile key/value text records into a trie file"
)]
struct Args {
    /// Delimiter between key and value
    #[arg(short = 'd', long, default_value = ":")]
    delimiter: String,

    /// Store keys only; lookups report presence without values
    #[arg(short = 'e', long = "keys-only")]
    keys_only: bool,

    /// Store values as the prefix shared with their key plus a suffix
    #[arg(long)]
    compress: bool,

    /// How keys are split into edges
    #[arg(long, value_enum, default_value_t = Encoding::Utf8)]
    encoding: Encoding,

    /// Text input, one record per line
    input: PathBuf,

    /// Trie file to write (replaced atomically)
    output: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Encoding {
    Utf8,
    Codepoint,
}

impl From<Encoding> for KeyEncoding {
    fn from(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Utf8 => KeyEncoding::Utf8,
            Encoding::Codepoint => KeyEncoding::Codepoint,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let input = File::open(&args.input)
        .with_context(|| format!("open input: {}", args.input.display()))?;

    let options = BuilderOptions {
        key_encoding: args.encoding.into(),
        keys_only: args.keys_only,
        prefix_compression: args.compress,
    };
    let (builder, inserted) = load_records(BufReader::new(input), &args.delimiter, options)
        .with_context(|| format!("read input: {}", args.input.display()))?;
    info!(inserted, keys = builder.len(), "inserted {inserted} items");

    write_output(&builder, &args.output)
}

/// Lines that are not valid UTF-8 are skipped with a warning.
fn load_records(
    mut reader: impl BufRead,
    delimiter: &str,
    options: BuilderOptions,
) -> Result<(TrieBuilder, u64)> {
    let mut builder = TrieBuilder::new(options);
    let mut inserted: u64 = 0;
    let mut raw = Vec::new();
    let mut line_no: u64 = 0;

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        line_no += 1;
        let Ok(line) = std::str::from_utf8(&raw) else {
            warn!(line = line_no, "skipping line that is not valid UTF-8");
            continue;
        };
        let Some(record) = parse_record(line, delimiter) else {
            continue;
        };

        match (record.value, options.keys_only) {
            (_, true) => builder.insert_key(record.key),
            (Some(value), false) => builder.insert(record.key, value),
            (None, false) => {
                debug!(key = record.key, "skipping record without value");
                continue;
            }
        }

        inserted += 1;
        if inserted % PROGRESS_EVERY == 0 {
            debug!(inserted, "progress");
        }
    }

    Ok((builder, inserted))
}

fn write_output(builder: &TrieBuilder, output: &Path) -> Result<()> {
    builder
        .write_to(output)
        .with_context(|| format!("write trie: {}", output.display()))?;
    info!(output = %output.display(), "trie written");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::{load_records, write_output};
    use libtrie::{BuilderOptions, KeyEncoding, Trie};
    use std::io::Cursor;
    use tempfile::tempdir;

    const SOURCE: &str = "cat:feline\ncat:pet\ncar:vehicle\n\nx\ndog\nurl:http://example.org\n";

    #[test]
    fn compiles_records_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let (builder, inserted) =
            load_records(Cursor::new(SOURCE), ":", BuilderOptions::default())?;
        assert_eq!(inserted, 4);

        let tmp = tempdir()?;
        let path = tmp.path().join("animals.trie");
        write_output(&builder, &path)?;

        let trie = Trie::open(&path)?;
        assert_eq!(trie.lookup("cat")?, ["feline", "pet"]);
        assert_eq!(trie.lookup("car")?, ["vehicle"]);
        assert_eq!(trie.lookup("url")?, ["http://example.org"]);
        assert!(trie.lookup("dog")?.is_empty());
        assert!(trie.lookup("ca")?.is_empty());
        Ok(())
    }

    #[test]
    fn keys_only_keeps_keys_without_values() -> Result<(), Box<dyn std::error::Error>> {
        let options = BuilderOptions {
            keys_only: true,
            ..BuilderOptions::default()
        };
        let (builder, inserted) = load_records(Cursor::new(SOURCE), ":", options)?;
        assert_eq!(inserted, 5);

        let trie = Trie::from_vec(builder.to_bytes()?)?;
        assert!(trie.header().keys_only());
        assert!(trie.contains("dog"));
        assert!(trie.contains("cat"));
        assert_eq!(trie.get("cat")?.map(|v| v.len()), Some(0));
        assert_eq!(trie.get("feline")?, None);
        Ok(())
    }

    #[test]
    fn invalid_utf8_line_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let source: &[u8] = b"cat:feline\nbad:\xff\xfe\ncar:vehicle\n";
        let (builder, inserted) =
            load_records(Cursor::new(source), ":", BuilderOptions::default())?;
        assert_eq!(inserted, 2);

        let trie = Trie::from_vec(builder.to_bytes()?)?;
        assert_eq!(trie.lookup("cat")?, ["feline"]);
        assert_eq!(trie.lookup("car")?, ["vehicle"]);
        assert!(!trie.contains("bad"));
        Ok(())
    }

    #[test]
    fn custom_delimiter_and_encoding() -> Result<(), Box<dyn std::error::Error>> {
        let options = BuilderOptions {
            key_encoding: KeyEncoding::Codepoint,
            prefix_compression: true,
            ..BuilderOptions::default()
        };
        let source = "Dvořák\tDvořákova\nDvořák\tAntonín\n";
        let (builder, _) = load_records(Cursor::new(source), "\t", options)?;

        let trie = Trie::from_vec(builder.to_bytes()?)?;
        assert_eq!(trie.key_encoding(), KeyEncoding::Codepoint);
        assert_eq!(trie.lookup("Dvořák")?, ["Dvořákova", "Antonín"]);
        Ok(())
    }
}
