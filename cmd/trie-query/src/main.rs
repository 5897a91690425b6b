use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use libtrie::{
    CacheConfig, CachedTrie, LoadError, LoadMode, LoadOptions, LookupFault, TrieHandle,
};
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use trie_input::parse_key_bytes;

/// Exit status when `--key` is not present in the trie.
const EXIT_NOT_FOUND: u8 = 1;
/// Trie file missing or unreadable.
const EXIT_UNREADABLE: u8 = 3;
/// Trie file corrupt or in an unsupported format.
const EXIT_CORRUPT: u8 = 4;
const EXIT_OTHER: u8 = 5;

/// Printed for keys stored without values.
const FOUND: &str = "Found";

#[derive(Parser, Debug)]
#[command(
    name = "trie-query",
    version,
    about = "Look up keys from stdin (or --key) in a compiled trie file"
)]
struct Args {
    /// Trie file produced by trie-compile
    file: PathBuf,

    /// Look up a single key instead of reading keys from stdin
    #[arg(long)]
    key: Option<String>,

    /// Cache up to N decoded results
    #[arg(long, value_name = "N")]
    cache: Option<usize>,

    /// Copy results into a fixed buffer of BYTES instead of allocating
    #[arg(long, value_name = "BYTES", conflicts_with = "cache")]
    buffer: Option<usize>,

    /// Memory-map the trie file (default)
    #[arg(long, conflicts_with = "read")]
    mmap: bool,

    /// Read the whole trie file into memory
    #[arg(long)]
    read: bool,

    /// Skip the body checksum pass at load
    #[arg(long)]
    no_verify: bool,
}

impl Args {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            mode: if self.read {
                LoadMode::Read
            } else {
                LoadMode::Mmap
            },
            verify_checksum: !self.no_verify,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_status(&err))
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let handle = match TrieHandle::load_with(&args.file, args.load_options()) {
        Ok(handle) => handle,
        Err(err) => {
            if let Some(message) = libtrie::last_error() {
                debug!(%message, "load failed");
            }
            return Err(err).with_context(|| format!("load trie: {}", args.file.display()));
        }
    };

    let mut engine = Engine::new(handle, args);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let code = match &args.key {
        Some(key) => {
            if engine.answer(key, &mut out)? {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_NOT_FOUND)
            }
        }
        None => {
            let stdin = std::io::stdin();
            let answered = run_loop(&mut engine, stdin.lock(), &mut out)?;
            debug!(answered, "input drained");
            ExitCode::SUCCESS
        }
    };

    out.flush()?;
    engine.close();
    Ok(code)
}

/// Answer one key per input line until EOF. Returns the number of keys read.
///
/// A line that is not valid UTF-8 cannot name a stored key and is answered
/// `Not found`.
fn run_loop(engine: &mut Engine, mut reader: impl BufRead, out: &mut impl Write) -> Result<u64> {
    let mut line = Vec::new();
    let mut answered: u64 = 0;

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).context("read key")?;
        if read == 0 {
            break;
        }
        match parse_key_bytes(&line) {
            Some(key) => {
                engine.answer(key, out)?;
            }
            None => {
                debug!(bytes = line.len(), "key is not valid UTF-8");
                writeln!(out, "Not found")?;
            }
        }
        answered += 1;
    }

    Ok(answered)
}

enum Engine {
    Direct(TrieHandle),
    Cached(CachedTrie),
    Buffered { handle: TrieHandle, buf: Vec<u8> },
}

impl Engine {
    fn new(handle: TrieHandle, args: &Args) -> Self {
        match (args.cache, args.buffer) {
            (_, Some(size)) => Engine::Buffered {
                handle,
                buf: vec![0; size],
            },
            (Some(capacity), None) => {
                Engine::Cached(CachedTrie::new(handle, CacheConfig::with_capacity(capacity)))
            }
            (None, None) => Engine::Direct(handle),
        }
    }

    /// Print the values for `key`, one per line, or `Not found`. A key stored
    /// without values prints `Found`. Returns whether the key exists.
    fn answer(&mut self, key: &str, out: &mut impl Write) -> Result<bool> {
        let found = match self {
            Engine::Direct(handle) => handle.get(key)?,
            Engine::Cached(cache) => cache.get(key)?,
            Engine::Buffered { handle, buf } => {
                return match handle.lookup_into(key, buf)? {
                    Some(hit) if hit.count == 0 => {
                        writeln!(out, "{FOUND}")?;
                        Ok(true)
                    }
                    Some(hit) => {
                        out.write_all(&buf[..hit.len])?;
                        out.write_all(b"\n")?;
                        Ok(true)
                    }
                    None => {
                        writeln!(out, "Not found")?;
                        Ok(false)
                    }
                };
            }
        };

        match found {
            Some(values) if values.is_empty() => writeln!(out, "{FOUND}")?,
            Some(values) => {
                for value in &values {
                    writeln!(out, "{value}")?;
                }
            }
            None => {
                writeln!(out, "Not found")?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn close(self) {
        match self {
            Engine::Direct(handle) | Engine::Buffered { handle, .. } => {
                handle.close();
            }
            Engine::Cached(cache) => {
                let stats = cache.stats();
                debug!(
                    hits = stats.hits,
                    misses = stats.misses,
                    entries = stats.entries,
                    "cache stats"
                );
                cache.close();
            }
        }
    }
}

fn exit_status(err: &anyhow::Error) -> u8 {
    if let Some(load) = err.downcast_ref::<LoadError>() {
        return match load {
            LoadError::NotFound { .. } | LoadError::Io(_) => EXIT_UNREADABLE,
            LoadError::Format(_) => EXIT_CORRUPT,
            LoadError::OutOfMemory { .. } => EXIT_OTHER,
        };
    }
    match err.downcast_ref::<LookupFault>() {
        Some(LookupFault::Corrupt(_)) => EXIT_CORRUPT,
        _ => EXIT_OTHER,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
