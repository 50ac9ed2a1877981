//! xfer: chunked transfer integrity CLI
//!
//! Commands:
//!   keygen                           - print fresh key material (base64url node key)
//!   seal <file> [--key] [--state]    - compute a file's tag and print the sealed node key
//!   verify <file> --key              - check a file against the tag carried by its node key
//!   state inspect <file> [--size N]  - decode a saved chunk MAC table
//!   state handoff <file> ...         - keep a saved table's aligned finished prefix
//!   config show                      - display the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use xfer_chunks::{
    reduce_all, ChunkLayout, ChunkMacTable, EntryState, FoldPolicy, IntegrityVerifier,
};
use xfer_core::config::XferConfig;
use xfer_core::types::TransferProgress;
use xfer_crypto::{FileKeyMaterial, FileTag};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "xfer",
    version,
    about = "Chunked transfer integrity tool",
    long_about = "xfer: compute, seal and verify the chunk MAC file tags of encrypted transfers"
)]
struct Cli {
    /// Path to xfer.toml configuration file
    #[arg(long, short = 'c', env = "XFER_CONFIG", default_value = "/etc/xfer/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "XFER_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "XFER_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate key material for a new file
    Keygen,

    /// Compute a file's tag and print its node key with the tag embedded
    Seal {
        /// File to seal
        file: PathBuf,
        /// Base64url node key to seal with (default: freshly generated)
        #[arg(long, env = "XFER_KEY", hide_env_values = true)]
        key: Option<String>,
        /// Also write the chunk MAC table to this path
        #[arg(long)]
        state: Option<PathBuf>,
        /// Hash chunks on all cores (reads the whole file into memory)
        #[arg(long, conflicts_with = "state")]
        parallel: bool,
    },

    /// Verify a file against the tag carried by its node key
    ///
    /// Exits non-zero if the file does not authenticate.
    Verify {
        /// File to verify
        file: PathBuf,
        /// Base64url node key of the file
        #[arg(long, env = "XFER_KEY", hide_env_values = true)]
        key: String,
    },

    /// Saved chunk MAC table tools
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum StateAction {
    /// Decode a saved table and print its entries and progress
    Inspect {
        /// Serialized table
        file: PathBuf,
        /// Size of the file being transferred (enables gap detection)
        #[arg(long)]
        size: Option<u64>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Keep the finished prefix of a saved table up to an aligned offset,
    /// for a new attempt that restarts from there
    Handoff {
        /// Serialized table
        file: PathBuf,
        /// Bytes of the file the new attempt may reuse
        #[arg(long)]
        max_offset: u64,
        /// Where to write the new table
        #[arg(long, short = 'o')]
        out: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = XferConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    debug!(config = %cli.config.display(), "xfer starting");

    match cli.command {
        Commands::Keygen => cmd_keygen(),
        Commands::Seal { file, key, state, parallel } => {
            cmd_seal(&config, &file, key.map(SecretString::from), state.as_deref(), parallel)
        }
        Commands::Verify { file, key } => cmd_verify(&config, &file, SecretString::from(key)),
        Commands::State { action: StateAction::Inspect { file, size, json } } => {
            cmd_state_inspect(&config, &file, size, json)
        }
        Commands::State { action: StateAction::Handoff { file, max_offset, out } } => {
            cmd_state_handoff(&config, &file, max_offset, &out)
        }
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_key(key: &SecretString) -> Result<FileKeyMaterial> {
    FileKeyMaterial::from_base64(key.expose_secret().trim())
        .context("decoding node key (expected 32 bytes, base64url)")
}

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Stream `path` through a fresh chunk MAC table.
fn build_table(
    verifier: &IntegrityVerifier,
    key: &FileKeyMaterial,
    path: &Path,
    pb: &ProgressBar,
) -> Result<ChunkMacTable> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    pb.set_length(len);

    let table = verifier
        .table_from_reader(&key.cipher(), pb.wrap_read(file), len, key.ctr_iv())
        .with_context(|| format!("hashing {}", path.display()))?;
    pb.finish_and_clear();
    Ok(table)
}

/// Compute the tag of `path` and embed it in `key`. Returns the table too
/// unless hashed in parallel.
fn seal_file(
    verifier: &IntegrityVerifier,
    path: &Path,
    key: FileKeyMaterial,
    parallel: bool,
    pb: &ProgressBar,
) -> Result<(FileKeyMaterial, Option<ChunkMacTable>)> {
    let cipher = key.cipher();

    if parallel {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let tag = verifier
            .file_tag_parallel(&cipher, &data, key.ctr_iv())
            .with_context(|| format!("hashing {}", path.display()))?;
        return Ok((key.with_meta_mac(tag), None));
    }

    let table = build_table(verifier, &key, path, pb)?;
    let tag = reduce_all(&table, &cipher);
    Ok((key.with_meta_mac(tag), Some(table)))
}

/// Check `path` against the tag carried by `key`. Returns the tag the file
/// should carry, which differs from the key's only when late chunk MACs were
/// missing from it.
fn verify_file(
    verifier: &IntegrityVerifier,
    path: &Path,
    key: &FileKeyMaterial,
    pb: &ProgressBar,
) -> Result<FileTag> {
    let table = build_table(verifier, key, path, pb)?;
    let accepted = verifier
        .check_table(&table, &key.cipher(), &key.meta_mac())
        .with_context(|| format!("{} does not authenticate", path.display()))?;
    Ok(accepted)
}

fn load_state(config: &XferConfig, path: &Path) -> Result<ChunkMacTable> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ChunkMacTable::from_bytes(
        &bytes,
        ChunkLayout::from_config(&config.integrity),
        FoldPolicy::from_config(&config.integrity),
    )
    .with_context(|| format!("decoding chunk MAC state: {}", path.display()))
}

fn state_label(state: EntryState) -> &'static str {
    match state {
        EntryState::Partial { .. } => "partial",
        EntryState::Finished => "finished",
        EntryState::FoldedPrefix => "folded-prefix",
    }
}

/// Progress of a decoded table; without a file size every entry is taken at
/// its full chunk length.
fn state_progress(table: &mut ChunkMacTable, size: Option<u64>) -> TransferProgress {
    table.compute_progress(size.unwrap_or(u64::MAX))
}

fn describe_state(table: &mut ChunkMacTable, size: Option<u64>) -> serde_json::Value {
    let progress = state_progress(table, size);
    let entries: Vec<serde_json::Value> = table
        .iter()
        .map(|(start, entry)| {
            serde_json::json!({
                "chunk_start": start,
                "state": state_label(entry.state),
                "offset": entry.offset(),
                "mac": hex::encode(entry.mac),
            })
        })
        .collect();

    serde_json::json!({
        "entries": entries,
        "folded_prefix_end": table.folded_prefix_end(),
        "progress": progress,
        "has_unfinished_gap": size.map(|s| table.has_unfinished_gap(s)),
    })
}

// ── `xfer keygen` ─────────────────────────────────────────────────────────────

fn cmd_keygen() -> Result<()> {
    let key = FileKeyMaterial::generate();
    println!("{}", key.to_base64());
    Ok(())
}

// ── `xfer seal` ───────────────────────────────────────────────────────────────

fn cmd_seal(
    config: &XferConfig,
    path: &Path,
    key: Option<SecretString>,
    state: Option<&Path>,
    parallel: bool,
) -> Result<()> {
    let key = match key {
        Some(key) => parse_key(&key)?,
        None => {
            info!("no --key given, generating fresh key material");
            FileKeyMaterial::generate()
        }
    };

    let verifier = IntegrityVerifier::from_config(&config.integrity);
    let pb = make_progress_bar("seal");
    let (sealed, table) = seal_file(&verifier, path, key, parallel, &pb)?;

    if let (Some(state_path), Some(table)) = (state, table.as_ref()) {
        let bytes = table.to_bytes().context("encoding chunk MAC state")?;
        std::fs::write(state_path, &bytes)
            .with_context(|| format!("writing {}", state_path.display()))?;
        info!(path = %state_path.display(), entries = table.len(), "chunk MAC state written");
    }

    println!("tag: {}", sealed.meta_mac());
    println!("key: {}", sealed.to_base64());
    Ok(())
}

// ── `xfer verify` ─────────────────────────────────────────────────────────────

fn cmd_verify(config: &XferConfig, path: &Path, key: SecretString) -> Result<()> {
    let key = parse_key(&key)?;
    let verifier = IntegrityVerifier::from_config(&config.integrity);
    let pb = make_progress_bar("verify");

    let accepted = verify_file(&verifier, path, &key, &pb)?;
    if accepted == key.meta_mac() {
        println!("OK  {} ({})", path.display(), accepted);
    } else {
        warn!(carried = %key.meta_mac(), %accepted, "node key carries a stale tag");
        println!("OK  {} (tag corrected to {})", path.display(), accepted);
        println!("key: {}", key.with_meta_mac(accepted).to_base64());
    }
    Ok(())
}

// ── `xfer state inspect` ──────────────────────────────────────────────────────

fn cmd_state_inspect(config: &XferConfig, path: &Path, size: Option<u64>, json: bool) -> Result<()> {
    let mut table = load_state(config, path)?;

    if json {
        let value = describe_state(&mut table, size);
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("serializing state to JSON")?
        );
        return Ok(());
    }

    let progress = state_progress(&mut table, size);
    println!("{:<16} {:<14} {:>10}  mac", "chunk_start", "state", "offset");
    for (start, entry) in table.iter() {
        println!(
            "{:<16} {:<14} {:>10}  {}",
            start,
            state_label(entry.state),
            entry.offset(),
            hex::encode(entry.mac)
        );
    }
    println!();
    println!("entries:     {}", table.len());
    if let Some(end) = table.folded_prefix_end() {
        println!("folded to:   {end}");
    }
    println!("contiguous:  {}", progress.contiguous);
    println!("completed:   {}", progress.completed);
    println!("partial:     {}", progress.partial_bytes);
    if let Some(size) = size {
        println!("complete:    {}", progress.is_complete(size));
        println!("gap:         {}", table.has_unfinished_gap(size));
    }
    Ok(())
}

// ── `xfer state handoff` ──────────────────────────────────────────────────────

fn cmd_state_handoff(config: &XferConfig, path: &Path, max_offset: u64, out: &Path) -> Result<()> {
    let source = load_state(config, path)?;
    let mut dest = ChunkMacTable::from_config(&config.integrity);
    let aligned = source.copy_finished_prefix_until_aligned(
        max_offset,
        &mut dest,
        config.integrity.alignment_unit,
    );

    let bytes = dest.to_bytes().context("encoding chunk MAC state")?;
    std::fs::write(out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    info!(aligned, entries = dest.len(), out = %out.display(), "chunk MAC state handed off");

    println!("aligned:    {aligned}");
    println!("resume at:  {}", dest.next_unprocessed_offset(0));
    println!("entries:    {}", dest.len());
    Ok(())
}

// ── `xfer config show` ────────────────────────────────────────────────────────

fn cmd_config_show(config: &XferConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn small_config() -> XferConfig {
        let mut config = XferConfig::default();
        config.integrity.segment_size = 1024;
        config.integrity.fold_margin_bytes = 16 * 1024;
        config.integrity.fold_min_entries = 4;
        config
    }

    fn write_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    fn make_data(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i.wrapping_mul(29) ^ (i >> 5)) as u8).collect()
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_verify_and_inspect() {
        let cli = Cli::try_parse_from(["xfer", "verify", "data.bin", "--key", "abc"]).unwrap();
        assert!(matches!(cli.command, Commands::Verify { .. }));

        let cli = Cli::try_parse_from(["xfer", "state", "inspect", "s.bin", "--size", "10", "--json"])
            .unwrap();
        match cli.command {
            Commands::State { action: StateAction::Inspect { size, json, .. } } => {
                assert_eq!(size, Some(10));
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["xfer", "seal", "f", "--parallel", "--state", "s"]).is_err());
    }

    #[test]
    fn parse_key_rejects_garbage() {
        assert!(parse_key(&SecretString::from("not a key".to_string())).is_err());

        let key = FileKeyMaterial::generate();
        let parsed = parse_key(&SecretString::from(format!(" {}\n", key.to_base64()))).unwrap();
        assert_eq!(parsed.ctr_iv(), key.ctr_iv());
    }

    #[test]
    fn seal_then_verify() {
        let config = small_config();
        let verifier = IntegrityVerifier::from_config(&config.integrity);
        let file = write_file(&make_data(100_000));
        let pb = ProgressBar::hidden();

        let (sealed, table) =
            seal_file(&verifier, file.path(), FileKeyMaterial::generate(), false, &pb).unwrap();
        assert!(table.is_some());

        let accepted = verify_file(&verifier, file.path(), &sealed, &pb).unwrap();
        assert_eq!(accepted, sealed.meta_mac());
    }

    #[test]
    fn verify_rejects_modified_file() {
        let config = small_config();
        let verifier = IntegrityVerifier::from_config(&config.integrity);
        let mut data = make_data(50_000);
        let file = write_file(&data);
        let pb = ProgressBar::hidden();
        let (sealed, _) =
            seal_file(&verifier, file.path(), FileKeyMaterial::generate(), false, &pb).unwrap();

        data[10] ^= 1;
        let tampered = write_file(&data);
        let err = verify_file(&verifier, tampered.path(), &sealed, &pb).unwrap_err();
        assert!(format!("{err:#}").contains("mismatch"), "{err:#}");
    }

    #[test]
    fn parallel_seal_matches_streaming_seal() {
        let config = small_config();
        let verifier = IntegrityVerifier::from_config(&config.integrity);
        let file = write_file(&make_data(300_000));
        let pb = ProgressBar::hidden();
        let key = FileKeyMaterial::generate();

        let (streamed, _) = seal_file(&verifier, file.path(), key.clone(), false, &pb).unwrap();
        let (parallel, table) = seal_file(&verifier, file.path(), key, true, &pb).unwrap();
        assert!(table.is_none());
        assert_eq!(streamed.meta_mac(), parallel.meta_mac());
    }

    #[test]
    fn saved_state_decodes_as_complete() {
        let config = small_config();
        let verifier = IntegrityVerifier::from_config(&config.integrity);
        let size = 200_000usize;
        let file = write_file(&make_data(size));
        let pb = ProgressBar::hidden();
        let (_, table) =
            seal_file(&verifier, file.path(), FileKeyMaterial::generate(), false, &pb).unwrap();

        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.bin");
        std::fs::write(&state_path, table.unwrap().to_bytes().unwrap()).unwrap();

        let mut restored = load_state(&config, &state_path).unwrap();
        let value = describe_state(&mut restored, Some(size as u64));
        assert_eq!(value["progress"]["contiguous"], size as u64);
        assert_eq!(value["has_unfinished_gap"], false);
        assert_eq!(value["entries"][0]["state"], "folded-prefix");
    }

    #[test]
    fn handoff_keeps_aligned_finished_prefix() {
        let mut config = small_config();
        config.integrity.fold_min_entries = usize::MAX;
        let verifier = IntegrityVerifier::from_config(&config.integrity);
        let file = write_file(&make_data(100_000));
        let pb = ProgressBar::hidden();
        let (_, table) =
            seal_file(&verifier, file.path(), FileKeyMaterial::generate(), false, &pb).unwrap();

        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.bin");
        let out_path = dir.path().join("handoff.bin");
        std::fs::write(&state_path, table.unwrap().to_bytes().unwrap()).unwrap();

        cmd_state_handoff(&config, &state_path, 60_000, &out_path).unwrap();

        let handed = load_state(&config, &out_path).unwrap();
        let resume = handed.next_unprocessed_offset(0);
        assert!(resume > 0 && resume <= 60_000);
        assert_eq!(resume % config.integrity.alignment_unit, 0);
    }

    #[test]
    fn corrupt_state_is_rejected() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.bin");
        std::fs::write(&state_path, [1u8, 0, 1, 0, 0xFF]).unwrap();
        assert!(load_state(&small_config(), &state_path).is_err());
    }
}
