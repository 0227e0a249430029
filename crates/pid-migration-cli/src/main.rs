use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use pid_migration_core::{
    default_unrelated_url_substrings, transform, BatchWriter, FieldIndex, MigrationConfig,
    RorEmission,
};
use pid_migration_resolver::RemoteResolver;
use pid_migration_store_sqlite::HandleStore;

#[derive(Debug, Parser)]
#[command(name = "pidmig")]
#[command(about = "Migrates legacy Handle records to the current metadata profile")]
struct Cli {
    /// Path to the Handle server's SQLite database.
    #[arg(long, default_value = "./handle_server.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute migration statements and write the batch file.
    Migrate(MigrateArgs),
    /// Print the handles a prefix selection would cover.
    ListHandles(ListHandlesArgs),
}

#[derive(Debug, Args)]
#[command(group = clap::ArgGroup::new("credential").required(true))]
struct MigrateArgs {
    /// Batch file to write.
    #[arg(long)]
    out: PathBuf,

    /// Administrative handle for the authentication preamble,
    /// e.g. 306:0.NA/21.T12995.
    #[arg(long)]
    admin: String,

    /// Private-key file referenced by a PUBKEY preamble.
    #[arg(long, group = "credential")]
    key_file: Option<PathBuf>,

    /// Shared secret embedded in a SECKEY preamble.
    #[arg(long, group = "credential")]
    secret_key: Option<String>,

    /// Select every handle under this prefix; repeatable.
    #[arg(long = "prefix", conflicts_with = "input_file")]
    prefixes: Vec<String>,

    /// File with one handle per line; blank lines and # comments are skipped.
    #[arg(long)]
    input_file: Option<PathBuf>,

    /// Value written into EUDAT/FIXED_CONTENT; must be stated explicitly.
    #[arg(long, action = ArgAction::Set)]
    fixed_content: bool,

    /// Skip the remote replica-chain walk; pointer records are then
    /// treated as originals.
    #[arg(long, default_value_t = false)]
    no_remote_walk: bool,

    /// Override the built-in list of unrelated-subsystem URL substrings.
    #[arg(long = "unrelated-url-substring")]
    unrelated_url_substrings: Vec<String>,

    #[arg(long, value_enum, default_value_t = RorEmissionArg::ModifyInPlace)]
    ror_emission: RorEmissionArg,

    /// Base URL of the Handle REST API used for chain walking.
    #[arg(long)]
    server_url: Option<String>,

    /// Run the whole pipeline but discard the batch output.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ListHandlesArgs {
    #[arg(long = "prefix", required = true)]
    prefixes: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RorEmissionArg {
    ModifyInPlace,
    RemoveThenAdd,
}

impl RorEmissionArg {
    fn into_policy(self) -> RorEmission {
        match self {
            Self::ModifyInPlace => RorEmission::ModifyInPlace,
            Self::RemoveThenAdd => RorEmission::RemoveThenAdd,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Migrate(args) => run_migrate(&cli.db, &args),
        Command::ListHandles(args) => run_list_handles(&cli.db, &args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn run_migrate(db: &Path, args: &MigrateArgs) -> Result<()> {
    let store = HandleStore::open(db)?;
    let handles = collect_handles(&store, args)?;
    if handles.is_empty() {
        tracing::warn!("no handles selected; nothing to do");
        return Ok(());
    }

    let config = MigrationConfig {
        fixed_content: args.fixed_content,
        remote_chain_walk: !args.no_remote_walk,
        unrelated_url_substrings: if args.unrelated_url_substrings.is_empty() {
            default_unrelated_url_substrings()
        } else {
            args.unrelated_url_substrings.clone()
        },
        ror_emission: args.ror_emission.into_policy(),
    };
    let resolver = RemoteResolver::new(args.server_url.clone());

    let sink: Box<dyn Write> = if args.dry_run {
        Box::new(io::sink())
    } else {
        let file = File::create(&args.out)
            .with_context(|| format!("creating batch file {}", args.out.display()))?;
        Box::new(BufWriter::new(file))
    };
    let mut writer = BatchWriter::new(sink);
    write_auth_preamble(&mut writer, args)?;

    let total = handles.len();
    let step = std::cmp::max(1, total / 100);
    let started = Instant::now();
    let mut estimated = false;
    let mut written = 0_usize;
    let mut skipped = 0_usize;
    let mut failed = 0_usize;

    for (position, handle) in handles.iter().enumerate() {
        match process_record(&store, handle, &config, &resolver, &mut writer) {
            Ok(true) => written += 1,
            Ok(false) => skipped += 1,
            Err(err) => {
                tracing::warn!(%handle, "record failed: {err:#}");
                failed += 1;
            }
        }

        let done = position + 1;
        if done % step == 0 || done == total {
            #[allow(clippy::cast_precision_loss)]
            if !estimated {
                let projected = started.elapsed().as_secs_f64() / done as f64 * total as f64;
                tracing::info!("estimated total runtime: {projected:.0}s for {total} records");
                estimated = true;
            }
            tracing::info!("processed {done}/{total} records");
        }
    }

    writer.finish().context("flushing batch file")?;
    let elapsed = started.elapsed();
    #[allow(clippy::cast_precision_loss)]
    let per_record = elapsed.as_secs_f64() / total as f64;
    tracing::info!(
        written,
        skipped,
        failed,
        dry_run = args.dry_run,
        "migration finished: {total} records in {:.1}s ({per_record:.3}s/record)",
        elapsed.as_secs_f64()
    );
    if failed > 0 {
        return Err(anyhow!("{failed} of {total} records failed; see warnings above"));
    }
    Ok(())
}

fn run_list_handles(db: &Path, args: &ListHandlesArgs) -> Result<()> {
    let store = HandleStore::open(db)?;
    for prefix in &args.prefixes {
        for handle in store.handles_under_prefix(prefix)? {
            println!("{handle}");
        }
    }
    Ok(())
}

fn write_auth_preamble(writer: &mut BatchWriter<Box<dyn Write>>, args: &MigrateArgs) -> Result<()> {
    let outcome = match (&args.key_file, &args.secret_key) {
        (Some(path), _) => writer.write_auth_pubkey(&args.admin, &path.display().to_string()),
        (None, Some(secret)) => writer.write_auth_seckey(&args.admin, secret),
        (None, None) => return Err(anyhow!("either --key-file or --secret-key is required")),
    };
    outcome.context("writing authentication preamble")
}

fn collect_handles(store: &HandleStore, args: &MigrateArgs) -> Result<Vec<String>> {
    if let Some(path) = &args.input_file {
        return read_handle_list(path);
    }
    if args.prefixes.is_empty() {
        return Err(anyhow!("select records with --prefix or --input-file"));
    }
    let mut handles = Vec::new();
    for prefix in &args.prefixes {
        handles.extend(store.handles_under_prefix(prefix)?);
    }
    Ok(handles)
}

fn read_handle_list(path: &Path) -> Result<Vec<String>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("reading handle list {}", path.display()))?;
    Ok(body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Returns whether the record produced a batch block. A record failure is
/// reported to the caller; the driver keeps going over the remaining
/// handles either way.
fn process_record(
    store: &HandleStore,
    handle: &str,
    config: &MigrationConfig,
    resolver: &RemoteResolver,
    writer: &mut BatchWriter<Box<dyn Write>>,
) -> Result<bool> {
    let rows = store.record_fields(handle)?;
    if rows.is_empty() {
        tracing::warn!(%handle, "record does not exist in the database");
        return Ok(false);
    }
    let record = FieldIndex::build(rows)?;
    let statements = transform(handle, &record, config, |target| resolver.resolve(target))?;
    if statements.is_empty() {
        return Ok(false);
    }
    writer
        .write_record_block(handle, &statements)
        .with_context(|| format!("writing batch block for {handle}"))?;
    Ok(true)
}
