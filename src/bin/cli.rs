// CLI binary: panicking on unrecoverable errors is fine for a command-line tool.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::unreachable, clippy::indexing_slicing)]

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use danmaku_script::artifact::CompiledScript;
use danmaku_script::cache::{ScriptCache, ScriptKind};
use danmaku_script::dsl::builtins::RUNTIME_FNS;
use danmaku_script::dsl::sema;
use danmaku_script::error::LoadError;
use danmaku_script::fs::OsFileSystem;
use danmaku_script::parser::{JsonAstParser, ScriptParser};
use danmaku_script::paths;
use danmaku_script::persist;
use danmaku_script::settings::{self, CompilerSettings};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "danmakuc", about = "Danmaku script compiler", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Compiler settings file (defaults to ./danmakuc.json if present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Output raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile one script and print part of the artifact
    Compile {
        /// JSON AST of the script
        file: PathBuf,
        /// Script kind (defaults to the script's own header)
        #[arg(long)]
        kind: Option<ScriptKind>,
        #[arg(long, default_value = "ph3")]
        version: String,
        #[arg(long, value_enum, default_value_t = Emit::Source)]
        emit: Emit,
        /// Also write the artifact into this directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the semantic checker only
    Check { file: PathBuf },
    /// Compile several scripts concurrently
    Build {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Script kind for every file (defaults to each script's header)
        #[arg(long)]
        kind: Option<ScriptKind>,
        #[arg(long, default_value = "ph3")]
        version: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List the runtime functions generated code expects the host to provide
    RuntimeFns,
}

#[derive(Clone, Copy, ValueEnum)]
enum Emit {
    Source,
    Map,
    Header,
    Entries,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> CompilerSettings {
    let path = path.map_or_else(|| paths::settings_path(Path::new(".")), Path::to_path_buf);
    match settings::load_settings(&path) {
        Ok(found) => found.unwrap_or_default(),
        Err(e) => {
            eprintln!("Failed to load settings '{}': {e}", path.display());
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings = load_settings(cli.settings.as_deref());
    let cache = ScriptCache::with_defaults(settings);

    let ok = match &cli.command {
        Commands::Compile { file, kind, version, emit, out } => {
            run_compile(&cache, file, *kind, version, *emit, out.as_deref(), cli.json)
        }
        Commands::Check { file } => run_check(file, cli.json),
        Commands::Build { files, kind, version, out } => {
            run_build(&cache, files, *kind, version, out.as_deref(), cli.json).await
        }
        Commands::RuntimeFns => {
            print_runtime_fns(cli.json);
            true
        }
    };
    if !ok {
        process::exit(1);
    }
}

// ── Commands ─────────────────────────────────────────────────────

/// An unreadable script falls back to `Unknown`; the load reports the error.
fn resolve_kind(file: &Path, kind: Option<ScriptKind>) -> ScriptKind {
    kind.unwrap_or_else(|| {
        JsonAstParser
            .parse(file, &OsFileSystem)
            .map_or(ScriptKind::Unknown, |script| ScriptKind::declared_by(&script))
    })
}

fn run_compile(
    cache: &ScriptCache,
    file: &Path,
    kind: Option<ScriptKind>,
    version: &str,
    emit: Emit,
    out: Option<&Path>,
    json: bool,
) -> bool {
    let artifact = match cache
        .signature_for(file, resolve_kind(file, kind), version)
        .and_then(|sig| cache.load(sig))
    {
        Ok(artifact) => artifact,
        Err(e) => {
            report_error(&e, json);
            return false;
        }
    };
    if let Some(dir) = out {
        write_artifact(dir, &artifact);
    }
    print_artifact(&artifact, emit, json);
    true
}

fn run_check(file: &Path, json: bool) -> bool {
    let script = match JsonAstParser.parse(file, &OsFileSystem) {
        Ok(script) => script,
        Err(source) => {
            report_error(&LoadError::Parse { path: file.to_path_buf(), source }, json);
            return false;
        }
    };
    match sema::check(&script) {
        Ok(()) => {
            if json {
                println!("{}", serde_json::json!({ "ok": true, "diagnostics": [] }));
            } else {
                println!("{}: ok", file.display());
            }
            true
        }
        Err(errors) => {
            if json {
                let out = serde_json::json!({ "ok": false, "diagnostics": errors });
                println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
            } else {
                for e in &errors {
                    println!("{}", e.format_with_files(&script.files));
                }
            }
            false
        }
    }
}

async fn run_build(
    cache: &ScriptCache,
    files: &[PathBuf],
    kind: Option<ScriptKind>,
    version: &str,
    out: Option<&Path>,
    json: bool,
) -> bool {
    let mut handles = Vec::new();
    let mut ok = true;
    for file in files {
        match cache.signature_for(file, resolve_kind(file, kind), version) {
            Ok(sig) => handles.push((file, cache.load_async(sig))),
            Err(e) => {
                report_error(&e, json);
                ok = false;
            }
        }
    }
    let results = futures_util::future::join_all(handles.iter().map(|(_, h)| h.resolved())).await;

    let mut summary = Vec::new();
    for ((file, _), result) in handles.iter().zip(results) {
        match result {
            Ok(artifact) => {
                if let Some(dir) = out {
                    write_artifact(dir, &artifact);
                }
                summary.push(serde_json::json!({
                    "file": file.display().to_string(),
                    "ok": true,
                    "entries": artifact.entry_points(),
                    "bytes": artifact.bytecode().len(),
                }));
                if !json {
                    println!("{}: ok ({} bytes)", file.display(), artifact.bytecode().len());
                }
            }
            Err(e) => {
                ok = false;
                summary.push(serde_json::json!({
                    "file": file.display().to_string(),
                    "ok": false,
                    "error": e.render(),
                }));
                if !json {
                    eprintln!("{}", e.render());
                }
            }
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&Value::Array(summary)).unwrap_or_default());
    }
    eprintln!("{} script(s), {} compile(s)", files.len(), cache.compile_count());
    ok
}

// ── Output formatting ────────────────────────────────────────────

fn write_artifact(dir: &Path, artifact: &CompiledScript) {
    let target = paths::artifact_path(dir, &artifact.signature().path);
    let result = std::fs::create_dir_all(dir)
        .map_err(persist::PersistError::from)
        .and_then(|()| persist::atomic_write(&target, &artifact.to_json()?));
    if let Err(e) = result {
        eprintln!("Failed to write '{}': {e}", target.display());
        process::exit(1);
    }
}

fn print_artifact(artifact: &CompiledScript, emit: Emit, json: bool) {
    let value = match emit {
        Emit::Source => {
            let source = String::from_utf8_lossy(artifact.bytecode().as_bytes()).into_owned();
            if !json {
                print!("{source}");
                return;
            }
            Value::String(source)
        }
        Emit::Map => serde_json::to_value(artifact.source_map().unwrap()).unwrap(),
        Emit::Header => serde_json::to_value(artifact.header().unwrap()).unwrap(),
        Emit::Entries => {
            if !json {
                for (name, mangled) in artifact.entry_points() {
                    println!("{name} -> {mangled}");
                }
                return;
            }
            serde_json::to_value(artifact.entry_points()).unwrap()
        }
    };
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
}

fn print_runtime_fns(json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(RUNTIME_FNS).unwrap_or_default());
        return;
    }
    for f in RUNTIME_FNS {
        println!("{:<8} rt.{}/{}  {}", f.category, f.name, f.arity, f.description);
    }
}

fn report_error(error: &LoadError, json: bool) {
    if json {
        let out = serde_json::json!({ "ok": false, "error": error.render() });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    } else {
        eprintln!("{}", error.render());
    }
}
