use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use itertools::Itertools;
use serde_json::{json, Value};
use tracing::Level;

use scoped_cache::{CacheOptions, ContextArena, ContextId, Inheritance, ScopePolicy, ScopedCache};

/// Build a context tree, run lookups through a scoped cache and print what
/// each lookup returned.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Context to add, as NAME or NAME:PARENT. Parents must be listed first.
    #[arg(long = "context", value_name = "NAME[:PARENT]", required = true)]
    contexts: Vec<String>,
    /// Lookup to run, as CONTEXT:KEY. Lookups run in the order given.
    #[arg(long = "get", value_name = "CONTEXT:KEY")]
    gets: Vec<String>,
    /// JSON file with cache options (`{"scope": ..., "inheritance": ...}`)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Scope policy; overrides the config file
    #[arg(long)]
    scope: Option<ScopePolicy>,
    /// Inheritance policy; overrides the config file
    #[arg(long)]
    inheritance: Option<Inheritance>,
    /// Also print cache statistics
    #[arg(long)]
    stats: bool,
    /// Trace cache hits and misses on stderr
    #[arg(short, long)]
    verbose: bool,
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Split `a:b` into its two trimmed halves.
fn pair(spec: &str) -> Option<(&str, &str)> {
    spec.split(':').map(str::trim).collect_tuple()
}

fn load_options(args: &Args) -> CacheOptions {
    let mut opts = match args.config.as_ref() {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .unwrap_or_else(|e| fail(format!("Cannot read {}: {e}", path.display())));
            serde_json::from_str(&text)
                .unwrap_or_else(|e| fail(format!("Invalid config {}: {e}", path.display())))
        }
        None => CacheOptions::default(),
    };
    if let Some(scope) = args.scope { opts.scope = scope; }
    if let Some(inheritance) = args.inheritance { opts.inheritance = inheritance; }
    opts
}

fn build_tree(specs: &[String]) -> ContextArena {
    let mut arena = ContextArena::new();
    for spec in specs {
        let (name, parent) = if spec.contains(':') {
            match pair(spec) {
                Some((name, parent)) => (name, Some(parent)),
                None => fail(format!("Invalid context `{spec}`, expected NAME:PARENT")),
            }
        } else {
            (spec.trim(), None)
        };
        if name.is_empty() {
            fail(format!("Invalid context `{spec}`, name is empty"));
        }
        if arena.find(name).is_some() {
            fail(format!("Duplicate context `{name}`"));
        }
        match parent {
            None => { arena.root(name); }
            Some(parent) => {
                let parent_id = arena
                    .find(parent)
                    .unwrap_or_else(|| fail(format!("Unknown parent `{parent}` for `{name}`")));
                arena.child(parent_id, name);
            }
        }
    }
    arena
}

fn path_of(arena: &ContextArena, id: ContextId) -> String {
    let names = arena.ancestors(id).filter_map(|a| arena.name(a)).collect::<Vec<_>>();
    names.into_iter().rev().join("/")
}

fn main() {
    // Parse CLI arguments.
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if args.verbose { Level::TRACE } else { Level::WARN })
        .init();

    let opts = load_options(&args);
    let arena = build_tree(&args.contexts);

    // Every creation gets the next serial, so independent values are visible.
    let serial = AtomicU64::new(1);
    let cache: ScopedCache<ContextId, String, Value> = ScopedCache::configure(
        move |key: &String| json!({ "key": key, "serial": serial.fetch_add(1, Ordering::SeqCst) }),
        opts.scope,
        opts.inheritance,
    )
    .unwrap_or_else(|e| fail(format!("Invalid cache options: {e}")));

    let mut lookups = Vec::with_capacity(args.gets.len());
    for spec in &args.gets {
        let (ctx_name, key) = pair(spec)
            .unwrap_or_else(|| fail(format!("Invalid lookup `{spec}`, expected CONTEXT:KEY")));
        let ctx = arena
            .find(ctx_name)
            .unwrap_or_else(|| fail(format!("Unknown context `{ctx_name}`")));
        let value = cache
            .get(&arena, ctx, key.to_string())
            .unwrap_or_else(|e| fail(format!("Lookup `{spec}` failed: {e}")));
        lookups.push(json!({
            "context": path_of(&arena, ctx),
            "key": key,
            "value": value,
        }));
    }

    let out: Value = if args.stats {
        json!({ "lookups": lookups, "stats": cache.stats() })
    } else {
        Value::Array(lookups)
    };
    match serde_json::to_string_pretty(&out) {
        Ok(text) => println!("{text}"),
        Err(e) => fail(format!("Cannot render output: {e}")),
    }
}
