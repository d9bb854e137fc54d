//! `fuzzalloc-pass`: the build-time CLI that sequences the D-G
//! transformation pipeline over one or more module dumps.
//!
//! A real integration would hook these passes into a compiler plugin; this
//! binary is the thin, testable front end SPEC_FULL's EXPANSION calls for
//! instead — it reads each module, drives
//! [`fuzzalloc::passes::run_pipeline`], and writes the rewritten module back
//! out, reporting what it instrumented.
//!
//! Independent modules are dispatched one-per-worker to a [`threadpool`]
//! sized by available parallelism (SPEC_FULL §5 EXPANSION: "Build-time
//! parallelism"); one module's own D→E→F→G sequence still runs start to
//! finish on a single worker, since E depends on D's tag log and G depends
//! on F's no-instrument markers. Workers report back over a
//! [`crossbeam::channel`] rather than a shared `Mutex<Vec<_>>`, so collecting
//! results never blocks a worker still writing its output file.

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use crossbeam::channel;
use fuzzalloc::config::{self, Config};
use fuzzalloc::{ir_text, passes};

#[derive(Parser, Debug)]
#[command(name = "fuzzalloc-pass", about = "Rewrites one or more IR module dumps for data-flow coverage fuzzing")]
struct Args {
    /// Module dump(s) to rewrite (this crate's line-oriented IR text format).
    #[arg(required = true, num_args = 1..)]
    inputs: Vec<String>,

    /// Where to write the rewritten module. Only meaningful with a single
    /// input; with several inputs each is always overwritten in place.
    #[arg(short, long)]
    output: Option<String>,

    /// Special-case list of additional allocator wrapper entry points.
    /// Overrides FUZZALLOC_MEM_FUNCS/FUZZALLOC_WHITELIST if given.
    #[arg(short, long)]
    whitelist: Option<String>,

    /// Tag log path. Overrides FUZZALLOC_TAG_LOG if given.
    #[arg(short, long)]
    tag_log: Option<String>,

    /// Seed for this invocation's tag draws, shared across every module so a
    /// rerun over unchanged inputs reassigns the same tags. Defaults to a
    /// fixed value so repeated runs are reproducible.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,
}

fn process_one(input: &str, output: &str, config: &Config, seed: u64) -> Result<usize, String> {
    let text = fs::read_to_string(input).map_err(|e| format!("reading {input}: {e}"))?;
    let mut module = ir_text::parse_module(&text).map_err(|e| format!("parsing {input}: {e}"))?;

    let sites = passes::run_pipeline(&mut module, config, seed).map_err(|e| e.to_string())?;

    fs::write(output, ir_text::render_module(&module)).map_err(|e| format!("writing {output}: {e}"))?;
    Ok(sites.len())
}

fn run(args: Args) -> Result<(), String> {
    if args.output.is_some() && args.inputs.len() > 1 {
        return Err("--output only applies to a single input".to_string());
    }

    let mut cfg = config::Config::from_env();
    if let Some(path) = args.whitelist {
        cfg.whitelist_path = Some(path);
    }
    if let Some(path) = args.tag_log {
        cfg.tag_log_path = Some(path);
    }
    let config = Arc::new(cfg);

    let worker_count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(args.inputs.len()).max(1);
    let pool = threadpool::ThreadPool::new(worker_count);
    let (tx, rx) = channel::unbounded();

    for input in &args.inputs {
        let input = input.clone();
        let output = args.output.clone().unwrap_or_else(|| input.clone());
        let config = Arc::clone(&config);
        let tx = tx.clone();
        let seed = args.seed;
        pool.execute(move || {
            let result = process_one(&input, &output, &config, seed);
            let _ = tx.send((input, output, result));
        });
    }
    drop(tx);
    pool.join();

    let mut failed = false;
    for (input, output, result) in rx {
        match result {
            Ok(count) => log::info!("fuzzalloc-pass: rewrote {output} from {input} ({count} sites instrumented)"),
            Err(detail) => {
                eprintln!("fuzzalloc-pass: {input}: {detail}");
                failed = true;
            }
        }
    }

    if failed {
        Err("one or more modules failed to process".to_string())
    } else {
        Ok(())
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(detail) => {
            eprintln!("fuzzalloc-pass: {detail}");
            ExitCode::FAILURE
        }
    }
}
