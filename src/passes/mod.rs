//! The D-G transformation pipeline (§4): tag collection, allocation
//! tagging, heapification, and dereference instrumentation, each a pure
//! function over an in-memory [`crate::ir::Module`].

pub mod collect;
pub mod heapify;
pub mod instrument;
pub mod tagging;

use crate::config::Config;
use crate::error::FuzzallocError;
use crate::ir::Module;
use crate::whitelist::Whitelist;

/// Runs D, E, F, G over `module` in order, as a single build-time
/// invocation (§2: "the compiler first invokes D ... E ... F ... G").
///
/// Returns the instrumentation sites G chose, mirroring what a real driver
/// would report in a build log.
pub fn run_pipeline(module: &mut Module, config: &Config, seed: u64) -> Result<Vec<instrument::InstrumentedSite>, FuzzallocError> {
    let whitelist = match &config.whitelist_path {
        Some(path) => Whitelist::load(path)?,
        None => Whitelist::default(),
    };

    let collected = collect::collect(module, &whitelist);
    if let Some(tag_log_path) = &config.tag_log_path {
        crate::taglog::append_deduplicated(tag_log_path, &collected)?;
    }

    tagging::run(module, &collected, seed);
    heapify::run(module, &config.heapify_policy, seed.wrapping_add(1));
    let sites = instrument::run(module, config.sensitivity);

    Ok(sites)
}
