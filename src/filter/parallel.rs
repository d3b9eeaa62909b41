//! Parallel bulk filter pass.
//!
//! The source is split into contiguous chunks, one per worker. Workers only
//! collect direct hits; spread expansion runs once afterwards over the merged,
//! ascending hit list, so the result is identical to a sequential pass.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::{debug, warn};

use super::index::{PassContext, PassEnd, PassResult, rebuild};
use super::{CompiledFilter, FilterIndex, RangeScanner};

/// Build the worker pool for filter passes.
///
/// Returns `None` when no pool can be created; passes then run sequentially.
pub fn build_filter_pool(workers: usize) -> Option<rayon::ThreadPool> {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|idx| format!("barkview-filter-{idx}"))
        .build()
    {
        Ok(pool) => Some(pool),
        Err(e) => {
            warn!(error = %e, workers, "Failed to build filter pool; filtering sequentially");
            None
        }
    }
}

struct ChunkScan {
    hits: Vec<usize>,
    scanned_to: usize,
    end: PassEnd,
}

fn scan_chunk(
    filter: &CompiledFilter,
    ctx: &PassContext<'_>,
    start: usize,
    end: usize,
    total: usize,
    done: &AtomicUsize,
) -> ChunkScan {
    let interval = ctx.progress_interval.max(1);
    let mut hits = Vec::new();
    for line_no in start..end {
        let scanned = line_no - start;
        if scanned > 0 && scanned % interval == 0 {
            if ctx.cancel.is_cancelled() {
                return ChunkScan {
                    hits,
                    scanned_to: line_no,
                    end: PassEnd::Cancelled,
                };
            }
            if (ctx.renumbered)() {
                return ChunkScan {
                    hits,
                    scanned_to: line_no,
                    end: PassEnd::Renumbered,
                };
            }
            let so_far = done.fetch_add(interval, Ordering::Relaxed) + interval;
            (ctx.progress)(so_far.min(total), total);
        }
        let Some(text) = ctx.source.line(line_no) else {
            return ChunkScan {
                hits,
                scanned_to: line_no,
                end: PassEnd::SourceEnded(line_no),
            };
        };
        if filter.matches(&text) {
            hits.push(line_no);
        }
    }
    ChunkScan {
        hits,
        scanned_to: end,
        end: PassEnd::Completed,
    }
}

/// Build an index over the whole source using `pool`.
///
/// Range searches depend on the previous line's state and run sequentially.
/// On cancellation the index holds the hits of every chunk up to the point
/// each worker stopped.
pub fn parallel_rebuild(filter: &CompiledFilter, ctx: &PassContext<'_>, pool: &rayon::ThreadPool) -> PassResult {
    if filter.is_range_search() {
        debug!("Range search runs sequentially");
        return rebuild(filter, ctx);
    }
    if (ctx.renumbered)() {
        return PassResult {
            index: FilterIndex::new(ctx.window_cap),
            scanner: RangeScanner::default(),
            scanned_to: 0,
            end: PassEnd::Renumbered,
        };
    }

    let total = ctx.source.line_count();
    let workers = pool.current_num_threads().max(1);
    let chunk_len = total.div_ceil(workers).max(1);
    let chunks: Vec<(usize, usize)> = (0..total)
        .step_by(chunk_len)
        .map(|start| (start, (start + chunk_len).min(total)))
        .collect();
    let done = AtomicUsize::new(0);

    let scans: Vec<ChunkScan> = pool.install(|| {
        chunks
            .par_iter()
            .map(|&(start, end)| scan_chunk(filter, ctx, start, end, total, &done))
            .collect()
    });

    let mut index = FilterIndex::new(ctx.window_cap);
    let (before, behind) = filter.spread();
    let mut scanned_to = total;
    let mut end = PassEnd::Completed;
    for scan in &scans {
        for &hit in &scan.hits {
            index.add_hit(hit, before, behind, total);
        }
        if end == PassEnd::Completed && scan.end != PassEnd::Completed {
            scanned_to = scan.scanned_to;
            end = scan.end;
        }
    }
    // One renumbered chunk spoils the whole result
    if scans.iter().any(|scan| scan.end == PassEnd::Renumbered) {
        end = PassEnd::Renumbered;
    }
    debug!(total, workers, chunks = scans.len(), hits = index.hit_count(), "Parallel filter pass done");

    PassResult {
        index,
        scanner: RangeScanner::default(),
        scanned_to,
        end,
    }
}
