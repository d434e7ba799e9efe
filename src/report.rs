//! Text front-end: the sampled tree rendered to a writer, the
//! `du`-compatible dump, and compare-mode deltas. The interactive curses
//! UI lives elsewhere; everything here is plain text.

use std::fmt;
use std::io;

use itertools::Itertools;

use crate::paths::{BrowserPathId, BrowserTree, SampleKind};
use crate::state::GlobalState;

/// z-score for the 95 % confidence interval.
const Z_95: f64 = 1.96;

/// Half-width of the 95 % confidence interval, in bytes, for a node with
/// `samples` of `total` samples.
pub fn error_margin(state: &GlobalState, samples: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    let p = samples as f64 / total as f64;
    let sigma = (p * (1.0 - p) / total as f64).sqrt();
    (Z_95 * sigma * state.total_size as f64).round() as u64
}

/// Estimated size in bytes represented by `samples`.
pub fn estimate_bytes(state: &GlobalState, samples: u64) -> u64 {
    if state.total_samples == 0 {
        return 0;
    }
    (samples as f64 * state.total_size as f64 / state.total_samples as f64).round() as u64
}

/// Render the sampled hierarchy, heaviest subtrees first, skipping
/// anything below `min_fraction` of the total.
pub fn print_tree<W: fmt::Write>(
    state: &GlobalState,
    w: &mut W,
    min_fraction: Option<f64>,
) -> fmt::Result {
    writeln!(
        w,
        "total {} over {} samples, resolution {}",
        bytesize::to_string(state.total_size, true),
        state.total_samples,
        bytesize::to_string(state.resolution() as u64, true),
    )?;
    print_node(state, w, BrowserTree::ROOT, 0, min_fraction)
}

fn print_node<W: fmt::Write>(
    state: &GlobalState,
    w: &mut W,
    id: BrowserPathId,
    depth: usize,
    min_fraction: Option<f64>,
) -> fmt::Result {
    let samples = state.counts_at(id, SampleKind::Represented).samples;
    let total = state.total_samples.max(1);
    let fraction = samples as f64 / total as f64;
    if let Some(min) = min_fraction {
        if fraction < min && id != BrowserTree::ROOT {
            return Ok(());
        }
    }

    if id != BrowserTree::ROOT {
        let node = state.browser.get(id);
        let name = String::from_utf8_lossy(state.names.display(node.name)).into_owned();
        let path = {
            let mut p = String::new();
            for _ in 1..depth {
                p.push_str("  ");
            }
            p.push('/');
            p.push_str(&name);
            p
        };
        writeln!(
            w,
            "{:60} {:>10} {:>5.1}% {:>12} ±{}",
            path,
            samples,
            fraction * 100.0,
            bytesize::to_string(estimate_bytes(state, samples), true),
            bytesize::to_string(error_margin(state, samples, state.total_samples), true),
        )?;
    }

    let children = state
        .browser
        .children_of(id)
        .sorted_by_key(|&c| std::cmp::Reverse(state.counts_at(c, SampleKind::Represented).samples));
    for child in children {
        print_node(state, w, child, depth + 1, min_fraction)?;
    }
    Ok(())
}

/// Block size for the `du`-compatible output, from the environment:
/// `POSIXLY_CORRECT` forces 512, otherwise the first set variable of
/// `BTDU_BLOCK_SIZE`, `DU_BLOCK_SIZE`, `BLOCK_SIZE`, `BLOCKSIZE` wins,
/// default 1024.
pub fn block_size_from_env() -> u64 {
    if std::env::var_os("POSIXLY_CORRECT").is_some() {
        return 512;
    }
    for var in ["BTDU_BLOCK_SIZE", "DU_BLOCK_SIZE", "BLOCK_SIZE", "BLOCKSIZE"] {
        if let Some(val) = std::env::var_os(var) {
            if let Ok(n) = val.to_string_lossy().parse::<u64>() {
                if n > 0 {
                    return n;
                }
            }
        }
    }
    1024
}

/// `du`-style dump: children before parents, one `<blocks>\t<path>` line
/// per node.
pub fn write_du<W: io::Write>(state: &GlobalState, w: &mut W, block_size: u64) -> io::Result<()> {
    write_du_node(state, w, BrowserTree::ROOT, block_size)?;
    Ok(())
}

fn write_du_node<W: io::Write>(
    state: &GlobalState,
    w: &mut W,
    id: BrowserPathId,
    block_size: u64,
) -> io::Result<()> {
    let children = state
        .browser
        .children_of(id)
        .sorted_by(|&a, &b| state.browser.compare(&state.names, a, b));
    for child in children {
        write_du_node(state, w, child, block_size)?;
    }
    let bytes = estimate_bytes(state, state.counts_at(id, SampleKind::Represented).samples);
    let blocks = (bytes + block_size - 1) / block_size;
    writeln!(
        w,
        "{}\t{}",
        blocks,
        state.browser.format_path(&state.names, id)
    )
}

/// Compare-mode report: per-path represented-sample deltas between `state`
/// and an imported `baseline`, scaled to bytes of each state's own run.
pub fn print_compare<W: fmt::Write>(
    state: &GlobalState,
    baseline: &GlobalState,
    w: &mut W,
) -> fmt::Result {
    writeln!(
        w,
        "comparing {} samples against baseline of {}",
        state.total_samples, baseline.total_samples
    )?;
    compare_node(state, baseline, w, BrowserTree::ROOT, Some(BrowserTree::ROOT), 0)
}

fn compare_node<W: fmt::Write>(
    state: &GlobalState,
    baseline: &GlobalState,
    w: &mut W,
    id: BrowserPathId,
    base_id: Option<BrowserPathId>,
    depth: usize,
) -> fmt::Result {
    if id != BrowserTree::ROOT {
        let here = estimate_bytes(state, state.counts_at(id, SampleKind::Represented).samples);
        let there = base_id
            .map(|b| estimate_bytes(baseline, baseline.counts_at(b, SampleKind::Represented).samples))
            .unwrap_or(0);
        let delta = here as i64 - there as i64;
        if delta != 0 {
            let name = String::from_utf8_lossy(
                state.names.display(state.browser.get(id).name),
            )
            .into_owned();
            let mut path = String::new();
            for _ in 1..depth {
                path.push_str("  ");
            }
            path.push('/');
            path.push_str(&name);
            let sign = if delta > 0 { '+' } else { '-' };
            writeln!(
                w,
                "{:60} {}{}",
                path,
                sign,
                bytesize::to_string(delta.unsigned_abs(), true)
            )?;
        }
    }

    let children = state
        .browser
        .children_of(id)
        .sorted_by(|&a, &b| state.browser.compare(&state.names, a, b));
    for child in children {
        // Match the baseline's node by name bytes; the two states have
        // separate name tables.
        let child_name = state.names.get(state.browser.get(child).name).to_vec();
        let base_child = base_id.and_then(|b| {
            baseline.browser.children_of(b).find(|&bc| {
                baseline.names.get(baseline.browser.get(bc).name) == child_name.as_slice()
            })
        });
        compare_node(state, baseline, w, child, base_child, depth + 1)?;
    }
    Ok(())
}
