//! MGLRU stats parsing.
//!
//! The kernel reports multi-generational LRU aging as text:
//!
//! ```text
//! memcg     1 /
//!  node     0
//!           5      12345        100        200
//!           6      14000         10         20
//! ```
//!
//! Each generation line is `sequence timestamp_ms anon_pages file_pages`;
//! anything after the fourth token is ignored. Page counts are converted to
//! KB once the whole tree has been parsed.

use crate::error::{Error, Result};
use std::fmt::Write as _;
use std::path::Path;
use vmmem_protocol::{Generation, Memcg, MglruStats, Node};

/// Maximum memcgs accepted in one stats tree.
pub const MAX_MEMCGS: usize = 16;

/// Maximum nodes accepted per memcg.
pub const MAX_NODES: usize = 16;

/// Maximum generations accepted per node.
pub const MAX_GENERATIONS: usize = 16;

/// Parse MGLRU stats text.
///
/// Returns `None` if the text does not match the format exactly: every memcg
/// needs at least one node, every node at least one generation, and nothing
/// may follow the last block.
pub fn parse(text: &str, page_size: u64) -> Option<MglruStats> {
    let mut lines = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|tokens| !tokens.is_empty())
        .peekable();

    let mut stats = MglruStats::default();

    while let Some(header) = lines.next() {
        let id = parse_memcg_header(&header)?;
        let mut memcg = Memcg {
            id,
            nodes: Vec::new(),
        };

        while lines.peek().map(|t| t[0] == "node").unwrap_or(false) {
            let header = lines.next()?;
            let mut node = Node {
                id: parse_node_header(&header)?,
                generations: Vec::new(),
            };

            while lines.peek().map(|t| is_generation_line(t)).unwrap_or(false) {
                let tokens = lines.next()?;
                node.generations.push(parse_generation(&tokens)?);
            }

            if node.generations.is_empty() {
                return None;
            }
            memcg.nodes.push(node);
        }

        if memcg.nodes.is_empty() {
            return None;
        }
        stats.cgs.push(memcg);
    }

    if stats.cgs.is_empty() {
        return None;
    }

    let kb_per_page = page_size / 1024;
    for generation in generations_mut(&mut stats) {
        generation.anon_kb *= kb_per_page;
        generation.file_kb *= kb_per_page;
    }

    Some(stats)
}

/// Serialize stats back into the kernel text format.
///
/// Only used for diagnostics.
pub fn format(stats: &MglruStats, page_size: u64) -> String {
    let kb_per_page = (page_size / 1024).max(1);
    let mut out = String::new();

    for memcg in &stats.cgs {
        let _ = writeln!(out, "memcg {:>5}", memcg.id);
        for node in &memcg.nodes {
            let _ = writeln!(out, " node {:>5}", node.id);
            for gen in &node.generations {
                let _ = writeln!(
                    out,
                    " {:>10} {:>10} {:>10} {:>10}",
                    gen.sequence_num,
                    gen.timestamp_ms,
                    gen.anon_kb / kb_per_page,
                    gen.file_kb / kb_per_page
                );
            }
        }
    }

    out
}

/// Check a stats tree against the size caps.
///
/// Stats can come from a guest, so an oversized tree is rejected as a whole.
pub fn within_limits(stats: &MglruStats) -> bool {
    stats.cgs.len() <= MAX_MEMCGS
        && stats.cgs.iter().all(|memcg| {
            memcg.nodes.len() <= MAX_NODES
                && memcg
                    .nodes
                    .iter()
                    .all(|node| node.generations.len() <= MAX_GENERATIONS)
        })
}

/// Read and parse an MGLRU stats file.
pub fn read_stats(path: &Path, page_size: u64) -> Result<MglruStats> {
    let text = std::fs::read_to_string(path)?;
    parse(&text, page_size).ok_or_else(|| Error::InvalidMglru {
        path: path.to_path_buf(),
    })
}

/// System page size in bytes.
pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Iterate over every generation in a tree.
pub fn generations(stats: &MglruStats) -> impl Iterator<Item = &Generation> {
    stats
        .cgs
        .iter()
        .flat_map(|memcg| memcg.nodes.iter())
        .flat_map(|node| node.generations.iter())
}

fn generations_mut(stats: &mut MglruStats) -> impl Iterator<Item = &mut Generation> {
    stats
        .cgs
        .iter_mut()
        .flat_map(|memcg| memcg.nodes.iter_mut())
        .flat_map(|node| node.generations.iter_mut())
}

fn parse_memcg_header(tokens: &[&str]) -> Option<u32> {
    // The kernel appends the cgroup path; it is not needed.
    match tokens {
        ["memcg", id] | ["memcg", id, _] => id.parse().ok(),
        _ => None,
    }
}

fn parse_node_header(tokens: &[&str]) -> Option<u32> {
    match tokens {
        ["node", id] => id.parse().ok(),
        _ => None,
    }
}

fn is_generation_line(tokens: &[&str]) -> bool {
    tokens[0] != "memcg" && tokens[0] != "node"
}

fn parse_generation(tokens: &[&str]) -> Option<Generation> {
    if tokens.len() < 4 {
        return None;
    }

    Some(Generation {
        sequence_num: tokens[0].parse().ok()?,
        timestamp_ms: tokens[1].parse().ok()?,
        anon_kb: tokens[2].parse().ok()?,
        file_kb: tokens[3].parse().ok()?,
    })
}
