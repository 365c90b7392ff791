//! MGLRU stats inspection command.

use clap::Args;
use std::path::PathBuf;
use vmmem::config::VmmemConfig;
use vmmem::mglru;

/// Parse and print MGLRU stats.
#[derive(Args, Debug)]
pub struct MglruCmd {
    /// Stats file to read (defaults to the configured host file)
    #[arg(short, long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Page size in bytes (defaults to the system page size)
    #[arg(long, value_name = "BYTES")]
    pub page_size: Option<u64>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl MglruCmd {
    /// Execute the mglru command.
    pub fn run(&self, config: &VmmemConfig) -> vmmem::Result<()> {
        let path = self
            .file
            .clone()
            .unwrap_or_else(|| config.local_mglru_path.clone());
        let page_size = self.page_size.unwrap_or_else(mglru::page_size);

        let stats = mglru::read_stats(&path, page_size)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }

        print!("{}", mglru::format(&stats, page_size));
        println!();
        println!("{:<8} {:<8} {:>12} {:>12}", "MEMCG", "NODES", "ANON_KB", "FILE_KB");
        println!("{}", "-".repeat(44));
        for memcg in &stats.cgs {
            let (anon_kb, file_kb) = memcg
                .nodes
                .iter()
                .flat_map(|node| node.generations.iter())
                .fold((0u64, 0u64), |(anon, file), generation| {
                    (anon + generation.anon_kb, file + generation.file_kb)
                });
            println!(
                "{:<8} {:<8} {:>12} {:>12}",
                memcg.id,
                memcg.nodes.len(),
                anon_kb,
                file_kb
            );
        }

        Ok(())
    }
}
