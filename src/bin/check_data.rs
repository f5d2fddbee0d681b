//! Validate a knowledge data directory before deploying it.
//!
//! Usage: cargo run --bin check_data <data_dir> [fuzzy_threshold]
//!
//! Loads crops.json and sowing_times.json exactly as the bot does and prints
//! a summary, or the first error found.

use std::path::Path;

use kisaan_bot::chatbot::KnowledgeStore;
use kisaan_bot::chatbot::knowledge::{CATALOGUE_FILE, SOWING_TABLE_FILE};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <data_dir> [fuzzy_threshold]", args[0]);
        eprintln!();
        eprintln!("Checks {} and {} in <data_dir>.", CATALOGUE_FILE, SOWING_TABLE_FILE);
        std::process::exit(2);
    }

    let dir = Path::new(&args[1]);
    let threshold = match args.get(2).map(|s| s.parse::<usize>()) {
        None => 2,
        Some(Ok(t)) => t,
        Some(Err(e)) => {
            eprintln!("Invalid fuzzy_threshold '{}': {}", args[2], e);
            std::process::exit(2);
        }
    };

    let store = match KnowledgeStore::load(dir, threshold) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("✗ {e}");
            std::process::exit(1);
        }
    };

    println!("✓ {} crops in {:?}", store.crop_count(), dir);
    for crop in store.crops() {
        let timed = crop.varieties.iter().filter(|v| v.sowing_time.is_some()).count();
        println!(
            "  {:<20} {:>3} varieties ({} with sowing time), {:>2} regions, {} aliases",
            crop.name,
            crop.varieties.len(),
            timed,
            crop.sowing.len(),
            crop.aliases.len()
        );
        if crop.varieties.is_empty() && crop.sowing.is_empty() {
            println!("    warning: {} has no varieties and no sowing windows", crop.name);
        }
    }
}
