//! ML-DSA-65 keypair generator for servicer-node identities.
//!
//! This utility generates a new ML-DSA-65 keypair and outputs:
//! - The key pair in the node's key directory layout
//! - A genesis entry (TOML) staking the key as a servicer
//!
//! Usage:
//!   cargo run --bin servicer-keygen [output-dir] [chain ...]

use servicer_node::chain::Validator;
use servicer_node::crypto::{PUBLIC_KEY_FILE, SECRET_KEY_FILE};
use servicer_node::Keypair;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(serde::Serialize)]
struct GenesisEntry {
    validators: Vec<Validator>,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    println!("ML-DSA-65 Keypair Generator for servicer-node\n");

    // Output directory and advertised chains from args
    let mut args = env::args().skip(1);
    let output_dir = match args.next() {
        Some(dir) => PathBuf::from(dir),
        None => env::current_dir()?,
    };
    let chains: BTreeSet<String> = args.collect();

    println!("Generating ML-DSA-65 keypair...");
    let keypair = Keypair::generate()?;
    keypair.save(&output_dir)?;

    println!(
        "  Public key size: {} bytes",
        keypair.public_key().as_bytes().len()
    );
    println!("  Address: {}", keypair.address());
    println!(
        "\nSecret key saved to: {}",
        output_dir.join(SECRET_KEY_FILE).display()
    );
    println!("  WARNING: Keep this file secure! It signs every relay response.");
    println!(
        "Public key saved to: {}",
        output_dir.join(PUBLIC_KEY_FILE).display()
    );

    let entry = GenesisEntry {
        validators: vec![Validator {
            public_key: keypair.public_key().clone(),
            chains,
            service_url: String::new(),
            staked_tokens: 1,
            staked: true,
        }],
    };
    let toml = toml::to_string_pretty(&entry)?;

    let genesis_path = output_dir.join("genesis-entry.toml");
    fs::write(
        &genesis_path,
        format!(
            "# Generated: {}\n{toml}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ),
    )?;
    println!("Genesis entry saved to: {}", genesis_path.display());

    println!("\nDone! Append the genesis entry to the development chain's genesis file.");
    Ok(())
}
