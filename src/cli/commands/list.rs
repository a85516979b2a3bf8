//! List command - show cached bundles and their generations

use crate::cache::Generation;
use crate::cli::args::{ListArgs, OutputFormat};
use crate::config::Config;
use crate::error::StowageResult;
use crate::ui::{self, UiContext};
use crate::unpack::BundleUnpacker;
use console::style;

/// Execute the list command
pub async fn execute(args: ListArgs, config: &Config) -> StowageResult<()> {
    let unpacker = BundleUnpacker::from_config(config)?;

    let names = match args.name {
        Some(name) => vec![name],
        None => unpacker.list_bundles().await?,
    };

    let mut generations = Vec::new();
    for name in &names {
        generations.extend(unpacker.list_generations(name).await?);
    }

    if generations.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_info(&ctx, "No cached bundles");
            }
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&generations),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&generations)?),
        OutputFormat::Plain => {
            for generation in &generations {
                println!("{}", generation.path.display());
            }
        }
    }

    Ok(())
}

fn print_table(generations: &[Generation]) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Bundles");

    println!(
        "{:<24} {:<10} {:<18} {:<16}",
        style("BUNDLE").bold(),
        style("STATE").bold(),
        style("DIGEST").bold(),
        style("MODIFIED").bold()
    );
    println!("{}", "-".repeat(71));

    for generation in generations {
        let state = if generation.staging {
            style("staging").yellow()
        } else if generation.digest.is_some() {
            style("sealed").green()
        } else {
            style("unknown").dim()
        };
        let digest = generation
            .digest
            .as_ref()
            .map(|d| format!("{}:{}", d.algorithm(), d.short()))
            .unwrap_or_else(|| generation.name.clone());
        let modified = generation
            .modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<24} {:<10} {:<18} {:<16}",
            generation.bundle, state, digest, modified
        );
    }

    println!();
    println!("{} generation(s)", generations.len());
}
