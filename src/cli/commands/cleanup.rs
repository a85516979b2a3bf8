//! Cleanup command - remove a bundle entirely

use crate::cli::args::CleanupArgs;
use crate::config::Config;
use crate::error::StowageResult;
use crate::ui::{self, UiContext};
use crate::unpack::{BundleUnpacker, Unpacker};

/// Execute the cleanup command
pub async fn execute(args: CleanupArgs, config: &Config) -> StowageResult<()> {
    let unpacker = BundleUnpacker::from_config(config)?;
    unpacker.cleanup(&args.name).await?;

    let ctx = UiContext::detect();
    ui::step_ok_detail(&ctx, "Bundle removed", &args.name);
    Ok(())
}
