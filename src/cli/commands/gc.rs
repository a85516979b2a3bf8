//! Gc command - drop every generation except the current one

use crate::cli::args::GcArgs;
use crate::config::Config;
use crate::error::StowageResult;
use crate::source::Digest;
use crate::ui::{self, UiContext};
use crate::unpack::{BundleUnpacker, Unpacker};

/// Execute the gc command
pub async fn execute(args: GcArgs, config: &Config) -> StowageResult<()> {
    let keep: Digest = args.keep.parse()?;
    let unpacker = BundleUnpacker::from_config(config)?;

    let removed = unpacker.garbage_collect(&args.name, &keep).await?;

    let ctx = UiContext::detect();
    if removed.is_empty() {
        ui::step_info(&ctx, &format!("No stale generations for {}", args.name));
    } else {
        for path in &removed {
            ui::step_ok_detail(&ctx, "Removed", &path.display().to_string());
        }
    }
    Ok(())
}
