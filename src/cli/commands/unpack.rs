//! Unpack command - materialize a bundle in the cache

use crate::cli::args::{OutputFormat, UnpackArgs};
use crate::config::Config;
use crate::error::{StowageError, StowageResult};
use crate::source::BundleSource;
use crate::ui::{self, UiContext};
use crate::unpack::{BundleUnpacker, UnpackResult, UnpackStatus, Unpacker};
use std::path::Path;
use tokio::fs;
use tokio_util::sync::CancellationToken;

/// Execute the unpack command
pub async fn execute(
    args: UnpackArgs,
    config: &Config,
    cancel: CancellationToken,
) -> StowageResult<()> {
    let source = declared_source(&args).await?;
    let unpacker = BundleUnpacker::from_config(config)?;

    let result = if args.gc {
        unpacker.converge(&source, &cancel).await
    } else {
        unpacker.unpack(&source, &cancel).await
    };

    let status = UnpackStatus::from_result(&source.name, &result);
    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Plain => {
            if let Some(path) = &status.path {
                println!("{}", path.display());
            }
        }
        OutputFormat::Table => {
            if let Ok(r) = &result {
                print_result(&source, r);
            }
        }
    }

    result.map(|_| ())
}

async fn declared_source(args: &UnpackArgs) -> StowageResult<BundleSource> {
    if let Some(path) = &args.file {
        return read_source_file(path).await;
    }

    let name = args
        .name
        .clone()
        .ok_or_else(|| StowageError::User("either --file or --name is required".to_string()))?;
    match (&args.image, &args.tgz) {
        (Some(image), None) => Ok(BundleSource::image(name, image)),
        (None, Some(url)) => Ok(BundleSource::tar_gz(name, url)),
        _ => Err(StowageError::User(
            "exactly one of --image or --tgz is required".to_string(),
        )),
    }
}

async fn read_source_file(path: &Path) -> StowageResult<BundleSource> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StowageError::io(format!("reading bundle from {}", path.display()), e))?;
    Ok(toml::from_str(&content)?)
}

fn print_result(source: &BundleSource, result: &UnpackResult) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, &format!("Bundle {}", source.name));
    ui::step_ok_detail(&ctx, &result.message, result.digest.short());
    ui::key_value(&ctx, "source", result.resolved_source.location());
    ui::key_value(&ctx, "digest", &result.digest.to_string());
    ui::key_value(&ctx, "path", &result.bundle.root().display().to_string());
}
