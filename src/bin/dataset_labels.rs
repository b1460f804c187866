//! dataset_labels - write the class label map for a training dataset.
//!
//! Each subdirectory of the dataset root is one class; ids follow sorted
//! directory names. The output is the `{"0": "label", ...}` JSON the service
//! loads through `VIDEO_ANALYTICS_LABELS`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use video_analytics::LabelMap;

#[derive(Parser, Debug)]
#[command(
    name = "dataset_labels",
    about = "Write class_labels.json from a <root>/<class>/ dataset layout"
)]
struct Args {
    /// Dataset root holding one directory per class
    #[arg(long, default_value = "data/train", value_name = "DIR")]
    data_dir: PathBuf,

    /// Where to write the label map
    #[arg(long, default_value = "class_labels.json", value_name = "PATH")]
    output: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let labels = LabelMap::from_class_dirs(&args.data_dir)?;
    for (id, label) in labels.iter() {
        log::info!("class {id}: {label}");
    }
    std::fs::write(&args.output, labels.to_json_string()?)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!(
        "dataset_labels: {} classes written to {}",
        labels.len(),
        args.output.display()
    );
    Ok(())
}
