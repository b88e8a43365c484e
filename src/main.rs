use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use imfeat::config::Opts;
use imfeat::dsift::DenseSift;
use imfeat::extract::load_features;
use imfeat::features::{Features, write_features};
use imfeat::imread::Decoder;
use imfeat::parallel::par_map;
use imfeat::source::{resolve_dirs, sample_images};

fn main() -> Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let dirs = opts.dirs_map()?;
    if dirs.is_empty() {
        bail!("must specify some images to load (--root-dir, --dirs or --labeled-dir)");
    }
    confirm_outfile(&opts.output)?;

    let resolved = resolve_dirs(&dirs, &opts.extensions_set())?;
    let entries = sample_images(resolved, opts.files.num_per_class, opts.files.sampler)?;
    let decoder = Decoder::probe(&opts.imread_modes())?;

    let params = opts.descriptor_params();
    let routine = DenseSift;
    info!("extracting descriptors from {} images", entries.len());

    let pb = ProgressBar::new(entries.len() as u64).with_style(pb_style());
    let batches = par_map(
        &entries,
        |entry| {
            let batch = load_features(&entry.path(), &decoder, &routine, &params);
            pb.inc(1);
            batch
        },
        &opts.parallelism(),
    )?;
    pb.finish_with_message("extraction complete");

    let mut features = Features::with_capacity(entries.len());
    for (entry, batch) in entries.into_iter().zip(batches) {
        features.push(entry.label, entry.name, batch);
    }

    let attrs = BTreeMap::from([("args".to_owned(), serde_json::to_string(&opts)?)]);
    println!("Saving results to {}", opts.output.display());
    write_features(&opts.output, features, attrs)?;
    Ok(())
}

fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("static progress template")
        .progress_chars("#>-")
}

fn confirm_outfile(path: &Path) -> Result<()> {
    if path.exists() {
        let answer = read_line(&format!("{} exists, overwrite? [y/N] ", path.display()))?;
        if !matches!(answer.as_str(), "y" | "Y" | "yes") {
            bail!("refusing to overwrite {}", path.display());
        }
    }
    Ok(())
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let v = std::io::stdin()
        .bytes()
        .take_while(|c| c.as_ref().ok() != Some(&b'\n'))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(String::from_utf8(v)?.trim().to_owned())
}
