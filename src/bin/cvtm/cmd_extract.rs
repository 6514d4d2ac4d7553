use anyhow::{anyhow, Result};
use std::fs::File;

use cvtm::{extract_archive, ExtractOptions};

use crate::cli::ExtractArgs;
use crate::util::read_private_key_file;

pub fn exec(args: ExtractArgs) -> Result<()> {
    let private_key = match &args.private_key {
        Some(path) => Some(read_private_key_file(path)?),
        None => None,
    };

    let file = File::open(&args.file)
        .map_err(|e| anyhow!("error opening input {}: {}", args.file.display(), e))?;

    let options = ExtractOptions {
        private_key,
        image_name: args.image_name,
        overwrite: args.overwrite,
        raw: args.raw,
    };

    extract_archive(&file, &options)
}
