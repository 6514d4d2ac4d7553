use anyhow::{anyhow, bail, Result};
use std::fs::OpenOptions;
use std::io::BufWriter;

use cvtm::consts::{BLOCK_SIZE, ENDING_CIPHER_RSA};
use cvtm::fill::PipeSink;
use cvtm::{write_empty_archive, LogConf, NewArchiveOptions};

use crate::cli::CreateArgs;
use crate::util::read_public_key_file;

pub fn exec(args: CreateArgs) -> Result<()> {
    if (args.au as u64) < BLOCK_SIZE || !args.au.is_power_of_two() {
        bail!("allocation unit must be a power of 2 blocks");
    }

    let public_key = match (&args.public_key, args.ending_cipher.algo()) {
        (Some(path), ENDING_CIPHER_RSA) => Some(read_public_key_file(path)?),
        (None, ENDING_CIPHER_RSA) => bail!("public key not given"),
        (Some(_), _) => bail!("cipher is null, but public key is given"),
        (None, _) => None,
    };

    let mut conf = NewArchiveOptions {
        disk_size: args.size.unwrap_or(0),
        global_logs: vec![LogConf { size: 1 }],
        img_logs: vec![LogConf { size: 1 }],
        end_pointers_head: args.end_pointers_head,
        end_pointers_tail: args.end_pointers_tail,
        ending_cipher: args.ending_cipher.algo(),
        end_pointer_checksum: args.end_pointer_checksum.algo(),
        public_key,
        img_cipher: args.image_cipher.algo(),
        img_cluster_size_exp: bytes_to_blk_exp(args.au),
        alignment_blocks: args.au as u64 / BLOCK_SIZE,
        fill_method: args.fill.method(),
    };

    if args.file == "-" {
        if conf.disk_size == 0 {
            bail!("output size is 0");
        }
        let stdout = std::io::stdout().lock();
        write_empty_archive(PipeSink::new(BufWriter::new(stdout)), &conf)?;
        return Ok(());
    }

    let file = OpenOptions::new()
        .write(true)
        .create(args.size.is_some())
        .open(&args.file)
        .map_err(|e| anyhow!("error opening output {}: {}", args.file, e))?;

    if conf.disk_size == 0 {
        // Размер не задан: берём длину существующего файла
        conf.disk_size = file.metadata()?.len();
        if conf.disk_size == 0 {
            bail!("output size is 0");
        }
    }

    write_empty_archive(BufWriter::new(&file), &conf)?;
    file.sync_all()?;
    Ok(())
}

/// Перевести размер единицы аллокации в ImgClusterSizeExp:
/// au = 512 << exp, т.е. exp = log2(au) - 9.
fn bytes_to_blk_exp(au: u32) -> u8 {
    let mut n = au / (2 * BLOCK_SIZE as u32);
    let mut r = 0u8;
    while n != 0 {
        r += 1;
        n >>= 1;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_exp_from_allocation_unit() {
        // 9 + exp даёт cluster_bits = log2(au)
        assert_eq!(bytes_to_blk_exp(512), 0);
        assert_eq!(bytes_to_blk_exp(1024), 1);
        assert_eq!(bytes_to_blk_exp(4096), 3);
        assert_eq!(bytes_to_blk_exp(0x10000), 7);
    }
}
