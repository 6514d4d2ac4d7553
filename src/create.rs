//! create — сборка заголовка и запись пустого архива.
//!
//! Раскладка (смещения в блоках по 512 байт):
//!
//! [заголовок][глобальные логи][головные end pointer'ы] — до ImageArea.Start
//! [область образов: страж NO-MORE-IMAGES + свободное место]
//! [хвостовые end pointer'ы][остаток до DiskSize]
//!
//! Каждый end pointer живёт в собственной единице выравнивания, чтобы
//! разорванная запись портила максимум одну копию. Оба набора
//! указателей свежего архива ведут на конец стража:
//! (ImageArea.Start + EndingSize) * 512.
//!
//! Чексумма заголовка: SHA-256 по сериализованному заголовку с
//! обнулённым полем CvtmMagic.Checksum (файловые байты [20, 52)).

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPublicKey};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use sha2::{Digest, Sha256};
use std::io::{Seek, Write};

use crate::consts::{BLOCK_SIZE, ENDING_CIPHER_NULL, ENDING_CIPHER_RSA};
use crate::endptr::make_end_pointer;
use crate::entries::codec::write_entry;
use crate::entries::{
    ArchiveHeaderWrite, EndPointerChec, EndPointerLoca, EndingCipher, EndingSize, GlobalLogLocat,
    ImageArea, ImageBasic, ImageLog, NoMoreImages,
};
use crate::fill::{align_down, align_up, write_zeros, FillMethod, FillWriter};
use crate::randsrc::RandSource;

/// Конфигурация одного лога (размер в блоках).
#[derive(Debug, Clone)]
pub struct LogConf {
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct NewArchiveOptions {
    /// Полный размер носителя в байтах.
    pub disk_size: u64,
    pub global_logs: Vec<LogConf>,
    pub img_logs: Vec<LogConf>,
    pub end_pointers_head: u32,
    pub end_pointers_tail: u32,
    pub ending_cipher: u32,
    pub end_pointer_checksum: u32,
    pub public_key: Option<RsaPublicKey>,
    pub img_cipher: u32,
    pub img_cluster_size_exp: u8,
    /// Единица выравнивания в блоках (степень двойки).
    pub alignment_blocks: u64,
    pub fill_method: FillMethod,
}

/// Записать область ending: данные, при RSA — один OAEP-шифротекст,
/// добивка случайными байтами до ровно `blocks` блоков.
fn write_ending<W: Write + Seek>(
    dest: &mut FillWriter<W>,
    entries: &[u8],
    cipher: u32,
    key: Option<&RsaPublicKey>,
    blocks: u32,
) -> Result<()> {
    let data = match cipher {
        ENDING_CIPHER_NULL => entries.to_vec(),
        ENDING_CIPHER_RSA => {
            let key = key.ok_or_else(|| anyhow!("ending cipher is rsa, but no public key"))?;
            key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), entries)
                .map_err(|e| anyhow!("rsa encrypt failed: {}", e))?
        }
        other => bail!("unknown enumeration value EndingCipher.Algo {}", other),
    };

    let size = blocks as u64 * BLOCK_SIZE;
    if data.len() as u64 > size {
        bail!("image ending too long, {}, max {}", data.len(), size);
    }

    dest.write_all(&data)?;
    // Хвост всегда добивается случайными байтами
    RandSource::global().copy_to(dest, size - data.len() as u64)?;
    Ok(())
}

fn write_repeatedly<W: Write + Seek>(
    dest: &mut FillWriter<W>,
    block: &[u8],
    repeat: u32,
    alignment_bytes: u64,
) -> Result<()> {
    for _ in 0..repeat {
        dest.write_all(block)?;
        dest.align_to(alignment_bytes)?;
    }
    Ok(())
}

/// Записать свежий пустой архив в `out`.
pub fn write_empty_archive<W: Write + Seek>(out: W, conf: &NewArchiveOptions) -> Result<()> {
    let alignment = conf.alignment_blocks;
    if alignment == 0 || !alignment.is_power_of_two() {
        bail!("alignment must be a power of 2 blocks, got {}", alignment);
    }
    let au_bytes = alignment * BLOCK_SIZE;

    // Скелет заголовка с правильными кратностями переменных записей:
    // размер заголовка не должен зависеть от ещё не посчитанных полей.
    let mut header = ArchiveHeaderWrite {
        end_pointer_chec: EndPointerChec {
            algo: conf.end_pointer_checksum,
        },
        end_pointer_loca: vec![
            EndPointerLoca::default();
            (conf.end_pointers_head + conf.end_pointers_tail) as usize
        ],
        ending_cipher: EndingCipher {
            algo: conf.ending_cipher,
            key: Vec::new(),
        },
        global_log_locat: vec![GlobalLogLocat::default(); conf.global_logs.len()],
        image_basic: ImageBasic {
            img_cipher: conf.img_cipher,
            img_cluster_size_exp: conf.img_cluster_size_exp,
        },
        image_log: conf
            .img_logs
            .iter()
            .map(|l| ImageLog { blk_count: l.size })
            .collect(),
        ..ArchiveHeaderWrite::default()
    };

    // Публичный ключ и размер области ending
    let ending_size = match conf.ending_cipher {
        ENDING_CIPHER_NULL => 1,
        ENDING_CIPHER_RSA => {
            let key = conf
                .public_key
                .as_ref()
                .ok_or_else(|| anyhow!("ending cipher is rsa, but no public key"))?;
            header.ending_cipher.key = key
                .to_pkcs1_der()
                .map_err(|e| anyhow!("encode public key: {}", e))?
                .as_bytes()
                .to_vec();
            align_up(key.size() as u64, BLOCK_SIZE) as u32 / BLOCK_SIZE as u32
        }
        other => bail!("unknown enumeration value EndingCipher.Algo {}", other),
    };
    header.ending_size = EndingSize { size: ending_size };

    // Размер заголовка известен после первой сериализации
    let header_size = header.encode().len() as u64;
    header.cvtm_magic.header_length = header_size as u32;
    let mut img_area_start = align_up(header_size, au_bytes) / BLOCK_SIZE;

    // Глобальные логи
    for (i, l) in conf.global_logs.iter().enumerate() {
        header.global_log_locat[i] = GlobalLogLocat {
            start: img_area_start as u32,
            count: l.size,
        };
        img_area_start += align_up(l.size as u64, alignment);
    }

    // Головные end pointer'ы, каждый в своей единице выравнивания
    let end_pointer_start = img_area_start;
    for i in 0..conf.end_pointers_head {
        header.end_pointer_loca[i as usize] = EndPointerLoca {
            blk: img_area_start as u32,
        };
        img_area_start += alignment;
    }

    // Хвостовые end pointer'ы
    let tail_span = alignment * conf.end_pointers_tail as u64;
    let img_area_end = align_down(conf.disk_size / BLOCK_SIZE, alignment)
        .checked_sub(tail_span)
        .ok_or_else(|| anyhow!("not enough space for images, disk size {}", conf.disk_size))?;
    for i in 0..conf.end_pointers_tail {
        header.end_pointer_loca[(conf.end_pointers_head + i) as usize] = EndPointerLoca {
            blk: (img_area_end + i as u64 * alignment) as u32,
        };
    }

    header.image_area = ImageArea {
        start: img_area_start as u32,
        end: img_area_end as u32,
    };

    // Должно остаться место хотя бы под стража
    let sentinel_end = img_area_start + ending_size as u64;
    if sentinel_end > img_area_end {
        bail!(
            "not enough space for images, start {}, end {}",
            sentinel_end,
            img_area_end
        );
    }

    // Чексумма: SHA-256 по заголовку с нулевым полем Checksum,
    // затем патч байтов [20, 52) на месте.
    let mut header_bytes = header.encode();
    let digest = Sha256::digest(&header_bytes);
    header.cvtm_magic.checksum.copy_from_slice(&digest);
    header_bytes[20..52].copy_from_slice(&digest);

    info!(
        "writing empty archive: header {} B, image area [{}, {}) blk, ending {} blk",
        header_size, img_area_start, img_area_end, ending_size
    );

    let mut dest = FillWriter::new(out, conf.fill_method);
    dest.write_all(&header_bytes)?;

    // Нули до первого end pointer'а: глобальные логи и выравнивание
    // перед ними всегда зануляются независимо от метода заполнения.
    let dest_pos = dest.pos();
    write_zeros(&mut dest, end_pointer_start * BLOCK_SIZE - dest_pos)?;

    let point_to = u32::try_from(sentinel_end * BLOCK_SIZE)
        .context("end pointer target does not fit in 32 bits")?;
    let end_pointer = make_end_pointer(point_to, conf.end_pointer_checksum)?;
    write_repeatedly(&mut dest, &end_pointer, conf.end_pointers_head, au_bytes)?;

    dest.seek_to(img_area_start * BLOCK_SIZE)?;

    // Страж конца списка образов
    let mut sentinel = Vec::new();
    write_entry(&mut sentinel, &NoMoreImages::default());
    write_ending(
        &mut dest,
        &sentinel,
        conf.ending_cipher,
        conf.public_key.as_ref(),
        ending_size,
    )?;

    // Остаток области образов
    dest.seek_to(img_area_end * BLOCK_SIZE)?;

    write_repeatedly(&mut dest, &end_pointer, conf.end_pointers_tail, au_bytes)?;

    // Добить до полного размера носителя
    dest.seek_to(conf.disk_size)?;

    dest.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn null_conf(disk_size: u64, alignment_blocks: u64) -> NewArchiveOptions {
        NewArchiveOptions {
            disk_size,
            global_logs: vec![],
            img_logs: vec![],
            end_pointers_head: 1,
            end_pointers_tail: 1,
            ending_cipher: ENDING_CIPHER_NULL,
            end_pointer_checksum: 0,
            public_key: None,
            img_cipher: 0,
            img_cluster_size_exp: 7,
            alignment_blocks,
            fill_method: FillMethod::Zero,
        }
    }

    #[test]
    fn too_small_disk_is_rejected() {
        let err = write_empty_archive(Cursor::new(Vec::new()), &null_conf(64 * 1024, 128))
            .unwrap_err()
            .to_string();
        assert!(err.contains("not enough space"), "{}", err);
    }

    #[test]
    fn bad_alignment_is_rejected() {
        let mut conf = null_conf(16 << 20, 128);
        conf.alignment_blocks = 100;
        let err = write_empty_archive(Cursor::new(Vec::new()), &conf)
            .unwrap_err()
            .to_string();
        assert!(err.contains("power of 2"), "{}", err);
    }

    #[test]
    fn file_length_matches_disk_size() {
        let mut out = Cursor::new(Vec::new());
        write_empty_archive(&mut out, &null_conf(4 << 20, 8)).unwrap();
        assert_eq!(out.into_inner().len() as u64, 4 << 20);
    }
}
