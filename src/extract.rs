//! extract — чтение архива: заголовок, выбор end pointer'а, обратный
//! обход цепочки ending'ов и выгрузка образов.
//!
//! Порядок чтения заголовка:
//! 1. первые 56 байт: магия CVTM-MAGIC, размер первой записи (>= 56),
//!    HeaderLength (>= размера первой записи, <= 1 MiB);
//! 2. остальные байты заголовка;
//! 3. SHA-256 с обнулённым полем [20, 52) против сохранённого —
//!    несовпадение фатально;
//! 4. привязка записей, дефолты (EndingSize 0 -> 1) и структурные
//!    проверки. Фатальные находки копятся и возвращаются одним
//!    списком; остальное — предупреждения.
//!
//! Обход цепочки: от смещения, выбранного голосованием указателей,
//! назад по Ending.Prev; каждый шаг обязан строго уменьшать смещение.
//! Плоский регион, начинающийся с NO-MORE-IMAGES, завершает обход.

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::consts::{
    BLOCK_SIZE, ENDING_CIPHER_NULL, ENDING_CIPHER_RSA, MAX_ENDING_BLOCKS, MAX_HEADER_SIZE,
};
use crate::endptr::find_end;
use crate::entries::{
    ArchiveHeaderRead, EndingRead, ID_CVTM_MAGIC, ID_ENDING, ID_NO_MORE_IMAGES,
};
use crate::qcow2::extract_image;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub private_key: Option<RsaPrivateKey>,
    /// Шаблон имени файла образа; "{index}" замещается номером.
    pub image_name: String,
    pub overwrite: bool,
    pub raw: bool,
}

// Внутренний маркер конца цепочки, наружу не выходит.
#[derive(Debug)]
struct NoMoreImages;

impl fmt::Display for NoMoreImages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no more images")
    }
}

impl std::error::Error for NoMoreImages {}

/// Прочитать и проверить заголовок архива.
pub fn read_archive_header(file: &File, options: &ExtractOptions) -> Result<ArchiveHeaderRead> {
    // Первая запись: магия + размер + CvtmMagic
    let mut first = [0u8; 56];
    file.read_exact_at(&mut first, 0)
        .context("got EOF reading header")?;
    if first[..16] != ID_CVTM_MAGIC.0 {
        bail!("bad magic number");
    }
    let first_ent_size = LittleEndian::read_u32(&first[16..20]);
    if first_ent_size < 56 {
        bail!("bad entry size {}", first_ent_size);
    }
    let header_size = LittleEndian::read_u32(&first[52..56]);
    if header_size < first_ent_size {
        bail!("bad header size {}", header_size);
    }
    if header_size > MAX_HEADER_SIZE {
        bail!("header size too big {}", header_size);
    }

    // Весь заголовок целиком
    let mut data = vec![0u8; header_size as usize];
    file.read_exact_at(&mut data, 0)
        .context("got EOF reading header")?;

    // Чексумма: снять [20, 52), обнулить, сверить SHA-256
    let mut stored = [0u8; 32];
    stored.copy_from_slice(&data[20..52]);
    data[20..52].fill(0);
    if Sha256::digest(&data)[..] != stored {
        bail!("bad checksum");
    }

    let mut header = ArchiveHeaderRead::parse(
        &data[first_ent_size as usize..],
        first_ent_size as usize,
    )?;

    // Дефолты для старых архивов
    if header.ending_size.size == 0 {
        header.ending_size.size = 1;
    }

    check_archive_header(options, &header, header_size)?;

    Ok(header)
}

/// Структурные проверки заголовка. В список ошибок попадает только то,
/// что точно делает архив нечитаемым; остальное — предупреждения.
fn check_archive_header(
    options: &ExtractOptions,
    header: &ArchiveHeaderRead,
    header_size: u32,
) -> Result<()> {
    let mut errs: Vec<String> = Vec::new();

    if header.ending_size.size > MAX_ENDING_BLOCKS {
        errs.push(format!("ending size too big {} blocks", header.ending_size.size));
    }

    match header.ending_cipher.algo {
        ENDING_CIPHER_NULL => {}
        ENDING_CIPHER_RSA => {
            // Публичный ключ для чтения не нужен, поэтому битый ключ —
            // только предупреждение.
            match RsaPublicKey::from_pkcs1_der(&header.ending_cipher.key) {
                Err(e) => warn!("bad public key in archive: {}", e),
                Ok(pub_key) => {
                    if let Some(priv_key) = &options.private_key {
                        let own = priv_key.to_public_key();
                        if pub_key.n() != own.n() || pub_key.e() != own.e() {
                            warn!("public key from archive header doesn't match private key");
                        }
                    } else {
                        errs.push("archive is encrypted, but private key is not given".into());
                    }
                }
            }
        }
        other => errs.push(format!("unknown enumeration value EndingCipher.Algo {}", other)),
    }

    if header.end_pointer_chec.algo > 2 {
        errs.push(format!(
            "unknown enumeration value EndPointerChec.Algo {}",
            header.end_pointer_chec.algo
        ));
    }

    if header.end_pointer_loca.is_empty() {
        errs.push("archive has no end pointers".into());
    }

    let header_blks = (header_size as u64 + BLOCK_SIZE - 1) / BLOCK_SIZE;
    if header_blks > header.image_area.start as u64 {
        warn!("header and image area overlap");
    }
    // Указатели живут либо между заголовком и областью образов, либо
    // после неё; внутри области образов им не место.
    for e in &header.end_pointer_loca {
        let blk = e.blk as u64;
        let in_head = blk >= header_blks && blk < header.image_area.start as u64;
        let in_tail = blk >= header.image_area.end as u64;
        if !(in_head || in_tail) {
            errs.push(format!("bad end pointer location {}", e.blk));
        }
    }

    if !errs.is_empty() {
        bail!("{}", errs.join(", "));
    }
    Ok(())
}

/// Прочитать и разобрать область ending, конец которой лежит на `end`.
fn read_ending(
    file: &File,
    end: u64,
    header: &ArchiveHeaderRead,
    options: &ExtractOptions,
) -> Result<EndingRead> {
    let size = header.ending_size.size as u64 * BLOCK_SIZE;
    if end < size {
        bail!("bad end pointer {}", end);
    }

    let mut data = vec![0u8; size as usize];
    file.read_exact_at(&mut data, end - size)?;

    match header.ending_cipher.algo {
        ENDING_CIPHER_NULL => {}
        ENDING_CIPHER_RSA => {
            let key = options
                .private_key
                .as_ref()
                .ok_or_else(|| anyhow!("archive is encrypted, but private key is not given"))?;
            // Шифротекст ровно в размер модуля; остаток области —
            // случайная добивка.
            let ct_len = key.size().min(data.len());
            data = key
                .decrypt(Oaep::new::<Sha256>(), &data[..ct_len])
                .map_err(|e| anyhow!("decryption failed: {}", e))?;
        }
        other => bail!("unknown enumeration value EndingCipher.Algo {}", other),
    }

    if data.len() >= 16 && data[..16] == ID_NO_MORE_IMAGES.0 {
        return Err(NoMoreImages.into());
    }
    if data.len() < 24 || data[..16] != ID_ENDING.0 {
        bail!("bad magic number for ending");
    }

    // Полезная часть региона объявлена в ENDING.Length
    let length = LittleEndian::read_u32(&data[20..24]) as u64;
    if length > size || length as usize > data.len() {
        bail!("bad ending size {}", length);
    }
    data.truncate(length as usize);

    EndingRead::parse(&data, 0)
}

/// Выгрузить все образы архива.
pub fn extract_archive(file: &File, options: &ExtractOptions) -> Result<()> {
    let header = read_archive_header(file, options)?;

    let mut end_at = find_end(file, &header);
    if end_at == 0 {
        bail!("no valid end pointer exists");
    }

    let ending_bytes = header.ending_size.size as u64 * BLOCK_SIZE;
    let area_start = header.image_area.start as u64 * BLOCK_SIZE;

    let mut index = 0usize;
    loop {
        if end_at < area_start {
            bail!("image ending is outside of image area at {}", end_at);
        }
        if end_at == area_start {
            break;
        }

        let ending = match read_ending(file, end_at, &header, options) {
            Ok(e) => e,
            Err(e) if e.downcast_ref::<NoMoreImages>().is_some() => break,
            Err(e) => return Err(e),
        };

        extract_image(file, options, index, end_at - ending_bytes, &ending)
            .with_context(|| format!("error extracting image at {}", end_at))?;

        // Цепочка обязана идти строго назад, иначе возможен цикл
        let end_at_next = ending.ending.prev as u64 * BLOCK_SIZE;
        if end_at_next >= end_at {
            bail!("ending does not point backwards {} at {}", end_at_next, end_at);
        }
        end_at = end_at_next;
        index += 1;
    }

    Ok(())
}
