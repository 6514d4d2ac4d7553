//! endptr — избыточные end pointer'ы.
//!
//! Блок end pointer'а (512 байт):
//! - [0, 32)  — поле чексуммы;
//! - [32, 36) — u32 LE, байтовое смещение КОНЦА самого свежего ending;
//! - [36, 512) — произвольные байты.
//!
//! Чексумма считается по всему блоку, где поле [0, 32) замещено
//! литералом "END-POINTER\0...". SHA-256 занимает все 32 байта поля,
//! CRC32C — первые 4 (LE), остальные 28 остаются хвостом литерала.
//!
//! Выбор указателя: все блоки читаются конкурентно, каждый битый
//! вносит 0, берётся максимум. На любой момент хотя бы одна копия
//! несёт валидное старое значение, а чексумма не даёт принять
//! разорванную запись за новое.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::thread;

use crate::consts::{
    BLOCK_SIZE, END_POINTER_CHECKSUM_CRC32, END_POINTER_CHECKSUM_SHA256, END_POINTER_LITERAL,
};
use crate::entries::ArchiveHeaderRead;

/// Ожидаемое содержимое поля [0, 32) для данного блока.
fn expected_checksum_field(block: &[u8], algo: u32) -> Result<[u8; 32]> {
    let mut tmp = block.to_vec();
    tmp[..32].copy_from_slice(END_POINTER_LITERAL);

    let mut field = [0u8; 32];
    match algo {
        END_POINTER_CHECKSUM_SHA256 => {
            field.copy_from_slice(&Sha256::digest(&tmp));
        }
        END_POINTER_CHECKSUM_CRC32 => {
            field.copy_from_slice(END_POINTER_LITERAL);
            LittleEndian::write_u32(&mut field[..4], crc32c::crc32c(&tmp));
        }
        other => bail!("unknown enumeration value EndPointerChec.Algo {}", other),
    }
    Ok(field)
}

/// Собрать блок end pointer'а, указывающий на байт `point_to`.
pub fn make_end_pointer(point_to: u32, algo: u32) -> Result<[u8; BLOCK_SIZE as usize]> {
    let mut block = [0u8; BLOCK_SIZE as usize];
    LittleEndian::write_u32(&mut block[32..36], point_to);
    let field = expected_checksum_field(&block, algo)?;
    block[..32].copy_from_slice(&field);
    Ok(block)
}

/// Проверить чексумму блока.
pub fn verify_end_pointer(block: &[u8], algo: u32) -> Result<bool> {
    Ok(expected_checksum_field(block, algo)? == block[..32])
}

/// Прочитать все end pointer'ы конкурентно и вернуть максимальное
/// валидное байтовое смещение; 0 — валидных нет.
pub fn find_end(file: &File, header: &ArchiveHeaderRead) -> u64 {
    let algo = header.end_pointer_chec.algo;

    thread::scope(|s| {
        let tasks: Vec<_> = header
            .end_pointer_loca
            .iter()
            .map(|loc| {
                let at = loc.blk as u64 * BLOCK_SIZE;
                s.spawn(move || {
                    let mut buf = [0u8; BLOCK_SIZE as usize];
                    if let Err(e) = file.read_exact_at(&mut buf, at) {
                        warn!("got error reading end pointer at {}: {}", at, e);
                        return 0;
                    }
                    match verify_end_pointer(&buf, algo) {
                        Ok(true) => LittleEndian::read_u32(&buf[32..36]) as u64,
                        Ok(false) => {
                            warn!("end pointer has bad checksum at {}", at);
                            0
                        }
                        Err(e) => {
                            warn!("end pointer at {}: {}", at, e);
                            0
                        }
                    }
                })
            })
            .collect();

        tasks
            .into_iter()
            .map(|t| t.join().unwrap_or(0))
            .max()
            .unwrap_or(0)
    })
}
