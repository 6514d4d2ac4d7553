//! Общие константы формата CVTM (блоки, перечисления, лимиты).
//!
//! Все дисковые смещения в формате кратны блоку в 512 байт.
//! Целые внутри записей — little-endian; big-endian используется
//! только на выходе QCOW2.

/// Размер блока. Все поля Blk/Start/End/Prev считаются в таких блоках.
pub const BLOCK_SIZE: u64 = 512;

// -------- ImgCipher (шифр полезной нагрузки образа) --------
pub const IMG_CIPHER_NULL: u32 = 0;
pub const IMG_CIPHER_XTS_AES: u32 = 1;

// -------- EndingCipher (шифр области ending) --------
pub const ENDING_CIPHER_NULL: u32 = 0;
pub const ENDING_CIPHER_RSA: u32 = 1;

// -------- EndPointerChecksum --------
pub const END_POINTER_CHECKSUM_SHA256: u32 = 0;
pub const END_POINTER_CHECKSUM_CRC32: u32 = 1;

// -------- Лимиты чтения --------

/// Верхняя граница самообъявленной длины заголовка (1 MiB).
pub const MAX_HEADER_SIZE: u32 = 0x0010_0000;

/// Верхняя граница EndingSize в блоках.
pub const MAX_ENDING_BLOCKS: u32 = 32;

/// Размер общего префикса записи: TypeID (16) + длина (u32).
pub const ENTRY_HDR_SIZE: usize = 20;

/// Литерал, которым замещается поле чексуммы end pointer'а
/// на время расчёта ("END-POINTER" + NUL до 32 байт).
pub const END_POINTER_LITERAL: &[u8; 32] =
    b"END-POINTER\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";
