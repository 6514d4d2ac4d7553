//! entries — типизированные записи формата CVTM.
//!
//! Запись на диске: [TypeID 16][длина u32 LE, включая 20-байтовый
//! префикс][поля записи LE]. Последним полем записи может быть один
//! байтовый «хвост» переменной длины (ключевой материал).
//!
//! Реестр TypeID закрыт; неизвестные записи при чтении пропускаются
//! с предупреждением, отсутствующие поля у известных записей
//! добиваются нулями (совместимость вперёд/назад).
//!
//! Заголовок архива и область ending — это плоские связки записей.
//! Чтение связки: сначала раскладка по TypeID (см. [`codec`]),
//! затем привязка к полям; для скалярных слотов при дубликате
//! побеждает последняя запись.

use anyhow::Result;
use std::fmt;

pub mod codec;

use self::codec::{split_entries, take_many, take_one, warn_unknown, write_entry, FieldReader};

/// 16-байтовый идентификатор типа записи (ASCII, добитый NUL).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryTypeId(pub [u8; 16]);

impl fmt::Display for EntryTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(16);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl fmt::Debug for EntryTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryTypeId({})", self)
    }
}

// ---- Реестр TypeID ----

pub const ID_CVTM_MAGIC: EntryTypeId = EntryTypeId(*b"CVTM-MAGIC\x00\x00\x00\x00\x00\x00");
pub const ID_ALLOCATE_ONCE: EntryTypeId = EntryTypeId(*b"ALLOCATE-ONCE\x00\x00\x00");
pub const ID_END_POINTER_CHEC: EntryTypeId = EntryTypeId(*b"END-POINTER-CHEC");
pub const ID_END_POINTER_LOCA: EntryTypeId = EntryTypeId(*b"END-POINTER-LOCA");
pub const ID_ENDING_CIPHER: EntryTypeId = EntryTypeId(*b"ENDING-CIPHER\x00\x00\x00");
pub const ID_ENDING_SIZE: EntryTypeId = EntryTypeId(*b"ENDING-SIZE\x00\x00\x00\x00\x00");
pub const ID_GLOBAL_LOG_LOCAT: EntryTypeId = EntryTypeId(*b"GLOBAL-LOG-LOCAT");
pub const ID_IMAGE_AREA: EntryTypeId = EntryTypeId(*b"IMAGE-AREA\x00\x00\x00\x00\x00\x00");
pub const ID_IMAGE_BASIC: EntryTypeId = EntryTypeId(*b"IMAGE-BASIC\x00\x00\x00\x00\x00");
pub const ID_IMAGE_LOG: EntryTypeId = EntryTypeId(*b"IMAGE-LOG\x00\x00\x00\x00\x00\x00\x00");
pub const ID_SD_CID: EntryTypeId = EntryTypeId(*b"SD-CID\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00");
pub const ID_NO_MORE_IMAGES: EntryTypeId = EntryTypeId(*b"NO-MORE-IMAGES\x00\x00");
pub const ID_ENDING: EntryTypeId = EntryTypeId(*b"ENDING\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00");
pub const ID_IMAGE_KEY: EntryTypeId = EntryTypeId(*b"IMAGE-KEY\x00\x00\x00\x00\x00\x00\x00");
pub const ID_IMAGE_LOG_LOCATI: EntryTypeId = EntryTypeId(*b"IMAGE-LOG-LOCATI");

/// Одна типизированная запись: фиксированный TypeID и кодек полей.
pub trait Record: Default + Sized {
    const ID: EntryTypeId;

    /// Сериализовать поля записи (без префикса TypeID+длина).
    fn write_payload(&self, out: &mut Vec<u8>);

    /// Разобрать поля записи из payload. Усечение на границе поля
    /// даёт нулевые значения (см. [`FieldReader`]), разрыв посреди
    /// поля — ошибка.
    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self>;
}

// ---- Записи ----

/// Первая запись заголовка: чексумма заголовка + его длина.
/// Поле checksum лежит по файловым смещениям [20, 52).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CvtmMagic {
    pub checksum: [u8; 32],
    pub header_length: u32,
}

impl Record for CvtmMagic {
    const ID: EntryTypeId = ID_CVTM_MAGIC;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.checksum);
        out.extend_from_slice(&self.header_length.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(CvtmMagic {
            checksum: r.array()?,
            header_length: r.u32()?,
        })
    }
}

/// Читается, но никогда не пишется: 0 означает «фича отсутствует».
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocateOnce {
    pub allocation_increment: u32,
}

impl Record for AllocateOnce {
    const ID: EntryTypeId = ID_ALLOCATE_ONCE;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.allocation_increment.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(AllocateOnce {
            allocation_increment: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndPointerChec {
    pub algo: u32,
}

impl Record for EndPointerChec {
    const ID: EntryTypeId = ID_END_POINTER_CHEC;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.algo.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(EndPointerChec { algo: r.u32()? })
    }
}

/// Положение одного end pointer'а (в блоках).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndPointerLoca {
    pub blk: u32,
}

impl Record for EndPointerLoca {
    const ID: EntryTypeId = ID_END_POINTER_LOCA;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.blk.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(EndPointerLoca { blk: r.u32()? })
    }
}

/// Шифр области ending; key — публичный ключ PKCS#1 DER при RSA.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndingCipher {
    pub algo: u32,
    pub key: Vec<u8>,
}

impl Record for EndingCipher {
    const ID: EntryTypeId = ID_ENDING_CIPHER;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.algo.to_le_bytes());
        out.extend_from_slice(&self.key);
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(EndingCipher {
            algo: r.u32()?,
            key: r.tail(),
        })
    }
}

/// Размер области ending в блоках. 0 в старых архивах читается как 1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndingSize {
    pub size: u32,
}

impl Record for EndingSize {
    const ID: EntryTypeId = ID_ENDING_SIZE;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(EndingSize { size: r.u32()? })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalLogLocat {
    pub start: u32,
    pub count: u32,
}

impl Record for GlobalLogLocat {
    const ID: EntryTypeId = ID_GLOBAL_LOG_LOCAT;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(GlobalLogLocat {
            start: r.u32()?,
            count: r.u32()?,
        })
    }
}

/// Границы области образов [start, end) в блоках.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageArea {
    pub start: u32,
    pub end: u32,
}

impl Record for ImageArea {
    const ID: EntryTypeId = ID_IMAGE_AREA;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.end.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(ImageArea {
            start: r.u32()?,
            end: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageBasic {
    pub img_cipher: u32,
    pub img_cluster_size_exp: u8,
}

impl Record for ImageBasic {
    const ID: EntryTypeId = ID_IMAGE_BASIC;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.img_cipher.to_le_bytes());
        out.push(self.img_cluster_size_exp);
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(ImageBasic {
            img_cipher: r.u32()?,
            img_cluster_size_exp: r.u8()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageLog {
    pub blk_count: u32,
}

impl Record for ImageLog {
    const ID: EntryTypeId = ID_IMAGE_LOG;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.blk_count.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(ImageLog { blk_count: r.u32()? })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdCid {
    pub sd_cid: [u8; 15],
}

impl Record for SdCid {
    const ID: EntryTypeId = ID_SD_CID;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sd_cid);
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(SdCid { sd_cid: r.array()? })
    }
}

/// Страж конца цепочки образов; полей не имеет.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoMoreImages {}

impl Record for NoMoreImages {
    const ID: EntryTypeId = ID_NO_MORE_IMAGES;

    fn write_payload(&self, _out: &mut Vec<u8>) {}

    fn read_payload(_r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(NoMoreImages {})
    }
}

/// Трейлер одного образа.
/// - length — длина полезной части области ending в байтах;
/// - start — первый блок таблицы индексов кластеров образа;
/// - prev — байтовое смещение конца предыдущего ending'а в блоках;
/// - clusters_offset — сдвиг начала кластеров от start, в блоках.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ending {
    pub length: u32,
    pub start: u32,
    pub prev: u32,
    pub data_cluster_count: u32,
    pub cluster_size_exp: u8,
    pub clusters_offset: u32,
}

impl Record for Ending {
    const ID: EntryTypeId = ID_ENDING;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.prev.to_le_bytes());
        out.extend_from_slice(&self.data_cluster_count.to_le_bytes());
        out.push(self.cluster_size_exp);
        out.extend_from_slice(&self.clusters_offset.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(Ending {
            length: r.u32()?,
            start: r.u32()?,
            prev: r.u32()?,
            data_cluster_count: r.u32()?,
            cluster_size_exp: r.u8()?,
            clusters_offset: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageKey {
    pub key: Vec<u8>,
}

impl Record for ImageKey {
    const ID: EntryTypeId = ID_IMAGE_KEY;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.key);
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(ImageKey { key: r.tail() })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageLogLocati {
    pub offset: u32,
    pub size: u32,
}

impl Record for ImageLogLocati {
    const ID: EntryTypeId = ID_IMAGE_LOG_LOCATI;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    fn read_payload(r: &mut FieldReader<'_>) -> Result<Self> {
        Ok(ImageLogLocati {
            offset: r.u32()?,
            size: r.u32()?,
        })
    }
}

// ---- Связки записей ----

/// Заголовок на запись: состав и порядок полей фиксируют порядок
/// записей в сериализованном заголовке (CvtmMagic всегда первая).
#[derive(Debug, Clone, Default)]
pub struct ArchiveHeaderWrite {
    pub cvtm_magic: CvtmMagic,
    pub end_pointer_chec: EndPointerChec,
    pub end_pointer_loca: Vec<EndPointerLoca>,
    pub ending_cipher: EndingCipher,
    pub ending_size: EndingSize,
    pub global_log_locat: Vec<GlobalLogLocat>,
    pub image_area: ImageArea,
    pub image_basic: ImageBasic,
    pub image_log: Vec<ImageLog>,
}

impl ArchiveHeaderWrite {
    /// Сериализовать все записи заголовка подряд.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_entry(&mut out, &self.cvtm_magic);
        write_entry(&mut out, &self.end_pointer_chec);
        for e in &self.end_pointer_loca {
            write_entry(&mut out, e);
        }
        write_entry(&mut out, &self.ending_cipher);
        write_entry(&mut out, &self.ending_size);
        for e in &self.global_log_locat {
            write_entry(&mut out, e);
        }
        write_entry(&mut out, &self.image_area);
        write_entry(&mut out, &self.image_basic);
        for e in &self.image_log {
            write_entry(&mut out, e);
        }
        out
    }
}

/// Заголовок на чтение. CvtmMagic разбирается отдельно (до чексуммы),
/// поэтому слота для неё здесь нет; AllocateOnce и SdCid — слоты
/// только для чтения.
#[derive(Debug, Clone, Default)]
pub struct ArchiveHeaderRead {
    pub allocate_once: AllocateOnce,
    pub end_pointer_chec: EndPointerChec,
    pub end_pointer_loca: Vec<EndPointerLoca>,
    pub ending_cipher: EndingCipher,
    pub ending_size: EndingSize,
    pub global_log_locat: Vec<GlobalLogLocat>,
    pub image_area: ImageArea,
    pub image_basic: ImageBasic,
    pub image_log: Vec<ImageLog>,
    pub sd_cid: SdCid,
}

impl ArchiveHeaderRead {
    /// Привязать записи региона к слотам заголовка.
    /// `start` — абсолютная позиция начала `data` (для диагностики).
    pub fn parse(data: &[u8], start: usize) -> Result<Self> {
        let mut b = split_entries(data, start)?;
        let hdr = ArchiveHeaderRead {
            allocate_once: take_one(&mut b)?,
            end_pointer_chec: take_one(&mut b)?,
            end_pointer_loca: take_many(&mut b)?,
            ending_cipher: take_one(&mut b)?,
            ending_size: take_one(&mut b)?,
            global_log_locat: take_many(&mut b)?,
            image_area: take_one(&mut b)?,
            image_basic: take_one(&mut b)?,
            image_log: take_many(&mut b)?,
            sd_cid: take_one(&mut b)?,
        };
        warn_unknown(&b);
        Ok(hdr)
    }
}

/// Разобранная область ending одного образа.
#[derive(Debug, Clone, Default)]
pub struct EndingRead {
    pub ending: Ending,
    pub image_key: ImageKey,
    pub image_log_locati: Vec<ImageLogLocati>,
}

impl EndingRead {
    pub fn parse(data: &[u8], start: usize) -> Result<Self> {
        let mut b = split_entries(data, start)?;
        let end = EndingRead {
            ending: take_one(&mut b)?,
            image_key: take_one(&mut b)?,
            image_log_locati: take_many(&mut b)?,
        };
        warn_unknown(&b);
        Ok(end)
    }
}
