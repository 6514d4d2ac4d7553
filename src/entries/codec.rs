//! entries/codec — низкоуровневый кодек записей.
//!
//! Чтение региона идёт в два прохода:
//! 1. [`split_entries`] нарезает байты региона на сырые записи и
//!    раскладывает их по TypeID (E1: объявленная длина записи не
//!    может пересекать границу региона);
//! 2. [`take_one`]/[`take_many`] привязывают корзины к слотам связки.
//!    Скалярный слот берёт последнюю запись корзины (last-wins,
//!    с предупреждением при дубликатах), повторяемый — все по порядку.
//!    Оставшиеся корзины — неизвестные записи, по предупреждению
//!    на каждую.
//!
//! Толерантность к усечению: payload короче схемы записи добивает
//! недостающие поля нулями (одно предупреждение на запись), разрыв
//! посреди поля — жёсткая ошибка.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use std::collections::HashMap;

use crate::consts::ENTRY_HDR_SIZE;

use super::{EntryTypeId, Record};

/// Сырая запись: позиция (для диагностики) и payload без префикса.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub at: usize,
    pub data: Vec<u8>,
}

pub type Buckets = HashMap<EntryTypeId, Vec<RawEntry>>;

/// Сериализовать одну запись: TypeID, длина, payload.
pub fn write_entry<R: Record>(out: &mut Vec<u8>, rec: &R) {
    let mut payload = Vec::new();
    rec.write_payload(&mut payload);
    out.extend_from_slice(&R::ID.0);
    out.extend_from_slice(&((ENTRY_HDR_SIZE + payload.len()) as u32).to_le_bytes());
    out.extend_from_slice(&payload);
}

/// Нарезать регион на записи. `start` — абсолютная позиция `data`.
pub fn split_entries(data: &[u8], start: usize) -> Result<Buckets> {
    let mut out: Buckets = HashMap::new();
    let mut rest = data;
    let mut at = start;

    while !rest.is_empty() {
        if rest.len() < ENTRY_HDR_SIZE {
            bail!("bad entry at {}: entry crosses region boundary", at);
        }
        let size = LittleEndian::read_u32(&rest[16..20]) as usize;
        if size < ENTRY_HDR_SIZE || size > rest.len() {
            bail!("bad entry at {}: entry crosses region boundary", at);
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&rest[..16]);
        out.entry(EntryTypeId(id)).or_default().push(RawEntry {
            at,
            data: rest[ENTRY_HDR_SIZE..size].to_vec(),
        });
        rest = &rest[size..];
        at += size;
    }

    Ok(out)
}

/// Последовательный доступ к полям payload'а.
///
/// Конец payload'а ровно на границе поля переводит читатель в режим
/// «нулей»: все дальнейшие поля возвращают нулевые значения, а
/// [`FieldReader::is_short`] даёт true. Конец посреди поля — ошибка.
pub struct FieldReader<'a> {
    data: &'a [u8],
    at: usize,
    entry_at: usize,
    short: bool,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8], entry_at: usize) -> Self {
        FieldReader {
            data,
            at: 0,
            entry_at,
            short: false,
        }
    }

    fn need(&mut self, n: usize) -> Result<Option<&'a [u8]>> {
        if self.short || self.at == self.data.len() {
            self.short = true;
            return Ok(None);
        }
        if self.data.len() - self.at < n {
            bail!("bad entry at {}: field is incomplete", self.entry_at);
        }
        let s = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(Some(s))
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.need(1)?.map(|s| s[0]).unwrap_or(0))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(self.need(4)?.map(LittleEndian::read_u32).unwrap_or(0))
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        match self.need(N)? {
            Some(s) => {
                let mut a = [0u8; N];
                a.copy_from_slice(s);
                Ok(a)
            }
            None => Ok([0u8; N]),
        }
    }

    /// Байтовый хвост переменной длины: остаток payload'а.
    pub fn tail(&mut self) -> Vec<u8> {
        let t = self.data[self.at..].to_vec();
        self.at = self.data.len();
        t
    }

    pub fn is_short(&self) -> bool {
        self.short
    }
}

fn parse_record<R: Record>(raw: &RawEntry) -> Result<R> {
    let mut r = FieldReader::new(&raw.data, raw.at);
    let rec = R::read_payload(&mut r)?;
    if r.is_short() {
        warn!("entry is shorter than expected at {}", raw.at);
    }
    Ok(rec)
}

/// Скалярный слот: отсутствие — значение по умолчанию, дубликаты —
/// последняя запись побеждает (с предупреждением).
pub fn take_one<R: Record>(buckets: &mut Buckets) -> Result<R> {
    match buckets.remove(&R::ID) {
        None => Ok(R::default()),
        Some(list) => {
            if list.len() > 1 {
                warn!("found more than 1 entries {}", R::ID);
            }
            parse_record(list.last().expect("bucket is never empty"))
        }
    }
}

/// Повторяемый слот: все записи корзины в порядке появления.
pub fn take_many<R: Record>(buckets: &mut Buckets) -> Result<Vec<R>> {
    match buckets.remove(&R::ID) {
        None => Ok(Vec::new()),
        Some(list) => list.iter().map(parse_record).collect(),
    }
}

/// Предупредить обо всех не привязанных (неизвестных) записях.
pub fn warn_unknown(buckets: &Buckets) {
    for (id, list) in buckets {
        for e in list {
            warn!("unknown entry at {} {}", e.at, id);
        }
    }
}
