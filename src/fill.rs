//! fill — пишущий сток с учётом позиции и материализацией пропусков.
//!
//! [`FillWriter`] оборачивает Write+Seek и считает абсолютную позицию.
//! Пропуск вперёд (seek_to/align_to) выполняется согласно методу:
//! - Seek   — сырой seek нижележащего стока (байты не определены);
//! - Zero   — пропуск заполняется нулями блоками по 512 байт;
//! - Random — пропуск заполняется байтами из randsrc.
//!
//! Seek назад допустим только в режиме Seek. Seek в текущую позицию
//! никогда не трогает нижний сток — это позволяет писать в pipe
//! (см. [`PipeSink`]), пока нагрузка монотонно движется вперёд.

use anyhow::{bail, Context, Result};
use std::io::{self, Seek, SeekFrom, Write};

use crate::consts::BLOCK_SIZE;
use crate::randsrc::RandSource;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FillMethod {
    Seek,
    Zero,
    Random,
}

/// Выровнять вверх до кратного `alignment` (степень двойки).
#[inline]
pub fn align_up(n: u64, alignment: u64) -> u64 {
    (n + alignment - 1) & !(alignment - 1)
}

/// Выровнять вниз до кратного `alignment` (степень двойки).
#[inline]
pub fn align_down(n: u64, alignment: u64) -> u64 {
    n & !(alignment - 1)
}

/// Записать `size` нулевых байт блоками по 512.
pub fn write_zeros<W: Write>(w: &mut W, size: u64) -> io::Result<()> {
    let zeros = [0u8; BLOCK_SIZE as usize];
    let head = (size % BLOCK_SIZE) as usize;
    w.write_all(&zeros[..head])?;
    for _ in 0..size / BLOCK_SIZE {
        w.write_all(&zeros)?;
    }
    Ok(())
}

pub struct FillWriter<W: Write + Seek> {
    inner: W,
    pos: u64,
    method: FillMethod,
}

impl<W: Write + Seek> FillWriter<W> {
    pub fn new(inner: W, method: FillMethod) -> Self {
        FillWriter {
            inner,
            pos: 0,
            method,
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Перейти на абсолютную позицию `target`.
    pub fn seek_to(&mut self, target: u64) -> Result<()> {
        if target == self.pos {
            return Ok(());
        }

        if self.method == FillMethod::Seek {
            self.inner
                .seek(SeekFrom::Start(target))
                .context("seek in output")?;
            self.pos = target;
            return Ok(());
        }

        if target < self.pos {
            bail!("can't fill backwards from {} to {}", self.pos, target);
        }

        let gap = target - self.pos;
        match self.method {
            FillMethod::Zero => write_zeros(&mut self.inner, gap)?,
            FillMethod::Random => RandSource::global().copy_to(&mut self.inner, gap)?,
            FillMethod::Seek => unreachable!(),
        }
        self.pos = target;
        Ok(())
    }

    /// Дойти до следующей границы `alignment` байт (степень двойки).
    pub fn align_to(&mut self, alignment: u64) -> Result<()> {
        self.seek_to(align_up(self.pos, alignment))
    }
}

impl<W: Write + Seek> Write for FillWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Несикабельный сток (stdout/pipe) под интерфейс Write+Seek.
/// Любая реальная попытка seek — ошибка; FillWriter с методами
/// Zero/Random до неё не доходит.
pub struct PipeSink<W: Write> {
    inner: W,
}

impl<W: Write> PipeSink<W> {
    pub fn new(inner: W) -> Self {
        PipeSink { inner }
    }
}

impl<W: Write> Write for PipeSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> Seek for PipeSink<W> {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "sink is not seekable",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn zero_fill_materializes_gap() {
        let mut w = FillWriter::new(Cursor::new(Vec::new()), FillMethod::Zero);
        w.write_all(b"abc").unwrap();
        w.seek_to(1000).unwrap();
        w.write_all(b"xy").unwrap();
        assert_eq!(w.pos(), 1002);

        let data = w.inner.into_inner();
        assert_eq!(data.len(), 1002);
        assert_eq!(&data[..3], b"abc");
        assert!(data[3..1000].iter().all(|&b| b == 0));
        assert_eq!(&data[1000..], b"xy");
    }

    #[test]
    fn backward_fill_is_rejected() {
        let mut w = FillWriter::new(Cursor::new(Vec::new()), FillMethod::Zero);
        w.write_all(&[0u8; 16]).unwrap();
        let err = w.seek_to(8).unwrap_err().to_string();
        assert!(err.contains("can't fill backwards"), "{}", err);
    }

    #[test]
    fn seek_method_allows_backward() {
        let mut w = FillWriter::new(Cursor::new(vec![0u8; 16]), FillMethod::Seek);
        w.write_all(&[1u8; 8]).unwrap();
        w.seek_to(2).unwrap();
        w.write_all(&[2u8; 2]).unwrap();
        assert_eq!(w.pos(), 4);
    }

    #[test]
    fn noop_seek_never_touches_pipe() {
        let mut w = FillWriter::new(PipeSink::new(Vec::new()), FillMethod::Zero);
        w.write_all(&[7u8; 32]).unwrap();
        w.seek_to(32).unwrap(); // та же позиция: seek не должен случиться
        w.align_to(32).unwrap();
        w.seek_to(64).unwrap(); // вперёд: материализуется нулями
        assert_eq!(w.pos(), 64);
    }

    #[test]
    fn random_fill_advances_position() {
        let mut w = FillWriter::new(Cursor::new(Vec::new()), FillMethod::Random);
        w.seek_to(4096).unwrap();
        let data = w.inner.into_inner();
        assert_eq!(data.len(), 4096);
        // 4К случайных байт не могут оказаться все нулевыми
        assert!(data.iter().any(|&b| b != 0));
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_down(1023, 512), 512);
        assert_eq!(align_down(1024, 512), 1024);
    }
}
