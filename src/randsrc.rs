//! randsrc — бесконечный поток случайных байт для заполнения
//! свободного места и добивки областей ending.
//!
//! Конвейер: N воркеров (по числу ядер), каждый со своим ключом
//! AES-128-CTR, гоняют многоразовые буферы по 4 MiB через пару
//! каналов. Воркер берёт пустой буфер, накладывает на него свой
//! keystream и отдаёт потребителю; потребитель возвращает осушенный
//! буфер обратно. Пока буфер читается, никто его не перегенерирует —
//! владение передаётся вместе с буфером.
//!
//! Криптографическая непредсказуемость не требуется, только высокая
//! плотность энтропии и пропускная способность; ключи тем не менее
//! берутся из OS-энтропии.
//!
//! Источник один на процесс, инициализируется лениво (OnceLock).
//! ENV CVTM_RAND_WORKERS переопределяет число воркеров.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

type Keystream = Ctr128BE<Aes128>;

// 4 MiB на буфер
const BUF_SIZE: usize = 0x40_0000;

fn worker_count() -> usize {
    if let Ok(v) = std::env::var("CVTM_RAND_WORKERS") {
        if let Ok(n) = v.trim().parse::<usize>() {
            if n > 0 {
                return n;
            }
        }
    }
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

struct Consumer {
    full_rx: Receiver<Vec<u8>>,
    empty_tx: Sender<Vec<u8>>,
    cur: Vec<u8>,
    off: usize,
}

impl Consumer {
    // Гарантировать непустой текущий буфер.
    fn refill(&mut self) {
        while self.off == self.cur.len() {
            let drained = std::mem::take(&mut self.cur);
            if !drained.is_empty() {
                // Вернуть буфер воркерам; если они умерли, узнаем на recv.
                let _ = self.empty_tx.send(drained);
            }
            self.cur = self
                .full_rx
                .recv()
                .expect("random source workers are gone");
            self.off = 0;
        }
    }
}

pub struct RandSource {
    inner: Mutex<Consumer>,
}

impl RandSource {
    /// Общий источник процесса (ленивая инициализация).
    pub fn global() -> &'static RandSource {
        static SOURCE: OnceLock<RandSource> = OnceLock::new();
        SOURCE.get_or_init(RandSource::start)
    }

    fn start() -> RandSource {
        let workers = worker_count();
        let (full_tx, full_rx) = mpsc::sync_channel::<Vec<u8>>(workers);
        let (empty_tx, empty_rx) = mpsc::channel::<Vec<u8>>();
        let empty_rx = Arc::new(Mutex::new(empty_rx));

        for _ in 0..workers {
            let full_tx: SyncSender<Vec<u8>> = full_tx.clone();
            let empty_rx = Arc::clone(&empty_rx);
            thread::Builder::new()
                .name("cvtm-rand".into())
                .spawn(move || {
                    let mut key = [0u8; 16];
                    let mut iv = [0u8; 16];
                    OsRng.fill_bytes(&mut key);
                    OsRng.fill_bytes(&mut iv);
                    let mut ks = Keystream::new(&key.into(), &iv.into());

                    let mut buf = vec![0u8; BUF_SIZE];
                    loop {
                        ks.apply_keystream(&mut buf);
                        if full_tx.send(buf).is_err() {
                            return;
                        }
                        buf = match empty_rx.lock().expect("poisoned").recv() {
                            Ok(b) => b,
                            Err(_) => return,
                        };
                    }
                })
                .expect("spawn random source worker");
        }

        RandSource {
            inner: Mutex::new(Consumer {
                full_rx,
                empty_tx,
                cur: Vec::new(),
                off: 0,
            }),
        }
    }

    /// Заполнить `out` случайными байтами.
    pub fn fill(&self, out: &mut [u8]) {
        let mut c = self.inner.lock().expect("poisoned");
        let mut done = 0;
        while done < out.len() {
            c.refill();
            let take = (out.len() - done).min(c.cur.len() - c.off);
            out[done..done + take].copy_from_slice(&c.cur[c.off..c.off + take]);
            c.off += take;
            done += take;
        }
    }

    /// Переписать `size` случайных байт в `w`.
    pub fn copy_to<W: Write + ?Sized>(&self, w: &mut W, size: u64) -> io::Result<()> {
        let mut c = self.inner.lock().expect("poisoned");
        let mut left = size;
        while left > 0 {
            c.refill();
            let take = (c.cur.len() - c.off).min(left.min(usize::MAX as u64) as usize);
            w.write_all(&c.cur[c.off..c.off + take])?;
            c.off += take;
            left -= take as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_produces_nonconstant_bytes() {
        let mut buf = [0u8; 8192];
        RandSource::global().fill(&mut buf);
        let first = buf[0];
        assert!(buf.iter().any(|&b| b != first));
    }

    #[test]
    fn copy_to_writes_exact_length() {
        let mut out = Vec::new();
        RandSource::global().copy_to(&mut out, 3 * 512 + 17).unwrap();
        assert_eq!(out.len(), 3 * 512 + 17);
    }

    #[test]
    fn consecutive_reads_differ() {
        let mut a = [0u8; 1024];
        let mut b = [0u8; 1024];
        RandSource::global().fill(&mut a);
        RandSource::global().fill(&mut b);
        assert_ne!(a, b);
    }
}
