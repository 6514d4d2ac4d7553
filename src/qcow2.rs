//! qcow2 — синтез QCOW2 v3 из компактной таблицы индексов кластеров.
//!
//! Хранимый вид образа (чтение, все индексы i32 LE):
//!
//! [верхняя таблица]   ceil(DataClusterCount / (cluster/4)) записей
//! [L2-таблицы по кластерам, на которые ссылается верхняя]
//! [кластеры данных]
//!
//! Индекс >= 0 — номер кластера внутри образа; -1 — не аллоцирован;
//! прочие отрицательные неизвестны (лог один раз, трактуются как -1);
//! индекс за пределами аллоцированных кластеров понижается до -1.
//!
//! Выход (запись, big-endian):
//!
//! [заголовок qcow2, 104 байта @ 0]
//! [таблица L1 @ 1 << cluster_bits], 2 * |верхняя| записей по 8 байт
//! [удвоенные L2 + кластеры данных @ regular_base]
//!
//! Исходные L2 — i32, у qcow2 — u64, поэтому каждая исходная таблица
//! разворачивается в две подряд; обе записи L1 [2i, 2i+1] указывают
//! на них. Позиция кластера c на выходе:
//! regular_base + (countL2Before(c) + c) * cluster, где верхний бит
//! regular_base — флаг «кластер аллоцирован» (не часть адреса).
//!
//! Таблица refcount остаётся нулевой, бит dirty в
//! IncompatibleFeatures объявляет её несвежей — qcow2-инструментарий
//! чинит при первом изменении.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use crate::consts::BLOCK_SIZE;
use crate::entries::EndingRead;
use crate::extract::ExtractOptions;

const QCOW2_MAGIC: u32 = 0x514649fb;
const QCOW2_HEADER_LEN: u32 = 104;
const ALLOCATED_BIT: u64 = 0x8000_0000_0000_0000;

// Чтение i32-индексов с позицией для диагностики.
struct IndexReader<'a> {
    src: BufReader<&'a File>,
    pos: u64,
    image_index: usize,
    allocated_clusters: u64,
    logged_unrecognized: bool,
}

impl<'a> IndexReader<'a> {
    fn read_index(&mut self) -> Result<i32> {
        let mut v = self.src.read_i32::<LittleEndian>()?;
        self.pos += 4;
        if v < 0 {
            if v != -1 && !self.logged_unrecognized {
                self.logged_unrecognized = true;
                warn!(
                    "got unrecognized cluster index {} in image {} at {}",
                    v, self.image_index, self.pos
                );
            }
        } else if v as u64 > self.allocated_clusters {
            warn!(
                "got cluster number outside of image {} in image {} at {}",
                v, self.image_index, self.pos
            );
            v = -1;
        }
        Ok(v)
    }
}

fn copy_exact<R: Read, W: Write>(src: &mut R, dest: &mut W, n: u64) -> Result<()> {
    let copied = io::copy(&mut src.take(n), dest)?;
    if copied != n {
        bail!("unexpected EOF copying image data ({} of {} bytes)", copied, n);
    }
    Ok(())
}

/// Выгрузить один образ: QCOW2 либо сырую копию при `raw`.
/// `end` — байтовое смещение начала области ending этого образа.
pub fn extract_image(
    file: &File,
    options: &ExtractOptions,
    index: usize,
    end: u64,
    ending: &EndingRead,
) -> Result<()> {
    let start = ending.ending.start as u64 * BLOCK_SIZE;
    if start > end {
        bail!("image start is after end");
    }
    let allocated_bytes = end - start;

    let name = options.image_name.replace("{index}", &index.to_string());
    let mut open = OpenOptions::new();
    open.write(true);
    if options.overwrite {
        open.create(true).truncate(true);
    } else {
        open.create_new(true);
    }
    let dest_file = open
        .open(&name)
        .with_context(|| format!("open output {}", name))?;

    info!(
        "extracting image {} from [{}, {}) into {}",
        index, start, end, name
    );

    let mut src = BufReader::new(file);
    src.seek(SeekFrom::Start(start))?;

    if options.raw {
        let mut dest = BufWriter::new(&dest_file);
        copy_exact(&mut src, &mut dest, allocated_bytes)?;
        dest.flush()?;
        return Ok(());
    }

    let data_cluster_count = ending.ending.data_cluster_count as u64;
    let cluster_exp = 9 + ending.ending.cluster_size_exp as u32;
    if cluster_exp > 30 {
        bail!("bad cluster size exponent {}", ending.ending.cluster_size_exp);
    }
    let cluster = 1u64 << cluster_exp;
    let clusters_offset = ending.ending.clusters_offset as u64;
    let allocated_clusters = (allocated_bytes + BLOCK_SIZE * clusters_offset) >> cluster_exp;

    let l1_start = cluster;
    // На одну исходную L2-таблицу приходится cluster/4 индексов
    let l1_len = data_cluster_count.div_ceil(cluster / 4) as usize;
    // Выходная L1: 2 * l1_len записей по 8 байт
    let l1_cluster_count = ((l1_len as u64) << 4).div_ceil(cluster);
    let regular_base = ALLOCATED_BIT | (l1_start + (l1_cluster_count << cluster_exp));

    let mut idx = IndexReader {
        src,
        pos: 0,
        image_index: index,
        allocated_clusters,
        logged_unrecognized: false,
    };

    // Верхняя таблица
    let mut l1_data = Vec::with_capacity(l1_len);
    for _ in 0..l1_len {
        l1_data.push(idx.read_index()?);
    }

    // Кластеры данных копируются как есть, L2-таблицы пересобираются;
    // их позиции в исходном порядке задают сдвиг от удвоения.
    let mut l2_at_src: Vec<u64> = l1_data.iter().filter(|&&v| v >= 0).map(|&v| v as u64).collect();
    l2_at_src.sort_unstable();
    let count_l2_before = |c: u64| l2_at_src.partition_point(|&x| x < c) as u64;
    let entry_at = |c: u64| regular_base + ((count_l2_before(c) + c) << cluster_exp);

    // Заголовок qcow2 v3
    let mut dest = BufWriter::new(&dest_file);
    dest.write_u32::<BigEndian>(QCOW2_MAGIC)?;
    dest.write_u32::<BigEndian>(3)?; // version
    dest.write_u64::<BigEndian>(0)?; // backing file offset
    dest.write_u32::<BigEndian>(0)?; // backing file size
    dest.write_u32::<BigEndian>(cluster_exp)?;
    dest.write_u64::<BigEndian>(data_cluster_count << cluster_exp)?; // virtual size
    dest.write_u32::<BigEndian>(0)?; // crypt method
    dest.write_u32::<BigEndian>(2 * l1_len as u32)?;
    dest.write_u64::<BigEndian>(l1_start)?;
    dest.write_u64::<BigEndian>(cluster)?; // refcount table offset
    dest.write_u32::<BigEndian>(1)?; // refcount table clusters
    dest.write_u32::<BigEndian>(0)?; // nb snapshots
    dest.write_u64::<BigEndian>(0)?; // snapshots offset
    dest.write_u64::<BigEndian>(1)?; // incompatible: refcounts are inconsistent
    dest.write_u64::<BigEndian>(0)?; // compatible features
    dest.write_u64::<BigEndian>(0)?; // autoclear features
    dest.write_u32::<BigEndian>(0)?; // refcount order
    dest.write_u32::<BigEndian>(QCOW2_HEADER_LEN)?;

    // Таблица L1: по две записи на каждую исходную L2
    dest.seek(SeekFrom::Start(l1_start))?;
    for &l2 in &l1_data {
        if l2 < 0 {
            dest.write_u64::<BigEndian>(0)?;
            dest.write_u64::<BigEndian>(0)?;
        } else {
            let at = entry_at(l2 as u64);
            dest.write_u64::<BigEndian>(at)?;
            dest.write_u64::<BigEndian>(at + cluster)?;
        }
    }

    // Удвоенные L2-таблицы и кластеры данных
    dest.seek(SeekFrom::Start(regular_base & !ALLOCATED_BIT))?;
    idx.src
        .seek(SeekFrom::Start(start + BLOCK_SIZE * clusters_offset))?;
    let mut last_l2 = 0u64;
    for &l2 in &l2_at_src {
        copy_exact(&mut idx.src, &mut dest, (l2 - last_l2) << cluster_exp)?;
        last_l2 = l2;

        idx.pos = idx.src.stream_position()? - start;
        for _ in 0..cluster / 4 {
            let ent = idx.read_index()?;
            let out = if ent < 0 { 0 } else { entry_at(ent as u64) };
            dest.write_u64::<BigEndian>(out)?;
        }
    }
    copy_exact(
        &mut idx.src,
        &mut dest,
        allocated_bytes - (last_l2 << cluster_exp),
    )?;

    dest.flush()?;
    Ok(())
}
