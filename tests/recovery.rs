use anyhow::Result;
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;

use cvtm::consts::{BLOCK_SIZE, END_POINTER_CHECKSUM_CRC32, ENDING_CIPHER_NULL};
use cvtm::endptr::find_end;
use cvtm::{read_archive_header, ExtractOptions, FillMethod, NewArchiveOptions};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("cvtm-{}-{}-{}", prefix, pid, t))
}

fn extract_options() -> ExtractOptions {
    ExtractOptions {
        private_key: None,
        image_name: "image-{index}".into(),
        overwrite: false,
        raw: false,
    }
}

fn write_redundant_archive(root: &PathBuf) -> PathBuf {
    fs::create_dir_all(root).unwrap();
    let conf = NewArchiveOptions {
        disk_size: 16 << 20,
        global_logs: vec![],
        img_logs: vec![],
        end_pointers_head: 3,
        end_pointers_tail: 3,
        ending_cipher: ENDING_CIPHER_NULL,
        end_pointer_checksum: END_POINTER_CHECKSUM_CRC32,
        public_key: None,
        img_cipher: 0,
        img_cluster_size_exp: 7,
        alignment_blocks: 128,
        fill_method: FillMethod::Zero,
    };
    let path = root.join("arc");
    let file = fs::File::create(&path).unwrap();
    cvtm::write_empty_archive(BufWriter::new(&file), &conf).unwrap();
    file.sync_all().unwrap();
    path
}

fn zero_block(path: &PathBuf, blk: u64) {
    let mut data = fs::read(path).unwrap();
    let at = (blk * BLOCK_SIZE) as usize;
    data[at..at + BLOCK_SIZE as usize].fill(0);
    fs::write(path, data).unwrap();
}

/// Порча двух из шести указателей не мешает восстановлению.
#[test]
fn survives_two_torn_end_pointers() -> Result<()> {
    let root = unique_root("torn2");
    let path = write_redundant_archive(&root);

    let file = fs::File::open(&path)?;
    let header = read_archive_header(&file, &extract_options())?;
    assert_eq!(header.end_pointer_loca.len(), 6);
    let expected =
        (header.image_area.start as u64 + header.ending_size.size as u64) * BLOCK_SIZE;
    drop(file);

    // Затираем один головной и один хвостовой
    zero_block(&path, header.end_pointer_loca[0].blk as u64);
    zero_block(&path, header.end_pointer_loca[4].blk as u64);

    let file = fs::File::open(&path)?;
    let header = read_archive_header(&file, &extract_options())?;
    assert_eq!(find_end(&file, &header), expected);

    Ok(())
}

/// Порча каждого указателя по одиночке также переживается.
#[test]
fn survives_any_single_torn_end_pointer() -> Result<()> {
    let root = unique_root("torn1");
    let path = write_redundant_archive(&root);
    let file = fs::File::open(&path)?;
    let header = read_archive_header(&file, &extract_options())?;
    let expected =
        (header.image_area.start as u64 + header.ending_size.size as u64) * BLOCK_SIZE;
    drop(file);

    for i in 0..header.end_pointer_loca.len() {
        let copy = root.join(format!("arc-{}", i));
        fs::copy(&path, &copy)?;
        zero_block(&copy, header.end_pointer_loca[i].blk as u64);

        let file = fs::File::open(&copy)?;
        let header = read_archive_header(&file, &extract_options())?;
        assert_eq!(find_end(&file, &header), expected, "pointer {} zeroed", i);
    }

    Ok(())
}

/// Без единого валидного указателя чтение невозможно.
#[test]
fn all_pointers_torn_is_fatal() -> Result<()> {
    let root = unique_root("torn-all");
    let path = write_redundant_archive(&root);
    let file = fs::File::open(&path)?;
    let header = read_archive_header(&file, &extract_options())?;
    drop(file);

    for e in &header.end_pointer_loca {
        zero_block(&path, e.blk as u64);
    }

    let file = fs::File::open(&path)?;
    let header = read_archive_header(&file, &extract_options())?;
    assert_eq!(find_end(&file, &header), 0);

    let err = cvtm::extract_archive(&file, &extract_options())
        .unwrap_err()
        .to_string();
    assert!(err.contains("no valid end pointer exists"), "{}", err);

    Ok(())
}

/// Любая порча заголовка вне поля чексуммы фатальна.
#[test]
fn header_tamper_is_detected() -> Result<()> {
    let root = unique_root("tamper");
    let path = write_redundant_archive(&root);

    let header_len = {
        let data = fs::read(&path)?;
        u32::from_le_bytes(data[52..56].try_into().unwrap()) as usize
    };

    // Байт в середине, байт в последней записи, бит в TypeID
    for (at, bit) in [(64usize, 1u8), (header_len - 1, 0x80), (16, 4)] {
        let copy = root.join(format!("arc-{}", at));
        fs::copy(&path, &copy)?;
        let mut data = fs::read(&copy)?;
        data[at] ^= bit;
        fs::write(&copy, data)?;

        let file = fs::File::open(&copy)?;
        let err = read_archive_header(&file, &extract_options())
            .unwrap_err()
            .to_string();
        assert!(err.contains("bad checksum"), "at {}: {}", at, err);
    }

    Ok(())
}

/// Порча самой магии диагностируется раньше чексуммы.
#[test]
fn bad_magic_is_detected() -> Result<()> {
    let root = unique_root("magic");
    let path = write_redundant_archive(&root);
    let mut data = fs::read(&path)?;
    data[0] ^= 0xFF;
    fs::write(&path, data)?;

    let file = fs::File::open(&path)?;
    let err = read_archive_header(&file, &extract_options())
        .unwrap_err()
        .to_string();
    assert!(err.contains("bad magic number"), "{}", err);

    Ok(())
}
