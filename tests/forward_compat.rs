use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;

use cvtm::consts::{END_POINTER_CHECKSUM_SHA256, ENDING_CIPHER_NULL};
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

fn write_archive(root: &PathBuf) -> PathBuf {
    fs::create_dir_all(root).unwrap();
    let conf = NewArchiveOptions {
        disk_size: 16 << 20,
        global_logs: vec![],
        img_logs: vec![],
        end_pointers_head: 1,
        end_pointers_tail: 1,
        ending_cipher: ENDING_CIPHER_NULL,
        end_pointer_checksum: END_POINTER_CHECKSUM_SHA256,
        public_key: None,
        img_cipher: 0,
        img_cluster_size_exp: 7,
        alignment_blocks: 128,
        fill_method: FillMethod::Zero,
    };
    let path = root.join("arc");
    let file = fs::File::create(&path).unwrap();
    cvtm::write_empty_archive(BufWriter::new(&file), &conf).unwrap();
    path
}

// Дописать запись в регион заголовка, поправить HeaderLength и
// пересчитать чексумму — как сделал бы более новый писатель.
fn inject_entry(path: &PathBuf, type_id: &[u8; 16], payload: &[u8]) {
    let mut data = fs::read(path).unwrap();
    let header_len = LittleEndian::read_u32(&data[52..56]) as usize;

    let mut header = data[..header_len].to_vec();
    header.extend_from_slice(type_id);
    header.extend_from_slice(&((20 + payload.len()) as u32).to_le_bytes());
    header.extend_from_slice(payload);

    let header_len = header.len() as u32;
    LittleEndian::write_u32(&mut header[52..56], header_len);
    header[20..52].fill(0);
    let digest = Sha256::digest(&header);
    header[20..52].copy_from_slice(&digest);

    data[..header.len()].copy_from_slice(&header);
    fs::write(path, data).unwrap();
}

/// Неизвестная запись в заголовке не мешает чтению (одно
/// предупреждение в лог).
#[test]
fn unknown_header_entry_is_tolerated() -> Result<()> {
    let root = unique_root("fwd");
    let path = write_archive(&root);
    inject_entry(&path, b"FUTURE-FEATURE\x00\x00", &[0u8; 4]);

    let file = fs::File::open(&path)?;
    let header = read_archive_header(&file, &extract_options())?;
    assert_eq!(header.image_area.start, 256);
    assert_eq!(header.end_pointer_loca.len(), 2);

    Ok(())
}

/// Дубликат скалярной записи: побеждает последняя.
#[test]
fn duplicate_scalar_entry_last_wins() -> Result<()> {
    let root = unique_root("dup");
    let path = write_archive(&root);
    // Второй ENDING-SIZE с другим значением
    inject_entry(&path, b"ENDING-SIZE\x00\x00\x00\x00\x00", &7u32.to_le_bytes());

    let file = fs::File::open(&path)?;
    let header = read_archive_header(&file, &extract_options())?;
    assert_eq!(header.ending_size.size, 7);

    Ok(())
}

/// Запись, короче схемы, но с целыми полями: хвост полей — нули.
#[test]
fn truncated_known_entry_defaults_missing_fields() -> Result<()> {
    let root = unique_root("short");
    let path = write_archive(&root);
    // GLOBAL-LOG-LOCAT только с полем Start
    inject_entry(&path, b"GLOBAL-LOG-LOCAT", &300u32.to_le_bytes());

    let file = fs::File::open(&path)?;
    let header = read_archive_header(&file, &extract_options())?;
    assert_eq!(header.global_log_locat.len(), 1);
    assert_eq!(header.global_log_locat[0].start, 300);
    assert_eq!(header.global_log_locat[0].count, 0);

    Ok(())
}

/// Запись, оборванная посреди поля, фатальна для заголовка.
#[test]
fn mid_field_entry_is_fatal() -> Result<()> {
    let root = unique_root("midfield");
    let path = write_archive(&root);
    inject_entry(&path, b"GLOBAL-LOG-LOCAT", &[1, 2]);

    let file = fs::File::open(&path)?;
    let err = read_archive_header(&file, &extract_options())
        .unwrap_err()
        .to_string();
    assert!(err.contains("field is incomplete"), "{}", err);

    Ok(())
}
