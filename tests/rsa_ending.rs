use anyhow::Result;
use rsa::RsaPrivateKey;
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;

use cvtm::consts::{BLOCK_SIZE, END_POINTER_CHECKSUM_SHA256, ENDING_CIPHER_RSA};
use cvtm::endptr::find_end;
use cvtm::entries::ID_NO_MORE_IMAGES;
use cvtm::{
    extract_archive, read_archive_header, ExtractOptions, FillMethod, NewArchiveOptions,
};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("cvtm-{}-{}-{}", prefix, pid, t))
}

fn test_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("generate rsa key")
}

fn write_rsa_archive(root: &PathBuf, key: &RsaPrivateKey) -> PathBuf {
    fs::create_dir_all(root).unwrap();
    let conf = NewArchiveOptions {
        disk_size: 1 << 20,
        global_logs: vec![],
        img_logs: vec![],
        end_pointers_head: 1,
        end_pointers_tail: 1,
        ending_cipher: ENDING_CIPHER_RSA,
        end_pointer_checksum: END_POINTER_CHECKSUM_SHA256,
        public_key: Some(key.to_public_key()),
        img_cipher: 0,
        img_cluster_size_exp: 3,
        alignment_blocks: 8,
        fill_method: FillMethod::Zero,
    };
    let path = root.join("arc");
    let file = fs::File::create(&path).unwrap();
    cvtm::write_empty_archive(BufWriter::new(&file), &conf).unwrap();
    path
}

/// 2048-битный ключ: EndingSize = 1 блок, страж — RSA-шифротекст,
/// выгрузка с парным ключом даёт ноль образов.
#[test]
fn rsa_archive_roundtrip_yields_no_images() -> Result<()> {
    let root = unique_root("rsa");
    let key = test_key();
    let path = write_rsa_archive(&root, &key);

    let file = fs::File::open(&path)?;
    let options = ExtractOptions {
        private_key: Some(key.clone()),
        image_name: root.join("image-{index}").to_string_lossy().into_owned(),
        overwrite: false,
        raw: false,
    };

    let header = read_archive_header(&file, &options)?;
    assert_eq!(header.ending_size.size, 1, "ceil(256 / 512) = 1 block");
    assert!(!header.ending_cipher.key.is_empty());

    // Область стража зашифрована: открытого TypeID там нет
    let end_at = find_end(&file, &header);
    assert_eq!(
        end_at,
        (header.image_area.start as u64 + 1) * BLOCK_SIZE
    );
    let data = fs::read(&path)?;
    let sentinel =
        &data[(end_at - BLOCK_SIZE) as usize..end_at as usize];
    assert_ne!(&sentinel[..16], &ID_NO_MORE_IMAGES.0);

    extract_archive(&file, &options)?;

    Ok(())
}

/// Без приватного ключа зашифрованный архив не читается.
#[test]
fn missing_private_key_is_fatal() -> Result<()> {
    let root = unique_root("rsa-nokey");
    let key = test_key();
    let path = write_rsa_archive(&root, &key);

    let file = fs::File::open(&path)?;
    let options = ExtractOptions {
        private_key: None,
        image_name: "image-{index}".into(),
        overwrite: false,
        raw: false,
    };
    let err = read_archive_header(&file, &options).unwrap_err().to_string();
    assert!(
        err.contains("archive is encrypted, but private key is not given"),
        "{}",
        err
    );

    Ok(())
}

/// Чужой ключ: заголовок читается (с предупреждением о несовпадении),
/// но расшифровка стража проваливается.
#[test]
fn wrong_private_key_fails_decryption() -> Result<()> {
    let root = unique_root("rsa-wrong");
    let key = test_key();
    let other = test_key();
    let path = write_rsa_archive(&root, &key);

    let file = fs::File::open(&path)?;
    let options = ExtractOptions {
        private_key: Some(other),
        image_name: root.join("image-{index}").to_string_lossy().into_owned(),
        overwrite: false,
        raw: false,
    };

    read_archive_header(&file, &options)?;
    let err = extract_archive(&file, &options).unwrap_err().to_string();
    assert!(err.contains("decryption failed"), "{}", err);

    Ok(())
}
