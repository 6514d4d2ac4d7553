//! Чтение ключевых файлов: PEM ("RSA PUBLIC KEY"/"RSA PRIVATE KEY")
//! либо сырой PKCS#1 DER.

use anyhow::{anyhow, Context, Result};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;

fn looks_like_pem(data: &[u8]) -> bool {
    data.starts_with(b"-----BEGIN ")
}

pub fn read_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let data = std::fs::read(path)
        .with_context(|| format!("error reading key file {}", path.display()))?;

    if looks_like_pem(&data) {
        let text = std::str::from_utf8(&data)
            .map_err(|_| anyhow!("key file {} is not valid PEM", path.display()))?;
        RsaPublicKey::from_pkcs1_pem(text)
            .map_err(|e| anyhow!("error parsing key file {}: {}", path.display(), e))
    } else {
        RsaPublicKey::from_pkcs1_der(&data)
            .map_err(|e| anyhow!("error parsing key file {}: {}", path.display(), e))
    }
}

pub fn read_private_key_file(path: &Path) -> Result<RsaPrivateKey> {
    let data = std::fs::read(path)
        .with_context(|| format!("error reading key file {}", path.display()))?;

    let key = if looks_like_pem(&data) {
        let text = std::str::from_utf8(&data)
            .map_err(|_| anyhow!("key file {} is not valid PEM", path.display()))?;
        RsaPrivateKey::from_pkcs1_pem(text)
            .map_err(|e| anyhow!("error parsing key file {}: {}", path.display(), e))?
    } else {
        RsaPrivateKey::from_pkcs1_der(&data)
            .map_err(|e| anyhow!("error parsing key file {}: {}", path.display(), e))?
    };

    key.validate()
        .map_err(|e| anyhow!("invalid private key {}: {}", path.display(), e))?;
    Ok(key)
}
