use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use cvtm::consts::{
    END_POINTER_CHECKSUM_CRC32, END_POINTER_CHECKSUM_SHA256, ENDING_CIPHER_NULL,
    ENDING_CIPHER_RSA, IMG_CIPHER_NULL, IMG_CIPHER_XTS_AES,
};
use cvtm::FillMethod;

/// CLI архиватора CVTM
#[derive(Parser, Debug)]
#[command(name = "cvtm", version, about = "Append-only tamper-evident archive of disk images")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Write a fresh empty archive
    Create(CreateArgs),
    /// Extract images from an archive as QCOW2 (or raw)
    Extract(ExtractArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Output file ("-" writes to stdout)
    #[arg(long)]
    pub file: String,
    /// Output size in bytes (defaults to the size of an existing file)
    #[arg(long)]
    pub size: Option<u64>,
    /// Allocation unit in bytes (power of two, >= 512)
    #[arg(long, default_value_t = 0x10000)]
    pub au: u32,
    #[arg(long, value_enum, default_value = "rsa")]
    pub ending_cipher: EndingCipherArg,
    #[arg(long, value_enum, default_value = "sha256")]
    pub end_pointer_checksum: EndPointerChecksumArg,
    /// Number of end pointers before the image area
    #[arg(long, default_value_t = 1)]
    pub end_pointers_head: u32,
    /// Number of end pointers after the image area
    #[arg(long, default_value_t = 1)]
    pub end_pointers_tail: u32,
    /// Method to fill unused space
    #[arg(long, value_enum, default_value = "random")]
    pub fill: FillArg,
    #[arg(long, value_enum, default_value = "xts-aes")]
    pub image_cipher: ImageCipherArg,
    /// RSA public key file (PEM or PKCS#1 DER)
    #[arg(long)]
    pub public_key: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Archive file
    #[arg(long)]
    pub file: PathBuf,
    /// RSA private key file (PEM or PKCS#1 DER)
    #[arg(long)]
    pub private_key: Option<PathBuf>,
    /// Template for names of extracted images ("{index}" is replaced)
    #[arg(long, default_value = "image-{index}")]
    pub image_name: String,
    /// Allow extracted files to overwrite existing files
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
    /// Don't convert to QCOW2
    #[arg(long, default_value_t = false)]
    pub raw: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum EndingCipherArg {
    Null,
    Rsa,
}

impl EndingCipherArg {
    pub fn algo(self) -> u32 {
        match self {
            EndingCipherArg::Null => ENDING_CIPHER_NULL,
            EndingCipherArg::Rsa => ENDING_CIPHER_RSA,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum EndPointerChecksumArg {
    Sha256,
    Crc32,
}

impl EndPointerChecksumArg {
    pub fn algo(self) -> u32 {
        match self {
            EndPointerChecksumArg::Sha256 => END_POINTER_CHECKSUM_SHA256,
            EndPointerChecksumArg::Crc32 => END_POINTER_CHECKSUM_CRC32,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum FillArg {
    Random,
    Seek,
    Zero,
}

impl FillArg {
    pub fn method(self) -> FillMethod {
        match self {
            FillArg::Random => FillMethod::Random,
            FillArg::Seek => FillMethod::Seek,
            FillArg::Zero => FillMethod::Zero,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ImageCipherArg {
    Null,
    XtsAes,
}

impl ImageCipherArg {
    pub fn algo(self) -> u32 {
        match self {
            ImageCipherArg::Null => IMG_CIPHER_NULL,
            ImageCipherArg::XtsAes => IMG_CIPHER_XTS_AES,
        }
    }
}
