// Базовые модули
pub mod consts;
pub mod entries; // src/entries/{mod,codec}.rs

// Запись архива
pub mod create;
pub mod fill;
pub mod randsrc;

// Чтение архива
pub mod endptr;
pub mod extract;
pub mod qcow2;

// Удобные реэкспорты
pub use create::{write_empty_archive, LogConf, NewArchiveOptions};
pub use extract::{extract_archive, read_archive_header, ExtractOptions};
pub use fill::FillMethod;
