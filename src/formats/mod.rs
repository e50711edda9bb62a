//! Delimited input formats and the streaming chunk reader

pub mod delimited;
pub mod reader;

pub use delimited::reader::ChunkReader;
pub use reader::{DecodePolicy, InputFileConfig, InputFileConfigJson, RawRow};
