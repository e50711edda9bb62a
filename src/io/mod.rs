//! I/O abstraction layer for reading bytes from the input file

pub mod byte_reader;
pub mod local_reader;

pub use byte_reader::{ByteReader, read_full};
pub use local_reader::LocalFileByteReader;
