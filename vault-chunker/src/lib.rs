//! Content-defined chunk boundaries (C6's splitter dependency), backed
//! by the `fastcdc` crate's gear-hash slicer rather than a hand-rolled
//! rolling checksum.

pub mod fastcdc;
pub use self::fastcdc::{FastCdc, FastCdcChunker, FastCdcPusher};

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("chunker source IO error")]
    Io(#[from] io::Error),
    #[error("slicer produced an empty chunk")]
    Empty,
}
