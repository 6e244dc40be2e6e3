pub mod process;
pub mod types;

use crate::{classify::Role, table::Table};
use anyhow::Result;
use std::path::Path;

pub use types::{DecodeIn, DecodeOut, DecoderDiag};

/// External capability that turns one binary time-series file into a table.
///
/// Implementations must be shareable across the per-role conversion threads.
pub trait Decoder: Send + Sync {
    fn doctor(&self) -> Result<DecoderDiag>;
    fn decode(&self, input: &Path, role: Role) -> Result<Table>;
}
