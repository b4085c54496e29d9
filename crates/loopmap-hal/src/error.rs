//! Error types shared with the rest of the workspace.

pub use loopmap_error::{map_nix_err, HalError, HalResult};
