//! Content-addressed unpack cache
//!
//! Every bundle owns a namespace directory under the cache root. Inside it,
//! each unpacked version lives in a directory named after its content digest.
//!
//! # Invariants
//!
//! - A generation directory only appears once its content is complete
//!   (staging directories are renamed into place)
//! - Generations are read-only from the moment they appear
//! - Garbage collection keeps exactly one generation per bundle
//!
//! # Generation States
//!
//! | State | Directory | Mode |
//! |-------|-----------|------|
//! | Staging | `.staging-<token>` | rw, private |
//! | Sealed | `<algorithm>:<hex>` | ro |

pub mod layout;
pub mod store;

pub use layout::{contained_path, validate_name, CacheLayout};
pub use store::{delete_recursive, set_read_only_recursive, Generation, GenerationStore};
