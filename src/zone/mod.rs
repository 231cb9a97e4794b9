pub mod options;
pub mod parser;
pub mod registry;
pub mod responder;
pub mod transfer;
#[allow(clippy::module_inception)]
pub mod zone;

pub use options::{ZoneOption, ZoneOptionSet};
pub use parser::ZoneParser;
pub use registry::ZoneRegistry;
pub use zone::{Lookup, RrSet, ZoneRole, ZoneState, ZoneStoreKind};
