pub mod edns;
pub mod enums;
pub mod header;
pub mod name;
pub mod packet;
pub mod question;
pub mod record;

pub use edns::{EdnsOpt, EdnsView, OtsMode};
pub use enums::{Opcode, Rcode, RrClass, RrType};
pub use header::Header;
pub use name::Name;
pub use packet::Message;
pub use question::Question;
pub use record::{KeyRdata, Record, SigRdata, SoaRdata, SvcbRdata};
