pub mod doh;
pub mod doq;
pub mod dot;
pub mod tls;

pub use doh::run_doh_listener;
pub use doq::run_doq_listener;
pub use dot::run_dot_listener;
pub use tls::{load_tls_config, tls_material_present};
