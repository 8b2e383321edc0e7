pub mod codes_loader;

pub use codes_loader::{load_codes, parse_codes};
