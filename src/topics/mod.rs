pub mod filter;
pub mod types;

pub use filter::{FilterSpec, Range, RemoteQuery};
