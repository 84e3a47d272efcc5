pub use self::core::Db;

mod core;
pub(crate) mod products;

pub(crate) use self::core::{execute, quote_ident};
