mod cursor;
mod driver;

pub use driver::{OracleDriver, OracleHandle};
