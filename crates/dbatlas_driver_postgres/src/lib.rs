mod driver;

pub use driver::{PostgresDriver, PostgresHandle};
