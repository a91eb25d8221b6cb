pub mod session;
pub mod util;
pub mod test_util;
