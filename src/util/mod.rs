pub mod buf;
pub mod build_checksum;
