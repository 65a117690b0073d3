pub mod btrfs;
pub mod fs;
pub mod s3;
