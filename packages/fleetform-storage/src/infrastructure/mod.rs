//! Object store backends.

pub mod local;
pub mod s3;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;
