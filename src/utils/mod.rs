pub mod atomic_write;
pub mod compression;
pub mod crypto;
pub mod sos;
