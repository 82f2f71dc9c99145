pub mod address;
pub mod games;
pub mod launch;
pub mod lifecycle;
pub mod list;
pub mod snapshot;
