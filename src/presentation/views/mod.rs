pub mod blocked;
pub mod discovery;
pub mod stream;
