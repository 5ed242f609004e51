//! Inter-context byte channels

pub mod pipe;

pub use pipe::Pipe;
