//! Cooperative run cancellation.

mod token;

pub use token::CancellationToken;
