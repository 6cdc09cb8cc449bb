pub mod completions;
pub mod credential;
pub mod page;
