mod config;
mod dispatcher;
mod exchange;
mod handle;
#[cfg(test)]
mod tests;

pub use config::*;
pub use handle::*;
