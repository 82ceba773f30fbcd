pub mod framer;
#[cfg(test)]
pub(crate) mod mock;
pub mod services;
pub mod session;
