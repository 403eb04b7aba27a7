pub mod api;
pub mod asynchronous;

#[cfg(test)]
pub mod mock;
