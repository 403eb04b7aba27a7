pub mod client;

pub use client::MockElectrumTransport;
