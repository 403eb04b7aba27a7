pub mod adapter;


pub use adapter::ElectrumAdapter;
