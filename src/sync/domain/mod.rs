pub mod derivation;
pub mod scripthash;
pub mod status;
pub mod wallet;
