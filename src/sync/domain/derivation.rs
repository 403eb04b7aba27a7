// Script derivation for wallet address nodes

use bdk_wallet::miniscript::{Descriptor, DescriptorPublicKey};
use bitcoin::ScriptBuf;

use crate::sync::domain::wallet::KeyPurpose;
use crate::sync::error::{Error, Result};

/// Produces the output script of the address at `(purpose, index)`.
///
/// The engine never computes scripts itself; the wallet supplies them through
/// this seam when the address tree is extended.
pub trait ScriptDeriver: Send + Sync {
    fn derive(&self, purpose: KeyPurpose, index: u32) -> Result<ScriptBuf>;
}

/// Derives scripts from a pair of ranged output descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorDeriver {
    receive: Descriptor<DescriptorPublicKey>,
    change: Descriptor<DescriptorPublicKey>,
}

impl DescriptorDeriver {
    pub fn new(
        receive: Descriptor<DescriptorPublicKey>,
        change: Descriptor<DescriptorPublicKey>,
    ) -> Result<Self> {
        for d in [&receive, &change] {
            if !d.has_wildcard() {
                return Err(Error::Wallet(format!("descriptor {} is not ranged", d)));
            }
        }
        Ok(Self { receive, change })
    }

    pub fn parse(receive: &str, change: &str) -> Result<Self> {
        let parse = |s: &str| {
            s.parse::<Descriptor<DescriptorPublicKey>>()
                .map_err(|e| Error::Wallet(format!("invalid descriptor {}: {}", s, e)))
        };
        Self::new(parse(receive)?, parse(change)?)
    }
}

impl ScriptDeriver for DescriptorDeriver {
    fn derive(&self, purpose: KeyPurpose, index: u32) -> Result<ScriptBuf> {
        let descriptor = match purpose {
            KeyPurpose::Receive => &self.receive,
            KeyPurpose::Change => &self.change,
        };

        let spk = descriptor
            .at_derivation_index(index)
            .map_err(|e| Error::Wallet(format!("cannot derive {}/{}: {}", purpose, index, e)))?
            .script_pubkey();
        Ok(spk)
    }
}
