use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, Signature},
};

/// Wrapper around an ethers wallet holding a sponsor's signing key.
#[derive(Clone, Debug)]
pub struct Wallet {
    /// Signing key of the wallet
    pub signer: LocalWallet,
}

impl Wallet {
    /// Create a wallet from a hex-encoded private key, bound to a chain id.
    pub fn from_key(key: &str, chain_id: u64) -> eyre::Result<Self> {
        let signer = key.trim_start_matches("0x").parse::<LocalWallet>()?;
        Ok(Self { signer: signer.with_chain_id(chain_id) })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sign an EIP-191 prefixed message.
    pub async fn sign_message(&self, msg: &[u8]) -> eyre::Result<Signature> {
        Ok(self.signer.sign_message(msg).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known anvil dev key
    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn derives_the_expected_address() {
        let wallet = Wallet::from_key(KEY, 1).unwrap();
        let expected: Address =
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();

        assert_eq!(wallet.address(), expected);
    }

    #[tokio::test]
    async fn signatures_recover_to_the_wallet_address() {
        let wallet = Wallet::from_key(KEY, 1).unwrap();
        let msg = b"sponsor this operation";

        let sig = wallet.sign_message(msg).await.unwrap();
        assert_eq!(sig.recover(&msg[..]).unwrap(), wallet.address());
    }
}
