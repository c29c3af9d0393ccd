use ethers::{
    abi::{encode as abi_encode, Token},
    types::{Address, Bytes, H256, U256},
    utils::keccak256,
};
use serde::{Deserialize, Serialize};

/// An ERC-4337 user operation (entry point v0.6 layout).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Hash of the packed operation, excluding the signature.
    fn packed_hash(&self) -> H256 {
        let encoded = abi_encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ]);
        H256::from(keccak256(encoded))
    }

    /// The user operation hash as computed by the entry point:
    /// `keccak256(abi.encode(packed_hash, entry_point, chain_id))`.
    pub fn hash(&self, entry_point: &Address, chain_id: U256) -> H256 {
        let encoded = abi_encode(&[
            Token::FixedBytes(self.packed_hash().as_bytes().to_vec()),
            Token::Address(*entry_point),
            Token::Uint(chain_id),
        ]);
        H256::from(keccak256(encoded))
    }

    /// The paymaster address embedded in `paymaster_and_data`, if any.
    pub fn paymaster(&self) -> Option<Address> {
        if self.paymaster_and_data.len() < 20 {
            return None;
        }
        Some(Address::from_slice(&self.paymaster_and_data[..20]))
    }
}

/// Extract the destination address from account `execute(address,uint256,bytes)`
/// calldata: 4 selector bytes, then the address right-aligned in the first
/// 32-byte word.
pub fn parse_execute_destination(call_data: &[u8]) -> eyre::Result<Address> {
    if call_data.len() < 4 + 32 {
        eyre::bail!("calldata too short to carry a destination");
    }

    Ok(Address::from_slice(&call_data[16..36]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_uo() -> UserOperation {
        UserOperation {
            sender: "0x9406Cc6185a346906296840746125a0E44976454".parse().unwrap(),
            nonce: U256::from(7u64),
            call_data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            call_gas_limit: U256::from(200_000u64),
            verification_gas_limit: U256::from(100_000u64),
            pre_verification_gas: U256::from(21_000u64),
            max_fee_per_gas: U256::from(3_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            ..Default::default()
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let ep: Address = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap();
        let uo = sample_uo();

        assert_eq!(uo.hash(&ep, U256::from(1u64)), uo.hash(&ep, U256::from(1u64)));
    }

    #[test]
    fn hash_binds_entry_point_chain_and_fields() {
        let ep: Address = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap();
        let other_ep: Address =
            "0x0576a174D229E3cFA37253523E645A78A0C91B57".parse().unwrap();
        let uo = sample_uo();
        let base = uo.hash(&ep, U256::from(1u64));

        assert_ne!(base, uo.hash(&other_ep, U256::from(1u64)));
        assert_ne!(base, uo.hash(&ep, U256::from(137u64)));

        let bumped = UserOperation { nonce: U256::from(8u64), ..uo.clone() };
        assert_ne!(base, bumped.hash(&ep, U256::from(1u64)));

        // Signature is excluded from the hash.
        let signed = UserOperation { signature: Bytes::from(vec![1u8; 65]), ..uo };
        assert_eq!(base, signed.hash(&ep, U256::from(1u64)));
    }

    #[test]
    fn paymaster_is_first_twenty_bytes() {
        let pm: Address = "0x1234567890123456789012345678901234567890".parse().unwrap();
        let mut data = pm.as_bytes().to_vec();
        data.extend_from_slice(&[0u8; 64]);

        let uo = UserOperation { paymaster_and_data: Bytes::from(data), ..sample_uo() };
        assert_eq!(uo.paymaster(), Some(pm));

        let bare = UserOperation { paymaster_and_data: Bytes::new(), ..sample_uo() };
        assert_eq!(bare.paymaster(), None);
    }

    #[test]
    fn execute_destination_is_parsed_from_calldata() {
        let dest: Address = "0x33A4622B82D4c04a53e170c638B944ce27cffce3".parse().unwrap();

        let mut call_data = vec![0xb6, 0x1d, 0x27, 0xf6];
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(dest.as_bytes());
        call_data.extend_from_slice(&word);

        assert_eq!(parse_execute_destination(&call_data).unwrap(), dest);
        assert!(parse_execute_destination(&[0u8; 8]).is_err());
    }
}
