use ethers::{
    abi::{decode as abi_decode, encode as abi_encode, ParamType, Token},
    types::{Address, Bytes, U256},
};

/// Start of the ABI-encoded validity window, right after the paymaster
/// address. Must match the paymaster contract's parsing offsets.
pub const VALID_TIMESTAMP_OFFSET: usize = 20;
/// Start of the signature, after the address and the encoded validity.
pub const SIGNATURE_OFFSET: usize = 84;
/// r(32) || s(32) || v(1)
pub const SIGNATURE_LENGTH: usize = 65;

const MAX_UINT48: u64 = (1 << 48) - 1;

/// The decoded form of a user operation's `paymaster_and_data` field:
/// `address(20) || abi(uint48 valid_until, uint48 valid_after)(64) ||
/// signature(65)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymasterAndData {
    pub paymaster: Address,
    pub valid_until: u64,
    pub valid_after: u64,
    pub signature: Bytes,
}

impl PaymasterAndData {
    pub fn new(
        paymaster: Address,
        valid_until: u64,
        valid_after: u64,
        signature: Bytes,
    ) -> eyre::Result<Self> {
        if valid_until > MAX_UINT48 || valid_after > MAX_UINT48 {
            eyre::bail!("validity bounds must fit in 48 bits");
        }
        if signature.len() != SIGNATURE_LENGTH {
            eyre::bail!("signature must be {SIGNATURE_LENGTH} bytes, got {}", signature.len());
        }

        Ok(Self { paymaster, valid_until, valid_after, signature })
    }

    pub fn encode(&self) -> Bytes {
        let validity = abi_encode(&[
            Token::Uint(U256::from(self.valid_until)),
            Token::Uint(U256::from(self.valid_after)),
        ]);

        let mut out = self.paymaster.as_bytes().to_vec();
        out.extend_from_slice(&validity);
        out.extend_from_slice(&self.signature);
        out.into()
    }

    pub fn decode(data: &[u8]) -> eyre::Result<Self> {
        if data.len() < SIGNATURE_OFFSET + SIGNATURE_LENGTH {
            eyre::bail!(
                "paymaster data too short: expected at least {} bytes, got {}",
                SIGNATURE_OFFSET + SIGNATURE_LENGTH,
                data.len()
            );
        }

        let paymaster = Address::from_slice(&data[..VALID_TIMESTAMP_OFFSET]);

        let tokens = abi_decode(
            &[ParamType::Uint(48), ParamType::Uint(48)],
            &data[VALID_TIMESTAMP_OFFSET..SIGNATURE_OFFSET],
        )?;
        let (valid_until, valid_after) = match tokens.as_slice() {
            [Token::Uint(until), Token::Uint(after)] => (until.as_u64(), after.as_u64()),
            _ => eyre::bail!("malformed validity window"),
        };

        let signature = &data[SIGNATURE_OFFSET..];
        if signature.len() != SIGNATURE_LENGTH {
            eyre::bail!("signature must be {SIGNATURE_LENGTH} bytes, got {}", signature.len());
        }
        let v = signature[SIGNATURE_LENGTH - 1];
        if v != 27 && v != 28 {
            eyre::bail!("invalid signature recovery id: {v}");
        }

        Self::new(paymaster, valid_until, valid_after, Bytes::from(signature.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_signature(v: u8) -> Bytes {
        let mut sig: Vec<u8> = (0..SIGNATURE_LENGTH as u8).collect();
        sig[SIGNATURE_LENGTH - 1] = v;
        Bytes::from(sig)
    }

    #[test]
    fn encode_decode_is_identity() {
        let pm: Address = "0x1234567890123456789012345678901234567890".parse().unwrap();
        let original =
            PaymasterAndData::new(pm, 1_900_000_300, 1_900_000_000, mock_signature(27)).unwrap();

        let encoded = original.encode();
        assert_eq!(encoded.len(), SIGNATURE_OFFSET + SIGNATURE_LENGTH);

        let decoded = PaymasterAndData::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn validity_window_lands_at_contract_offsets() {
        let pm: Address = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap();
        let encoded =
            PaymasterAndData::new(pm, 600, 500, mock_signature(28)).unwrap().encode();

        assert_eq!(&encoded[..VALID_TIMESTAMP_OFFSET], pm.as_bytes());
        // Each uint48 is ABI-padded to a full 32-byte word.
        assert_eq!(SIGNATURE_OFFSET - VALID_TIMESTAMP_OFFSET, 64);
        assert_eq!(encoded[VALID_TIMESTAMP_OFFSET + 31], (600u32 % 256) as u8);
        assert_eq!(encoded[SIGNATURE_OFFSET - 1], (500u32 % 256) as u8);
    }

    #[test]
    fn max_uint48_round_trips() {
        let max = (1u64 << 48) - 1;
        let pm: Address = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".parse().unwrap();
        let original = PaymasterAndData::new(pm, max, max, mock_signature(27)).unwrap();

        let decoded = PaymasterAndData::decode(&original.encode()).unwrap();
        assert_eq!(decoded.valid_until, max);
        assert_eq!(decoded.valid_after, max);
    }

    #[test]
    fn rejects_out_of_range_validity() {
        let pm = Address::zero();
        assert!(PaymasterAndData::new(pm, 1u64 << 48, 0, mock_signature(27)).is_err());
        assert!(PaymasterAndData::new(pm, 0, 1u64 << 48, mock_signature(27)).is_err());
    }

    #[test]
    fn rejects_bad_signature_shape() {
        let pm = Address::zero();
        assert!(PaymasterAndData::new(pm, 1, 0, Bytes::from(vec![0u8; 64])).is_err());

        // Wrong recovery id fails on decode.
        let encoded = PaymasterAndData::new(pm, 1, 0, mock_signature(99)).unwrap().encode();
        assert!(PaymasterAndData::decode(&encoded).is_err());

        // Truncated payload
        assert!(PaymasterAndData::decode(&encoded[..SIGNATURE_OFFSET]).is_err());
    }
}
