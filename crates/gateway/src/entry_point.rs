use ethers::{
    abi::AbiEncode,
    contract::abigen,
    types::{Address, Bytes},
};

abigen!(
    EntryPointContract,
    r#"[
        struct UserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; uint256 callGasLimit; uint256 verificationGasLimit; uint256 preVerificationGas; uint256 maxFeePerGas; uint256 maxPriorityFeePerGas; bytes paymasterAndData; bytes signature; }
        function handleOps(UserOperation[] calldata ops, address beneficiary)
    ]"#
);

/// Re-export of the generated call type for callers that want to build the
/// call themselves.
pub use entry_point_contract::HandleOpsCall as EntryPointCall;

impl From<courier_primitives::UserOperation> for entry_point_contract::UserOperation {
    fn from(uo: courier_primitives::UserOperation) -> Self {
        Self {
            sender: uo.sender,
            nonce: uo.nonce,
            init_code: uo.init_code,
            call_data: uo.call_data,
            call_gas_limit: uo.call_gas_limit,
            verification_gas_limit: uo.verification_gas_limit,
            pre_verification_gas: uo.pre_verification_gas,
            max_fee_per_gas: uo.max_fee_per_gas,
            max_priority_fee_per_gas: uo.max_priority_fee_per_gas,
            paymaster_and_data: uo.paymaster_and_data,
            signature: uo.signature,
        }
    }
}

/// Pack a batch of user operations into `handleOps(ops, beneficiary)`
/// calldata for the entry point.
pub fn handle_ops_calldata(
    ops: Vec<courier_primitives::UserOperation>,
    beneficiary: Address,
) -> Bytes {
    let call = EntryPointCall {
        ops: ops.into_iter().map(Into::into).collect(),
        beneficiary,
    };

    Bytes::from(call.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_primitives::UserOperation;
    use ethers::types::U256;

    #[test]
    fn calldata_carries_the_handle_ops_selector() {
        let uo = UserOperation {
            sender: "0x9406Cc6185a346906296840746125a0E44976454".parse().unwrap(),
            nonce: U256::from(1u64),
            ..Default::default()
        };
        let beneficiary: Address =
            "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap();

        let data = handle_ops_calldata(vec![uo], beneficiary);

        // handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,
        // uint256,uint256,bytes,bytes)[],address)
        assert_eq!(&data[..4], hex::decode("1fad948c").unwrap().as_slice());
        assert!(data.len() > 4);
    }

    #[test]
    fn empty_batches_still_encode() {
        let beneficiary = Address::zero();
        let data = handle_ops_calldata(vec![], beneficiary);

        assert_eq!(&data[..4], hex::decode("1fad948c").unwrap().as_slice());
    }
}
