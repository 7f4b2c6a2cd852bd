//! On-chain contract interfaces consumed by the relay.
//!
//! The contracts themselves are black boxes; only the ABI surface below is
//! relied upon.

use alloy_sol_types::sol;

sol! {
    /// EIP-2771 trusted forwarder. `execute` performs the inner call with the
    /// signer's address appended to calldata and emits `Executed` with the
    /// inner outcome; replay is rejected by the per-signer nonce.
    #[sol(rpc)]
    contract IMinimalForwarder {
        struct ForwardRequest {
            address from;
            address to;
            uint256 value;
            uint256 gas;
            uint256 nonce;
            uint256 deadline;
            bytes data;
        }

        function getNonce(address from) external view returns (uint256);
        function verify(ForwardRequest calldata request, bytes calldata signature) external view returns (bool);
        function execute(ForwardRequest calldata request, bytes calldata signature) external payable returns (bool success, bytes memory result);

        event Executed(address indexed from, address indexed to, bool success, bytes result);
    }
}

sol! {
    /// EIP-3009 capable stablecoin (USDC-style), subset used by the relay.
    #[sol(rpc)]
    contract IStablecoin {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
        function DOMAIN_SEPARATOR() external view returns (bytes32);
    }
}

sol! {
    /// UniswapV2-style router, used only by the auto-rebalance loop to swap
    /// accumulated stablecoin back into native gas funds.
    #[sol(rpc)]
    contract ISwapRouter {
        function swapExactTokensForETH(
            uint256 amountIn,
            uint256 amountOutMin,
            address[] calldata path,
            address to,
            uint256 deadline
        ) external returns (uint256[] memory amounts);
        function getAmountsOut(uint256 amountIn, address[] calldata path) external view returns (uint256[] memory amounts);
    }
}
