//! Fixed network table (§4.5, §4.5', §6.3): the proxy supports exactly four networks,
//! unlike a general-purpose facilitator that carries a larger registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    Base,
    BaseSepolia,
    Solana,
    SolanaDevnet,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported network: {0}")]
pub struct UnsupportedNetwork(pub String);

impl FromStr for Network {
    type Err = UnsupportedNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(Network::Base),
            "base-sepolia" => Ok(Network::BaseSepolia),
            "solana" => Ok(Network::Solana),
            "solana-devnet" => Ok(Network::SolanaDevnet),
            other => Err(UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Base => "base",
            Network::BaseSepolia => "base-sepolia",
            Network::Solana => "solana",
            Network::SolanaDevnet => "solana-devnet",
        };
        f.write_str(s)
    }
}

/// Chain family, used to pick an EVM vs. Solana signer for a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFamily {
    Evm,
    Solana,
}

impl Network {
    pub fn family(self) -> NetworkFamily {
        match self {
            Network::Base | Network::BaseSepolia => NetworkFamily::Evm,
            Network::Solana | Network::SolanaDevnet => NetworkFamily::Solana,
        }
    }

    /// CAIP-2 chain identifier, per §6.3's mapping table.
    pub fn caip2(self) -> &'static str {
        match self {
            Network::Base => "eip155:8453",
            Network::BaseSepolia => "eip155:84532",
            Network::Solana => "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp",
            Network::SolanaDevnet => "solana:EtWTRABZaYq6iMfeYKouRu166VU2xqa1",
        }
    }

    /// EVM chain id, valid only for the EVM family.
    pub fn evm_chain_id(self) -> Option<u64> {
        match self {
            Network::Base => Some(8453),
            Network::BaseSepolia => Some(84532),
            _ => None,
        }
    }

    /// USDC contract/mint address for this network, from the fixed table in §4.5.
    pub fn usdc_address(self) -> &'static str {
        match self {
            Network::Base => "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            Network::BaseSepolia => "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
            // USDC mint addresses on Solana mainnet / devnet.
            Network::Solana => "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            Network::SolanaDevnet => "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU",
        }
    }
}
