//! Transport plumbing: protocol sniffing, SNI parsing, original-destination
//! recovery, the marked outbound dialer, and a marked one-shot HTTP(S) client
//! for callers (scanner, facilitator, Solana RPC) that can't route through
//! `dial_marked` directly.

pub mod dialer;
pub mod marked_http;
pub mod original_dst;
pub mod prefixed;
pub mod sni;

pub use dialer::{STRONGHOLD_MARK, dial_marked};
pub use marked_http::{MarkedHttpError, MarkedResponse};
pub use original_dst::original_dst;
pub use prefixed::PrefixedStream;
pub use sni::{SniError, parse_sni};
