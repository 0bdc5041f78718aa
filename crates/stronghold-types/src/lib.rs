//! Wire types shared between the scanner client, payment signer, and settlement worker.

pub mod network;
pub mod payment;
pub mod record;
pub mod scan;
pub mod util;

pub use network::Network;
pub use payment::{PaymentRequirements, X402Payload};
pub use record::{PaymentRecord, PaymentStatus};
pub use scan::{ScanAction, ScanDecision, ScanResult, Threat};
