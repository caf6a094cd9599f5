//! Phantom trust core.
//!
//! Three coupled engines sharing one append-only, hash-chained audit log:
//!
//! - [`governor`]: classifies code requests by capability and behaviour and
//!   decides whether they may run.
//! - [`dnauth`]: authenticates users with nucleotide sequences, including
//!   fuzzy, codon-synonymous and ancestor-generation matches.
//! - [`qrnet`]: signs links from destinations to content, bound to the
//!   creator's DNAuth identity and the governor state version.
//!
//! [`trust::TrustCore`] wires them together; [`advisory`] derives threat
//! trend and health from the governor counters and the audit tail.
//!
//! See `DESIGN.md` for the architecture and lock order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod entropy;
pub mod error;
pub mod logging;

pub mod geology;

pub mod dnauth;
pub mod governor;
pub mod qrnet;

pub mod advisory;
pub mod trust;

pub use error::{CoreError, ErrorKind};
pub use trust::{TrustCore, TrustCoreBuilder};
