//! Thread Mesh Commissioning Protocol (MeshCoP) commissioner.
//!
//! The commissioner petitions a Thread Border Agent for the commissioner
//! role over DTLS 1.2 keyed with the network's PSKc, publishes steering
//! data, and authenticates joiners with their PSKd. Joiner handshakes are
//! relayed by the Border Agent and terminated locally by a
//! [`JoinerSession`].
//!
//! Layers, bottom up:
//!
//! * [`dtls`]: sans-IO DTLS 1.2 with `TLS_ECJPAKE_WITH_AES_128_CCM_8`.
//! * [`Session`] / [`Server`]: DTLS endpoints bound to UDP sockets.
//! * [`coap`]: CoAP messaging on top of a session.
//! * [`tlv`] / [`meshcop`]: MeshCoP payloads.
//! * [`Commissioner`]: the commissioner state machine.
//!
//! Everything is single threaded and driven by a [`mainloop`]: collect fds
//! and deadlines with `update_fd_set`, wait, then call `process`.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::{Duration, Instant};
//! # use meshcop::mainloop::{Mainloop, MainloopContext};
//! # use meshcop::{Commissioner, Config, Pskc};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pskc = Pskc::derive("123456", &[0x11; 8], "OpenThread")?;
//! let mut commissioner = Commissioner::new(Arc::new(Config::default()), pskc)?;
//! commissioner.init_dtls("::1", 49191)?;
//!
//! let mut mainloop = Mainloop::new()?;
//! while !commissioner.try_dtls_handshake(Instant::now())? {
//!     let mut ctx = MainloopContext::new(Instant::now() + Duration::from_secs(1));
//!     commissioner.update_fd_set(&mut ctx, Instant::now());
//!     mainloop.wait(&ctx)?;
//! }
//! commissioner.petition(Instant::now())?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
// #![deny(missing_docs)]

#[macro_use]
extern crate log;

mod buffer;
mod config;
mod error;
mod rng;
mod timer;

pub mod coap;
pub mod commissioner;
pub mod dtls;
pub mod mainloop;
pub mod meshcop;
pub mod net;
pub mod pskc;
pub mod steering;
pub mod tlv;

mod server;
mod session;

pub use commissioner::{Commissioner, CommissionerState, JoinerSession, RelayPeer, Stats};
pub use config::{Config, ConfigBuilder};
pub use dtls::{Dtls, Kek, Output};
pub use error::Error;
pub use pskc::{Pskc, Pskd};
pub use rng::SeededRng;
pub use server::{Server, MAX_SEED_LEN};
pub use session::{Session, SessionState};
