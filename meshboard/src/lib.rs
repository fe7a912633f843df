//! meshboard — a peer-to-peer shared drawing board.
//!
//! A fixed set of participants replicate a canvas over a TCP mesh. At any
//! moment at most one participant holds the write token and may mutate the
//! board; everyone else is read-only. The crate is the coordination core:
//!
//! - [`wire`] — JSON-per-message codec with brace-counted frame reassembly
//! - [`peer`] — one TCP link: registration handshake, reader/writer tasks
//! - [`pool`] — accept loop, outbound connect, broadcast, failure detection
//! - [`membership`] — who is on the board and how we learned about them
//! - [`ownership`] — token + Ricart–Agrawala mutual exclusion
//! - [`controller`] — single-consumer event loop applying every transition
//! - [`canvas`] — the seam to the drawing surface (bytes stay opaque here)
//! - [`node`] — wiring and the embedding handle
//!
//! The drawing surface itself (PNG encoding, widgets) lives outside this
//! crate; [`canvas::MemCanvas`] is the reference implementation used by the
//! binary and the tests.

pub mod canvas;
pub mod config;
pub mod controller;
pub mod ident;
pub mod membership;
pub mod node;
pub mod ownership;
pub mod peer;
pub mod pool;
pub mod wire;
