//! Encrypted UDP action dispatch between orchestration instances on different devices, plus a
//!  background prober that ranks a peer's addresses by round-trip time.
//!
//! ## Protocol
//!
//! Every request is a single UDP datagram containing a JSON envelope:
//!
//! ```ascii
//! {"Action": "<action id>", "Data": "<base64 of the encrypted message>"}
//! ```
//!
//! The server answers with exactly one datagram. For application-level actions, the reply is the
//!  encrypted response message itself (no envelope), for liveness actions it is a short plain
//!  text acknowledgement. Datagrams with an unknown action are dropped without reply.
//!
//! There is no retry, no ordering and no multiplexing: each client call uses its own short-lived
//!  socket and waits for one reply (or a timeout). Replies that do not fit the client's receive
//!  buffer are truncated silently, which surfaces as a decryption failure on the client side.
//!
//! ## Encryption
//!
//! Messages are JSON objects, serialized and then AES-256-GCM encrypted. The resulting payload
//!  structure is:
//!
//! ```ascii
//!  0: ciphertext (same length as the serialized message)
//!  *: tag (16 bytes)
//!  *: nonce (12 bytes)
//! ```
//!
//! Keys are provisioned from outside this crate; until a key is set, clients refuse to send and
//!  servers answer application requests with a `{"Code": 404}` marker.

pub mod cipher;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod netdb;
pub mod orchestration;
pub mod prober;
pub mod router;
pub mod test_util;
pub mod transport;
