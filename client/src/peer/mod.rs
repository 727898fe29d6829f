//! Peer wire protocol: framing, the bitfield, and the download-side session.

mod bitfield;
mod message;
mod session;

pub use bitfield::Bitfield;
pub use message::{
    BlockInfo, HANDSHAKE_LEN, Handshake, MAX_FRAME_LEN, Message, MessageId, PROTOCOL,
    parse_frame, read_handshake, read_message, write_frame, write_message,
};
pub use session::{ChokeState, InterestState, PeerSession};

use crate::error::PeerError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Client prefix in Azureus style, followed by 12 random bytes.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-TD0001-";

pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::rng().fill(&mut id[8..]);
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    id
}

/// Runs `fut` under a deadline, mapping expiry to [`PeerError::Timeout`].
pub(crate) async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T, PeerError>
where
    F: Future<Output = Result<T, PeerError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| PeerError::Timeout)?
}
