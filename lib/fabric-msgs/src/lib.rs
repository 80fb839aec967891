// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The state broadcast exchanged between fabric nodes during bring-up.
//!
//! Every node sends the same fixed-layout datagram: the coordinator to issue
//! a command, followers to report the result of one. The format carries no
//! version field; an incompatible change must change [`SIGNATURE`] so that
//! mismatched firmware images ignore each other instead of misreading.

#![cfg_attr(not(test), no_std)]

pub use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

pub use hubpack::error::Error as HubpackError;

/// First field of every state broadcast.
pub const SIGNATURE: u32 = 0x4e43_5342;

/// Destination port for state broadcasts.
pub const SYNC_UDP_PORT: u16 = 4714;

/// Protocol states.
///
/// The order of these cases is critical! hubpack encodes a unit variant as
/// its zero-based index in a single byte, so the declaration order *is* the
/// wire value. New states go at the end. A unit test pins the values.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, SerializedSize,
)]
pub enum SyncState {
    // Commands, issued by the coordinator.
    Startup,
    ResetFabric,
    TrainPhys,
    SetupRouting,
    LoadFabric,
    CheckFabric,
    Continue,
    WarmReset,

    // Responses, reported by every other node.
    RspAlive,
    RspResetOk,
    RspPhyTrained,
    RspPhyNotTrained,
    RspRoutingOk,
    RspFabricReady,
    RspFabricNotReady,
    RspFabricOk,
    RspFabricNotOk,
    RspContinuing,
}

impl SyncState {
    pub const fn is_command(self) -> bool {
        matches!(
            self,
            SyncState::Startup
                | SyncState::ResetFabric
                | SyncState::TrainPhys
                | SyncState::SetupRouting
                | SyncState::LoadFabric
                | SyncState::CheckFabric
                | SyncState::Continue
                | SyncState::WarmReset
        )
    }

    /// The response every node must report before the coordinator may move
    /// past this command. `WarmReset` is never acknowledged, and responses
    /// have no expected response.
    pub const fn expected_response(self) -> Option<SyncState> {
        match self {
            SyncState::Startup => Some(SyncState::RspAlive),
            SyncState::ResetFabric => Some(SyncState::RspResetOk),
            SyncState::TrainPhys => Some(SyncState::RspPhyTrained),
            SyncState::SetupRouting => Some(SyncState::RspRoutingOk),
            SyncState::LoadFabric => Some(SyncState::RspFabricReady),
            SyncState::CheckFabric => Some(SyncState::RspFabricOk),
            SyncState::Continue => Some(SyncState::RspContinuing),
            _ => None,
        }
    }

    /// Responses that send the fabric back through a link reset.
    pub const fn requests_retry(self) -> bool {
        matches!(
            self,
            SyncState::RspPhyNotTrained | SyncState::RspFabricNotReady
        )
    }

    /// Responses that can only be answered with a platform reset.
    pub const fn requests_warm_reset(self) -> bool {
        matches!(self, SyncState::RspFabricNotOk)
    }
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, SerializedSize,
)]
pub struct StateBcast {
    pub signature: u32,
    pub state: SyncState,
    /// Sender's station address.
    pub mac: [u8; 6],
    /// Sender's fabric coordinate.
    pub sci: u16,
    /// Transaction id of the command this message issues or answers.
    pub tid: u32,
}

// Ensure our serialized size doesn't change unexpectedly: if you land here
// because compilation has failed, consider whether you need to change
// `SIGNATURE`!
//
// Current size is 17 bytes:
// signature (4)
// state (1)
// mac (6)
// sci (2)
// tid (4)
const_assert_eq!(StateBcast::MAX_SIZE, 17);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgError {
    /// The datagram is not a state broadcast (or is from an incompatible
    /// image).
    BadSignature(u32),
    /// A state broadcast that fails to decode.
    Malformed,
    /// The output buffer is too small.
    Overrun,
}

impl From<HubpackError> for MsgError {
    fn from(e: HubpackError) -> Self {
        match e {
            HubpackError::Overrun => MsgError::Overrun,
            _ => MsgError::Malformed,
        }
    }
}

impl StateBcast {
    pub const fn new(state: SyncState, mac: [u8; 6], sci: u16, tid: u32) -> Self {
        Self {
            signature: SIGNATURE,
            state,
            mac,
            sci,
            tid,
        }
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, MsgError> {
        Ok(hubpack::serialize(out, self)?)
    }

    /// Decodes a received datagram. Trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, MsgError> {
        // Check the signature by hand first so that foreign traffic on the
        // port is reported as such rather than as a malformed message.
        let sig = data
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(MsgError::Malformed)?;
        if sig != SIGNATURE {
            return Err(MsgError::BadSignature(sig));
        }
        let (msg, _rest) = hubpack::deserialize::<StateBcast>(data)
            .map_err(|_| MsgError::Malformed)?;
        Ok(msg)
    }
}
