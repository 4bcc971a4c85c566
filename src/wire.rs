//! vhost-user wire protocol: request codes, header framing, and payload
//! parsing.

use std::collections::VecDeque;
use std::os::fd::RawFd;

use bitflags::bitflags;

use crate::error::PayloadError;
use crate::memory::MAX_REGIONS;

pub const HEADER_SIZE: usize = 12;
pub const MAX_FDS_PER_MSG: usize = 8;

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct HeaderFlags: u32 {
        const VERSION_1 = 0x1;
        const REPLY_NEEDED = 0x4;
    }
}

bitflags! {
    /// GET_FEATURES / SET_FEATURES bitmask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VirtioFeatures: u64 {
        const LOG_ALL = 1 << 63;
        const PROTOCOL_FEATURES = 1 << 30;
    }
}

bitflags! {
    /// GET_PROTOCOL_FEATURES / SET_PROTOCOL_FEATURES bitmask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ProtocolFeatures: u64 {
        const LOG_SHMFD = 1 << 0;
    }
}

/// The 16 request codes this backend recognizes. Code 0
/// is reserved; anything >= 17 is rejected by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Request {
    GetFeatures = 1,
    SetFeatures = 2,
    SetOwner = 3,
    ResetOwner = 4,
    SetMemTable = 5,
    SetLogBase = 6,
    SetLogFd = 7,
    SetVringNum = 8,
    SetVringAddr = 9,
    SetVringBase = 10,
    GetVringBase = 11,
    SetVringKick = 12,
    SetVringCall = 13,
    SetVringErr = 14,
    GetProtocolFeatures = 15,
    SetProtocolFeatures = 16,
}

impl TryFrom<u32> for Request {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::GetFeatures,
            2 => Self::SetFeatures,
            3 => Self::SetOwner,
            4 => Self::ResetOwner,
            5 => Self::SetMemTable,
            6 => Self::SetLogBase,
            7 => Self::SetLogFd,
            8 => Self::SetVringNum,
            9 => Self::SetVringAddr,
            10 => Self::SetVringBase,
            11 => Self::GetVringBase,
            12 => Self::SetVringKick,
            13 => Self::SetVringCall,
            14 => Self::SetVringErr,
            15 => Self::GetProtocolFeatures,
            16 => Self::SetProtocolFeatures,
            other => return Err(other),
        })
    }
}

/// Helper trait converting a raw payload byte slice into a typed vhost-user
/// payload.
pub trait TryFromPayload: Sized {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError>;
}

impl TryFromPayload for u64 {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        let bytes: [u8; 8] = pkt
            .get(0..8)
            .ok_or(PayloadError::NotEnoughData(pkt.len(), 8))?
            .try_into()
            .map_err(|_| PayloadError::NotEnoughData(pkt.len(), 8))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// `state { index, num }` payload, used by SET_VRING_NUM, SET_VRING_BASE,
/// GET_VRING_BASE.
#[derive(Clone, Copy, Debug, Default)]
pub struct VRingState {
    pub index: u32,
    pub num: u32,
}

impl TryFromPayload for VRingState {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        if pkt.len() < 8 {
            return Err(PayloadError::NotEnoughData(pkt.len(), 8));
        }
        Ok(Self {
            index: u32::from_le_bytes(pkt[0..4].try_into().unwrap()),
            num: u32::from_le_bytes(pkt[4..8].try_into().unwrap()),
        })
    }
}

impl VRingState {
    pub fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.num.to_le_bytes());
        out
    }
}

/// `addr { index, flags, desc, used, avail, log }` payload for
/// SET_VRING_ADDR.
#[derive(Clone, Copy, Debug, Default)]
pub struct VRingAddr {
    pub index: u32,
    pub flags: u32,
    pub desc_user_addr: u64,
    pub used_user_addr: u64,
    pub avail_user_addr: u64,
    pub log_guest_addr: u64,
}

impl TryFromPayload for VRingAddr {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        if pkt.len() < 40 {
            return Err(PayloadError::NotEnoughData(pkt.len(), 40));
        }
        let u32_at = |o: usize| u32::from_le_bytes(pkt[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(pkt[o..o + 8].try_into().unwrap());
        Ok(Self {
            index: u32_at(0),
            flags: u32_at(4),
            desc_user_addr: u64_at(8),
            used_user_addr: u64_at(16),
            avail_user_addr: u64_at(24),
            log_guest_addr: u64_at(32),
        })
    }
}

/// One `regions[i]` entry of the SET_MEM_TABLE payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryRegionDesc {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub user_addr: u64,
    pub mmap_offset: u64,
}

/// Full SET_MEM_TABLE payload: `{nregions, padding, regions[..]}`.
#[derive(Clone, Debug, Default)]
pub struct MemoryTable {
    pub regions: Vec<MemoryRegionDesc>,
}

impl TryFromPayload for MemoryTable {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        if pkt.len() < 8 {
            return Err(PayloadError::NotEnoughData(pkt.len(), 8));
        }
        let nregions = u32::from_le_bytes(pkt[0..4].try_into().unwrap()) as usize;
        if nregions > MAX_REGIONS {
            return Err(PayloadError::NotEnoughData(nregions, MAX_REGIONS));
        }

        let need = 8 + nregions * 32;
        if pkt.len() < need {
            return Err(PayloadError::NotEnoughData(pkt.len(), need));
        }

        let mut regions = Vec::with_capacity(nregions);
        for i in 0..nregions {
            let base = 8 + i * 32;
            let u64_at = |o: usize| u64::from_le_bytes(pkt[base + o..base + o + 8].try_into().unwrap());
            regions.push(MemoryRegionDesc {
                guest_phys_addr: u64_at(0),
                memory_size: u64_at(8),
                user_addr: u64_at(16),
                mmap_offset: u64_at(24),
            });
        }

        Ok(Self { regions })
    }
}

/// A decoded control message: header fields plus the raw payload bytes and
/// any file descriptors that rode along in ancillary data.
pub struct Message {
    pub request: u32,
    pub flags: u32,
    payload: Vec<u8>,
    fds: VecDeque<RawFd>,
}

impl Message {
    /// Parses the 12-byte header. The payload (if `size > 0`) and any
    /// ancillary fds are attached afterwards via [`Message::set_payload`] /
    /// [`Message::set_fds`] once they have been read off the socket.
    pub fn parse_header(hdr: &[u8]) -> Result<Self, PayloadError> {
        if hdr.len() < HEADER_SIZE {
            return Err(PayloadError::NotEnoughData(hdr.len(), HEADER_SIZE));
        }

        Ok(Self {
            request: u32::from_le_bytes(hdr[0..4].try_into().unwrap()),
            flags: u32::from_le_bytes(hdr[4..8].try_into().unwrap()),
            payload: Vec::new(),
            fds: VecDeque::new(),
        })
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn set_fds(&mut self, fds: VecDeque<RawFd>) {
        self.fds = fds;
    }

    pub fn reply_needed(&self) -> bool {
        self.flags & HeaderFlags::REPLY_NEEDED.bits() != 0
    }

    pub fn payload<T: TryFromPayload>(&self) -> Result<T, PayloadError> {
        T::try_from_payload(&self.payload)
    }

    /// Pulls exactly one file descriptor out of the ancillary data.
    pub fn extract_fd(&mut self) -> Result<Option<RawFd>, PayloadError> {
        Ok(self.fds.pop_front())
    }

    /// Pulls every file descriptor out of the ancillary data, in order.
    pub fn extract_fds(&mut self) -> Vec<RawFd> {
        self.fds.drain(..).collect()
    }
}

/// Builds the 12-byte framing header for a reply or a back-end-initiated
/// message.
pub fn frame(request: u32, flags: HeaderFlags, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&request.to_le_bytes());
    out.extend_from_slice(&flags.bits().to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decodes the low byte / bit 8 encoding used by SET_VRING_KICK/CALL/ERR's
/// `u64` payload: bits 0-7 are the queue index, bit 8 signals "no fd".
pub fn decode_vring_fd_payload(value: u64) -> (usize, bool) {
    let index = (value & 0xff) as usize;
    let no_fd = value & 0x100 != 0;
    (index, no_fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_bitmask_has_log_all_and_protocol_features() {
        let bits = (VirtioFeatures::LOG_ALL | VirtioFeatures::PROTOCOL_FEATURES).bits();
        assert_eq!(bits, (1u64 << 63) | (1u64 << 30));
    }

    #[test]
    fn protocol_features_bitmask_has_log_shmfd() {
        assert_eq!(ProtocolFeatures::LOG_SHMFD.bits(), 1);
    }

    #[test]
    fn decode_vring_kick_payload() {
        assert_eq!(decode_vring_fd_payload(1), (1, false));
        assert_eq!(decode_vring_fd_payload(0x101), (1, true));
    }

    #[test]
    fn vring_state_round_trips() {
        let state = VRingState { index: 1, num: 42 };
        let bytes = state.to_bytes();
        let parsed = VRingState::try_from_payload(&bytes).unwrap();
        assert_eq!(parsed.index, 1);
        assert_eq!(parsed.num, 42);
    }

    #[test]
    fn memory_table_rejects_too_many_regions() {
        let mut pkt = vec![0u8; 8];
        pkt[0..4].copy_from_slice(&((MAX_REGIONS as u32) + 1).to_le_bytes());
        assert!(MemoryTable::try_from_payload(&pkt).is_err());
    }
}
