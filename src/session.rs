//! One accepted vhost-user connection: owns the memory map, ring table,
//! dirty log, and the loopback device, and dispatches every control message
//! to them. Recognizes the GET/SET_FEATURES through GET/SET_PROTOCOL_FEATURES
//! request family; QEMU-specific extensions outside that set (SET_STATUS,
//! ADD_MEM_REG, GET_CONFIG, ...) are not implemented.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::socket::{self, MsgFlags, UnixAddr};
use nix::unistd;

use crate::{
    device::LoopbackDevice,
    error::MessageError,
    log::{required_log_size, DirtyLog},
    memory::{MemoryMap, MemoryRegion},
    stats::Stats,
    vring::{QUEUE_RX, QUEUE_TX, RingTable},
    wire::{
        self, decode_vring_fd_payload, frame, HeaderFlags, MemoryTable, Message, ProtocolFeatures,
        Request, VRingAddr, VRingState, VirtioFeatures,
    },
};

/// A single vhost-user session: one accepted Unix connection, one set of
/// negotiated memory/rings, one device instance. Lives for the lifetime of
/// the connection; torn down wholesale when the front-end disconnects or a
/// message is malformed beyond recovery.
pub struct Session {
    stream: RawFd,
    memory: MemoryMap,
    rings: RingTable,
    log: Option<DirtyLog>,
    device: LoopbackDevice,
    stats: Stats,
    negotiated_features: u64,
}

impl Session {
    pub fn new(stream: RawFd, device: LoopbackDevice, stats: Stats) -> Self {
        Self {
            stream,
            memory: MemoryMap::new(),
            rings: RingTable::default(),
            log: None,
            device,
            stats,
            negotiated_features: 0,
        }
    }

    /// Reads one control message off the stream (header, then payload, then
    /// any ancillary fds) and dispatches it. Returns `Ok(false)` once the
    /// front-end has closed the connection.
    pub fn handle_readable(&mut self) -> Result<bool, MessageError> {
        let mut hdr_buf = [0u8; wire::HEADER_SIZE];
        let mut cmsgs = nix::cmsg_space!([RawFd; wire::MAX_FDS_PER_MSG]);
        let mut iovs = [IoSliceMut::new(&mut hdr_buf)];

        let rmsg = socket::recvmsg::<()>(
            self.stream,
            &mut iovs,
            Some(&mut cmsgs),
            MsgFlags::MSG_DONTWAIT,
        )
        .map_err(MessageError::Errno)?;

        if rmsg.bytes == 0 {
            return Ok(false);
        }
        if rmsg.bytes < wire::HEADER_SIZE {
            return Err(MessageError::HeaderMissing);
        }

        let fds: VecDeque<RawFd> = rmsg
            .cmsgs()
            .flat_map(|c| match c {
                socket::ControlMessageOwned::ScmRights(fds) => fds,
                _ => Vec::new(),
            })
            .collect();

        let mut msg = Message::parse_header(&hdr_buf)?;

        let size = u32::from_le_bytes(hdr_buf[8..12].try_into().unwrap());
        if size > 0 {
            let mut payload = vec![0u8; size as usize];
            socket::recvmsg::<UnixAddr>(
                self.stream,
                &mut [IoSliceMut::new(&mut payload)],
                None,
                MsgFlags::MSG_DONTWAIT,
            )
            .map_err(MessageError::Errno)?;
            msg.set_payload(payload);
        }
        msg.set_fds(fds);

        self.dispatch(msg)?;
        Ok(true)
    }

    fn dispatch(&mut self, mut msg: Message) -> Result<(), MessageError> {
        let request = match Request::try_from(msg.request) {
            Ok(r) => r,
            Err(code) => {
                tracing::warn!(code, "unknown vhost-user request, ignoring");
                return Ok(());
            }
        };

        tracing::trace!(?request, "dispatching vhost-user message");

        match request {
            Request::GetFeatures => {
                let bits =
                    (VirtioFeatures::LOG_ALL | VirtioFeatures::PROTOCOL_FEATURES).bits();
                self.reply(msg.request, &bits.to_le_bytes())?;
            }
            Request::SetFeatures => {
                self.negotiated_features = msg.payload()?;
                tracing::debug!(features = format!("0x{:016x}", self.negotiated_features), "set-features");
            }
            Request::SetOwner => {
                tracing::debug!("set-owner: session claimed");
            }
            Request::ResetOwner => {
                tracing::debug!("reset-owner: unmapping dirty log");
                self.log = None;
            }
            Request::SetMemTable => {
                let table: MemoryTable = msg.payload()?;
                let fds = msg.extract_fds();
                if table.regions.len() != fds.len() {
                    return Err(MessageError::InvalidMessage(
                        "set_mem_table: region / fd count mismatch",
                    ));
                }

                let mut map = MemoryMap::new();
                for (region, fd) in table.regions.iter().zip(fds) {
                    match MemoryRegion::map(
                        fd,
                        region.guest_phys_addr,
                        region.user_addr,
                        region.memory_size,
                        region.mmap_offset,
                    ) {
                        Ok(mapped) => {
                            if let Err(error) = map.push(mapped) {
                                tracing::warn!(?error, "dropping region, memory table full");
                            }
                        }
                        Err(error) => {
                            tracing::warn!(?error, addr = region.guest_phys_addr, "dropping unmappable region");
                        }
                    }
                    let _ = unistd::close(fd);
                }
                self.memory = map;
            }
            Request::SetLogBase => {
                let _base: u64 = msg.payload()?;
                let Some(fd) = msg.extract_fd()? else {
                    tracing::debug!("set-log-base: no descriptor, log disabled");
                    self.log = None;
                    if msg.reply_needed() {
                        self.reply(msg.request, &[])?;
                    }
                    return Ok(());
                };
                // The log's size is derived from the current memory map and
                // ring set, not from the request payload.
                let size = required_log_size(&self.memory, &self.rings);
                let log = DirtyLog::map(fd, size)?;
                let _ = unistd::close(fd);
                self.log = Some(log);
                // SET_LOG_BASE expects an empty-payload ack when REPLY_NEEDED
                // is set.
                if msg.reply_needed() {
                    self.reply(msg.request, &[])?;
                }
            }
            Request::SetLogFd => {
                let fd = msg
                    .extract_fd()?
                    .ok_or(MessageError::Payload(crate::error::PayloadError::NoFileDescriptorsFound))?;
                if let Some(log) = self.log.as_mut() {
                    log.set_notify_fd(fd);
                } else {
                    let _ = unistd::close(fd);
                }
            }
            Request::SetVringNum => {
                let state: VRingState = msg.payload()?;
                let queue = self
                    .rings
                    .get_mut(state.index as usize)
                    .ok_or(MessageError::QueueNotFound(state.index as usize))?;
                queue.num = state.num as u16;
            }
            Request::SetVringAddr => {
                if self.memory.is_empty() {
                    return Err(MessageError::Memory(crate::error::MemoryError::NoMappedMemory));
                }
                let addr: VRingAddr = msg.payload()?;
                let desc = self
                    .memory
                    .translate_user(addr.desc_user_addr)
                    .ok_or(MessageError::Memory(crate::error::MemoryError::NoTranslation(addr.desc_user_addr)))?;
                let avail = self
                    .memory
                    .translate_user(addr.avail_user_addr)
                    .ok_or(MessageError::Memory(crate::error::MemoryError::NoTranslation(addr.avail_user_addr)))?;
                let used = self
                    .memory
                    .translate_user(addr.used_user_addr)
                    .ok_or(MessageError::Memory(crate::error::MemoryError::NoTranslation(addr.used_user_addr)))?;

                let queue = self
                    .rings
                    .get_mut(addr.index as usize)
                    .ok_or(MessageError::QueueNotFound(addr.index as usize))?;
                queue.flags = addr.flags;
                queue.log_guest_addr = addr.log_guest_addr;
                // SAFETY: desc/avail/used were just translated from a live
                // mapped region.
                unsafe { queue.set_addresses(desc, avail, used) };
            }
            Request::SetVringBase => {
                let state: VRingState = msg.payload()?;
                let queue = self
                    .rings
                    .get_mut(state.index as usize)
                    .ok_or(MessageError::QueueNotFound(state.index as usize))?;
                queue.last_avail_idx = state.num as u16;
            }
            Request::GetVringBase => {
                let state: VRingState = msg.payload()?;
                let queue = self
                    .rings
                    .get(state.index as usize)
                    .ok_or(MessageError::QueueNotFound(state.index as usize))?;
                let resp = VRingState {
                    index: state.index,
                    num: queue.last_avail_idx as u32,
                };
                self.reply(msg.request, &resp.to_bytes())?;
            }
            Request::SetVringKick => {
                let raw: u64 = msg.payload()?;
                let (index, no_fd) = decode_vring_fd_payload(raw);
                let fd = if no_fd { None } else { msg.extract_fd()? };
                let queue = self
                    .rings
                    .get_mut(index)
                    .ok_or(MessageError::QueueNotFound(index))?;
                queue.kick_fd = fd;
            }
            Request::SetVringCall => {
                let raw: u64 = msg.payload()?;
                let (index, no_fd) = decode_vring_fd_payload(raw);
                let fd = if no_fd { None } else { msg.extract_fd()? };
                let queue = self
                    .rings
                    .get_mut(index)
                    .ok_or(MessageError::QueueNotFound(index))?;
                queue.call_fd = fd;
            }
            Request::SetVringErr => {
                let raw: u64 = msg.payload()?;
                let (index, no_fd) = decode_vring_fd_payload(raw);
                let fd = if no_fd { None } else { msg.extract_fd()? };
                let queue = self
                    .rings
                    .get_mut(index)
                    .ok_or(MessageError::QueueNotFound(index))?;
                queue.err_fd = fd;
            }
            Request::GetProtocolFeatures => {
                self.reply(msg.request, &ProtocolFeatures::LOG_SHMFD.bits().to_le_bytes())?;
            }
            Request::SetProtocolFeatures => {
                let _features: u64 = msg.payload()?;
            }
        }

        Ok(())
    }

    /// Drains any kicked virtqueue: pulls available transmit buffers through
    /// the loopback device and, if the device produced anything, scatters it
    /// back out on the receive ring.
    pub fn service_queues(&mut self) {
        let tx = self.rings.get_mut(QUEUE_TX);
        if let Some(tx) = tx {
            if tx.is_ready() {
                let device = &mut self.device;
                let stats = &self.stats;
                let outcome = crate::processor::process_tx(tx, &self.memory, self.log.as_ref(), |pkt| {
                    stats.record_tx(pkt.len());
                    device.enqueue(pkt);
                });
                if outcome.chains_consumed > 0 {
                    self.notify(QUEUE_TX);
                }
            }
        }

        let rx = self.rings.get_mut(QUEUE_RX);
        if let Some(rx) = rx {
            if rx.is_ready() && self.device.has_pending() {
                let device = &mut self.device;
                let stats = &self.stats;
                let outcome = crate::processor::process_rx(rx, &self.memory, self.log.as_ref(), || {
                    let pkt = device.dequeue();
                    if let Some(ref p) = pkt {
                        stats.record_rx(p.len());
                    }
                    pkt
                });
                if outcome.chains_consumed > 0 {
                    self.notify(QUEUE_RX);
                }
            }
        }

        if let Some(log) = &self.log {
            log.notify();
        }
    }

    /// Current kick eventfd for queue `index`, if the front-end has set one
    /// (used by the acceptor's reactor to keep its registrations in sync).
    pub fn kick_fd(&self, index: usize) -> Option<RawFd> {
        self.rings.get(index).and_then(|q| q.kick_fd)
    }

    fn notify(&self, index: usize) {
        let Some(queue) = self.rings.get(index) else {
            return;
        };
        let Some(fd) = queue.call_fd else { return };
        let value = 1u64.to_le_bytes();
        // SAFETY: fd is a borrowed eventfd owned by the front-end for the
        // lifetime of this session.
        if let Err(error) = unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &value) {
            tracing::warn!(?error, index, "failed to signal call eventfd");
        }
    }

    /// Test-only seam for exercising the acceptor's kick-fd registration
    /// bookkeeping without going through the full SET_VRING_KICK dispatch.
    #[cfg(test)]
    pub(crate) fn set_kick_fd_for_test(&mut self, index: usize, fd: Option<RawFd>) {
        if let Some(queue) = self.rings.get_mut(index) {
            queue.kick_fd = fd;
        }
    }

    fn reply(&self, request: u32, payload: &[u8]) -> Result<(), MessageError> {
        let buf = frame(request, HeaderFlags::VERSION_1 | HeaderFlags::REPLY_NEEDED, payload);
        let iov = [IoSlice::new(&buf)];
        socket::sendmsg::<()>(self.stream, &iov, &[], MsgFlags::empty(), None)
            .map_err(MessageError::Errno)?;
        Ok(())
    }
}

impl AsRawFd for Session {
    fn as_raw_fd(&self) -> RawFd {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        Session::new(-1, LoopbackDevice::new(None), Stats::default())
    }

    fn msg_of(request: Request, payload: Vec<u8>) -> Message {
        let hdr_request = request as u32;
        let mut hdr = [0u8; wire::HEADER_SIZE];
        hdr[0..4].copy_from_slice(&hdr_request.to_le_bytes());
        let mut msg = Message::parse_header(&hdr).unwrap();
        msg.set_payload(payload);
        msg.set_fds(VecDeque::new());
        msg
    }

    fn region_bytes(guest_phys_addr: u64, memory_size: u64, user_addr: u64, mmap_offset: u64) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0..8].copy_from_slice(&guest_phys_addr.to_le_bytes());
        out[8..16].copy_from_slice(&memory_size.to_le_bytes());
        out[16..24].copy_from_slice(&user_addr.to_le_bytes());
        out[24..32].copy_from_slice(&mmap_offset.to_le_bytes());
        out
    }

    #[test]
    fn set_mem_table_drops_unmappable_region_but_keeps_the_rest() {
        let mut session = test_session();

        let good = tempfile::tempfile().unwrap();
        good.set_len(0x1000).unwrap();
        let bad = tempfile::tempfile().unwrap();
        bad.set_len(0x1000).unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        // zero-length region: rejected by MemoryRegion::map, must not be fatal.
        payload.extend_from_slice(&region_bytes(0x1000, 0, 0x7f00_0000_0000, 0));
        payload.extend_from_slice(&region_bytes(0x2000, 0x1000, 0x7f00_0001_0000, 0));

        let mut msg = msg_of(Request::SetMemTable, payload);
        msg.set_fds(VecDeque::from(vec![bad.as_raw_fd(), good.as_raw_fd()]));

        session.dispatch(msg).unwrap();

        assert!(session.memory.translate_guest(0x2000).is_some());
        assert!(session.memory.translate_guest(0x1000).is_none());
    }

    #[test]
    fn set_log_base_with_no_descriptor_disables_log_without_error() {
        let mut session = test_session();
        session.log = None;

        let msg = msg_of(Request::SetLogBase, 0u64.to_le_bytes().to_vec());
        assert!(session.dispatch(msg).is_ok());
        assert!(session.log.is_none());
    }

    #[test]
    fn reset_owner_only_clears_the_log() {
        let mut session = test_session();

        let file = tempfile::tempfile().unwrap();
        file.set_len(0x1000).unwrap();
        let region = MemoryRegion::map(file.as_raw_fd(), 0x1000, 0x7f00_0000_0000, 0x1000, 0).unwrap();
        session.memory.push(region).unwrap();
        session.rings.get_mut(QUEUE_RX).unwrap().num = 16;

        let log_file = tempfile::tempfile().unwrap();
        log_file.set_len(8).unwrap();
        session.log = Some(DirtyLog::map(log_file.as_raw_fd(), 8).unwrap());

        let msg = msg_of(Request::ResetOwner, Vec::new());
        session.dispatch(msg).unwrap();

        assert!(session.log.is_none());
        assert!(session.memory.translate_guest(0x1000).is_some());
        assert_eq!(session.rings.get(QUEUE_RX).unwrap().num, 16);
    }
}
