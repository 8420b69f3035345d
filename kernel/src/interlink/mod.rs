//! Interlink: capability-passing local IPC.
//!
//! A server advertises a string address; clients connect and exchange
//! ordered messages over per-direction byte rings. A message is a header
//! plus payload items, where an item carries inline bytes, an entity
//! handle, or a shareable memory region. Items of one message are
//! delivered contiguously; the `is_final` bit closes a message.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::buffer::{self, BufferSubset, Pod, TransactionalBuffer};
use crate::error::{SysError, SysResult};
use crate::mm::{BackingRegion, MemoryOperation};
use crate::process::WaitQueue;
use crate::utils::ring_buffer::RingBuffer;

/// Byte capacity of each direction's ring.
pub const DEFAULT_RINGBUFFER_SIZE: usize = 1024;

/// On-wire message header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageHeader {
    pub total_size: u32,
    pub payload_item_count: u32,
    pub message_id: u32,
}

// SAFETY: repr(C) plain integers.
unsafe impl Pod for MessageHeader {}

pub const PAYLOAD_KIND_DATA: u32 = 0;
pub const PAYLOAD_KIND_FD: u32 = 1;
pub const PAYLOAD_KIND_MEMORY: u32 = 2;

/// On-wire payload item: a tagged union over
/// `DATA(offset, len) | FD(fd) | MEMORY(ptr, size, can_read, can_write)`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadItem {
    pub kind: u32,
    reserved: u32,
    word0: u64,
    word1: u64,
    word2: u64,
}

// SAFETY: repr(C) plain integers.
unsafe impl Pod for PayloadItem {}

impl PayloadItem {
    pub fn data(offset: u64, len: u64) -> Self {
        Self {
            kind: PAYLOAD_KIND_DATA,
            reserved: 0,
            word0: offset,
            word1: len,
            word2: 0,
        }
    }

    pub fn fd(fd: i64) -> Self {
        Self {
            kind: PAYLOAD_KIND_FD,
            reserved: 0,
            word0: fd as u64,
            word1: 0,
            word2: 0,
        }
    }

    pub fn memory(ptr: u64, size: u64, can_read: bool, can_write: bool) -> Self {
        Self {
            kind: PAYLOAD_KIND_MEMORY,
            reserved: 0,
            word0: ptr,
            word1: size,
            word2: can_read as u64 | (can_write as u64) << 8,
        }
    }

    pub fn data_fields(&self) -> (u64, u64) {
        (self.word0, self.word1)
    }

    pub fn fd_field(&self) -> i64 {
        self.word0 as i64
    }

    pub fn memory_fields(&self) -> (u64, u64, bool, bool) {
        (
            self.word0,
            self.word1,
            self.word2 & 0xFF != 0,
            (self.word2 >> 8) & 0xFF != 0,
        )
    }
}

/// One queued item, decoded and capability-resolved on the send side.
enum QueuedItem {
    Data { size: usize },
    Entity(crate::process::entity::EntityRef),
    Memory {
        region: Arc<BackingRegion>,
        permissions: MemoryOperation,
    },
}

struct QueuedMessage {
    item: QueuedItem,
    is_final: bool,
    message_id: u32,
}

/// One direction of a connection: a byte ring plus its item queue.
struct DirectionState {
    ring: RingBuffer,
    queue: VecDeque<QueuedMessage>,
}

impl DirectionState {
    fn new() -> Self {
        Self {
            ring: RingBuffer::new(DEFAULT_RINGBUFFER_SIZE),
            queue: VecDeque::new(),
        }
    }

    /// Bytes currently held for queued DATA items (consistency checks).
    fn queued_data_bytes(&self) -> usize {
        self.queue
            .iter()
            .map(|m| match m.item {
                QueuedItem::Data { size } => size,
                _ => 0,
            })
            .sum()
    }
}

/// Which side of a connection a handle speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

pub struct Connection {
    /// Data flowing server → client.
    to_client: Mutex<DirectionState>,
    /// Data flowing client → server.
    to_server: Mutex<DirectionState>,
    receive_waiters: WaitQueue,
}

impl Connection {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            to_client: Mutex::new(DirectionState::new()),
            to_server: Mutex::new(DirectionState::new()),
            receive_waiters: WaitQueue::new(),
        })
    }

    fn direction(&self, side: Side) -> &Mutex<DirectionState> {
        // A side receives from its own queue and sends to the peer's.
        match side {
            Side::Client => &self.to_client,
            Side::Server => &self.to_server,
        }
    }

    /// Send a framed message from `side`; returns the data bytes copied.
    pub fn send(&self, side: Side, buffer: &dyn TransactionalBuffer, blocking: bool) -> SysResult<usize> {
        let target = match side {
            Side::Client => &self.to_server,
            Side::Server => &self.to_client,
        };

        let header: MessageHeader = buffer::read_object(buffer, 0)?;
        let header_bytes = core::mem::size_of::<MessageHeader>();
        let item_bytes = core::mem::size_of::<PayloadItem>();
        if header.total_size as usize > buffer.size() {
            return Err(SysError::InvalidArgument);
        }
        if header_bytes + header.payload_item_count as usize * item_bytes > buffer.size() {
            return Err(SysError::InvalidArgument);
        }

        // Validate every item before queueing anything.
        let mut total_data_size = 0usize;
        for index in 0..header.payload_item_count as usize {
            let item: PayloadItem =
                buffer::read_object(buffer, header_bytes + index * item_bytes)?;
            if item.kind == PAYLOAD_KIND_DATA {
                let (offset, len) = item.data_fields();
                if offset as usize >= buffer.size()
                    || offset as usize + len as usize > buffer.size()
                {
                    return Err(SysError::InvalidArgument);
                }
                total_data_size += len as usize;
            }
        }

        {
            let state = target.lock();
            if state.ring.capacity() <= total_data_size {
                return Err(SysError::Overflow);
            }
            if state.ring.free_bytes() < total_data_size && !blocking {
                return Err(SysError::TryAgain);
            }
        }

        for index in 0..header.payload_item_count as usize {
            let item: PayloadItem =
                buffer::read_object(buffer, header_bytes + index * item_bytes)?;
            let is_final = index + 1 == header.payload_item_count as usize;
            let queued = match item.kind {
                PAYLOAD_KIND_DATA => {
                    let (offset, len) = item.data_fields();
                    loop {
                        let result = {
                            let mut state = target.lock();
                            let window = ReadOnlyWindow {
                                inner: buffer,
                                offset: offset as usize,
                                length: len as usize,
                            };
                            state.ring.write_from(&window, false)
                        };
                        match result {
                            Ok(_) => break,
                            Err(SysError::TryAgain) if blocking => {
                                self.receive_waiters.park_current()
                            }
                            Err(error) => return Err(error),
                        }
                    }
                    QueuedItem::Data { size: len as usize }
                }
                PAYLOAD_KIND_FD => {
                    let handle = crate::process::with_current_process(|process| {
                        process
                            .userspace
                            .as_ref()
                            .ok_or(SysError::BadHandle)
                            .and_then(|u| u.get_handle(item.fd_field()))
                    })
                    .ok_or(SysError::Failed)??;
                    QueuedItem::Entity(handle)
                }
                PAYLOAD_KIND_MEMORY => {
                    let (ptr, size, can_read, can_write) = item.memory_fields();
                    let mut permissions = MemoryOperation::empty();
                    if can_read {
                        permissions |= MemoryOperation::READ;
                    }
                    if can_write {
                        permissions |= MemoryOperation::WRITE;
                    }
                    let region = crate::process::with_current_space_manager(|sm| {
                        if !sm.check_region(ptr as usize, size as usize, permissions) {
                            return Err(SysError::NotPermitted);
                        }
                        sm.region_containing(ptr as usize, size as usize)
                            .map(|r| r.backing.clone())
                            .ok_or(SysError::NotPermitted)
                    })
                    .ok_or(SysError::Failed)??;
                    QueuedItem::Memory {
                        region,
                        permissions,
                    }
                }
                _ => return Err(SysError::InvalidArgument),
            };
            target.lock().queue.push_back(QueuedMessage {
                item: queued,
                is_final,
                message_id: header.message_id,
            });
        }
        self.receive_waiters.wake_all();
        Ok(total_data_size)
    }

    /// Receive the next whole message into `buffer`.
    pub fn receive(
        &self,
        side: Side,
        buffer: &mut dyn TransactionalBuffer,
        blocking: bool,
    ) -> SysResult<usize> {
        let source = self.direction(side);
        loop {
            {
                let state = source.lock();
                if !state.queue.is_empty() {
                    break;
                }
            }
            if !blocking {
                return Err(SysError::TryAgain);
            }
            self.receive_waiters.park_current();
        }

        let mut state = source.lock();

        // Size up the message: items until (and including) the final one.
        let mut payload_items = 0usize;
        let mut total_data_size = 0usize;
        let mut message_id = 0;
        for message in state.queue.iter() {
            payload_items += 1;
            if let QueuedItem::Data { size } = message.item {
                total_data_size += size;
            }
            message_id = message.message_id;
            if message.is_final {
                break;
            }
        }

        let header_bytes = core::mem::size_of::<MessageHeader>();
        let item_bytes = core::mem::size_of::<PayloadItem>();
        let required = header_bytes + payload_items * item_bytes + total_data_size;
        if buffer.size() < required {
            return Err(SysError::Overflow);
        }

        buffer::write_object(
            buffer,
            &MessageHeader {
                total_size: required as u32,
                payload_item_count: payload_items as u32,
                message_id,
            },
            0,
        )?;

        let mut data_offset = header_bytes + payload_items * item_bytes;
        for index in 0..payload_items {
            let item_offset = header_bytes + index * item_bytes;
            let message = state.queue.pop_front().expect("sized above");
            let wire_item = match message.item {
                QueuedItem::Data { size } => {
                    let mut window = BufferSubset::new(buffer, data_offset, size);
                    state.ring.read_to(&mut window, false)?;
                    let item = PayloadItem::data(data_offset as u64, size as u64);
                    data_offset += size;
                    item
                }
                QueuedItem::Entity(handle) => {
                    let slot = crate::process::with_current_process(|process| {
                        process
                            .userspace
                            .as_mut()
                            .map(|u| u.allocate_handle_slot(handle.clone(), 0))
                            .ok_or(SysError::BadHandle)
                    })
                    .ok_or(SysError::Failed)??;
                    PayloadItem::fd(slot)
                }
                QueuedItem::Memory {
                    region,
                    permissions,
                } => {
                    let placed = crate::process::with_current_space_manager(|sm| {
                        sm.place_region(
                            None,
                            permissions,
                            String::from("interlinked"),
                            region.clone(),
                        )
                    })
                    .ok_or(SysError::Failed)??;
                    PayloadItem::memory(
                        placed.start.get() as u64,
                        placed.size as u64,
                        permissions.contains(MemoryOperation::READ),
                        permissions.contains(MemoryOperation::WRITE),
                    )
                }
            };
            buffer::write_object(buffer, &wire_item, item_offset)?;
        }
        // Senders parked on a full ring can make progress now.
        self.receive_waiters.wake_all();
        Ok(data_offset)
    }

    /// Data bytes held per direction (invariant checks and tests).
    pub fn held_bytes(&self) -> (usize, usize) {
        let to_client = self.to_client.lock();
        let to_server = self.to_server.lock();
        debug_assert_eq!(to_client.queued_data_bytes(), to_client.ring.pending_bytes());
        debug_assert_eq!(to_server.queued_data_bytes(), to_server.ring.pending_bytes());
        (to_client.ring.pending_bytes(), to_server.ring.pending_bytes())
    }
}

/// A read-only window used to feed ring writes from a shared buffer.
struct ReadOnlyWindow<'a> {
    inner: &'a dyn TransactionalBuffer,
    offset: usize,
    length: usize,
}

impl TransactionalBuffer for ReadOnlyWindow<'_> {
    fn size(&self) -> usize {
        self.length
    }

    fn write_from(&mut self, _src: &[u8], _offset: usize) -> SysResult<usize> {
        Err(SysError::NotSupported)
    }

    fn read_to(&self, dst: &mut [u8], offset: usize) -> SysResult<usize> {
        if offset + dst.len() > self.length {
            return Err(SysError::BadAddress);
        }
        self.inner.read_to(dst, self.offset + offset)
    }
}

pub struct Server {
    address: String,
    pending: Mutex<VecDeque<Arc<Connection>>>,
    accept_waiters: WaitQueue,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("address", &self.address).finish()
    }
}

static SERVERS: Mutex<BTreeMap<String, Arc<Server>>> = Mutex::new(BTreeMap::new());

impl Server {
    /// Queue a fresh connection for the server to accept.
    pub fn connect(self: &Arc<Self>) -> Arc<Connection> {
        let connection = Connection::new();
        self.pending.lock().push_back(connection.clone());
        self.accept_waiters.wake_all();
        connection
    }

    /// Pop the oldest pending connection.
    pub fn accept(&self, blocking: bool) -> SysResult<Arc<Connection>> {
        loop {
            if let Some(connection) = self.pending.lock().pop_front() {
                return Ok(connection);
            }
            if !blocking {
                return Err(SysError::TryAgain);
            }
            self.accept_waiters.park_current();
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Create and register a server; `AddressInUse` when taken.
pub fn advertise(address: String) -> SysResult<Arc<Server>> {
    let mut servers = SERVERS.lock();
    if servers.contains_key(&address) {
        return Err(SysError::AddressInUse);
    }
    let server = Arc::new(Server {
        address: address.clone(),
        pending: Mutex::new(VecDeque::new()),
        accept_waiters: WaitQueue::new(),
    });
    servers.insert(address, server.clone());
    Ok(server)
}

/// Find a live server by address.
pub fn lookup(address: &str) -> SysResult<Arc<Server>> {
    SERVERS
        .lock()
        .get(address)
        .cloned()
        .ok_or(SysError::NoEntry)
}

/// The server-side entity handle; dropping it de-advertises the address.
pub struct ServerHandle {
    server: Arc<Server>,
}

impl ServerHandle {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        SERVERS.lock().remove(&self.server.address);
    }
}

/// A connection endpoint held by one side.
pub struct ConnectionHandle {
    connection: Arc<Connection>,
    side: Side,
}

impl ConnectionHandle {
    pub fn new(connection: Arc<Connection>, side: Side) -> Self {
        Self { connection, side }
    }

    pub fn send(&self, buffer: &dyn TransactionalBuffer, blocking: bool) -> SysResult<usize> {
        self.connection.send(self.side, buffer, blocking)
    }

    pub fn receive(
        &self,
        buffer: &mut dyn TransactionalBuffer,
        blocking: bool,
    ) -> SysResult<usize> {
        self.connection.receive(self.side, buffer, blocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::KernelBuffer;

    const HEADER: usize = core::mem::size_of::<MessageHeader>();
    const ITEM: usize = core::mem::size_of::<PayloadItem>();

    fn unique(name: &str) -> String {
        // The server map is process-wide; each test uses its own address.
        String::from(name)
    }

    fn data_message(payload: &[u8], message_id: u32) -> alloc::vec::Vec<u8> {
        let mut raw = alloc::vec![0u8; HEADER + ITEM + payload.len()];
        let total = raw.len();
        {
            let mut buffer = KernelBuffer::new(&mut raw);
            buffer::write_object(
                &mut buffer,
                &MessageHeader {
                    total_size: total as u32,
                    payload_item_count: 1,
                    message_id,
                },
                0,
            )
            .unwrap();
            buffer::write_object(
                &mut buffer,
                &PayloadItem::data((HEADER + ITEM) as u64, payload.len() as u64),
                HEADER,
            )
            .unwrap();
            buffer.write_from(payload, HEADER + ITEM).unwrap();
        }
        raw
    }

    #[test]
    fn wire_layout_is_stable() {
        assert_eq!(HEADER, 12);
        assert_eq!(ITEM, 32);
        let item = PayloadItem::memory(0x1000, 0x2000, true, false);
        let (ptr, size, r, w) = item.memory_fields();
        assert_eq!((ptr, size, r, w), (0x1000, 0x2000, true, false));
        assert_eq!(PayloadItem::fd(7).fd_field(), 7);
    }

    #[test]
    fn advertise_conflicts_and_lookup() {
        let address = unique("srv");
        let server = advertise(address.clone()).unwrap();
        assert_eq!(
            advertise(address.clone()).unwrap_err(),
            SysError::AddressInUse
        );
        assert!(lookup(&address).is_ok());

        // Dropping the handle de-advertises.
        drop(ServerHandle::new(server));
        assert_eq!(lookup(&address).unwrap_err(), SysError::NoEntry);
    }

    #[test]
    fn accept_order_is_fifo() {
        let server = advertise(unique("fifo")).unwrap();
        let first = server.connect();
        let second = server.connect();
        assert!(Arc::ptr_eq(&server.accept(false).unwrap(), &first));
        assert!(Arc::ptr_eq(&server.accept(false).unwrap(), &second));
        assert_eq!(server.accept(false).unwrap_err(), SysError::TryAgain);
    }

    #[test]
    fn data_round_trip_client_to_server() {
        let server = advertise(unique("echo")).unwrap();
        let connection = server.connect();
        let accepted = server.accept(false).unwrap();
        assert!(Arc::ptr_eq(&connection, &accepted));

        let client = ConnectionHandle::new(connection.clone(), Side::Client);
        let server_end = ConnectionHandle::new(accepted, Side::Server);

        let mut message = data_message(b"hello interlink", 42);
        let buffer = KernelBuffer::new(&mut message);
        assert_eq!(client.send(&buffer, false).unwrap(), 15);

        // Ring accounting matches queued items.
        assert_eq!(connection.held_bytes(), (0, 15));

        let mut receive_raw = alloc::vec![0u8; 128];
        let received_len = {
            let mut buffer = KernelBuffer::new(&mut receive_raw);
            server_end.receive(&mut buffer, false).unwrap()
        };
        assert_eq!(received_len, HEADER + ITEM + 15);

        let buffer = KernelBuffer::new(&mut receive_raw);
        let header: MessageHeader = buffer::read_object(&buffer, 0).unwrap();
        assert_eq!(header.message_id, 42);
        assert_eq!(header.payload_item_count, 1);
        let item: PayloadItem = buffer::read_object(&buffer, HEADER).unwrap();
        assert_eq!(item.kind, PAYLOAD_KIND_DATA);
        let (offset, len) = item.data_fields();
        assert_eq!(len, 15);
        let mut payload = alloc::vec![0u8; 15];
        buffer.read_to(&mut payload, offset as usize).unwrap();
        assert_eq!(&payload, b"hello interlink");
        assert_eq!(connection.held_bytes(), (0, 0));
    }

    #[test]
    fn receive_demands_adequate_buffer() {
        let server = advertise(unique("overflow")).unwrap();
        let connection = server.connect();
        let client = ConnectionHandle::new(connection.clone(), Side::Client);
        let server_end = ConnectionHandle::new(connection, Side::Server);

        let mut message = data_message(&[0xAB; 100], 1);
        let buffer = KernelBuffer::new(&mut message);
        client.send(&buffer, false).unwrap();

        let mut small = alloc::vec![0u8; HEADER + ITEM + 50];
        let mut buffer = KernelBuffer::new(&mut small);
        assert_eq!(
            server_end.receive(&mut buffer, false),
            Err(SysError::Overflow)
        );
        // The message is still queued and deliverable.
        let mut adequate = alloc::vec![0u8; HEADER + ITEM + 100];
        let mut buffer = KernelBuffer::new(&mut adequate);
        assert!(server_end.receive(&mut buffer, false).is_ok());
    }

    #[test]
    fn messages_arrive_in_order_and_whole() {
        let server = advertise(unique("order")).unwrap();
        let connection = server.connect();
        let client = ConnectionHandle::new(connection.clone(), Side::Client);
        let server_end = ConnectionHandle::new(connection, Side::Server);

        for (id, payload) in [(1u32, b"first".as_slice()), (2, b"second".as_slice())] {
            let mut message = data_message(payload, id);
            let buffer = KernelBuffer::new(&mut message);
            client.send(&buffer, false).unwrap();
        }

        for (id, payload) in [(1u32, b"first".as_slice()), (2, b"second".as_slice())] {
            let mut raw = alloc::vec![0u8; 128];
            let mut buffer = KernelBuffer::new(&mut raw);
            server_end.receive(&mut buffer, false).unwrap();
            let buffer = buffer;
            let header: MessageHeader = buffer::read_object(&buffer, 0).unwrap();
            assert_eq!(header.message_id, id);
            let item: PayloadItem = buffer::read_object(&buffer, HEADER).unwrap();
            let (offset, len) = item.data_fields();
            let mut bytes = alloc::vec![0u8; len as usize];
            buffer.read_to(&mut bytes, offset as usize).unwrap();
            assert_eq!(bytes, payload);
        }

        // Nothing further queued.
        let mut raw = alloc::vec![0u8; 64];
        let mut buffer = KernelBuffer::new(&mut raw);
        assert_eq!(
            server_end.receive(&mut buffer, false),
            Err(SysError::TryAgain)
        );
    }

    #[test]
    fn oversized_payload_reports_overflow() {
        let server = advertise(unique("big")).unwrap();
        let connection = server.connect();
        let client = ConnectionHandle::new(connection, Side::Client);

        let big = alloc::vec![0u8; DEFAULT_RINGBUFFER_SIZE];
        let mut message = data_message(&big, 9);
        let buffer = KernelBuffer::new(&mut message);
        assert_eq!(client.send(&buffer, false), Err(SysError::Overflow));
    }
}
