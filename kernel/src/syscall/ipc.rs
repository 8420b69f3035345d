//! IPC syscalls: CreatePipe and the Interlink family.

use alloc::string::String;
use alloc::sync::Arc;

use crate::buffer::{self, read_user_string, UserBuffer};
use crate::error::{SysError, SysResult};
use crate::interlink::{self, ConnectionHandle, ServerHandle, Side};
use crate::process::entity::{Entity, EntityRef, PipeEnds};

use super::abi::{CreatePipeHandleFlags, CreatePipeHandles};
use super::current_handle;

fn allocate_slot(handle: EntityRef, group: u8) -> SysResult<i64> {
    crate::process::with_current_process(|process| {
        process
            .userspace
            .as_mut()
            .map(|userspace| userspace.allocate_handle_slot(handle.clone(), group))
            .ok_or(SysError::NotSupported)
    })
    .ok_or(SysError::Failed)?
}

pub fn sys_create_pipe(out_handles_ptr: u64, raw_flags: u64) -> SysResult<i64> {
    let flags = CreatePipeHandleFlags::from_raw(raw_flags);
    let PipeEnds { reader, writer } =
        Entity::create_pipe(flags.read_blocking, flags.write_blocking);

    let read_handle = allocate_slot(reader, flags.read_group)?;
    let write_handle = allocate_slot(writer, flags.write_group)?;

    let mut out = UserBuffer::new(
        out_handles_ptr as usize,
        core::mem::size_of::<CreatePipeHandles>(),
    );
    buffer::write_object(
        &mut out,
        &CreatePipeHandles {
            read_handle,
            write_handle,
        },
        0,
    )?;
    Ok(0)
}

pub fn sys_interlink_advertise(addr_ptr: u64, addr_len: u64, group: u8) -> SysResult<i64> {
    let address = read_user_string(addr_ptr as usize, addr_len as usize)?;
    let server = interlink::advertise(address)?;
    allocate_slot(
        Arc::new(Entity::InterlinkServer(ServerHandle::new(server))),
        group,
    )
}

pub fn sys_interlink_connect(addr_ptr: u64, addr_len: u64, group: u8) -> SysResult<i64> {
    let address: String = read_user_string(addr_ptr as usize, addr_len as usize)?;
    let server = interlink::lookup(&address)?;
    let connection = server.connect();
    allocate_slot(
        Arc::new(Entity::InterlinkConnection(ConnectionHandle::new(
            connection,
            Side::Client,
        ))),
        group,
    )
}

pub fn sys_interlink_accept(server_slot: i64, group: u8, blocking: bool) -> SysResult<i64> {
    let handle = current_handle(server_slot)?;
    let Entity::InterlinkServer(server_handle) = &*handle else {
        return Err(SysError::BadHandle);
    };
    let connection = server_handle.server().accept(blocking)?;
    allocate_slot(
        Arc::new(Entity::InterlinkConnection(ConnectionHandle::new(
            connection,
            Side::Server,
        ))),
        group,
    )
}

pub fn sys_interlink_send(connection_slot: i64, data_ptr: u64, len: u64) -> SysResult<i64> {
    let handle = current_handle(connection_slot)?;
    let Entity::InterlinkConnection(connection) = &*handle else {
        return Err(SysError::BadHandle);
    };
    let user = UserBuffer::new(data_ptr as usize, len as usize);
    let sent = connection.send(&user, true)?;
    Ok(sent as i64)
}

pub fn sys_interlink_receive(connection_slot: i64, buf_ptr: u64, max_len: u64) -> SysResult<i64> {
    let handle = current_handle(connection_slot)?;
    let Entity::InterlinkConnection(connection) = &*handle else {
        return Err(SysError::BadHandle);
    };
    let mut user = UserBuffer::new(buf_ptr as usize, max_len as usize);
    let received = connection.receive(&mut user, true)?;
    Ok(received as i64)
}
