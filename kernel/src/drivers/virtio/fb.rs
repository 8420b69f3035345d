//! Virtio GPU framebuffer driver.
//!
//! Brings up a single 2D scanout backed by kernel-allocated guest pages:
//! create resource, attach backing, set scanout. Userspace obtains the
//! display info and a mapping of the framebuffer through `CommandDevice`
//! messages and asks for rectangles to be flushed to the host.

use alloc::sync::Arc;

use alloc::boxed::Box;

use spin::Mutex;

use crate::buffer::{self, Pod, TransactionalBuffer};
use crate::drivers::{Device, DeviceKind, DeviceProtocol};
use crate::error::{SysError, SysResult};
use crate::mm::{BackingRegion, MemoryOperation, UserOwnedAllocation, PAGE_SIZE};
use crate::sync::CompletionFlag;

use super::mmio::{MmioTransport, STANDARD_FEAT_REQUIRED, STANDARD_FEAT_SUPPORTED};
use super::queue::{Direction, TransferElement};
use super::virt_to_dma;

// Control queue command types.
const CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const CMD_SET_SCANOUT: u32 = 0x0103;
const CMD_RESOURCE_FLUSH: u32 = 0x0104;
const CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;

const RESP_OK_NODATA: u32 = 0x1100;
const RESP_OK_DISPLAY_INFO: u32 = 0x1101;

const FORMAT_B8G8R8X8_UNORM: u32 = 2;
const BYTES_PER_PIXEL: u32 = 4;

const RESOURCE_ID: u32 = 1;
const SCANOUT_ID: u32 = 0;

const MAX_SCANOUTS: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CtrlHeader {
    cmd_type: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    ring_idx: u8,
    padding: [u8; 3],
}

// SAFETY: repr(C) field-by-field plain integers.
unsafe impl Pod for CtrlHeader {}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct GpuRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

// SAFETY: plain integers.
unsafe impl Pod for GpuRect {}

#[repr(C)]
#[derive(Clone, Copy)]
struct ResourceCreate2d {
    header: CtrlHeader,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AttachBacking {
    header: CtrlHeader,
    resource_id: u32,
    nr_entries: u32,
    // Single backing entry follows inline.
    addr: u64,
    length: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SetScanout {
    header: CtrlHeader,
    rect: GpuRect,
    scanout_id: u32,
    resource_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct TransferToHost2d {
    header: CtrlHeader,
    rect: GpuRect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ResourceFlush {
    header: CtrlHeader,
    rect: GpuRect,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DisplayInfoResponse {
    header: CtrlHeader,
    pmodes: [DisplayMode; MAX_SCANOUTS],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct DisplayMode {
    rect: GpuRect,
    enabled: u32,
    flags: u32,
}

/// Info surfaced to userspace over `CommandDevice`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferInfo {
    pub width: u32,
    pub height: u32,
    pub byte_stride: u32,
    pub bytes_per_pixel: u32,
}

// SAFETY: plain integers.
unsafe impl Pod for FramebufferInfo {}

/// `CommandDevice` message ids of the framebuffer protocol.
pub const FB_MSG_GET_DISPLAY_INFO: u64 = 0;
pub const FB_MSG_MAP_FRAMEBUFFER: u64 = 1;
pub const FB_MSG_FLUSH_RECT: u64 = 2;

/// Rect argument of [`FB_MSG_FLUSH_RECT`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

// SAFETY: plain integers.
unsafe impl Pod for FlushRect {}

/// Returned by [`FB_MSG_MAP_FRAMEBUFFER`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MappedFramebuffer {
    pub address: u64,
    pub size: u64,
}

// SAFETY: plain integers.
unsafe impl Pod for MappedFramebuffer {}

pub struct FramebufferDevice {
    transport: Arc<MmioTransport>,
    info: FramebufferInfo,
    framebuffer: Arc<BackingRegion>,
    /// Serialises command submission; responses land in the request
    /// object each command owns.
    command_lock: Mutex<()>,
}

impl FramebufferDevice {
    /// Bring up the GPU scanout and register the device.
    pub fn create(transport: Arc<MmioTransport>) -> SysResult<()> {
        transport.configure_features(STANDARD_FEAT_REQUIRED, STANDARD_FEAT_SUPPORTED)?;
        transport.setup_vqueue(0)?;
        transport.finish_init();

        // Ask the host for the preferred mode of scanout 0.
        let response = submit_command(
            &transport,
            header_for(CMD_GET_DISPLAY_INFO),
            DisplayInfoResponse {
                header: CtrlHeader::default(),
                pmodes: [DisplayMode::default(); MAX_SCANOUTS],
            },
        )?;
        if response.header.cmd_type != RESP_OK_DISPLAY_INFO {
            return Err(SysError::IoError);
        }
        let mode = response.pmodes[SCANOUT_ID as usize];
        let (width, height) = if mode.enabled != 0 {
            (mode.rect.width, mode.rect.height)
        } else {
            (1024, 768)
        };

        let info = FramebufferInfo {
            width,
            height,
            byte_stride: width * BYTES_PER_PIXEL,
            bytes_per_pixel: BYTES_PER_PIXEL,
        };
        let fb_bytes = (info.byte_stride as usize * height as usize).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let allocation = UserOwnedAllocation::create_contiguous(fb_bytes / PAGE_SIZE)?;
        let fb_dma = allocation.physical_base().get();
        let framebuffer = Arc::new(BackingRegion::UserOwned(allocation));

        let device = Arc::new(Self {
            transport,
            info,
            framebuffer,
            command_lock: Mutex::new(()),
        });
        device.initialise_scanout(fb_dma, fb_bytes as u32)?;
        log::info!("virtio-fb: {}x{} scanout", info.width, info.height);
        crate::drivers::with_registry(|registry| registry.register_device(device));
        Ok(())
    }

    fn initialise_scanout(&self, fb_dma: u64, fb_size: u32) -> SysResult<()> {
        let rect = GpuRect {
            x: 0,
            y: 0,
            width: self.info.width,
            height: self.info.height,
        };
        self.command_expect_ok(ResourceCreate2d {
            header: header_for(CMD_RESOURCE_CREATE_2D),
            resource_id: RESOURCE_ID,
            format: FORMAT_B8G8R8X8_UNORM,
            width: self.info.width,
            height: self.info.height,
        })?;
        self.command_expect_ok(AttachBacking {
            header: header_for(CMD_RESOURCE_ATTACH_BACKING),
            resource_id: RESOURCE_ID,
            nr_entries: 1,
            addr: fb_dma,
            length: fb_size,
            padding: 0,
        })?;
        self.command_expect_ok(SetScanout {
            header: header_for(CMD_SET_SCANOUT),
            rect,
            scanout_id: SCANOUT_ID,
            resource_id: RESOURCE_ID,
        })
    }

    fn command_expect_ok<T: Copy + Send + 'static>(&self, request: T) -> SysResult<()> {
        let _guard = self.command_lock.lock();
        let response = submit_command(&self.transport, request, CtrlHeader::default())?;
        if response.cmd_type == RESP_OK_NODATA {
            Ok(())
        } else {
            log::warn!(
                "virtio-fb: command failed with response {:#x}",
                response.cmd_type
            );
            Err(SysError::IoError)
        }
    }

    /// Validate and flush `rect` to the host: transfer then flush.
    pub fn flush_rect(&self, rect: FlushRect) -> SysResult<()> {
        let info = self.info;
        if rect.width == 0
            || rect.height == 0
            || rect.x.checked_add(rect.width).is_none_or(|edge| edge > info.width)
            || rect.y.checked_add(rect.height).is_none_or(|edge| edge > info.height)
        {
            return Err(SysError::InvalidArgument);
        }
        let gpu_rect = GpuRect {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        };
        let offset =
            rect.y as u64 * info.byte_stride as u64 + rect.x as u64 * info.bytes_per_pixel as u64;
        self.command_expect_ok(TransferToHost2d {
            header: header_for(CMD_TRANSFER_TO_HOST_2D),
            rect: gpu_rect,
            offset,
            resource_id: RESOURCE_ID,
            padding: 0,
        })?;
        self.command_expect_ok(ResourceFlush {
            header: header_for(CMD_RESOURCE_FLUSH),
            rect: gpu_rect,
            resource_id: RESOURCE_ID,
            padding: 0,
        })
    }
}

fn header_for(cmd_type: u32) -> CtrlHeader {
    CtrlHeader {
        cmd_type,
        ..CtrlHeader::default()
    }
}

/// Submit one command and synchronously wait for the device to fill in
/// the response object.
fn submit_command<Req: Copy + Send + 'static, Resp: Copy + Send + 'static>(
    transport: &Arc<MmioTransport>,
    request: Req,
    response: Resp,
) -> SysResult<Resp> {
    let request = Box::new(request);
    let response = Box::new(response);
    let done = Arc::new(CompletionFlag::new());

    let elements = [
        TransferElement {
            direction: Direction::Out,
            phys_addr: virt_to_dma(&*request as *const Req as *const u8),
            length: core::mem::size_of::<Req>() as u32,
        },
        TransferElement {
            direction: Direction::In,
            phys_addr: virt_to_dma(&*response as *const Resp as *const u8),
            length: core::mem::size_of::<Resp>() as u32,
        },
    ];

    let slot: Arc<Mutex<Option<Box<Resp>>>> = Arc::new(Mutex::new(None));
    let callback = {
        let done = done.clone();
        let slot = slot.clone();
        Box::new(move |_written: u32| {
            drop(request);
            *slot.lock() = Some(response);
            done.set();
        })
    };
    if let Err((error, _callback)) = transport.queue_transfer(0, &elements, callback) {
        return Err(error);
    }
    done.wait();
    let response = slot.lock().take().ok_or(SysError::Failed)?;
    Ok(*response)
}

impl Device for FramebufferDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Framebuffer
    }

    fn userspace_protocol(&self) -> Option<DeviceProtocol> {
        Some(DeviceProtocol::FramebufferProvider)
    }

    fn preferred_name_prefix(&self) -> &'static str {
        "virtio.fb"
    }

    fn on_userspace_message(
        &self,
        id: u64,
        message: &mut dyn TransactionalBuffer,
    ) -> SysResult<i64> {
        match id {
            FB_MSG_GET_DISPLAY_INFO => {
                buffer::write_object(message, &self.info, 0)?;
                Ok(0)
            }
            FB_MSG_MAP_FRAMEBUFFER => {
                let region = crate::process::with_current_space_manager(|sm| {
                    sm.place_region(
                        None,
                        MemoryOperation::READ | MemoryOperation::WRITE,
                        alloc::string::String::from("framebuffer"),
                        self.framebuffer.clone(),
                    )
                })
                .ok_or(SysError::Failed)??;
                buffer::write_object(
                    message,
                    &MappedFramebuffer {
                        address: region.start.get() as u64,
                        size: region.size as u64,
                    },
                    0,
                )?;
                Ok(0)
            }
            FB_MSG_FLUSH_RECT => {
                let rect: FlushRect = buffer::read_object(message, 0)?;
                self.flush_rect(rect)?;
                Ok(0)
            }
            _ => Err(SysError::NotSupported),
        }
    }
}
