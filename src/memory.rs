//! Transit of bytes and pointers across the host/guest memory boundary.
//!
//! The guest is a 32-bit WebAssembly memory: every pointer fits in a
//! `u32` and all arithmetic is in bytes. Allocation goes through the
//! guest's canonical ABI reallocator so the engine's own allocator stays
//! authoritative.

use crate::error::{Error, Result};
use crate::machine::{Ctx, Raw};

/// Size of a guest pointer cell in bytes.
pub(crate) const PTR_SIZE: u32 = 4;

/// Alignment passed to the guest allocator for byte buffers.
const ALIGN: i32 = 1;

/// Allocate `size` bytes in guest memory.
pub(crate) fn alloc(raw: &Raw, ctx: &mut Ctx<'_>, size: u32) -> Result<u32> {
    let ptr = raw
        .realloc
        .call(&mut *ctx, (0, 0, ALIGN, size as i32))
        .map_err(Error::guest)?;
    if ptr == 0 {
        return Err(Error::Resource {
            message: format!("failed to allocate {size} bytes of guest memory (out of memory?)"),
        });
    }
    Ok(ptr as u32)
}

/// Free a guest allocation made through [`alloc`] or [`write_cstring`].
pub(crate) fn free(raw: &Raw, ctx: &mut Ctx<'_>, ptr: u32, size: u32) -> Result<()> {
    raw.free
        .call(&mut *ctx, (ptr as i32, size as i32, ALIGN))
        .map_err(Error::guest)
}

/// A NUL-terminated string owned by the guest allocator.
///
/// `size` includes the terminator. The creator is responsible for
/// freeing it, except for host-call replies, whose ownership passes to
/// the engine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GuestString {
    pub ptr: u32,
    pub size: u32,
}

impl GuestString {
    pub fn free(self, raw: &Raw, ctx: &mut Ctx<'_>) -> Result<()> {
        free(raw, ctx, self.ptr, self.size)
    }
}

/// Copy `text` into guest memory with a trailing NUL.
pub(crate) fn write_cstring(raw: &Raw, ctx: &mut Ctx<'_>, text: &str) -> Result<GuestString> {
    let bytes = text.as_bytes();
    let size = bytes.len() as u32 + 1;
    let ptr = alloc(raw, ctx, size)?;
    let data = raw.memory.data_mut(&mut *ctx);
    let start = ptr as usize;
    data[start..start + bytes.len()].copy_from_slice(bytes);
    data[start + bytes.len()] = 0;
    Ok(GuestString { ptr, size })
}

/// Read `len` bytes starting at `ptr`. The empty range `(0, 0)` is legal
/// and yields an empty buffer.
pub(crate) fn read_range(raw: &Raw, ctx: &Ctx<'_>, ptr: u32, len: u32) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let data = raw.memory.data(ctx);
    let start = ptr as usize;
    let end = start + len as usize;
    if end > data.len() {
        return Err(Error::Resource {
            message: format!(
                "guest read out of bounds: {ptr}+{len} exceeds memory size {}",
                data.len()
            ),
        });
    }
    Ok(data[start..end].to_vec())
}

/// Read a little-endian `u32` cell.
pub(crate) fn read_u32(raw: &Raw, ctx: &Ctx<'_>, ptr: u32) -> Result<u32> {
    let bytes = read_range(raw, ctx, ptr, PTR_SIZE)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Write a little-endian `u32` cell.
pub(crate) fn write_u32(raw: &Raw, ctx: &mut Ctx<'_>, ptr: u32, value: u32) -> Result<()> {
    let data = raw.memory.data_mut(&mut *ctx);
    let start = ptr as usize;
    let end = start + PTR_SIZE as usize;
    if end > data.len() {
        return Err(Error::Resource {
            message: format!("guest write out of bounds: {ptr} exceeds memory size {}", data.len()),
        });
    }
    data[start..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}
